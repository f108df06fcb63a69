use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::digest::file_md5;
use crate::filters::SyncFilters;

/// State of one file at the instant the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub md5: String,
}

/// Mapping from slash-separated path (relative to the sync root) to its entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    files: HashMap<String, FileEntry>,
}

impl Snapshot {
    /// Drop keys that would resolve outside the sync root, logging each one.
    pub fn without_unsafe_keys(&self) -> Cow<'_, Snapshot> {
        if self.files.keys().all(|k| is_safe_key(k)) {
            return Cow::Borrowed(self);
        }
        let kept: Snapshot = self
            .files
            .iter()
            .filter(|(k, _)| {
                let safe = is_safe_key(k);
                if !safe {
                    crate::logging::warn_kv("ignoring unsafe path", &[("path", k.as_str())]);
                }
                safe
            })
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        Cow::Owned(kept)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) -> Option<FileEntry> {
        self.files.insert(path.into(), entry)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries in ascending path order.
    pub fn sorted(&self) -> Vec<(&str, &FileEntry)> {
        let mut out: Vec<_> = self.iter().collect();
        out.sort_unstable_by(|a, b| a.0.cmp(b.0));
        out
    }

    /// Paths equal to `dir` or nested below it, in ascending order.
    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut out: Vec<String> = self
            .files
            .keys()
            .filter(|k| k.as_str() == dir || k.starts_with(&prefix))
            .cloned()
            .collect();
        out.sort_unstable();
        out
    }
}

impl FromIterator<(String, FileEntry)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, FileEntry)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Walks a sync root and hashes every file that survives the filters.
pub struct SnapshotBuilder<'a> {
    root: &'a Path,
    filters: Option<&'a SyncFilters>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: &'a SyncFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Fails only if the root itself is missing; unreadable files are skipped
    /// with a warning and picked up again by a later build.
    pub fn build(&self) -> Result<Snapshot> {
        if !self.root.is_dir() {
            anyhow::bail!("sync root {} is not a directory", self.root.display());
        }

        let mut snapshot = Snapshot::default();
        let walker = WalkDir::new(self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !self.skip(e.path(), e.file_type().is_dir()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    crate::logging::warn(format!("snapshot walk error: {err}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = rel_key(self.root, entry.path()) else {
                continue;
            };
            match read_entry(entry.path()) {
                Ok(file) => {
                    snapshot.insert(key, file);
                }
                Err(err) => {
                    crate::logging::warn_kv(
                        "snapshot skipped file",
                        &[("path", &key), ("error", &format!("{err:#}"))],
                    );
                }
            }
        }
        Ok(snapshot)
    }

    fn skip(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(rel) = path.strip_prefix(self.root) else {
            return false;
        };
        match self.filters {
            Some(filters) => filters.should_skip_rel(rel, is_dir),
            None => {
                !is_dir
                    && rel
                        .file_name()
                        .map(|n| SyncFilters::is_temp_name(&n.to_string_lossy()))
                        .unwrap_or(false)
            }
        }
    }
}

/// Hash and timestamp a single file.
pub fn read_entry(path: &Path) -> Result<FileEntry> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    let modified = meta
        .modified()
        .with_context(|| format!("mtime {}", path.display()))?;
    Ok(FileEntry {
        timestamp: to_millis(modified),
        md5: file_md5(path)?,
    })
}

/// Set a file's mtime so a later build reports `timestamp` for it.
pub fn stamp_file(path: &Path, timestamp: i64) -> Result<()> {
    let file = fs::File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.set_modified(from_millis(timestamp))
        .with_context(|| format!("set mtime {}", path.display()))
}

/// A relative slash path of plain components: no empty, `.` or `..`
/// segments, no leading slash, no backslashes or NULs.
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains(|c: char| c == '\\' || c == '\0')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Slash-separated key of `path` relative to `root`; `None` outside the root.
pub fn rel_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

pub fn from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
