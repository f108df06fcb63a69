use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::digest::global_digest;
use crate::snapshot::{is_safe_key, stamp_file, FileEntry, Snapshot};
use crate::state::SyncState;

/// Applies renames and duplicates locally, keeping the snapshot and the
/// checkpoint consistent with the result. Without a root it only edits the
/// in-memory snapshot.
pub struct LocalMutator<'a> {
    root: Option<&'a Path>,
    snapshot: &'a mut Snapshot,
    state: &'a mut SyncState,
}

impl<'a> LocalMutator<'a> {
    pub fn new(snapshot: &'a mut Snapshot, state: &'a mut SyncState) -> Self {
        Self {
            root: None,
            snapshot,
            state,
        }
    }

    pub fn on_disk(mut self, root: &'a Path) -> Self {
        self.root = Some(root);
        self
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    pub fn state(&self) -> &SyncState {
        self.state
    }

    /// Rename `src` to `dst`. Returns `false`, touching nothing, when `src`
    /// is unknown or the filesystem refuses.
    pub fn move_path(&mut self, src: &str, dst: &str, at: i64) -> bool {
        self.apply(src, dst, at, false)
    }

    /// Duplicate `src` under `dst`; same failure rules as [`Self::move_path`].
    pub fn copy_path(&mut self, src: &str, dst: &str, at: i64) -> bool {
        self.apply(src, dst, at, true)
    }

    /// Record a checkpoint at `last_timestamp` for the current snapshot.
    pub fn checkpoint(&mut self, last_timestamp: i64) {
        self.state.last_timestamp = last_timestamp;
        self.state.global_md5 = global_digest(self.snapshot);
    }

    /// Put back a previous checkpoint, keeping the snapshot as it is.
    pub(crate) fn restore(&mut self, checkpoint: SyncState) {
        *self.state = checkpoint;
    }

    fn apply(&mut self, src: &str, dst: &str, at: i64, keep_source: bool) -> bool {
        if src == dst || !is_safe_key(dst) {
            return false;
        }
        let Some(entry) = self.snapshot.get(src).cloned() else {
            crate::logging::warn_kv(
                "local mutation source missing",
                &[("src", src), ("dst", dst)],
            );
            return false;
        };

        if let Some(root) = self.root {
            let from = root.join(src);
            let to = root.join(dst);
            if let Err(err) = transfer(&from, &to, keep_source) {
                crate::logging::warn_kv(
                    "local mutation failed",
                    &[("src", src), ("dst", dst), ("error", &format!("{err:#}"))],
                );
                return false;
            }
            if let Err(err) = stamp_file(&to, at) {
                crate::logging::warn_kv(
                    "local mutation left stale mtime",
                    &[("dst", dst), ("error", &format!("{err:#}"))],
                );
            }
        }

        if !keep_source {
            self.snapshot.remove(src);
        }
        self.snapshot.insert(
            dst,
            FileEntry {
                timestamp: at,
                md5: entry.md5,
            },
        );
        self.checkpoint(at);
        true
    }
}

fn transfer(from: &Path, to: &Path, keep_source: bool) -> Result<()> {
    if !from.is_file() {
        anyhow::bail!("{} is not on disk", from.display());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if keep_source {
        fs::copy(from, to)
            .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
    } else {
        fs::rename(from, to)
            .with_context(|| format!("move {} -> {}", from.display(), to.display()))?;
    }
    Ok(())
}
