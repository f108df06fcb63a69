use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

pub const IGNORE_FILE_NAME: &str = ".syncignore";

/// Editor and transient artifacts are recognised by their last character.
const TEMP_SUFFIXES: &[char] = &['#', '~'];

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // treesync
    ".treesync/",
    "**/.*.tmp-*", // download temp files
    // editors
    "**/.*.swp",
    "**/.*.swx",
    "**/.#*",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
];

#[derive(Clone)]
pub struct SyncFilters {
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl SyncFilters {
    pub fn load(root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = root.join(IGNORE_FILE_NAME);
        if ignore_path.exists() {
            for line in read_ignore_file(&ignore_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add {IGNORE_FILE_NAME} line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: root.to_path_buf(),
            ignore,
        })
    }

    pub fn is_temp_name(name: &str) -> bool {
        name.ends_with(TEMP_SUFFIXES)
    }

    pub fn should_skip_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        if !is_dir {
            let temp = rel_path
                .file_name()
                .map(|n| Self::is_temp_name(&n.to_string_lossy()))
                .unwrap_or(false);
            if temp {
                return true;
            }
        }
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }

    pub fn should_skip_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_skip_rel(rel, is_dir)
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
