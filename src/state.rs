use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Checkpoint of the last reconciliation the daemon completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_timestamp: i64,
    pub global_md5: String,
}

/// Persists [`SyncState`] as JSON, replacing the file atomically on save.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    path: PathBuf,
}

impl SyncStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` on first run. A corrupt or unreadable file is reported and
    /// treated the same way.
    pub fn load(&self) -> Option<SyncState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                crate::logging::warn_kv(
                    "sync state unreadable, starting fresh",
                    &[
                        ("path", &self.path.display().to_string()),
                        ("error", &err.to_string()),
                    ],
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                crate::logging::warn_kv(
                    "sync state corrupt, starting fresh",
                    &[
                        ("path", &self.path.display().to_string()),
                        ("error", &err.to_string()),
                    ],
                );
                None
            }
        }
    }

    pub fn save(&self, state: &SyncState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let raw = serde_json::to_vec_pretty(state).context("encode sync state")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file =
                fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&raw)
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn missing_state_loads_as_none() {
        let dir = make_temp_dir("treesync-state-missing");
        let store = SyncStateStore::new(dir.join("sync_state.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_uses_documented_keys() {
        let dir = make_temp_dir("treesync-state-save");
        let store = SyncStateStore::new(dir.join("nested").join("sync_state.json"));
        let state = SyncState {
            last_timestamp: 1_700_000_000_000,
            global_md5: "0cc175b9c0f1b6a831c399e269772661".into(),
        };
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["last_timestamp"], 1_700_000_000_000_i64);
        assert_eq!(raw["global_md5"], "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(store.load(), Some(state));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_state_loads_as_none() {
        let dir = make_temp_dir("treesync-state-corrupt");
        let path = dir.join("sync_state.json");
        fs::write(&path, b"{\"last_timestamp\": \"nope\"").unwrap();
        assert!(SyncStateStore::new(path).load().is_none());
    }

    #[test]
    fn save_overwrites_previous_state() {
        let dir = make_temp_dir("treesync-state-overwrite");
        let store = SyncStateStore::new(dir.join("sync_state.json"));
        store
            .save(&SyncState {
                last_timestamp: 1,
                global_md5: "a".into(),
            })
            .unwrap();
        store
            .save(&SyncState {
                last_timestamp: 2,
                global_md5: "b".into(),
            })
            .unwrap();
        assert_eq!(store.load().unwrap().last_timestamp, 2);
    }
}
