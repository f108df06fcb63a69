use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::Config;

const LOCK_FILE_NAME: &str = "treesync.lock";

/// Another daemon already owns the metadata directory.
#[derive(Debug)]
pub struct DaemonLockedError {
    pub path: PathBuf,
}

impl std::fmt::Display for DaemonLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another treesync daemon holds {}", self.path.display())
    }
}

impl std::error::Error for DaemonLockedError {}

/// Create the sync root and the metadata directory if missing.
pub fn ensure_layout(cfg: &Config) -> Result<()> {
    let sync_dir = &cfg.sync_dir;
    let meta_dir = cfg.meta_dir();
    fs::create_dir_all(sync_dir).with_context(|| format!("create {}", sync_dir.display()))?;
    fs::create_dir_all(&meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
    Ok(())
}

/// Exclusive advisory lock held for the daemon's lifetime.
#[derive(Debug)]
pub struct DaemonLock {
    file: fs::File,
    path: PathBuf,
}

impl DaemonLock {
    pub fn try_lock(meta_dir: &Path) -> Result<Self> {
        fs::create_dir_all(meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
        let lock_path = meta_dir.join(LOCK_FILE_NAME);
        let file = open_lock_file(&lock_path)?;
        lock_file(&file, &lock_path)?;
        Ok(Self {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(unix)]
fn lock_file(file: &fs::File, path: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    // SAFETY: the descriptor is owned by `file` and open for the call.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    // EWOULDBLOCK is 11 on Linux and 35 on macOS.
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(DaemonLockedError {
            path: path.to_path_buf(),
        }
        .into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_UN: i32 = 8;
    // SAFETY: as in `lock_file`.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(not(unix))]
fn lock_file(_file: &fs::File, _path: &Path) -> Result<()> {
    // open_lock_file() uses create_new so the lock is the file itself.
    Ok(())
}

#[cfg(not(unix))]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    match fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(DaemonLockedError {
            path: lock_path.to_path_buf(),
        }
        .into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
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
    fn ensure_layout_creates_sync_and_meta_dirs() {
        let tmp = make_temp_dir("treesync-workspace-layout");
        let cfg_path = tmp.join("conf").join("config.json");
        fs::create_dir_all(cfg_path.parent().unwrap()).unwrap();
        let json = format!(
            r#"{{"sync_dir": "{}", "server_url": "http://127.0.0.1:1"}}"#,
            tmp.join("Sync").display()
        );
        fs::write(&cfg_path, json).unwrap();
        let cfg = Config::load(&cfg_path).unwrap();

        ensure_layout(&cfg).unwrap();
        assert!(tmp.join("Sync").is_dir());
        assert!(tmp.join("conf").is_dir());
    }

    #[test]
    fn daemon_lock_is_exclusive_and_released_on_drop() {
        let tmp = make_temp_dir("treesync-workspace-lock");

        let lock1 = DaemonLock::try_lock(&tmp).unwrap();
        assert!(lock1.path().exists());
        let err = DaemonLock::try_lock(&tmp).unwrap_err();
        let found = err.chain().any(|cause| cause.is::<DaemonLockedError>());
        assert!(found, "expected DaemonLockedError, got: {err:#}");

        drop(lock1);
        let _lock2 = DaemonLock::try_lock(&tmp).unwrap();
    }
}
