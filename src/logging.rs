// Records emitted before `init_log_file` are dropped.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

/// Open the log for this run. The previous run's log is kept beside it with
/// a `.prev` suffix. Later calls are no-ops.
pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let _ = LOGGER.set(Logger::open(path, true)?);
    Ok(())
}

pub fn info(msg: impl AsRef<str>) {
    emit(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    emit(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit(Level::Error, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Info, msg, kv);
}

pub fn warn_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Warn, msg, kv);
}

fn emit(level: Level, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.record(level, msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    mirror_to_stdout: bool,
}

impl Logger {
    fn open(path: &Path, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        if path.exists() {
            let prev = previous_log_path(path);
            std::fs::rename(path, &prev)
                .with_context(|| format!("rotate {} -> {}", path.display(), prev.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            mirror_to_stdout,
        })
    }

    fn record(&self, level: Level, msg: &str, kv: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(file_line(&ts, level, msg, kv).as_bytes());
            let _ = file.flush();
        }
        if self.mirror_to_stdout {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(console_line(&ts, level, msg, kv).as_bytes());
            let _ = out.flush();
        }
    }
}

fn previous_log_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".prev");
    path.with_file_name(name)
}

fn file_line(ts: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = format!("time={ts} level={level} msg=\"{}\"", escape(msg));
    for (k, v) in kv {
        line.push_str(&format!(" {k}={}", quote(v)));
    }
    line.push('\n');
    line
}

fn console_line(ts: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = format!("{ts} {level:<5} {msg}");
    for (k, v) in kv {
        line.push_str(&format!(" {k}={v}"));
    }
    line.push('\n');
    line
}

fn quote(v: &str) -> String {
    if v.is_empty() || v.contains(|c: char| c.is_whitespace() || c == '"' || c == '=') {
        format!("\"{}\"", escape(v))
    } else {
        v.to_string()
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
