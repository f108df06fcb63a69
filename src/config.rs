use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

const META_DIR_NAME: &str = ".treesync";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub sync_dir: PathBuf,
    pub server_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_sync_interval_secs() -> u64 {
    5
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_socket_timeout_secs() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        if self.sync_dir.is_relative() {
            if let Ok(abs) = std::fs::canonicalize(&self.sync_dir) {
                self.sync_dir = abs;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        if self.sync_interval_secs == 0 {
            anyhow::bail!("sync_interval_secs must be positive");
        }
        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be positive");
        }
        if self.socket_timeout_secs == 0 {
            anyhow::bail!("socket_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Directory holding daemon-owned files: next to the config file, or a
    /// hidden directory inside the sync root when loaded without one.
    pub fn meta_dir(&self) -> PathBuf {
        if let Some(dir) = self.config_path.as_ref().and_then(|p| p.parent()) {
            return dir.to_path_buf();
        }
        self.sync_dir.join(META_DIR_NAME)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.meta_dir().join("sync_state.json"))
    }

    pub fn socket_file(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.meta_dir().join("treesync.sock"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.meta_dir().join("logs").join("treesync.log")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}
