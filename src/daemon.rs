use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::client::Client;
use crate::config::Config;
use crate::control::{ControlPlane, ControlSocket};
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::state::SyncStateStore;
use crate::sync::SyncEngine;
use crate::telemetry::{HttpStats, SyncStats};
use crate::workspace::{ensure_layout, DaemonLock};

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

/// Run the daemon on the current tokio runtime until `shutdown` is notified.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<()> {
    // A refused second instance must not truncate the running daemon's log.
    ensure_layout(&cfg)?;
    let lock = DaemonLock::try_lock(&cfg.meta_dir())?;

    let log_path = opts.log_path.unwrap_or_else(|| cfg.log_file());
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info_kv(
        "daemon start",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            (
                "config",
                &cfg.config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("sync_dir", &cfg.sync_dir.display().to_string()),
            ("server", &cfg.server_url),
            ("log", &log_path.display().to_string()),
        ],
    );

    let filters = Arc::new(SyncFilters::load(&cfg.sync_dir)?);
    let store = SyncStateStore::new(cfg.state_file());
    let sync_dir = cfg.sync_dir.clone();
    let engine_filters = filters.clone();
    let engine = tokio::task::spawn_blocking(move || {
        SyncEngine::open(&sync_dir, engine_filters, store)
    })
    .await
    .context("open sync engine")??;
    crate::logging::info_kv(
        "sync engine ready",
        &[
            ("tracked_files", &engine.snapshot().len().to_string()),
            ("last_ts", &engine.state().last_timestamp.to_string()),
            ("state", &cfg.state_file().display().to_string()),
        ],
    );
    let engine = engine.shared();

    let http_stats = Arc::new(HttpStats::default());
    let api = ApiClient::new(
        &cfg.server_url,
        cfg.access_token.as_deref(),
        cfg.http_timeout(),
        http_stats.clone(),
    )?;

    let stats = Arc::new(SyncStats::default());
    let socket = ControlSocket::bind(&cfg.socket_file())?;
    let control = ControlPlane::new(
        engine.clone(),
        stats.clone(),
        http_stats,
        cfg.socket_timeout(),
        Some(shutdown.clone()),
    );

    let client = Client::new(cfg, api, engine, filters, stats, control);
    let res = client.start_with_shutdown(socket, shutdown).await;
    crate::logging::info_kv(
        "daemon stopped",
        &[("lock", &lock.path().display().to_string())],
    );
    drop(lock);
    res
}
