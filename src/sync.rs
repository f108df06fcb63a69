use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};

use crate::digest::{file_md5, global_digest};
use crate::events::{EventClassifier, LocalEvent};
use crate::filters::SyncFilters;
use crate::http::{Ack, ApiClient, ServerState};
use crate::mutator::LocalMutator;
use crate::reconcile::{reconcile, Reconciliation, SyncAction};
use crate::snapshot::{is_safe_key, stamp_file, FileEntry, Snapshot, SnapshotBuilder};
use crate::state::{SyncState, SyncStateStore};
use crate::telemetry::SyncStats;

pub type SharedEngine = Arc<Mutex<SyncEngine>>;

/// Owns the local snapshot and the checkpoint. Every change to either goes
/// through here, under the engine lock.
pub struct SyncEngine {
    root: PathBuf,
    filters: Arc<SyncFilters>,
    store: SyncStateStore,
    snapshot: Snapshot,
    state: SyncState,
}

impl SyncEngine {
    /// Load the checkpoint (fresh start when missing) and scan the tree.
    pub fn open(root: &Path, filters: Arc<SyncFilters>, store: SyncStateStore) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create sync dir {}", root.display()))?;
        let state = store.load().unwrap_or_default();
        let mut engine = Self {
            root: root.to_path_buf(),
            filters,
            store,
            snapshot: Snapshot::default(),
            state,
        };
        engine.rebuild()?;
        Ok(engine)
    }

    pub fn shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn rebuild(&mut self) -> Result<()> {
        self.snapshot = SnapshotBuilder::new(&self.root)
            .with_filters(&self.filters)
            .build()?;
        Ok(())
    }

    pub fn reconcile(&mut self, server: &ServerState) -> Reconciliation {
        let mutator = LocalMutator::new(&mut self.snapshot, &mut self.state).on_disk(&self.root);
        let out = reconcile(server.timestamp, &server.snapshot, mutator);
        self.persist();
        out
    }

    pub fn classify(&mut self, event: LocalEvent) -> Vec<SyncAction> {
        EventClassifier::new(&mut self.snapshot).classify(event)
    }

    /// Record a server acknowledgement and carry its timestamp onto the file.
    pub fn acknowledge(&mut self, action: &SyncAction, timestamp: i64) {
        if EventClassifier::new(&mut self.snapshot).acknowledge(action, timestamp) {
            self.stamp_on_disk(action.path(), timestamp);
        }
    }

    /// Move a finished download into place and track it.
    pub fn commit_download(&mut self, path: &str, tmp: &Path, entry: FileEntry) -> Result<()> {
        if !is_safe_key(path) {
            anyhow::bail!("refusing download outside sync root: {path}");
        }
        let dest = self.root.join(path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::rename(tmp, &dest)
            .with_context(|| format!("move {} -> {}", tmp.display(), dest.display()))?;
        self.stamp_on_disk(path, entry.timestamp);
        self.snapshot.insert(path, entry);
        Ok(())
    }

    /// After a clean pass, record the current tree as synced up to
    /// `advance_to`; the timestamp never moves backwards. With `None` the
    /// previous checkpoint is kept so unfinished work is detected again.
    pub fn checkpoint(&mut self, advance_to: Option<i64>) -> Result<()> {
        if let Some(ts) = advance_to {
            self.state.global_md5 = global_digest(&self.snapshot);
            self.state.last_timestamp = self.state.last_timestamp.max(ts);
        }
        self.store.save(&self.state)
    }

    fn stamp_on_disk(&self, path: &str, timestamp: i64) {
        if let Err(err) = stamp_file(&self.root.join(path), timestamp) {
            crate::logging::warn_kv(
                "stamp mtime failed",
                &[("path", path), ("error", &format!("{err:#}"))],
            );
        }
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.state) {
            crate::logging::error(format!("save sync state failed: {err:#}"));
        }
    }
}

/// Run `f` against the engine on the blocking pool.
pub async fn with_engine<T, F>(engine: &SharedEngine, f: F) -> Result<T>
where
    F: FnOnce(&mut SyncEngine) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = engine.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    })
    .await
    .context("sync engine task")?
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub server_timestamp: i64,
    pub applied: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0
    }
}

/// One pass: fetch the server snapshot, reconcile, execute the planned
/// transfers without holding the engine lock, then checkpoint.
pub async fn sync_once(
    api: &ApiClient,
    engine: &SharedEngine,
    stats: &SyncStats,
) -> Result<TickReport> {
    let server = Arc::new(api.get_server_state().await?);

    let plan_server = server.clone();
    let (plan, root) = with_engine(engine, move |e| {
        e.rebuild()?;
        let plan = e.reconcile(&plan_server);
        Ok((plan, e.root().to_path_buf()))
    })
    .await?;

    let mut report = TickReport {
        server_timestamp: server.timestamp,
        applied: plan.applied.len(),
        conflicts: plan.conflicts.len(),
        ..Default::default()
    };
    for action in &plan.applied {
        crate::logging::info_kv("applied locally", &[("action", &action.to_string())]);
        stats.on_action(action);
    }
    if !plan.conflicts.is_empty() {
        stats.on_conflicts(plan.conflicts.len());
    }

    for action in plan.actions {
        match execute(api, engine, &root, &server, &action).await {
            Ok(()) => {
                stats.on_action(&action);
                report.completed += 1;
            }
            Err(err) => {
                crate::logging::warn_kv(
                    "sync action failed",
                    &[("action", &action.to_string()), ("error", &format!("{err:#}"))],
                );
                stats.on_failure(format!("{action}: {err:#}"));
                report.failed += 1;
            }
        }
    }

    let advance_to = report.is_clean().then_some(server.timestamp);
    with_engine(engine, move |e| e.checkpoint(advance_to)).await?;
    Ok(report)
}

async fn execute(
    api: &ApiClient,
    engine: &SharedEngine,
    root: &Path,
    server: &ServerState,
    action: &SyncAction,
) -> Result<()> {
    if let SyncAction::Download(path) = action {
        let timestamp = server
            .snapshot
            .get(path)
            .map(|e| e.timestamp)
            .with_context(|| format!("{path} missing from server snapshot"))?;
        let tmp = api.download_to_temp(path, &root.join(path)).await?;
        let hash_tmp = tmp.clone();
        let md5 = tokio::task::spawn_blocking(move || file_md5(&hash_tmp))
            .await
            .context("hash download")??;
        let path = path.clone();
        let commit_tmp = tmp.clone();
        let committed = with_engine(engine, move |e| {
            e.commit_download(&path, &commit_tmp, FileEntry { timestamp, md5 })
        })
        .await;
        if committed.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        return committed;
    }

    let ack = send_action(api, root, action).await?;
    let acked = action.clone();
    with_engine(engine, move |e| {
        e.acknowledge(&acked, ack.timestamp);
        Ok(())
    })
    .await
}

/// Issue the server call for any action other than a download.
pub async fn send_action(api: &ApiClient, root: &Path, action: &SyncAction) -> Result<Ack> {
    match action {
        SyncAction::Upload(path) => api.upload(path, &root.join(path)).await,
        SyncAction::Modify(path) => api.modify(path, &root.join(path)).await,
        SyncAction::Delete(path) => api.delete(path).await,
        SyncAction::Move { src, dst } => api.move_path(src, dst).await,
        SyncAction::Copy { src, dst } => api.copy_path(src, dst).await,
        SyncAction::Download(path) => anyhow::bail!("download {path} is not a server command"),
    }
}
