use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::Notify, time::sleep};
use walkdir::WalkDir;

use crate::config::Config;
use crate::control::{ControlPlane, ControlSocket};
use crate::events::LocalEvent;
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::snapshot::{read_entry, rel_key};
use crate::sync::{send_action, sync_once, with_engine, SharedEngine};
use crate::telemetry::SyncStats;

const WATCH_CHANNEL_CAPACITY: usize = 256;
const WATCH_DEBOUNCE: Duration = Duration::from_millis(50);

pub struct Client {
    cfg: Config,
    api: ApiClient,
    engine: SharedEngine,
    filters: Arc<SyncFilters>,
    stats: Arc<SyncStats>,
    control: ControlPlane,
}

impl Client {
    pub fn new(
        cfg: Config,
        api: ApiClient,
        engine: SharedEngine,
        filters: Arc<SyncFilters>,
        stats: Arc<SyncStats>,
        control: ControlPlane,
    ) -> Self {
        Self {
            cfg,
            api,
            engine,
            filters,
            stats,
            control,
        }
    }

    /// Run the sync loop, the watcher and the command socket until
    /// `shutdown` fires or one of them fails.
    pub async fn start_with_shutdown(
        &self,
        socket: ControlSocket,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let root = self.cfg.sync_dir.clone();
        let interval = self.cfg.sync_interval();

        tokio::select! {
            res = run_sync_loop(
                self.api.clone(),
                self.engine.clone(),
                self.stats.clone(),
                self.control.clone(),
                interval,
            ) => {
                if let Err(err) = res {
                    crate::logging::error(format!("sync loop crashed: {err:#}"));
                    return Err(err);
                }
            }
            res = watch_local_changes(
                root,
                self.api.clone(),
                self.engine.clone(),
                self.filters.clone(),
                self.stats.clone(),
            ) => {
                if let Err(err) = res {
                    crate::logging::error(format!("watcher crashed: {err:#}"));
                    return Err(err);
                }
            }
            res = self.control.serve(socket) => {
                if let Err(err) = res {
                    crate::logging::error(format!("command socket crashed: {err:#}"));
                    return Err(err);
                }
            }
            _ = shutdown.notified() => {
                crate::logging::info("shutdown requested");
            }
        }

        Ok(())
    }
}

async fn run_sync_loop(
    api: ApiClient,
    engine: SharedEngine,
    stats: Arc<SyncStats>,
    control: ControlPlane,
    interval: Duration,
) -> Result<()> {
    loop {
        match sync_once(&api, &engine, &stats).await {
            Ok(report) => {
                if report.applied + report.completed + report.failed + report.conflicts > 0 {
                    crate::logging::info_kv(
                        "sync tick",
                        &[
                            ("server_ts", &report.server_timestamp.to_string()),
                            ("applied", &report.applied.to_string()),
                            ("completed", &report.completed.to_string()),
                            ("failed", &report.failed.to_string()),
                            ("conflicts", &report.conflicts.to_string()),
                        ],
                    );
                }
            }
            Err(err) => {
                crate::logging::warn_kv("sync tick failed", &[("error", &format!("{err:#}"))]);
                stats.on_failure(format!("sync tick: {err:#}"));
            }
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = control.wait_sync_now() => {}
        }
    }
}

/// Raw change collected during a debounce window; resolved against the disk
/// once the window closes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Touched(PathBuf),
    Removed(PathBuf),
    Renamed(PathBuf, PathBuf),
}

async fn watch_local_changes(
    root: PathBuf,
    api: ApiClient,
    engine: SharedEngine,
    filters: Arc<SyncFilters>,
    stats: Arc<SyncStats>,
) -> Result<()> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.blocking_send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    let mut pending: Vec<Change> = Vec::new();

    while let Some(res) = event_rx.recv().await {
        ingest_event(&mut pending, res);

        let timer = tokio::time::sleep(WATCH_DEBOUNCE);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                next = event_rx.recv() => {
                    match next {
                        None => break,
                        Some(res) => ingest_event(&mut pending, res),
                    }
                }
            }
        }

        if pending.is_empty() {
            continue;
        }
        let changes = std::mem::take(&mut pending);
        let resolve_root = root.clone();
        let resolve_filters = filters.clone();
        let events = tokio::task::spawn_blocking(move || {
            resolve_changes(&resolve_root, &resolve_filters, changes)
        })
        .await?;

        for event in events {
            if let Err(err) = push_local_event(&api, &engine, &root, &stats, event).await {
                crate::logging::warn(format!("local event dropped: {err:#}"));
            }
        }
    }

    Ok(())
}

fn ingest_event(pending: &mut Vec<Change>, res: notify::Result<notify::Event>) {
    let event = match res {
        Ok(ev) => ev,
        Err(err) => {
            crate::logging::warn(format!("notify error: {err}"));
            return;
        }
    };

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = event.paths[0].clone();
            let to = event.paths[1].clone();
            // inotify reports both halves before the paired event.
            pending.retain(|c| {
                *c != Change::Removed(from.clone()) && *c != Change::Touched(to.clone())
            });
            push_change(pending, Change::Renamed(from, to));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in event.paths {
                push_change(pending, Change::Removed(path));
            }
        }
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => {
            for path in event.paths {
                push_change(pending, Change::Touched(path));
            }
        }
        _ => {}
    }
}

fn push_change(pending: &mut Vec<Change>, change: Change) {
    if !pending.contains(&change) {
        pending.push(change);
    }
}

/// Turn collected changes into events using what is on disk now. Hashing
/// happens here, outside the engine lock.
fn resolve_changes(root: &Path, filters: &SyncFilters, changes: Vec<Change>) -> Vec<LocalEvent> {
    let mut out = Vec::new();
    for change in changes {
        match change {
            Change::Touched(path) | Change::Removed(path) => {
                resolve_path(root, filters, &path, &mut out)
            }
            Change::Renamed(from, to) => resolve_rename(root, filters, &from, &to, &mut out),
        }
    }
    out
}

fn resolve_path(root: &Path, filters: &SyncFilters, path: &Path, out: &mut Vec<LocalEvent>) {
    let Some(rel) = rel_key(root, path) else {
        return;
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if !filters.should_skip_abs(path, true) {
                written_below(root, filters, path, out);
            }
        }
        Ok(_) => {
            if !filters.should_skip_abs(path, false) {
                push_written(rel, path, out);
            }
        }
        // Gone; the classifier ignores paths it never tracked.
        Err(_) => out.push(LocalEvent::Removed { path: rel }),
    }
}

fn resolve_rename(
    root: &Path,
    filters: &SyncFilters,
    from: &Path,
    to: &Path,
    out: &mut Vec<LocalEvent>,
) {
    let (Some(rel_from), Some(rel_to)) = (rel_key(root, from), rel_key(root, to)) else {
        // Crossed the root boundary; treat each side on its own.
        resolve_path(root, filters, from, out);
        resolve_path(root, filters, to, out);
        return;
    };
    let Ok(meta) = std::fs::metadata(to) else {
        out.push(LocalEvent::Removed { path: rel_from });
        resolve_path(root, filters, to, out);
        return;
    };
    let is_dir = meta.is_dir();
    if filters.should_skip_abs(to, is_dir) {
        out.push(LocalEvent::Removed { path: rel_from });
        return;
    }
    if is_dir {
        out.push(LocalEvent::Renamed {
            from: rel_from,
            to: rel_to,
            entry: None,
        });
        // Files that arrived with the directory but were never tracked.
        written_below(root, filters, to, out);
        return;
    }
    if filters.should_skip_abs(from, false) {
        push_written(rel_to, to, out);
        return;
    }
    match read_entry(to) {
        Ok(entry) => out.push(LocalEvent::Renamed {
            from: rel_from,
            to: rel_to,
            entry: Some(entry),
        }),
        Err(err) => crate::logging::warn_kv(
            "renamed file unreadable",
            &[("path", &rel_to), ("error", &format!("{err:#}"))],
        ),
    }
}

fn written_below(root: &Path, filters: &SyncFilters, dir: &Path, out: &mut Vec<LocalEvent>) {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !filters.should_skip_abs(e.path(), e.file_type().is_dir()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());
    for entry in walker {
        if let Some(rel) = rel_key(root, entry.path()) {
            push_written(rel, entry.path(), out);
        }
    }
}

fn push_written(rel: String, path: &Path, out: &mut Vec<LocalEvent>) {
    match read_entry(path) {
        Ok(entry) => out.push(LocalEvent::Written { path: rel, entry }),
        Err(err) => crate::logging::warn_kv(
            "changed file unreadable",
            &[("path", &rel), ("error", &format!("{err:#}"))],
        ),
    }
}

/// Classify one event and send the resulting commands right away. Failures
/// are left for the next sync tick to pick up.
async fn push_local_event(
    api: &ApiClient,
    engine: &SharedEngine,
    root: &Path,
    stats: &SyncStats,
    event: LocalEvent,
) -> Result<()> {
    let actions = with_engine(engine, move |e| Ok(e.classify(event))).await?;
    for action in actions {
        match send_action(api, root, &action).await {
            Ok(ack) => {
                crate::logging::info_kv(
                    "pushed local change",
                    &[
                        ("action", &action.to_string()),
                        ("ts", &ack.timestamp.to_string()),
                    ],
                );
                stats.on_action(&action);
                with_engine(engine, move |e| {
                    e.acknowledge(&action, ack.timestamp);
                    Ok(())
                })
                .await?;
            }
            Err(err) => {
                crate::logging::warn_kv(
                    "push local change failed",
                    &[("action", &action.to_string()), ("error", &format!("{err:#}"))],
                );
                stats.on_failure(format!("{action}: {err:#}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::bytes_md5;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::fs;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn event(kind: EventKind, paths: &[&str]) -> notify::Result<notify::Event> {
        let mut ev = notify::Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        Ok(ev)
    }

    #[test]
    fn ingest_skips_metadata_and_collapses_rename_halves() {
        let mut pending = Vec::new();
        ingest_event(
            &mut pending,
            event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)), &["/r/a"]),
        );
        assert!(pending.is_empty());

        ingest_event(
            &mut pending,
            event(EventKind::Create(CreateKind::File), &["/r/new"]),
        );
        ingest_event(
            &mut pending,
            event(EventKind::Modify(ModifyKind::Data(DataChange::Any)), &["/r/new"]),
        );
        ingest_event(
            &mut pending,
            event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/a"]),
        );
        ingest_event(
            &mut pending,
            event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/b"]),
        );
        ingest_event(
            &mut pending,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/r/a", "/r/b"],
            ),
        );
        ingest_event(
            &mut pending,
            event(EventKind::Remove(RemoveKind::File), &["/r/gone"]),
        );

        assert_eq!(
            pending,
            [
                Change::Touched("/r/new".into()),
                Change::Renamed("/r/a".into(), "/r/b".into()),
                Change::Removed("/r/gone".into()),
            ]
        );
    }

    #[test]
    fn resolve_uses_current_disk_state() {
        let root = make_temp_dir("treesync-client-resolve");
        fs::write(root.join("kept.txt"), b"kept").unwrap();
        fs::write(root.join("scratch~"), b"tmp").unwrap();
        let filters = SyncFilters::load(&root).unwrap();

        let events = resolve_changes(
            &root,
            &filters,
            vec![
                Change::Removed(root.join("kept.txt")),
                Change::Touched(root.join("scratch~")),
                Change::Touched(root.join("vanished.txt")),
            ],
        );
        assert_eq!(events.len(), 2);
        match &events[0] {
            LocalEvent::Written { path, entry } => {
                assert_eq!(path, "kept.txt");
                assert_eq!(entry.md5, bytes_md5(b"kept"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[1],
            LocalEvent::Removed {
                path: "vanished.txt".into()
            }
        );
    }

    #[test]
    fn resolve_rename_of_file_and_directory() {
        let root = make_temp_dir("treesync-client-rename");
        fs::write(root.join("b.txt"), b"bee").unwrap();
        fs::create_dir_all(root.join("archive").join("docs")).unwrap();
        fs::write(root.join("archive").join("docs").join("x"), b"x").unwrap();
        let filters = SyncFilters::load(&root).unwrap();

        let events = resolve_changes(
            &root,
            &filters,
            vec![
                Change::Renamed(root.join("a.txt"), root.join("b.txt")),
                Change::Renamed(root.join("docs"), root.join("archive").join("docs")),
            ],
        );
        assert!(matches!(
            &events[0],
            LocalEvent::Renamed { from, to, entry: Some(_) } if from == "a.txt" && to == "b.txt"
        ));
        assert_eq!(
            events[1],
            LocalEvent::Renamed {
                from: "docs".into(),
                to: "archive/docs".into(),
                entry: None,
            }
        );
        assert!(matches!(
            &events[2],
            LocalEvent::Written { path, .. } if path == "archive/docs/x"
        ));
    }

    #[test]
    fn rename_from_ignored_temp_is_a_write() {
        let root = make_temp_dir("treesync-client-atomic-save");
        fs::write(root.join("final.txt"), b"saved").unwrap();
        let filters = SyncFilters::load(&root).unwrap();

        let events = resolve_changes(
            &root,
            &filters,
            vec![Change::Renamed(
                root.join(".final.txt.tmp-1234"),
                root.join("final.txt"),
            )],
        );
        assert!(matches!(
            &events[..],
            [LocalEvent::Written { path, .. }] if path == "final.txt"
        ));
    }
}
