//! Server arrivals whose content already exists locally are applied on the
//! spot as moves or copies and never reach the caller.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::digest::{global_digest, DigestIndex};
use crate::mutator::LocalMutator;
use crate::snapshot::{FileEntry, Snapshot};
use crate::state::SyncState;

pub const CONFLICT_SUFFIX: &str = ".conflicted";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Download(String),
    Upload(String),
    Delete(String),
    Modify(String),
    Move { src: String, dst: String },
    Copy { src: String, dst: String },
}

impl SyncAction {
    /// The path the action produces or removes.
    pub fn path(&self) -> &str {
        match self {
            SyncAction::Download(p)
            | SyncAction::Upload(p)
            | SyncAction::Delete(p)
            | SyncAction::Modify(p) => p,
            SyncAction::Move { dst, .. } | SyncAction::Copy { dst, .. } => dst,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncAction::Download(_) => "download",
            SyncAction::Upload(_) => "upload",
            SyncAction::Delete(_) => "delete",
            SyncAction::Modify(_) => "modify",
            SyncAction::Move { .. } => "move",
            SyncAction::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Move { src, dst } | SyncAction::Copy { src, dst } => {
                write!(f, "{} {src} -> {dst}", self.kind())
            }
            other => write!(f, "{} {}", other.kind(), other.path()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Network actions, in bucket order.
    pub actions: Vec<SyncAction>,
    /// Moves and copies already applied to the local tree.
    pub applied: Vec<SyncAction>,
    /// Paths whose local edits were preserved under a conflict name.
    pub conflicts: Vec<String>,
    /// Whether the local tree differed from the last checkpoint.
    pub modified: bool,
}

impl Reconciliation {
    /// Nothing left to transfer and nothing deferred to a later pass.
    pub fn is_settled(&self) -> bool {
        self.actions.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Default)]
struct Buckets {
    download: BTreeSet<String>,
    delete: BTreeSet<String>,
    modify: BTreeSet<String>,
    upload: BTreeSet<String>,
}

impl Buckets {
    fn into_actions(self) -> Vec<SyncAction> {
        let mut out = Vec::with_capacity(
            self.download.len() + self.delete.len() + self.modify.len() + self.upload.len(),
        );
        out.extend(self.download.into_iter().map(SyncAction::Download));
        out.extend(self.delete.into_iter().map(SyncAction::Delete));
        out.extend(self.modify.into_iter().map(SyncAction::Modify));
        out.extend(self.upload.into_iter().map(SyncAction::Upload));
        out
    }
}

pub struct Reconciler<'s, 'm> {
    server_timestamp: i64,
    server: &'s Snapshot,
    mutator: LocalMutator<'m>,
    checkpoint: SyncState,
    last_timestamp: i64,
    modified: bool,
    index: DigestIndex,
}

impl<'s, 'm> Reconciler<'s, 'm> {
    fn new(server_timestamp: i64, server: &'s Snapshot, mutator: LocalMutator<'m>) -> Self {
        let checkpoint = mutator.state().clone();
        let last_timestamp = checkpoint.last_timestamp;
        let modified = global_digest(mutator.snapshot()) != checkpoint.global_md5;
        let index = DigestIndex::build(mutator.snapshot());
        Self {
            server_timestamp,
            server,
            mutator,
            checkpoint,
            last_timestamp,
            modified,
            index,
        }
    }

    pub fn run(mut self) -> Reconciliation {
        let mut paths: BTreeSet<String> =
            self.server.iter().map(|(p, _)| p.to_string()).collect();
        paths.extend(self.mutator.snapshot().iter().map(|(p, _)| p.to_string()));

        let mut buckets = Buckets::default();
        let mut out = Reconciliation {
            modified: self.modified,
            ..Default::default()
        };

        // Arrivals first: moves consume their local source before it could be
        // classified as a fresh upload.
        let mut handled = HashSet::new();
        for path in &paths {
            let Some(remote) = self.server.get(path) else {
                continue;
            };
            if !self.is_incoming(path, remote) {
                continue;
            }
            handled.insert(path.as_str());
            match self.explain_locally(path, remote) {
                Some(action) => out.applied.push(action),
                None => {
                    buckets.download.insert(path.clone());
                }
            }
        }

        for path in &paths {
            if handled.contains(path.as_str()) {
                continue;
            }
            let remote = self.server.get(path);
            let local = self.mutator.snapshot().get(path).cloned();
            match (remote, local) {
                (None, None) => {}
                // Known at the checkpoint, gone locally since.
                (Some(_), None) => {
                    buckets.delete.insert(path.clone());
                }
                (None, Some(_)) => {
                    buckets.upload.insert(path.clone());
                }
                (Some(remote), Some(local)) => {
                    if local.md5 == remote.md5 {
                        continue;
                    }
                    if local.timestamp > remote.timestamp {
                        buckets.modify.insert(path.clone());
                    } else if remote.timestamp > local.timestamp {
                        out.conflicts.push(path.clone());
                        if let Some(renamed) = self.preserve_conflict(path, &local) {
                            buckets.upload.insert(renamed);
                        }
                    } else if self.modified {
                        buckets.modify.insert(path.clone());
                    }
                }
            }
        }

        out.actions = buckets.into_actions();
        if out.is_settled() {
            self.mutator.checkpoint(self.server_timestamp);
        } else {
            // Pending work is still measured against the old checkpoint.
            self.mutator.restore(self.checkpoint);
        }
        out
    }

    /// New on the server since the checkpoint, or newer there while the local
    /// copy is untouched since the checkpoint.
    fn is_incoming(&self, path: &str, remote: &FileEntry) -> bool {
        match self.mutator.snapshot().get(path) {
            None => remote.timestamp > self.last_timestamp,
            Some(local) => {
                local.md5 != remote.md5
                    && remote.timestamp > local.timestamp
                    && !self.changed_locally(local)
            }
        }
    }

    fn changed_locally(&self, local: &FileEntry) -> bool {
        self.modified && local.timestamp > self.last_timestamp
    }

    /// Satisfy `path` from content already on disk. A source the server no
    /// longer has, and that existed at the checkpoint, was moved; any other
    /// local holder of the digest is copied.
    fn explain_locally(&mut self, path: &str, remote: &FileEntry) -> Option<SyncAction> {
        let candidates: Vec<String> = self
            .index
            .paths(&remote.md5)
            .iter()
            .filter(|q| q.as_str() != path)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let previous = self.mutator.snapshot().get(path).map(|e| e.md5.clone());

        // Untouched since the checkpoint means the server had it too. An
        // unmodified tree counts as untouched even when acknowledgements
        // stamped entries past `last_timestamp`.
        let moved_from = candidates.iter().find(|q| {
            !self.server.contains(q)
                && self
                    .mutator
                    .snapshot()
                    .get(q)
                    .map(|e| !self.changed_locally(e))
                    .unwrap_or(false)
        });
        if let Some(src) = moved_from {
            if self.mutator.move_path(src, path, remote.timestamp) {
                self.index.remove(&remote.md5, src);
                self.reindex(path, &remote.md5, previous.as_deref());
                return Some(SyncAction::Move {
                    src: src.clone(),
                    dst: path.to_string(),
                });
            }
        }

        for src in &candidates {
            if !self.mutator.snapshot().contains(src) {
                continue;
            }
            if self.mutator.copy_path(src, path, remote.timestamp) {
                self.reindex(path, &remote.md5, previous.as_deref());
                return Some(SyncAction::Copy {
                    src: src.clone(),
                    dst: path.to_string(),
                });
            }
        }
        None
    }

    fn reindex(&mut self, path: &str, digest: &str, previous: Option<&str>) {
        if let Some(old) = previous {
            self.index.remove(old, path);
        }
        self.index.insert(digest, path);
    }

    /// Move the local edit aside so the server's version can land on `path`
    /// in a later pass. Returns the new name to upload.
    fn preserve_conflict(&mut self, path: &str, local: &FileEntry) -> Option<String> {
        let renamed = conflict_name(path, self.server, self.mutator.snapshot());
        if self.mutator.move_path(path, &renamed, local.timestamp) {
            crate::logging::warn_kv(
                "conflict preserved local edit",
                &[("path", path), ("renamed", &renamed)],
            );
            Some(renamed)
        } else {
            None
        }
    }
}

/// Run one reconciliation; see [`Reconciler`].
pub fn reconcile(
    server_timestamp: i64,
    server: &Snapshot,
    mutator: LocalMutator<'_>,
) -> Reconciliation {
    let server = server.without_unsafe_keys();
    Reconciler::new(server_timestamp, &server, mutator).run()
}

fn conflict_name(path: &str, server: &Snapshot, client: &Snapshot) -> String {
    let base = format!("{path}{CONFLICT_SUFFIX}");
    let taken = |p: &str| server.contains(p) || client.contains(p);
    if !taken(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}.{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(entries: &[(&str, i64, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(p, ts, md5)| {
                (
                    p.to_string(),
                    FileEntry {
                        timestamp: *ts,
                        md5: md5.to_string(),
                    },
                )
            })
            .collect()
    }

    fn checkpoint_of(client: &Snapshot, last_timestamp: i64) -> SyncState {
        SyncState {
            last_timestamp,
            global_md5: global_digest(client),
        }
    }

    fn run(
        server_ts: i64,
        server: &Snapshot,
        client: &mut Snapshot,
        state: &mut SyncState,
    ) -> Reconciliation {
        reconcile(server_ts, server, LocalMutator::new(client, state))
    }

    fn download(p: &str) -> SyncAction {
        SyncAction::Download(p.into())
    }
    fn upload(p: &str) -> SyncAction {
        SyncAction::Upload(p.into())
    }

    #[test]
    fn identical_snapshots_at_same_timestamp_do_nothing() {
        let server = snap(&[("a.txt", 5, "aa"), ("dir/b.txt", 7, "bb")]);
        let mut client = server.clone();
        let mut state = checkpoint_of(&client, 10);
        let before = state.clone();

        let out = run(10, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert!(out.applied.is_empty());
        assert!(!out.modified);
        assert_eq!(client, server);
        assert_eq!(state, before);
    }

    #[test]
    fn rename_on_server_is_applied_as_local_move() {
        let mut client = snap(&[("a.txt", 5, "aa"), ("b.txt", 5, "bb")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("renamed.txt", 15, "aa"), ("b.txt", 5, "bb")]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert_eq!(
            out.applied,
            [SyncAction::Move {
                src: "a.txt".into(),
                dst: "renamed.txt".into()
            }]
        );
        assert_eq!(client, server);
        assert_eq!(state.last_timestamp, 20);
        assert_eq!(state.global_md5, global_digest(&client));
    }

    #[test]
    fn duplicate_on_server_is_applied_as_local_copy() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("a.txt", 5, "aa"), ("copy/a.txt", 15, "aa")]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert_eq!(
            out.applied,
            [SyncAction::Copy {
                src: "a.txt".into(),
                dst: "copy/a.txt".into()
            }]
        );
        assert_eq!(client, server);
        assert_eq!(state.last_timestamp, 20);
    }

    #[test]
    fn new_server_file_is_downloaded() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("a.txt", 5, "aa"), ("new.txt", 15, "nn")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [download("new.txt")]);
        assert_eq!(state.last_timestamp, 10);
    }

    #[test]
    fn downloads_come_before_uploads() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        client.insert(
            "mine.txt",
            FileEntry {
                timestamp: 12,
                md5: "mm".into(),
            },
        );
        let server = snap(&[("a.txt", 5, "aa"), ("theirs.txt", 15, "tt")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [download("theirs.txt"), upload("mine.txt")]);
    }

    #[test]
    fn stale_server_file_missing_locally_is_deleted() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&snap(&[("a.txt", 5, "aa"), ("gone.txt", 3, "gg")]), 10);
        let server = snap(&[("a.txt", 5, "aa"), ("gone.txt", 3, "gg")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [SyncAction::Delete("gone.txt".into())]);
    }

    #[test]
    fn edits_on_both_sides_preserve_the_local_copy() {
        let mut client = snap(&[("p.txt", 5, "old")]);
        let mut state = checkpoint_of(&client, 10);
        client.insert(
            "p.txt",
            FileEntry {
                timestamp: 15,
                md5: "mine".into(),
            },
        );
        let server = snap(&[("p.txt", 18, "theirs")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [upload("p.txt.conflicted")]);
        assert_eq!(out.conflicts, ["p.txt"]);
        assert!(!client.contains("p.txt"));
        assert_eq!(client.get("p.txt.conflicted").unwrap().md5, "mine");
        assert_eq!(state.last_timestamp, 10);
    }

    #[test]
    fn conflict_name_skips_taken_names() {
        let mut client = snap(&[("p.txt", 5, "old"), ("p.txt.conflicted", 4, "older")]);
        let mut state = checkpoint_of(&client, 10);
        client.insert(
            "p.txt",
            FileEntry {
                timestamp: 15,
                md5: "mine".into(),
            },
        );
        let server = snap(&[("p.txt", 18, "theirs"), ("p.txt.conflicted", 4, "older")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [upload("p.txt.conflicted.1")]);
    }

    #[test]
    fn newer_server_copy_of_untouched_file_is_downloaded() {
        let mut client = snap(&[("p.txt", 5, "old"), ("other.txt", 5, "oo")]);
        let mut state = checkpoint_of(&client, 10);
        // An unrelated local edit marks the tree modified.
        client.insert(
            "other.txt",
            FileEntry {
                timestamp: 12,
                md5: "o2".into(),
            },
        );
        let server = snap(&[("p.txt", 15, "new"), ("other.txt", 5, "oo")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(
            out.actions,
            [download("p.txt"), SyncAction::Modify("other.txt".into())]
        );
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn local_edit_newer_than_server_is_modify() {
        let mut client = snap(&[("p.txt", 5, "old")]);
        let mut state = checkpoint_of(&client, 10);
        client.insert(
            "p.txt",
            FileEntry {
                timestamp: 15,
                md5: "new".into(),
            },
        );
        let server = snap(&[("p.txt", 5, "old")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(out.actions, [SyncAction::Modify("p.txt".into())]);
    }

    #[test]
    fn equal_timestamps_follow_the_modified_flag() {
        let server = snap(&[("p.txt", 5, "server")]);

        let mut client = snap(&[("p.txt", 5, "client")]);
        let mut state = checkpoint_of(&client, 10);
        let out = run(10, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());

        let mut client = snap(&[("p.txt", 5, "client")]);
        let mut state = SyncState {
            last_timestamp: 10,
            global_md5: "stale".into(),
        };
        let out = run(10, &server, &mut client, &mut state);
        assert_eq!(out.actions, [SyncAction::Modify("p.txt".into())]);
    }

    #[test]
    fn equal_digests_are_noops_whatever_the_timestamps() {
        let server = snap(&[("p.txt", 50, "same")]);
        let mut client = snap(&[("p.txt", 5, "same")]);
        let mut state = SyncState::default();

        let out = run(60, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert!(out.applied.is_empty());
        assert_eq!(state.last_timestamp, 60);
    }

    #[test]
    fn never_synced_source_is_copied_not_moved() {
        let mut client = snap(&[]);
        let mut state = checkpoint_of(&client, 10);
        let before = state.clone();
        client.insert(
            "draft.txt",
            FileEntry {
                timestamp: 12,
                md5: "dd".into(),
            },
        );
        let server = snap(&[("final.txt", 15, "dd")]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(
            out.applied,
            [SyncAction::Copy {
                src: "draft.txt".into(),
                dst: "final.txt".into()
            }]
        );
        assert_eq!(out.actions, [upload("draft.txt")]);
        assert!(client.contains("draft.txt"));
        // Unsettled: the copy is on disk but the checkpoint is the old one.
        assert_eq!(state, before);
    }

    #[test]
    fn acknowledged_upload_renamed_on_server_is_moved() {
        // Upload acks stamp past the checkpoint; the tree is still unmodified.
        let mut client = snap(&[("a.txt", 15, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("b.txt", 20, "aa")]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert_eq!(
            out.applied,
            [SyncAction::Move {
                src: "a.txt".into(),
                dst: "b.txt".into()
            }]
        );
        assert_eq!(client, server);
    }

    #[test]
    fn server_paths_leaving_the_root_are_ignored() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[
            ("a.txt", 5, "aa"),
            ("../escaped.txt", 15, "aa"),
            ("/etc/passwd", 15, "pw"),
            ("docs/../../up.txt", 15, "uu"),
        ]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert!(out.applied.is_empty());
        assert_eq!(client, snap(&[("a.txt", 5, "aa")]));
    }

    #[test]
    fn overwrite_on_server_reuses_local_content() {
        let mut client = snap(&[("a.txt", 5, "aa"), ("b.txt", 5, "bb")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("a.txt", 5, "aa"), ("b.txt", 15, "aa")]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert_eq!(
            out.applied,
            [SyncAction::Copy {
                src: "a.txt".into(),
                dst: "b.txt".into()
            }]
        );
        assert_eq!(client, server);
    }

    #[test]
    fn chained_arrivals_reuse_moved_content() {
        let mut client = snap(&[("a.txt", 5, "aa")]);
        let mut state = checkpoint_of(&client, 10);
        let server = snap(&[("x/a.txt", 15, "aa"), ("y/a.txt", 15, "aa")]);

        let out = run(20, &server, &mut client, &mut state);
        assert!(out.actions.is_empty());
        assert_eq!(out.applied.len(), 2);
        assert_eq!(client, server);
    }

    #[test]
    fn buckets_are_ordered_and_exhaustive() {
        let mut client = snap(&[
            ("keep.txt", 5, "kk"),
            ("edit.txt", 5, "e1"),
            ("removed.txt", 5, "rr"),
        ]);
        let mut state = checkpoint_of(&client, 10);
        client.remove("removed.txt");
        client.insert(
            "edit.txt",
            FileEntry {
                timestamp: 12,
                md5: "e2".into(),
            },
        );
        client.insert(
            "fresh.txt",
            FileEntry {
                timestamp: 13,
                md5: "ff".into(),
            },
        );
        let server = snap(&[
            ("keep.txt", 5, "kk"),
            ("edit.txt", 5, "e1"),
            ("removed.txt", 5, "rr"),
            ("incoming.txt", 16, "ii"),
        ]);

        let out = run(20, &server, &mut client, &mut state);
        assert_eq!(
            out.actions,
            [
                download("incoming.txt"),
                SyncAction::Delete("removed.txt".into()),
                SyncAction::Modify("edit.txt".into()),
                upload("fresh.txt"),
            ]
        );
    }

    #[test]
    fn first_run_without_checkpoint_keeps_both_sides() {
        let mut client = snap(&[("local.txt", 5, "ll"), ("shared.txt", 5, "s1")]);
        let mut state = SyncState::default();
        let server = snap(&[("remote.txt", 3, "rr"), ("shared.txt", 8, "s2")]);

        let out = run(9, &server, &mut client, &mut state);
        assert_eq!(
            out.actions,
            [
                download("remote.txt"),
                upload("local.txt"),
                upload("shared.txt.conflicted"),
            ]
        );
    }

    #[test]
    fn action_display_names_kind_and_paths() {
        assert_eq!(download("a").to_string(), "download a");
        assert_eq!(
            SyncAction::Move {
                src: "a".into(),
                dst: "b".into()
            }
            .to_string(),
            "move a -> b"
        );
    }
}
