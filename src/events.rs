use crate::reconcile::SyncAction;
use crate::snapshot::{FileEntry, Snapshot};

/// A filesystem change, already resolved against the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// Created or modified file with its current state.
    Written { path: String, entry: FileEntry },
    /// File or directory gone.
    Removed { path: String },
    /// `entry` is `None` when `to` is a directory.
    Renamed {
        from: String,
        to: String,
        entry: Option<FileEntry>,
    },
}

/// Turns live events into immediate server commands, updating the snapshot
/// optimistically before the server has answered.
pub struct EventClassifier<'a> {
    snapshot: &'a mut Snapshot,
}

impl<'a> EventClassifier<'a> {
    pub fn new(snapshot: &'a mut Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn classify(&mut self, event: LocalEvent) -> Vec<SyncAction> {
        match event {
            LocalEvent::Written { path, entry } => self.written(path, entry).into_iter().collect(),
            LocalEvent::Removed { path } => self.removed(&path),
            LocalEvent::Renamed { from, to, entry } => self.renamed(&from, &to, entry),
        }
    }

    /// Record the server's timestamp for a command it accepted. Returns `true`
    /// when a snapshot entry was stamped and the file's mtime should follow.
    ///
    /// The checkpoint is left alone: the server may hold older changes this
    /// client has not fetched yet, and those must still read as incoming.
    /// The next clean reconciliation moves it past `timestamp`.
    pub fn acknowledge(&mut self, action: &SyncAction, timestamp: i64) -> bool {
        if matches!(action, SyncAction::Delete(_)) {
            return false;
        }
        match self.snapshot.get(action.path()).cloned() {
            Some(entry) => {
                self.snapshot.insert(action.path(), FileEntry { timestamp, ..entry });
                true
            }
            None => false,
        }
    }

    fn written(&mut self, path: String, entry: FileEntry) -> Option<SyncAction> {
        match self.snapshot.get(&path) {
            // Our own writes and touches land here.
            Some(existing) if existing.md5 == entry.md5 => None,
            Some(_) => {
                self.snapshot.insert(path.clone(), entry);
                Some(SyncAction::Modify(path))
            }
            None => {
                // Scanned per event; an index would need rebuilding on every insert.
                let source = self
                    .snapshot
                    .iter()
                    .filter(|(p, e)| e.md5 == entry.md5 && *p != path)
                    .map(|(p, _)| p)
                    .min()
                    .map(str::to_string);
                self.snapshot.insert(path.clone(), entry);
                Some(match source {
                    Some(src) => SyncAction::Copy { src, dst: path },
                    None => SyncAction::Upload(path),
                })
            }
        }
    }

    fn removed(&mut self, path: &str) -> Vec<SyncAction> {
        self.snapshot
            .paths_under(path)
            .into_iter()
            .map(|p| {
                self.snapshot.remove(&p);
                SyncAction::Delete(p)
            })
            .collect()
    }

    fn renamed(&mut self, from: &str, to: &str, entry: Option<FileEntry>) -> Vec<SyncAction> {
        match entry {
            Some(entry) => {
                if self.snapshot.remove(from).is_some() {
                    self.snapshot.insert(to, entry);
                    vec![SyncAction::Move {
                        src: from.to_string(),
                        dst: to.to_string(),
                    }]
                } else {
                    self.written(to.to_string(), entry).into_iter().collect()
                }
            }
            None => {
                let mut out = Vec::new();
                for src in self.snapshot.paths_under(from) {
                    let Some(moved) = self.snapshot.remove(&src) else {
                        continue;
                    };
                    let dst = format!("{to}{}", &src[from.len()..]);
                    self.snapshot.insert(dst.clone(), moved);
                    out.push(SyncAction::Move { src, dst });
                }
                out
            }
        }
    }
}
