use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::reconcile::SyncAction;

#[derive(Default)]
pub struct HttpStats {
    bytes_sent: AtomicI64,
    bytes_recv: AtomicI64,
}

impl HttpStats {
    pub fn on_send(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_recv(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> i64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> i64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }
}

/// Counters for actions the daemon carried out, shared between the sync loop,
/// the watcher and the command socket.
#[derive(Default)]
pub struct SyncStats {
    downloads: AtomicI64,
    uploads: AtomicI64,
    modifies: AtomicI64,
    deletes: AtomicI64,
    moves: AtomicI64,
    copies: AtomicI64,
    conflicts: AtomicI64,
    failures: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl SyncStats {
    pub fn on_action(&self, action: &SyncAction) {
        let counter = match action {
            SyncAction::Download(_) => &self.downloads,
            SyncAction::Upload(_) => &self.uploads,
            SyncAction::Modify(_) => &self.modifies,
            SyncAction::Delete(_) => &self.deletes,
            SyncAction::Move { .. } => &self.moves,
            SyncAction::Copy { .. } => &self.copies,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_conflicts(&self, n: usize) {
        self.conflicts.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn on_failure(&self, err: impl ToString) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut g = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        *g = Some(err.to_string());
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        SyncStatsSnapshot {
            downloads: self.downloads.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    pub downloads: i64,
    pub uploads: i64,
    pub modifies: i64,
    pub deletes: i64,
    pub moves: i64,
    pub copies: i64,
    pub conflicts: i64,
    pub failures: i64,
    pub last_error: String,
}

impl SyncStatsSnapshot {
    pub fn render(&self) -> String {
        let mut out = format!(
            "downloads={} uploads={} modifies={} deletes={} moves={} copies={} conflicts={} failures={}",
            self.downloads,
            self.uploads,
            self.modifies,
            self.deletes,
            self.moves,
            self.copies,
            self.conflicts,
            self.failures
        );
        if !self.last_error.is_empty() {
            out.push_str(&format!("\nlast_error: {}", self.last_error));
        }
        out
    }
}
