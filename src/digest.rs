//! Content digests: per-file MD5, the order-independent digest of a whole
//! snapshot, and the digest -> paths index used for move/copy detection.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::snapshot::Snapshot;

pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

pub fn bytes_md5(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Digest of the full `(path, md5)` set. Entries are fed in ascending path
/// order, digest first, so the result depends only on content.
pub fn global_digest(snapshot: &Snapshot) -> String {
    let mut ctx = md5::Context::new();
    for (path, entry) in snapshot.sorted() {
        ctx.consume(entry.md5.as_bytes());
        ctx.consume(path.as_bytes());
    }
    format!("{:x}", ctx.compute())
}

/// Join of a snapshot by content digest, built once per reconciliation.
#[derive(Debug, Default)]
pub struct DigestIndex {
    by_digest: HashMap<String, Vec<String>>,
}

impl DigestIndex {
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut index = Self::default();
        for (path, entry) in snapshot.iter() {
            index.insert(&entry.md5, path);
        }
        index
    }

    /// Paths holding `digest`, in ascending order.
    pub fn paths(&self, digest: &str) -> &[String] {
        self.by_digest
            .get(digest)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn insert(&mut self, digest: &str, path: &str) {
        let paths = self.by_digest.entry(digest.to_string()).or_default();
        if let Err(pos) = paths.binary_search_by(|p| p.as_str().cmp(path)) {
            paths.insert(pos, path.to_string());
        }
    }

    pub fn remove(&mut self, digest: &str, path: &str) {
        if let Some(paths) = self.by_digest.get_mut(digest) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                self.by_digest.remove(digest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileEntry;

    fn entry(ts: i64, md5: &str) -> FileEntry {
        FileEntry {
            timestamp: ts,
            md5: md5.to_string(),
        }
    }

    #[test]
    fn global_digest_ignores_insertion_order() {
        let mut a = Snapshot::default();
        a.insert("b/two.txt", entry(2, "22"));
        a.insert("a/one.txt", entry(1, "11"));
        a.insert("c.txt", entry(3, "33"));

        let mut b = Snapshot::default();
        b.insert("c.txt", entry(3, "33"));
        b.insert("a/one.txt", entry(1, "11"));
        b.insert("b/two.txt", entry(2, "22"));

        assert_eq!(global_digest(&a), global_digest(&b));
    }

    #[test]
    fn global_digest_ignores_timestamps_but_not_content() {
        let mut a = Snapshot::default();
        a.insert("x", entry(1, "aa"));
        let mut b = Snapshot::default();
        b.insert("x", entry(99, "aa"));
        assert_eq!(global_digest(&a), global_digest(&b));

        b.insert("x", entry(99, "bb"));
        assert_ne!(global_digest(&a), global_digest(&b));

        let mut c = Snapshot::default();
        c.insert("y", entry(1, "aa"));
        assert_ne!(global_digest(&a), global_digest(&c));
    }

    #[test]
    fn empty_snapshot_digest_is_md5_of_nothing() {
        assert_eq!(
            global_digest(&Snapshot::default()),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn index_tracks_paths_per_digest() {
        let mut snap = Snapshot::default();
        snap.insert("z.txt", entry(1, "aa"));
        snap.insert("a.txt", entry(1, "aa"));
        snap.insert("b.txt", entry(1, "bb"));

        let mut index = DigestIndex::build(&snap);
        assert_eq!(index.paths("aa"), ["a.txt", "z.txt"]);
        assert!(index.paths("cc").is_empty());

        index.remove("aa", "a.txt");
        index.insert("aa", "m.txt");
        index.insert("aa", "m.txt");
        assert_eq!(index.paths("aa"), ["m.txt", "z.txt"]);
    }
}
