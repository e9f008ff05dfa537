//! Content-addressed dedup index: digest -> an already stored backup file.
//!
//! The index is the record store itself, so a lookup sees every verified copy
//! ever recorded against this backup store, including earlier daemon runs.

use anyhow::Result;
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio_rusqlite::Connection;

use crate::core::FileRecord;
use crate::core::hasher::Digest;
use crate::db::records;

pub trait DedupIndex: Send + Sync {
    /// Earliest recorded destination with this content that still exists.
    fn lookup(&self, digest: &Digest) -> Result<Option<PathBuf>>;

    /// Remember a verified copy.
    fn record(&self, record: FileRecord) -> Result<()>;
}

/// Dedup index backed by the SQLite record store.
///
/// Writes from concurrent workers are serialised by the connection's single
/// background thread. Methods block on the runtime and must only be called
/// from blocking threads (workers run under `spawn_blocking`).
#[derive(Clone)]
pub struct SqliteDedupIndex {
    conn: Connection,
    runtime: Handle,
}

impl SqliteDedupIndex {
    /// Must be called from within a tokio runtime.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            runtime: Handle::current(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DedupIndex for SqliteDedupIndex {
    fn lookup(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        let candidates = self
            .runtime
            .block_on(records::destinations_for(&self.conn, *digest))?;

        // Operators may prune old runs; only a live file can be linked
        Ok(candidates.into_iter().find(|p| p.exists()))
    }

    fn record(&self, record: FileRecord) -> Result<()> {
        self.runtime.block_on(records::insert(&self.conn, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher;
    use crate::db;
    use std::path::Path;
    use tempfile::tempdir;

    fn record_for(path: &Path, ts: &str) -> FileRecord {
        FileRecord {
            digest: hasher::digest(path, false).unwrap(),
            backup_timestamp: ts.to_string(),
            source_path: PathBuf::from("/mnt/x"),
            destination_path: path.to_path_buf(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lookup_skips_pruned_destinations() {
        let temp = tempdir().unwrap();
        let pruned = temp.path().join("old.txt");
        let live = temp.path().join("new.txt");
        std::fs::write(&pruned, b"payload").unwrap();
        std::fs::write(&live, b"payload").unwrap();

        let index = SqliteDedupIndex::new(db::init_in_memory().await.unwrap());
        let (first, second) = (record_for(&pruned, "t1"), record_for(&live, "t2"));
        let digest = first.digest;

        let found = tokio::task::spawn_blocking(move || {
            index.record(first).unwrap();
            index.record(second).unwrap();
            let before = index.lookup(&digest).unwrap();
            std::fs::remove_file(&pruned).unwrap();
            let after = index.lookup(&digest).unwrap();
            (before, after)
        })
        .await
        .unwrap();

        assert_eq!(found.0, Some(temp.path().join("old.txt")));
        assert_eq!(found.1, Some(temp.path().join("new.txt")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_records_are_not_lost() {
        let temp = tempdir().unwrap();
        let index = SqliteDedupIndex::new(db::init_in_memory().await.unwrap());

        let mut handles = Vec::new();
        for worker in 0..4 {
            let index = index.clone();
            let dir = temp.path().join(format!("w{}", worker));
            std::fs::create_dir_all(&dir).unwrap();
            handles.push(tokio::task::spawn_blocking(move || {
                for i in 0..10 {
                    let path = dir.join(format!("{}.txt", i));
                    std::fs::write(&path, format!("{}-{}", worker, i)).unwrap();
                    index.record(record_for(&path, "t")).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(records::count(index.connection()).await.unwrap(), 40);
    }
}
