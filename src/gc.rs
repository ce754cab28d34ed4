//! Garbage collection: hard cleanup of soft-deleted versions followed by an
//! orphan-chunk sweep.
//!
//! A sweep only starts once the mutating-operation gate is idle; races with
//! concurrent deletes are tolerated (a blob or row already gone counts as
//! swept).

use std::sync::Arc;
use std::time::Duration;

use crate::chunk_store::{ChunkHash, ChunkStore};
use crate::db::MetaStore;
use crate::error::Result;
use crate::gate::Gate;

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub files_removed: u64,
    pub chunks_removed: u64,
    pub bytes_freed: u64,
}

pub struct Collector {
    meta: Arc<MetaStore>,
    store: Arc<ChunkStore>,
    gate: Gate,
}

impl Collector {
    pub fn new(meta: Arc<MetaStore>, store: Arc<ChunkStore>, gate: Gate) -> Self {
        Self { meta, store, gate }
    }

    /// One full sweep. Holds the GC interlock for its whole duration.
    pub async fn collect(&self) -> Result<GcStats> {
        let _guard = self.gate.begin_gc().await;
        let mut stats = GcStats::default();

        stats.files_removed = self.meta.cleanup_deleted_versions().await?;

        for orphan in self.meta.list_orphan_chunks().await? {
            match ChunkHash::from_hex(&orphan.hash) {
                Some(hash) => {
                    if let Err(e) = self.store.delete(&hash).await {
                        tracing::warn!("failed to unlink chunk {}: {}", orphan.hash, e);
                        continue;
                    }
                }
                None => {
                    tracing::warn!("chunk row {} carries a malformed hash", orphan.id);
                }
            }
            self.meta.delete_chunk_row(orphan.id).await?;
            stats.chunks_removed += 1;
            stats.bytes_freed += orphan.size.max(0) as u64;
        }

        if stats.files_removed > 0 || stats.chunks_removed > 0 {
            tracing::info!(
                "gc: removed {} file rows, {} chunks ({} bytes)",
                stats.files_removed,
                stats.chunks_removed,
                stats.bytes_freed
            );
        }
        Ok(stats)
    }
}

/// Run sweeps forever at the configured interval.
pub fn spawn_loop(collector: Arc<Collector>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = collector.collect().await {
                tracing::error!("gc sweep failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, Arc<MetaStore>, Arc<ChunkStore>, Collector) {
        let tmp = TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::new(db::connect("sqlite::memory:").await.unwrap()));
        let store = Arc::new(ChunkStore::new(tmp.path().to_path_buf()));
        let collector = Collector::new(Arc::clone(&meta), Arc::clone(&store), Gate::new(4));
        (tmp, meta, store, collector)
    }

    async fn put_chunk(store: &ChunkStore, data: &[u8]) -> ChunkHash {
        let hash = ChunkHash::from_data(data);
        store.put(&hash, data, true).await.unwrap();
        hash
    }

    #[tokio::test]
    async fn test_gc_keeps_shared_chunks() {
        let (_tmp, meta, store, collector) = fixture().await;

        let shared = put_chunk(&store, b"shared bytes").await;
        let unique = put_chunk(&store, b"unique bytes").await;

        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();
        meta.save_file_manifest(
            "dataset",
            "ws",
            "d",
            "1.0.0",
            "both.bin",
            0o644,
            24,
            &[(shared.to_hex(), 12), (unique.to_hex(), 12)],
        )
        .await
        .unwrap();

        meta.create_version("dataset", "ws", "d", "1.0.1", "").await.unwrap();
        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.1", "one.bin", 0o644, 12,
            &[(shared.to_hex(), 12)],
        )
        .await
        .unwrap();

        meta.soft_delete_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        let stats = collector.collect().await.unwrap();

        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.chunks_removed, 1);
        assert!(store.check(&shared).await.unwrap().exists);
        assert!(!store.check(&unique).await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_gc_noop_when_nothing_deleted() {
        let (_tmp, meta, store, collector) = fixture().await;

        let hash = put_chunk(&store, b"still referenced").await;
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();
        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.0", "f.bin", 0o644, 16,
            &[(hash.to_hex(), 16)],
        )
        .await
        .unwrap();

        let stats = collector.collect().await.unwrap();
        assert_eq!(stats.chunks_removed, 0);
        assert!(store.check(&hash).await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_gc_tolerates_missing_blob() {
        let (_tmp, meta, _store, collector) = fixture().await;

        // Row exists but the blob never made it to disk.
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();
        let ghost = ChunkHash::from_data(b"ghost");
        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.0", "f.bin", 0o644, 5,
            &[(ghost.to_hex(), 5)],
        )
        .await
        .unwrap();
        meta.remove_file("dataset", "ws", "d", "1.0.0", "f.bin")
            .await
            .unwrap();

        let stats = collector.collect().await.unwrap();
        assert_eq!(stats.chunks_removed, 1);
    }
}
