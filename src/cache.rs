//! LRU cache of materialized filesystem trees, keyed per version.
//!
//! Readers get a `clone_tree()` of the cached value so reader state never
//! leaks between requests. Every mutating manifest operation invalidates its
//! key; entity-wide operations flush all versions of the entity.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::vfs::ChunkedFileFS;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FsKey {
    pub dataset_type: String,
    pub workspace: String,
    pub name: String,
    pub version: String,
}

impl FsKey {
    pub fn new(ty: &str, workspace: &str, name: &str, version: &str) -> Self {
        Self {
            dataset_type: ty.to_string(),
            workspace: workspace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

struct Entry {
    fs: Arc<ChunkedFileFS>,
    inserted: Instant,
}

pub struct FsCache {
    inner: Mutex<LruCache<FsKey, Entry>>,
    ttl: Option<Duration>,
}

impl FsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Fresh clone of the cached tree, or None on miss/expiry.
    pub fn get(&self, key: &FsKey) -> Option<ChunkedFileFS> {
        let mut cache = self.inner.lock();
        if let Some(ttl) = self.ttl {
            if cache.peek(key).is_some_and(|e| e.inserted.elapsed() > ttl) {
                cache.pop(key);
                return None;
            }
        }
        cache.get(key).map(|e| e.fs.clone_tree())
    }

    pub fn insert(&self, key: FsKey, fs: Arc<ChunkedFileFS>) {
        self.inner.lock().put(
            key,
            Entry {
                fs,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &FsKey) {
        self.inner.lock().pop(key);
    }

    /// Drop every cached version of one entity.
    pub fn invalidate_entity(&self, ty: &str, workspace: &str, name: &str) {
        let mut cache = self.inner.lock();
        let stale: Vec<FsKey> = cache
            .iter()
            .filter(|(k, _)| {
                k.dataset_type == ty && k.workspace == workspace && k.name == name
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::tests::MapSource;
    use crate::vfs::{ChunkedFileFS, Node};
    use std::io::{Read, Seek, SeekFrom};

    fn tree(content: &[u8]) -> Arc<ChunkedFileFS> {
        let source = Arc::new(MapSource::new());
        let chunk = source.add(content.to_vec());
        let rows = vec![crate::db::FsRow {
            path: "f.bin".to_string(),
            file_size: content.len() as i64,
            mode: 0o644,
            updated_at: 0,
            chunk_index: Some(0),
            chunk_hash: Some(chunk.hash.to_hex()),
            chunk_size: Some(chunk.size),
        }];
        Arc::new(ChunkedFileFS::build(&rows, source).unwrap())
    }

    #[test]
    fn test_hit_miss_invalidate() {
        let cache = FsCache::new(4);
        let key = FsKey::new("dataset", "ws", "d", "1.0.0");

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), tree(b"abc"));
        assert!(cache.get(&key).is_some());

        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = FsCache::new(2);
        let k1 = FsKey::new("dataset", "ws", "d", "1.0.0");
        let k2 = FsKey::new("dataset", "ws", "d", "1.0.1");
        let k3 = FsKey::new("dataset", "ws", "d", "1.0.2");

        cache.insert(k1.clone(), tree(b"1"));
        cache.insert(k2.clone(), tree(b"2"));
        // Touch k1 so k2 is the LRU entry.
        assert!(cache.get(&k1).is_some());
        cache.insert(k3.clone(), tree(b"3"));

        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_invalidate_entity() {
        let cache = FsCache::new(8);
        cache.insert(FsKey::new("dataset", "ws", "d", "1.0.0"), tree(b"1"));
        cache.insert(FsKey::new("dataset", "ws", "d", "1.0.1"), tree(b"2"));
        cache.insert(FsKey::new("dataset", "ws", "other", "1.0.0"), tree(b"3"));

        cache.invalidate_entity("dataset", "ws", "d");
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get(&FsKey::new("dataset", "ws", "other", "1.0.0"))
            .is_some());
    }

    #[test]
    fn test_returned_clone_has_private_reader_state() {
        let cache = FsCache::new(4);
        let key = FsKey::new("dataset", "ws", "d", "1.0.0");
        cache.insert(key.clone(), tree(b"hello world"));

        let fs1 = cache.get(&key).unwrap();
        let fs2 = cache.get(&key).unwrap();

        let mut f1 = match fs1.get_file("f.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };
        let mut f2 = match fs2.get_file("f.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };

        f1.seek(SeekFrom::Start(6)).unwrap();
        let mut out = String::new();
        f2.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");

        let mut rest = String::new();
        f1.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "world");
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = FsCache::new(4).with_ttl(Duration::from_millis(0));
        let key = FsKey::new("dataset", "ws", "d", "1.0.0");
        cache.insert(key.clone(), tree(b"x"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
    }
}
