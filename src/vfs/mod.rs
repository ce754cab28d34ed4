//! In-memory filesystem reconstructed from a version manifest.
//!
//! The tree serves directory listings and file stats directly; file bytes are
//! pulled from the chunk store on demand through a seekable multi-chunk
//! reader. One tree may back many concurrent requests: each request works on
//! a `clone_tree()` so reader state never crosses handlers.

pub mod tar;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use serde::Serialize;

use crate::chunk_store::{ChunkHash, ChunkStore};
use crate::db::FsRow;
use crate::error::{Result, ServerError};

pub trait ReadSeek: Read + Seek + Send + Sync {}
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Where chunk bytes come from when a file is read. Local trees open blobs
/// from the chunk store; federated trees fetch from a master.
pub trait ChunkSource: Send + Sync {
    fn open(&self, hash: &ChunkHash) -> Result<Box<dyn ReadSeek>>;
}

/// Chunk source backed by the local blob store.
pub struct LocalChunks(pub Arc<ChunkStore>);

impl ChunkSource for LocalChunks {
    fn open(&self, hash: &ChunkHash) -> Result<Box<dyn ReadSeek>> {
        Ok(Box::new(self.0.open(hash)?))
    }
}

/// Stat data served by `readdir` and directory/file lookups.
#[derive(Clone, Debug, Serialize)]
pub struct FileStat {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    #[serde(rename = "modtime")]
    pub mtime: i64,
    pub dir: bool,
}

impl FileStat {
    fn for_dir(name: &str, mtime: i64) -> Self {
        Self {
            name: name.to_string(),
            size: 4096,
            mode: 0o775,
            mtime,
            dir: true,
        }
    }
}

/// One entry of a file's ordered chunk list.
#[derive(Clone, Copy, Debug)]
pub struct Chunk {
    pub hash: ChunkHash,
    pub size: i64,
}

/// A file node: ordered chunk list plus per-handle reader state.
pub struct ChunkedFile {
    // NOTE: Debug is implemented manually below (source/reader are trait
    // objects that don't implement Debug).
    /// Path relative to the tree root, no leading slash.
    pub name: String,
    pub size: i64,
    pub stat: FileStat,
    chunks: Arc<Vec<Chunk>>,
    source: Arc<dyn ChunkSource>,
    current_chunk: usize,
    chunk_offset: u64,
    offset: i64,
    reader: Option<Box<dyn ReadSeek>>,
}

impl ChunkedFile {
    fn new(
        name: String,
        size: i64,
        stat: FileStat,
        chunks: Arc<Vec<Chunk>>,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        Self {
            name,
            size,
            stat,
            chunks,
            source,
            current_chunk: 0,
            chunk_offset: 0,
            offset: 0,
            reader: None,
        }
    }

    /// Independent handle over the same chunk list; reader state starts
    /// fresh.
    pub fn clone_handle(&self) -> Self {
        Self::new(
            self.name.clone(),
            self.size,
            self.stat.clone(),
            Arc::clone(&self.chunks),
            Arc::clone(&self.source),
        )
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn current_chunk(&self) -> usize {
        self.current_chunk
    }

    pub fn chunk_offset(&self) -> u64 {
        self.chunk_offset
    }

    fn reset_state(&mut self) {
        self.reader = None;
        self.current_chunk = 0;
        self.chunk_offset = 0;
        self.offset = 0;
    }
}

impl fmt::Debug for ChunkedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stat", &self.stat)
            .field("chunks", &self.chunks)
            .field("current_chunk", &self.current_chunk)
            .field("chunk_offset", &self.chunk_offset)
            .field("offset", &self.offset)
            .finish()
    }
}

fn to_io(e: ServerError) -> io::Error {
    match e {
        ServerError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
        ServerError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for ChunkedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            if self.current_chunk >= self.chunks.len() {
                // Past the last chunk: report EOF and rewind so a reused
                // handle starts over.
                self.reset_state();
                return Ok(total);
            }
            if self.reader.is_none() {
                let mut r = self
                    .source
                    .open(&self.chunks[self.current_chunk].hash)
                    .map_err(to_io)?;
                r.seek(SeekFrom::Start(self.chunk_offset))?;
                self.reader = Some(r);
            }
            let n = self
                .reader
                .as_mut()
                .expect("reader opened above")
                .read(&mut buf[total..])?;
            self.chunk_offset += n as u64;
            self.offset += n as i64;
            total += n;
            if total == buf.len() {
                return Ok(total);
            }
            if n == 0 {
                // Current chunk exhausted; move on or finish.
                self.reader = None;
                self.current_chunk += 1;
                self.chunk_offset = 0;
                if self.current_chunk >= self.chunks.len() {
                    self.current_chunk = self.chunks.len();
                    return Ok(total);
                }
            }
        }
    }
}

impl Seek for ChunkedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(o) => {
                if o > self.size as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {} beyond file size {}", o, self.size),
                    ));
                }
                o as i64
            }
            SeekFrom::Current(d) => self.offset + d,
            SeekFrom::End(d) => {
                if d > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek past the end of the file",
                    ));
                }
                self.size + d
            }
        };
        if absolute < 0 || absolute > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {} outside file of size {}", absolute, self.size),
            ));
        }

        // Locate the chunk whose byte range contains the new offset.
        let mut remaining = absolute;
        let mut idx = self.chunks.len();
        for (i, ch) in self.chunks.iter().enumerate() {
            if remaining < ch.size {
                idx = i;
                break;
            }
            remaining -= ch.size;
        }
        self.current_chunk = idx;
        self.chunk_offset = if idx < self.chunks.len() {
            remaining as u64
        } else {
            0
        };
        self.offset = absolute;
        // Any open chunk reader is stale now; the next read reopens and
        // seeks.
        self.reader = None;

        Ok(absolute as u64)
    }
}

/// A node returned by path lookup: file, or directory posing as a file
/// object for stat purposes.
pub enum Node<'a> {
    File(&'a ChunkedFile),
    Dir(&'a ChunkedFileFS),
}

impl<'a> Node<'a> {
    pub fn stat(&self) -> &FileStat {
        match self {
            Node::File(f) => &f.stat,
            Node::Dir(d) => &d.stat,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }
}

/// Directory level of the reconstructed tree.
#[derive(Debug)]
pub struct ChunkedFileFS {
    /// Path of this directory from the tree root ("" for the root).
    pub root: String,
    pub dirs: BTreeMap<String, ChunkedFileFS>,
    pub files: BTreeMap<String, ChunkedFile>,
    pub stat: FileStat,
}

impl ChunkedFileFS {
    fn new_dir(path: &str, mtime: i64) -> Self {
        let base = path.rsplit('/').next().unwrap_or("");
        let name = if base.is_empty() { "/" } else { base };
        Self {
            root: path.to_string(),
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
            stat: FileStat::for_dir(name, mtime),
        }
    }

    /// Build the tree from manifest rows ordered by `(path, chunk_index)`.
    pub fn build(rows: &[FsRow], source: Arc<dyn ChunkSource>) -> Result<Self> {
        let mut fs = Self::new_dir("", 0);

        let mut i = 0;
        while i < rows.len() {
            let path = rows[i].path.trim_start_matches('/').to_string();
            let file_size = rows[i].file_size;
            let mode = rows[i].mode as u32;
            let mtime = rows[i].updated_at;

            let mut chunks = Vec::new();
            while i < rows.len() && rows[i].path.trim_start_matches('/') == path {
                if let (Some(hash), Some(size)) = (&rows[i].chunk_hash, rows[i].chunk_size) {
                    let hash = ChunkHash::from_hex(hash).ok_or_else(|| {
                        ServerError::Internal(format!("malformed chunk hash in manifest: {}", hash))
                    })?;
                    chunks.push(Chunk { hash, size });
                }
                i += 1;
            }
            if path.is_empty() {
                continue;
            }
            fs.insert_file(&path, file_size, mode, mtime, chunks, Arc::clone(&source));
        }

        fs.fix_dir_times();
        Ok(fs)
    }

    fn insert_file(
        &mut self,
        path: &str,
        size: i64,
        mode: u32,
        mtime: i64,
        chunks: Vec<Chunk>,
        source: Arc<dyn ChunkSource>,
    ) {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let file_name = match parts.pop() {
            Some(n) => n,
            None => return,
        };

        let mut cur = self;
        let mut prefix = String::new();
        for part in parts {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            cur = cur
                .dirs
                .entry(part.to_string())
                .or_insert_with(|| ChunkedFileFS::new_dir(&prefix, mtime));
        }

        let stat = FileStat {
            name: file_name.to_string(),
            size,
            mode,
            mtime,
            dir: false,
        };
        cur.files.insert(
            file_name.to_string(),
            ChunkedFile::new(path.to_string(), size, stat, Arc::new(chunks), source),
        );
    }

    /// Propagate mtimes upward: a directory is as fresh as its newest
    /// descendant.
    fn fix_dir_times(&mut self) -> i64 {
        let mut newest = self.files.values().map(|f| f.stat.mtime).max().unwrap_or(0);
        for dir in self.dirs.values_mut() {
            newest = newest.max(dir.fix_dir_times());
        }
        self.stat.mtime = self.stat.mtime.max(newest);
        self.stat.mtime
    }

    pub fn get_dir(&self, dirname: &str) -> Option<&ChunkedFileFS> {
        let dirname = dirname.trim_start_matches('/');
        if dirname.is_empty() || dirname == "." {
            return Some(self);
        }
        let mut cur = self;
        for part in dirname.split('/').filter(|p| !p.is_empty()) {
            cur = cur.dirs.get(part)?;
        }
        Some(cur)
    }

    /// Resolve a path to a file node; directories come back as file-like
    /// nodes so callers can stat them. The empty path is the root directory.
    pub fn get_file(&self, absname: &str) -> Option<Node<'_>> {
        let absname = absname.trim_start_matches('/').trim_end_matches('/');
        if absname.is_empty() {
            return Some(Node::Dir(self));
        }
        let (dirname, filename) = match absname.rsplit_once('/') {
            Some((d, f)) => (d, f),
            None => ("", absname),
        };
        let dir = self.get_dir(dirname)?;
        if let Some(f) = dir.files.get(filename) {
            return Some(Node::File(f));
        }
        dir.dirs.get(filename).map(Node::Dir)
    }

    /// Immediate children of `prefix`: directories first, then files, each
    /// sorted by name ascending. `count == 0` returns everything.
    pub fn readdir(&self, prefix: &str, count: usize) -> Result<Vec<FileStat>> {
        let dir = self
            .get_dir(prefix)
            .ok_or_else(|| ServerError::NotFound(format!("No such directory: {}", prefix)))?;

        let mut res: Vec<FileStat> = Vec::with_capacity(dir.dirs.len() + dir.files.len());
        for d in dir.dirs.values() {
            res.push(d.stat.clone());
        }
        for f in dir.files.values() {
            res.push(f.stat.clone());
        }
        if count > 0 && res.len() > count {
            res.truncate(count);
        }
        Ok(res)
    }

    /// Depth-first traversal: the directory itself, each subdirectory
    /// recursively, then the files at this level.
    pub fn walk<'a>(
        &'a self,
        f: &mut dyn FnMut(&str, Node<'a>) -> Result<()>,
    ) -> Result<()> {
        f(&self.root, Node::Dir(self))?;
        for dir in self.dirs.values() {
            dir.walk(f)?;
        }
        for file in self.files.values() {
            f(&file.name, Node::File(file))?;
        }
        Ok(())
    }

    /// Deep copy of the tree with fresh reader state everywhere. Chunk lists
    /// are shared, not copied.
    pub fn clone_tree(&self) -> Self {
        Self {
            root: self.root.clone(),
            stat: self.stat.clone(),
            dirs: self
                .dirs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone_tree()))
                .collect(),
            files: self
                .files
                .iter()
                .map(|(k, v)| (k.clone(), v.clone_handle()))
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Chunk source over an in-memory map; good enough for reader tests.
    pub(crate) struct MapSource(pub Mutex<HashMap<ChunkHash, Vec<u8>>>);

    impl MapSource {
        pub(crate) fn new() -> Self {
            Self(Mutex::new(HashMap::new()))
        }

        pub(crate) fn add(&self, data: Vec<u8>) -> Chunk {
            let hash = ChunkHash::from_data(&data);
            let size = data.len() as i64;
            self.0.lock().insert(hash, data);
            Chunk { hash, size }
        }
    }

    impl ChunkSource for MapSource {
        fn open(&self, hash: &ChunkHash) -> Result<Box<dyn ReadSeek>> {
            let data = self
                .0
                .lock()
                .get(hash)
                .cloned()
                .ok_or_else(|| ServerError::NotFound(format!("chunk {}", hash)))?;
            Ok(Box::new(Cursor::new(data)))
        }
    }

    fn row(path: &str, file_size: i64, idx: i32, chunk: &Chunk) -> FsRow {
        FsRow {
            path: path.to_string(),
            file_size,
            mode: 0o644,
            updated_at: 1_700_000_000 + file_size,
            chunk_index: Some(idx),
            chunk_hash: Some(chunk.hash.to_hex()),
            chunk_size: Some(chunk.size),
        }
    }

    fn three_chunk_file(
        source: &Arc<MapSource>,
        sizes: &[usize],
    ) -> (Vec<u8>, Vec<FsRow>) {
        let mut all = Vec::new();
        let mut rows = Vec::new();
        let mut idx = 0;
        for &size in sizes {
            let data: Vec<u8> = (0..size).map(|i| ((all.len() + i) % 251) as u8).collect();
            all.extend_from_slice(&data);
            let chunk = source.add(data);
            rows.push(row("big.bin", sizes.iter().sum::<usize>() as i64, idx, &chunk));
            idx += 1;
        }
        (all, rows)
    }

    #[test]
    fn test_build_tree_and_lookup() {
        let source = Arc::new(MapSource::new());
        let c1 = source.add(b"hello ".to_vec());
        let c2 = source.add(b"world".to_vec());

        let rows = vec![
            row("a/b/inner.txt", 11, 0, &c1),
            row("a/b/inner.txt", 11, 1, &c2),
            row("top.txt", 6, 0, &c1),
        ];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();

        assert!(matches!(fs.get_file(""), Some(Node::Dir(_))));
        assert!(matches!(fs.get_file("a"), Some(Node::Dir(_))));
        assert!(matches!(fs.get_file("a/b/inner.txt"), Some(Node::File(_))));
        assert!(fs.get_file("a/missing").is_none());

        let inner = match fs.get_file("/a/b/inner.txt") {
            Some(Node::File(f)) => f,
            _ => panic!("expected file"),
        };
        assert_eq!(inner.size, 11);
        assert_eq!(inner.chunks().len(), 2);

        let mut handle = inner.clone_handle();
        let mut out = String::new();
        handle.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_readdir_sorted_dirs_first() {
        let source = Arc::new(MapSource::new());
        let c = source.add(b"x".to_vec());
        let rows = vec![
            row("zzz.txt", 1, 0, &c),
            row("beta/file.txt", 1, 0, &c),
            row("alpha/file.txt", 1, 0, &c),
            row("aaa.txt", 1, 0, &c),
        ];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();

        let listing = fs.readdir("", 0).unwrap();
        let names: Vec<&str> = listing.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "aaa.txt", "zzz.txt"]);
        assert!(listing[0].dir);
        assert_eq!(listing[0].size, 4096);
        assert_eq!(listing[0].mode, 0o775);

        let limited = fs.readdir("", 3).unwrap();
        assert_eq!(limited.len(), 3);

        assert!(fs.readdir("nope", 0).is_err());
    }

    #[test]
    fn test_walk_order() {
        let source = Arc::new(MapSource::new());
        let c = source.add(b"x".to_vec());
        let rows = vec![
            row("sub/two.txt", 1, 0, &c),
            row("one.txt", 1, 0, &c),
        ];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();

        let mut visited = Vec::new();
        fs.walk(&mut |path, node| {
            visited.push((path.to_string(), node.is_dir()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            visited,
            vec![
                ("".to_string(), true),
                ("sub".to_string(), true),
                ("sub/two.txt".to_string(), false),
                ("one.txt".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_seek_locates_chunk() {
        // Chunk layout mirroring the production chunk size at 1/100 scale.
        let source = Arc::new(MapSource::new());
        let (all, rows) = three_chunk_file(&source, &[10_240, 10_240, 9_520]);
        let fs = ChunkedFileFS::build(&rows, source).unwrap();
        let mut f = match fs.get_file("big.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };

        let pos = f.seek(SeekFrom::Start(15_000)).unwrap();
        assert_eq!(pos, 15_000);
        assert_eq!(f.current_chunk(), 1);
        assert_eq!(f.chunk_offset(), 4_760);

        let mut buf = [0u8; 100];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &all[15_000..15_100]);
    }

    #[test]
    fn test_read_spans_chunk_boundaries() {
        let source = Arc::new(MapSource::new());
        let (all, rows) = three_chunk_file(&source, &[100, 100, 50]);
        let fs = ChunkedFileFS::build(&rows, source).unwrap();
        let mut f = match fs.get_file("big.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };

        // Read the whole file through a buffer smaller than a chunk.
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, all);

        // seek(o) then read(n) equals the slice, for offsets at and around
        // chunk edges.
        for &offset in &[0usize, 1, 99, 100, 101, 199, 200, 249] {
            f.seek(SeekFrom::Start(offset as u64)).unwrap();
            let mut buf = vec![0u8; 30];
            let n = f.read(&mut buf).unwrap();
            let want = &all[offset..(offset + 30).min(all.len())];
            assert_eq!(&buf[..n.min(want.len())], &want[..n.min(want.len())]);
        }
    }

    #[test]
    fn test_seek_bounds() {
        let source = Arc::new(MapSource::new());
        let (_, rows) = three_chunk_file(&source, &[10, 10, 5]);
        let fs = ChunkedFileFS::build(&rows, source).unwrap();
        let mut f = match fs.get_file("big.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };

        assert!(f.seek(SeekFrom::Start(26)).is_err());
        assert!(f.seek(SeekFrom::End(1)).is_err());
        assert!(f.seek(SeekFrom::Current(-1)).is_err());

        assert_eq!(f.seek(SeekFrom::End(-5)).unwrap(), 20);
        assert_eq!(f.current_chunk(), 2);
        assert_eq!(f.chunk_offset(), 0);

        // Seeking exactly to EOF is allowed and reads nothing.
        assert_eq!(f.seek(SeekFrom::Start(25)).unwrap(), 25);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_clone_handles_are_independent() {
        let source = Arc::new(MapSource::new());
        let (all, rows) = three_chunk_file(&source, &[100, 100, 50]);
        let fs = ChunkedFileFS::build(&rows, source).unwrap();
        let cloned = fs.clone_tree();

        let mut a = match fs.get_file("big.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };
        let mut b = match cloned.get_file("big.bin") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };

        a.seek(SeekFrom::Start(200)).unwrap();
        let mut buf_b = vec![0u8; 50];
        b.read_exact(&mut buf_b).unwrap();
        assert_eq!(buf_b, &all[..50]);

        let mut buf_a = vec![0u8; 10];
        a.read_exact(&mut buf_a).unwrap();
        assert_eq!(buf_a, &all[200..210]);
    }

    #[test]
    fn test_empty_file() {
        let source = Arc::new(MapSource::new());
        let rows = vec![FsRow {
            path: "empty.txt".to_string(),
            file_size: 0,
            mode: 0o644,
            updated_at: 0,
            chunk_index: None,
            chunk_hash: None,
            chunk_size: None,
        }];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();
        let mut f = match fs.get_file("empty.txt") {
            Some(Node::File(f)) => f.clone_handle(),
            _ => panic!(),
        };
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
