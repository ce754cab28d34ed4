//! Content-addressed chunk store.
//!
//! Blobs are keyed by the SHA-512 of their bytes and live under
//! `<data_dir>/<hash[0..8]>/<hash[8..]>`. Writes land in a temp sibling and
//! are renamed into place, so concurrent saves of the same chunk converge on
//! identical content.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::config::CHUNK_DIR_LENGTH;
use crate::error::{Result, ServerError};

/// Fixed chunk size for file splitting; the last chunk of a file is the
/// remainder.
pub const CHUNK_SIZE: usize = 1_024_000;

/// Copy window for streaming saves.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Content hash (512-bit).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash([u8; 64]);

impl ChunkHash {
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 128 {
            return None;
        }
        let mut hash = [0u8; 64];
        for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(pair).ok()?;
            if s.chars().any(|c| c.is_ascii_uppercase()) {
                return None;
            }
            hash[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self(hash))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Result of a `check` call.
#[derive(Clone, Copy, Debug)]
pub struct ChunkCheck {
    pub exists: bool,
    pub size: u64,
}

/// Outcome of a `put` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Existed,
}

#[derive(Clone, Copy, Debug)]
pub struct SaveResult {
    pub outcome: SaveOutcome,
    pub size: u64,
}

/// Hash-addressed blob store on the local filesystem.
pub struct ChunkStore {
    data_dir: PathBuf,
    /// When false the store verifies and drains incoming bytes but never
    /// persists them (federated read-through mode).
    save_chunks: bool,
    tmp_counter: AtomicU64,
}

impl ChunkStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            save_chunks: true,
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn with_save_chunks(mut self, save: bool) -> Self {
        self.save_chunks = save;
        self
    }

    /// On-disk location of a blob, sharded by the first 8 hex chars.
    pub fn blob_path(&self, hash: &ChunkHash) -> PathBuf {
        let hex = hash.to_hex();
        self.data_dir
            .join(&hex[..CHUNK_DIR_LENGTH])
            .join(&hex[CHUNK_DIR_LENGTH..])
    }

    fn tmp_path(&self, hash: &ChunkHash) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut path = self.blob_path(hash).into_os_string();
        path.push(format!(".tmp.{}.{}", std::process::id(), n));
        PathBuf::from(path)
    }

    /// Stream `reader` into the store under `hash`.
    ///
    /// When `verify` is set the incoming bytes are re-hashed and a mismatch
    /// against the declared hash fails with `CorruptChunk`. An existing blob
    /// short-circuits the write; the stream is still drained (and verified)
    /// so the connection stays usable, and a size disagreement between the
    /// stream and the blob on disk is reported as corruption.
    pub async fn put<R: AsyncRead + Unpin>(
        &self,
        hash: &ChunkHash,
        mut reader: R,
        verify: bool,
    ) -> Result<SaveResult> {
        let existing = self.check(hash).await?;
        if existing.exists || !self.save_chunks {
            let streamed = drain_and_verify(hash, &mut reader, verify).await?;
            if existing.exists && streamed != existing.size {
                return Err(ServerError::CorruptChunk {
                    declared: format!("{} ({} bytes)", hash, existing.size),
                    computed: format!("{} bytes streamed", streamed),
                });
            }
            return Ok(SaveResult {
                outcome: SaveOutcome::Existed,
                size: if existing.exists { existing.size } else { streamed },
            });
        }

        let final_path = self.blob_path(hash);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.tmp_path(hash);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = verify.then(Sha512::new);
        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            if let Err(e) = file.write_all(&buf[..n]).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            written += n as u64;
        }
        file.flush().await?;
        drop(file);

        if let Some(h) = hasher {
            let computed = ChunkHash(h.finalize().into());
            if computed != *hash {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(ServerError::CorruptChunk {
                    declared: hash.to_hex(),
                    computed: computed.to_hex(),
                });
            }
        }

        tokio::fs::rename(&tmp, &final_path).await?;

        Ok(SaveResult {
            outcome: SaveOutcome::Created,
            size: written,
        })
    }

    /// Existence and size by `stat`; never opens the blob.
    pub async fn check(&self, hash: &ChunkHash) -> Result<ChunkCheck> {
        match tokio::fs::metadata(self.blob_path(hash)).await {
            Ok(meta) => Ok(ChunkCheck {
                exists: true,
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChunkCheck {
                exists: false,
                size: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for random-access reads.
    ///
    /// Synchronous on purpose: chunk readers run on blocking threads (vfs
    /// reads, tar streaming).
    pub fn open(&self, hash: &ChunkHash) -> Result<std::fs::File> {
        std::fs::File::open(self.blob_path(hash)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerError::NotFound(format!("chunk {}", hash))
            } else {
                e.into()
            }
        })
    }

    /// Unlink a blob; missing file counts as success.
    pub async fn delete(&self, hash: &ChunkHash) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn drain_and_verify<R: AsyncRead + Unpin>(
    hash: &ChunkHash,
    reader: &mut R,
    verify: bool,
) -> Result<u64> {
    let mut hasher = verify.then(Sha512::new);
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        total += n as u64;
    }
    if let Some(h) = hasher {
        let computed = ChunkHash(h.finalize().into());
        if computed != *hash {
            return Err(ServerError::CorruptChunk {
                declared: hash.to_hex(),
                computed: computed.to_hex(),
            });
        }
    }
    Ok(total)
}
