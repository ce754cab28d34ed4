//! Federation: reading versions whose metadata lives on an upstream master.
//!
//! The capability is a trait so read paths can be served by the local
//! repository or by a master-backed strategy chosen at request time; the
//! storage contracts of the metadata store and manifest engine never see the
//! difference.

pub mod http;

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunk_store::{ChunkHash, ChunkStore};
use crate::db::FsRow;
use crate::error::Result;
use crate::vfs::{ChunkSource, ReadSeek};

pub use http::HttpMasterClient;

/// Wire form of one file inside a version manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: i64,
    pub mode: i32,
    pub mtime: i64,
    pub chunks: Vec<ManifestChunk>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub hash: String,
    pub size: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub files: Vec<ManifestFile>,
}

/// Version attributes as exchanged between instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub workspace: String,
    pub name: String,
    pub version: String,
    pub message: String,
    pub size_bytes: i64,
    pub file_count: i64,
    pub editing: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionList {
    pub versions: Vec<VersionInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkCheckInfo {
    pub hash: String,
    pub exists: bool,
    pub size: u64,
}

/// What a master instance offers to downstream readers.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn check_chunk(&self, hash: &str) -> Result<ChunkCheckInfo>;
    async fn download_chunk(&self, hash: &str) -> Result<Bytes>;
    async fn list_versions(&self, ty: &str, workspace: &str, name: &str) -> Result<VersionList>;
    async fn get_manifest(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<ManifestResponse>;
}

impl From<crate::db::entities::dataset_version::Model> for VersionInfo {
    fn from(m: crate::db::entities::dataset_version::Model) -> Self {
        Self {
            dataset_type: m.dataset_type,
            workspace: m.workspace,
            name: m.name,
            version: m.version,
            message: m.message,
            size_bytes: m.size,
            file_count: m.file_count,
            editing: m.editing,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

/// Group materialized rows back into the wire manifest shape.
pub fn rows_to_manifest(rows: &[FsRow]) -> ManifestResponse {
    let mut files: Vec<ManifestFile> = Vec::new();
    for row in rows {
        let start_new = files.last().map(|f| f.path != row.path).unwrap_or(true);
        if start_new {
            files.push(ManifestFile {
                path: row.path.clone(),
                size: row.file_size,
                mode: row.mode,
                mtime: row.updated_at,
                chunks: Vec::new(),
            });
        }
        if let (Some(hash), Some(size)) = (&row.chunk_hash, row.chunk_size) {
            files
                .last_mut()
                .expect("pushed above")
                .chunks
                .push(ManifestChunk {
                    hash: hash.clone(),
                    size,
                });
        }
    }
    ManifestResponse { files }
}

/// Flatten a wire manifest into the row shape the tree builder consumes.
pub fn manifest_to_rows(manifest: &ManifestResponse) -> Vec<FsRow> {
    let mut rows = Vec::new();
    for file in &manifest.files {
        if file.chunks.is_empty() {
            rows.push(FsRow {
                path: file.path.clone(),
                file_size: file.size,
                mode: file.mode,
                updated_at: file.mtime,
                chunk_index: None,
                chunk_hash: None,
                chunk_size: None,
            });
            continue;
        }
        for (index, chunk) in file.chunks.iter().enumerate() {
            rows.push(FsRow {
                path: file.path.clone(),
                file_size: file.size,
                mode: file.mode,
                updated_at: file.mtime,
                chunk_index: Some(index as i32),
                chunk_hash: Some(chunk.hash.clone()),
                chunk_size: Some(chunk.size),
            });
        }
    }
    rows
}

/// Chunk source for master-backed trees: local blobs win, misses are fetched
/// from the master and persisted for next time (unless the store is running
/// with chunk saving suppressed).
///
/// `open` blocks on the fetch, so readers over this source must run on
/// blocking threads; the vfs read path already does.
pub struct MasterChunks {
    client: Arc<HttpMasterClient>,
    store: Arc<ChunkStore>,
    handle: tokio::runtime::Handle,
}

impl MasterChunks {
    pub fn new(
        client: Arc<HttpMasterClient>,
        store: Arc<ChunkStore>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            client,
            store,
            handle,
        }
    }
}

impl ChunkSource for MasterChunks {
    fn open(&self, hash: &ChunkHash) -> Result<Box<dyn ReadSeek>> {
        if let Ok(file) = self.store.open(hash) {
            return Ok(Box::new(file));
        }

        let hex = hash.to_hex();
        let bytes = self.handle.block_on(self.client.download_chunk(&hex))?;
        if let Err(e) = self
            .handle
            .block_on(self.store.put(hash, bytes.as_ref(), false))
        {
            tracing::warn!("failed to pin chunk {} fetched from master: {}", hex, e);
        }
        Ok(Box::new(Cursor::new(bytes.to_vec())))
    }
}
