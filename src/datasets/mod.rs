//! Manifest engine: version lifecycle and file upload/delete over the
//! metadata and chunk stores.
//!
//! Uploads split the body into fixed 1,024,000-byte chunks hashed by
//! SHA-512, so re-uploading the same bytes reproduces identical hashes and
//! the operation is idempotent. Committed versions are immutable; mutating
//! them fails with a conflict.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cache::{FsCache, FsKey};
use crate::chunk_store::{ChunkHash, ChunkStore, CHUNK_SIZE};
use crate::db::entities::{dataset, dataset_version, file};
use crate::db::MetaStore;
use crate::error::{Result, ServerError};
use crate::gate::Gate;
use crate::remote::{manifest_to_rows, HttpMasterClient, MasterChunks, RemoteBackend};
use crate::vfs::{ChunkedFileFS, LocalChunks};

/// Default mode for uploaded files; the HTTP surface carries no mode bits.
const DEFAULT_FILE_MODE: i32 = 0o644;

/// How many fresh versions get their trees pre-materialized after a listing.
const PREFETCH_VERSIONS: usize = 3;

#[derive(Clone)]
pub struct DatasetManager {
    meta: Arc<MetaStore>,
    store: Arc<ChunkStore>,
    cache: Arc<FsCache>,
    gate: Gate,
    master: Option<Arc<HttpMasterClient>>,
}

impl DatasetManager {
    pub fn new(
        meta: Arc<MetaStore>,
        store: Arc<ChunkStore>,
        cache: Arc<FsCache>,
        gate: Gate,
        master: Option<Arc<HttpMasterClient>>,
    ) -> Self {
        Self {
            meta,
            store,
            cache,
            gate,
            master,
        }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    // === version lifecycle ===

    pub async fn create_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        message: &str,
    ) -> Result<dataset_version::Model> {
        check_version_string(version)?;

        let _permit = self.gate.acquire().await;

        self.meta.get_or_create_dataset(ty, workspace, name).await?;
        if self.meta.get_version(ty, workspace, name, version).await?.is_some() {
            return Err(ServerError::Conflict(format!(
                "Version {} for {} {}/{} already exists",
                version, ty, workspace, name
            )));
        }
        self.meta
            .create_version(ty, workspace, name, version, message)
            .await
    }

    pub async fn get_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<dataset_version::Model> {
        self.meta
            .get_version(ty, workspace, name, version)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, version))
    }

    /// Newest-first version listing. The freshest trees get prefetched in
    /// the background so the next reads hit the cache.
    pub async fn list_versions(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
    ) -> Result<Vec<dataset_version::Model>> {
        let versions = self.meta.list_versions(ty, workspace, name).await?;

        let newest: Vec<String> = versions
            .iter()
            .take(PREFETCH_VERSIONS)
            .map(|v| v.version.clone())
            .collect();
        if !newest.is_empty() {
            let this = self.clone();
            let (ty, workspace, name) = (ty.to_string(), workspace.to_string(), name.to_string());
            tokio::spawn(async move {
                for version in newest {
                    if let Err(e) = this.get_fs(&ty, &workspace, &name, &version).await {
                        tracing::warn!(
                            "prefetch of {}/{}:{} failed: {}",
                            workspace,
                            name,
                            version,
                            e
                        );
                        return;
                    }
                    tracing::debug!("prefetched fs {}/{}:{}", workspace, name, version);
                }
            });
        }

        Ok(versions)
    }

    pub async fn commit_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        message: Option<&str>,
    ) -> Result<dataset_version::Model> {
        let _permit = self.gate.acquire().await;

        let current = self
            .meta
            .get_version(ty, workspace, name, version)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, version))?;
        if !current.editing {
            return Err(ServerError::Conflict(format!(
                "Version {} already committed",
                version
            )));
        }

        let committed = self
            .meta
            .commit_version(ty, workspace, name, version, message)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, version))?;
        self.cache
            .invalidate(&FsKey::new(ty, workspace, name, version));
        Ok(committed)
    }

    pub async fn clone_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<dataset_version::Model> {
        check_version_string(target)?;

        let _permit = self.gate.acquire().await;

        self.meta
            .get_version(ty, workspace, name, source)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, source))?;
        if self.meta.get_version(ty, workspace, name, target).await?.is_some() {
            return Err(ServerError::Conflict(format!(
                "Version {} for {} {}/{} already exists",
                target, ty, workspace, name
            )));
        }

        let cloned = self
            .meta
            .clone_version(ty, workspace, name, source, target, message)
            .await?;
        self.cache
            .invalidate(&FsKey::new(ty, workspace, name, target));
        Ok(cloned)
    }

    pub async fn delete_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<()> {
        let _permit = self.gate.acquire().await;

        self.meta
            .get_version(ty, workspace, name, version)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, version))?;
        self.meta
            .soft_delete_version(ty, workspace, name, version)
            .await?;
        self.cache
            .invalidate(&FsKey::new(ty, workspace, name, version));
        Ok(())
    }

    // === entities ===

    pub async fn list_datasets(&self, ty: &str, workspace: &str) -> Result<Vec<dataset::Model>> {
        self.meta.list_datasets(ty, workspace).await
    }

    pub async fn delete_dataset(&self, ty: &str, workspace: &str, name: &str) -> Result<()> {
        let _permit = self.gate.acquire().await;

        self.meta
            .get_dataset(ty, workspace, name)
            .await?
            .ok_or_else(|| {
                ServerError::NotFound(format!("{} {}/{} not found", ty, workspace, name))
            })?;
        self.meta.soft_delete_dataset(ty, workspace, name).await?;
        self.cache.invalidate_entity(ty, workspace, name);
        Ok(())
    }

    // === files ===

    /// Stream a file body into the version, splitting into fixed-size
    /// chunks. An existing file at the same path is replaced. Chunks shared
    /// with other files are written once; metadata lands in a single
    /// transaction, and chunks persisted before a failure stay behind for GC
    /// to judge.
    pub async fn upload_file<R: AsyncRead + Unpin + Send>(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        path: &str,
        mut body: R,
    ) -> Result<file::Model> {
        let path = normalize_path(path)?;
        self.require_editing(ty, workspace, name, version).await?;

        let mut chunks: Vec<(String, i64)> = Vec::new();
        let mut total: i64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = read_chunk(&mut body, &mut buf).await?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            let hash = ChunkHash::from_data(data);

            let check = self.store.check(&hash).await?;
            if !(check.exists && check.size == n as u64) {
                self.store.put(&hash, data, true).await?;
            }
            chunks.push((hash.to_hex(), n as i64));
            total += n as i64;

            if n < CHUNK_SIZE {
                break;
            }
        }

        let saved = self
            .meta
            .save_file_manifest(
                ty,
                workspace,
                name,
                version,
                &path,
                DEFAULT_FILE_MODE,
                total,
                &chunks,
            )
            .await?;
        self.meta
            .update_version_aggregates(ty, workspace, name, version)
            .await?;
        self.cache
            .invalidate(&FsKey::new(ty, workspace, name, version));
        Ok(saved)
    }

    pub async fn delete_file(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<()> {
        let path = normalize_path(path)?;
        self.require_editing(ty, workspace, name, version).await?;

        self.meta
            .remove_file(ty, workspace, name, version, &path)
            .await?;
        self.meta
            .update_version_aggregates(ty, workspace, name, version)
            .await?;
        self.cache
            .invalidate(&FsKey::new(ty, workspace, name, version));
        Ok(())
    }

    // === read path ===

    /// Materialized tree for one version, from cache when possible. The
    /// returned tree is always a private clone. When the local metadata
    /// lacks the version and masters are configured, the manifest is fetched
    /// upstream and chunk reads go through the master-backed source.
    pub async fn get_fs(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<ChunkedFileFS> {
        let key = FsKey::new(ty, workspace, name, version);
        if let Some(fs) = self.cache.get(&key) {
            return Ok(fs);
        }

        let fs = match self.meta.get_version(ty, workspace, name, version).await? {
            Some(_) => {
                let rows = self
                    .meta
                    .materialize_fs(ty, workspace, name, version)
                    .await?;
                ChunkedFileFS::build(&rows, Arc::new(LocalChunks(Arc::clone(&self.store))))?
            }
            None => {
                let Some(master) = &self.master else {
                    return Err(version_not_found(ty, workspace, name, version));
                };
                let manifest = master.get_manifest(ty, workspace, name, version).await?;
                let rows = manifest_to_rows(&manifest);
                let source = MasterChunks::new(
                    Arc::clone(master),
                    Arc::clone(&self.store),
                    tokio::runtime::Handle::current(),
                );
                ChunkedFileFS::build(&rows, Arc::new(source))?
            }
        };

        let fs = Arc::new(fs);
        let cloned = fs.clone_tree();
        self.cache.insert(key, fs);
        Ok(cloned)
    }

    async fn require_editing(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<dataset_version::Model> {
        let current = self
            .meta
            .get_version(ty, workspace, name, version)
            .await?
            .ok_or_else(|| version_not_found(ty, workspace, name, version))?;
        if !current.editing {
            return Err(ServerError::Conflict(format!(
                "Version {} already committed",
                version
            )));
        }
        Ok(current)
    }
}

fn version_not_found(ty: &str, workspace: &str, name: &str, version: &str) -> ServerError {
    ServerError::NotFound(format!(
        "Version {} not found for {} {}/{}",
        version, ty, workspace, name
    ))
}

/// A version string must be a semantic version, and must already be in
/// normalized form so two spellings never name different rows.
pub fn check_version_string(version: &str) -> Result<()> {
    let parsed = semver::Version::parse(version).map_err(|e| {
        ServerError::Validation(format!("{}: {}", version, e))
    })?;
    if parsed.to_string() != version {
        return Err(ServerError::Validation(format!(
            "Version must be a normalized semantic version; got {}, try {}",
            version, parsed
        )));
    }
    Ok(())
}

/// Strip the leading slash and reject empty or escaping paths.
fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(ServerError::Validation("Provide path".to_string()));
    }
    if trimmed.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(ServerError::Validation(format!("Invalid path: {}", path)));
    }
    Ok(trimmed.to_string())
}

/// Fill `buf` from the reader; short only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
