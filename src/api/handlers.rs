use std::io::{self, Read, Write};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::TryStreamExt;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::cache::FsCache;
use crate::chunk_store::{ChunkHash, ChunkStore, SaveOutcome};
use crate::config::Config;
use crate::datasets::DatasetManager;
use crate::db::entities::dataset_version;
use crate::db::MetaStore;
use crate::dealer::DealerClient;
use crate::error::{Result, ServerError};
use crate::gate::Gate;
use crate::remote::{rows_to_manifest, HttpMasterClient, RemoteBackend, VersionInfo, VersionList};
use crate::vfs::{tar::write_tar, ChunkedFile, Node};

const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub manager: DatasetManager,
    pub meta: Arc<MetaStore>,
    pub store: Arc<ChunkStore>,
    pub master: Option<Arc<HttpMasterClient>>,
    pub dealer: Option<DealerClient>,
}

impl AppState {
    pub fn new(config: Config, db: DatabaseConnection) -> Result<Self> {
        let meta = Arc::new(MetaStore::new(db));
        let store = Arc::new(
            ChunkStore::new(config.data_dir.clone()).with_save_chunks(config.save_chunks),
        );
        let cache = Arc::new(FsCache::new(config.fs_cache_size));
        let gate = Gate::new(config.read_concurrency);

        let master = if config.has_masters() {
            Some(Arc::new(HttpMasterClient::new(
                &config.masters,
                &config.internal_key,
            )?))
        } else {
            None
        };
        let dealer = if config.auth_validation.is_empty() {
            None
        } else {
            Some(DealerClient::new(&config.auth_validation)?)
        };

        let manager = DatasetManager::new(
            Arc::clone(&meta),
            Arc::clone(&store),
            cache,
            gate,
            master.clone(),
        );

        Ok(Self {
            config,
            manager,
            meta,
            store,
            master,
            dealer,
        })
    }
}

#[derive(Deserialize)]
pub struct MessageQuery {
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct SaveChunkResponse {
    status: &'static str,
    size: u64,
}

#[derive(Serialize)]
struct EntityInfo {
    name: String,
    workspace: String,
    #[serde(rename = "type")]
    dataset_type: String,
}

#[derive(Serialize)]
pub struct EntityList {
    items: Vec<EntityInfo>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    path: String,
    size: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

fn parse_type(dtype: &str) -> Result<&str> {
    match dtype {
        "dataset" | "model" => Ok(dtype),
        other => Err(ServerError::Validation(format!(
            "Unknown entity type: {}",
            other
        ))),
    }
}

fn parse_hash(hash: &str) -> Result<ChunkHash> {
    ChunkHash::from_hex(hash)
        .ok_or_else(|| ServerError::Validation(format!("Malformed chunk hash: {}", hash)))
}

fn require_internal_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    if state.config.internal_key.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(INTERNAL_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == state.config.internal_key {
        Ok(())
    } else {
        Err(ServerError::Permission("bad internal key".to_string()))
    }
}

/// Delegate the permission decision to the dealer when one is configured.
async fn check_access(
    state: &AppState,
    headers: &HeaderMap,
    ty: &str,
    workspace: &str,
    name: &str,
    write: bool,
) -> Result<()> {
    let Some(dealer) = &state.dealer else {
        return Ok(());
    };
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    dealer
        .check_entity_access(ty, workspace, name, write, authorization)
        .await
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// === chunk endpoints ===

pub async fn check_chunk(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    require_internal_key(&state, &headers)?;
    let hash = parse_hash(&hash)?;
    let check = state.store.check(&hash).await?;
    let status = if check.exists {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, check.size)
        .body(Body::empty())
        .map_err(|e| ServerError::Internal(e.to_string()))?)
}

pub async fn download_chunk(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    require_internal_key(&state, &headers)?;
    let hash = parse_hash(&hash)?;
    let path = state.store.blob_path(&hash);
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ServerError::NotFound(format!("chunk {}", hash))
        } else {
            ServerError::Io(e)
        }
    })?;
    let size = file.metadata().await?.len();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ServerError::Internal(e.to_string()))?)
}

pub async fn save_chunk(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<SaveChunkResponse>> {
    require_internal_key(&state, &headers)?;
    let hash = parse_hash(&hash)?;

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other);
    let reader = StreamReader::new(stream);
    let saved = state.store.put(&hash, reader, true).await?;

    Ok(Json(SaveChunkResponse {
        status: match saved.outcome {
            SaveOutcome::Created => "created",
            SaveOutcome::Existed => "existed",
        },
        size: saved.size,
    }))
}

// === entity endpoints ===

pub async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<EntityList>> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, "", false).await?;

    let items = state
        .manager
        .list_datasets(ty, &workspace)
        .await?
        .into_iter()
        .map(|d| EntityInfo {
            name: d.name,
            workspace: d.workspace,
            dataset_type: d.dataset_type,
        })
        .collect();
    Ok(Json(EntityList { items }))
}

pub async fn delete_entity(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;
    state.manager.delete_dataset(ty, &workspace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === version endpoints ===

pub async fn create_version(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<dataset_version::Model>)> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;

    let created = state
        .manager
        .create_version(ty, &workspace, &name, &version, query.message.as_deref().unwrap_or(""))
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_version(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<dataset_version::Model>> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, false).await?;
    Ok(Json(
        state
            .manager
            .get_version(ty, &workspace, &name, &version)
            .await?,
    ))
}

pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<VersionList>> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, false).await?;

    let local = state.manager.list_versions(ty, &workspace, &name).await?;
    if local.is_empty() {
        if let Some(master) = &state.master {
            return Ok(Json(master.list_versions(ty, &workspace, &name).await?));
        }
    }
    Ok(Json(VersionList {
        versions: local.into_iter().map(VersionInfo::from).collect(),
    }))
}

pub async fn commit_version(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
) -> Result<Json<dataset_version::Model>> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;
    Ok(Json(
        state
            .manager
            .commit_version(ty, &workspace, &name, &version, query.message.as_deref())
            .await?,
    ))
}

pub async fn clone_version(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version, target)): Path<(String, String, String, String, String)>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<dataset_version::Model>)> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;

    let cloned = state
        .manager
        .clone_version(
            ty,
            &workspace,
            &name,
            &version,
            &target,
            query.message.as_deref().unwrap_or(""),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(cloned)))
}

pub async fn delete_version(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;
    state
        .manager
        .delete_version(ty, &workspace, &name, &version)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === file endpoints ===

pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version, path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<UploadResponse>> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let saved = state
        .manager
        .upload_file(ty, &workspace, &name, &version, &path, reader)
        .await?;
    Ok(Json(UploadResponse {
        path: saved.path,
        size: saved.size,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version, path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, true).await?;
    state
        .manager
        .delete_file(ty, &workspace, &name, &version, &path)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === read endpoints ===

pub async fn read_tree_root(
    state: State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    read_tree(
        state,
        Path((dtype, workspace, name, version, String::new())),
        headers,
    )
    .await
}

/// Directory paths answer with a listing, file paths with the bytes.
pub async fn read_tree(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version, path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, false).await?;

    let fs = state
        .manager
        .get_fs(ty, &workspace, &name, &version)
        .await?;

    match fs.get_file(&path) {
        None => Err(ServerError::NotFound(format!("No such file: {}", path))),
        Some(Node::Dir(_)) => {
            let listing = fs.readdir(&path, 0)?;
            Ok(Json(listing).into_response())
        }
        Some(Node::File(f)) => {
            let handle = f.clone_handle();
            let size = handle.size;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size.max(0))
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(file_body(handle))
                .map_err(|e| ServerError::Internal(e.to_string()))?)
        }
    }
}

/// Full manifest of a version, consumed by downstream instances.
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, false).await?;

    state
        .manager
        .get_version(ty, &workspace, &name, &version)
        .await?;
    let rows = state
        .meta
        .materialize_fs(ty, &workspace, &name, &version)
        .await?;
    Ok(Json(rows_to_manifest(&rows)).into_response())
}

pub async fn download_tar(
    State(state): State<Arc<AppState>>,
    Path((dtype, workspace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let ty = parse_type(&dtype)?;
    check_access(&state, &headers, ty, &workspace, &name, false).await?;

    let fs = state
        .manager
        .get_fs(ty, &workspace, &name, &version)
        .await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(8);
    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter { tx: tx.clone() };
        if let Err(e) = write_tar(&fs, writer) {
            tracing::error!("tar stream aborted: {}", e);
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/tar")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ServerError::Internal(e.to_string()))?)
}

/// Bridge: blocking chunk reads feeding an async response body.
fn file_body(mut file: ChunkedFile) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(8);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// `std::io::Write` adapter over an mpsc channel, used by the tar streamer.
struct ChannelWriter {
    tx: tokio::sync::mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
