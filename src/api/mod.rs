pub mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

pub use handlers::AppState;
use handlers::{
    check_chunk, clone_version, commit_version, create_version, delete_entity, delete_file,
    delete_version, download_chunk, download_tar, get_manifest, get_version, health,
    list_entities, list_versions, read_tree, read_tree_root, save_chunk, upload_file,
};

/// Build the full route table. Entity routes are shared between the
/// `dataset` and `model` namespaces; the handler validates the type segment.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/chunks/:hash",
            get(download_chunk).post(save_chunk).head(check_chunk),
        )
        .route("/:dtype/:workspace", get(list_entities))
        .route("/:dtype/:workspace/:name", delete(delete_entity))
        .route("/:dtype/:workspace/:name/versions", get(list_versions))
        .route(
            "/:dtype/:workspace/:name/versions/:version",
            post(create_version).get(get_version).delete(delete_version),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/commit",
            post(commit_version),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/clone/:target",
            post(clone_version),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/upload/*path",
            post(upload_file),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/files/*path",
            delete(delete_file),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/tree",
            get(read_tree_root),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/tree/*path",
            get(read_tree),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/manifest",
            get(get_manifest),
        )
        .route(
            "/:dtype/:workspace/:name/versions/:version/tar",
            get(download_tar),
        )
}
