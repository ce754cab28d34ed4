//! Metadata store: relational queries over entities, versions, files and
//! chunks.
//!
//! Multi-row updates (file replace, file delete, version clone) run inside a
//! single transaction; a failure rolls everything back and never unlinks
//! chunk blobs.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    DbErr, EntityTrait, FromQueryResult, QueryFilter, Set, Statement, TransactionTrait,
};

use super::entities::{chunk, dataset, dataset_version, file, file_chunk};
use super::now_ts;
use crate::error::{Result, ServerError};

/// One (file, chunk) row of a materialized manifest, ordered by
/// `(path, chunk_index)`. Chunk columns are NULL for empty files.
#[derive(Debug, Clone, FromQueryResult)]
pub struct FsRow {
    pub path: String,
    pub file_size: i64,
    pub mode: i32,
    pub updated_at: i64,
    pub chunk_index: Option<i32>,
    pub chunk_hash: Option<String>,
    pub chunk_size: Option<i64>,
}

/// A chunk row with no remaining file_chunks referents.
#[derive(Debug, Clone, FromQueryResult)]
pub struct OrphanChunk {
    pub id: i64,
    pub hash: String,
    pub size: i64,
}

pub struct MetaStore {
    db: DatabaseConnection,
}

impl MetaStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    // === datasets ===

    pub async fn get_dataset(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
    ) -> Result<Option<dataset::Model>> {
        Ok(dataset::Entity::find()
            .filter(dataset::Column::DatasetType.eq(ty))
            .filter(dataset::Column::Workspace.eq(workspace))
            .filter(dataset::Column::Name.eq(name))
            .filter(dataset::Column::Deleted.eq(false))
            .one(&self.db)
            .await?)
    }

    pub async fn get_or_create_dataset(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
    ) -> Result<dataset::Model> {
        if let Some(existing) = self.get_dataset(ty, workspace, name).await? {
            return Ok(existing);
        }
        let now = now_ts();
        Ok(dataset::ActiveModel {
            dataset_type: Set(ty.to_string()),
            workspace: Set(workspace.to_string()),
            name: Set(name.to_string()),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?)
    }

    pub async fn list_datasets(&self, ty: &str, workspace: &str) -> Result<Vec<dataset::Model>> {
        Ok(dataset::Entity::find()
            .filter(dataset::Column::DatasetType.eq(ty))
            .filter(dataset::Column::Workspace.eq(workspace))
            .filter(dataset::Column::Deleted.eq(false))
            .all(&self.db)
            .await?)
    }

    /// Soft-delete the entity and every one of its versions.
    pub async fn soft_delete_dataset(&self, ty: &str, workspace: &str, name: &str) -> Result<()> {
        let now = now_ts();
        self.db
            .execute(self.stmt(
                "UPDATE datasets SET deleted = 1, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND deleted = 0",
                [now.into(), ty.into(), workspace.into(), name.into()],
            ))
            .await?;
        self.db
            .execute(self.stmt(
                "UPDATE dataset_versions SET deleted = 1, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND deleted = 0",
                [now.into(), ty.into(), workspace.into(), name.into()],
            ))
            .await?;
        Ok(())
    }

    pub async fn recover_dataset(&self, ty: &str, workspace: &str, name: &str) -> Result<()> {
        self.db
            .execute(self.stmt(
                "UPDATE datasets SET deleted = 0, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ?",
                [now_ts().into(), ty.into(), workspace.into(), name.into()],
            ))
            .await?;
        Ok(())
    }

    // === versions ===

    pub async fn create_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        message: &str,
    ) -> Result<dataset_version::Model> {
        let now = now_ts();
        let res = dataset_version::ActiveModel {
            dataset_type: Set(ty.to_string()),
            workspace: Set(workspace.to_string()),
            name: Set(name.to_string()),
            version: Set(version.to_string()),
            message: Set(message.to_string()),
            size: Set(0),
            file_count: Set(0),
            editing: Set(true),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await;

        match res {
            Ok(model) => Ok(model),
            Err(e) if is_unique_violation(&e) => Err(ServerError::Conflict(format!(
                "Version {} for {} {}/{} already exists",
                version, ty, workspace, name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<dataset_version::Model>> {
        Ok(dataset_version::Entity::find()
            .filter(dataset_version::Column::DatasetType.eq(ty))
            .filter(dataset_version::Column::Workspace.eq(workspace))
            .filter(dataset_version::Column::Name.eq(name))
            .filter(dataset_version::Column::Version.eq(version))
            .filter(dataset_version::Column::Deleted.eq(false))
            .one(&self.db)
            .await?)
    }

    /// Live versions for an entity, newest first (semver descending; strings
    /// that fail to parse sort last, lexicographically).
    pub async fn list_versions(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
    ) -> Result<Vec<dataset_version::Model>> {
        let mut versions = dataset_version::Entity::find()
            .filter(dataset_version::Column::DatasetType.eq(ty))
            .filter(dataset_version::Column::Workspace.eq(workspace))
            .filter(dataset_version::Column::Name.eq(name))
            .filter(dataset_version::Column::Deleted.eq(false))
            .all(&self.db)
            .await?;
        order_versions(&mut versions);
        Ok(versions)
    }

    /// Flip `editing` off, optionally updating the message.
    pub async fn commit_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        message: Option<&str>,
    ) -> Result<Option<dataset_version::Model>> {
        let now = now_ts();
        let stmt = match message {
            Some(msg) => self.stmt(
                "UPDATE dataset_versions SET editing = 0, message = ?, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND version = ? AND deleted = 0",
                [
                    msg.into(),
                    now.into(),
                    ty.into(),
                    workspace.into(),
                    name.into(),
                    version.into(),
                ],
            ),
            None => self.stmt(
                "UPDATE dataset_versions SET editing = 0, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND version = ? AND deleted = 0",
                [
                    now.into(),
                    ty.into(),
                    workspace.into(),
                    name.into(),
                    version.into(),
                ],
            ),
        };
        self.db.execute(stmt).await?;
        self.get_version(ty, workspace, name, version).await
    }

    pub async fn soft_delete_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<()> {
        self.db
            .execute(self.stmt(
                "UPDATE dataset_versions SET deleted = 1, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND version = ?",
                [
                    now_ts().into(),
                    ty.into(),
                    workspace.into(),
                    name.into(),
                    version.into(),
                ],
            ))
            .await?;
        Ok(())
    }

    pub async fn recover_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<()> {
        let res = self
            .db
            .execute(self.stmt(
                "UPDATE dataset_versions SET deleted = 0, updated_at = ? \
                 WHERE type = ? AND workspace = ? AND name = ? AND version = ?",
                [
                    now_ts().into(),
                    ty.into(),
                    workspace.into(),
                    name.into(),
                    version.into(),
                ],
            ))
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ServerError::Conflict(format!(
                "A live version {} already exists for {}/{}",
                version, workspace, name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Recompute `size` and `file_count` from the `files` table.
    pub async fn update_version_aggregates(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<()> {
        let sql = "UPDATE dataset_versions SET \
            size = COALESCE((SELECT SUM(files.size) FROM files \
                WHERE files.dataset_type = dataset_versions.type \
                  AND files.workspace = dataset_versions.workspace \
                  AND files.dataset_name = dataset_versions.name \
                  AND files.version = dataset_versions.version), 0), \
            file_count = (SELECT COUNT(*) FROM files \
                WHERE files.dataset_type = dataset_versions.type \
                  AND files.workspace = dataset_versions.workspace \
                  AND files.dataset_name = dataset_versions.name \
                  AND files.version = dataset_versions.version), \
            updated_at = ? \
            WHERE type = ? AND workspace = ? AND name = ? AND version = ?";
        self.db
            .execute(self.stmt(
                sql,
                [
                    now_ts().into(),
                    ty.into(),
                    workspace.into(),
                    name.into(),
                    version.into(),
                ],
            ))
            .await?;
        Ok(())
    }

    // === files ===

    pub async fn get_file(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<Option<file::Model>> {
        Ok(file::Entity::find()
            .filter(file::Column::DatasetType.eq(ty))
            .filter(file::Column::Workspace.eq(workspace))
            .filter(file::Column::DatasetName.eq(name))
            .filter(file::Column::Version.eq(version))
            .filter(file::Column::Path.eq(path))
            .one(&self.db)
            .await?)
    }

    /// Persist one file's manifest, replacing any prior file at the same
    /// path. The file row, chunk upserts and ordered file_chunks rows all
    /// land in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_file_manifest(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        path: &str,
        mode: i32,
        size: i64,
        chunks: &[(String, i64)],
    ) -> Result<file::Model> {
        let txn = self.db.begin().await?;

        if let Some(prior) = file::Entity::find()
            .filter(file::Column::DatasetType.eq(ty))
            .filter(file::Column::Workspace.eq(workspace))
            .filter(file::Column::DatasetName.eq(name))
            .filter(file::Column::Version.eq(version))
            .filter(file::Column::Path.eq(path))
            .one(&txn)
            .await?
        {
            file_chunk::Entity::delete_many()
                .filter(file_chunk::Column::FileId.eq(prior.id))
                .exec(&txn)
                .await?;
            file::Entity::delete_by_id(prior.id).exec(&txn).await?;
        }

        let now = now_ts();
        let saved = file::ActiveModel {
            dataset_type: Set(ty.to_string()),
            workspace: Set(workspace.to_string()),
            dataset_name: Set(name.to_string()),
            version: Set(version.to_string()),
            path: Set(path.to_string()),
            size: Set(size),
            mode: Set(mode),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut rows = Vec::with_capacity(chunks.len());
        for (index, (hash, chunk_size)) in chunks.iter().enumerate() {
            let chunk_id = get_or_create_chunk(&txn, hash, *chunk_size).await?;
            rows.push(file_chunk::ActiveModel {
                file_id: Set(saved.id),
                chunk_id: Set(chunk_id),
                chunk_index: Set(index as i32),
                ..Default::default()
            });
        }
        if !rows.is_empty() {
            file_chunk::Entity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(saved)
    }

    /// Remove one file and its chunk mapping in a single transaction.
    /// Orphaned chunk rows are left for GC.
    pub async fn remove_file(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<()> {
        let txn = self.db.begin().await?;

        let Some(existing) = file::Entity::find()
            .filter(file::Column::DatasetType.eq(ty))
            .filter(file::Column::Workspace.eq(workspace))
            .filter(file::Column::DatasetName.eq(name))
            .filter(file::Column::Version.eq(version))
            .filter(file::Column::Path.eq(path))
            .one(&txn)
            .await?
        else {
            return Err(ServerError::NotFound(format!(
                "File {} for {}/{}:{} not found",
                path, workspace, name, version
            )));
        };

        file_chunk::Entity::delete_many()
            .filter(file_chunk::Column::FileId.eq(existing.id))
            .exec(&txn)
            .await?;
        file::Entity::delete_by_id(existing.id).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    /// Create `target` as an editing copy of `source`: a new version row plus
    /// copies of every file and file_chunks row, pointing at the same chunk
    /// rows. No chunk bytes move.
    #[allow(clippy::too_many_arguments)]
    pub async fn clone_version(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<dataset_version::Model> {
        let txn = self.db.begin().await?;
        let now = now_ts();

        let created = dataset_version::ActiveModel {
            dataset_type: Set(ty.to_string()),
            workspace: Set(workspace.to_string()),
            name: Set(name.to_string()),
            version: Set(target.to_string()),
            message: Set(message.to_string()),
            size: Set(0),
            file_count: Set(0),
            editing: Set(true),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServerError::Conflict(format!(
                    "Version {} for {} {}/{} already exists",
                    target, ty, workspace, name
                ))
            } else {
                e.into()
            }
        })?;

        let source_files = file::Entity::find()
            .filter(file::Column::DatasetType.eq(ty))
            .filter(file::Column::Workspace.eq(workspace))
            .filter(file::Column::DatasetName.eq(name))
            .filter(file::Column::Version.eq(source))
            .all(&txn)
            .await?;

        for src in source_files {
            let copy = file::ActiveModel {
                dataset_type: Set(src.dataset_type.clone()),
                workspace: Set(src.workspace.clone()),
                dataset_name: Set(src.dataset_name.clone()),
                version: Set(target.to_string()),
                path: Set(src.path.clone()),
                size: Set(src.size),
                mode: Set(src.mode),
                created_at: Set(now),
                updated_at: Set(src.updated_at),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let mapping = file_chunk::Entity::find()
                .filter(file_chunk::Column::FileId.eq(src.id))
                .all(&txn)
                .await?;
            let rows: Vec<file_chunk::ActiveModel> = mapping
                .into_iter()
                .map(|fc| file_chunk::ActiveModel {
                    file_id: Set(copy.id),
                    chunk_id: Set(fc.chunk_id),
                    chunk_index: Set(fc.chunk_index),
                    ..Default::default()
                })
                .collect();
            if !rows.is_empty() {
                file_chunk::Entity::insert_many(rows).exec(&txn).await?;
            }
        }

        txn.commit().await?;

        self.update_version_aggregates(ty, workspace, name, target)
            .await?;
        Ok(self
            .get_version(ty, workspace, name, target)
            .await?
            .unwrap_or(created))
    }

    // === manifest materialization ===

    /// Rows for rebuilding a version's filesystem tree, ordered by
    /// `(path, chunk_index)`.
    pub async fn materialize_fs(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<FsRow>> {
        let sql = "SELECT f.path AS path, f.size AS file_size, f.mode AS mode, \
                   f.updated_at AS updated_at, fc.chunk_index AS chunk_index, \
                   c.hash AS chunk_hash, c.size AS chunk_size \
            FROM files f \
            LEFT JOIN file_chunks fc ON fc.file_id = f.id \
            LEFT JOIN chunks c ON c.id = fc.chunk_id \
            WHERE f.dataset_type = ? AND f.workspace = ? \
              AND f.dataset_name = ? AND f.version = ? \
            ORDER BY f.path, fc.chunk_index";
        Ok(FsRow::find_by_statement(self.stmt(
            sql,
            [ty.into(), workspace.into(), name.into(), version.into()],
        ))
        .all(&self.db)
        .await?)
    }

    // === garbage collection queries ===

    /// Hard-delete file and file_chunks rows belonging to soft-deleted
    /// versions. Returns the number of file rows removed.
    pub async fn cleanup_deleted_versions(&self) -> Result<u64> {
        let exists_clause = "EXISTS (SELECT 1 FROM dataset_versions v \
            WHERE v.deleted = 1 AND v.type = files.dataset_type \
              AND v.workspace = files.workspace AND v.name = files.dataset_name \
              AND v.version = files.version \
              AND NOT EXISTS (SELECT 1 FROM dataset_versions live \
                  WHERE live.deleted = 0 AND live.type = files.dataset_type \
                    AND live.workspace = files.workspace \
                    AND live.name = files.dataset_name \
                    AND live.version = files.version))";

        self.db
            .execute(self.stmt(
                &format!(
                    "DELETE FROM file_chunks WHERE file_id IN \
                     (SELECT files.id FROM files WHERE {})",
                    exists_clause
                ),
                [],
            ))
            .await?;
        let res = self
            .db
            .execute(self.stmt(
                &format!("DELETE FROM files WHERE {}", exists_clause),
                [],
            ))
            .await?;
        Ok(res.rows_affected())
    }

    /// Chunk rows no file references anymore (outer join).
    pub async fn list_orphan_chunks(&self) -> Result<Vec<OrphanChunk>> {
        let sql = "SELECT c.id AS id, c.hash AS hash, c.size AS size \
            FROM chunks c \
            LEFT JOIN file_chunks fc ON fc.chunk_id = c.id \
            WHERE fc.id IS NULL";
        Ok(OrphanChunk::find_by_statement(self.stmt(sql, [])).all(&self.db).await?)
    }

    /// Tolerates a row already removed by a concurrent sweep.
    pub async fn delete_chunk_row(&self, id: i64) -> Result<()> {
        chunk::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn count_chunks(&self) -> Result<u64> {
        use sea_orm::PaginatorTrait;
        Ok(chunk::Entity::find().count(&self.db).await?)
    }

    fn stmt<I>(&self, sql: &str, values: I) -> Statement
    where
        I: IntoIterator<Item = sea_orm::Value>,
    {
        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }
}

async fn get_or_create_chunk(txn: &DatabaseTransaction, hash: &str, size: i64) -> Result<i64> {
    if let Some(existing) = chunk::Entity::find()
        .filter(chunk::Column::Hash.eq(hash))
        .one(txn)
        .await?
    {
        if existing.size != size {
            return Err(ServerError::CorruptChunk {
                declared: format!("{} ({} bytes)", hash, size),
                computed: format!("{} bytes on record", existing.size),
            });
        }
        return Ok(existing.id);
    }
    let created = chunk::ActiveModel {
        hash: Set(hash.to_string()),
        size: Set(size),
        ..Default::default()
    }
    .insert(txn)
    .await?;
    Ok(created.id)
}

fn is_unique_violation(e: &DbErr) -> bool {
    e.to_string().contains("UNIQUE")
}

/// Semver descending; unparseable versions after all valid ones, sorted
/// lexicographically.
pub fn order_versions(versions: &mut [dataset_version::Model]) {
    versions.sort_by(|a, b| compare_version_strings(&a.version, &b.version));
}

fn compare_version_strings(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => vb.cmp(&va),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> MetaStore {
        MetaStore::new(db::connect("sqlite::memory:").await.unwrap())
    }

    fn h(label: &str) -> String {
        // Deterministic 128-char fake hash for row-level tests.
        let mut s: String = label.bytes().map(|b| format!("{:02x}", b)).collect();
        while s.len() < 128 {
            let repeat = s.clone();
            s.push_str(&repeat);
        }
        s.truncate(128);
        s
    }

    #[tokio::test]
    async fn test_version_lifecycle() {
        let meta = store().await;
        meta.get_or_create_dataset("dataset", "ws", "d").await.unwrap();

        let v = meta
            .create_version("dataset", "ws", "d", "1.0.0", "first")
            .await
            .unwrap();
        assert!(v.editing);

        // Duplicate live version conflicts.
        let err = meta
            .create_version("dataset", "ws", "d", "1.0.0", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));

        let committed = meta
            .commit_version("dataset", "ws", "d", "1.0.0", Some("done"))
            .await
            .unwrap()
            .unwrap();
        assert!(!committed.editing);
        assert_eq!(committed.message, "done");

        meta.soft_delete_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        assert!(meta
            .get_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap()
            .is_none());

        meta.recover_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        assert!(meta
            .get_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_dataset_soft_delete_and_recover() {
        let meta = store().await;
        meta.get_or_create_dataset("model", "ws", "m").await.unwrap();
        meta.create_version("model", "ws", "m", "1.0.0", "").await.unwrap();

        meta.soft_delete_dataset("model", "ws", "m").await.unwrap();
        assert!(meta.get_dataset("model", "ws", "m").await.unwrap().is_none());
        // Versions go down with the entity.
        assert!(meta
            .get_version("model", "ws", "m", "1.0.0")
            .await
            .unwrap()
            .is_none());

        meta.recover_dataset("model", "ws", "m").await.unwrap();
        assert!(meta.get_dataset("model", "ws", "m").await.unwrap().is_some());
        meta.recover_version("model", "ws", "m", "1.0.0").await.unwrap();
        assert!(meta
            .get_version("model", "ws", "m", "1.0.0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_version_ordering() {
        let meta = store().await;
        for v in ["1.0.0", "1.10.0", "1.2.0", "not-a-version", "2.0.0-rc.1"] {
            meta.create_version("dataset", "ws", "d", v, "").await.unwrap();
        }
        let versions = meta.list_versions("dataset", "ws", "d").await.unwrap();
        let order: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(
            order,
            vec!["2.0.0-rc.1", "1.10.0", "1.2.0", "1.0.0", "not-a-version"]
        );
    }

    #[tokio::test]
    async fn test_manifest_and_aggregates() {
        let meta = store().await;
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();

        meta.save_file_manifest(
            "dataset",
            "ws",
            "d",
            "1.0.0",
            "a/b.bin",
            0o644,
            30,
            &[(h("one"), 10), (h("two"), 20)],
        )
        .await
        .unwrap();
        meta.save_file_manifest(
            "dataset",
            "ws",
            "d",
            "1.0.0",
            "c.bin",
            0o644,
            10,
            &[(h("one"), 10)],
        )
        .await
        .unwrap();

        meta.update_version_aggregates("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        let v = meta
            .get_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v.size, 40);
        assert_eq!(v.file_count, 2);

        // Shared chunk produced one row, not two.
        assert_eq!(meta.count_chunks().await.unwrap(), 2);

        let rows = meta
            .materialize_fs("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].path, "a/b.bin");
        assert_eq!(rows[0].chunk_index, Some(0));
        assert_eq!(rows[1].chunk_index, Some(1));
        assert_eq!(rows[2].path, "c.bin");
    }

    #[tokio::test]
    async fn test_replace_file_at_path() {
        let meta = store().await;
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();

        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.0", "f.bin", 0o644, 10, &[(h("old"), 10)],
        )
        .await
        .unwrap();
        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.0", "f.bin", 0o644, 20, &[(h("new"), 20)],
        )
        .await
        .unwrap();

        let rows = meta
            .materialize_fs("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_size, 20);
        assert_eq!(rows[0].chunk_hash.as_deref(), Some(h("new").as_str()));

        // The replaced chunk row is orphaned, not gone.
        let orphans = meta.list_orphan_chunks().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].hash, h("old"));
    }

    #[tokio::test]
    async fn test_clone_shares_chunk_rows() {
        let meta = store().await;
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();
        meta.save_file_manifest(
            "dataset",
            "ws",
            "d",
            "1.0.0",
            "f.bin",
            0o644,
            30,
            &[(h("one"), 10), (h("two"), 20)],
        )
        .await
        .unwrap();

        let cloned = meta
            .clone_version("dataset", "ws", "d", "1.0.0", "1.0.1", "clone")
            .await
            .unwrap();
        assert!(cloned.editing);
        assert_eq!(cloned.size, 30);
        assert_eq!(cloned.file_count, 1);

        // Same chunk table, doubled mapping.
        assert_eq!(meta.count_chunks().await.unwrap(), 2);
        let rows = meta
            .materialize_fs("dataset", "ws", "d", "1.0.1")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        // Mutating the clone leaves the source untouched.
        meta.remove_file("dataset", "ws", "d", "1.0.1", "f.bin")
            .await
            .unwrap();
        assert_eq!(
            meta.materialize_fs("dataset", "ws", "d", "1.0.0")
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(meta.list_orphan_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_deleted_versions() {
        let meta = store().await;
        meta.create_version("dataset", "ws", "d", "1.0.0", "").await.unwrap();
        meta.save_file_manifest(
            "dataset", "ws", "d", "1.0.0", "f.bin", 0o644, 10, &[(h("only"), 10)],
        )
        .await
        .unwrap();

        meta.soft_delete_version("dataset", "ws", "d", "1.0.0")
            .await
            .unwrap();
        let removed = meta.cleanup_deleted_versions().await.unwrap();
        assert_eq!(removed, 1);

        let orphans = meta.list_orphan_chunks().await.unwrap();
        assert_eq!(orphans.len(), 1);
        meta.delete_chunk_row(orphans[0].id).await.unwrap();
        assert_eq!(meta.count_chunks().await.unwrap(), 0);
    }
}
