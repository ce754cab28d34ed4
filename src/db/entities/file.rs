//! File row: one path inside one version's manifest.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub dataset_type: String,
    pub workspace: String,
    pub dataset_name: String,
    pub version: String,
    /// Forward-slash relative path, no leading slash.
    pub path: String,
    pub size: i64,
    pub mode: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file_chunk::Entity")]
    FileChunk,
}

impl Related<super::file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
