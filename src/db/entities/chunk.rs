//! Chunk row: a globally shared content-addressed blob reference.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "chunks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// 128-char lowercase hex SHA-512.
    #[sea_orm(unique)]
    pub hash: String,
    pub size: i64,
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
