//! Version row: an entity plus a semver string, with lifecycle flags.
//!
//! `editing=true` on creation; committing flips it off and freezes the
//! manifest. `deleted` is a soft flag; hard cleanup belongs to GC.

use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "dataset_versions")]
pub struct Model {
    #[sea_orm(primary_key)]
    #[serde(skip)]
    pub id: i64,
    #[sea_orm(column_name = "type")]
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub workspace: String,
    pub name: String,
    pub version: String,
    pub message: String,
    #[serde(rename = "size_bytes")]
    pub size: i64,
    pub file_count: i64,
    pub editing: bool,
    #[serde(skip)]
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
