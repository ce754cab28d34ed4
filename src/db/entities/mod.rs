//! SeaORM entities for the metadata store.

pub mod chunk;
pub mod dataset;
pub mod dataset_version;
pub mod file;
pub mod file_chunk;
