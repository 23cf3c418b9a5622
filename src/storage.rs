//! Relational storage layer.
//!
//! - [`connect`]: SQLite pool setup (WAL mode, per-operation acquisition)
//! - [`schema`]: DDL for the `Machines` / `Tags` / `TagValues` surface and
//!   the optional `TagValuesBulk` entry point
//! - [`MetadataRepository`]: read-only machine/tag snapshots with reload
//! - [`ValueStore`] / [`SqlValueStore`]: the bulk-or-fallback time-series
//!   insert contract consumed by the batch sink

mod db;
mod error;
mod repository;
pub mod schema;
mod value_store;

pub use db::connect;
pub use error::StoreError;
pub use repository::MetadataRepository;
pub use value_store::{SqlValueStore, ValueStore};
