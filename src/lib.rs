//! Historian - industrial OPC UA data-acquisition worker.
//!
//! Subscribes to OPC UA servers on programmable controllers, validates and
//! enriches every value-change notification, and persists the resulting
//! time-series into a relational store. Transient database outages degrade
//! to an on-disk store-and-forward spool that is replayed on recovery, so
//! accepted samples are never lost.
//!
//! # Architecture
//!
//! - **Subscription**: one session per active machine behind the
//!   [`subscription::OpcTransport`] seam, with a simulator implementation
//!   for development and tests
//! - **Ingestion**: tag-cache resolution, enrichment, and pure validation
//!   rules between the transport callbacks and the sink
//! - **Batch sink**: non-blocking buffering with size- and time-triggered
//!   flushes, chunked bulk persistence, health tracking with exponential
//!   backoff
//! - **Store-and-forward**: durable JSON batch spool, drained in
//!   chronological order once the store heals
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use historian::{
//!     cache::TagCache,
//!     ingest::IngestionPipeline,
//!     sink::BatchSink,
//!     spool::Spool,
//!     storage::{self, MetadataRepository, SqlValueStore},
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = storage::connect("sqlite:historian.db?mode=rwc").await?;
//! storage::schema::init_schema(&pool).await?;
//!
//! let repository = Arc::new(MetadataRepository::new(pool.clone()));
//! let cache = Arc::new(TagCache::new(repository));
//! let spool = Arc::new(Spool::new("./store_forward", 100_000)?);
//! let store = Arc::new(SqlValueStore::new(pool));
//! let sink = Arc::new(BatchSink::new(store, spool));
//! let pipeline = IngestionPipeline::new(cache, sink);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod fanout;
pub mod ingest;
pub mod model;
pub mod sink;
pub mod spool;
pub mod storage;
pub mod subscription;
pub mod validation;
pub mod worker;

pub use cache::TagCache;
pub use config::{AppConfig, ConfigError};
pub use ingest::IngestionPipeline;
pub use model::{Machine, OpcQuality, Sample, StoredBatch, Tag, Value};
pub use sink::{BatchSink, SinkError};
pub use spool::{Spool, SpoolError};
pub use storage::{MetadataRepository, SqlValueStore, StoreError, ValueStore};
pub use subscription::{
    MonitoringSettings, OpcTransport, SimulatorTransport, SubscriptionError, SubscriptionManager,
};
pub use worker::Worker;
