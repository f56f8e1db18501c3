//! # Tributary I/O - Source and Sink Implementations
//!
//! This crate provides the concrete sources and sinks of tributary pipelines,
//! plus the storage, SQL and HTTP plumbing they share.
//!
//! ## Features
//!
//! ### Data Sources
//! - **Blob listing**: emits a descriptor for every new blob under a prefix
//! - **CDM change feed**: base CSV files, then `ChangeFeed` files, typed by `model.json`
//! - **SQL Server**: change tracking with a version cursor, or whole-table reads
//! - **REST API**: templated requests with date windows, paging and auth
//! - **Salesforce**: Bulk API 2.0 query jobs
//!
//! ### Data Sinks
//! - **Parquet**: one row group per batch, hash-named parts and completion marker
//! - **JSON / multiline JSON**: one array or one document per line per part
//!
//! ### Shared Plumbing
//! - **Storage**: [`storage::BlobStorage`] over `object_store` (local, S3, Azure, memory)
//! - **Row groups**: typed rows to Arrow record batches
//! - **Metadata**: `metadata/partitions.json` written at sink start
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tributary_io::storage::{BlobStorage, ObjectStoreStorage};
//!
//! # async fn example() -> tributary_core::StreamResult<()> {
//! let storage: Arc<dyn BlobStorage> = Arc::new(ObjectStoreStorage::in_memory());
//! storage
//!     .save_bytes_as_blob(bytes::Bytes::from_static(b"{}"), "landing", "a.json")
//!     .await?;
//! let blobs = storage.list_blobs("landing").await?;
//! assert_eq!(blobs.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tributary_core::{Schema, StreamResult};

/// CDM folder change feed source
pub mod cdm;

/// Quoted CSV parsing and formatting
pub mod csv;

/// Partition metadata written next to sink output
pub mod metadata_writer;

/// Token bucket for outgoing API calls
pub mod rate_limit;

/// REST API source with paging and authentication
pub mod rest;

/// Arrow record batches built from typed rows
pub mod row_group;

/// Salesforce bulk query source
pub mod salesforce;

/// Buffered part-file sink shared by all formats
pub mod sink_common;

/// JSON and newline-delimited JSON sinks
pub mod sink_json;

/// Parquet sink
pub mod sink_parquet;

/// Blob listing source
pub mod source_blob_listing;

/// SQL Server sources
pub mod sql;

/// Blob storage capability
pub mod storage;

#[cfg(test)]
mod testing;

pub use sink_json::JsonSink;
pub use sink_parquet::ParquetSink;

/// Sources whose schema can be read before any data flows
///
/// Called once before the stream is wired, so a sink can be built for the
/// schema. Sources that refresh their schema later compare against the first
/// result and fail with a schema mismatch when it changes.
#[async_trait]
pub trait SchemaDiscovery: Send {
    async fn discover_schema(&mut self) -> StreamResult<Schema>;
}
