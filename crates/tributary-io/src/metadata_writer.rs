//! Stream metadata emission
//!
//! Partitioning information travels next to the data as
//! `{path}/metadata/partitions.json`. A stream without partitions must not
//! leave a stale file behind, so the file is removed in that case.

use crate::storage::{blob_path, BlobStorage};
use bytes::Bytes;
use tracing::info;
use tributary_core::{StreamMetadata, StreamResult};

pub const METADATA_FOLDER: &str = "metadata";
pub const PARTITIONS_FILE: &str = "partitions.json";

/// Write or clear the partition metadata of a sink root
pub async fn write_stream_metadata(
    storage: &dyn BlobStorage,
    root: &str,
    metadata: Option<&StreamMetadata>,
) -> StreamResult<()> {
    let folder = blob_path(root, METADATA_FOLDER);
    match metadata.and_then(|m| m.partitions.as_ref()) {
        Some(partitions) => {
            let body = serde_json::to_vec_pretty(partitions)?;
            storage
                .save_bytes_as_blob(Bytes::from(body), &folder, PARTITIONS_FILE)
                .await?;
            info!(count = partitions.len(), folder = %folder, "partition metadata written");
        }
        None => storage.remove_blob(&folder, PARTITIONS_FILE).await?,
    }
    Ok(())
}
