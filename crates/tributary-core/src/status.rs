//! Stream status reporting
//!
//! When a stream stops because its source schema changed, the host reports it
//! so that an external operator can schedule a backfill.

use crate::error::StreamResult;
use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait StreamStatusReporter: Send + Sync {
    /// Mark the stream as stopped by a schema change
    async fn report_schema_mismatch(&self, stream_id: &str) -> StreamResult<()>;
}

/// Reporter that records the event in the logs only
#[derive(Debug, Default, Clone)]
pub struct TracingStatusReporter;

#[async_trait]
impl StreamStatusReporter for TracingStatusReporter {
    async fn report_schema_mismatch(&self, stream_id: &str) -> StreamResult<()> {
        warn!(stream_id, "schema mismatch reported, stream requires a backfill");
        Ok(())
    }
}
