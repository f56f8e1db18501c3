//! Stream context supplied by the hosting environment
//!
//! A supervisor launches one process per stream with `STREAMCONTEXT__*`
//! variables: the stream id, the stream kind, the backfill flag and the
//! JSON-encoded pipeline specification.

use crate::error::{StreamError, StreamResult};
use crate::spec::PipelineSpec;
use serde::Deserialize;

/// Default environment prefix
pub const STREAM_CONTEXT_PREFIX: &str = "STREAMCONTEXT";

#[derive(Debug, Clone, Deserialize)]
pub struct StreamContext {
    pub stream_id: String,
    pub stream_kind: String,
    #[serde(default)]
    pub backfill: bool,
    /// JSON body of the pipeline specification
    pub spec: String,
}

impl StreamContext {
    /// Load the context from `STREAMCONTEXT__*` variables
    pub fn from_env() -> StreamResult<Self> {
        Self::from_env_with_prefix(STREAM_CONTEXT_PREFIX)
    }

    pub fn from_env_with_prefix(prefix: &str) -> StreamResult<Self> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StreamError::config(format!("invalid stream context: {e}")))
    }

    /// Pipeline specification with the context's identity and backfill flag applied
    pub fn into_pipeline_spec(self) -> StreamResult<PipelineSpec> {
        let mut spec = PipelineSpec::from_json(&self.spec)?;
        if spec.source.kind() != self.stream_kind {
            return Err(StreamError::config(format!(
                "stream kind {} does not match source type {}",
                self.stream_kind,
                spec.source.kind()
            )));
        }
        spec.name = self.stream_id;
        spec.backfill = self.backfill;
        spec.validate()?;
        Ok(spec)
    }
}
