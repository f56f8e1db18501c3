//! Error types and failure classification for tributary pipelines
//!
//! Every fallible operation in a source, transform or sink returns a
//! [`StreamError`]. The error carries an [`ErrorKind`] produced by the layer that
//! raised it, and a decider maps that kind to a [`Directive`] without any
//! runtime type inspection.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Errors raised while running a stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// Operation did not complete in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Network, storage or database I/O failure
    #[error("io error: {0}")]
    Io(String),

    /// External system throttled the request
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// HTTP call returned an unexpected status
    #[error("http request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    /// A blob or remote resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema changed structurally after the stream started
    #[error("schema mismatch for {entity}: {message}")]
    SchemaMismatch { entity: String, message: String },

    /// Row field count does not match the sink schema
    #[error("schema inconsistent: expected {expected} fields, got {actual}")]
    SchemaInconsistent { expected: usize, actual: usize },

    /// Schema could never be obtained
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// A row is missing its merge or primary key
    #[error("missing merge key {field} in {entity}")]
    MissingMergeKey { entity: String, field: String },

    /// Source produced a type that cannot be mapped
    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    /// Remote job ended in a terminal failure state
    #[error("job {id} ended with status {status}")]
    JobFailed { id: String, status: String },

    /// Configuration rejected at construction time
    #[error("configuration error: {0}")]
    Config(String),

    /// Payload could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Data could not be encoded for storage
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Channel between operators closed unexpectedly
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`StreamError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Io,
    RateLimited,
    /// HTTP failure carrying its status code
    Http(u16),
    NotFound,
    SchemaMismatch,
    SchemaInconsistent,
    SchemaNotFound,
    DomainFatal,
    Config,
    Data,
    Internal,
}

/// What the running stage does after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Schedule a retry of the failed operation after a short delay
    Restart,
    /// Fail the whole stage
    Stop,
}

/// Delay used by sources before re-running a failed fetch
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

impl StreamError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Http { status, .. } => ErrorKind::Http(*status),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::SchemaInconsistent { .. } => ErrorKind::SchemaInconsistent,
            Self::SchemaNotFound(_) => ErrorKind::SchemaNotFound,
            Self::MissingMergeKey { .. } | Self::UnsupportedType(_) | Self::JobFailed { .. } => {
                ErrorKind::DomainFatal
            }
            Self::Config(_) => ErrorKind::Config,
            Self::Parse(_) | Self::Serialization(_) => ErrorKind::Data,
            Self::ChannelClosed(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the hosting layer should treat this outcome as a schema change
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn schema_mismatch(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            entity: entity.into(),
            message: msg.into(),
        }
    }
}

impl ErrorKind {
    /// Transient failures that are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Io | Self::RateLimited | Self::Http(429) | Self::Http(408)
        )
    }
}

/// Default decider shared by all sources
///
/// Transient categories restart the failed operation, everything else stops the stage.
pub fn classify(kind: ErrorKind) -> Directive {
    if kind.is_transient() {
        Directive::Restart
    } else {
        Directive::Stop
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(e.to_string()),
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<arrow_schema::ArrowError> for StreamError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_restart() {
        for err in [
            StreamError::Timeout("5s".into()),
            StreamError::io("connection reset"),
            StreamError::RateLimited("slow down".into()),
            StreamError::Http { status: 429, message: "too many".into() },
            StreamError::Http { status: 408, message: "request timeout".into() },
        ] {
            assert_eq!(classify(err.kind()), Directive::Restart, "{err}");
        }
    }

    #[test]
    fn test_other_errors_stop() {
        for err in [
            StreamError::Http { status: 500, message: "boom".into() },
            StreamError::Http { status: 401, message: "unauthorized".into() },
            StreamError::schema_mismatch("account", "field added"),
            StreamError::SchemaInconsistent { expected: 3, actual: 2 },
            StreamError::SchemaNotFound("model.json".into()),
            StreamError::MissingMergeKey { entity: "account".into(), field: "RECID".into() },
            StreamError::config("bad"),
            StreamError::parse("unbalanced quote"),
        ] {
            assert_eq!(classify(err.kind()), Directive::Stop, "{err}");
        }
    }

    #[test]
    fn test_schema_mismatch_is_distinguishable() {
        assert!(StreamError::schema_mismatch("x", "y").is_schema_mismatch());
        assert!(!StreamError::SchemaInconsistent { expected: 1, actual: 2 }.is_schema_mismatch());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: StreamError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err: StreamError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
