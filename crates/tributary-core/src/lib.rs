//! # Tributary Core - streaming ingestion core library
//!
//! This crate provides the foundational types, traits, and abstractions for
//! tributary pipelines: the messaging system between operators, the
//! demand-driven source protocol, the row and schema model, error
//! classification, and the pipeline configuration.
//!
//! ## Key Components
//!
//! - **Message System**: typed messages flowing over bounded channels; a free
//!   channel slot is the demand signal of the downstream operator
//! - **Operator Traits**: Source, Transform, and Sink abstractions
//! - **Polling Protocol**: [`polling::PollingSource`] state machines driven by
//!   [`polling::PollingDriver`], with backfill/incremental lifecycle handling
//! - **Data Model**: typed [`data::DataCell`] rows and [`schema::Schema`]s
//! - **Error Handling**: [`error::StreamError`] with a pure retry decider
//! - **Configuration**: YAML or environment based [`spec::PipelineSpec`]
//!
//! ## Example Usage
//!
//! ```rust
//! use tributary_core::{Message, StreamResult};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> StreamResult<()> {
//! let (tx, mut rx) = mpsc::channel::<Message<u32>>(8);
//! let cancel = CancellationToken::new();
//! tx.send(Message::Batch(1)).await.ok();
//! tx.send(Message::Eos).await.ok();
//! while let Some(Message::Batch(v)) = rx.recv().await {
//!     assert_eq!(v, 1);
//! }
//! # drop(cancel);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod context;
pub mod data;
pub mod error;
pub mod metadata;
pub mod polling;
pub mod schema;
pub mod spec;
pub mod status;

pub use data::{CellValue, DataCell, FieldType, Row, MERGE_KEY_FIELD};
pub use error::{classify, Directive, ErrorKind, StreamError, StreamResult};
pub use metadata::{SourceTags, StreamMetadata, StreamPartition};
pub use polling::{BackfillState, PollingDriver, PollingSource, PollingState, Pull};
pub use schema::{FieldCountValidator, Schema, SchemaField, SchemaValidator};
pub use spec::PipelineSpec;

/// Type alias for the sender side of a message channel between pipeline operators
pub type BatchTx<T> = mpsc::Sender<Message<T>>;

/// Type alias for the receiver side of a message channel between pipeline operators
pub type BatchRx<T> = mpsc::Receiver<Message<T>>;

/// Messages passed between pipeline operators
#[derive(Debug, Clone)]
pub enum Message<T> {
    /// One element (a row, a JSON document, or a grouped batch of them)
    Batch(T),

    /// End-of-stream marker
    ///
    /// Signals a clean completion: the upstream operator finished (or was
    /// interrupted and drained) without failing.
    Eos,
}

/// Base trait for all pipeline operators
pub trait Operator: Send {
    /// Returns the unique name/identifier of this operator
    ///
    /// Used for logging and pipeline wiring.
    fn name(&self) -> &str;
}

/// Trait for data source operators
///
/// Sources are the entry points of pipelines. A source only produces when
/// the output channel has capacity, which propagates backpressure from the sink.
#[async_trait]
pub trait Source<T: Send + 'static>: Operator {
    /// Run the source until completion, failure or cancellation
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages to downstream operators
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: BatchTx<T>, cancel: CancellationToken) -> StreamResult<()>;
}

/// Trait for data transformation operators
#[async_trait]
pub trait Transform<I: Send + 'static, O: Send + 'static>: Operator {
    /// Consume input messages and publish transformed output
    async fn run(
        &mut self,
        rx: BatchRx<I>,
        tx: BatchTx<O>,
        cancel: CancellationToken,
    ) -> StreamResult<()>;
}

/// Trait for data sink operators
///
/// Sinks are the exit points of pipelines, writing batches to durable storage.
#[async_trait]
pub trait Sink<T: Send + 'static>: Operator {
    /// Consume messages until end of stream
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token; when cancelled before the end of the
    ///   stream the run counts as interrupted
    async fn run(&mut self, rx: BatchRx<T>, cancel: CancellationToken) -> StreamResult<()>;
}
