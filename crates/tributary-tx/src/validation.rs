use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tributary_core::{
    BatchRx, BatchTx, Message, Operator, Row, SchemaValidator, StreamError, StreamResult, Transform,
};

/// Checks every row group against a schema validator before it reaches the sink
///
/// The first invalid group fails the stage without forwarding it, so the sink
/// never sees an end of stream and writes no completion marker.
pub struct SchemaValidation<V> {
    id: String,
    validator: Arc<V>,
}

impl<V: SchemaValidator> SchemaValidation<V> {
    pub fn new(id: impl Into<String>, validator: Arc<V>) -> Self {
        Self {
            id: id.into(),
            validator,
        }
    }
}

impl<V: SchemaValidator> Operator for SchemaValidation<V> {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl<V: SchemaValidator> Transform<Vec<Row>, Vec<Row>> for SchemaValidation<V> {
    async fn run(
        &mut self,
        mut rx: BatchRx<Vec<Row>>,
        tx: BatchTx<Vec<Row>>,
        _cancel: CancellationToken,
    ) -> StreamResult<()> {
        let mut groups = 0usize;
        while let Some(message) = rx.recv().await {
            if let Message::Batch(batch) = &message {
                if let Err(e) = self.validator.validate(batch) {
                    error!(name = %self.id, error = %e, "row group rejected");
                    return Err(e);
                }
                groups += 1;
            }
            let eos = matches!(message, Message::Eos);
            if tx.send(message).await.is_err() {
                return Err(StreamError::ChannelClosed("validation output"));
            }
            if eos {
                info!(name = %self.id, groups, "validation finished");
                return Ok(());
            }
        }
        Err(StreamError::ChannelClosed("validation input closed without end of stream"))
    }
}
