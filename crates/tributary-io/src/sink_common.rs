//! Buffered blob sink shared by the Parquet and JSON writers
//!
//! The sink pulls one batch at a time from its input channel, appends it to
//! an in-memory part, and uploads the part once `groups_per_file` batches (or
//! `max_buffer_bytes`) are buffered. On end of stream the pending part is
//! flushed and, unless the run was interrupted, a completion marker is
//! written. Any storage or encoding failure fails the sink.

use crate::metadata_writer::write_stream_metadata;
use crate::storage::{blob_path, BlobStorage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tributary_core::{
    BatchRx, Message, Operator, Sink, StreamError, StreamMetadata, StreamResult,
};

pub const DATA_FOLDER: &str = "data";
pub const SCHEMA_FOLDER: &str = "schema";

/// A file written once before the first data part
#[derive(Debug, Clone)]
pub struct PreambleFile {
    pub folder: &'static str,
    pub name: String,
    pub content: Bytes,
}

/// Turns batches into part files
pub trait PartEncoder: Send {
    type Item: Send + 'static;

    /// Append one batch to the current part
    ///
    /// Must validate the batch before buffering anything from it.
    fn append(&mut self, batch: Self::Item) -> StreamResult<()>;

    /// Number of batches in the current part
    fn buffered_groups(&self) -> usize;

    /// Approximate encoded size of the current part
    fn buffered_bytes(&self) -> usize;

    /// Close the current part; `None` when nothing is buffered
    fn finish_part(&mut self) -> StreamResult<Option<Bytes>>;

    /// Name of the next part file inside the data folder
    fn part_name(&self) -> String;

    /// Name of the completion marker inside the data folder
    fn marker_name(&self) -> String;

    fn preamble(&self) -> StreamResult<Option<PreambleFile>> {
        Ok(None)
    }
}

/// Flush cadence and completion behaviour
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Root path of the sink output
    pub path: String,
    pub groups_per_file: usize,
    pub complete_signal: bool,
    pub max_buffer_bytes: Option<usize>,
    pub metadata: Option<StreamMetadata>,
}

/// Sink writing encoded parts to blob storage
pub struct BlobSink<E> {
    id: String,
    storage: Arc<dyn BlobStorage>,
    settings: SinkSettings,
    encoder: E,
    preamble_written: bool,
    parts_written: usize,
}

impl<E: PartEncoder> BlobSink<E> {
    pub fn with_encoder(
        id: impl Into<String>,
        storage: Arc<dyn BlobStorage>,
        settings: SinkSettings,
        encoder: E,
    ) -> Self {
        Self {
            id: id.into(),
            storage,
            settings,
            encoder,
            preamble_written: false,
            parts_written: 0,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn parts_written(&self) -> usize {
        self.parts_written
    }

    fn data_folder(&self) -> String {
        blob_path(&self.settings.path, DATA_FOLDER)
    }

    fn should_flush(&self) -> bool {
        self.encoder.buffered_groups() >= self.settings.groups_per_file.max(1)
            || self
                .settings
                .max_buffer_bytes
                .is_some_and(|limit| self.encoder.buffered_bytes() >= limit)
    }

    async fn write_preamble(&mut self) -> StreamResult<()> {
        if self.preamble_written {
            return Ok(());
        }
        if let Some(file) = self.encoder.preamble()? {
            let folder = blob_path(&self.settings.path, file.folder);
            self.storage
                .save_bytes_as_blob(file.content, &folder, &file.name)
                .await?;
            info!(sink = %self.id, file = %file.name, "schema file written");
        }
        self.preamble_written = true;
        Ok(())
    }

    async fn flush(&mut self) -> StreamResult<()> {
        let groups = self.encoder.buffered_groups();
        let Some(content) = self.encoder.finish_part()? else {
            return Ok(());
        };
        self.write_preamble().await?;
        let name = self.encoder.part_name();
        let uploaded = self
            .storage
            .save_bytes_as_blob(content, &self.data_folder(), &name)
            .await?;
        self.parts_written += 1;
        info!(
            sink = %self.id,
            part = %uploaded.path,
            groups,
            bytes = uploaded.size,
            "part written"
        );
        Ok(())
    }

    async fn write_marker(&mut self) -> StreamResult<()> {
        let name = self.encoder.marker_name();
        self.storage
            .save_bytes_as_blob(Bytes::from_static(b"1"), &self.data_folder(), &name)
            .await?;
        info!(sink = %self.id, marker = %name, "completion marker written");
        Ok(())
    }

    async fn consume(&mut self, mut rx: BatchRx<E::Item>, cancel: CancellationToken) -> StreamResult<()> {
        write_stream_metadata(
            self.storage.as_ref(),
            &self.settings.path,
            self.settings.metadata.as_ref(),
        )
        .await?;

        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(batch) => {
                    self.encoder.append(batch)?;
                    debug!(sink = %self.id, buffered = self.encoder.buffered_groups(), "batch buffered");
                    if self.should_flush() {
                        self.flush().await?;
                    }
                }
                Message::Eos => {
                    self.flush().await?;
                    if cancel.is_cancelled() {
                        warn!(sink = %self.id, "stream interrupted, completion marker suppressed");
                    } else if self.settings.complete_signal {
                        self.write_marker().await?;
                    }
                    info!(sink = %self.id, parts = self.parts_written, "sink finished");
                    return Ok(());
                }
            }
        }

        Err(StreamError::ChannelClosed(
            "sink input closed without end of stream",
        ))
    }
}

impl<E: PartEncoder> Operator for BlobSink<E> {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl<E: PartEncoder> Sink<E::Item> for BlobSink<E> {
    async fn run(&mut self, rx: BatchRx<E::Item>, cancel: CancellationToken) -> StreamResult<()> {
        info!(sink = %self.id, path = %self.settings.path, "starting sink");
        self.consume(rx, cancel).await
    }
}
