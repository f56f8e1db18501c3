//! JSON part writers
//!
//! `JsonSink` writes each part as one JSON array holding every buffered
//! element. `MultilineJsonSink` writes newline-delimited JSON, one element per
//! line.

use crate::sink_common::{BlobSink, PartEncoder, SinkSettings};
use crate::storage::BlobStorage;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tributary_core::spec::JsonSinkSpec;
use tributary_core::StreamResult;
use uuid::Uuid;

pub const JSON_COMPLETION_MARKER: &str = "stream.COMPLETED";

/// Part layout of a JSON sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonLayout {
    /// One array per part
    Array,
    /// One document per line
    Multiline,
}

/// Buffers JSON documents and renders them per [`JsonLayout`]
pub struct JsonEncoder {
    layout: JsonLayout,
    elements: Vec<Value>,
    groups: usize,
    bytes: usize,
}

impl JsonEncoder {
    pub fn new(layout: JsonLayout) -> Self {
        Self {
            layout,
            elements: Vec::new(),
            groups: 0,
            bytes: 0,
        }
    }

    pub fn layout(&self) -> JsonLayout {
        self.layout
    }
}

impl PartEncoder for JsonEncoder {
    type Item = Vec<Value>;

    fn append(&mut self, batch: Vec<Value>) -> StreamResult<()> {
        // length of the compact form, used only for the size threshold
        self.bytes += batch.iter().map(|v| v.to_string().len() + 1).sum::<usize>();
        self.elements.extend(batch);
        self.groups += 1;
        Ok(())
    }

    fn buffered_groups(&self) -> usize {
        self.groups
    }

    fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    fn finish_part(&mut self) -> StreamResult<Option<Bytes>> {
        if self.groups == 0 {
            return Ok(None);
        }
        let elements = std::mem::take(&mut self.elements);
        self.groups = 0;
        self.bytes = 0;
        let body = match self.layout {
            JsonLayout::Array => serde_json::to_vec(&elements)?,
            JsonLayout::Multiline => {
                let mut body = Vec::new();
                for element in &elements {
                    serde_json::to_writer(&mut body, element)?;
                    body.push(b'\n');
                }
                body
            }
        };
        Ok(Some(Bytes::from(body)))
    }

    fn part_name(&self) -> String {
        format!("part-{}-chunk.json", Uuid::new_v4())
    }

    fn marker_name(&self) -> String {
        JSON_COMPLETION_MARKER.to_string()
    }
}

pub type JsonSink = BlobSink<JsonEncoder>;

impl BlobSink<JsonEncoder> {
    pub fn new(
        id: impl Into<String>,
        spec: &JsonSinkSpec,
        layout: JsonLayout,
        storage: Arc<dyn BlobStorage>,
    ) -> Self {
        let settings = SinkSettings {
            path: spec.path.clone(),
            groups_per_file: spec.batches_per_file,
            complete_signal: spec.complete_signal,
            max_buffer_bytes: spec.max_buffer_bytes,
            metadata: spec.metadata.clone(),
        };
        Self::with_encoder(id, storage, settings, JsonEncoder::new(layout))
    }

    /// Sink writing newline-delimited parts
    pub fn multiline(id: impl Into<String>, spec: &JsonSinkSpec, storage: Arc<dyn BlobStorage>) -> Self {
        Self::new(id, spec, JsonLayout::Multiline, storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectStoreStorage;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tributary_core::spec::StorageSpec;
    use tributary_core::{Message, Sink, StreamMetadata, StreamPartition};

    fn spec(batches_per_file: usize) -> JsonSinkSpec {
        JsonSinkSpec {
            storage: StorageSpec::Memory,
            path: "api".into(),
            batches_per_file,
            complete_signal: true,
            max_buffer_bytes: None,
            metadata: None,
        }
    }

    async fn feed(sink: &mut JsonSink, batches: Vec<Vec<Value>>) {
        let (tx, rx) = mpsc::channel(batches.len() + 1);
        for batch in batches {
            tx.send(Message::Batch(batch)).await.unwrap();
        }
        tx.send(Message::Eos).await.unwrap();
        sink.run(rx, CancellationToken::new()).await.unwrap();
    }

    async fn parts(storage: &ObjectStoreStorage) -> Vec<Bytes> {
        let mut out = Vec::new();
        for blob in storage.list_blobs("api/data").await.unwrap() {
            if blob.name.ends_with("-chunk.json") {
                out.push(storage.get_blob_content("", &blob.name).await.unwrap().unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_array_layout() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = JsonSink::new("api", &spec(2), JsonLayout::Array, storage.clone());
        feed(
            &mut sink,
            vec![vec![json!({"id": 1}), json!({"id": 2})], vec![json!({"id": 3})]],
        )
        .await;

        let parts = parts(&storage).await;
        assert_eq!(parts.len(), 1);
        let array: Vec<Value> = serde_json::from_slice(&parts[0]).unwrap();
        assert_eq!(array.len(), 3);
        assert!(storage
            .get_blob_content("api/data", JSON_COMPLETION_MARKER)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_multiline_layout() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = JsonSink::multiline("api", &spec(1), storage.clone());
        feed(
            &mut sink,
            vec![vec![json!({"id": 1}), json!({"id": 2})], vec![json!({"id": 3})]],
        )
        .await;

        let parts = parts(&storage).await;
        assert_eq!(parts.len(), 2);
        let lines: usize = parts
            .iter()
            .map(|p| std::str::from_utf8(p).unwrap().lines().count())
            .sum();
        assert_eq!(lines, 3);
    }

    #[tokio::test]
    async fn test_metadata_written_at_start() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut with_metadata = spec(1);
        with_metadata.metadata = Some(StreamMetadata {
            partitions: Some(vec![StreamPartition {
                name: "day".into(),
                field_name: "created".into(),
                field_format: "yyyyMMdd".into(),
                field_expression: Some("substr(created, 0, 8)".into()),
                is_date_partition: true,
            }]),
        });
        let mut sink = JsonSink::new("api", &with_metadata, JsonLayout::Array, storage.clone());
        feed(&mut sink, vec![]).await;

        assert!(storage
            .get_blob_content("api/metadata", "partitions.json")
            .await
            .unwrap()
            .is_some());
        assert!(parts(&storage).await.is_empty());
    }
}
