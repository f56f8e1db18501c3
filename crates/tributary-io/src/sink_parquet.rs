//! Parquet part writer
//!
//! Each incoming batch of rows becomes one row group. Parts, the optional
//! schema file and the completion marker are all named after the schema
//! hash, so files written with different schemas never mix.

use crate::row_group::build_record_batch;
use crate::sink_common::{BlobSink, PartEncoder, PreambleFile, SinkSettings, SCHEMA_FOLDER};
use crate::storage::BlobStorage;
use arrow_schema::SchemaRef;
use bytes::Bytes;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tributary_core::spec::ParquetSinkSpec;
use tributary_core::{Row, Schema, StreamError, StreamResult};
use uuid::Uuid;

fn parquet_error(e: ParquetError) -> StreamError {
    StreamError::Serialization(e.to_string())
}

/// Encodes row batches into Parquet files
pub struct ParquetEncoder {
    schema: Schema,
    arrow_schema: SchemaRef,
    props: WriterProperties,
    schema_hash: String,
    create_schema_file: bool,
    writer: Option<ArrowWriter<Vec<u8>>>,
    groups: usize,
}

impl ParquetEncoder {
    pub fn try_new(schema: Schema, create_schema_file: bool) -> StreamResult<Self> {
        let arrow_schema = schema.to_arrow();
        let props = WriterProperties::builder().build();
        let empty = empty_file(&arrow_schema, &props)?;
        Ok(Self {
            schema,
            arrow_schema,
            props,
            schema_hash: hash_bytes(&empty),
            create_schema_file,
            writer: None,
            groups: 0,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Hash of an empty file serialized with the target schema
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }
}

fn empty_file(schema: &SchemaRef, props: &WriterProperties) -> StreamResult<Vec<u8>> {
    let writer = ArrowWriter::try_new(Vec::new(), schema.clone(), Some(props.clone()))
        .map_err(parquet_error)?;
    writer.into_inner().map_err(parquet_error)
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl PartEncoder for ParquetEncoder {
    type Item = Vec<Row>;

    fn append(&mut self, rows: Vec<Row>) -> StreamResult<()> {
        let batch = build_record_batch(&self.schema, &rows)?;
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => ArrowWriter::try_new(
                Vec::new(),
                self.arrow_schema.clone(),
                Some(self.props.clone()),
            )
            .map_err(parquet_error)?,
        };
        writer.write(&batch).map_err(parquet_error)?;
        // close the row group so every batch maps to exactly one group
        writer.flush().map_err(parquet_error)?;
        self.writer = Some(writer);
        self.groups += 1;
        Ok(())
    }

    fn buffered_groups(&self) -> usize {
        self.groups
    }

    fn buffered_bytes(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.bytes_written())
    }

    fn finish_part(&mut self) -> StreamResult<Option<Bytes>> {
        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };
        self.groups = 0;
        Ok(Some(Bytes::from(writer.into_inner().map_err(parquet_error)?)))
    }

    fn part_name(&self) -> String {
        format!("part-{}-{}-chunk.parquet", Uuid::new_v4(), self.schema_hash)
    }

    fn marker_name(&self) -> String {
        format!("{}.COMPLETED", self.schema_hash)
    }

    fn preamble(&self) -> StreamResult<Option<PreambleFile>> {
        if !self.create_schema_file {
            return Ok(None);
        }
        Ok(Some(PreambleFile {
            folder: SCHEMA_FOLDER,
            name: format!("schema-{}-{}.parquet", Uuid::new_v4(), self.schema_hash),
            content: Bytes::from(empty_file(&self.arrow_schema, &self.props)?),
        }))
    }
}

/// Parquet sink over blob storage
pub type ParquetSink = BlobSink<ParquetEncoder>;

impl BlobSink<ParquetEncoder> {
    pub fn new(
        id: impl Into<String>,
        spec: &ParquetSinkSpec,
        schema: Schema,
        storage: Arc<dyn BlobStorage>,
    ) -> StreamResult<Self> {
        let encoder = ParquetEncoder::try_new(schema, spec.create_schema_file)?;
        let settings = SinkSettings {
            path: spec.path.clone(),
            groups_per_file: spec.row_groups_per_file,
            complete_signal: spec.complete_signal,
            max_buffer_bytes: spec.max_buffer_bytes,
            metadata: spec.metadata.clone(),
        };
        Ok(Self::with_encoder(id, storage, settings, encoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectStoreStorage;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tributary_core::spec::StorageSpec;
    use tributary_core::{CellValue, DataCell, FieldType, Message, SchemaField, Sink};

    fn schema() -> Schema {
        Schema::new(vec![
            SchemaField::new("id", FieldType::Int64, false),
            SchemaField::new("name", FieldType::String, true),
        ])
        .with_merge_key()
    }

    fn rows(start: i64, count: i64) -> Vec<Row> {
        (start..start + count)
            .map(|i| {
                vec![
                    DataCell::new("id", FieldType::Int64, CellValue::Int64(i)),
                    DataCell::new("name", FieldType::String, CellValue::String(format!("n{i}"))),
                    DataCell::merge_key(i.to_string()),
                ]
            })
            .collect()
    }

    fn spec(row_groups_per_file: usize, create_schema_file: bool, complete_signal: bool) -> ParquetSinkSpec {
        ParquetSinkSpec {
            storage: StorageSpec::Memory,
            path: "accounts".into(),
            row_groups_per_file,
            create_schema_file,
            complete_signal,
            max_buffer_bytes: None,
            metadata: None,
        }
    }

    async fn feed(sink: &mut ParquetSink, batches: Vec<Vec<Row>>, cancel: CancellationToken) -> StreamResult<()> {
        let (tx, rx) = mpsc::channel(batches.len() + 1);
        for batch in batches {
            tx.send(Message::Batch(batch)).await.unwrap();
        }
        tx.send(Message::Eos).await.unwrap();
        drop(tx);
        sink.run(rx, cancel).await
    }

    #[tokio::test]
    async fn test_flush_cadence_with_schema_file() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = ParquetSink::new("accounts", &spec(2, true, false), schema(), storage.clone()).unwrap();
        let batches = (0..10).map(|i| rows(i * 3, 3)).collect();
        feed(&mut sink, batches, CancellationToken::new()).await.unwrap();

        let data = storage.list_blobs("accounts/data").await.unwrap();
        let schema_files = storage.list_blobs("accounts/schema").await.unwrap();
        assert_eq!(data.len(), 5);
        assert_eq!(schema_files.len(), 1);

        // every part holds two row groups of three rows
        let content = storage
            .get_blob_content("", &data[0].name)
            .await
            .unwrap()
            .unwrap();
        let reader = SerializedFileReader::new(content).unwrap();
        assert_eq!(reader.metadata().num_row_groups(), 2);
        assert_eq!(reader.metadata().file_metadata().num_rows(), 6);
    }

    #[tokio::test]
    async fn test_partial_part_flushed_and_marker_written() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = ParquetSink::new("accounts", &spec(4, false, true), schema(), storage.clone()).unwrap();
        let hash = sink.encoder().schema_hash().to_string();
        feed(&mut sink, vec![rows(0, 2); 5], CancellationToken::new()).await.unwrap();

        let names: Vec<String> = storage
            .list_blobs("accounts/data")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&format!("accounts/data/{hash}.COMPLETED")));
        assert!(names
            .iter()
            .filter(|n| !n.ends_with(".COMPLETED"))
            .all(|n| n.ends_with(&format!("-{hash}-chunk.parquet"))));
    }

    #[tokio::test]
    async fn test_inconsistent_rows_fail_before_any_write() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = ParquetSink::new("accounts", &spec(1, true, true), schema(), storage.clone()).unwrap();
        let mut bad = rows(0, 2);
        bad[1].pop();
        let err = feed(&mut sink, vec![bad], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SchemaInconsistent { expected: 3, actual: 2 }));
        assert!(storage.list_blobs("accounts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_suppresses_marker() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let mut sink = ParquetSink::new("accounts", &spec(10, false, true), schema(), storage.clone()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        feed(&mut sink, vec![rows(0, 2)], cancel).await.unwrap();

        let data = storage.list_blobs("accounts/data").await.unwrap();
        assert_eq!(data.len(), 1);
        assert!(data[0].name.ends_with("-chunk.parquet"));
    }

    #[test]
    fn test_schema_hash_is_stable_per_schema() {
        let a = ParquetEncoder::try_new(schema(), false).unwrap();
        let b = ParquetEncoder::try_new(schema(), false).unwrap();
        let c = ParquetEncoder::try_new(Schema::new(vec![SchemaField::new("x", FieldType::Double, true)]), false)
            .unwrap();
        assert_eq!(a.schema_hash(), b.schema_hash());
        assert_ne!(a.schema_hash(), c.schema_hash());
        assert_eq!(a.schema_hash().len(), 64);
    }
}
