use super::manifest::{CdmManifest, MANIFEST_FILE};
use crate::csv::parse_records;
use crate::storage::{blob_path, get_blob_json, BlobDescriptor, BlobStorage};
use crate::SchemaDiscovery;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tributary_core::spec::CdmChangeFeedSourceSpec;
use tributary_core::{
    CellValue, DataCell, PollingSource, PollingState, Pull, Row, Schema, SourceTags, StreamError,
    StreamResult,
};

pub const CHANGE_FEED_FOLDER: &str = "ChangeFeed";

/// Streams rows of one CDM entity: base snapshot files first when
/// backfilling, then change feed files newer than the high-water mark.
pub struct CdmChangeFeedSource {
    name: String,
    tags: SourceTags,
    storage: Arc<dyn BlobStorage>,
    spec: CdmChangeFeedSourceSpec,
    polling: PollingState,
    /// Manifest schema with the merge key column appended
    schema: Option<Schema>,
    merge_key_index: usize,
    schema_update_interval: Duration,
    next_schema_check: Instant,
    base_listed: bool,
    pending_files: VecDeque<String>,
    high_water_mark: DateTime<Utc>,
    seen_at_mark: HashSet<String>,
}

impl CdmChangeFeedSource {
    pub fn new(
        name: impl Into<String>,
        spec: CdmChangeFeedSourceSpec,
        storage: Arc<dyn BlobStorage>,
        polling: PollingState,
    ) -> Self {
        // a backfill covers everything up to its start, later changes come from the feed
        let high_water_mark = if polling.is_backfilling() {
            Utc::now()
        } else {
            Utc::now() - ChronoDuration::seconds(spec.look_back_range_secs as i64)
        };
        let schema_update_interval = Duration::from_secs(spec.schema_update_interval_secs);
        Self {
            name: name.into(),
            tags: SourceTags::new(spec.entity_name.clone(), spec.root_path.clone()),
            storage,
            polling,
            schema: None,
            merge_key_index: 0,
            schema_update_interval,
            next_schema_check: Instant::now() + schema_update_interval,
            base_listed: false,
            pending_files: VecDeque::new(),
            high_water_mark,
            seen_at_mark: HashSet::new(),
            spec,
        }
    }

    fn base_folder(&self) -> String {
        blob_path(&self.spec.root_path, &self.spec.entity_name)
    }

    fn change_feed_folder(&self) -> String {
        blob_path(
            &blob_path(&self.spec.root_path, CHANGE_FEED_FOLDER),
            &self.spec.entity_name,
        )
    }

    async fn read_manifest_schema(&self) -> StreamResult<Option<Schema>> {
        let manifest: Option<CdmManifest> =
            get_blob_json(self.storage.as_ref(), &self.spec.root_path, MANIFEST_FILE).await?;
        match manifest {
            Some(manifest) => Ok(Some(
                manifest.entity_schema(&self.spec.entity_name)?.with_merge_key(),
            )),
            None => Ok(None),
        }
    }

    fn cache_schema(&mut self, schema: Schema) -> StreamResult<()> {
        self.merge_key_index = schema
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(&self.spec.merge_key_column))
            .ok_or_else(|| StreamError::MissingMergeKey {
                entity: self.spec.entity_name.clone(),
                field: self.spec.merge_key_column.clone(),
            })?;
        self.schema = Some(schema);
        Ok(())
    }

    /// Re-read the manifest and fail on any structural change
    async fn refresh_schema(&mut self) -> StreamResult<()> {
        let Some(current) = &self.schema else {
            return Ok(());
        };
        match self.read_manifest_schema().await? {
            None => {
                warn!(entity = %self.spec.entity_name, "manifest missing on refresh, keeping cached schema");
                Ok(())
            }
            Some(fresh) if fresh.structurally_equals(current) => {
                debug!(entity = %self.spec.entity_name, "schema unchanged");
                Ok(())
            }
            Some(fresh) => Err(StreamError::schema_mismatch(
                &self.spec.entity_name,
                current.describe_difference(&fresh),
            )),
        }
    }

    async fn read_file(&self, name: &str) -> StreamResult<Vec<Row>> {
        let Some(schema) = &self.schema else {
            return Err(StreamError::SchemaNotFound(self.spec.entity_name.clone()));
        };
        let Some(content) = self.storage.get_blob_content("", name).await? else {
            warn!(file = %name, "file vanished before it was read");
            return Ok(Vec::new());
        };
        let text = std::str::from_utf8(&content)
            .map_err(|e| StreamError::parse(format!("{name} is not valid UTF-8: {e}")))?;
        let text = text.trim_start_matches('\u{feff}');

        // merge key column is the last schema field and not part of the file
        let file_fields = schema.len() - 1;
        let mut rows = Vec::new();
        for record in parse_records(text, b',')? {
            if record.len() != file_fields {
                return Err(StreamError::SchemaInconsistent {
                    expected: file_fields,
                    actual: record.len(),
                });
            }
            let mut row: Row = Vec::with_capacity(schema.len());
            for (raw, field) in record.iter().zip(&schema.fields) {
                row.push(DataCell::new(
                    &field.name,
                    field.field_type.clone(),
                    CellValue::parse(raw, &field.field_type)?,
                ));
            }
            let key = row[self.merge_key_index]
                .value
                .as_text()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| StreamError::MissingMergeKey {
                    entity: self.spec.entity_name.clone(),
                    field: self.spec.merge_key_column.clone(),
                })?;
            row.push(DataCell::merge_key(key));
            rows.push(row);
        }
        debug!(file = %name, rows = rows.len(), "file read");
        Ok(rows)
    }

    fn is_new(&self, blob: &BlobDescriptor) -> bool {
        blob.last_modified > self.high_water_mark
            || (blob.last_modified == self.high_water_mark && !self.seen_at_mark.contains(&blob.name))
    }

    fn queue_changes(&mut self, listed: Vec<BlobDescriptor>) -> usize {
        let mut fresh: Vec<BlobDescriptor> = listed
            .into_iter()
            .filter(|b| b.name.ends_with(".csv") && self.is_new(b))
            .collect();
        fresh.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then(a.name.cmp(&b.name)));
        if let Some(latest) = fresh.last().map(|b| b.last_modified) {
            if latest != self.high_water_mark {
                self.seen_at_mark.clear();
            }
            self.high_water_mark = latest;
            self.seen_at_mark.extend(
                fresh
                    .iter()
                    .filter(|b| b.last_modified == latest)
                    .map(|b| b.name.clone()),
            );
        }
        let count = fresh.len();
        self.pending_files.extend(fresh.into_iter().map(|b| b.name));
        count
    }
}

#[async_trait]
impl SchemaDiscovery for CdmChangeFeedSource {
    async fn discover_schema(&mut self) -> StreamResult<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        let schema = self.read_manifest_schema().await?.ok_or_else(|| {
            StreamError::SchemaNotFound(format!(
                "{} not found under {}",
                MANIFEST_FILE, self.spec.root_path
            ))
        })?;
        self.cache_schema(schema.clone())?;
        self.next_schema_check = Instant::now() + self.schema_update_interval;
        info!(entity = %self.spec.entity_name, fields = schema.len(), "schema loaded from manifest");
        Ok(schema)
    }
}

#[async_trait]
impl PollingSource for CdmChangeFeedSource {
    type Item = Row;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &SourceTags {
        &self.tags
    }

    async fn pre_start(&mut self) -> StreamResult<()> {
        self.discover_schema().await.map(|_| ())
    }

    async fn on_pull(&mut self) -> StreamResult<Pull<Row>> {
        if Instant::now() >= self.next_schema_check {
            self.refresh_schema().await?;
            self.next_schema_check = Instant::now() + self.schema_update_interval;
            return Ok(Pull::Emit(Vec::new()));
        }

        if let Some(file) = self.pending_files.pop_front() {
            return Ok(Pull::Emit(self.read_file(&file).await?));
        }

        if self.polling.is_backfilling() {
            if self.base_listed {
                return Ok(self.polling.on_empty());
            }
            let mut names: Vec<String> = self
                .storage
                .list_blobs(&self.base_folder())
                .await?
                .into_iter()
                .map(|b| b.name)
                .filter(|n| n.ends_with(".csv"))
                .collect();
            names.sort();
            info!(files = names.len(), "backfill files listed");
            self.base_listed = true;
            self.pending_files.extend(names);
            return Ok(Pull::Emit(Vec::new()));
        }

        let listed = self.storage.list_blobs(&self.change_feed_folder()).await?;
        match self.queue_changes(listed) {
            0 => Ok(self.polling.on_empty()),
            count => {
                debug!(files = count, mark = %self.high_water_mark, "change feed files queued");
                Ok(Pull::Emit(Vec::new()))
            }
        }
    }
}
