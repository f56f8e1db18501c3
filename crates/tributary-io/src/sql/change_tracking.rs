use super::client::{SqlClient, SqlResultSet};
use super::query::{
    changes_query, look_back_version_query, next_version_query, snapshot_query,
    CHANGE_OPERATION_COLUMN, CHANGE_VERSION_COLUMN,
};
use super::table::{describe_table, to_row, TableDescription};
use crate::SchemaDiscovery;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use tributary_core::spec::SqlServerChangeTrackingSourceSpec;
use tributary_core::{
    CellValue, FieldType, PollingSource, PollingState, Pull, Row, Schema, SchemaField,
    SourceTags, StreamError, StreamResult,
};

/// Streams a change-tracked SQL Server table
///
/// A backfill reads the whole table once, tagged with the current change
/// tracking version. Incremental reads then walk committed versions: the
/// next version after the cursor is looked up first, and the changes up to
/// that version are read by the following pull.
pub struct SqlServerChangeTrackingSource {
    name: String,
    tags: SourceTags,
    spec: SqlServerChangeTrackingSourceSpec,
    client: Box<dyn SqlClient>,
    polling: PollingState,
    table: Option<TableDescription>,
    schema: Option<Schema>,
    snapshot_done: bool,
    /// Last change tracking version read
    cursor: Option<i64>,
    /// Committed version the next change read stops at
    target: Option<i64>,
}

impl SqlServerChangeTrackingSource {
    pub fn new(
        name: impl Into<String>,
        spec: SqlServerChangeTrackingSourceSpec,
        client: Box<dyn SqlClient>,
        polling: PollingState,
    ) -> Self {
        Self {
            name: name.into(),
            tags: SourceTags::new(
                format!("{}.{}", spec.schema_name, spec.table_name),
                "sql-server",
            ),
            spec,
            client,
            polling,
            table: None,
            schema: None,
            snapshot_done: false,
            cursor: None,
            target: None,
        }
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    fn describe(&self) -> StreamResult<(&TableDescription, &Schema)> {
        match (&self.table, &self.schema) {
            (Some(table), Some(schema)) => Ok((table, schema)),
            _ => Err(StreamError::SchemaNotFound(self.tags.source_entity.clone())),
        }
    }

    /// Convert a result set and return the highest version seen
    fn convert(&self, result: SqlResultSet) -> StreamResult<(Vec<Row>, Option<i64>)> {
        let (table, schema) = self.describe()?;
        let version_index = table.columns.len();
        let mut max_version = None;
        let mut rows = Vec::with_capacity(result.rows.len());
        for values in result.rows {
            if let Some(CellValue::Int64(v)) = values.get(version_index) {
                max_version = max_version.max(Some(*v));
            }
            rows.push(to_row(schema, values)?);
        }
        Ok((rows, max_version))
    }

    async fn read_snapshot(&mut self) -> StreamResult<Pull<Row>> {
        let query = {
            let (table, _) = self.describe()?;
            snapshot_query(
                &self.spec.schema_name,
                &self.spec.table_name,
                &table.column_names(),
                &table.primary_keys,
            )
        };
        let result = self.client.execute_reader(&query).await?;
        self.snapshot_done = true;
        if result.is_empty() {
            info!("snapshot is empty, change reads start from version 0");
            self.cursor = Some(0);
            return Ok(self.polling.on_empty());
        }
        let (rows, version) = self.convert(result)?;
        self.cursor = version.or(self.cursor);
        info!(rows = rows.len(), version = ?self.cursor, "snapshot read");
        Ok(Pull::Emit(rows))
    }

    async fn read_changes(&mut self, cursor: i64, until: i64) -> StreamResult<Pull<Row>> {
        let query = {
            let (table, _) = self.describe()?;
            changes_query(
                &self.spec.schema_name,
                &self.spec.table_name,
                &table.column_names(),
                &table.primary_keys,
                cursor,
                until,
            )
        };
        let result = self.client.execute_reader(&query).await?;
        let (rows, version) = self.convert(result)?;
        self.cursor = Some(version.unwrap_or(until).max(until));
        self.target = None;
        debug!(rows = rows.len(), cursor = ?self.cursor, "changes read");
        Ok(Pull::Emit(rows))
    }
}

#[async_trait]
impl SchemaDiscovery for SqlServerChangeTrackingSource {
    async fn discover_schema(&mut self) -> StreamResult<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        let table = describe_table(
            self.client.as_mut(),
            &self.spec.schema_name,
            &self.spec.table_name,
        )
        .await?;

        // deleted rows only carry their key columns
        let mut fields: Vec<SchemaField> = table
            .columns
            .iter()
            .map(|c| {
                let nullable = c.nullable || !table.primary_keys.contains(&c.name);
                SchemaField::new(&c.name, c.field_type.clone(), nullable)
            })
            .collect();
        fields.push(SchemaField::new(CHANGE_VERSION_COLUMN, FieldType::Int64, false));
        fields.push(SchemaField::new(CHANGE_OPERATION_COLUMN, FieldType::String, false));
        let schema = Schema::new(fields).with_merge_key();

        self.table = Some(table);
        self.schema = Some(schema.clone());
        Ok(schema)
    }
}

#[async_trait]
impl PollingSource for SqlServerChangeTrackingSource {
    type Item = Row;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &SourceTags {
        &self.tags
    }

    async fn pre_start(&mut self) -> StreamResult<()> {
        self.discover_schema().await?;
        if !self.polling.is_backfilling() {
            let query = look_back_version_query(self.spec.look_back_range_secs);
            match self.client.execute_scalar(&query).await? {
                CellValue::Int64(version) => {
                    info!(version, "incremental reads start after version");
                    self.cursor = Some(version);
                }
                other => {
                    return Err(StreamError::config(format!(
                        "change tracking is not enabled for {} (version {other:?})",
                        self.tags.source_entity
                    )))
                }
            }
        }
        Ok(())
    }

    async fn on_pull(&mut self) -> StreamResult<Pull<Row>> {
        if self.polling.is_backfilling() {
            if !self.snapshot_done {
                return self.read_snapshot().await;
            }
            return Ok(self.polling.on_empty());
        }

        let cursor = self.cursor.unwrap_or(0);
        match self.target {
            Some(until) => self.read_changes(cursor, until).await,
            None => match self.client.execute_scalar(&next_version_query(cursor)).await? {
                CellValue::Int64(next) => {
                    self.target = Some(next);
                    Ok(Pull::Emit(Vec::new()))
                }
                CellValue::Null => {
                    debug!(cursor, "no changes yet");
                    Ok(self.polling.on_empty())
                }
                other => Err(StreamError::parse(format!(
                    "unexpected commit version {other:?}"
                ))),
            },
        }
    }

    async fn post_stop(&mut self) {
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "failed to close SQL Server connection");
        }
    }
}
