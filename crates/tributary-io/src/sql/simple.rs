use super::client::SqlClient;
use super::query::table_query;
use super::table::{describe_table, to_row, TableDescription};
use crate::SchemaDiscovery;
use async_trait::async_trait;
use tracing::{info, warn};
use tributary_core::spec::SqlServerSourceSpec;
use tributary_core::{
    PollingSource, PollingState, Pull, Row, Schema, SourceTags, StreamError, StreamResult,
};

/// Reads a whole SQL Server table once per polling cycle
pub struct SqlServerSimpleSource {
    name: String,
    tags: SourceTags,
    spec: SqlServerSourceSpec,
    client: Box<dyn SqlClient>,
    polling: PollingState,
    table: Option<TableDescription>,
    schema: Option<Schema>,
    cycle_done: bool,
}

impl SqlServerSimpleSource {
    pub fn new(
        name: impl Into<String>,
        spec: SqlServerSourceSpec,
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
            cycle_done: false,
        }
    }
}

#[async_trait]
impl SchemaDiscovery for SqlServerSimpleSource {
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
        let schema = Schema::new(table.columns.clone()).with_merge_key();
        self.table = Some(table);
        self.schema = Some(schema.clone());
        Ok(schema)
    }
}

#[async_trait]
impl PollingSource for SqlServerSimpleSource {
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
        if self.cycle_done {
            self.cycle_done = false;
            return Ok(self.polling.on_empty());
        }
        let query = match &self.table {
            Some(table) => table_query(
                &self.spec.schema_name,
                &self.spec.table_name,
                &table.column_names(),
                &table.primary_keys,
            ),
            None => return Err(StreamError::SchemaNotFound(self.tags.source_entity.clone())),
        };
        let result = self.client.execute_reader(&query).await?;
        let Some(schema) = &self.schema else {
            return Err(StreamError::SchemaNotFound(self.tags.source_entity.clone()));
        };
        let rows = result
            .rows
            .into_iter()
            .map(|values| to_row(schema, values))
            .collect::<StreamResult<Vec<_>>>()?;
        info!(rows = rows.len(), "table read");
        self.cycle_done = true;
        Ok(Pull::Emit(rows))
    }

    async fn post_stop(&mut self) {
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "failed to close SQL Server connection");
        }
    }
}
