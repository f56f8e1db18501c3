//! Builds and runs the pipeline described by a [`PipelineSpec`]

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tributary_core::spec::{ParquetSinkSpec, SinkSpec, SourceSpec};
use tributary_core::{
    FieldCountValidator, PipelineSpec, PollingDriver, PollingSource, PollingState, Row, Schema,
    StreamError, StreamResult,
};
use tributary_io::cdm::CdmChangeFeedSource;
use tributary_io::rest::RestApiSource;
use tributary_io::salesforce::SalesForceSource;
use tributary_io::sink_json::JsonLayout;
use tributary_io::source_blob_listing::BlobListingSource;
use tributary_io::sql::{SqlServerChangeTrackingSource, SqlServerSimpleSource, TiberiusClient};
use tributary_io::storage::build_storage;
use tributary_io::{JsonSink, ParquetSink, SchemaDiscovery};
use tributary_tx::{connect, GroupingSettings, Pipeline, SchemaBoundSink, SchemaBoundSource};

pub fn load_spec(path: &Path) -> anyhow::Result<PipelineSpec> {
    let text = std::fs::read_to_string(path)?;
    let spec = PipelineSpec::from_yaml(&text)?;
    spec.validate()?;
    Ok(spec)
}

pub async fn run_pipeline(
    spec: &PipelineSpec,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> StreamResult<()> {
    spec.validate()?;
    let polling = PollingState::new(spec.backfill_state()?, spec.change_capture_interval());
    info!(
        stream = %spec.name,
        source = spec.source.kind(),
        sink = spec.sink.kind(),
        backfill = spec.backfill,
        "building pipeline"
    );
    let name = spec.name.clone();
    match &spec.source {
        SourceSpec::BlobListing(s) => {
            let storage = build_storage(&s.storage)?;
            let source = BlobListingSource::new(name, s, storage, polling);
            run_json(source, spec, channel_capacity, cancel).await
        }
        SourceSpec::RestApi(s) => {
            let source = RestApiSource::from_spec(name, s, polling)?;
            run_json(source, spec, channel_capacity, cancel).await
        }
        SourceSpec::CdmChangeFeed(s) => {
            let storage = build_storage(&s.storage)?;
            let source = CdmChangeFeedSource::new(name, s.clone(), storage, polling);
            run_rows(source, spec, channel_capacity, cancel).await
        }
        SourceSpec::SqlServerChangeTracking(s) => {
            let client = TiberiusClient::new(
                s.connection_string.clone(),
                Duration::from_secs(s.command_timeout_secs),
            );
            let source = SqlServerChangeTrackingSource::new(name, s.clone(), Box::new(client), polling);
            run_rows(source, spec, channel_capacity, cancel).await
        }
        SourceSpec::SqlServer(s) => {
            let client = TiberiusClient::new(
                s.connection_string.clone(),
                Duration::from_secs(s.command_timeout_secs),
            );
            let source = SqlServerSimpleSource::new(name, s.clone(), Box::new(client), polling);
            run_rows(source, spec, channel_capacity, cancel).await
        }
        SourceSpec::Salesforce(s) => {
            let source = SalesForceSource::new(name, s, polling)?;
            run_rows(source, spec, channel_capacity, cancel).await
        }
    }
}

/// Row sources: the schema is discovered first and binds source and sink
async fn run_rows<P>(
    mut source: P,
    spec: &PipelineSpec,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> StreamResult<()>
where
    P: PollingSource<Item = Row> + SchemaDiscovery + 'static,
{
    let SinkSpec::Parquet(sink_spec) = &spec.sink else {
        return Err(StreamError::config(format!(
            "row source {} needs a parquet sink",
            spec.source.kind()
        )));
    };
    // discovery may already hold a connection; release it if the sink cannot be built
    let (schema, sink) = match prepare_rows(&mut source, spec, sink_spec).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(stream = %spec.name, error = %e, "pipeline setup failed");
            source.post_stop().await;
            return Err(e);
        }
    };
    let validator = Arc::new(FieldCountValidator::new(schema));
    connect(
        SchemaBoundSource::new(PollingDriver::new(source), validator.clone()),
        SchemaBoundSink::new(sink, validator),
        GroupingSettings::from_spec(spec),
    )?
    .with_channel_capacity(channel_capacity)
    .run(cancel)
    .await
}

async fn prepare_rows<P>(
    source: &mut P,
    spec: &PipelineSpec,
    sink_spec: &ParquetSinkSpec,
) -> StreamResult<(Schema, ParquetSink)>
where
    P: SchemaDiscovery,
{
    let schema = source.discover_schema().await?;
    info!(fields = schema.len(), "source schema discovered");
    let storage = build_storage(&sink_spec.storage)?;
    let sink = ParquetSink::new(format!("{}-sink", spec.name), sink_spec, schema.clone(), storage)?;
    Ok((schema, sink))
}

async fn run_json<P>(
    source: P,
    spec: &PipelineSpec,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> StreamResult<()>
where
    P: PollingSource<Item = Value> + 'static,
{
    let sink_name = format!("{}-sink", spec.name);
    let sink = match &spec.sink {
        SinkSpec::Json(s) => JsonSink::new(sink_name, s, JsonLayout::Array, build_storage(&s.storage)?),
        SinkSpec::MultilineJson(s) => JsonSink::multiline(sink_name, s, build_storage(&s.storage)?),
        SinkSpec::Parquet(_) => {
            return Err(StreamError::config(format!(
                "json source {} needs a json sink",
                spec.source.kind()
            )))
        }
    };
    Pipeline::new(PollingDriver::new(source), sink, GroupingSettings::from_spec(spec))
        .with_channel_capacity(channel_capacity)
        .run(cancel)
        .await
}
