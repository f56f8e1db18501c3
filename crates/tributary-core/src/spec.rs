//! Pipeline configuration
//!
//! A pipeline is one source feeding one sink. The specification is loaded from
//! YAML (command line) or from the JSON body carried by the stream context
//! environment, and validated before anything is constructed.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! name: "accounts"
//! backfill: true
//! change_capture_interval_secs: 30
//! source:
//!   type: cdm_change_feed
//!   storage: { type: local, root: "/data/cdm" }
//!   root_path: "dynamics"
//!   entity_name: "account"
//! sink:
//!   type: parquet
//!   storage: { type: local, root: "/data/out" }
//!   path: "accounts"
//!   row_groups_per_file: 4
//! ```

use crate::error::{StreamError, StreamResult};
use crate::metadata::StreamMetadata;
use crate::polling::BackfillState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Complete pipeline specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Stream identifier, also used when reporting schema changes
    pub name: String,

    /// Start with a full historical load
    #[serde(default)]
    pub backfill: bool,

    /// Complete the stream once the full load is exhausted
    #[serde(default)]
    pub stop_after_backfill: bool,

    /// Idle polling interval once no data is available
    #[serde(default = "default_change_capture_interval_secs")]
    pub change_capture_interval_secs: u64,

    /// Maximum number of elements grouped into one sink batch
    #[serde(default = "default_rows_per_group")]
    pub rows_per_group: usize,

    /// Maximum time a partial group is held before being emitted
    #[serde(default = "default_grouping_interval_ms")]
    pub grouping_interval_ms: u64,

    pub source: SourceSpec,

    pub sink: SinkSpec,
}

fn default_change_capture_interval_secs() -> u64 {
    15
}

fn default_rows_per_group() -> usize {
    10_000
}

fn default_grouping_interval_ms() -> u64 {
    5_000
}

impl PipelineSpec {
    pub fn from_yaml(text: &str) -> StreamResult<Self> {
        serde_yaml::from_str(text).map_err(|e| StreamError::config(e.to_string()))
    }

    pub fn from_json(text: &str) -> StreamResult<Self> {
        serde_json::from_str(text).map_err(|e| StreamError::config(e.to_string()))
    }

    pub fn change_capture_interval(&self) -> Duration {
        Duration::from_secs(self.change_capture_interval_secs)
    }

    pub fn grouping_interval(&self) -> Duration {
        Duration::from_millis(self.grouping_interval_ms)
    }

    /// Backfill lifecycle state for the source of this pipeline
    pub fn backfill_state(&self) -> StreamResult<BackfillState> {
        BackfillState::new(self.backfill, self.stop_after_backfill)
    }

    /// Reject configurations that must never reach a running pipeline
    pub fn validate(&self) -> StreamResult<()> {
        self.backfill_state()?;
        if self.rows_per_group == 0 {
            return Err(StreamError::config("rows_per_group must be positive"));
        }
        match (&self.source.output(), &self.sink) {
            (SourceOutput::Rows, SinkSpec::Parquet(_)) => {}
            (SourceOutput::Json, SinkSpec::Json(_) | SinkSpec::MultilineJson(_)) => {}
            (output, sink) => {
                return Err(StreamError::config(format!(
                    "source {} produces {output:?} and cannot feed a {} sink",
                    self.source.kind(),
                    sink.kind()
                )))
            }
        }
        match &self.sink {
            SinkSpec::Parquet(p) if p.row_groups_per_file == 0 => {
                Err(StreamError::config("row_groups_per_file must be positive"))
            }
            SinkSpec::Json(j) | SinkSpec::MultilineJson(j) if j.batches_per_file == 0 => {
                Err(StreamError::config("batches_per_file must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// Object storage location used by blob sources and sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageSpec {
    /// Local directory
    Local { root: String },
    /// S3-compatible bucket
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key: Option<String>,
        #[serde(default)]
        secret_key: Option<String>,
    },
    /// Azure blob container
    Azure {
        account: String,
        container: String,
        #[serde(default)]
        access_key: Option<String>,
    },
    /// Process-local store, used for dry runs
    Memory,
}

/// Element type produced by a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutput {
    Rows,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    BlobListing(BlobListingSourceSpec),
    CdmChangeFeed(CdmChangeFeedSourceSpec),
    SqlServerChangeTracking(SqlServerChangeTrackingSourceSpec),
    SqlServer(SqlServerSourceSpec),
    RestApi(RestApiSourceSpec),
    Salesforce(SalesForceSourceSpec),
}

impl SourceSpec {
    /// Stream kind as named in the stream context
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BlobListing(_) => "blob_listing",
            Self::CdmChangeFeed(_) => "cdm_change_feed",
            Self::SqlServerChangeTracking(_) => "sql_server_change_tracking",
            Self::SqlServer(_) => "sql_server",
            Self::RestApi(_) => "rest_api",
            Self::Salesforce(_) => "salesforce",
        }
    }

    pub fn output(&self) -> SourceOutput {
        match self {
            Self::BlobListing(_) | Self::RestApi(_) => SourceOutput::Json,
            _ => SourceOutput::Rows,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobListingSourceSpec {
    pub storage: StorageSpec,
    /// Prefix listed on every poll
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdmChangeFeedSourceSpec {
    pub storage: StorageSpec,
    /// Folder holding `model.json`, entity folders and `ChangeFeed`
    pub root_path: String,
    pub entity_name: String,
    #[serde(default = "default_cdm_merge_key")]
    pub merge_key_column: String,
    #[serde(default = "default_schema_update_interval_secs")]
    pub schema_update_interval_secs: u64,
    /// How far back incremental reads start when not backfilling
    #[serde(default = "default_look_back_range_secs")]
    pub look_back_range_secs: u64,
}

fn default_cdm_merge_key() -> String {
    "RECID".to_string()
}

fn default_schema_update_interval_secs() -> u64 {
    60
}

fn default_look_back_range_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlServerChangeTrackingSourceSpec {
    /// ADO.NET style connection string
    pub connection_string: String,
    #[serde(default = "default_sql_schema")]
    pub schema_name: String,
    pub table_name: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_look_back_range_secs")]
    pub look_back_range_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlServerSourceSpec {
    pub connection_string: String,
    #[serde(default = "default_sql_schema")]
    pub schema_name: String,
    pub table_name: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_sql_schema() -> String {
    "dbo".to_string()
}

fn default_command_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestApiSourceSpec {
    /// URL with `{placeholder}` fields
    pub uri_template: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    /// Optional request body with the same placeholders
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub templated_fields: Vec<TemplatedFieldSpec>,
    #[serde(default)]
    pub paging: Option<PagingSpec>,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    /// Property chain leading to the records array, e.g. `["data", "items"]`
    #[serde(default)]
    pub response_property_key_chain: Option<Vec<String>>,
    /// Start of the backfill date range (RFC 3339)
    #[serde(default)]
    pub backfill_start_date: Option<String>,
    #[serde(default = "default_look_back_range_secs")]
    pub look_back_range_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatedFieldSpec {
    pub name: String,
    pub kind: TemplatedFieldKind,
    /// chrono format string for date fields, RFC 3339 when absent
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub placement: FieldPlacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatedFieldKind {
    DateRangeStart,
    DateRangeEnd,
    PagePointer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPlacement {
    #[default]
    Url,
    Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PagingSpec {
    /// Page numbers starting at 1, total read from the first response
    Counter { total_pages_key_chain: Vec<String> },
    /// Offsets starting at 0, advanced by the page size
    Offset { page_size: u64 },
    /// Continuation token read from each response
    Token { token_key_chain: Vec<String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    #[default]
    None,
    FixedHeaders {
        headers: HashMap<String, String>,
    },
    DynamicBearer {
        token_url: String,
        #[serde(default = "default_token_method")]
        method: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_token_property")]
        token_property: String,
        #[serde(default)]
        expiration_property: Option<String>,
        #[serde(default)]
        expiration_period_secs: Option<u64>,
    },
}

fn default_token_method() -> String {
    "POST".to_string()
}

fn default_token_property() -> String {
    "access_token".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests_per_second: u64,
    #[serde(default)]
    pub burst: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesForceSourceSpec {
    /// Instance URL, e.g. `https://acme.my.salesforce.com`
    pub instance_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security_token: String,
    #[serde(default = "default_salesforce_api_version")]
    pub api_version: String,
    pub entity_name: String,
    #[serde(default = "default_job_poll_interval_secs")]
    pub job_poll_interval_secs: u64,
    #[serde(default = "default_salesforce_max_records")]
    pub max_records_per_page: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_salesforce_api_version() -> String {
    "v60.0".to_string()
}

fn default_job_poll_interval_secs() -> u64 {
    5
}

fn default_salesforce_max_records() -> u64 {
    50_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    Parquet(ParquetSinkSpec),
    Json(JsonSinkSpec),
    MultilineJson(JsonSinkSpec),
}

impl SinkSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parquet(_) => "parquet",
            Self::Json(_) => "json",
            Self::MultilineJson(_) => "multiline_json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetSinkSpec {
    pub storage: StorageSpec,
    /// Root path under which `data/`, `schema/` and `metadata/` are written
    pub path: String,
    #[serde(default = "default_groups_per_file")]
    pub row_groups_per_file: usize,
    #[serde(default)]
    pub create_schema_file: bool,
    #[serde(default = "default_true")]
    pub complete_signal: bool,
    /// Flush early once the buffered file reaches this size
    #[serde(default)]
    pub max_buffer_bytes: Option<usize>,
    #[serde(default)]
    pub metadata: Option<StreamMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSinkSpec {
    pub storage: StorageSpec,
    pub path: String,
    #[serde(default = "default_groups_per_file")]
    pub batches_per_file: usize,
    #[serde(default = "default_true")]
    pub complete_signal: bool,
    #[serde(default)]
    pub max_buffer_bytes: Option<usize>,
    #[serde(default)]
    pub metadata: Option<StreamMetadata>,
}

fn default_groups_per_file() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDM_TO_PARQUET: &str = r#"
name: "accounts"
backfill: true
stop_after_backfill: true
source:
  type: cdm_change_feed
  storage: { type: local, root: "/data/cdm" }
  root_path: "dynamics"
  entity_name: "account"
sink:
  type: parquet
  storage: { type: memory }
  path: "accounts"
  row_groups_per_file: 4
  create_schema_file: true
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let spec = PipelineSpec::from_yaml(CDM_TO_PARQUET).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.change_capture_interval(), Duration::from_secs(15));
        assert_eq!(spec.rows_per_group, 10_000);
        match &spec.source {
            SourceSpec::CdmChangeFeed(cdm) => {
                assert_eq!(cdm.merge_key_column, "RECID");
                assert_eq!(cdm.schema_update_interval_secs, 60);
            }
            other => panic!("unexpected source {other:?}"),
        }
        match &spec.sink {
            SinkSpec::Parquet(p) => {
                assert!(p.complete_signal);
                assert_eq!(p.row_groups_per_file, 4);
            }
            other => panic!("unexpected sink {other:?}"),
        }
    }

    #[test]
    fn test_stop_after_backfill_without_backfill_is_rejected() {
        let mut spec = PipelineSpec::from_yaml(CDM_TO_PARQUET).unwrap();
        spec.backfill = false;
        assert!(matches!(spec.validate(), Err(StreamError::Config(_))));
    }

    #[test]
    fn test_json_source_cannot_feed_parquet() {
        let spec = PipelineSpec::from_json(
            r#"{
                "name": "api",
                "source": { "type": "rest_api", "uri_template": "https://example.com/items" },
                "sink": { "type": "parquet", "storage": { "type": "memory" }, "path": "out" }
            }"#,
        )
        .unwrap();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("rest_api"));
    }

    #[test]
    fn test_rest_spec_parses_paging_and_auth() {
        let spec = PipelineSpec::from_json(
            r#"{
                "name": "api",
                "source": {
                    "type": "rest_api",
                    "uri_template": "https://example.com/items?page={page}",
                    "templated_fields": [{ "name": "page", "kind": "page_pointer" }],
                    "paging": { "type": "counter", "total_pages_key_chain": ["meta", "pages"] },
                    "auth": { "type": "fixed_headers", "headers": { "X-Api-Key": "secret" } }
                },
                "sink": { "type": "multiline_json", "storage": { "type": "memory" }, "path": "out" }
            }"#,
        )
        .unwrap();
        spec.validate().unwrap();
        match spec.source {
            SourceSpec::RestApi(rest) => {
                assert_eq!(rest.method, "GET");
                assert_eq!(rest.templated_fields[0].placement, FieldPlacement::Url);
                assert!(matches!(rest.paging, Some(PagingSpec::Counter { .. })));
                assert!(matches!(rest.auth, AuthSpec::FixedHeaders { .. }));
            }
            other => panic!("unexpected source {other:?}"),
        }
    }
}
