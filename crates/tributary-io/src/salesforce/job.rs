//! Bulk API 2.0 query jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the position of the next results page
pub const LOCATOR_HEADER: &str = "Sforce-Locator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Open,
    UploadComplete,
    InProgress,
    Aborted,
    JobComplete,
    Failed,
}

impl JobState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Open | Self::UploadComplete | Self::InProgress)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Aborted | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJob {
    pub id: String,
    pub state: JobState,
    #[serde(default)]
    pub object: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateQueryJob<'a> {
    pub operation: &'static str,
    pub query: &'a str,
    pub content_type: &'static str,
    pub column_delimiter: &'static str,
    pub line_ending: &'static str,
}

impl<'a> CreateQueryJob<'a> {
    pub fn csv(query: &'a str) -> Self {
        Self {
            operation: "query",
            query,
            content_type: "CSV",
            column_delimiter: "COMMA",
            line_ending: "LF",
        }
    }
}

/// One page of CSV results
#[derive(Debug, Clone)]
pub struct ResultPage {
    pub csv: String,
    /// `None` once the last page has been read
    pub locator: Option<String>,
}

/// Locator header value; the API sends the literal `null` on the last page
pub fn parse_locator(header: Option<&str>) -> Option<String> {
    header
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

/// SOQL for one extraction cycle
pub fn query_soql(entity: &str, fields: &[String], modified_since: Option<DateTime<Utc>>) -> String {
    let mut soql = format!("SELECT {} FROM {entity}", fields.join(", "));
    if let Some(since) = modified_since {
        soql.push_str(&format!(
            " WHERE SystemModstamp > {}",
            since.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    soql
}
