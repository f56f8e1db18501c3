//! Stream metadata and source identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// How sink output is partitioned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPartition {
    pub name: String,
    pub field_name: String,
    pub field_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_expression: Option<String>,
    #[serde(default)]
    pub is_date_partition: bool,
}

/// Optional metadata emitted next to the data
///
/// `partitions: None` means no partitioning metadata file is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub partitions: Option<Vec<StreamPartition>>,
}

/// Identity of a source, attached to its logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTags {
    pub source_entity: String,
    pub source_location: String,
}

impl SourceTags {
    pub fn new(source_entity: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            source_entity: source_entity.into(),
            source_location: source_location.into(),
        }
    }
}

impl fmt::Display for SourceTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source_entity, self.source_location)
    }
}
