//! CDM `model.json` manifest

use serde::Deserialize;
use tributary_core::{FieldType, Schema, SchemaField, StreamError, StreamResult};

pub const MANIFEST_FILE: &str = "model.json";

/// Precision used for CDM `decimal` attributes, which carry no explicit scale
pub const CDM_DECIMAL: FieldType = FieldType::Decimal {
    precision: 38,
    scale: 18,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CdmManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entities: Vec<CdmEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdmEntity {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<CdmAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdmAttribute {
    pub name: String,
    pub data_type: String,
}

impl CdmManifest {
    pub fn entity(&self, name: &str) -> Option<&CdmEntity> {
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Schema of an entity, without the merge key column
    pub fn entity_schema(&self, name: &str) -> StreamResult<Schema> {
        let entity = self
            .entity(name)
            .ok_or_else(|| StreamError::SchemaNotFound(format!("entity {name} not in manifest")))?;
        let fields = entity
            .attributes
            .iter()
            .map(|a| Ok(SchemaField::new(&a.name, attribute_type(&a.data_type)?, true)))
            .collect::<StreamResult<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }
}

/// Map a CDM data type name
pub fn attribute_type(data_type: &str) -> StreamResult<FieldType> {
    let field_type = match data_type.to_ascii_lowercase().as_str() {
        "string" => FieldType::String,
        "guid" => FieldType::Guid,
        "int16" | "int32" | "integer" => FieldType::Int32,
        "int64" => FieldType::Int64,
        "double" | "float" => FieldType::Double,
        "decimal" => CDM_DECIMAL,
        "boolean" => FieldType::Boolean,
        "datetime" => FieldType::DateTime,
        "datetimeoffset" => FieldType::DateTimeOffset,
        "date" => FieldType::Date,
        "binary" => FieldType::Binary,
        other => return Err(StreamError::UnsupportedType(format!("CDM data type {other}"))),
    };
    Ok(field_type)
}
