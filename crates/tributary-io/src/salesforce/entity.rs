//! Entity field metadata and schema mapping

use serde::Deserialize;
use tributary_core::{FieldType, Schema, SchemaField, StreamError, StreamResult};

/// Field carrying the record id, used as merge key
pub const ID_FIELD: &str = "Id";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldDefinition {
    pub qualified_api_name: String,
    pub value_type_id: String,
    #[serde(default)]
    pub is_nillable: bool,
}

pub fn field_definitions_soql(entity: &str) -> String {
    format!(
        "SELECT QualifiedApiName, ValueTypeId, IsNillable FROM FieldDefinition \
         WHERE EntityDefinition.QualifiedApiName = '{}'",
        entity.replace('\'', "\\'")
    )
}

/// `None` for compound and binary fields, which bulk queries cannot select
pub fn field_type(value_type_id: &str) -> Option<FieldType> {
    let field_type = match value_type_id.to_ascii_lowercase().as_str() {
        "address" | "location" | "base64" => return None,
        "boolean" => FieldType::Boolean,
        "int" => FieldType::Int32,
        "long" => FieldType::Int64,
        "double" | "currency" | "percent" => FieldType::Double,
        "date" => FieldType::Date,
        "datetime" => FieldType::DateTime,
        _ => FieldType::String,
    };
    Some(field_type)
}

/// Schema of the entity with the merge key appended
pub fn entity_schema(entity: &str, definitions: &[FieldDefinition]) -> StreamResult<Schema> {
    let fields: Vec<SchemaField> = definitions
        .iter()
        .filter_map(|d| {
            field_type(&d.value_type_id).map(|t| {
                let nullable = d.is_nillable && d.qualified_api_name != ID_FIELD;
                SchemaField::new(&d.qualified_api_name, t, nullable)
            })
        })
        .collect();
    if fields.is_empty() {
        return Err(StreamError::SchemaNotFound(entity.to_string()));
    }
    if !fields.iter().any(|f| f.name == ID_FIELD) {
        return Err(StreamError::MissingMergeKey {
            entity: entity.to_string(),
            field: ID_FIELD.into(),
        });
    }
    Ok(Schema::new(fields).with_merge_key())
}
