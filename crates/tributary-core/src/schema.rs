//! Stream schemas and row validation

use crate::data::{FieldType, Row, MERGE_KEY_FIELD};
use crate::error::{StreamError, StreamResult};
use arrow_schema::{DataType, Field, Fields, SchemaRef, TimeUnit};
use std::collections::HashSet;
use std::sync::Arc;

/// Descriptor of one column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

/// Ordered list of fields describing every row of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Count-based compatibility used when wiring and validating batches
    pub fn is_compatible_with(&self, other: &Schema) -> bool {
        self.fields.len() == other.fields.len()
    }

    /// Structural equality: same set of name/type/nullable descriptors
    pub fn structurally_equals(&self, other: &Schema) -> bool {
        let left: HashSet<&SchemaField> = self.fields.iter().collect();
        let right: HashSet<&SchemaField> = other.fields.iter().collect();
        self.fields.len() == other.fields.len() && left == right
    }

    /// Describe the first difference between two schemas, for error messages
    pub fn describe_difference(&self, other: &Schema) -> String {
        let left: HashSet<&SchemaField> = self.fields.iter().collect();
        let right: HashSet<&SchemaField> = other.fields.iter().collect();
        let removed: Vec<&str> = left.difference(&right).map(|f| f.name.as_str()).collect();
        let added: Vec<&str> = right.difference(&left).map(|f| f.name.as_str()).collect();
        format!("removed or changed: {removed:?}, added or changed: {added:?}")
    }

    /// Schema with the merge key column appended, unless already present
    pub fn with_merge_key(mut self) -> Self {
        if !self.fields.iter().any(|f| f.name == MERGE_KEY_FIELD) {
            self.fields
                .push(SchemaField::new(MERGE_KEY_FIELD, FieldType::String, false));
        }
        self
    }

    /// Arrow representation used by the Parquet writer
    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(arrow_schema::Schema::new(
            self.fields.iter().map(to_arrow_field).collect::<Vec<_>>(),
        ))
    }
}

fn to_arrow_field(field: &SchemaField) -> Field {
    Field::new(&field.name, to_arrow_type(&field.field_type), field.nullable)
}

/// Map a semantic field type to its Arrow type
pub fn to_arrow_type(field_type: &FieldType) -> DataType {
    match field_type {
        FieldType::String | FieldType::Guid => DataType::Utf8,
        FieldType::Int32 => DataType::Int32,
        FieldType::Int64 => DataType::Int64,
        FieldType::Double => DataType::Float64,
        FieldType::Decimal { precision, scale } => DataType::Decimal128(*precision, *scale),
        FieldType::Boolean => DataType::Boolean,
        FieldType::DateTime | FieldType::DateTimeOffset => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        FieldType::Date => DataType::Date32,
        FieldType::Binary => DataType::Binary,
        FieldType::Struct(children) => {
            DataType::Struct(Fields::from(children.iter().map(to_arrow_field).collect::<Vec<_>>()))
        }
    }
}

/// Validates row batches against an expected schema
///
/// Implementations are shared between a schema-bound source and sink, so the
/// type parameter of the validator is what makes a pair connectable.
pub trait SchemaValidator: Send + Sync + 'static {
    /// Expected schema of every row
    fn schema(&self) -> &Schema;

    /// Check a batch before it reaches the sink
    fn validate(&self, batch: &[Row]) -> StreamResult<()>;
}

/// Validator comparing the number of cells in each row to the schema
#[derive(Debug, Clone)]
pub struct FieldCountValidator {
    schema: Schema,
}

impl FieldCountValidator {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }
}

impl SchemaValidator for FieldCountValidator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn validate(&self, batch: &[Row]) -> StreamResult<()> {
        check_field_count(&self.schema, batch)
    }
}

/// Every row must carry exactly as many cells as the schema has fields
pub fn check_field_count(schema: &Schema, batch: &[Row]) -> StreamResult<()> {
    match batch.iter().find(|row| row.len() != schema.len()) {
        Some(row) => Err(StreamError::SchemaInconsistent {
            expected: schema.len(),
            actual: row.len(),
        }),
        None => Ok(()),
    }
}
