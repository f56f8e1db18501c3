//! Table introspection and result conversion

use super::client::{SqlClient, SqlResultSet};
use super::query::{columns_query, primary_key_query};
use tracing::info;
use tributary_core::{
    CellValue, DataCell, FieldType, Row, Schema, SchemaField, StreamError, StreamResult,
};

/// Columns and primary key of a table, discovered once at start
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescription {
    pub columns: Vec<SchemaField>,
    pub primary_keys: Vec<String>,
}

impl TableDescription {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

pub async fn describe_table(
    client: &mut dyn SqlClient,
    schema: &str,
    table: &str,
) -> StreamResult<TableDescription> {
    let result = client.execute_reader(&columns_query(schema, table)).await?;
    if result.is_empty() {
        return Err(StreamError::SchemaNotFound(format!("{schema}.{table}")));
    }
    let columns = result
        .rows
        .iter()
        .map(|row| column_field(&result, row))
        .collect::<StreamResult<Vec<_>>>()?;

    let keys = client.execute_reader(&primary_key_query(schema, table)).await?;
    let primary_keys: Vec<String> = keys
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(CellValue::as_text))
        .collect();
    if primary_keys.is_empty() {
        return Err(StreamError::MissingMergeKey {
            entity: format!("{schema}.{table}"),
            field: "primary key".into(),
        });
    }

    info!(
        table = %format!("{schema}.{table}"),
        columns = columns.len(),
        keys = ?primary_keys,
        "table described"
    );
    Ok(TableDescription {
        columns,
        primary_keys,
    })
}

fn column_field(result: &SqlResultSet, row: &[CellValue]) -> StreamResult<SchemaField> {
    let name = result
        .value(row, "COLUMN_NAME")
        .as_text()
        .ok_or_else(|| StreamError::parse("column without a name"))?;
    let data_type = result.value(row, "DATA_TYPE").as_text().unwrap_or_default();
    let nullable = result
        .value(row, "IS_NULLABLE")
        .as_text()
        .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
    let precision = match result.value(row, "NUMERIC_PRECISION") {
        CellValue::Int64(v) => Some(*v),
        _ => None,
    };
    let scale = match result.value(row, "NUMERIC_SCALE") {
        CellValue::Int64(v) => Some(*v),
        _ => None,
    };
    Ok(SchemaField::new(name, sql_type(&data_type, precision, scale)?, nullable))
}

/// Map a SQL Server type name
pub fn sql_type(data_type: &str, precision: Option<i64>, scale: Option<i64>) -> StreamResult<FieldType> {
    let field_type = match data_type.to_ascii_lowercase().as_str() {
        "bit" => FieldType::Boolean,
        "tinyint" | "smallint" | "int" => FieldType::Int32,
        "bigint" => FieldType::Int64,
        "real" | "float" => FieldType::Double,
        "money" => FieldType::Decimal { precision: 19, scale: 4 },
        "smallmoney" => FieldType::Decimal { precision: 10, scale: 4 },
        "decimal" | "numeric" => FieldType::Decimal {
            precision: precision.unwrap_or(18).clamp(1, 38) as u8,
            scale: scale.unwrap_or(0).clamp(0, 38) as i8,
        },
        "date" => FieldType::Date,
        "datetime" | "datetime2" | "smalldatetime" => FieldType::DateTime,
        "datetimeoffset" => FieldType::DateTimeOffset,
        "uniqueidentifier" => FieldType::Guid,
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "xml" | "time" => {
            FieldType::String
        }
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => FieldType::Binary,
        other => return Err(StreamError::UnsupportedType(format!("SQL Server type {other}"))),
    };
    Ok(field_type)
}

/// Pair result values with schema fields by position
pub fn to_row(schema: &Schema, values: Vec<CellValue>) -> StreamResult<Row> {
    if values.len() != schema.len() {
        return Err(StreamError::SchemaInconsistent {
            expected: schema.len(),
            actual: values.len(),
        });
    }
    Ok(schema
        .fields
        .iter()
        .zip(values)
        .map(|(field, value)| DataCell::new(&field.name, field.field_type.clone(), value))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSqlClient;

    #[tokio::test]
    async fn test_describe_table() {
        let mut client = MockSqlClient::new(|query| {
            if query.contains("INFORMATION_SCHEMA.COLUMNS") {
                Ok(SqlResultSet::new(
                    vec!["COLUMN_NAME".into(), "DATA_TYPE".into(), "IS_NULLABLE".into(), "NUMERIC_PRECISION".into(), "NUMERIC_SCALE".into()],
                    vec![
                        vec!["id".into(), "int".into(), "NO".into(), CellValue::Int64(10), CellValue::Int64(0)],
                        vec!["amount".into(), "decimal".into(), "YES".into(), CellValue::Int64(12), CellValue::Int64(2)],
                    ],
                ))
            } else {
                Ok(SqlResultSet::new(vec!["COLUMN_NAME".into()], vec![vec!["id".into()]]))
            }
        });
        let table = describe_table(&mut client, "dbo", "orders").await.unwrap();
        assert_eq!(table.primary_keys, vec!["id".to_string()]);
        assert_eq!(table.columns[0].field_type, FieldType::Int32);
        assert!(!table.columns[0].nullable);
        assert_eq!(
            table.columns[1].field_type,
            FieldType::Decimal { precision: 12, scale: 2 }
        );
    }

    #[tokio::test]
    async fn test_table_without_primary_key_is_rejected() {
        let mut client = MockSqlClient::new(|query| {
            if query.contains("INFORMATION_SCHEMA.COLUMNS") {
                Ok(SqlResultSet::new(
                    vec!["COLUMN_NAME".into(), "DATA_TYPE".into()],
                    vec![vec!["id".into(), "int".into()]],
                ))
            } else {
                Ok(SqlResultSet::default())
            }
        });
        assert!(matches!(
            describe_table(&mut client, "dbo", "heap").await,
            Err(StreamError::MissingMergeKey { .. })
        ));
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            sql_type("geography", None, None),
            Err(StreamError::UnsupportedType(_))
        ));
    }
}
