//! Typed rows to Arrow record batches
//!
//! One batch of rows becomes one Parquet row group. The field count of every
//! row is checked against the schema before any column is built, so an
//! inconsistent batch never reaches the writer.

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Date32Builder, Decimal128Builder, Float64Builder,
    Int32Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::{new_null_array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, TimeUnit};
use std::sync::Arc;
use tributary_core::schema::{check_field_count, to_arrow_type};
use tributary_core::{CellValue, Row, Schema, StreamError, StreamResult};

const SECONDS_PER_DAY: i64 = 86_400;

/// Build a record batch from rows in schema order
pub fn build_record_batch(schema: &Schema, rows: &[Row]) -> StreamResult<RecordBatch> {
    check_field_count(schema, rows)?;
    let arrow_schema = schema.to_arrow();
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(arrow_schema));
    }

    let columns = schema
        .fields
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let values: Vec<&CellValue> = rows.iter().map(|row| &row[index].value).collect();
            build_column(&field.name, &to_arrow_type(&field.field_type), &values)
        })
        .collect::<StreamResult<Vec<ArrayRef>>>()?;

    Ok(RecordBatch::try_new(arrow_schema, columns)?)
}

fn mismatch(column: &str, expected: &str, value: &CellValue) -> StreamError {
    StreamError::Serialization(format!(
        "column {column} expects {expected}, got {value:?}"
    ))
}

fn build_column(column: &str, data_type: &DataType, values: &[&CellValue]) -> StreamResult<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    CellValue::String(s) => builder.append_value(s),
                    other => builder.append_option(other.as_text()),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int32 => {
            let mut builder = Int32Builder::with_capacity(values.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Int64(v) => builder.append_value(
                        i32::try_from(*v).map_err(|_| mismatch(column, "a 32-bit integer", value))?,
                    ),
                    other => return Err(mismatch(column, "an integer", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Int64(v) => builder.append_value(*v),
                    other => return Err(mismatch(column, "an integer", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Double(v) => builder.append_value(*v),
                    CellValue::Int64(v) => builder.append_value(*v as f64),
                    other => return Err(mismatch(column, "a double", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Decimal128(precision, scale) => {
            let mut builder = Decimal128Builder::with_capacity(values.len())
                .with_precision_and_scale(*precision, *scale)?;
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Decimal { unscaled, scale: from } => builder
                        .append_value(rescale(*unscaled, *from, *scale).ok_or_else(|| {
                            mismatch(column, "a decimal of matching scale", value)
                        })?),
                    CellValue::Int64(v) => builder.append_value(
                        rescale(*v as i128, 0, *scale)
                            .ok_or_else(|| mismatch(column, "a decimal", value))?,
                    ),
                    other => return Err(mismatch(column, "a decimal", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(values.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Boolean(v) => builder.append_value(*v),
                    other => return Err(mismatch(column, "a boolean", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(values.len())
                .with_timezone_opt(tz.clone());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::DateTime(v) => builder.append_value(v.timestamp_micros()),
                    other => return Err(mismatch(column, "a timestamp", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Date32 => {
            let mut builder = Date32Builder::with_capacity(values.len());
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::DateTime(v) => builder
                        .append_value(v.timestamp().div_euclid(SECONDS_PER_DAY) as i32),
                    other => return Err(mismatch(column, "a date", other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    CellValue::Bytes(v) => builder.append_value(v),
                    CellValue::String(s) => builder.append_value(s.as_bytes()),
                    other => return Err(mismatch(column, "binary data", other)),
                }
            }
            Arc::new(builder.finish())
        }
        // nested values never travel as cells, only null structs can be written
        other => {
            if values.iter().all(|v| v.is_null()) {
                new_null_array(other, values.len())
            } else {
                return Err(StreamError::UnsupportedType(format!(
                    "column {column} of type {other} cannot be written from scalar cells"
                )));
            }
        }
    };
    Ok(array)
}

fn rescale(unscaled: i128, from: i8, to: i8) -> Option<i128> {
    match to.cmp(&from) {
        std::cmp::Ordering::Equal => Some(unscaled),
        std::cmp::Ordering::Greater => {
            let shift = (i32::from(to) - i32::from(from)) as u32;
            10i128.checked_pow(shift)?.checked_mul(unscaled)
        }
        std::cmp::Ordering::Less => {
            let factor = 10i128.checked_pow((i32::from(from) - i32::from(to)) as u32)?;
            (unscaled % factor == 0).then(|| unscaled / factor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Array, Decimal128Array, Int32Array, StringArray, TimestampMicrosecondArray};
    use chrono::{TimeZone, Utc};
    use tributary_core::{DataCell, FieldType, SchemaField};

    fn schema() -> Schema {
        Schema::new(vec![
            SchemaField::new("id", FieldType::Int32, false),
            SchemaField::new("name", FieldType::String, true),
            SchemaField::new("amount", FieldType::Decimal { precision: 10, scale: 2 }, true),
            SchemaField::new("modified", FieldType::DateTime, true),
        ])
    }

    fn row(id: i64, name: Option<&str>) -> Row {
        vec![
            DataCell::new("id", FieldType::Int32, CellValue::Int64(id)),
            DataCell::new(
                "name",
                FieldType::String,
                name.map(|n| CellValue::String(n.into())).unwrap_or(CellValue::Null),
            ),
            DataCell::new(
                "amount",
                FieldType::Decimal { precision: 10, scale: 2 },
                CellValue::Decimal { unscaled: 1050, scale: 2 },
            ),
            DataCell::new(
                "modified",
                FieldType::DateTime,
                CellValue::DateTime(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            ),
        ]
    }

    #[test]
    fn test_build_typed_columns() {
        let batch = build_record_batch(&schema(), &[row(1, Some("a")), row(2, None)]).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.value(1), 2);
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "a");
        assert!(names.is_null(1));
        let amounts = batch.column(2).as_any().downcast_ref::<Decimal128Array>().unwrap();
        assert_eq!(amounts.value(0), 1050);
        let stamps = batch
            .column(3)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(
            stamps.value(0),
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap().timestamp_micros()
        );
    }

    #[test]
    fn test_field_count_mismatch_is_inconsistent() {
        let mut short = row(3, Some("c"));
        short.pop();
        let err = build_record_batch(&schema(), &[row(1, None), short]).unwrap_err();
        assert!(matches!(
            err,
            StreamError::SchemaInconsistent { expected: 4, actual: 3 }
        ));
    }

    #[test]
    fn test_null_in_required_column_fails() {
        let mut bad = row(1, None);
        bad[0].value = CellValue::Null;
        assert!(build_record_batch(&schema(), &[bad]).is_err());
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(105, 1, 3), Some(10_500));
        assert_eq!(rescale(10_500, 3, 1), Some(105));
        assert_eq!(rescale(10_501, 3, 1), None);
        assert_eq!(rescale(7, -2, 2), Some(70_000));
    }

    #[test]
    fn test_rescale_across_extreme_scales_overflows_to_none() {
        assert_eq!(rescale(1, -100, 100), None);
        assert_eq!(rescale(1, 100, -100), None);
        assert_eq!(rescale(5, i8::MIN, i8::MAX), None);
    }
}
