use async_trait::async_trait;
use tributary_core::{CellValue, StreamResult};

/// Rows returned by one query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl SqlResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value of a named column, `Null` when the column is absent
    pub fn value<'a>(&'a self, row: &'a [CellValue], name: &str) -> &'a CellValue {
        self.column_index(name)
            .and_then(|i| row.get(i))
            .unwrap_or(&CellValue::Null)
    }
}

/// SQL capability used by the SQL Server sources
///
/// One client serves one pipeline, so calls take `&mut self` and never overlap.
#[async_trait]
pub trait SqlClient: Send {
    async fn execute_reader(&mut self, query: &str) -> StreamResult<SqlResultSet>;

    /// First column of the first row, `Null` when the query returns nothing
    async fn execute_scalar(&mut self, query: &str) -> StreamResult<CellValue> {
        let result = self.execute_reader(query).await?;
        Ok(result
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(CellValue::Null))
    }

    /// Release the connection
    async fn close(&mut self) -> StreamResult<()>;
}
