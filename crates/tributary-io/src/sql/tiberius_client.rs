use super::client::{SqlClient, SqlResultSet};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use tributary_core::{CellValue, StreamError, StreamResult};

fn map_tds_error(e: tiberius::error::Error) -> StreamError {
    match e {
        tiberius::error::Error::Io { message, .. } => StreamError::io(message),
        other => StreamError::Other(anyhow::anyhow!("sql server error: {other}")),
    }
}

/// [`SqlClient`] over a single tiberius connection, opened on first use
pub struct TiberiusClient {
    connection_string: String,
    command_timeout: Duration,
    client: Option<Client<Compat<TcpStream>>>,
}

impl TiberiusClient {
    pub fn new(connection_string: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            connection_string: connection_string.into(),
            command_timeout,
            client: None,
        }
    }

    async fn connect(&self) -> StreamResult<Client<Compat<TcpStream>>> {
        let config = Config::from_ado_string(&self.connection_string)
            .map_err(|e| StreamError::config(format!("invalid connection string: {e}")))?;
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(map_tds_error)?;
        info!("connected to SQL Server");
        Ok(client)
    }

    async fn query(&mut self, query: &str) -> StreamResult<SqlResultSet> {
        if self.client.is_none() {
            self.client = Some(self.connect().await?);
        }
        let Some(client) = self.client.as_mut() else {
            return Err(StreamError::io("SQL Server connection unavailable"));
        };
        debug!(query, "executing query");
        let rows = client
            .query(query, &[])
            .await
            .map_err(map_tds_error)?
            .into_first_result()
            .await
            .map_err(map_tds_error)?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let values = rows
            .iter()
            .map(|row| (0..row.columns().len()).map(|i| cell_value(row, i)).collect())
            .collect();
        Ok(SqlResultSet::new(columns, values))
    }
}

/// Probe the driver types in turn; null and unknown values fall through to `Null`
fn cell_value(row: &tiberius::Row, idx: usize) -> CellValue {
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return CellValue::Boolean(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return CellValue::Int64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return CellValue::Int64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return CellValue::Int64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return CellValue::Int64(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return CellValue::Double(v as f64);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return CellValue::Double(v);
    }
    if let Ok(Some(v)) = row.try_get::<Numeric, _>(idx) {
        return CellValue::Decimal {
            unscaled: v.value(),
            scale: v.scale() as i8,
        };
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return CellValue::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::Uuid, _>(idx) {
        return CellValue::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<DateTime<FixedOffset>, _>(idx) {
        return CellValue::DateTime(v.with_timezone(&Utc));
    }
    if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(idx) {
        return CellValue::DateTime(v.and_utc());
    }
    if let Ok(Some(v)) = row.try_get::<NaiveDate, _>(idx) {
        if let Some(v) = v.and_hms_opt(0, 0, 0) {
            return CellValue::DateTime(v.and_utc());
        }
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
        return CellValue::Bytes(v.to_vec());
    }
    CellValue::Null
}

#[async_trait]
impl SqlClient for TiberiusClient {
    async fn execute_reader(&mut self, query: &str) -> StreamResult<SqlResultSet> {
        match tokio::time::timeout(self.command_timeout, self.query(query)).await {
            Ok(result) => result,
            Err(_) => {
                // the connection is in an unknown state after an abandoned query
                self.client = None;
                Err(StreamError::Timeout(format!(
                    "query exceeded {}s",
                    self.command_timeout.as_secs()
                )))
            }
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(map_tds_error)?;
            debug!("SQL Server connection closed");
        }
        Ok(())
    }
}
