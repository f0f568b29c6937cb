use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbterm_core::connection_manager::{BackendError, ConnectionBackend};
use dbterm_core::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream};
use dbterm_core::resolver::DialTarget;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls, Row};
use tracing::{debug, warn};

type BoxError = Box<dyn Error + Sync + Send>;

#[derive(Debug, Clone, Default)]
pub struct PostgresBackend;

#[async_trait]
impl ConnectionBackend for PostgresBackend {
    type Connection = PostgresConnection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError> {
        let (client, connection) = tokio_postgres::connect(&target.dial_string, NoTls)
            .await
            .map_err(|error| BackendError::new(format_postgres_error(&error)))?;
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(error = %error, "postgres connection closed with error");
            }
        });

        Ok(PostgresConnection {
            client: Arc::new(client),
            driver: Arc::new(driver),
            io_timeout: target.io_timeout,
        })
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), BackendError> {
        connection.driver.abort();
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresConnection {
    client: Arc<Client>,
    driver: Arc<JoinHandle<()>>,
    io_timeout: Duration,
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("closed", &self.client.is_closed())
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl PostgresConnection {
    async fn bounded<T>(
        &self,
        future: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> Result<T, QueryBackendError> {
        match tokio::time::timeout(self.io_timeout, future).await {
            Ok(result) => {
                result.map_err(|error| QueryBackendError::new(format_postgres_error(&error)))
            }
            Err(_) => Err(QueryBackendError::new("i/o timeout")),
        }
    }
}

#[async_trait]
impl QueryBackend for PostgresConnection {
    type Stream = PostgresRowStream;

    async fn ping(&self) -> Result<(), QueryBackendError> {
        if self.client.is_closed() {
            return Err(QueryBackendError::new("connection closed"));
        }
        self.bounded(self.client.simple_query("SELECT 1"))
            .await
            .map(|_| ())
    }

    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
        // Preparing first gives column names even when no rows come back.
        let statement = self.bounded(self.client.prepare(sql)).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        let rows = self
            .bounded(
                self.client
                    .query_raw(&statement, std::iter::empty::<String>()),
            )
            .await?;

        Ok(PostgresRowStream {
            columns,
            rows: Some(Box::pin(rows)),
            cancel_token: self.client.cancel_token(),
            io_timeout: self.io_timeout,
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
        self.bounded(self.client.execute(sql, &[])).await
    }
}

pub struct PostgresRowStream {
    columns: Vec<String>,
    rows: Option<Pin<Box<tokio_postgres::RowStream>>>,
    cancel_token: CancelToken,
    io_timeout: Duration,
}

impl fmt::Debug for PostgresRowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRowStream")
            .field("columns", &self.columns)
            .field("open", &self.rows.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RowStream for PostgresRowStream {
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
        Ok(self.columns.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };

        let next = tokio::time::timeout(self.io_timeout, rows.next())
            .await
            .map_err(|_| QueryBackendError::new("i/o timeout"))?;
        match next {
            Some(Ok(row)) => Ok(Some(
                (0..row.len()).map(|index| cell_value(&row, index)).collect(),
            )),
            Some(Err(error)) => Err(QueryBackendError::new(format_postgres_error(&error))),
            None => {
                self.rows = None;
                Ok(None)
            }
        }
    }

    /// Asks the server to stop the statement before dropping the stream, so
    /// the connection is not left draining rows nobody reads.
    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        if self.rows.take().is_none() {
            return Ok(());
        }
        match tokio::time::timeout(self.io_timeout, self.cancel_token.cancel_query(NoTls)).await {
            Ok(Ok(())) => debug!("postgres statement cancelled"),
            Ok(Err(error)) => {
                debug!(error = %format_postgres_error(&error), "postgres cancel request failed");
            }
            Err(_) => debug!("postgres cancel request timed out"),
        }
        Ok(())
    }
}

fn cell_value(row: &Row, index: usize) -> CellValue {
    let column_type = row.columns()[index].type_().clone();
    let value = match column_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)
            .map(|value| value.map(CellValue::Bool)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|value| value.map(|value| CellValue::Int(value.into()))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .map(|value| value.map(|value| CellValue::Int(value.into()))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .map(|value| value.map(CellValue::Int)),
        Type::OID => row
            .try_get::<_, Option<u32>>(index)
            .map(|value| value.map(|value| CellValue::Int(value.into()))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|value| value.map(|value| CellValue::Float(value.into()))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .map(|value| value.map(CellValue::Float)),
        Type::NUMERIC => row
            .try_get::<_, Option<NumericText>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.0))),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(index)
            .map(|value| value.map(CellValue::Binary)),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_string()))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_string()))),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_string()))),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_string()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_string()))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(index)
            .map(|value| value.map(|value| CellValue::Text(value.to_rfc3339()))),
        _ => row
            .try_get::<_, Option<RawBytes>>(index)
            .map(|value| value.map(|value| bytes_value(value.0))),
    };

    match value {
        Ok(Some(cell)) => cell,
        Ok(None) => CellValue::Null,
        Err(error) => CellValue::Text(format!("<{column_type}: {error}>")),
    }
}

fn bytes_value(bytes: Vec<u8>) -> CellValue {
    match String::from_utf8(bytes) {
        Ok(text) => CellValue::Text(text),
        Err(error) => CellValue::Binary(error.into_bytes()),
    }
}

/// NUMERIC rendered from its binary wire form without losing precision.
#[derive(Debug)]
struct NumericText(String);

impl NumericText {
    fn parse(raw: &[u8]) -> Result<String, BoxError> {
        let header = |offset: usize| -> Result<u16, BoxError> {
            raw.get(offset..offset + 2)
                .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
                .ok_or_else(|| "invalid NUMERIC payload: too short".into())
        };

        let ndigits = usize::from(header(0)?);
        #[allow(clippy::cast_possible_wrap)]
        let weight = header(2)? as i16;
        let sign = header(4)?;
        let dscale = usize::from(header(6)?);

        if sign == 0xC000 {
            return Ok("NaN".to_string());
        }

        let mut digits = Vec::with_capacity(ndigits);
        for group_index in 0..ndigits {
            let group = header(8 + group_index * 2)?;
            if group > 9999 {
                return Err("invalid NUMERIC payload: group out of range".into());
            }
            digits.push(group);
        }

        let integer_groups = usize::try_from(i32::from(weight) + 1).unwrap_or(0);
        let mut integer_text = String::new();
        for group_index in 0..integer_groups {
            let group = digits.get(group_index).copied().unwrap_or(0);
            if integer_text.is_empty() {
                if group != 0 {
                    integer_text.push_str(&group.to_string());
                }
            } else {
                integer_text.push_str(&format!("{group:04}"));
            }
        }
        if integer_text.is_empty() {
            integer_text.push('0');
        }

        let mut fraction_text = String::new();
        if dscale > 0 {
            // Negative weights mean leading zero groups after the point.
            let leading_zero_groups = usize::try_from(-i32::from(weight) - 1).unwrap_or(0);
            for _ in 0..leading_zero_groups {
                fraction_text.push_str("0000");
            }
            for group in digits.iter().skip(integer_groups) {
                fraction_text.push_str(&format!("{group:04}"));
            }
            if fraction_text.len() < dscale {
                fraction_text.push_str(&"0".repeat(dscale - fraction_text.len()));
            } else {
                fraction_text.truncate(dscale);
            }
        }

        let mut output = String::new();
        if sign == 0x4000 {
            output.push('-');
        }
        output.push_str(&integer_text);
        if !fraction_text.is_empty() {
            output.push('.');
            output.push_str(&fraction_text);
        }
        Ok(output)
    }
}

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Any other type (enums, domains, extensions) taken as its raw payload.
#[derive(Debug)]
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let mut message = db_error.message().to_string();
    if let Some(detail) = db_error.detail().filter(|detail| !detail.trim().is_empty()) {
        message.push_str(&format!(" (detail: {detail})"));
    }
    if let Some(hint) = db_error.hint().filter(|hint| !hint.trim().is_empty()) {
        message.push_str(&format!(" (hint: {hint})"));
    }
    message
}
