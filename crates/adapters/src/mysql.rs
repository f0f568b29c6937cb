use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use dbterm_core::connection_manager::{BackendError, ConnectionBackend};
use dbterm_core::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream};
use dbterm_core::resolver::DialTarget;
use futures_util::StreamExt;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::{Query, Queryable};
use mysql_async::{Column, Opts, Pool, ResultSetStream, Row, TextProtocol, Value};
use tracing::debug;

/// Character set id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

#[derive(Debug, Clone, Default)]
pub struct MysqlBackend;

#[async_trait]
impl ConnectionBackend for MysqlBackend {
    type Connection = MysqlConnection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError> {
        let opts = Opts::from_url(&target.dial_string)
            .map_err(|error| BackendError::new(error.to_string()))?;
        let connection = MysqlConnection {
            pool: Pool::new(opts),
            io_timeout: target.io_timeout,
        };
        // Pools dial lazily; check out one connection so bad credentials fail here.
        let conn = connection
            .bounded(connection.pool.get_conn())
            .await
            .map_err(|error| BackendError::new(error.message()))?;
        drop(conn);
        Ok(connection)
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), BackendError> {
        connection
            .pool
            .disconnect()
            .await
            .map_err(|error| BackendError::new(error.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct MysqlConnection {
    pool: Pool,
    io_timeout: Duration,
}

impl MysqlConnection {
    async fn bounded<T>(
        &self,
        future: impl Future<Output = Result<T, mysql_async::Error>>,
    ) -> Result<T, QueryBackendError> {
        match tokio::time::timeout(self.io_timeout, future).await {
            Ok(result) => result.map_err(to_query_error),
            Err(_) => Err(QueryBackendError::new("i/o timeout")),
        }
    }
}

#[async_trait]
impl QueryBackend for MysqlConnection {
    type Stream = MysqlRowStream;

    async fn ping(&self) -> Result<(), QueryBackendError> {
        let mut conn = self.bounded(self.pool.get_conn()).await?;
        self.bounded(conn.ping()).await
    }

    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
        let conn = self.bounded(self.pool.get_conn()).await?;
        let connection_id = conn.id();
        let stream = self
            .bounded(sql.to_string().stream::<Row, _>(conn))
            .await?;
        Ok(MysqlRowStream {
            stream: Some(stream),
            peeked: None,
            columns: None,
            pool: self.pool.clone(),
            connection_id,
            io_timeout: self.io_timeout,
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
        let mut conn = self.bounded(self.pool.get_conn()).await?;
        self.bounded(conn.query_drop(sql)).await?;
        Ok(conn.affected_rows())
    }
}

/// Streams rows from the text protocol. Column metadata comes from the first
/// row, so an empty result reports no columns.
pub struct MysqlRowStream {
    stream: Option<ResultSetStream<'static, 'static, 'static, Row, TextProtocol>>,
    peeked: Option<Row>,
    columns: Option<Vec<ColumnShape>>,
    /// Pool and server thread id used to kill the statement on cancel.
    pool: Pool,
    connection_id: u32,
    io_timeout: Duration,
}

impl fmt::Debug for MysqlRowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlRowStream")
            .field("open", &self.stream.is_some())
            .field("connection_id", &self.connection_id)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct ColumnShape {
    name: String,
    column_type: ColumnType,
    binary: bool,
}

impl ColumnShape {
    fn from_column(column: &Column) -> Self {
        Self {
            name: column.name_str().into_owned(),
            column_type: column.column_type(),
            binary: column.character_set() == BINARY_CHARSET,
        }
    }
}

impl MysqlRowStream {
    async fn fetch(&mut self) -> Result<Option<Row>, QueryBackendError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let next = tokio::time::timeout(self.io_timeout, stream.next())
            .await
            .map_err(|_| QueryBackendError::new("i/o timeout"))?;
        match next {
            Some(Ok(row)) => {
                if self.columns.is_none() {
                    self.columns = Some(
                        row.columns_ref()
                            .iter()
                            .map(ColumnShape::from_column)
                            .collect(),
                    );
                }
                Ok(Some(row))
            }
            Some(Err(error)) => Err(to_query_error(error)),
            None => {
                self.stream = None;
                Ok(None)
            }
        }
    }

    /// Stops the running statement from a second connection. The reading
    /// connection stays busy until the server gives up on it.
    async fn kill_query(pool: &Pool, connection_id: u32) -> Result<(), mysql_async::Error> {
        let mut conn = pool.get_conn().await?;
        conn.query_drop(format!("KILL QUERY {connection_id}"))
            .await
    }
}

#[async_trait]
impl RowStream for MysqlRowStream {
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
        if self.columns.is_none() && self.peeked.is_none() {
            self.peeked = self.fetch().await?;
        }
        Ok(self
            .columns
            .as_ref()
            .map(|columns| columns.iter().map(|column| column.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
        let row = match self.peeked.take() {
            Some(row) => Some(row),
            None => self.fetch().await?,
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let shapes = self.columns.as_deref().unwrap_or_default();
        let values = row
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(index, value)| cell_value(value, shapes.get(index)))
            .collect();
        Ok(Some(values))
    }

    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        self.peeked = None;
        if self.stream.is_none() {
            return Ok(());
        }
        match tokio::time::timeout(
            self.io_timeout,
            Self::kill_query(&self.pool, self.connection_id),
        ).await {
            Ok(Ok(())) => debug!(connection_id = self.connection_id, "mysql statement killed"),
            Ok(Err(error)) => debug!(
                connection_id = self.connection_id,
                error = %error,
                "mysql kill query failed"
            ),
            Err(_) => debug!(connection_id = self.connection_id, "mysql kill query timed out"),
        }
        self.stream = None;
        Ok(())
    }
}

fn cell_value(value: Value, shape: Option<&ColumnShape>) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Bytes(bytes) => bytes_value(bytes, shape),
        Value::Int(value) => CellValue::Int(value),
        Value::UInt(value) => i64::try_from(value)
            .map_or_else(|_| CellValue::Text(value.to_string()), CellValue::Int),
        Value::Float(value) => CellValue::Float(f64::from(value)),
        Value::Double(value) => CellValue::Float(value),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!("{year:04}-{month:02}-{day:02}");
            if (hour, minute, second, micros) != (0, 0, 0, 0) {
                text.push_str(&format!(" {hour:02}:{minute:02}:{second:02}"));
            }
            if micros != 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            CellValue::Text(text)
        }
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            let mut text = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if micros != 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            CellValue::Text(text)
        }
    }
}

/// The text protocol sends everything as bytes; column metadata decides the kind.
fn bytes_value(bytes: Vec<u8>, shape: Option<&ColumnShape>) -> CellValue {
    let Some(shape) = shape else {
        return text_or_binary(bytes);
    };

    match shape.column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .map_or_else(|| text_or_binary(bytes), CellValue::Int),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .map_or_else(|| text_or_binary(bytes), CellValue::Float),
        ColumnType::MYSQL_TYPE_BIT => CellValue::Binary(bytes),
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_GEOMETRY
            if shape.binary =>
        {
            CellValue::Binary(bytes)
        }
        _ => text_or_binary(bytes),
    }
}

fn text_or_binary(bytes: Vec<u8>) -> CellValue {
    match String::from_utf8(bytes) {
        Ok(text) => CellValue::Text(text),
        Err(error) => CellValue::Binary(error.into_bytes()),
    }
}

fn to_query_error(error: mysql_async::Error) -> QueryBackendError {
    QueryBackendError::new(error.to_string())
}

#[cfg(test)]
mod tests {
    use dbterm_core::query_runner::CellValue;
    use mysql_async::consts::ColumnType;
    use mysql_async::Value;

    use super::{bytes_value, cell_value, ColumnShape, BINARY_CHARSET};

    fn shape(column_type: ColumnType, charset: u16) -> ColumnShape {
        ColumnShape {
            name: "c".to_string(),
            column_type,
            binary: charset == BINARY_CHARSET,
        }
    }

    #[test]
    fn binary_protocol_values_keep_their_kind() {
        assert_eq!(cell_value(Value::NULL, None), CellValue::Null);
        assert_eq!(cell_value(Value::Int(-8), None), CellValue::Int(-8));
        assert_eq!(cell_value(Value::UInt(8), None), CellValue::Int(8));
        assert_eq!(
            cell_value(Value::UInt(u64::MAX), None),
            CellValue::Text(u64::MAX.to_string())
        );
        assert_eq!(cell_value(Value::Double(1.5), None), CellValue::Float(1.5));
    }

    #[test]
    fn text_protocol_bytes_follow_column_type() {
        let int = shape(ColumnType::MYSQL_TYPE_LONG, 33);
        assert_eq!(bytes_value(b"42".to_vec(), Some(&int)), CellValue::Int(42));

        let double = shape(ColumnType::MYSQL_TYPE_DOUBLE, 33);
        assert_eq!(
            bytes_value(b"2.5".to_vec(), Some(&double)),
            CellValue::Float(2.5)
        );

        let decimal = shape(ColumnType::MYSQL_TYPE_NEWDECIMAL, 33);
        assert_eq!(
            bytes_value(b"10.00".to_vec(), Some(&decimal)),
            CellValue::Text("10.00".to_string())
        );

        let blob = shape(ColumnType::MYSQL_TYPE_BLOB, BINARY_CHARSET);
        assert_eq!(
            bytes_value(b"abc".to_vec(), Some(&blob)),
            CellValue::Binary(b"abc".to_vec())
        );

        let text = shape(ColumnType::MYSQL_TYPE_BLOB, 45);
        assert_eq!(
            bytes_value(b"abc".to_vec(), Some(&text)),
            CellValue::Text("abc".to_string())
        );
    }

    #[test]
    fn temporal_values_render_compactly() {
        assert_eq!(
            cell_value(Value::Date(2024, 3, 9, 0, 0, 0, 0), None),
            CellValue::Text("2024-03-09".to_string())
        );
        assert_eq!(
            cell_value(Value::Date(2024, 3, 9, 14, 5, 0, 0), None),
            CellValue::Text("2024-03-09 14:05:00".to_string())
        );
        assert_eq!(
            cell_value(Value::Time(true, 1, 2, 3, 4, 0), None),
            CellValue::Text("-26:03:04".to_string())
        );
    }

    #[test]
    fn invalid_utf8_without_metadata_is_binary() {
        assert_eq!(
            bytes_value(vec![0xff, 0x00], None),
            CellValue::Binary(vec![0xff, 0x00])
        );
    }
}
