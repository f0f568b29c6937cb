use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbterm_core::connection_manager::{BackendError, ConnectionBackend};
use dbterm_core::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream};
use dbterm_core::resolver::DialTarget;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::mpsc;
use tracing::debug;

/// Rows buffered between the blocking reader and the stream.
const ROW_BUFFER: usize = 64;
/// Virtual machine steps between checks of a statement's cancel flag.
const PROGRESS_STEPS: i32 = 1_000;

#[derive(Debug, Clone, Default)]
pub struct SqliteBackend;

#[async_trait]
impl ConnectionBackend for SqliteBackend {
    type Connection = SqliteConnection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError> {
        let path = target.dial_string.clone();
        let busy_timeout = target.io_timeout;
        let conn = tokio::task::spawn_blocking(move || {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let conn = Connection::open_with_flags(&path, flags)?;
            conn.busy_timeout(busy_timeout)?;
            debug!(path = %path, "sqlite database opened");
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|error| BackendError::new(error.to_string()))?
        .map_err(|error| BackendError::new(error.to_string()))?;

        Ok(SqliteConnection {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), BackendError> {
        let taken = connection
            .conn
            .lock()
            .map_err(|_| BackendError::new("sqlite connection lock poisoned"))?
            .take();
        let Some(conn) = taken else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || conn.close().map_err(|(_, error)| error))
            .await
            .map_err(|error| BackendError::new(error.to_string()))?
            .map_err(|error| BackendError::new(error.to_string()))
    }
}

/// A rusqlite connection shared by clones; `None` once closed.
#[derive(Debug, Clone)]
pub struct SqliteConnection {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteConnection {
    async fn with_connection<T, F>(&self, work: F) -> Result<T, QueryBackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        // Dropped with this future on timeout, which aborts the statement.
        let statement = StatementGuard::default();
        let cancelled = Arc::clone(&statement.cancelled);
        tokio::task::spawn_blocking(move || {
            let slot = shared
                .lock()
                .map_err(|_| QueryBackendError::new("sqlite connection lock poisoned"))?;
            let conn = slot
                .as_ref()
                .ok_or_else(|| QueryBackendError::new("sqlite connection is closed"))?;
            cancellable(conn, cancelled, |conn| work(conn).map_err(to_query_error))
        })
        .await
        .map_err(|error| QueryBackendError::new(error.to_string()))?
    }
}

#[async_trait]
impl QueryBackend for SqliteConnection {
    type Stream = SqliteRowStream;

    async fn ping(&self) -> Result<(), QueryBackendError> {
        self.with_connection(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }

    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
        let (sender, mut receiver) = mpsc::channel(ROW_BUFFER);
        let shared = Arc::clone(&self.conn);
        let sql = sql.to_string();
        // Dropped with this future on timeout, which aborts the reader.
        let reader = StatementGuard::default();
        let cancelled = Arc::clone(&reader.cancelled);

        tokio::task::spawn_blocking(move || {
            let outcome = read_rows(&shared, &sql, &sender, cancelled);
            if let Err(error) = outcome {
                // The stream may already be gone.
                let _ = sender.blocking_send(Message::Failed(error));
            }
        });

        // The reader always sends columns or a failure first.
        let columns = match receiver.recv().await {
            Some(Message::Columns(columns)) => columns,
            Some(Message::Failed(error)) => return Err(error),
            Some(Message::Row(_)) | None => {
                return Err(QueryBackendError::new("sqlite reader stopped unexpectedly"))
            }
        };

        Ok(SqliteRowStream {
            columns,
            receiver: Some(receiver),
            reader: Some(reader),
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| match conn.execute(&sql, []) {
            Ok(changed) => Ok(u64::try_from(changed).unwrap_or(u64::MAX)),
            Err(rusqlite::Error::MultipleStatement) => {
                conn.execute_batch(&sql)?;
                Ok(u64::try_from(conn.changes()).unwrap_or(u64::MAX))
            }
            Err(error) => Err(error),
        })
        .await
    }
}

#[derive(Debug)]
enum Message {
    Columns(Vec<String>),
    Row(Vec<CellValue>),
    Failed(QueryBackendError),
}

/// Runs `work` with a progress handler that aborts it once `cancelled` is set.
///
/// The flag belongs to one statement, so a cancel that lands before the first
/// step still stops it and one that lands after it finished touches nothing.
fn cancellable<T>(
    conn: &Connection,
    cancelled: Arc<AtomicBool>,
    work: impl FnOnce(&Connection) -> Result<T, QueryBackendError>,
) -> Result<T, QueryBackendError> {
    conn.progress_handler(
        PROGRESS_STEPS,
        Some(move || cancelled.load(Ordering::SeqCst)),
    );
    let outcome = work(conn);
    conn.progress_handler(0, None::<fn() -> bool>);
    outcome
}

/// Runs on a blocking thread. Stops early once the stream is dropped or
/// cancelled.
fn read_rows(
    shared: &Mutex<Option<Connection>>,
    sql: &str,
    sender: &mpsc::Sender<Message>,
    cancelled: Arc<AtomicBool>,
) -> Result<(), QueryBackendError> {
    let slot = shared
        .lock()
        .map_err(|_| QueryBackendError::new("sqlite connection lock poisoned"))?;
    let conn = slot
        .as_ref()
        .ok_or_else(|| QueryBackendError::new("sqlite connection is closed"))?;
    cancellable(conn, cancelled, |conn| stream_rows(conn, sql, sender))
}

fn stream_rows(
    conn: &Connection,
    sql: &str,
    sender: &mpsc::Sender<Message>,
) -> Result<(), QueryBackendError> {
    let mut statement = conn.prepare(sql).map_err(to_query_error)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    if sender.blocking_send(Message::Columns(columns)).is_err() {
        return Ok(());
    }

    let mut rows = statement.query([]).map_err(to_query_error)?;
    while let Some(row) = rows.next().map_err(to_query_error)? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            let value = row.get_ref(index).map_err(to_query_error)?;
            values.push(cell_value(value));
        }
        if sender.blocking_send(Message::Row(values)).is_err() {
            break;
        }
    }
    Ok(())
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(value) => CellValue::Int(value),
        ValueRef::Real(value) => CellValue::Float(value),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Binary(bytes.to_vec()),
    }
}

fn to_query_error(error: rusqlite::Error) -> QueryBackendError {
    QueryBackendError::new(error.to_string())
}

/// Cancels the statement it was issued for when dropped.
#[derive(Debug, Default)]
struct StatementGuard {
    cancelled: Arc<AtomicBool>,
}

impl Drop for StatementGuard {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SqliteRowStream {
    columns: Vec<String>,
    receiver: Option<mpsc::Receiver<Message>>,
    reader: Option<StatementGuard>,
}

#[async_trait]
impl RowStream for SqliteRowStream {
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
        Ok(self.columns.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        match receiver.recv().await {
            Some(Message::Row(values)) => Ok(Some(values)),
            Some(Message::Failed(error)) => {
                self.receiver = None;
                Err(error)
            }
            Some(Message::Columns(_)) | None => {
                self.receiver = None;
                Ok(None)
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        self.receiver = None;
        self.reader = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dbterm_core::connection_manager::ConnectionBackend;
    use dbterm_core::profiles::BackendKind;
    use dbterm_core::query_runner::{CellValue, QueryBackend, RowStream};
    use dbterm_core::resolver::DialTarget;
    use rusqlite::types::ValueRef;
    use tempfile::TempDir;

    use super::{cell_value, SqliteBackend};

    fn target(temp_dir: &TempDir) -> DialTarget {
        DialTarget {
            driver: BackendKind::Sqlite,
            dial_string: temp_dir.path().join("test.db").display().to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn storage_classes_map_to_cell_values() {
        assert_eq!(cell_value(ValueRef::Null), CellValue::Null);
        assert_eq!(cell_value(ValueRef::Integer(-3)), CellValue::Int(-3));
        assert_eq!(cell_value(ValueRef::Real(0.5)), CellValue::Float(0.5));
        assert_eq!(
            cell_value(ValueRef::Text(b"hi")),
            CellValue::Text("hi".to_string())
        );
        assert_eq!(
            cell_value(ValueRef::Blob(&[1, 2])),
            CellValue::Binary(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn batches_report_changes_of_the_last_statement() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let backend = SqliteBackend;
        let connection = backend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");

        connection
            .execute("CREATE TABLE t (n INTEGER)")
            .await
            .expect("create should succeed");
        let changed = connection
            .execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2), (3)")
            .await
            .expect("batch should succeed");
        assert_eq!(changed, 2);
        assert_eq!(
            connection
                .execute("DELETE FROM t")
                .await
                .expect("delete should succeed"),
            3
        );

        backend
            .disconnect(connection)
            .await
            .expect("close should succeed");
    }

    #[tokio::test]
    async fn cancelled_stream_releases_the_connection() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let connection = SqliteBackend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");

        let mut stream = connection
            .start_query(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 500) \
                 SELECT x FROM n",
            )
            .await
            .expect("query should start");
        assert_eq!(
            stream.next_row().await.expect("row"),
            Some(vec![CellValue::Int(1)])
        );
        stream.cancel().await.expect("cancel should succeed");
        assert_eq!(stream.next_row().await.expect("cancelled"), None);

        connection.ping().await.expect("connection should be free again");
    }

    #[tokio::test]
    async fn cancel_interrupts_a_statement_that_never_yields() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let connection = SqliteBackend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");

        let mut stream = connection
            .start_query(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                 SELECT count(*) FROM n",
            )
            .await
            .expect("query should start");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), stream.next_row())
                .await
                .is_err(),
            "unbounded count should still be running"
        );
        stream.cancel().await.expect("cancel should succeed");

        tokio::time::timeout(Duration::from_secs(2), connection.ping())
            .await
            .expect("ping should not wait for the interrupted statement")
            .expect("connection should be usable");
    }

    #[tokio::test]
    async fn dropping_a_pending_query_interrupts_it() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let connection = SqliteBackend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");

        let stream = connection
            .start_query(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                 SELECT count(*) FROM n",
            )
            .await
            .expect("query should start");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), connection.ping())
            .await
            .expect("ping should not wait for the dropped statement")
            .expect("connection should be usable");
    }

    #[tokio::test]
    async fn prepare_errors_surface_from_start_query() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let connection = SqliteBackend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");

        let err = connection
            .start_query("SELECT * FROM missing")
            .await
            .expect_err("missing table should fail");
        assert!(err.message().contains("no such table"));
    }

    #[tokio::test]
    async fn closed_connection_rejects_statements() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let backend = SqliteBackend;
        let connection = backend
            .connect(&target(&temp_dir))
            .await
            .expect("open should succeed");
        let clone = connection.clone();
        backend
            .disconnect(connection)
            .await
            .expect("close should succeed");

        let err = clone.ping().await.expect_err("closed handle");
        assert_eq!(err.message(), "sqlite connection is closed");
    }
}
