use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::errors::{classify_query_error, WorkspaceError};
use crate::format::truncate_runes;
use crate::profiles::BackendKind;
use crate::results::{Materializer, PreviewLimit, ResultGrid};

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const SQL_PREVIEW_RUNES: usize = 80;

/// A value as produced by a driver, before any display formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueryBackendError {
    message: String,
}

impl QueryBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait RowStream: Send {
    /// Column names in driver order. May read ahead one row.
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError>;

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError>;

    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        Ok(())
    }
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    type Stream: RowStream + 'static;

    async fn ping(&self) -> Result<(), QueryBackendError>;
    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError>;
    /// Runs a statement that returns no rows; yields the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError>;
}

/// A live handle plus the gate that admits one statement at a time.
#[derive(Debug)]
pub struct Session<C> {
    handle: C,
    backend: BackendKind,
    gate: Arc<Mutex<()>>,
}

impl<C: Clone> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            backend: self.backend,
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<C> Session<C> {
    #[must_use]
    pub fn new(handle: C, backend: BackendKind) -> Self {
        Self {
            handle,
            backend,
            gate: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &C {
        &self.handle
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    pub(crate) fn into_handle(self) -> C {
        self.handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

const READ_KEYWORDS: [&str; 8] = [
    "SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "WITH", "VALUES",
];

#[must_use]
pub fn classify(sql: &str) -> StatementKind {
    match first_keyword(sql) {
        Some(keyword) if READ_KEYWORDS.contains(&keyword.as_str()) => StatementKind::Read,
        _ => StatementKind::Write,
    }
}

/// First word of the statement, upper-cased, after comments and whitespace.
#[must_use]
pub fn first_keyword(sql: &str) -> Option<String> {
    let mut chars = sql.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() || ch == '(' {
            chars.next();
            continue;
        }

        if ch == '#' {
            skip_line(&mut chars);
            continue;
        }

        if ch == '-' || ch == '/' {
            let mut lookahead = chars.clone();
            lookahead.next();
            match (ch, lookahead.peek()) {
                ('-', Some('-')) => {
                    skip_line(&mut chars);
                    continue;
                }
                ('/', Some('*')) => {
                    chars.next();
                    chars.next();
                    let mut previous = '\0';
                    for next in chars.by_ref() {
                        if previous == '*' && next == '/' {
                            break;
                        }
                        previous = next;
                    }
                    continue;
                }
                _ => return None,
            }
        }

        break;
    }

    let keyword: String = chars
        .take_while(char::is_ascii_alphabetic)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    (!keyword.is_empty()).then_some(keyword)
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for next in chars.by_ref() {
        if next == '\n' {
            break;
        }
    }
}

#[must_use]
pub fn quote_identifier(backend: BackendKind, name: &str) -> String {
    match backend {
        BackendKind::MySql => format!("`{}`", name.replace('`', "``")),
        BackendKind::Postgres | BackendKind::Sqlite | BackendKind::CloudflareD1 => {
            format!("\"{}\"", name.replace('"', "\"\""))
        }
    }
}

/// Asks for one row past the limit so the grid can tell it was truncated.
#[must_use]
pub fn preview_sql(backend: BackendKind, table: &str, limit: PreviewLimit) -> String {
    let quoted = quote_identifier(backend, table);
    match limit.rows() {
        Some(rows) => format!("SELECT * FROM {quoted} LIMIT {}", rows.saturating_add(1)),
        None => format!("SELECT * FROM {quoted}"),
    }
}

pub enum Execution<S> {
    Read(S),
    Write { rows_affected: u64 },
}

impl<S> fmt::Debug for Execution<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(_) => f.write_str("Read(..)"),
            Self::Write { rows_affected } => f
                .debug_struct("Write")
                .field("rows_affected", rows_affected)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(ResultGrid),
    Affected(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryReport {
    pub outcome: QueryOutcome,
    pub elapsed: Duration,
}

impl QueryReport {
    /// `"{n} rows in {elapsed}"` for reads, rows affected for writes.
    #[must_use]
    pub fn summary(&self) -> String {
        let elapsed = crate::format::format_duration(self.elapsed);
        match &self.outcome {
            QueryOutcome::Rows(grid) => format!("{} rows in {elapsed}", grid.row_count()),
            QueryOutcome::Affected(rows) => format!("{rows} rows affected in {elapsed}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct QueryFailure {
    pub error: WorkspaceError,
    /// Statement shortened for display.
    pub sql: String,
    /// Rows read before a mid-stream failure.
    pub rows_materialized: Option<usize>,
}

impl QueryFailure {
    fn new(error: WorkspaceError, sql: &str) -> Self {
        Self {
            error,
            sql: truncate_runes(sql.trim(), SQL_PREVIEW_RUNES),
            rows_materialized: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryExecutor {
    query_timeout: Duration,
    probe_timeout: Duration,
    materializer: Materializer,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(QUERY_TIMEOUT, PROBE_TIMEOUT)
    }
}

impl QueryExecutor {
    #[must_use]
    pub fn new(query_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            query_timeout,
            probe_timeout,
            materializer: Materializer::default(),
        }
    }

    #[must_use]
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Pre-flight probe, then either a row stream (reads) or the affected count (writes).
    pub async fn run<B: QueryBackend>(
        &self,
        handle: &B,
        sql: &str,
    ) -> Result<Execution<B::Stream>, WorkspaceError> {
        self.probe(handle).await?;

        match classify(sql) {
            StatementKind::Read => bounded(self.query_timeout, "query", handle.start_query(sql))
                .await
                .map(Execution::Read),
            StatementKind::Write => bounded(self.query_timeout, "query", handle.execute(sql))
                .await
                .map(|rows_affected| Execution::Write { rows_affected }),
        }
    }

    /// Runs `sql` and materializes any rows, holding the session gate and a
    /// single deadline for the whole exchange.
    pub async fn run_to_grid<B: QueryBackend>(
        &self,
        session: &Session<B>,
        sql: &str,
        limit: PreviewLimit,
    ) -> Result<QueryReport, QueryFailure> {
        let _statement = session.acquire().await;
        let started_at = Instant::now();
        debug!(
            backend = %session.backend(),
            sql = %truncate_runes(sql, SQL_PREVIEW_RUNES),
            "query started"
        );

        let execution = self
            .run(session.handle(), sql)
            .await
            .map_err(|error| QueryFailure::new(error, sql))?;

        let outcome = match execution {
            Execution::Write { rows_affected } => QueryOutcome::Affected(rows_affected),
            Execution::Read(mut stream) => {
                let remaining = self.query_timeout.saturating_sub(started_at.elapsed());
                let materialized =
                    tokio::time::timeout(remaining, self.materializer.build(&mut stream, limit))
                        .await;
                match materialized {
                    Ok(Ok(grid)) => QueryOutcome::Rows(grid),
                    Ok(Err(err)) => {
                        warn!(rows = err.rows_materialized, error = %err.source, "result stream failed");
                        return Err(QueryFailure {
                            rows_materialized: Some(err.rows_materialized),
                            ..QueryFailure::new(classify_query_error(err.source.message()), sql)
                        });
                    }
                    Err(_) => {
                        if let Err(err) = stream.cancel().await {
                            debug!(error = %err, "cancelling timed out stream failed");
                        }
                        return Err(QueryFailure::new(
                            WorkspaceError::timeout("query", self.query_timeout),
                            sql,
                        ));
                    }
                }
            }
        };

        let report = QueryReport {
            outcome,
            elapsed: started_at.elapsed(),
        };
        info!(backend = %session.backend(), summary = %report.summary(), "query finished");
        Ok(report)
    }

    async fn probe<B: QueryBackend>(&self, handle: &B) -> Result<(), WorkspaceError> {
        match tokio::time::timeout(self.probe_timeout, handle.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(WorkspaceError::connection_lost(err.message())),
            Err(_) => Err(WorkspaceError::connection_lost(format!(
                "connection probe did not answer within {}",
                crate::format::format_duration(self.probe_timeout)
            ))),
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    future: impl Future<Output = Result<T, QueryBackendError>>,
) -> Result<T, WorkspaceError> {
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(classify_query_error(err.message())),
        Err(_) => Err(WorkspaceError::timeout(operation, limit)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{
        classify, first_keyword, preview_sql, quote_identifier, CellValue, Execution,
        QueryBackend, QueryBackendError, QueryExecutor, QueryOutcome, RowStream, Session,
        StatementKind,
    };
    use crate::errors::ErrorKind;
    use crate::profiles::BackendKind;
    use crate::results::PreviewLimit;

    /// Scripted backend shared by the core test suites.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeHandle {
        pub columns: Vec<String>,
        pub rows: Vec<Vec<CellValue>>,
        /// Fail the stream after this many rows.
        pub fail_after: Option<usize>,
        pub query_error: Option<String>,
        pub ping_error: Option<String>,
        pub ping_delay: Option<Duration>,
        pub query_delay: Option<Duration>,
        pub rows_affected: u64,
        /// Error injected after construction, shared across clones.
        pub failure: Arc<Mutex<Option<String>>>,
        /// Rows served instead of `rows` once set, shared across clones.
        pub replacement: Arc<Mutex<Option<Vec<Vec<CellValue>>>>>,
        pub executed: Arc<Mutex<Vec<String>>>,
        pub in_flight: Arc<AtomicUsize>,
        pub max_in_flight: Arc<AtomicUsize>,
    }

    impl FakeHandle {
        pub(crate) fn with_rows(columns: &[&str], rows: Vec<Vec<CellValue>>) -> Self {
            Self {
                columns: columns.iter().map(ToString::to_string).collect(),
                rows,
                ..Self::default()
            }
        }

        pub(crate) fn set_rows(&self, rows: Vec<Vec<CellValue>>) {
            *self.replacement.lock().expect("replacement lock poisoned") = Some(rows);
        }

        pub(crate) fn fail_queries(&self, message: &str) {
            *self.failure.lock().expect("failure lock poisoned") = Some(message.to_string());
        }

        pub(crate) fn executed(&self) -> Vec<String> {
            self.executed.lock().expect("executed lock poisoned").clone()
        }

        async fn enter(&self, sql: &str) -> Result<(), QueryBackendError> {
            self.executed
                .lock()
                .expect("executed lock poisoned")
                .push(sql.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let injected = self.failure.lock().expect("failure lock poisoned").clone();
            match injected.or_else(|| self.query_error.clone()) {
                Some(message) => Err(QueryBackendError::new(message)),
                None => Ok(()),
            }
        }
    }

    #[derive(Debug)]
    pub(crate) struct FakeStream {
        columns: Vec<String>,
        rows: VecDeque<Vec<CellValue>>,
        fail_after: Option<usize>,
        served: usize,
    }

    #[async_trait::async_trait]
    impl RowStream for FakeStream {
        async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
            Ok(self.columns.clone())
        }

        async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
            if self.fail_after == Some(self.served) {
                return Err(QueryBackendError::new("connection reset by peer"));
            }
            self.served += 1;
            Ok(self.rows.pop_front())
        }
    }

    #[async_trait::async_trait]
    impl QueryBackend for FakeHandle {
        type Stream = FakeStream;

        async fn ping(&self) -> Result<(), QueryBackendError> {
            if let Some(delay) = self.ping_delay {
                tokio::time::sleep(delay).await;
            }
            match &self.ping_error {
                Some(message) => Err(QueryBackendError::new(message.clone())),
                None => Ok(()),
            }
        }

        async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
            self.enter(sql).await?;
            let rows = self
                .replacement
                .lock()
                .expect("replacement lock poisoned")
                .clone()
                .unwrap_or_else(|| self.rows.clone());
            Ok(FakeStream {
                columns: self.columns.clone(),
                rows: rows.into(),
                fail_after: self.fail_after,
                served: 0,
            })
        }

        async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
            self.enter(sql).await?;
            Ok(self.rows_affected)
        }
    }

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    #[test]
    fn classification_skips_comments_and_whitespace() {
        assert_eq!(classify("SELECT 1"), StatementKind::Read);
        assert_eq!(classify("  \n\tselect 1"), StatementKind::Read);
        assert_eq!(classify("-- note\nSHOW TABLES"), StatementKind::Read);
        assert_eq!(classify("# mysql note\nDESC users"), StatementKind::Read);
        assert_eq!(classify("/* a */ /* b */ EXPLAIN SELECT 1"), StatementKind::Read);
        assert_eq!(classify("WITH x AS (SELECT 1) SELECT * FROM x"), StatementKind::Read);
        assert_eq!(classify("PRAGMA table_info(users)"), StatementKind::Read);
        assert_eq!(classify("VALUES (1), (2)"), StatementKind::Read);
        assert_eq!(classify("(SELECT 1)"), StatementKind::Read);

        assert_eq!(classify("INSERT INTO t VALUES (1)"), StatementKind::Write);
        assert_eq!(classify("/* SELECT */ DELETE FROM t"), StatementKind::Write);
        assert_eq!(classify("-- SELECT\nUPDATE t SET a = 1"), StatementKind::Write);
        assert_eq!(classify(""), StatementKind::Write);
        assert_eq!(classify("-- only a comment"), StatementKind::Write);
    }

    #[test]
    fn multi_statement_input_follows_the_first_keyword() {
        assert_eq!(classify("SELECT 1; DELETE FROM t"), StatementKind::Read);
        assert_eq!(classify("DELETE FROM t; SELECT 1"), StatementKind::Write);
        assert_eq!(first_keyword("selectx 1").as_deref(), Some("SELECTX"));
        assert_eq!(classify("selectx 1"), StatementKind::Write);
    }

    #[test]
    fn identifiers_are_quoted_per_dialect() {
        assert_eq!(quote_identifier(BackendKind::MySql, "a`b"), "`a``b`");
        assert_eq!(quote_identifier(BackendKind::Postgres, "a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_identifier(BackendKind::Sqlite, "order"), "\"order\"");
        assert_eq!(
            preview_sql(BackendKind::MySql, "users", PreviewLimit::Rows(100)),
            "SELECT * FROM `users` LIMIT 101"
        );
        assert_eq!(
            preview_sql(BackendKind::Postgres, "users", PreviewLimit::Unlimited),
            "SELECT * FROM \"users\""
        );
    }

    #[tokio::test]
    async fn reads_are_materialized_with_elapsed_time() {
        let handle = FakeHandle::with_rows(
            &["id", "name"],
            vec![
                vec![CellValue::Int(1), text("ada")],
                vec![CellValue::Int(2), text("grace")],
            ],
        );
        let session = Session::new(handle, BackendKind::Postgres);

        let report = QueryExecutor::default()
            .run_to_grid(&session, "SELECT id, name FROM users", PreviewLimit::Unlimited)
            .await
            .expect("query should succeed");

        let QueryOutcome::Rows(grid) = &report.outcome else {
            panic!("expected rows");
        };
        assert_eq!(grid.columns(), ["id", "name"]);
        assert_eq!(grid.row_count(), 2);
        assert!(report.summary().starts_with("2 rows in "));
    }

    #[tokio::test]
    async fn writes_report_rows_affected() {
        let handle = FakeHandle {
            rows_affected: 3,
            ..FakeHandle::default()
        };
        let session = Session::new(handle.clone(), BackendKind::MySql);

        let report = QueryExecutor::default()
            .run_to_grid(&session, "UPDATE users SET active = 1", PreviewLimit::Unlimited)
            .await
            .expect("write should succeed");

        assert_eq!(report.outcome, QueryOutcome::Affected(3));
        assert!(report.summary().starts_with("3 rows affected in "));
        assert_eq!(handle.executed(), vec!["UPDATE users SET active = 1"]);
    }

    #[tokio::test]
    async fn run_exposes_the_raw_stream_for_reads() {
        let handle = FakeHandle::with_rows(&["n"], vec![vec![CellValue::Int(7)]]);
        let execution = QueryExecutor::default()
            .run(&handle, "SELECT 7")
            .await
            .expect("run should succeed");
        let Execution::Read(mut stream) = execution else {
            panic!("expected a read");
        };
        assert_eq!(stream.columns().await.expect("columns"), vec!["n"]);
        assert_eq!(
            stream.next_row().await.expect("row"),
            Some(vec![CellValue::Int(7)])
        );
    }

    #[tokio::test]
    async fn failed_probe_is_connection_lost_and_skips_the_statement() {
        let handle = FakeHandle {
            ping_error: Some("broken pipe".to_string()),
            ..FakeHandle::default()
        };
        let session = Session::new(handle.clone(), BackendKind::Postgres);

        let failure = QueryExecutor::default()
            .run_to_grid(&session, "SELECT 1", PreviewLimit::Unlimited)
            .await
            .expect_err("probe failure should abort");

        assert_eq!(failure.error.kind(), ErrorKind::ConnectionLost);
        assert!(handle.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_statements_time_out() {
        let handle = FakeHandle {
            query_delay: Some(Duration::from_secs(60)),
            ..FakeHandle::default()
        };
        let session = Session::new(handle, BackendKind::Postgres);
        let executor = QueryExecutor::new(Duration::from_secs(30), Duration::from_secs(5));

        let failure = executor
            .run_to_grid(&session, "SELECT pg_sleep(60)", PreviewLimit::Unlimited)
            .await
            .expect_err("query should time out");
        assert_eq!(failure.error.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_connection_lost() {
        let handle = FakeHandle {
            ping_delay: Some(Duration::from_secs(10)),
            ..FakeHandle::default()
        };
        let failure = QueryExecutor::default()
            .run_to_grid(
                &Session::new(handle, BackendKind::MySql),
                "SELECT 1",
                PreviewLimit::Unlimited,
            )
            .await
            .expect_err("probe should time out");
        assert_eq!(failure.error.kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn statement_errors_are_classified_and_sql_is_shortened() {
        let handle = FakeHandle {
            query_error: Some("syntax error at or near \"FORM\"".to_string()),
            ..FakeHandle::default()
        };
        let sql = format!("SELECT * FORM users WHERE note = '{}'", "x".repeat(120));

        let failure = QueryExecutor::default()
            .run_to_grid(
                &Session::new(handle, BackendKind::Postgres),
                &sql,
                PreviewLimit::Unlimited,
            )
            .await
            .expect_err("query should fail");

        assert_eq!(failure.error.kind(), ErrorKind::Syntax);
        assert_eq!(failure.sql.chars().count(), 80);
        assert!(failure.sql.ends_with("..."));
        assert_eq!(failure.rows_materialized, None);
    }

    #[tokio::test]
    async fn mid_stream_failure_reports_partial_count() {
        let handle = FakeHandle {
            fail_after: Some(2),
            ..FakeHandle::with_rows(
                &["n"],
                (1..=5).map(|n| vec![CellValue::Int(n)]).collect(),
            )
        };

        let failure = QueryExecutor::default()
            .run_to_grid(
                &Session::new(handle, BackendKind::Sqlite),
                "SELECT n FROM numbers",
                PreviewLimit::Unlimited,
            )
            .await
            .expect_err("stream should fail");

        assert_eq!(failure.rows_materialized, Some(2));
        assert_eq!(failure.error.kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn session_gate_serializes_statements() {
        let handle = FakeHandle {
            query_delay: Some(Duration::from_millis(20)),
            ..FakeHandle::default()
        };
        let session = Session::new(handle.clone(), BackendKind::Postgres);
        let executor = QueryExecutor::default();

        let first = executor.run_to_grid(&session, "DELETE FROM a", PreviewLimit::Unlimited);
        let second = executor.run_to_grid(&session, "DELETE FROM b", PreviewLimit::Unlimited);
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok() && second.is_ok());
        assert_eq!(handle.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
