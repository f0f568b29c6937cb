use std::time::{Duration, Instant};

use dbterm_adapters::{AnyBackend, AnyConnection};
use dbterm_core::connection_manager::ConnectionPool;
use dbterm_core::errors::ErrorKind;
use dbterm_core::profiles::ConnectionConfig;
use dbterm_core::query_runner::{CellValue, QueryExecutor, QueryOutcome};
use dbterm_core::results::PreviewLimit;
use dbterm_core::schema::list_tables;
use dbterm_core::settings::Settings;
use dbterm_core::workspace::{Job, LimitChange, Workspace};
use tempfile::TempDir;

/// Runs a job and every follow-up job it produces.
async fn drive(workspace: &mut Workspace<AnyBackend>, job: Job<AnyConnection>) {
    let mut pending = vec![job];
    while let Some(job) = pending.pop() {
        let event = job.await;
        pending.extend(workspace.apply(event));
    }
}

fn seeded_database(temp_dir: &TempDir) -> ConnectionConfig {
    let path = temp_dir.path().join("shop.db");
    let conn = rusqlite::Connection::open(&path).expect("failed to create database");
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, avatar BLOB);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, total REAL);",
    )
    .expect("failed to create tables");
    for id in 1..=150 {
        conn.execute(
            "INSERT INTO users (id, email, avatar) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, format!("user{id}@example.com"), vec![0_u8, 1, 2]],
        )
        .expect("failed to insert user");
    }
    ConnectionConfig::sqlite("shop", path.display().to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_executor_and_table_listing_against_a_file() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let config = seeded_database(&temp_dir);
    let mut pool = ConnectionPool::new(AnyBackend::default(), Settings::default().timeouts());

    pool.connect(&config).await.expect("connect should succeed");
    let session = pool.session().expect("session after connect");

    let tables = list_tables(session, Duration::from_secs(5))
        .await
        .expect("listing should succeed");
    assert_eq!(tables, vec!["orders", "users"]);

    let report = QueryExecutor::default()
        .run_to_grid(
            session,
            "SELECT id, email, avatar FROM users ORDER BY id",
            PreviewLimit::Rows(100),
        )
        .await
        .expect("preview should succeed");
    let QueryOutcome::Rows(grid) = &report.outcome else {
        panic!("expected rows");
    };
    assert_eq!(grid.columns(), ["id", "email", "avatar"]);
    assert_eq!(grid.row_count(), 100);
    assert!(grid.is_truncated());
    assert_eq!(grid.rows()[0][0].value(), &CellValue::Int(1));
    assert_eq!(grid.rows()[0][2].value(), &CellValue::Binary(vec![0, 1, 2]));

    let report = QueryExecutor::default()
        .run_to_grid(
            session,
            "UPDATE users SET email = 'x' WHERE id <= 3",
            PreviewLimit::Unlimited,
        )
        .await
        .expect("write should succeed");
    assert_eq!(report.outcome, QueryOutcome::Affected(3));

    pool.close().await.expect("close should succeed");
    assert!(!pool.status().is_connected);
}

#[tokio::test(flavor = "multi_thread")]
async fn workspace_browses_and_refreshes_a_sqlite_file() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let config = seeded_database(&temp_dir);
    let mut workspace = Workspace::new(AnyBackend::default(), &Settings::default());

    let job = workspace.begin_connect(config);
    drive(&mut workspace, job).await;
    assert!(workspace.connection_status().is_connected);
    assert_eq!(workspace.tables(), ["orders", "users"]);

    let job = workspace.begin_preview("users").expect("connected");
    drive(&mut workspace, job).await;
    let view = workspace.view().expect("preview loaded");
    assert_eq!(view.row_count(), 100);
    assert_eq!(workspace.selected_table(), Some("users"));

    let job = workspace
        .begin_limit_change(LimitChange::ToggleUnlimited)
        .expect("table is open");
    drive(&mut workspace, job).await;
    assert_eq!(workspace.limit(), PreviewLimit::Unlimited);
    assert_eq!(workspace.view().map(|view| view.row_count()), Some(150));

    let job = workspace
        .begin_query("DELETE FROM users WHERE id > 140")
        .expect("connected");
    drive(&mut workspace, job).await;
    assert!(!workspace.status().is_error, "{:?}", workspace.status());
    assert_eq!(workspace.view().map(|view| view.row_count()), Some(140));

    let job = workspace.begin_query("SELECT * FROM missing").expect("connected");
    drive(&mut workspace, job).await;
    assert!(workspace.status().is_error);
    assert_eq!(workspace.view().map(|view| view.row_count()), Some(140));

    workspace.disconnect().await.expect("disconnect should succeed");
    assert!(!workspace.connection_status().is_connected);
}

#[tokio::test(flavor = "multi_thread")]
async fn preview_of_a_larger_table_reports_truncation() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let config = seeded_database(&temp_dir);
    let mut workspace = Workspace::new(AnyBackend::default(), &Settings::default());

    let job = workspace.begin_connect(config);
    drive(&mut workspace, job).await;
    let job = workspace.begin_preview("users").expect("connected");
    drive(&mut workspace, job).await;

    assert_eq!(workspace.limit(), PreviewLimit::Rows(100));
    let view = workspace.view().expect("preview loaded");
    assert_eq!(view.row_count(), 100);
    assert!(view.grid().is_truncated());
    let status = workspace.status();
    assert!(!status.is_error);
    assert!(
        status.message.ends_with(&format!("({})", workspace.limit_status())),
        "{status:?}"
    );

    workspace.disconnect().await.expect("disconnect should succeed");
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_statement_frees_the_session() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let config = seeded_database(&temp_dir);
    let mut pool = ConnectionPool::new(AnyBackend::default(), Settings::default().timeouts());
    pool.connect(&config).await.expect("connect should succeed");
    let session = pool.session().expect("session after connect");

    let failure = QueryExecutor::new(Duration::from_secs(1), Duration::from_secs(2))
        .run_to_grid(
            session,
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
             SELECT count(*) FROM n",
            PreviewLimit::Unlimited,
        )
        .await
        .expect_err("unbounded count should time out");
    assert_eq!(failure.error.kind(), ErrorKind::Timeout);

    let started = Instant::now();
    let report = QueryExecutor::default()
        .run_to_grid(session, "SELECT 1", PreviewLimit::Unlimited)
        .await
        .expect("session should be usable again");
    assert!(started.elapsed() < Duration::from_secs(2));
    let QueryOutcome::Rows(grid) = &report.outcome else {
        panic!("expected rows");
    };
    assert_eq!(grid.rows()[0][0].value(), &CellValue::Int(1));

    pool.close().await.expect("close should succeed");
}
