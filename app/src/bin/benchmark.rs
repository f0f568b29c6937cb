use std::io;
use std::time::{Duration, Instant};

use dbterm_adapters::AnyBackend;
use dbterm_core::connection_manager::ConnectionPool;
use dbterm_core::profiles::{BackendKind, ConnectionConfig};
use dbterm_core::query_runner::{
    CellValue, Execution, QueryBackend, QueryExecutor, QueryOutcome, RowStream, Session,
};
use dbterm_core::results::PreviewLimit;
use dbterm_core::settings::Settings;
use dbterm_core::view_state::ResultViewState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseOutcome {
    Config,
    HelpRequested,
}

#[derive(Debug, Clone)]
struct BenchmarkConfig {
    name: String,
    backend: BackendKind,
    host: String,
    port: Option<u16>,
    user: String,
    database: String,
    file: String,
    sql: String,
    grid_limit: PreviewLimit,
    seed_rows: u64,
    assert_first_row_ms: Option<f64>,
    assert_min_rows_per_sec: Option<f64>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            name: "bench-local".to_string(),
            backend: BackendKind::MySql,
            host: "127.0.0.1".to_string(),
            port: None,
            user: "root".to_string(),
            database: "dbterm_bench".to_string(),
            file: "dbterm_bench.db".to_string(),
            sql: "SELECT id, user_id, category, payload, created_offset FROM events ORDER BY id LIMIT 20000"
                .to_string(),
            grid_limit: PreviewLimit::Rows(5000),
            seed_rows: 0,
            assert_first_row_ms: None,
            assert_min_rows_per_sec: None,
        }
    }
}

impl BenchmarkConfig {
    fn connection(&self) -> ConnectionConfig {
        match self.backend {
            BackendKind::Sqlite => ConnectionConfig::sqlite(&self.name, &self.file),
            backend => ConnectionConfig {
                port: self.port,
                password: std::env::var("DBTERM_DB_PASSWORD").unwrap_or_default(),
                ..ConnectionConfig::network(
                    &self.name,
                    backend,
                    &self.host,
                    &self.user,
                    &self.database,
                )
            },
        }
    }
}

#[derive(Debug, Clone)]
struct QueryMetrics {
    rows_streamed: u64,
    first_row: Option<Duration>,
    elapsed: Duration,
}

#[derive(Debug, Clone)]
struct GridMetrics {
    rows: usize,
    truncated: bool,
    materialize: Duration,
    sort: Duration,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args()?;
    let settings = Settings::default();
    let executor = QueryExecutor::new(settings.timeouts().query, settings.timeouts().probe);

    let mut pool = ConnectionPool::new(AnyBackend::default(), settings.timeouts());
    let connect_latency = pool.connect(&config.connection()).await.map_err(io_other)?;
    let session = pool
        .session()
        .ok_or_else(|| io_other("connection was not installed"))?;

    if config.seed_rows > 0 {
        ensure_seed_data(session.handle(), config.seed_rows).await?;
    }

    let metrics = run_query_benchmark(&executor, session.handle(), &config.sql).await?;
    let grid = run_grid_benchmark(&executor, session, &config.sql, config.grid_limit).await?;
    let rows_per_sec = if metrics.elapsed.as_secs_f64() > 0.0 {
        metrics.rows_streamed as f64 / metrics.elapsed.as_secs_f64()
    } else {
        0.0
    };

    let first_row_ms = metrics
        .first_row
        .map_or(0.0, |duration| duration.as_secs_f64() * 1_000.0);
    let elapsed_ms = metrics.elapsed.as_secs_f64() * 1_000.0;

    println!("metric.backend={}", config.backend);
    println!(
        "metric.connect_ms={:.3}",
        connect_latency.as_secs_f64() * 1_000.0
    );
    println!("metric.first_row_ms={first_row_ms:.3}");
    println!("metric.rows_streamed={}", metrics.rows_streamed);
    println!("metric.stream_elapsed_ms={elapsed_ms:.3}");
    println!("metric.rows_per_sec={rows_per_sec:.3}");
    println!("metric.grid_rows={}", grid.rows);
    println!("metric.grid_truncated={}", grid.truncated);
    println!(
        "metric.grid_materialize_ms={:.3}",
        grid.materialize.as_secs_f64() * 1_000.0
    );
    println!("metric.grid_sort_ms={:.3}", grid.sort.as_secs_f64() * 1_000.0);
    if let Some(bytes) = peak_memory_bytes_best_effort() {
        println!("metric.peak_memory_bytes={bytes}");
    } else {
        println!("metric.peak_memory_bytes=n/a");
    }

    enforce_assertions(&config, first_row_ms, rows_per_sec)?;

    pool.close().await.map_err(io_other)?;
    Ok(())
}

async fn run_query_benchmark<B: QueryBackend>(
    executor: &QueryExecutor,
    handle: &B,
    sql: &str,
) -> io::Result<QueryMetrics> {
    let started_at = Instant::now();
    let Execution::Read(mut stream) = executor.run(handle, sql).await.map_err(io_other)? else {
        return Err(io_other("benchmark query must return rows"));
    };
    let mut first_row = None;
    let mut rows_streamed = 0_u64;

    while let Some(_row) = stream.next_row().await.map_err(io_other)? {
        rows_streamed += 1;
        if first_row.is_none() {
            first_row = Some(started_at.elapsed());
        }
    }

    Ok(QueryMetrics {
        rows_streamed,
        first_row,
        elapsed: started_at.elapsed(),
    })
}

/// Times the path the UI takes: materialize a bounded grid, then sort it.
async fn run_grid_benchmark<B: QueryBackend>(
    executor: &QueryExecutor,
    session: &Session<B>,
    sql: &str,
    limit: PreviewLimit,
) -> io::Result<GridMetrics> {
    let report = executor
        .run_to_grid(session, sql, limit)
        .await
        .map_err(io_other)?;
    let QueryOutcome::Rows(grid) = report.outcome else {
        return Err(io_other("benchmark query must return rows"));
    };
    let rows = grid.row_count();
    let truncated = grid.is_truncated();

    let mut view = ResultViewState::new(grid);
    let sort_started = Instant::now();
    if view.grid().column_count() > 1 {
        view.toggle_sort(1);
    }
    let sort = sort_started.elapsed();

    Ok(GridMetrics {
        rows,
        truncated,
        materialize: report.elapsed,
        sort,
    })
}

async fn ensure_seed_data<B: QueryBackend>(handle: &B, target_rows: u64) -> io::Result<()> {
    handle
        .execute(
            "CREATE TABLE IF NOT EXISTS events (\
             id BIGINT NOT NULL PRIMARY KEY,\
             user_id INT NOT NULL,\
             category VARCHAR(32) NOT NULL,\
             payload VARCHAR(128) NOT NULL,\
             created_offset INT NOT NULL\
             )",
        )
        .await
        .map_err(io_other)?;

    let existing_rows = query_scalar_u64(handle, "SELECT COUNT(*) FROM events").await?;
    if existing_rows >= target_rows {
        return Ok(());
    }

    let mut next = existing_rows + 1;
    while next <= target_rows {
        let end = (next + 999).min(target_rows);
        handle
            .execute(&build_insert_batch_sql(next, end))
            .await
            .map_err(io_other)?;
        next = end + 1;
    }

    Ok(())
}

async fn query_scalar_u64<B: QueryBackend>(handle: &B, sql: &str) -> io::Result<u64> {
    let mut stream = handle.start_query(sql).await.map_err(io_other)?;
    let row = stream
        .next_row()
        .await
        .map_err(io_other)?
        .ok_or_else(|| io_other("query returned no rows"))?;
    stream.cancel().await.map_err(io_other)?;
    match row.first() {
        Some(CellValue::Int(value)) => u64::try_from(*value)
            .map_err(|error| io_other(format!("failed to parse scalar value `{value}`: {error}"))),
        Some(CellValue::Text(value)) => value
            .parse::<u64>()
            .map_err(|error| io_other(format!("failed to parse scalar value `{value}`: {error}"))),
        Some(other) => Err(io_other(format!(
            "failed to parse scalar value `{other:?}`: not an integer"
        ))),
        None => Err(io_other("query returned no columns")),
    }
}

fn build_insert_batch_sql(start: u64, end: u64) -> String {
    let mut values = Vec::with_capacity(usize::try_from(end - start + 1).unwrap_or_default());
    for index in start..=end {
        let user_id = (index % 5_000) + 1;
        let category = match index % 5 {
            0 => "search",
            1 => "play",
            2 => "pause",
            3 => "skip",
            _ => "share",
        };
        let created_offset = index % 86_400;
        values.push(format!(
            "({index}, {user_id}, '{category}', 'payload-{index}', {created_offset})"
        ));
    }

    format!(
        "INSERT INTO events (id, user_id, category, payload, created_offset) VALUES {}",
        values.join(",")
    )
}

fn enforce_assertions(
    config: &BenchmarkConfig,
    first_row_ms: f64,
    rows_per_sec: f64,
) -> io::Result<()> {
    if let Some(max_first_row_ms) = config.assert_first_row_ms {
        if first_row_ms > max_first_row_ms {
            return Err(io_other(format!(
                "first row latency {first_row_ms:.3}ms exceeded threshold {max_first_row_ms:.3}ms"
            )));
        }
    }

    if let Some(min_rows_per_sec) = config.assert_min_rows_per_sec {
        if rows_per_sec < min_rows_per_sec {
            return Err(io_other(format!(
                "rows/sec {rows_per_sec:.3} below threshold {min_rows_per_sec:.3}"
            )));
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn peak_memory_bytes_best_effort() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    let vm_hwm_line = contents.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kb = vm_hwm_line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1_024)
}

#[cfg(not(target_os = "linux"))]
fn peak_memory_bytes_best_effort() -> Option<u64> {
    None
}

fn parse_args() -> io::Result<BenchmarkConfig> {
    let mut config = BenchmarkConfig::default();
    let outcome = parse_args_from(std::env::args().skip(1), &mut config)?;
    if outcome == ParseOutcome::HelpRequested {
        print_help();
        std::process::exit(0);
    }
    Ok(config)
}

fn parse_backend(raw: &str) -> io::Result<BackendKind> {
    match raw {
        "postgres" | "postgresql" => Ok(BackendKind::Postgres),
        "mysql" => Ok(BackendKind::MySql),
        "sqlite" => Ok(BackendKind::Sqlite),
        other => Err(io_other(format!(
            "unsupported --backend `{other}` (expected postgres, mysql or sqlite)"
        ))),
    }
}

fn parse_args_from(
    args: impl IntoIterator<Item = String>,
    config: &mut BenchmarkConfig,
) -> io::Result<ParseOutcome> {
    let mut args = args.into_iter();

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::HelpRequested),
            "--name" => config.name = next_value(&mut args, "--name")?,
            "--backend" => config.backend = parse_backend(&next_value(&mut args, "--backend")?)?,
            "--host" => config.host = next_value(&mut args, "--host")?,
            "--port" => {
                config.port = Some(
                    next_value(&mut args, "--port")?
                        .parse::<u16>()
                        .map_err(|error| io_other(format!("invalid --port value: {error}")))?,
                );
            }
            "--user" => config.user = next_value(&mut args, "--user")?,
            "--database" => config.database = next_value(&mut args, "--database")?,
            "--file" => config.file = next_value(&mut args, "--file")?,
            "--sql" => config.sql = next_value(&mut args, "--sql")?,
            "--grid-limit" => {
                let rows = next_value(&mut args, "--grid-limit")?
                    .parse::<usize>()
                    .map_err(|error| io_other(format!("invalid --grid-limit value: {error}")))?;
                config.grid_limit = if rows == 0 {
                    PreviewLimit::Unlimited
                } else {
                    PreviewLimit::Rows(rows)
                };
            }
            "--seed-rows" => {
                config.seed_rows = next_value(&mut args, "--seed-rows")?
                    .parse::<u64>()
                    .map_err(|error| io_other(format!("invalid --seed-rows value: {error}")))?;
            }
            "--assert-first-row-ms" => {
                config.assert_first_row_ms = Some(
                    next_value(&mut args, "--assert-first-row-ms")?
                        .parse::<f64>()
                        .map_err(|error| {
                            io_other(format!("invalid --assert-first-row-ms value: {error}"))
                        })?,
                );
            }
            "--assert-min-rows-per-sec" => {
                config.assert_min_rows_per_sec = Some(
                    next_value(&mut args, "--assert-min-rows-per-sec")?
                        .parse::<f64>()
                        .map_err(|error| {
                            io_other(format!("invalid --assert-min-rows-per-sec value: {error}"))
                        })?,
                );
            }
            _ => {
                return Err(io_other(format!("unknown argument `{flag}`")));
            }
        }
    }

    Ok(ParseOutcome::Config)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> io::Result<String> {
    args.next()
        .ok_or_else(|| io_other(format!("missing value for `{flag}`")))
}

fn print_help() {
    println!(
        "dbterm benchmark runner\n\n\
Usage:\n  cargo run -p dbterm-app --bin benchmark -- [OPTIONS]\n\n\
Options:\n  --backend <kind>                postgres, mysql or sqlite (default: mysql)\n  --name <name>                   Connection name used in logs (default: bench-local)\n  --host <host>                   Server host (default: 127.0.0.1)\n  --port <port>                   Server port (default: backend default)\n  --user <user>                   Server user (default: root)\n  --database <name>               Database name (default: dbterm_bench)\n  --file <path>                   SQLite database file (default: dbterm_bench.db)\n  --sql <query>                   Query to benchmark\n  --grid-limit <rows>             Rows materialized into the grid, 0 for all (default: 5000)\n  --seed-rows <count>             Seed `events` table up to count rows before benchmark\n  --assert-first-row-ms <ms>      Fail if first-row latency exceeds threshold\n  --assert-min-rows-per-sec <rps> Fail if throughput is below threshold\n\n\
Environment:\n  DBTERM_DB_PASSWORD is used for authentication.\n"
    );
}

fn io_other(error: impl std::fmt::Display) -> io::Error {
    io::Error::other(error.to_string())
}

#[cfg(test)]
mod tests {
    use dbterm_adapters::AnyBackend;
    use dbterm_core::connection_manager::ConnectionPool;
    use dbterm_core::profiles::{BackendKind, ConnectionConfig};
    use dbterm_core::query_runner::QueryExecutor;
    use dbterm_core::results::PreviewLimit;
    use dbterm_core::settings::Settings;
    use tempfile::TempDir;

    use super::{
        build_insert_batch_sql, enforce_assertions, ensure_seed_data, io_other, next_value,
        parse_args_from, query_scalar_u64, run_grid_benchmark, run_query_benchmark,
        BenchmarkConfig, ParseOutcome,
    };

    #[test]
    fn parse_args_from_applies_overrides() {
        let mut config = BenchmarkConfig::default();
        let outcome = parse_args_from(
            [
                "--name",
                "ci-bench",
                "--backend",
                "postgres",
                "--host",
                "db",
                "--port",
                "15432",
                "--user",
                "bench_user",
                "--database",
                "bench_db",
                "--sql",
                "SELECT * FROM events LIMIT 100",
                "--grid-limit",
                "0",
                "--seed-rows",
                "12345",
                "--assert-first-row-ms",
                "1500",
                "--assert-min-rows-per-sec",
                "4000",
            ]
            .map(str::to_string),
            &mut config,
        )
        .expect("parse should succeed");

        assert_eq!(outcome, ParseOutcome::Config);
        assert_eq!(config.name, "ci-bench");
        assert_eq!(config.backend, BackendKind::Postgres);
        assert_eq!(config.host, "db");
        assert_eq!(config.port, Some(15432));
        assert_eq!(config.user, "bench_user");
        assert_eq!(config.database, "bench_db");
        assert_eq!(config.sql, "SELECT * FROM events LIMIT 100");
        assert_eq!(config.grid_limit, PreviewLimit::Unlimited);
        assert_eq!(config.seed_rows, 12345);
        assert_eq!(config.assert_first_row_ms, Some(1500.0));
        assert_eq!(config.assert_min_rows_per_sec, Some(4000.0));

        let connection = config.connection();
        assert_eq!(connection.backend, BackendKind::Postgres);
        assert_eq!(connection.effective_port(), Some(15432));
    }

    #[test]
    fn parse_args_from_detects_help() {
        let mut config = BenchmarkConfig::default();
        let outcome = parse_args_from(vec!["--help".to_string()], &mut config).expect("help parse");
        assert_eq!(outcome, ParseOutcome::HelpRequested);
    }

    #[test]
    fn parse_args_from_fails_for_unknown_flag_or_backend() {
        let mut config = BenchmarkConfig::default();
        let err = parse_args_from(vec!["--bogus".to_string()], &mut config)
            .expect_err("unknown flags should fail");
        assert!(err.to_string().contains("unknown argument"));

        let err = parse_args_from(
            vec!["--backend".to_string(), "oracle".to_string()],
            &mut config,
        )
        .expect_err("unknown backend should fail");
        assert!(err.to_string().contains("unsupported --backend"));
    }

    #[test]
    fn next_value_reports_missing_flag_values() {
        let mut args = std::iter::empty::<String>();
        let err = next_value(&mut args, "--port").expect_err("missing value should fail");
        assert!(err.to_string().contains("missing value for `--port`"));
    }

    #[test]
    fn build_insert_batch_sql_emits_expected_rows() {
        let sql = build_insert_batch_sql(1, 3);
        assert!(sql.starts_with(
            "INSERT INTO events (id, user_id, category, payload, created_offset) VALUES "
        ));
        assert!(sql.contains("(1, 2, 'play', 'payload-1', 1)"));
        assert!(sql.contains("(2, 3, 'pause', 'payload-2', 2)"));
        assert!(sql.contains("(3, 4, 'skip', 'payload-3', 3)"));
    }

    #[test]
    fn enforce_assertions_validates_thresholds() {
        let config = BenchmarkConfig {
            assert_first_row_ms: Some(50.0),
            assert_min_rows_per_sec: Some(10_000.0),
            ..BenchmarkConfig::default()
        };

        let first_row_err =
            enforce_assertions(&config, 51.0, 20_000.0).expect_err("first-row threshold");
        assert!(first_row_err.to_string().contains("first row latency"));

        let rows_per_sec_err =
            enforce_assertions(&config, 20.0, 9_999.0).expect_err("throughput threshold");
        assert!(rows_per_sec_err.to_string().contains("rows/sec"));
    }

    #[test]
    fn io_other_uses_display_text() {
        let err = io_other("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn benchmark_helpers_work_against_sqlite() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("bench.db");
        let settings = Settings::default();
        let executor = QueryExecutor::new(settings.timeouts().query, settings.timeouts().probe);

        let mut pool = ConnectionPool::new(AnyBackend::default(), settings.timeouts());
        pool.connect(&ConnectionConfig::sqlite("bench", path.display().to_string()))
            .await
            .expect("connect should succeed");
        let session = pool.session().expect("session after connect");

        ensure_seed_data(session.handle(), 1_250)
            .await
            .expect("seed rows");
        ensure_seed_data(session.handle(), 1_250)
            .await
            .expect("seeding again is a no-op");
        let rows = query_scalar_u64(session.handle(), "SELECT COUNT(*) FROM events")
            .await
            .expect("count rows");
        assert_eq!(rows, 1_250);

        let sql = "SELECT id, user_id, category, payload, created_offset FROM events ORDER BY id";
        let metrics = run_query_benchmark(&executor, session.handle(), sql)
            .await
            .expect("stream benchmark");
        assert_eq!(metrics.rows_streamed, 1_250);
        assert!(metrics.first_row.is_some());

        let grid = run_grid_benchmark(&executor, session, sql, PreviewLimit::Rows(1_000))
            .await
            .expect("grid benchmark");
        assert_eq!(grid.rows, 1_000);
        assert!(grid.truncated);

        let err = query_scalar_u64(session.handle(), "SELECT 'not-an-int'")
            .await
            .expect_err("parse should fail");
        assert!(err.to_string().contains("failed to parse scalar value"));

        let err = run_query_benchmark(&executor, session.handle(), "DELETE FROM events")
            .await
            .expect_err("writes are rejected");
        assert!(err.to_string().contains("must return rows"));

        pool.close().await.expect("close should succeed");
    }
}
