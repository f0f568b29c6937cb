//! The interactive owner of the active connection, table list and result view.
//!
//! Every slow operation is started with a `begin_*` call that returns a
//! [`Job`]: a `'static` future the caller runs wherever it likes (usually a
//! spawned task) and whose [`WorkspaceEvent`] is handed back to
//! [`Workspace::apply`]. `apply` is the only place state changes. Each job kind
//! carries a generation number; results from superseded jobs are dropped.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::connection_manager::{
    open, ActiveConnection, ConnectionBackend, ConnectionPool, ConnectionStatus,
    VerifiedConnection,
};
use crate::errors::WorkspaceError;
use crate::format::format_duration;
use crate::profiles::ConnectionConfig;
use crate::query_runner::{
    preview_sql, QueryExecutor, QueryFailure, QueryOutcome, QueryReport, Session,
};
use crate::reachability::{ReachabilityProber, ReachabilityResult};
use crate::results::{Materializer, PreviewLimit};
use crate::schema::list_tables;
use crate::settings::{Settings, Timeouts};
use crate::view_state::ResultViewState;

pub type Job<C> = Pin<Box<dyn Future<Output = WorkspaceEvent<C>> + Send + 'static>>;

/// Where a result grid came from, so it can be reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Table { name: String, limit: PreviewLimit },
    Sql(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Start a new view at the top.
    Fresh,
    /// Keep sort and relocate the cursor.
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitChange {
    Increase,
    Decrease,
    ToggleUnlimited,
}

#[derive(Debug)]
pub enum WorkspaceEvent<C> {
    Connected {
        generation: u64,
        result: Result<VerifiedConnection<C>, WorkspaceError>,
    },
    TablesListed {
        generation: u64,
        result: Result<Vec<String>, WorkspaceError>,
    },
    QueryFinished {
        generation: u64,
        source: QuerySource,
        mode: LoadMode,
        result: Result<QueryReport, QueryFailure>,
    },
    HealthChecked {
        result: Result<Duration, WorkspaceError>,
    },
    Reachability(ReachabilityResult),
    Released {
        connection: String,
        result: Result<(), WorkspaceError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub message: String,
    pub hint: Option<String>,
    pub is_error: bool,
}

impl Status {
    fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
            is_error: false,
        }
    }

    fn error(error: &WorkspaceError) -> Self {
        Self {
            message: error.to_string(),
            hint: error.hint().map(str::to_string),
            is_error: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Generations {
    connect: u64,
    tables: u64,
    query: u64,
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

pub struct Workspace<B: ConnectionBackend> {
    pool: ConnectionPool<B>,
    prober: ReachabilityProber<B>,
    executor: QueryExecutor,
    generations: Generations,
    tables: Vec<String>,
    selected_table: Option<String>,
    limit: PreviewLimit,
    view: Option<ResultViewState>,
    source: Option<QuerySource>,
    reachability: Vec<Option<bool>>,
    status: Status,
    last_failure: Option<QueryFailure>,
}

impl<B> Workspace<B>
where
    B: ConnectionBackend + Clone + 'static,
{
    #[must_use]
    pub fn new(backend: B, settings: &Settings) -> Self {
        let timeouts = settings.timeouts();
        let executor = QueryExecutor::new(timeouts.query, timeouts.probe)
            .with_materializer(Materializer::new(settings.cell_preview_runes));
        Self {
            pool: ConnectionPool::new(backend.clone(), timeouts),
            prober: ReachabilityProber::new(backend),
            executor,
            generations: Generations::default(),
            tables: Vec::new(),
            selected_table: None,
            limit: PreviewLimit::from_setting(settings.preview_limit),
            view: None,
            source: None,
            reachability: Vec::new(),
            status: Status::info("Not connected"),
            last_failure: None,
        }
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.pool.status()
    }

    #[must_use]
    pub fn active(&self) -> Option<&ActiveConnection<B::Connection>> {
        self.pool.active()
    }

    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    #[must_use]
    pub fn selected_table(&self) -> Option<&str> {
        self.selected_table.as_deref()
    }

    #[must_use]
    pub fn limit(&self) -> PreviewLimit {
        self.limit
    }

    #[must_use]
    pub fn view(&self) -> Option<&ResultViewState> {
        self.view.as_ref()
    }

    pub fn view_mut(&mut self) -> Option<&mut ResultViewState> {
        self.view.as_mut()
    }

    #[must_use]
    pub fn source(&self) -> Option<&QuerySource> {
        self.source.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<&QueryFailure> {
        self.last_failure.as_ref()
    }

    /// Reachability of saved connection `index` from the latest probe round.
    #[must_use]
    pub fn reachability(&self, index: usize) -> Option<bool> {
        self.reachability.get(index).copied().flatten()
    }

    #[must_use]
    pub fn limit_status(&self) -> String {
        format!("limit: {}", self.limit)
    }

    #[must_use]
    pub fn sort_status(&self) -> String {
        self.view
            .as_ref()
            .map_or_else(|| "sort: none".to_string(), ResultViewState::sort_status)
    }

    pub fn begin_connect(&mut self, config: ConnectionConfig) -> Job<B::Connection> {
        let generation = bump(&mut self.generations.connect);
        let backend = self.pool.backend().clone();
        let timeouts = self.pool.timeouts();
        self.status = Status::info(format!("Connecting to {}...", config.name));
        info!(connection = %config.name, backend = %config.backend, generation, "connect started");

        Box::pin(async move {
            let result = open(&backend, &config, timeouts).await;
            WorkspaceEvent::Connected { generation, result }
        })
    }

    pub fn begin_list_tables(&mut self) -> Option<Job<B::Connection>> {
        let session = self.session_or_status()?;
        let generation = bump(&mut self.generations.tables);
        let timeout = self.pool.timeouts().query;

        Some(Box::pin(async move {
            let result = list_tables(&session, timeout).await;
            WorkspaceEvent::TablesListed { generation, result }
        }))
    }

    /// Browses `table` with the current preview limit.
    pub fn begin_preview(&mut self, table: &str) -> Option<Job<B::Connection>> {
        let source = QuerySource::Table {
            name: table.to_string(),
            limit: self.limit,
        };
        self.begin_source(source, LoadMode::Fresh)
    }

    /// Runs ad-hoc SQL without a row limit.
    pub fn begin_query(&mut self, sql: &str) -> Option<Job<B::Connection>> {
        if sql.trim().is_empty() {
            self.status = Status::info("Nothing to run");
            return None;
        }
        self.begin_source(QuerySource::Sql(sql.to_string()), LoadMode::Fresh)
    }

    /// Re-runs whatever produced the current grid, keeping sort and cursor.
    pub fn begin_refresh(&mut self) -> Option<Job<B::Connection>> {
        let Some(source) = self.source.clone() else {
            self.status = Status::info("Nothing to refresh");
            return None;
        };
        let source = match source {
            QuerySource::Table { name, .. } => QuerySource::Table {
                name,
                limit: self.limit,
            },
            sql @ QuerySource::Sql(_) => sql,
        };
        self.begin_source(source, LoadMode::Reload)
    }

    /// Steps the preview limit. With a table open the new limit only sticks
    /// once the reload succeeds.
    pub fn begin_limit_change(&mut self, change: LimitChange) -> Option<Job<B::Connection>> {
        let next = match change {
            LimitChange::Increase => self.limit.increased(),
            LimitChange::Decrease => self.limit.decreased(),
            LimitChange::ToggleUnlimited => self.limit.toggled_unlimited(),
        };
        if next == self.limit {
            self.status = Status::info(self.limit_status());
            return None;
        }

        match self.source.clone() {
            Some(QuerySource::Table { name, .. }) => self.begin_source(
                QuerySource::Table { name, limit: next },
                LoadMode::Reload,
            ),
            _ => {
                self.limit = next;
                self.status = Status::info(self.limit_status());
                None
            }
        }
    }

    pub fn begin_health_check(&mut self) -> Option<Job<B::Connection>> {
        let session = self.session_or_status()?;
        let backend = self.pool.backend().clone();
        let timeout = self.pool.timeouts().probe;

        Some(Box::pin(async move {
            let started_at = Instant::now();
            let pinged = tokio::time::timeout(timeout, backend.ping(session.handle())).await;
            let result = match pinged {
                Ok(Ok(())) => Ok(started_at.elapsed()),
                Ok(Err(err)) => Err(WorkspaceError::connection_lost(err.message())),
                Err(_) => Err(WorkspaceError::timeout("health check", timeout)),
            };
            WorkspaceEvent::HealthChecked { result }
        }))
    }

    /// Starts a probe round over `configs`. Results from older rounds are
    /// ignored by [`apply`](Self::apply).
    pub fn begin_probe(
        &mut self,
        configs: &[ConnectionConfig],
    ) -> UnboundedReceiver<ReachabilityResult> {
        self.reachability = vec![None; configs.len()];
        let timeout = self.pool.timeouts().reachability;
        self.prober.probe_all(configs, timeout)
    }

    /// Folds a finished job back into the workspace. Returned jobs are follow-ups to run.
    pub fn apply(&mut self, event: WorkspaceEvent<B::Connection>) -> Vec<Job<B::Connection>> {
        match event {
            WorkspaceEvent::Connected { generation, result } => {
                self.apply_connected(generation, result)
            }
            WorkspaceEvent::TablesListed { generation, result } => {
                self.apply_tables(generation, result);
                Vec::new()
            }
            WorkspaceEvent::QueryFinished {
                generation,
                source,
                mode,
                result,
            } => self.apply_query(generation, source, mode, result),
            WorkspaceEvent::HealthChecked { result } => {
                match result {
                    Ok(latency) => {
                        self.pool.record_health_check(latency);
                        self.status =
                            Status::info(format!("Healthy ({})", format_duration(latency)));
                    }
                    Err(err) => self.status = Status::error(&err),
                }
                Vec::new()
            }
            WorkspaceEvent::Reachability(result) => {
                if result.round == self.prober.round() {
                    if let Some(slot) = self.reachability.get_mut(result.index) {
                        *slot = Some(result.reachable);
                    }
                }
                Vec::new()
            }
            WorkspaceEvent::Released { connection, result } => {
                if let Err(err) = result {
                    warn!(connection = %connection, error = %err, "failed to close connection");
                }
                Vec::new()
            }
        }
    }

    /// Closes the active connection and clears everything derived from it.
    pub async fn disconnect(&mut self) -> Result<(), WorkspaceError> {
        self.generations.connect += 1;
        self.generations.tables += 1;
        self.generations.query += 1;
        self.reset_connection_state();
        self.status = Status::info("Disconnected");
        self.pool.close().await
    }

    fn apply_connected(
        &mut self,
        generation: u64,
        result: Result<VerifiedConnection<B::Connection>, WorkspaceError>,
    ) -> Vec<Job<B::Connection>> {
        if generation != self.generations.connect {
            debug!(generation, "dropping superseded connect result");
            return match result {
                Ok(verified) => {
                    let name = verified.config().name.clone();
                    vec![self.release_job(name, verified.into_handle())]
                }
                Err(_) => Vec::new(),
            };
        }

        let verified = match result {
            Ok(verified) => verified,
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.status = Status::error(&err);
                return Vec::new();
            }
        };

        let name = verified.config().name.clone();
        let latency = verified.latency();
        let mut jobs = Vec::new();
        if let Some(previous) = self.pool.swap(verified) {
            let previous_name = previous.config().name.clone();
            jobs.push(self.release_job(previous_name, previous.into_handle()));
        }

        self.generations.query += 1;
        self.reset_connection_state();
        self.status = Status::info(format!("Connected to {name} ({})", format_duration(latency)));
        jobs.extend(self.begin_list_tables());
        jobs
    }

    fn apply_tables(&mut self, generation: u64, result: Result<Vec<String>, WorkspaceError>) {
        if generation != self.generations.tables {
            debug!(generation, "dropping superseded table listing");
            return;
        }
        match result {
            Ok(tables) => {
                if self
                    .selected_table
                    .as_ref()
                    .is_some_and(|selected| !tables.contains(selected))
                {
                    self.selected_table = None;
                }
                self.tables = tables;
            }
            Err(err) => self.status = Status::error(&err),
        }
    }

    fn apply_query(
        &mut self,
        generation: u64,
        source: QuerySource,
        mode: LoadMode,
        result: Result<QueryReport, QueryFailure>,
    ) -> Vec<Job<B::Connection>> {
        if generation != self.generations.query {
            debug!(generation, "dropping superseded query result");
            return Vec::new();
        }

        let report = match result {
            Ok(report) => report,
            Err(failure) => {
                let mut status = Status::error(&failure.error);
                if let Some(rows) = failure.rows_materialized {
                    status.message = format!("{} (after {rows} rows)", status.message);
                }
                self.status = status;
                self.last_failure = Some(failure);
                return Vec::new();
            }
        };

        self.last_failure = None;
        let summary = report.summary();
        match report.outcome {
            QueryOutcome::Rows(grid) => {
                let truncated = grid.is_truncated();
                match (mode, self.view.as_mut()) {
                    (LoadMode::Reload, Some(view)) => {
                        view.replace_grid(grid);
                    }
                    _ => self.view = Some(ResultViewState::new(grid)),
                }
                if let QuerySource::Table { name, limit } = &source {
                    self.selected_table = Some(name.clone());
                    self.limit = *limit;
                }
                self.source = Some(source);
                self.status = Status::info(if truncated {
                    format!("{summary} ({})", self.limit_status())
                } else {
                    summary
                });
                Vec::new()
            }
            QueryOutcome::Affected(_) => {
                let mut jobs: Vec<Job<B::Connection>> =
                    self.begin_list_tables().into_iter().collect();
                if let Some(QuerySource::Table { .. }) = self.source {
                    jobs.extend(self.begin_refresh());
                }
                self.status = Status::info(summary);
                jobs
            }
        }
    }

    fn begin_source(
        &mut self,
        source: QuerySource,
        mode: LoadMode,
    ) -> Option<Job<B::Connection>> {
        let session = self.session_or_status()?;
        let generation = bump(&mut self.generations.query);
        let executor = self.executor;
        let (sql, limit) = match &source {
            QuerySource::Table { name, limit } => {
                (preview_sql(session.backend(), name, *limit), *limit)
            }
            QuerySource::Sql(sql) => (sql.clone(), PreviewLimit::Unlimited),
        };
        self.status = Status::info("Running...");

        Some(Box::pin(async move {
            let result = executor.run_to_grid(&session, &sql, limit).await;
            WorkspaceEvent::QueryFinished {
                generation,
                source,
                mode,
                result,
            }
        }))
    }

    fn release_job(&self, connection: String, handle: B::Connection) -> Job<B::Connection> {
        let backend = self.pool.backend().clone();
        Box::pin(async move {
            let result = backend
                .disconnect(handle)
                .await
                .map_err(|err| WorkspaceError::connection_lost(err.message()));
            WorkspaceEvent::Released { connection, result }
        })
    }

    fn session_or_status(&mut self) -> Option<Session<B::Connection>> {
        let session = self.pool.session().cloned();
        if session.is_none() {
            self.status = Status::info("Not connected");
        }
        session
    }

    fn reset_connection_state(&mut self) {
        self.tables.clear();
        self.selected_table = None;
        self.view = None;
        self.source = None;
        self.last_failure = None;
    }
}

impl<B> Workspace<B>
where
    B: ConnectionBackend,
{
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        self.pool.timeouts()
    }
}
