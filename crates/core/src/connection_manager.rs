use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::WorkspaceError;
use crate::profiles::{BackendKind, ConnectionConfig};
use crate::query_runner::{QueryBackend, Session};
use crate::resolver::{resolve, DialTarget};
use crate::settings::Timeouts;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
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

/// Opens and closes driver handles for the backends a build supports.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    type Connection: QueryBackend + Clone + 'static;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError>;

    async fn ping(&self, connection: &Self::Connection) -> Result<(), BackendError> {
        connection
            .ping()
            .await
            .map_err(|err| BackendError::new(err.message()))
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connection_name: Option<String>,
    pub backend: Option<BackendKind>,
    pub is_connected: bool,
    pub last_latency: Option<Duration>,
    pub last_health_check_at: Option<SystemTime>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            connection_name: None,
            backend: None,
            is_connected: false,
            last_latency: None,
            last_health_check_at: None,
        }
    }
}

/// A handle that passed resolve, connect and ping. Only [`open`] builds one.
#[derive(Debug)]
pub struct VerifiedConnection<C> {
    config: ConnectionConfig,
    handle: C,
    latency: Duration,
}

impl<C> VerifiedConnection<C> {
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn into_handle(self) -> C {
        self.handle
    }
}

#[derive(Debug)]
pub struct ActiveConnection<C> {
    config: ConnectionConfig,
    session: Session<C>,
}

impl<C> ActiveConnection<C> {
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.session.backend()
    }

    pub fn into_handle(self) -> C {
        self.session.into_handle()
    }
}

/// Resolves, connects and pings under the connect/probe deadlines.
pub async fn open<B: ConnectionBackend>(
    backend: &B,
    config: &ConnectionConfig,
    timeouts: Timeouts,
) -> Result<VerifiedConnection<B::Connection>, WorkspaceError> {
    let target = resolve(config)?.with_connect_timeout(timeouts.connect);
    let started_at = Instant::now();

    let handle = match tokio::time::timeout(timeouts.connect, backend.connect(&target)).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => return Err(WorkspaceError::unreachable(err.message(), config)),
        Err(_) => return Err(WorkspaceError::timeout("connect", timeouts.connect)),
    };

    let pinged = match tokio::time::timeout(timeouts.probe, backend.ping(&handle)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(WorkspaceError::unreachable(err.message(), config)),
        Err(_) => Err(WorkspaceError::timeout("ping", timeouts.probe)),
    };
    if let Err(err) = pinged {
        if let Err(close_err) = backend.disconnect(handle).await {
            warn!(error = %close_err, "failed to close unverified connection");
        }
        return Err(err);
    }

    Ok(VerifiedConnection {
        config: config.clone(),
        handle,
        latency: started_at.elapsed(),
    })
}

/// Owns the single live connection of a workspace.
pub struct ConnectionPool<B: ConnectionBackend> {
    backend: B,
    timeouts: Timeouts,
    active: Option<ActiveConnection<B::Connection>>,
    last_latency: Option<Duration>,
    last_health_check_at: Option<SystemTime>,
}

impl<B: ConnectionBackend> fmt::Debug for ConnectionPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("timeouts", &self.timeouts)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<B: ConnectionBackend> ConnectionPool<B> {
    #[must_use]
    pub fn new(backend: B, timeouts: Timeouts) -> Self {
        Self {
            backend,
            timeouts,
            active: None,
            last_latency: None,
            last_health_check_at: None,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connection_name: self
                .active
                .as_ref()
                .map(|active| active.config.name.clone()),
            backend: self.active.as_ref().map(ActiveConnection::backend),
            is_connected: self.active.is_some(),
            last_latency: self.last_latency,
            last_health_check_at: self.last_health_check_at,
        }
    }

    #[must_use]
    pub fn active(&self) -> Option<&ActiveConnection<B::Connection>> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session<B::Connection>> {
        self.active.as_ref().map(ActiveConnection::session)
    }

    pub async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<VerifiedConnection<B::Connection>, WorkspaceError> {
        open(&self.backend, config, self.timeouts).await
    }

    /// Installs a verified handle and hands back the one it replaced.
    pub fn swap(
        &mut self,
        verified: VerifiedConnection<B::Connection>,
    ) -> Option<ActiveConnection<B::Connection>> {
        let VerifiedConnection {
            config,
            handle,
            latency,
        } = verified;
        info!(
            connection = %config.name,
            backend = %config.backend,
            latency_ms = latency.as_millis(),
            "connection swapped in"
        );
        let session = Session::new(handle, config.backend);
        self.last_latency = Some(latency);
        self.last_health_check_at = Some(SystemTime::now());
        self.active.replace(ActiveConnection { config, session })
    }

    /// Open, swap, then close whatever was active before.
    pub async fn connect(&mut self, config: &ConnectionConfig) -> Result<Duration, WorkspaceError> {
        let verified = self.open(config).await?;
        let latency = verified.latency();
        if let Some(previous) = self.swap(verified) {
            self.release(previous).await;
        }
        Ok(latency)
    }

    /// Closes a handle that is no longer active, logging failures.
    pub async fn release(&self, previous: ActiveConnection<B::Connection>) {
        let name = previous.config.name.clone();
        if let Err(err) = self.backend.disconnect(previous.into_handle()).await {
            warn!(connection = %name, error = %err, "failed to close replaced connection");
        }
    }

    pub async fn health_check(&mut self) -> Result<Duration, WorkspaceError> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| WorkspaceError::connection_lost("not connected"))?;

        let started_at = Instant::now();
        match tokio::time::timeout(
            self.timeouts.probe,
            self.backend.ping(active.session.handle()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(WorkspaceError::connection_lost(err.message())),
            Err(_) => return Err(WorkspaceError::timeout("health check", self.timeouts.probe)),
        }

        let latency = started_at.elapsed();
        self.last_latency = Some(latency);
        self.last_health_check_at = Some(SystemTime::now());
        Ok(latency)
    }

    pub fn record_health_check(&mut self, latency: Duration) {
        if self.active.is_some() {
            self.last_latency = Some(latency);
            self.last_health_check_at = Some(SystemTime::now());
        }
    }

    /// Idempotent.
    pub async fn close(&mut self) -> Result<(), WorkspaceError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        self.last_latency = None;
        self.last_health_check_at = None;
        self.backend
            .disconnect(active.into_handle())
            .await
            .map_err(|err| WorkspaceError::connection_lost(err.message()))
    }

    /// Takes the active connection out without closing it.
    pub fn take(&mut self) -> Option<ActiveConnection<B::Connection>> {
        self.last_latency = None;
        self.last_health_check_at = None;
        self.active.take()
    }
}
