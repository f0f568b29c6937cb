use async_trait::async_trait;
use dbterm_core::connection_manager::{BackendError, ConnectionBackend};
use dbterm_core::profiles::BackendKind;
use dbterm_core::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream};
use dbterm_core::resolver::DialTarget;

use crate::d1::{D1Backend, D1Connection, D1RowStream};
use crate::mysql::{MysqlBackend, MysqlConnection, MysqlRowStream};
use crate::postgres::{PostgresBackend, PostgresConnection, PostgresRowStream};
use crate::sqlite::{SqliteBackend, SqliteConnection, SqliteRowStream};

/// Picks the driver named by the dial target.
#[derive(Debug, Clone, Default)]
pub struct AnyBackend {
    postgres: PostgresBackend,
    mysql: MysqlBackend,
    sqlite: SqliteBackend,
    d1: D1Backend,
}

#[derive(Debug, Clone)]
pub enum AnyConnection {
    Postgres(PostgresConnection),
    MySql(MysqlConnection),
    Sqlite(SqliteConnection),
    D1(D1Connection),
}

impl AnyConnection {
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Postgres(_) => BackendKind::Postgres,
            Self::MySql(_) => BackendKind::MySql,
            Self::Sqlite(_) => BackendKind::Sqlite,
            Self::D1(_) => BackendKind::CloudflareD1,
        }
    }
}

#[async_trait]
impl ConnectionBackend for AnyBackend {
    type Connection = AnyConnection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError> {
        Ok(match target.driver {
            BackendKind::Postgres => AnyConnection::Postgres(self.postgres.connect(target).await?),
            BackendKind::MySql => AnyConnection::MySql(self.mysql.connect(target).await?),
            BackendKind::Sqlite => AnyConnection::Sqlite(self.sqlite.connect(target).await?),
            BackendKind::CloudflareD1 => AnyConnection::D1(self.d1.connect(target).await?),
        })
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), BackendError> {
        match connection {
            AnyConnection::Postgres(connection) => self.postgres.disconnect(connection).await,
            AnyConnection::MySql(connection) => self.mysql.disconnect(connection).await,
            AnyConnection::Sqlite(connection) => self.sqlite.disconnect(connection).await,
            AnyConnection::D1(connection) => self.d1.disconnect(connection).await,
        }
    }
}

#[async_trait]
impl QueryBackend for AnyConnection {
    type Stream = AnyRowStream;

    async fn ping(&self) -> Result<(), QueryBackendError> {
        match self {
            Self::Postgres(connection) => connection.ping().await,
            Self::MySql(connection) => connection.ping().await,
            Self::Sqlite(connection) => connection.ping().await,
            Self::D1(connection) => connection.ping().await,
        }
    }

    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
        Ok(match self {
            Self::Postgres(connection) => AnyRowStream::Postgres(connection.start_query(sql).await?),
            Self::MySql(connection) => AnyRowStream::MySql(connection.start_query(sql).await?),
            Self::Sqlite(connection) => AnyRowStream::Sqlite(connection.start_query(sql).await?),
            Self::D1(connection) => AnyRowStream::D1(connection.start_query(sql).await?),
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
        match self {
            Self::Postgres(connection) => connection.execute(sql).await,
            Self::MySql(connection) => connection.execute(sql).await,
            Self::Sqlite(connection) => connection.execute(sql).await,
            Self::D1(connection) => connection.execute(sql).await,
        }
    }
}

#[derive(Debug)]
pub enum AnyRowStream {
    Postgres(PostgresRowStream),
    MySql(MysqlRowStream),
    Sqlite(SqliteRowStream),
    D1(D1RowStream),
}

#[async_trait]
impl RowStream for AnyRowStream {
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
        match self {
            Self::Postgres(stream) => stream.columns().await,
            Self::MySql(stream) => stream.columns().await,
            Self::Sqlite(stream) => stream.columns().await,
            Self::D1(stream) => stream.columns().await,
        }
    }

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
        match self {
            Self::Postgres(stream) => stream.next_row().await,
            Self::MySql(stream) => stream.next_row().await,
            Self::Sqlite(stream) => stream.next_row().await,
            Self::D1(stream) => stream.next_row().await,
        }
    }

    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        match self {
            Self::Postgres(stream) => stream.cancel().await,
            Self::MySql(stream) => stream.cancel().await,
            Self::Sqlite(stream) => stream.cancel().await,
            Self::D1(stream) => stream.cancel().await,
        }
    }
}
