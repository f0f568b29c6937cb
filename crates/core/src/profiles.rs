use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "postgresql")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "sqlite")]
    Sqlite,
    #[serde(rename = "d1")]
    CloudflareD1,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [Self::Postgres, Self::MySql, Self::Sqlite, Self::CloudflareD1];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
            Self::CloudflareD1 => "Cloudflare D1",
        }
    }

    #[must_use]
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite | Self::CloudflareD1 => None,
        }
    }

    #[must_use]
    pub fn is_file_based(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Whether the backend speaks an SQLite dialect (catalog in `sqlite_master`).
    #[must_use]
    pub fn is_sqlite_dialect(self) -> bool {
        matches!(self, Self::Sqlite | Self::CloudflareD1)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Form fields a backend may require before any I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    Host,
    User,
    Database,
    FilePath,
    AccountId,
    DatabaseId,
    AuthToken,
}

impl ConfigField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::User => "user",
            Self::Database => "database",
            Self::FilePath => "file_path",
            Self::AccountId => "account_id",
            Self::DatabaseId => "database_id",
            Self::AuthToken => "auth_token",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssl_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active: bool,
}

impl ConnectionConfig {
    #[must_use]
    pub fn network(
        name: impl Into<String>,
        backend: BackendKind,
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            host: host.into(),
            user: user.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sqlite(name: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::Sqlite,
            file_path: file_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cloudflare_d1(
        name: impl Into<String>,
        account_id: impl Into<String>,
        database_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::CloudflareD1,
            account_id: account_id.into(),
            database_id: database_id.into(),
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.backend.default_port())
    }

    #[must_use]
    pub fn display_label(&self) -> String {
        match self.backend {
            BackendKind::Sqlite => format!("[sqlite] {} ({})", self.name, self.file_path),
            BackendKind::CloudflareD1 => format!("[d1] {} ({})", self.name, self.database_id),
            BackendKind::Postgres | BackendKind::MySql => format!(
                "[{}] {} ({}@{}:{}/{})",
                if self.backend == BackendKind::Postgres {
                    "postgresql"
                } else {
                    "mysql"
                },
                self.name,
                self.user,
                self.host,
                self.effective_port().map(|port| port.to_string()).unwrap_or_default(),
                self.database
            ),
        }
    }
}

// Secrets stay out of debug output and therefore out of logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("database", &self.database)
            .field("file_path", &self.file_path)
            .field("ssl_mode", &self.ssl_mode)
            .field("account_id", &self.account_id)
            .field("database_id", &self.database_id)
            .field("auth_token", &redact(&self.auth_token))
            .field("last_used", &self.last_used)
            .field("active", &self.active)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "***"
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read connections file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse connections file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize connections: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write connections file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection index {index} is out of range ({len} saved)")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    connections: Vec<ConnectionConfig>,
}

/// Saved connections, read once and rewritten whole on every mutation.
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    path: PathBuf,
    connections: Vec<ConnectionConfig>,
}

impl ConnectionStore {
    pub fn load_default() -> Result<Self, StoreError> {
        Self::load_from_path(default_store_path()?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                connections: Vec::new(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(Self {
                path,
                connections: Vec::new(),
            });
        }

        let doc: StoreDocument = toml::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            connections: doc.connections,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn connections(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ConnectionConfig> {
        self.connections.get(index)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<(usize, &ConnectionConfig)> {
        self.connections
            .iter()
            .enumerate()
            .find(|(_, connection)| connection.name == name)
    }

    pub fn add(&mut self, mut connection: ConnectionConfig) -> Result<usize, StoreError> {
        connection.last_used = Some(Utc::now());
        self.connections.push(connection);
        self.persist()?;
        Ok(self.connections.len() - 1)
    }

    pub fn update(&mut self, index: usize, connection: ConnectionConfig) -> Result<(), StoreError> {
        let len = self.connections.len();
        let slot = self
            .connections
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange { index, len })?;
        *slot = connection;
        self.persist()
    }

    pub fn delete(&mut self, index: usize) -> Result<ConnectionConfig, StoreError> {
        if index >= self.connections.len() {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.connections.len(),
            });
        }
        let removed = self.connections.remove(index);
        self.persist()?;
        Ok(removed)
    }

    pub fn mark_used(&mut self, index: usize) -> Result<(), StoreError> {
        if index >= self.connections.len() {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.connections.len(),
            });
        }
        for (position, connection) in self.connections.iter_mut().enumerate() {
            connection.active = position == index;
        }
        self.connections[index].last_used = Some(Utc::now());
        self.persist()
    }

    /// Writes a sibling temp file and renames it over the store.
    pub fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| StoreError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = StoreDocument {
            connections: self.connections.clone(),
        };
        let rendered =
            toml::to_string_pretty(&doc).map_err(|source| StoreError::Serialize { source })?;

        let temp_path = self.path.with_extension("toml.tmp");
        write_private(&temp_path, rendered.as_bytes()).map_err(|source| StoreError::Write {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

pub fn default_config_dir() -> Result<PathBuf, StoreError> {
    let base_dir = if let Some(custom) = env::var_os("DBTERM_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(StoreError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(StoreError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("dbterm"))
}

pub fn default_store_path() -> Result<PathBuf, StoreError> {
    Ok(default_config_dir()?.join("connections.toml"))
}
