//! Turns a [`ConnectionConfig`] into the dial string and driver a backend needs.
//!
//! Resolution performs no I/O: required fields are checked, defaults filled in
//! and a driver-specific connection string produced.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::errors::WorkspaceError;
use crate::profiles::{BackendKind, ConfigField, ConnectionConfig};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub const POOL_MAX_OPEN: usize = 5;
pub const POOL_MAX_IDLE: usize = 2;
pub const POOL_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);

const D1_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_SSL_MODE: &str = "disable";

#[derive(Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub driver: BackendKind,
    pub dial_string: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl DialTarget {
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Dial string with any password or token replaced by `***`.
    #[must_use]
    pub fn redacted(&self) -> String {
        match Url::parse(&self.dial_string) {
            Ok(mut url) if url.has_host() => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                let pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .map(|(key, value)| {
                        let value = if key == "token" || key == "password" {
                            "***".to_string()
                        } else {
                            value.into_owned()
                        };
                        (key.into_owned(), value)
                    })
                    .collect();
                if !pairs.is_empty() {
                    url.query_pairs_mut().clear().extend_pairs(pairs);
                }
                url.to_string()
            }
            _ => self.dial_string.clone(),
        }
    }
}

impl fmt::Debug for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialTarget")
            .field("driver", &self.driver)
            .field("dial_string", &self.redacted())
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// Fields a backend needs, in the order the connection form shows them.
#[must_use]
pub fn required_fields(backend: BackendKind) -> &'static [ConfigField] {
    match backend {
        BackendKind::Postgres | BackendKind::MySql => {
            &[ConfigField::Host, ConfigField::User, ConfigField::Database]
        }
        BackendKind::Sqlite => &[ConfigField::FilePath],
        BackendKind::CloudflareD1 => &[
            ConfigField::AccountId,
            ConfigField::DatabaseId,
            ConfigField::AuthToken,
        ],
    }
}

#[must_use]
pub fn missing_fields(config: &ConnectionConfig) -> Vec<ConfigField> {
    required_fields(config.backend)
        .iter()
        .copied()
        .filter(|field| field_value(config, *field).trim().is_empty())
        .collect()
}

fn field_value(config: &ConnectionConfig, field: ConfigField) -> &str {
    match field {
        ConfigField::Host => &config.host,
        ConfigField::User => &config.user,
        ConfigField::Database => &config.database,
        ConfigField::FilePath => &config.file_path,
        ConfigField::AccountId => &config.account_id,
        ConfigField::DatabaseId => &config.database_id,
        ConfigField::AuthToken => &config.auth_token,
    }
}

pub fn resolve(config: &ConnectionConfig) -> Result<DialTarget, WorkspaceError> {
    let missing = missing_fields(config);
    if !missing.is_empty() {
        return Err(WorkspaceError::MissingField {
            backend: config.backend,
            fields: missing,
        });
    }

    let dial_string = match config.backend {
        BackendKind::Postgres => postgres_url(config)?,
        BackendKind::MySql => mysql_url(config)?,
        BackendKind::Sqlite => config.file_path.trim().to_string(),
        BackendKind::CloudflareD1 => d1_url(config)?,
    };

    Ok(DialTarget {
        driver: config.backend,
        dial_string,
        connect_timeout: CONNECT_TIMEOUT,
        io_timeout: IO_TIMEOUT,
    })
}

fn network_base(scheme: &str, config: &ConnectionConfig) -> Result<Url, WorkspaceError> {
    let host = config.host.trim();
    let port = config.effective_port().unwrap_or_default();
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let mut url = Url::parse(&format!("{scheme}://{authority}"))
        .map_err(|err| invalid_address(config, &err))?;
    url.set_username(config.user.trim())
        .map_err(|()| invalid_address(config, &"user cannot be encoded"))?;
    if !config.password.is_empty() {
        url.set_password(Some(&config.password))
            .map_err(|()| invalid_address(config, &"password cannot be encoded"))?;
    }
    url.set_path(config.database.trim());
    Ok(url)
}

fn invalid_address(config: &ConnectionConfig, reason: &dyn fmt::Display) -> WorkspaceError {
    WorkspaceError::unreachable(
        format!("invalid address `{}`: {reason}", config.host.trim()),
        config,
    )
}

fn postgres_url(config: &ConnectionConfig) -> Result<String, WorkspaceError> {
    let mut url = network_base("postgres", config)?;
    let ssl_mode = match config.ssl_mode.trim() {
        "" => DEFAULT_SSL_MODE,
        other => other,
    };
    url.query_pairs_mut()
        .append_pair("sslmode", ssl_mode)
        .append_pair("connect_timeout", &CONNECT_TIMEOUT.as_secs().to_string());
    Ok(url.to_string())
}

fn mysql_url(config: &ConnectionConfig) -> Result<String, WorkspaceError> {
    let mut url = network_base("mysql", config)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("pool_min", "0")
            .append_pair("pool_max", &POOL_MAX_OPEN.to_string())
            .append_pair(
                "inactive_connection_ttl",
                &POOL_MAX_LIFETIME.as_secs().to_string(),
            )
            .append_pair("prefer_socket", "false");
        if requires_tls(&config.ssl_mode) {
            query.append_pair("require_ssl", "true");
        }
    }
    Ok(url.to_string())
}

fn requires_tls(ssl_mode: &str) -> bool {
    !matches!(
        ssl_mode.trim().to_ascii_lowercase().as_str(),
        "" | "disable" | "disabled" | "false" | "prefer" | "preferred"
    )
}

fn d1_url(config: &ConnectionConfig) -> Result<String, WorkspaceError> {
    let mut url = Url::parse(D1_API_BASE)
        .map_err(|err| WorkspaceError::unreachable(err.to_string(), config))?;
    url.path_segments_mut()
        .map_err(|()| WorkspaceError::unreachable("invalid D1 endpoint", config))?
        .extend([
            "accounts",
            config.account_id.trim(),
            "d1",
            "database",
            config.database_id.trim(),
            "query",
        ]);
    url.query_pairs_mut()
        .append_pair("token", config.auth_token.trim());
    Ok(url.to_string())
}
