use thiserror::Error;
use url::Url;

use crate::profiles::{BackendKind, ConnectionConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DsnError {
    #[error("connection strings are supported for PostgreSQL and MySQL only")]
    UnsupportedBackend,
    #[error("invalid PostgreSQL URL: {0}")]
    PostgresUrl(String),
    #[error("invalid PostgreSQL DSN")]
    PostgresKeyValue,
    #[error("invalid MySQL DSN: {0}")]
    Mysql(String),
    #[error("invalid port `{0}`")]
    Port(String),
}

/// Parses a connection string into the network fields of a config.
///
/// Only host, port, user, password, database and SSL mode are filled in.
pub fn parse_connection_string(
    backend: BackendKind,
    raw: &str,
) -> Result<ConnectionConfig, DsnError> {
    match backend {
        BackendKind::Postgres => parse_postgres(raw),
        BackendKind::MySql => parse_mysql(raw),
        BackendKind::Sqlite | BackendKind::CloudflareD1 => Err(DsnError::UnsupportedBackend),
    }
}

/// Copies the non-empty parsed fields over `target`.
pub fn merge_into(target: &mut ConnectionConfig, parsed: ConnectionConfig) {
    let ConnectionConfig {
        host,
        port,
        user,
        password,
        database,
        ssl_mode,
        ..
    } = parsed;

    for (slot, value) in [
        (&mut target.host, host),
        (&mut target.user, user),
        (&mut target.password, password),
        (&mut target.database, database),
        (&mut target.ssl_mode, ssl_mode),
    ] {
        if !value.is_empty() {
            *slot = value;
        }
    }
    if port.is_some() {
        target.port = port;
    }
}

fn parse_postgres(raw: &str) -> Result<ConnectionConfig, DsnError> {
    let dsn = raw.trim();
    let lowered = dsn.to_ascii_lowercase();
    if lowered.starts_with("postgres://") || lowered.starts_with("postgresql://") {
        parse_postgres_url(dsn)
    } else {
        parse_postgres_key_value(dsn)
    }
}

fn parse_postgres_url(dsn: &str) -> Result<ConnectionConfig, DsnError> {
    let url = Url::parse(dsn).map_err(|err| DsnError::PostgresUrl(err.to_string()))?;
    let host = url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .filter(|host| !host.is_empty())
        .unwrap_or("localhost");

    let ssl_mode = url
        .query_pairs()
        .find(|(key, _)| key == "sslmode")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    Ok(ConnectionConfig {
        backend: BackendKind::Postgres,
        host: host.to_string(),
        port: Some(url.port().unwrap_or(5432)),
        user: percent_decode(url.username()),
        password: url.password().map(percent_decode).unwrap_or_default(),
        database: percent_decode(url.path().trim_start_matches('/')),
        ssl_mode,
        ..ConnectionConfig::default()
    })
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", value.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, decoded)| decoded.into_owned())
        .unwrap_or_default()
}

fn parse_postgres_key_value(dsn: &str) -> Result<ConnectionConfig, DsnError> {
    let mut config = ConnectionConfig {
        backend: BackendKind::Postgres,
        ..ConnectionConfig::default()
    };
    let mut port = None;
    let mut dbname = String::new();

    for token in split_tokens(dsn) {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "host" => config.host = value,
            "port" => port = Some(value),
            "user" => config.user = value,
            "password" => config.password = value,
            "dbname" => dbname = value,
            "database" => config.database = value,
            "sslmode" => config.ssl_mode = value,
            _ => {}
        }
    }
    if !dbname.is_empty() {
        config.database = dbname;
    }

    if config.host.is_empty()
        && config.user.is_empty()
        && config.password.is_empty()
        && config.database.is_empty()
    {
        return Err(DsnError::PostgresKeyValue);
    }

    if config.host.is_empty() {
        config.host = "localhost".to_string();
    }
    config.port = Some(match port.as_deref() {
        None | Some("") => 5432,
        Some(raw) => parse_port(raw)?,
    });
    Ok(config)
}

/// Splits on unquoted whitespace; quotes group, backslash escapes one character.
fn split_tokens(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in raw.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if let Some(open) = quote {
            if ch == open {
                quote = None;
            } else {
                current.push(ch);
            }
        } else if ch == '\'' || ch == '"' {
            quote = Some(ch);
        } else if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// `user[:password]@[tcp[(address)]]/dbname[?params]`
fn parse_mysql(raw: &str) -> Result<ConnectionConfig, DsnError> {
    let dsn = raw.trim();
    let (credentials, rest) = match dsn.rfind('@') {
        Some(at) => (&dsn[..at], &dsn[at + 1..]),
        None => ("", dsn),
    };
    let slash = rest
        .rfind('/')
        .ok_or_else(|| DsnError::Mysql("missing the slash separating the database name".into()))?;
    let (location, db_and_params) = (&rest[..slash], &rest[slash + 1..]);
    let database = db_and_params
        .split_once('?')
        .map_or(db_and_params, |(database, _)| database);

    let (user, password) = credentials
        .split_once(':')
        .unwrap_or((credentials, ""));

    let (net, address) = match location.split_once('(') {
        Some((net, address)) => {
            let address = address
                .strip_suffix(')')
                .ok_or_else(|| DsnError::Mysql("unclosed address parenthesis".into()))?;
            (net, address)
        }
        None => (location, ""),
    };

    let (host, port) = if net == "unix" {
        ("localhost".to_string(), 3306)
    } else {
        let (host, port) = split_host_port_with_default(address, "3306");
        (host, parse_port(&port)?)
    };

    Ok(ConnectionConfig {
        backend: BackendKind::MySql,
        host,
        port: Some(port),
        user: user.to_string(),
        password: password.to_string(),
        database: database.to_string(),
        ..ConnectionConfig::default()
    })
}

fn parse_port(raw: &str) -> Result<u16, DsnError> {
    raw.trim()
        .parse()
        .map_err(|_| DsnError::Port(raw.to_string()))
}

/// Splits `host:port`, `[v6]:port` or a bare host, filling blanks with defaults.
#[must_use]
pub fn split_host_port_with_default(address: &str, default_port: &str) -> (String, String) {
    let address = address.trim();
    if address.is_empty() {
        return ("localhost".to_string(), default_port.to_string());
    }

    let or_default = |host: &str, port: &str| {
        let host = if host.is_empty() { "localhost" } else { host };
        let port = if port.is_empty() { default_port } else { port };
        (host.to_string(), port.to_string())
    };

    if let Some(bracketed) = address.strip_prefix('[') {
        if let Some((host, tail)) = bracketed.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or("");
            return or_default(host, port.trim());
        }
    }

    if address.matches(':').count() == 1 {
        if let Some((host, port)) = address.split_once(':') {
            return or_default(host.trim(), port.trim());
        }
    }

    (address.to_string(), default_port.to_string())
}
