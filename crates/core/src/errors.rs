use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::format::format_duration;
use crate::profiles::{BackendKind, ConfigField, ConnectionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingField,
    Unsupported,
    Unreachable,
    Timeout,
    Syntax,
    Permission,
    Duplicate,
    ConnectionLost,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MissingField => "missing field",
            Self::Unsupported => "unsupported",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Syntax => "syntax",
            Self::Permission => "permission",
            Self::Duplicate => "duplicate",
            Self::ConnectionLost => "connection lost",
            Self::Unknown => "error",
        };
        f.write_str(label)
    }
}

/// Every failure the workspace reports to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("{backend} connection is missing: {}", join_fields(.fields))]
    MissingField {
        backend: BackendKind,
        fields: Vec<ConfigField>,
    },
    #[error("unsupported backend: {0}")]
    Unsupported(String),
    #[error("{message}")]
    Unreachable { message: String, hint: String },
    #[error("{operation} timed out after {}", format_duration(*.after))]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("{message}")]
    Syntax { message: String },
    #[error("{message}")]
    Permission { message: String },
    #[error("{message}")]
    Duplicate { message: String },
    #[error("{message}")]
    ConnectionLost { message: String },
    #[error("{message}")]
    Unknown {
        message: String,
        hint: Option<&'static str>,
    },
}

impl WorkspaceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField { .. } => ErrorKind::MissingField,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::MissingField { .. } => Some("Fill in the highlighted fields."),
            Self::Unsupported(_) => None,
            Self::Unreachable { hint, .. } => Some(hint.as_str()),
            Self::Timeout { .. } => Some("The server did not answer in time. Check if it is reachable."),
            Self::Syntax { .. } => Some("Check your SQL syntax."),
            Self::Permission { .. } => {
                Some("Your user may not have sufficient privileges for this operation.")
            }
            Self::Duplicate { .. } => Some("A record with this key already exists."),
            Self::ConnectionLost { .. } => {
                Some("Connection issue. Reconnect from the dashboard.")
            }
            Self::Unknown { hint, .. } => *hint,
        }
    }

    #[must_use]
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// A failed connect/ping, kept verbatim and paired with a hint.
    #[must_use]
    pub fn unreachable(message: impl Into<String>, config: &ConnectionConfig) -> Self {
        let message = message.into();
        let hint = connection_hint(&message, config);
        Self::Unreachable { message, hint }
    }
}

fn join_fields(fields: &[ConfigField]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a driver error message from a failed statement onto the taxonomy.
#[must_use]
pub fn classify_query_error(message: impl Into<String>) -> WorkspaceError {
    let message = message.into();
    let lowered = message.to_lowercase();

    if lowered.contains("does not exist") || lowered.contains("no such table") {
        WorkspaceError::Unknown {
            message,
            hint: Some("Check table name spelling in the table list."),
        }
    } else if lowered.contains("syntax error") || lowered.contains("near") {
        WorkspaceError::Syntax { message }
    } else if lowered.contains("permission denied") || lowered.contains("access denied") {
        WorkspaceError::Permission { message }
    } else if lowered.contains("duplicate") || lowered.contains("unique constraint") {
        WorkspaceError::Duplicate { message }
    } else if lowered.contains("connection") || lowered.contains("refused") {
        WorkspaceError::ConnectionLost { message }
    } else {
        WorkspaceError::Unknown {
            message,
            hint: None,
        }
    }
}

#[must_use]
pub fn connection_hint(message: &str, config: &ConnectionConfig) -> String {
    let lowered = message.to_lowercase();

    if lowered.contains("connection refused") {
        let port = config
            .effective_port()
            .map(|port| port.to_string())
            .unwrap_or_default();
        format!("Is {} running on {}:{}?", config.backend, config.host, port)
    } else if lowered.contains("no such host")
        || lowered.contains("lookup")
        || lowered.contains("failed to lookup address")
    {
        format!("Could not resolve hostname \"{}\". Check spelling.", config.host)
    } else if lowered.contains("password") || lowered.contains("authentication") {
        "Check your username and password.".to_string()
    } else if lowered.contains("does not exist") || lowered.contains("unknown database") {
        format!("Database \"{}\" not found. Check the name.", config.database)
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        "Connection timed out. Check if the server is reachable.".to_string()
    } else if lowered.contains("no such file") || lowered.contains("unable to open") {
        format!("SQLite file not found: {}", config.file_path)
    } else if lowered.contains("permission") {
        "Permission denied. Check file/user permissions.".to_string()
    } else {
        "Double-check your connection details.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{classify_query_error, connection_hint, ErrorKind, WorkspaceError};
    use crate::profiles::{BackendKind, ConfigField, ConnectionConfig};

    #[test]
    fn query_errors_are_classified_by_message() {
        let cases = [
            ("relation \"userz\" does not exist", ErrorKind::Unknown),
            ("no such table: userz", ErrorKind::Unknown),
            ("syntax error at or near \"FORM\"", ErrorKind::Syntax),
            ("permission denied for table users", ErrorKind::Permission),
            ("Access denied for user 'app'@'%'", ErrorKind::Permission),
            ("Duplicate entry '1' for key 'PRIMARY'", ErrorKind::Duplicate),
            ("UNIQUE constraint failed: users.id", ErrorKind::Duplicate),
            ("connection reset by peer", ErrorKind::ConnectionLost),
            ("division by zero", ErrorKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(classify_query_error(message).kind(), expected, "{message}");
        }
    }

    #[test]
    fn missing_table_carries_a_lookup_hint() {
        let err = classify_query_error("no such table: userz");
        assert!(err.hint().is_some_and(|hint| hint.contains("table name")));
        assert!(classify_query_error("division by zero").hint().is_none());
    }

    #[test]
    fn missing_field_message_lists_fields_in_order() {
        let err = WorkspaceError::MissingField {
            backend: BackendKind::Postgres,
            fields: vec![ConfigField::Host, ConfigField::Database],
        };
        assert_eq!(
            err.to_string(),
            "PostgreSQL connection is missing: host, database"
        );
    }

    #[test]
    fn timeout_message_names_operation_and_duration() {
        let err = WorkspaceError::timeout("query", Duration::from_secs(30));
        assert_eq!(err.to_string(), "query timed out after 30.00s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn connection_hints_follow_error_text() {
        let config =
            ConnectionConfig::network("local", BackendKind::MySql, "db.internal", "app", "shop");

        assert_eq!(
            connection_hint("dial tcp: connection refused", &config),
            "Is MySQL running on db.internal:3306?"
        );
        assert_eq!(
            connection_hint("Unknown database 'shop'", &config),
            "Database \"shop\" not found. Check the name."
        );
        assert_eq!(
            connection_hint("something odd", &config),
            "Double-check your connection details."
        );

        let sqlite = ConnectionConfig::sqlite("notes", "/missing/notes.db");
        assert_eq!(
            connection_hint("unable to open database file", &sqlite),
            "SQLite file not found: /missing/notes.db"
        );
    }

    #[test]
    fn unreachable_keeps_message_verbatim() {
        let config = ConnectionConfig::sqlite("notes", "/missing/notes.db");
        let err = WorkspaceError::unreachable("unable to open database file", &config);
        assert_eq!(err.to_string(), "unable to open database file");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(err.hint().is_some());
    }
}
