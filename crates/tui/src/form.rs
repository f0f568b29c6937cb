use std::collections::HashMap;

use dbterm_core::dsn::{merge_into, parse_connection_string, DsnError};
use dbterm_core::profiles::{BackendKind, ConfigField, ConnectionConfig};
use dbterm_core::resolver::missing_fields;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("a connection name is required")]
    NameRequired,
    #[error("could not parse connection string: {0}")]
    Dsn(#[from] DsnError),
    #[error("invalid port `{0}`")]
    Port(String),
    #[error("missing required fields: {}", join_fields(.0))]
    Missing(Vec<ConfigField>),
}

fn join_fields(fields: &[ConfigField]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FormField {
    Name,
    Kind,
    Dsn,
    Host,
    Port,
    User,
    Password,
    Database,
    SslMode,
    FilePath,
    AccountId,
    DatabaseId,
    AuthToken,
}

impl FormField {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::Kind => "Type",
            Self::Dsn => "Connection string",
            Self::Host => "Host",
            Self::Port => "Port",
            Self::User => "User",
            Self::Password => "Password",
            Self::Database => "Database",
            Self::SslMode => "SSL mode",
            Self::FilePath => "File path",
            Self::AccountId => "Account ID",
            Self::DatabaseId => "Database ID",
            Self::AuthToken => "API token",
        }
    }

    pub(crate) fn is_secret(self) -> bool {
        matches!(self, Self::Password | Self::AuthToken)
    }
}

const NETWORK_FIELDS: [FormField; 9] = [
    FormField::Name,
    FormField::Kind,
    FormField::Dsn,
    FormField::Host,
    FormField::Port,
    FormField::User,
    FormField::Password,
    FormField::Database,
    FormField::SslMode,
];
const SQLITE_FIELDS: [FormField; 3] = [FormField::Name, FormField::Kind, FormField::FilePath];
const D1_FIELDS: [FormField; 5] = [
    FormField::Name,
    FormField::Kind,
    FormField::AccountId,
    FormField::DatabaseId,
    FormField::AuthToken,
];

/// The new-connection editor. Values survive switching the backend type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectionForm {
    backend: BackendKind,
    values: HashMap<FormField, String>,
    active: usize,
}

impl Default for ConnectionForm {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(FormField::Host, "localhost".to_string());
        Self {
            backend: BackendKind::Postgres,
            values,
            active: 0,
        }
    }
}

impl ConnectionForm {
    pub(crate) fn backend(&self) -> BackendKind {
        self.backend
    }

    pub(crate) fn fields(&self) -> &'static [FormField] {
        match self.backend {
            BackendKind::Postgres | BackendKind::MySql => &NETWORK_FIELDS,
            BackendKind::Sqlite => &SQLITE_FIELDS,
            BackendKind::CloudflareD1 => &D1_FIELDS,
        }
    }

    pub(crate) fn active_field(&self) -> FormField {
        self.fields()[self.active.min(self.fields().len() - 1)]
    }

    pub(crate) fn value(&self, field: FormField) -> &str {
        if field == FormField::Kind {
            return self.backend.label();
        }
        self.values.get(&field).map_or("", String::as_str)
    }

    pub(crate) fn next_field(&mut self) {
        self.active = (self.active + 1) % self.fields().len();
    }

    pub(crate) fn previous_field(&mut self) {
        let len = self.fields().len();
        self.active = (self.active + len - 1) % len;
    }

    /// Steps the backend type; only meaningful on the type field.
    pub(crate) fn cycle_backend(&mut self, forward: bool) {
        let all = BackendKind::ALL;
        let position = all
            .iter()
            .position(|kind| *kind == self.backend)
            .unwrap_or_default();
        let next = if forward {
            (position + 1) % all.len()
        } else {
            (position + all.len() - 1) % all.len()
        };
        self.backend = all[next];
        self.active = 1;
    }

    pub(crate) fn input(&mut self, ch: char) {
        match self.active_field() {
            FormField::Kind => self.cycle_backend(true),
            field => self.values.entry(field).or_default().push(ch),
        }
    }

    pub(crate) fn backspace(&mut self) {
        if let Some(value) = self.values.get_mut(&self.active_field()) {
            value.pop();
        }
    }

    /// Builds the config, applying a connection string first and then
    /// checking the fields the backend needs.
    pub(crate) fn to_config(&self) -> Result<ConnectionConfig, FormError> {
        let text = |field: FormField| self.value(field).trim().to_string();

        let name = text(FormField::Name);
        if name.is_empty() {
            return Err(FormError::NameRequired);
        }

        let mut config = ConnectionConfig {
            name,
            backend: self.backend,
            ..ConnectionConfig::default()
        };
        match self.backend {
            BackendKind::Postgres | BackendKind::MySql => {
                config.host = text(FormField::Host);
                config.user = text(FormField::User);
                config.password = self.value(FormField::Password).to_string();
                config.database = text(FormField::Database);
                config.ssl_mode = text(FormField::SslMode);
                let port = text(FormField::Port);
                if !port.is_empty() {
                    config.port = Some(port.parse().map_err(|_| FormError::Port(port))?);
                }
                let dsn = text(FormField::Dsn);
                if !dsn.is_empty() {
                    merge_into(&mut config, parse_connection_string(self.backend, &dsn)?);
                }
            }
            BackendKind::Sqlite => config.file_path = text(FormField::FilePath),
            BackendKind::CloudflareD1 => {
                config.account_id = text(FormField::AccountId);
                config.database_id = text(FormField::DatabaseId);
                config.auth_token = text(FormField::AuthToken);
            }
        }

        let missing = missing_fields(&config);
        if missing.is_empty() {
            Ok(config)
        } else {
            Err(FormError::Missing(missing))
        }
    }
}
