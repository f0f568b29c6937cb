use std::time::Duration;

use tracing::debug;

use crate::errors::{classify_query_error, WorkspaceError};
use crate::profiles::BackendKind;
use crate::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream, Session};
use crate::results::display_text;

/// Shown in the table list when a database has no user tables.
pub const NO_TABLES_MARKER: &str = "(no tables)";

#[must_use]
pub fn list_tables_sql(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Postgres => {
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' ORDER BY table_name"
        }
        BackendKind::MySql => {
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME"
        }
        BackendKind::Sqlite => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        BackendKind::CloudflareD1 => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             AND name NOT LIKE '\\_cf\\_%' ESCAPE '\\' ORDER BY name"
        }
    }
}

/// Lists user tables on the session's backend, unquoted, in catalog order.
pub async fn list_tables<B: QueryBackend>(
    session: &Session<B>,
    timeout: Duration,
) -> Result<Vec<String>, WorkspaceError> {
    let _statement = session.acquire().await;
    let sql = list_tables_sql(session.backend());

    let listing = async {
        let mut stream = session.handle().start_query(sql).await?;
        let mut names = Vec::new();
        while let Some(row) = stream.next_row().await? {
            if let Some(name) = row.into_iter().next().and_then(table_name) {
                names.push(name);
            }
        }
        Ok::<_, QueryBackendError>(names)
    };

    let names = match tokio::time::timeout(timeout, listing).await {
        Ok(Ok(names)) => names,
        Ok(Err(err)) => return Err(classify_query_error(err.message())),
        Err(_) => return Err(WorkspaceError::timeout("table listing", timeout)),
    };
    debug!(backend = %session.backend(), tables = names.len(), "tables listed");
    Ok(names)
}

fn table_name(value: CellValue) -> Option<String> {
    match value {
        CellValue::Null => None,
        CellValue::Text(name) => Some(name),
        CellValue::Binary(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        other => Some(display_text(&other, usize::MAX)),
    }
}
