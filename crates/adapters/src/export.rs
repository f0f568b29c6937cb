//! Writes result rows to CSV or JSON using the untruncated cell values.

use std::fs;
use std::path::Path;

use dbterm_core::query_runner::CellValue;
use dbterm_core::results::Cell;
use dbterm_core::view_state::ResultViewState;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nothing selected to export")]
    NoSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

/// Every row of the view, in its current sort order.
pub fn export_view(
    path: &Path,
    view: &ResultViewState,
    format: ExportFormat,
) -> Result<usize, ExportError> {
    let rows: Vec<&[Cell]> = view.rows().collect();
    write_rows(path, view.grid().columns(), &rows, format)
}

pub fn export_selected_row(
    path: &Path,
    view: &ResultViewState,
    format: ExportFormat,
) -> Result<usize, ExportError> {
    let row = view.selected_row().ok_or(ExportError::NoSelection)?;
    write_rows(path, view.grid().columns(), &[row], format)
}

pub fn write_rows(
    path: &Path,
    headers: &[String],
    rows: &[&[Cell]],
    format: ExportFormat,
) -> Result<usize, ExportError> {
    let payload = match format {
        ExportFormat::Csv => render_csv(headers, rows),
        ExportFormat::Json => render_json(headers, rows)?,
    };
    fs::write(path, payload).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(rows.len())
}

#[must_use]
pub fn render_csv(headers: &[String], rows: &[&[Cell]]) -> String {
    let mut content = String::new();
    content.push_str(
        &headers
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in rows {
        let values = (0..headers.len())
            .map(|column_index| {
                row.get(column_index)
                    .and_then(Cell::export_text)
                    .map(|value| csv_escape(&value))
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        content.push_str(&values.join(","));
        content.push('\n');
    }
    content
}

pub fn render_json(headers: &[String], rows: &[&[Cell]]) -> Result<String, ExportError> {
    let records = rows
        .iter()
        .map(|row| {
            let object = headers
                .iter()
                .enumerate()
                .map(|(column_index, header)| {
                    let value = row.get(column_index).map_or(Value::Null, json_value);
                    (header.clone(), value)
                })
                .collect::<Map<_, _>>();
            Value::Object(object)
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_string_pretty(&records)?)
}

fn json_value(cell: &Cell) -> Value {
    match cell.value() {
        CellValue::Null => Value::Null,
        CellValue::Bool(value) => Value::Bool(*value),
        CellValue::Int(value) => Value::Number((*value).into()),
        CellValue::Float(value) => Number::from_f64(*value).map_or(Value::Null, Value::Number),
        CellValue::Text(_) | CellValue::Binary(_) => {
            cell.export_text().map_or(Value::Null, Value::String)
        }
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use dbterm_core::query_runner::CellValue;
    use dbterm_core::results::ResultGrid;
    use dbterm_core::view_state::ResultViewState;
    use tempfile::TempDir;

    use super::{export_selected_row, export_view, ExportError, ExportFormat};

    fn view() -> ResultViewState {
        ResultViewState::new(ResultGrid::from_values(
            vec!["id".to_string(), "note".to_string()],
            vec![
                vec![CellValue::Int(2), CellValue::Text("quote \"name\"".to_string())],
                vec![CellValue::Int(1), CellValue::Null],
                vec![CellValue::Int(3), CellValue::Text("x".repeat(250))],
            ],
        ))
    }

    #[test]
    fn csv_uses_view_order_and_full_values() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.csv");
        let mut view = view();
        view.toggle_sort(0);

        let written = export_view(&path, &view, ExportFormat::Csv).expect("csv export failed");
        assert_eq!(written, 3);
        let output = fs::read_to_string(path).expect("failed to read csv output");
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "id,note");
        assert_eq!(lines[1], "1,");
        assert_eq!(lines[2], "2,\"quote \"\"name\"\"\"");
        assert_eq!(lines[3], format!("3,{}", "x".repeat(250)));
    }

    #[test]
    fn json_keeps_value_types() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("result.json");

        let written = export_view(&path, &view(), ExportFormat::Json).expect("json export failed");
        assert_eq!(written, 3);
        let output = fs::read_to_string(path).expect("failed to read json output");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(parsed[0]["id"], 2);
        assert_eq!(parsed[1]["note"], serde_json::Value::Null);
        assert_eq!(
            parsed[2]["note"].as_str().map(str::len),
            Some(250)
        );
    }

    #[test]
    fn selected_row_export_writes_one_record() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("row.json");
        let mut view = view();
        view.move_down(1);

        let written =
            export_selected_row(&path, &view, ExportFormat::Json).expect("row export failed");
        assert_eq!(written, 1);
        let output = fs::read_to_string(path).expect("failed to read json output");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(parsed[0]["id"], 1);
    }

    #[test]
    fn empty_view_has_no_selected_row() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let empty = ResultViewState::default();
        let err = export_selected_row(&temp_dir.path().join("x.csv"), &empty, ExportFormat::Csv)
            .expect_err("nothing to export");
        assert!(matches!(err, ExportError::NoSelection));
    }
}
