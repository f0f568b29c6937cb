use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::format::{truncate_runes, ELLIPSIS};
use crate::query_runner::{CellValue, QueryBackendError, RowStream};

pub const CELL_PREVIEW_RUNES: usize = 100;
pub const BINARY_PREVIEW_LEN: usize = 100;

pub const NO_ROWS_MARKER: &str = "No rows returned";
pub const NO_COLUMNS_MARKER: &str = "No columns returned";

/// Rows materialized per table browse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewLimit {
    Rows(usize),
    Unlimited,
}

impl PreviewLimit {
    pub const STEPS: [usize; 7] = [25, 50, 100, 250, 500, 1000, 5000];
    pub const DEFAULT: Self = Self::Rows(100);

    /// `0` reads as unlimited; anything else is raised to the smallest step.
    #[must_use]
    pub fn from_setting(rows: usize) -> Self {
        if rows == 0 {
            Self::Unlimited
        } else {
            Self::Rows(rows.max(Self::STEPS[0]))
        }
    }

    #[must_use]
    pub fn rows(self) -> Option<usize> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Unlimited => None,
        }
    }

    #[must_use]
    pub fn increased(self) -> Self {
        match self {
            Self::Unlimited => Self::Unlimited,
            Self::Rows(current) => Self::STEPS
                .iter()
                .copied()
                .find(|step| *step > current)
                .map_or(Self::Unlimited, Self::Rows),
        }
    }

    #[must_use]
    pub fn decreased(self) -> Self {
        match self {
            Self::Unlimited => Self::Rows(Self::STEPS[Self::STEPS.len() - 1]),
            Self::Rows(current) => Self::Rows(
                Self::STEPS
                    .iter()
                    .copied()
                    .take_while(|step| *step < current)
                    .last()
                    .unwrap_or(Self::STEPS[0]),
            ),
        }
    }

    #[must_use]
    pub fn toggled_unlimited(self) -> Self {
        match self {
            Self::Unlimited => Self::DEFAULT,
            Self::Rows(_) => Self::Unlimited,
        }
    }
}

impl Default for PreviewLimit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PreviewLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows(rows) => write!(f, "{rows} rows"),
            Self::Unlimited => f.write_str("all rows"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Null,
    Text,
    Boolean,
    Integer,
    Float,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    value: CellValue,
    display: String,
}

impl Cell {
    #[must_use]
    pub fn new(value: CellValue, preview_runes: usize) -> Self {
        let display = display_text(&value, preview_runes);
        Self { value, display }
    }

    #[must_use]
    pub fn value(&self) -> &CellValue {
        &self.value
    }

    #[must_use]
    pub fn display(&self) -> &str {
        &self.display
    }

    #[must_use]
    pub fn kind(&self) -> CellKind {
        match self.value {
            CellValue::Null => CellKind::Null,
            CellValue::Text(_) => CellKind::Text,
            CellValue::Bool(_) => CellKind::Boolean,
            CellValue::Int(_) => CellKind::Integer,
            CellValue::Float(_) => CellKind::Float,
            CellValue::Binary(_) => CellKind::Binary,
        }
    }

    /// Full text of the value, as written by exports.
    #[must_use]
    pub fn export_text(&self) -> Option<String> {
        match &self.value {
            CellValue::Null => None,
            CellValue::Text(text) => Some(text.clone()),
            CellValue::Bool(value) => Some(value.to_string()),
            CellValue::Int(value) => Some(value.to_string()),
            CellValue::Float(value) => Some(value.to_string()),
            CellValue::Binary(bytes) => Some(match printable_utf8(bytes) {
                Some(text) => text.to_string(),
                None => hex(bytes),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridNotice {
    NoRows,
    NoColumns,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultGrid {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
    /// More rows existed beyond the preview limit.
    truncated: bool,
}

impl ResultGrid {
    /// Builds a grid from raw values; short rows are padded with NULL, long rows cut.
    #[must_use]
    pub fn from_values(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let mut grid = Self {
            columns,
            rows: Vec::with_capacity(rows.len()),
            truncated: false,
        };
        for row in rows {
            grid.push_row(row, CELL_PREVIEW_RUNES);
        }
        grid
    }

    fn push_row(&mut self, mut values: Vec<CellValue>, preview_runes: usize) {
        values.resize(self.columns.len(), CellValue::Null);
        self.rows.push(
            values
                .into_iter()
                .map(|value| Cell::new(value, preview_runes))
                .collect(),
        );
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row).and_then(|cells| cells.get(column))
    }

    #[must_use]
    pub fn notice(&self) -> Option<GridNotice> {
        if self.columns.is_empty() {
            Some(GridNotice::NoColumns)
        } else if self.rows.is_empty() {
            Some(GridNotice::NoRows)
        } else {
            None
        }
    }

    /// Ordered display texts of a row.
    #[must_use]
    pub fn row_signature(&self, row: usize) -> Option<Vec<String>> {
        self.rows
            .get(row)
            .map(|cells| cells.iter().map(|cell| cell.display.clone()).collect())
    }

    /// Display rows for rendering; an empty grid yields one marker row.
    #[must_use]
    pub fn renderable_rows(&self) -> Vec<Vec<&str>> {
        let marker = match self.notice() {
            Some(GridNotice::NoColumns) => NO_COLUMNS_MARKER,
            Some(GridNotice::NoRows) => NO_ROWS_MARKER,
            None => {
                return self
                    .rows
                    .iter()
                    .map(|cells| cells.iter().map(Cell::display).collect())
                    .collect()
            }
        };

        let mut row = vec![""; self.columns.len().max(1)];
        row[0] = marker;
        vec![row]
    }
}

#[derive(Debug, Error)]
#[error("result stream failed after {rows_materialized} rows: {source}")]
pub struct MaterializeError {
    pub rows_materialized: usize,
    #[source]
    pub source: QueryBackendError,
}

/// Converts a row stream into a bounded [`ResultGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Materializer {
    cell_preview_runes: usize,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new(CELL_PREVIEW_RUNES)
    }
}

impl Materializer {
    #[must_use]
    pub fn new(cell_preview_runes: usize) -> Self {
        Self {
            cell_preview_runes: cell_preview_runes.max(ELLIPSIS.len() + 1),
        }
    }

    pub async fn build<S: RowStream + ?Sized>(
        &self,
        stream: &mut S,
        limit: PreviewLimit,
    ) -> Result<ResultGrid, MaterializeError> {
        let columns = stream.columns().await.map_err(|source| MaterializeError {
            rows_materialized: 0,
            source,
        })?;
        let mut grid = ResultGrid {
            columns,
            rows: Vec::new(),
            truncated: false,
        };

        loop {
            let at_limit = limit.rows().is_some_and(|rows| grid.rows.len() >= rows);
            let next = stream.next_row().await.map_err(|source| MaterializeError {
                rows_materialized: grid.rows.len(),
                source,
            })?;
            let Some(values) = next else {
                break;
            };
            if at_limit {
                grid.truncated = true;
                if let Err(err) = stream.cancel().await {
                    debug!(error = %err, "cancelling truncated stream failed");
                }
                break;
            }
            grid.push_row(values, self.cell_preview_runes);
        }

        Ok(grid)
    }
}

pub async fn build<S: RowStream + ?Sized>(
    stream: &mut S,
    limit: PreviewLimit,
) -> Result<ResultGrid, MaterializeError> {
    Materializer::default().build(stream, limit).await
}

#[must_use]
pub fn display_text(value: &CellValue, preview_runes: usize) -> String {
    match value {
        CellValue::Null => "NULL".to_string(),
        CellValue::Text(text) => truncate_runes(text, preview_runes),
        CellValue::Bool(value) => value.to_string(),
        CellValue::Int(value) => value.to_string(),
        CellValue::Float(value) => format_float(*value),
        CellValue::Binary(bytes) => match printable_utf8(bytes) {
            Some(text) => truncate_runes(text, preview_runes),
            None => hex_preview(bytes, BINARY_PREVIEW_LEN),
        },
    }
}

fn printable_utf8(bytes: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(bytes).ok()?;
    text.chars()
        .all(|ch| !ch.is_control() || matches!(ch, '\n' | '\r' | '\t'))
        .then_some(text)
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write as _;

    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn hex_preview(bytes: &[u8], budget: usize) -> String {
    let full_len = 2 + bytes.len() * 2;
    if full_len <= budget {
        return hex(bytes);
    }
    let shown = budget.saturating_sub(2 + ELLIPSIS.len()) / 2;
    let mut out = hex(&bytes[..shown.min(bytes.len())]);
    out.push_str(ELLIPSIS);
    out
}

/// Four significant digits; exponent form outside `1e-4..1e4`, trailing zeros trimmed.
#[must_use]
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let scientific = format!("{value:.3e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };

    if !(-4..4).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        );
    }

    let decimals = usize::try_from(3 - exponent).unwrap_or(0);
    trim_fraction(&format!("{value:.decimals$}")).to_string()
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
