use chrono::Utc;
use dbterm_core::format::{format_duration, format_time_ago};
use dbterm_core::query_runner::CellValue;
use dbterm_core::schema::NO_TABLES_MARKER;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};
use ratatui::Frame;

use crate::{Pane, TuiApp, RESULT_COLUMN_WIDTH};

/// Colors for every widget, owned by the app rather than kept global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Theme {
    pub accent: Style,
    pub border: Style,
    pub focused_border: Style,
    pub selected: Style,
    pub header: Style,
    pub null: Style,
    pub muted: Style,
    pub error: Style,
    pub online: Style,
    pub offline: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            accent: Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
            border: Style::default().fg(Color::DarkGray),
            focused_border: Style::default().fg(Color::Cyan),
            selected: Style::default().fg(Color::Black).bg(Color::Cyan),
            header: Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
            null: Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
            muted: Style::default().fg(Color::Gray),
            error: Style::default().fg(Color::Red),
            online: Style::default().fg(Color::Green),
            offline: Style::default().fg(Color::Red),
        }
    }
}

const KEY_HINTS: &str =
    "Tab pane | Enter open/run/row | s sort | F5 refresh | +/-/0 limit | e/E export | y save row | ? help | q quit";

pub(crate) fn render(frame: &mut Frame<'_>, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, app, chunks[0]);
    match app.pane {
        Pane::Dashboard => render_dashboard(frame, app, chunks[1]),
        Pane::Tables => render_tables(frame, app, chunks[1]),
        Pane::Results => render_results(frame, app, chunks[1]),
        Pane::QueryEditor => render_editor(frame, app, chunks[1]),
    }
    render_footer(frame, app, chunks[2]);

    if app.row_detail.is_some() {
        render_row_detail(frame, app);
    }
    if app.form.is_some() {
        render_form(frame, app);
    }
    if app.show_help {
        render_help_popup(frame, app);
    }
}

fn pane_block<'a>(app: &TuiApp, title: impl Into<Line<'a>>) -> Block<'a> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(app.theme.focused_border)
        .title(title)
}

fn render_header(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let status = app.workspace.connection_status();
    let connection = match (&status.connection_name, status.backend) {
        (Some(name), Some(backend)) if status.is_connected => format!("{name} [{backend}]"),
        _ => "not connected".to_string(),
    };
    let latency = status
        .last_latency
        .map_or_else(|| "-".to_string(), format_duration);

    let header = Paragraph::new(Line::from(vec![
        Span::styled(format!(" {} ", app.pane.title()), app.theme.accent),
        Span::raw(" | "),
        Span::raw(connection),
        Span::raw(" | "),
        Span::raw(format!("latency: {latency}")),
        Span::raw(" | "),
        Span::raw(app.workspace.limit_status()),
        Span::raw(" | "),
        Span::raw(app.workspace.sort_status()),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(app.theme.border)
            .title("dbterm"),
    );
    frame.render_widget(header, area);
}

fn render_dashboard(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let now = Utc::now();
    let mut lines = Vec::new();
    for (index, config) in app.store.connections().iter().enumerate() {
        let (badge, badge_style) = match app.workspace.reachability(index) {
            Some(true) => ("online ", app.theme.online),
            Some(false) => ("offline", app.theme.offline),
            None => ("...    ", app.theme.muted),
        };
        let marker = if index == app.connection_index { ">" } else { " " };
        let used = config
            .last_used
            .map(|at| format_time_ago(at, now))
            .unwrap_or_default();
        let mut label = Span::raw(config.display_label());
        if index == app.connection_index {
            label = label.style(app.theme.selected);
        }
        lines.push(Line::from(vec![
            Span::raw(format!("{marker} ")),
            Span::styled(badge, badge_style),
            Span::raw(" "),
            label,
            Span::styled(format!("  {used}"), app.theme.muted),
        ]));
    }
    if lines.is_empty() {
        lines.push(Line::from("No saved connections. Press n to add one."));
    }

    let body = Paragraph::new(lines).block(pane_block(app, "Saved connections"));
    frame.render_widget(body, area);
}

fn render_tables(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let tables = app.workspace.tables();
    let visible = usize::from(area.height.saturating_sub(2)).max(1);
    let first = app.table_index.saturating_sub(visible.saturating_sub(1));

    let mut lines: Vec<Line<'_>> = tables
        .iter()
        .enumerate()
        .skip(first)
        .take(visible)
        .map(|(index, table)| {
            let open = app.workspace.selected_table() == Some(table.as_str());
            let marker = if open { "*" } else { " " };
            let line = format!("{marker} {table}");
            if index == app.table_index {
                Line::from(Span::styled(line, app.theme.selected))
            } else {
                Line::from(line)
            }
        })
        .collect();
    if lines.is_empty() {
        lines.push(Line::from(Span::styled(NO_TABLES_MARKER, app.theme.muted)));
    }

    let title = format!("Tables ({})", tables.len());
    frame.render_widget(Paragraph::new(lines).block(pane_block(app, title)), area);
}

fn render_results(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let Some(view) = app.workspace.view() else {
        let body = Paragraph::new("Open a table or run a query to see rows.")
            .block(pane_block(app, "Results"));
        frame.render_widget(body, area);
        return;
    };

    let (row_offset, column_offset) = view.offsets();
    let selection = view.selection();
    let visible_columns = usize::from((area.width.saturating_sub(2) / RESULT_COLUMN_WIDTH).max(1));
    let visible_rows = usize::from(area.height.saturating_sub(3)).max(1);
    let columns: Vec<usize> = (column_offset..view.grid().column_count())
        .take(visible_columns)
        .collect();

    let header = Row::new(columns.iter().map(|column| {
        let name = view.grid().columns()[*column].clone();
        Cell::from(name).style(app.theme.header)
    }));

    let rows = view
        .rows()
        .enumerate()
        .skip(row_offset)
        .take(visible_rows)
        .map(|(row_index, cells)| {
            Row::new(columns.iter().map(|column| {
                let Some(cell) = cells.get(*column) else {
                    return Cell::from("");
                };
                let style = if row_index == selection.row && *column == selection.column {
                    app.theme.selected
                } else if matches!(cell.value(), CellValue::Null) {
                    app.theme.null
                } else {
                    Style::default()
                };
                Cell::from(cell.display().to_string()).style(style)
            }))
        });

    let widths = vec![Constraint::Length(RESULT_COLUMN_WIDTH.saturating_sub(1)); columns.len()];
    let truncated = if view.grid().is_truncated() {
        " (more rows available)"
    } else {
        ""
    };
    let title = match app.workspace.selected_table() {
        Some(table) => format!("{table}: {} rows{truncated}", view.row_count()),
        None => format!("Query: {} rows{truncated}", view.row_count()),
    };
    let table = Table::new(rows, widths)
        .header(header)
        .block(pane_block(app, title));
    frame.render_widget(table, area);
}

fn render_editor(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let mut lines: Vec<Line<'_>> = app.editor.lines().map(Line::from).collect();
    if lines.is_empty() {
        lines.push(Line::from(""));
    }
    if let Some(last) = lines.last_mut() {
        last.push_span(Span::styled("_", app.theme.accent));
    }

    if let Some(failure) = app.workspace.last_failure() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            failure.error.to_string(),
            app.theme.error,
        )));
        lines.push(Line::from(Span::styled(
            format!("in: {}", failure.sql),
            app.theme.muted,
        )));
    }

    let body = Paragraph::new(lines)
        .block(pane_block(app, "SQL (Enter to run)"))
        .alignment(Alignment::Left);
    frame.render_widget(body, area);
}

fn render_footer(frame: &mut Frame<'_>, app: &TuiApp, area: Rect) {
    let status = match &app.flash {
        Some(flash) => {
            let style = if flash.is_error {
                app.theme.error
            } else {
                Style::default()
            };
            Line::from(Span::styled(flash.message.clone(), style))
        }
        None => {
            let status = app.workspace.status();
            let style = if status.is_error {
                app.theme.error
            } else {
                Style::default()
            };
            let mut spans = vec![Span::styled(status.message.clone(), style)];
            if let Some(hint) = &status.hint {
                spans.push(Span::styled(format!("  {hint}"), app.theme.muted));
            }
            Line::from(spans)
        }
    };

    let footer = Paragraph::new(status).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(app.theme.border)
            .title(KEY_HINTS),
    );
    frame.render_widget(footer, area);
}

fn render_form(frame: &mut Frame<'_>, app: &TuiApp) {
    let Some(form) = &app.form else {
        return;
    };
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);

    let mut lines = vec![
        Line::from("Tab/arrows: field | Left/Right on Type: change backend"),
        Line::from("Enter: save and connect | Esc: cancel"),
        Line::from(""),
    ];
    for field in form.fields() {
        let marker = if *field == form.active_field() { ">" } else { " " };
        let value = form.value(*field);
        let shown = if field.is_secret() {
            "*".repeat(value.chars().count())
        } else {
            value.to_string()
        };
        let line = format!("{marker} {:<18} {shown}", field.label());
        if *field == form.active_field() {
            lines.push(Line::from(Span::styled(line, app.theme.accent)));
        } else {
            lines.push(Line::from(line));
        }
    }

    let popup = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(app.theme.focused_border)
            .title(format!("New {} connection", form.backend())),
    );
    frame.render_widget(popup, area);
}

fn render_row_detail(frame: &mut Frame<'_>, app: &TuiApp) {
    let Some(detail) = &app.row_detail else {
        return;
    };
    let area = centered_rect(80, 70, frame.area());
    frame.render_widget(Clear, area);

    let width = detail
        .fields
        .iter()
        .map(|(column, _)| column.chars().count())
        .max()
        .unwrap_or(0);
    let lines: Vec<Line<'_>> = detail
        .fields
        .iter()
        .skip(detail.scroll)
        .map(|(column, value)| {
            let value = match value {
                Some(value) => Span::raw(value.as_str()),
                None => Span::styled("NULL", app.theme.null),
            };
            Line::from(vec![
                Span::styled(format!("{column:<width$}  "), app.theme.header),
                value,
            ])
        })
        .collect();

    let popup = Paragraph::new(lines).wrap(Wrap { trim: false }).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(app.theme.focused_border)
            .title(format!("Row {} | y save as JSON | Esc close", detail.row + 1)),
    );
    frame.render_widget(popup, area);
}

fn render_help_popup(frame: &mut Frame<'_>, app: &TuiApp) {
    let area = centered_rect(70, 70, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Global keymap"),
        Line::from("q: quit (Ctrl+C anywhere)"),
        Line::from("?: toggle help"),
        Line::from("Tab: cycle panes, Esc: back to connections"),
        Line::from("Enter: connect / open table / run SQL / show row"),
        Line::from("Arrows or hjkl: move, PgUp/PgDn: page"),
        Line::from("s: sort by the selected column"),
        Line::from("F5: refresh the current grid"),
        Line::from("+ / -: preview limit step, 0: toggle unlimited"),
        Line::from("e: export grid to CSV, E: export grid to JSON"),
        Line::from("y: save the selected row as JSON"),
        Line::from("r: probe saved connections, p: health check"),
        Line::from("n: new connection, d: delete connection"),
    ])
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(app.theme.focused_border)
            .title("Help"),
    );
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}
