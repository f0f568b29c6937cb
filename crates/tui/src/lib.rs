//! Terminal front end: saved connections, table browser, result grid and SQL editor.

mod form;
mod render;

use std::io::{self, Stdout};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use dbterm_adapters::export::{export_selected_row, export_view, ExportFormat};
use dbterm_adapters::{AnyBackend, AnyConnection};
use dbterm_core::profiles::ConnectionStore;
use dbterm_core::reachability::ReachabilityResult;
use dbterm_core::settings::Settings;
use dbterm_core::view_state::ResultViewState;
use dbterm_core::workspace::{Job, LimitChange, Workspace, WorkspaceEvent};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::form::{ConnectionForm, FormField};
use crate::render::{render, Theme};

const TICK_RATE: Duration = Duration::from_millis(120);
const FLASH_DURATION: Duration = Duration::from_secs(3);
const RESULT_COLUMN_WIDTH: u16 = 18;
/// Header, footer and the grid's own border and title row.
const RESULT_CHROME_ROWS: u16 = 3 + 3 + 3;

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Dashboard,
    Tables,
    Results,
    QueryEditor,
}

impl Pane {
    fn next(self) -> Self {
        match self {
            Self::Dashboard => Self::Tables,
            Self::Tables => Self::Results,
            Self::Results => Self::QueryEditor,
            Self::QueryEditor => Self::Dashboard,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Dashboard => "Connections",
            Self::Tables => "Tables",
            Self::Results => "Results",
            Self::QueryEditor => "Query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

/// Whether printable keys are commands or text for the focused input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    Normal,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    NextPane,
    Back,
    Submit,
    Navigate(DirectionKey),
    PageUp,
    PageDown,
    Sort,
    Refresh,
    Limit(LimitChange),
    Export(ExportFormat),
    ExportRow,
    Probe,
    NewConnection,
    DeleteConnection,
    HealthCheck,
    Input(char),
    Backspace,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Flash {
    message: String,
    is_error: bool,
    until: Instant,
}

/// Every value of one result row, shown over the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RowDetail {
    /// Position of the row in the current view order.
    row: usize,
    /// Column names with full values; `None` is SQL NULL.
    fields: Vec<(String, Option<String>)>,
    scroll: usize,
}

impl RowDetail {
    fn from_view(view: &ResultViewState) -> Option<Self> {
        let cells = view.selected_row()?;
        let fields = view
            .grid()
            .columns()
            .iter()
            .zip(cells)
            .map(|(column, cell)| (column.clone(), cell.export_text()))
            .collect();
        Some(Self {
            row: view.selection().row,
            fields,
            scroll: 0,
        })
    }
}

struct TuiApp {
    workspace: Workspace<AnyBackend>,
    store: ConnectionStore,
    theme: Theme,
    pane: Pane,
    connection_index: usize,
    table_index: usize,
    editor: String,
    form: Option<ConnectionForm>,
    row_detail: Option<RowDetail>,
    show_help: bool,
    should_quit: bool,
    flash: Option<Flash>,
    /// Name of the connection last recorded as used in the store.
    marked_connection: Option<String>,
    export_dir: PathBuf,
    outbox: Vec<Job<AnyConnection>>,
    probes: Vec<UnboundedReceiver<ReachabilityResult>>,
}

impl TuiApp {
    fn new(settings: &Settings, store: ConnectionStore, export_dir: PathBuf) -> Self {
        Self {
            workspace: Workspace::new(AnyBackend::default(), settings),
            store,
            theme: Theme::default(),
            pane: Pane::Dashboard,
            connection_index: 0,
            table_index: 0,
            editor: String::new(),
            form: None,
            row_detail: None,
            show_help: false,
            should_quit: false,
            flash: None,
            marked_connection: None,
            export_dir,
            outbox: Vec::new(),
            probes: Vec::new(),
        }
    }

    fn input_mode(&self) -> InputMode {
        if self.form.is_some() || self.pane == Pane::QueryEditor {
            InputMode::Text
        } else {
            InputMode::Normal
        }
    }

    fn handle(&mut self, msg: Msg) {
        if self.form.is_some() && self.handle_form(msg) {
            return;
        }
        if self.row_detail.is_some() && self.handle_row_detail(msg) {
            return;
        }

        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::NextPane => self.pane = self.pane.next(),
            Msg::Back => {
                self.show_help = false;
                self.pane = Pane::Dashboard;
            }
            Msg::Submit => self.submit(),
            Msg::Navigate(direction) => self.navigate(direction),
            Msg::PageUp => {
                if let Some(view) = self.workspace.view_mut() {
                    view.page_up();
                }
            }
            Msg::PageDown => {
                if let Some(view) = self.workspace.view_mut() {
                    view.page_down();
                }
            }
            Msg::Sort => self.sort_current_column(),
            Msg::Refresh => {
                let job = self.workspace.begin_refresh();
                self.enqueue(job);
            }
            Msg::Limit(change) => {
                let job = self.workspace.begin_limit_change(change);
                self.enqueue(job);
            }
            Msg::Export(format) => self.export_grid(format),
            Msg::ExportRow => self.export_row(),
            Msg::Probe => self.start_probe(),
            Msg::NewConnection => self.form = Some(ConnectionForm::default()),
            Msg::DeleteConnection => self.delete_connection(),
            Msg::HealthCheck => {
                let job = self.workspace.begin_health_check();
                self.enqueue(job);
            }
            Msg::Input(ch) => {
                if self.pane == Pane::QueryEditor {
                    self.editor.push(ch);
                }
            }
            Msg::Backspace => {
                if self.pane == Pane::QueryEditor {
                    self.editor.pop();
                }
            }
            Msg::Tick => self.on_tick(),
        }
    }

    /// Returns true when the open form consumed the message.
    fn handle_form(&mut self, msg: Msg) -> bool {
        let Some(form) = self.form.as_mut() else {
            return false;
        };
        match msg {
            Msg::Back => self.form = None,
            Msg::NextPane | Msg::Navigate(DirectionKey::Down) => form.next_field(),
            Msg::Navigate(DirectionKey::Up) => form.previous_field(),
            Msg::Navigate(DirectionKey::Left) if form.active_field() == FormField::Kind => {
                form.cycle_backend(false);
            }
            Msg::Navigate(DirectionKey::Right) if form.active_field() == FormField::Kind => {
                form.cycle_backend(true);
            }
            Msg::Input(ch) => form.input(ch),
            Msg::Backspace => form.backspace(),
            Msg::Submit => self.save_form(),
            Msg::Quit | Msg::Tick => return false,
            _ => {}
        }
        true
    }

    /// Returns true when the open row detail consumed the message.
    fn handle_row_detail(&mut self, msg: Msg) -> bool {
        let Some(detail) = self.row_detail.as_mut() else {
            return false;
        };
        match msg {
            Msg::Back | Msg::Submit => self.row_detail = None,
            Msg::Navigate(DirectionKey::Up) => detail.scroll = detail.scroll.saturating_sub(1),
            Msg::Navigate(DirectionKey::Down) => {
                detail.scroll = (detail.scroll + 1).min(detail.fields.len().saturating_sub(1));
            }
            Msg::ExportRow => self.export_row(),
            Msg::Quit | Msg::Tick | Msg::ToggleHelp => return false,
            _ => {}
        }
        true
    }

    fn save_form(&mut self) {
        let Some(form) = self.form.as_ref() else {
            return;
        };
        let config = match form.to_config() {
            Ok(config) => config,
            Err(err) => {
                self.flash_error(err.to_string());
                return;
            }
        };

        match self.store.add(config.clone()) {
            Ok(index) => {
                self.form = None;
                self.connection_index = index;
                info!(connection = %config.name, "connection saved");
                let job = self.workspace.begin_connect(config);
                self.outbox.push(job);
            }
            Err(err) => self.flash_error(format!("Could not save connection: {err}")),
        }
    }

    fn submit(&mut self) {
        match self.pane {
            Pane::Dashboard => {
                let Some(config) = self.store.get(self.connection_index).cloned() else {
                    self.flash_info("No saved connections. Press n to add one.");
                    return;
                };
                let job = self.workspace.begin_connect(config);
                self.outbox.push(job);
            }
            Pane::Tables => {
                let Some(table) = self.workspace.tables().get(self.table_index).cloned() else {
                    self.flash_info("No table selected");
                    return;
                };
                let job = self.workspace.begin_preview(&table);
                if job.is_some() {
                    self.pane = Pane::Results;
                }
                self.enqueue(job);
            }
            Pane::QueryEditor => {
                let job = self.workspace.begin_query(&self.editor);
                if job.is_some() {
                    self.pane = Pane::Results;
                }
                self.enqueue(job);
            }
            Pane::Results => {
                let detail = self.workspace.view().and_then(RowDetail::from_view);
                if detail.is_none() {
                    self.flash_info("No row selected");
                }
                self.row_detail = detail;
            }
        }
    }

    fn navigate(&mut self, direction: DirectionKey) {
        match self.pane {
            Pane::Dashboard => {
                self.connection_index =
                    step(self.connection_index, self.store.connections().len(), direction);
            }
            Pane::Tables => {
                self.table_index = step(self.table_index, self.workspace.tables().len(), direction);
            }
            Pane::Results => {
                let Some(view) = self.workspace.view_mut() else {
                    return;
                };
                match direction {
                    DirectionKey::Up => view.move_up(1),
                    DirectionKey::Down => view.move_down(1),
                    DirectionKey::Left => view.move_left(1),
                    DirectionKey::Right => view.move_right(1),
                }
            }
            Pane::QueryEditor => {}
        }
    }

    fn sort_current_column(&mut self) {
        let Some(view) = self.workspace.view_mut() else {
            self.flash_info("Nothing to sort");
            return;
        };
        let column = view.selection().column;
        view.toggle_sort(column);
        let status = view.sort_status();
        self.flash_info(status);
    }

    fn export_path(&self, kind: &str, format: ExportFormat) -> PathBuf {
        let file_name = format!(
            "dbterm-{kind}-{}.{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            format.extension()
        );
        self.export_dir.join(file_name)
    }

    fn export_grid(&mut self, format: ExportFormat) {
        let Some(view) = self.workspace.view() else {
            self.flash_info("Nothing to export");
            return;
        };
        let path = self.export_path("export", format);
        match export_view(&path, view, format) {
            Ok(rows) => self.flash_info(format!("Exported {rows} rows to {}", path.display())),
            Err(err) => {
                warn!(error = %err, "export failed");
                self.flash_error(err.to_string());
            }
        }
    }

    /// Saves the selected row as a JSON record so value types survive.
    fn export_row(&mut self) {
        if self.pane != Pane::Results {
            return;
        }
        let Some(view) = self.workspace.view() else {
            self.flash_info("Nothing to export");
            return;
        };
        let path = self.export_path("row", ExportFormat::Json);
        match export_selected_row(&path, view, ExportFormat::Json) {
            Ok(_) => self.flash_info(format!("Saved row to {}", path.display())),
            Err(err) => {
                warn!(error = %err, "row export failed");
                self.flash_error(err.to_string());
            }
        }
    }

    fn start_probe(&mut self) {
        if self.store.connections().is_empty() {
            return;
        }
        let receiver = self.workspace.begin_probe(self.store.connections());
        self.probes.push(receiver);
    }

    fn delete_connection(&mut self) {
        if self.pane != Pane::Dashboard {
            return;
        }
        match self.store.delete(self.connection_index) {
            Ok(removed) => {
                self.connection_index = self
                    .connection_index
                    .min(self.store.connections().len().saturating_sub(1));
                self.flash_info(format!("Deleted {}", removed.name));
                self.start_probe();
            }
            Err(err) => self.flash_error(err.to_string()),
        }
    }

    fn enqueue(&mut self, job: Option<Job<AnyConnection>>) {
        self.outbox.extend(job);
    }

    /// Folds a finished job back in and records newly active connections.
    fn apply(&mut self, event: WorkspaceEvent<AnyConnection>) {
        let follow_ups = self.workspace.apply(event);
        self.outbox.extend(follow_ups);

        let active = self
            .workspace
            .active()
            .map(|active| active.config().name.clone());
        if active != self.marked_connection {
            if let Some(name) = &active {
                if let Some((index, _)) = self.store.find(name) {
                    if let Err(err) = self.store.mark_used(index) {
                        warn!(error = %err, "failed to record connection use");
                    }
                }
                self.table_index = 0;
                self.pane = Pane::Tables;
            }
            self.marked_connection = active;
        }
        self.table_index = self
            .table_index
            .min(self.workspace.tables().len().saturating_sub(1));
    }

    fn on_tick(&mut self) {
        if self
            .flash
            .as_ref()
            .is_some_and(|flash| Instant::now() >= flash.until)
        {
            self.flash = None;
        }
    }

    fn flash_info(&mut self, message: impl Into<String>) {
        self.flash = Some(Flash {
            message: message.into(),
            is_error: false,
            until: Instant::now() + FLASH_DURATION,
        });
    }

    fn flash_error(&mut self, message: impl Into<String>) {
        self.flash = Some(Flash {
            message: message.into(),
            is_error: true,
            until: Instant::now() + FLASH_DURATION,
        });
    }

    fn resize(&mut self, width: u16, height: u16) {
        let rows = height.saturating_sub(RESULT_CHROME_ROWS).max(1);
        let columns = (width.saturating_sub(2) / RESULT_COLUMN_WIDTH).max(1);
        if let Some(view) = self.workspace.view_mut() {
            view.set_viewport(usize::from(rows), usize::from(columns));
        }
    }
}

fn step(index: usize, len: usize, direction: DirectionKey) -> usize {
    if len == 0 {
        return 0;
    }
    match direction {
        DirectionKey::Up | DirectionKey::Left => index.saturating_sub(1),
        DirectionKey::Down | DirectionKey::Right => (index + 1).min(len - 1),
    }
}

/// Runs the interactive loop until the user quits.
pub fn run(settings: &Settings, store: ConnectionStore) -> Result<(), TuiError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    // Probe rounds spawn onto the ambient runtime.
    let _context = runtime.enter();
    let export_dir = std::env::current_dir()?;
    let mut app = TuiApp::new(settings, store, export_dir);

    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, &runtime, &mut app);
    let restore_result = restore_terminal(&mut terminal);

    if let Err(err) = runtime.block_on(app.workspace.disconnect()) {
        warn!(error = %err, "failed to close connection on exit");
    }

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn spawn_jobs(
    runtime: &Runtime,
    app: &mut TuiApp,
    events: &UnboundedSender<WorkspaceEvent<AnyConnection>>,
) {
    for job in app.outbox.drain(..) {
        let events = events.clone();
        runtime.spawn(async move {
            let _ = events.send(job.await);
        });
    }
    for mut receiver in app.probes.drain(..) {
        let events = events.clone();
        runtime.spawn(async move {
            while let Some(result) = receiver.recv().await {
                if events.send(WorkspaceEvent::Reachability(result)).is_err() {
                    break;
                }
            }
        });
    }
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    runtime: &Runtime,
    app: &mut TuiApp,
) -> Result<(), TuiError> {
    let (events, mut inbox) = mpsc::unbounded_channel();
    let mut last_tick = Instant::now();
    app.start_probe();

    loop {
        spawn_jobs(runtime, app, &events);

        let size = terminal.size()?;
        app.resize(size.width, size.height);
        terminal.draw(|frame| render(frame, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(key, app.input_mode()) {
                        app.handle(message);
                    }
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            while let Ok(event) = inbox.try_recv() {
                app.apply(event);
            }
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn map_key_event(key: KeyEvent, mode: InputMode) -> Option<Msg> {
    let shared = match (key.modifiers, key.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c')) => Some(Msg::Quit),
        (_, KeyCode::Tab) => Some(Msg::NextPane),
        (_, KeyCode::Enter) => Some(Msg::Submit),
        (_, KeyCode::Esc) => Some(Msg::Back),
        (_, KeyCode::F(5)) => Some(Msg::Refresh),
        (_, KeyCode::Up) => Some(Msg::Navigate(DirectionKey::Up)),
        (_, KeyCode::Down) => Some(Msg::Navigate(DirectionKey::Down)),
        (_, KeyCode::Left) => Some(Msg::Navigate(DirectionKey::Left)),
        (_, KeyCode::Right) => Some(Msg::Navigate(DirectionKey::Right)),
        (_, KeyCode::PageUp) => Some(Msg::PageUp),
        (_, KeyCode::PageDown) => Some(Msg::PageDown),
        _ => None,
    };
    if shared.is_some() {
        return shared;
    }

    match mode {
        InputMode::Text => match key.code {
            KeyCode::Backspace => Some(Msg::Backspace),
            KeyCode::Char(ch) => Some(Msg::Input(ch)),
            _ => None,
        },
        InputMode::Normal => match key.code {
            KeyCode::Char('q') => Some(Msg::Quit),
            KeyCode::Char('?') => Some(Msg::ToggleHelp),
            KeyCode::Char('k') => Some(Msg::Navigate(DirectionKey::Up)),
            KeyCode::Char('j') => Some(Msg::Navigate(DirectionKey::Down)),
            KeyCode::Char('h') => Some(Msg::Navigate(DirectionKey::Left)),
            KeyCode::Char('l') => Some(Msg::Navigate(DirectionKey::Right)),
            KeyCode::Char('s') => Some(Msg::Sort),
            KeyCode::Char('+' | '=') => Some(Msg::Limit(LimitChange::Increase)),
            KeyCode::Char('-') => Some(Msg::Limit(LimitChange::Decrease)),
            KeyCode::Char('0') => Some(Msg::Limit(LimitChange::ToggleUnlimited)),
            KeyCode::Char('e') => Some(Msg::Export(ExportFormat::Csv)),
            KeyCode::Char('E') => Some(Msg::Export(ExportFormat::Json)),
            KeyCode::Char('y') => Some(Msg::ExportRow),
            KeyCode::Char('r') => Some(Msg::Probe),
            KeyCode::Char('n') => Some(Msg::NewConnection),
            KeyCode::Char('d') => Some(Msg::DeleteConnection),
            KeyCode::Char('p') => Some(Msg::HealthCheck),
            _ => None,
        },
    }
}
