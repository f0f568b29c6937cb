mod logging;

use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};

use dbterm_core::profiles::{default_config_dir, default_store_path, ConnectionStore};
use dbterm_core::settings::{Settings, SETTINGS_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Help,
    Version,
    Info,
}

struct Startup {
    settings: Settings,
    store: ConnectionStore,
    config_dir: PathBuf,
}

fn load_startup() -> Result<Startup, Box<dyn Error>> {
    Ok(Startup {
        settings: Settings::load_default()?,
        store: ConnectionStore::load_default()?,
        config_dir: default_config_dir()?,
    })
}

fn run_app(
    load: impl FnOnce() -> Result<Startup, Box<dyn Error>>,
    run_tui: impl FnOnce(&Settings, ConnectionStore) -> Result<(), dbterm_tui::TuiError>,
) -> Result<(), Box<dyn Error>> {
    let Startup {
        settings,
        store,
        config_dir,
    } = load()?;
    let _log_guard = logging::init(&config_dir, &settings.log_filter)?;
    tracing::info!(
        connections = store.connections().len(),
        store = %store.path().display(),
        "starting dbterm"
    );

    run_tui(&settings, store)?;
    tracing::info!("dbterm exited");
    Ok(())
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> io::Result<Command> {
    let mut command = Command::Run;
    for arg in args {
        command = match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "-V" | "--version" => Command::Version,
            "-i" | "--info" => Command::Info,
            other => {
                return Err(io::Error::other(format!(
                    "unknown argument `{other}` (see --help)"
                )))
            }
        };
    }
    Ok(command)
}

fn help_text() -> String {
    format!(
        "dbterm {}\n\
Terminal client for PostgreSQL, MySQL, SQLite and Cloudflare D1.\n\n\
Usage:\n  dbterm-app [OPTIONS]\n\n\
Options:\n  -h, --help     Print this help\n  -v, --version  Print the version\n  -i, --info     Print config, connection store and log locations\n\n\
Environment:\n  DBTERM_CONFIG_DIR overrides the config directory.\n  {} overrides the configured log filter.\n",
        env!("CARGO_PKG_VERSION"),
        logging::LOG_ENV,
    )
}

fn info_text(config_dir: &Path, store_path: &Path) -> String {
    format!(
        "config dir:  {}\nsettings:    {}\nconnections: {}\nlog file:    {}\n",
        config_dir.display(),
        config_dir.join(SETTINGS_FILE).display(),
        store_path.display(),
        config_dir.join(logging::LOG_FILE).display(),
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    match parse_args_from(std::env::args().skip(1))? {
        Command::Run => run_app(load_startup, dbterm_tui::run),
        Command::Help => {
            print!("{}", help_text());
            Ok(())
        }
        Command::Version => {
            println!("dbterm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Info => {
            print!("{}", info_text(&default_config_dir()?, &default_store_path()?));
            Ok(())
        }
    }
}
