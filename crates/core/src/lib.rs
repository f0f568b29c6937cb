//! Connection resolution, query execution and result views for dbterm.

pub mod connection_manager;
pub mod dsn;
pub mod errors;
pub mod format;
pub mod profiles;
pub mod query_runner;
pub mod reachability;
pub mod resolver;
pub mod results;
pub mod schema;
pub mod settings;
pub mod view_state;
pub mod workspace;
