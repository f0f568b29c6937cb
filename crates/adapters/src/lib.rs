//! Database drivers and file export for dbterm.

pub mod any;
pub mod d1;
pub mod export;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use any::{AnyBackend, AnyConnection};
