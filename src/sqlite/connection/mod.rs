mod core;
mod dml;
mod select;
mod tx;

pub use self::core::{SharedSqliteConnection, SqliteConnection};
pub(crate) use self::core::run_blocking;
