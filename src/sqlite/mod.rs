// SQLite module - the physical layer under the pool and the transaction manager
//
// - config: store options and per-call overrides
// - connection: one physical handle, its pragmas, and begin/commit/rollback
// - params: conversion from `RowValues` to rusqlite values
// - query: result extraction

pub mod config;
pub mod connection;
pub mod params;
pub mod query;

pub use config::{QueryOptions, StoreOptions, StoreOptionsBuilder};
pub use connection::{SharedSqliteConnection, SqliteConnection};
pub use params::Params;
pub use query::build_result_set;
