//! SQLite access core for the storefront backend.
//!
//! A bounded, named [`ConnectionPool`] feeds a [`Database`] manager whose `run`/`get`/`all`
//! entry points go through a timeout guard and an exponential-backoff retry policy.
//! Transactions run on dedicated connections that are closed when they finish, either
//! through an explicit [`Transaction`] handle or the scoped [`Database::transaction`].
//! [`RecordAccessor`] layers id/UUID addressed CRUD over one table, and a shared
//! [`MetricsRegistry`] counts queries, errors, transactions and connections.
//!
//! Statement timeouts stop the caller from waiting; the statement itself keeps running
//! on its blocking thread until SQLite finishes it.

pub mod db;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod record;
pub mod results;
pub mod retry;
pub mod sqlite;
pub mod timeout;
pub mod transaction;
pub mod types;

pub use db::Database;
pub use error::{ErrorKind, StoreError};
pub use executor::QueryExecutor;
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolStatus};
pub use record::{FromRow, RecordAccessor, SearchMatch, SearchValue, TableSpec};
pub use results::{DbRow, ResultSet, RunResult};
pub use retry::{RetryPolicy, with_retry};
pub use sqlite::{QueryOptions, SqliteConnection, StoreOptions, StoreOptionsBuilder};
pub use timeout::with_timeout;
pub use transaction::{Transaction, TxHandle, TxState, run_in_transaction};
pub use types::RowValues;
