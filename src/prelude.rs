//! Convenient imports for repositories.
//!
//! ```rust
//! use storefront_db::prelude::*;
//! ```

pub use crate::db::Database;
pub use crate::error::{ErrorKind, StoreError};
pub use crate::executor::QueryExecutor;
pub use crate::metrics::{MetricsRegistry, MetricsSnapshot};
pub use crate::pool::ConnectionPool;
pub use crate::record::{FromRow, RecordAccessor, SearchMatch, SearchValue, TableSpec};
pub use crate::results::{DbRow, ResultSet, RunResult};
pub use crate::retry::RetryPolicy;
pub use crate::sqlite::{QueryOptions, StoreOptions};
pub use crate::transaction::{Transaction, TxHandle};
pub use crate::types::RowValues;
