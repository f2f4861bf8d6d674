use std::sync::Arc;

use serde::Serialize;

use crate::sqlite::SqliteConnection;

/// A registered connection plus the bookkeeping the pool evicts by.
#[derive(Debug, Clone)]
pub(crate) struct PoolEntry {
    pub(crate) conn: Arc<SqliteConnection>,
    /// Lookup key used by named acquires; several entries may share one.
    pub(crate) name: String,
    /// Insertion order; the lowest idle sequence is evicted first.
    pub(crate) seq: u64,
}

impl PoolEntry {
    pub(crate) fn is_idle(&self) -> bool {
        !self.conn.in_transaction() && !self.conn.is_closed()
    }
}

/// Occupancy of a pool at one instant.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub in_transaction: usize,
    pub max_size: usize,
    pub max_overflow: usize,
}
