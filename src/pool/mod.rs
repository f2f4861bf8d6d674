mod types;

pub use types::PoolStatus;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics::MetricsRegistry;
use crate::sqlite::{SqliteConnection, StoreOptions};
use types::PoolEntry;

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    next_seq: u64,
    // one gate per name, so concurrent cold acquires open a single handle
    opening: HashMap<String, Arc<AsyncMutex<()>>>,
}

/// Bounded registry of live connections.
///
/// Idle connections are reused by name. When registering a connection pushes the pool
/// past `max_size`, the oldest idle connection is removed and closed; connections in a
/// transaction are never evicted, so the pool may sit above `max_size` (up to
/// `max_size + max_overflow`) until those transactions finish.
///
/// The map lock is never held across an `.await`; anything decided before a
/// suspension is checked again after it.
#[derive(Debug)]
pub struct ConnectionPool {
    max_size: usize,
    max_overflow: usize,
    state: Mutex<PoolState>,
    metrics: Arc<MetricsRegistry>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(max_size: usize, max_overflow: usize, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            max_size: max_size.max(1),
            max_overflow,
            state: Mutex::new(PoolState::default()),
            metrics,
        }
    }

    #[must_use]
    pub fn from_options(options: &StoreOptions, metrics: Arc<MetricsRegistry>) -> Self {
        Self::new(options.pool_size, options.max_overflow(), metrics)
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Return an idle connection registered under `name`, opening (and registering) a
    /// new one when none exists. Concurrent callers asking for the same name wait for
    /// the first opener and then share its connection.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionFailed` if a new handle cannot be opened, or
    /// `StoreError::ConnectionPoolExhausted` if the pool is at its hard ceiling.
    pub async fn acquire(
        &self,
        name: &str,
        options: &StoreOptions,
    ) -> Result<Arc<SqliteConnection>, StoreError> {
        if let Some(conn) = self.find_idle(name) {
            return Ok(conn);
        }

        let gate = self.opening_gate(name);
        let _opening = gate.lock().await;
        // the previous holder of the gate may have registered one already
        if let Some(conn) = self.find_idle(name) {
            debug!(conn_id = %conn.id(), "reusing connection opened by a concurrent acquire");
            return Ok(conn);
        }

        let id = format!("{name}:{}", self.reserve_seq());
        let conn = Arc::new(SqliteConnection::open(id, options).await?);
        self.metrics.record_connection_opened();
        self.register(name, Arc::clone(&conn)).await?;
        Ok(conn)
    }

    /// Open a connection reserved for one transaction. It is not registered; call
    /// [`ConnectionPool::register`] once the transaction has begun so eviction can
    /// never pick it while it is still idle.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionFailed` if the handle cannot be opened.
    pub async fn open_dedicated(&self, options: &StoreOptions) -> Result<Arc<SqliteConnection>, StoreError> {
        let id = format!("tx:{}", Uuid::new_v4().simple());
        let conn = Arc::new(SqliteConnection::open(id, options).await?);
        self.metrics.record_connection_opened();
        Ok(conn)
    }

    /// Add `conn` to the pool under `name`, evicting the oldest idle connections while
    /// the pool is above `max_size`.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionPoolExhausted` (after closing `conn`) if, once idle
    /// connections are evicted, the pool would still exceed `max_size + max_overflow`.
    pub async fn register(&self, name: &str, conn: Arc<SqliteConnection>) -> Result<(), StoreError> {
        let ceiling = self.max_size + self.max_overflow;
        let (evicted, admitted) = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                conn.id().to_owned(),
                PoolEntry {
                    conn: Arc::clone(&conn),
                    name: name.to_owned(),
                    seq,
                },
            );
            let evicted = evict_over(&mut state, self.max_size, conn.id());
            let admitted = state.entries.len() <= ceiling;
            if !admitted {
                state.entries.remove(conn.id());
            }
            (evicted, admitted)
        };

        for entry in evicted {
            self.close_evicted(entry).await;
        }
        if !admitted {
            self.close_unregistered(&conn).await;
            return Err(StoreError::ConnectionPoolExhausted(format!(
                "{ceiling} connections open, all in transactions"
            )));
        }
        Ok(())
    }

    /// Close a connection and remove it from the pool. Unknown ids are ignored.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionCloseFailed` if SQLite refuses to close the handle;
    /// the entry is removed either way.
    pub async fn close(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.lock().entries.remove(id);
        let Some(entry) = removed else {
            debug!(conn_id = %id, "close requested for unknown connection");
            return Ok(());
        };
        let result = entry.conn.close().await;
        self.metrics.record_connection_closed();
        result
    }

    /// Close every connection registered under `name`.
    ///
    /// # Errors
    /// Returns the first `StoreError::ConnectionCloseFailed` encountered; every matching
    /// entry is removed regardless.
    pub async fn close_named(&self, name: &str) -> Result<(), StoreError> {
        let ids: Vec<String> = self
            .lock()
            .entries
            .values()
            .filter(|e| e.name == name)
            .map(|e| e.conn.id().to_owned())
            .collect();
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.close(&id).await {
                error!(conn_id = %id, error = %err, "failed to close named connection");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Close every pooled connection. Failures are logged, never returned; the pool is
    /// empty afterwards. Returns how many connections were closed cleanly.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<PoolEntry> = self.lock().entries.drain().map(|(_, e)| e).collect();
        let mut closed = 0;
        for entry in drained {
            match entry.conn.close().await {
                Ok(()) => closed += 1,
                Err(err) => error!(conn_id = %entry.conn.id(), error = %err, "failed to close pooled connection"),
            }
            self.metrics.record_connection_closed();
        }
        closed
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Connection ids, oldest first.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let state = self.lock();
        let mut entries: Vec<&PoolEntry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.conn.id().to_owned()).collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<SqliteConnection>> {
        self.lock().entries.get(id).map(|e| Arc::clone(&e.conn))
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        let busy = state
            .entries
            .values()
            .filter(|e| e.conn.in_transaction())
            .count();
        PoolStatus {
            size: state.entries.len(),
            idle: state.entries.len() - busy,
            in_transaction: busy,
            max_size: self.max_size,
            max_overflow: self.max_overflow,
        }
    }

    fn find_idle(&self, name: &str) -> Option<Arc<SqliteConnection>> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.name == name && e.is_idle())
            .min_by_key(|e| e.seq)
            .map(|e| Arc::clone(&e.conn))
    }

    fn opening_gate(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut state = self.lock();
        Arc::clone(state.opening.entry(name.to_owned()).or_default())
    }

    fn reserve_seq(&self) -> u64 {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    async fn close_evicted(&self, entry: PoolEntry) {
        // a holder may have begun a transaction on it since it was picked
        if entry.conn.in_transaction() {
            warn!(conn_id = %entry.conn.id(), "evicted connection entered a transaction; keeping it");
            self.lock().entries.insert(entry.conn.id().to_owned(), entry);
            return;
        }
        debug!(conn_id = %entry.conn.id(), "evicting oldest idle connection");
        if let Err(err) = entry.conn.close().await {
            error!(conn_id = %entry.conn.id(), error = %err, "failed to close evicted connection");
        }
        self.metrics.record_connection_closed();
    }

    async fn close_unregistered(&self, conn: &SqliteConnection) {
        if let Err(err) = conn.close().await {
            error!(conn_id = %conn.id(), error = %err, "failed to close unregistered connection");
        }
        self.metrics.record_connection_closed();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Remove the oldest idle entries (never `keep`) until the map fits `max_size`.
fn evict_over(state: &mut PoolState, max_size: usize, keep: &str) -> Vec<PoolEntry> {
    let mut evicted = Vec::new();
    while state.entries.len() > max_size {
        let candidate = state
            .entries
            .iter()
            .filter(|(id, e)| id.as_str() != keep && !e.conn.in_transaction())
            .min_by_key(|(_, e)| e.seq)
            .map(|(id, _)| id.clone());
        let Some(id) = candidate else {
            warn!(
                size = state.entries.len(),
                max_size, "pool above capacity; every other connection is in a transaction"
            );
            break;
        };
        if let Some(entry) = state.entries.remove(&id) {
            evicted.push(entry);
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> StoreOptions {
        StoreOptions::builder(dir.path().join("evict.db").to_string_lossy().into_owned())
            .pool_size(1)
            .finish()
            .unwrap()
    }

    #[tokio::test]
    async fn victim_that_began_a_transaction_is_put_back() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir);
        let metrics = Arc::new(MetricsRegistry::new());
        let pool = ConnectionPool::from_options(&opts, Arc::clone(&metrics));
        let conn = pool.acquire("default", &opts).await.unwrap();

        // picked while idle, then begun before the close runs
        let picked = evict_over(&mut pool.lock(), 0, "");
        assert_eq!(picked.len(), 1);
        assert!(!pool.contains(conn.id()));
        conn.begin().await.unwrap();
        for entry in picked {
            pool.close_evicted(entry).await;
        }

        assert!(pool.contains(conn.id()));
        assert!(!conn.is_closed());
        assert_eq!(metrics.snapshot(pool.size()).connections_closed, 0);
        conn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn idle_victim_is_closed() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir);
        let metrics = Arc::new(MetricsRegistry::new());
        let pool = ConnectionPool::from_options(&opts, Arc::clone(&metrics));
        let conn = pool.acquire("default", &opts).await.unwrap();

        let picked = evict_over(&mut pool.lock(), 0, "");
        for entry in picked {
            pool.close_evicted(entry).await;
        }

        assert_eq!(pool.size(), 0);
        assert!(conn.is_closed());
        assert_eq!(metrics.snapshot(0).connections_closed, 1);
    }
}
