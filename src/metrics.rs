use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

/// Number of recent latency samples kept for the rolling view.
pub const LATENCY_WINDOW: usize = 1024;

/// Streaming latency summary: lifetime count/sum/max plus a bounded ring of the most
/// recent samples.
#[derive(Debug, Clone, Default)]
pub struct LatencySummary {
    count: u64,
    total: Duration,
    max: Duration,
    recent: VecDeque<Duration>,
}

impl LatencySummary {
    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(sample);
        self.max = self.max.max(sample);
        if self.recent.len() == LATENCY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean over every sample ever recorded, in milliseconds.
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.count as f64;
        self.total.as_secs_f64() * 1000.0 / count
    }

    /// Mean over the retained window, in milliseconds.
    #[must_use]
    pub fn recent_mean_ms(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let sum: Duration = self.recent.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let len = self.recent.len() as f64;
        sum.as_secs_f64() * 1000.0 / len
    }

    #[must_use]
    pub fn max_ms(&self) -> f64 {
        self.max.as_secs_f64() * 1000.0
    }

    #[must_use]
    pub fn window_len(&self) -> usize {
        self.recent.len()
    }
}

/// Counters shared by every database manager built on the same pool.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    queries: AtomicU64,
    errors: AtomicU64,
    transactions: AtomicU64,
    transaction_errors: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    latency: Mutex<LatencySummary>,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_transactions: u64,
    pub total_transaction_errors: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub average_latency_ms: f64,
    pub recent_average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub active_connections: usize,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, elapsed: Duration, ok: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency().record(elapsed);
    }

    pub fn record_transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_error(&self) {
        self.transaction_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// `active_connections` comes from the pool, which owns that number.
    #[must_use]
    pub fn snapshot(&self, active_connections: usize) -> MetricsSnapshot {
        let latency = self.latency();
        MetricsSnapshot {
            total_queries: self.queries.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            total_transactions: self.transactions.load(Ordering::Relaxed),
            total_transaction_errors: self.transaction_errors.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            average_latency_ms: latency.mean_ms(),
            recent_average_latency_ms: latency.recent_mean_ms(),
            max_latency_ms: latency.max_ms(),
            active_connections,
        }
    }

    fn latency(&self) -> MutexGuard<'_, LatencySummary> {
        match self.latency.lock() {
            Ok(guard) => guard,
            // counters stay usable even if a recorder panicked mid-update
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
