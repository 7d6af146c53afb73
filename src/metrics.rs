//! Connection metrics
//!
//! Routing reports connection lifecycle events through a provider trait
//! shared with the rest of the server process. The gauge discipline is
//! strict: every accepted downstream increments once and decrements once
//! on teardown, so a quiet server always reads zero.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sink for routing-layer metrics.
pub trait MetricsProvider: Send + Sync {
    /// A downstream connection was accepted.
    fn connection_opened(&self);
    /// A downstream connection and its paired upstream were torn down.
    fn connection_closed(&self);
    /// A connection was rejected before an upstream dial.
    fn connection_rejected(&self);
    /// The upstream refused the bridged authentication.
    fn auth_rejected(&self);
}

/// Provider that drops everything.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsProvider for NoopMetrics {
    fn connection_opened(&self) {}
    fn connection_closed(&self) {}
    fn connection_rejected(&self) {}
    fn auth_rejected(&self) {}
}

/// Process-local provider backed by atomics.
#[derive(Default)]
pub struct AtomicMetrics {
    open_connections: AtomicI64,
    rejected: AtomicU64,
    auth_failures: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently spliced downstream connections.
    pub fn open_connections(&self) -> i64 {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::SeqCst)
    }
}

impl MetricsProvider for AtomicMetrics {
    fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn auth_rejected(&self) {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
    }
}
