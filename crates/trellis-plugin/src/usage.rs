//! Per-plugin usage accounting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated on every sandboxed call.
///
/// Each field is individually atomic; a snapshot is consistent per field but
/// may tear between fields, which is fine for an observability surface.
#[derive(Debug, Default)]
pub struct UsageCounters {
    queries: AtomicU64,
    execs: AtomicU64,
    cache_ops: AtomicU64,
    http_requests: AtomicU64,
    plugin_calls: AtomicU64,
    emails: AtomicU64,
    events: AtomicU64,
    errors: AtomicU64,
    last_call_ms: AtomicI64,
}

impl UsageCounters {
    /// Fresh counters, all zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a database read.
    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a database statement.
    pub fn record_exec(&self) {
        self.execs.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a cache operation.
    pub fn record_cache_op(&self) {
        self.cache_ops.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record an outbound HTTP request.
    pub fn record_http(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a plugin-to-plugin call.
    pub fn record_plugin_call(&self) {
        self.plugin_calls.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record an outbound email.
    pub fn record_email(&self) {
        self.emails.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a published event.
    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a failed call, policy denial included.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_call_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            execs: self.execs.load(Ordering::Relaxed),
            cache_ops: self.cache_ops.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            plugin_calls: self.plugin_calls.load(Ordering::Relaxed),
            emails: self.emails.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_call_ms: self.last_call_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one plugin's usage, for admin surfaces.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageSnapshot {
    /// Database reads.
    pub queries: u64,
    /// Database statements.
    pub execs: u64,
    /// Cache operations.
    pub cache_ops: u64,
    /// Outbound HTTP requests.
    pub http_requests: u64,
    /// Plugin-to-plugin calls.
    pub plugin_calls: u64,
    /// Outbound emails.
    pub emails: u64,
    /// Published events.
    pub events: u64,
    /// Failed calls, policy denials included.
    pub errors: u64,
    /// Unix milliseconds of the most recent call, zero if none.
    pub last_call_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = UsageCounters::new();
        counters.record_query();
        counters.record_query();
        counters.record_exec();
        counters.record_error();

        let snap = counters.snapshot();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.execs, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.cache_ops, 0);
        assert!(snap.last_call_ms > 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let counters = std::sync::Arc::new(UsageCounters::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counters = std::sync::Arc::clone(&counters);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counters.record_cache_op();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.snapshot().cache_ops, 4000);
    }
}
