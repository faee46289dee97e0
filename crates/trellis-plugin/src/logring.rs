//! Bounded ring of structured log entries.
//!
//! Every plugin-visible log call lands here in addition to the process
//! logger, so admin surfaces can show recent per-plugin activity without
//! scraping process output. Writes past capacity overwrite the oldest
//! entry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use trellis_plugin_api::LogLevel;

/// Default capacity of the process-global ring.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One captured log entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Plugin the entry belongs to; empty for host-originated entries.
    pub plugin: String,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Structured fields.
    pub fields: BTreeMap<String, Value>,
}

/// Fixed-capacity ring of [`LogEntry`] values.
pub struct LogRing {
    capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
}

impl LogRing {
    /// A ring holding at most `capacity` entries. A capacity of zero is
    /// clamped to one so pushes always land somewhere.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append an entry, evicting the oldest past capacity.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Record a log call.
    pub fn record(
        &self,
        plugin: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) {
        self.push(LogEntry {
            timestamp: Utc::now(),
            plugin: plugin.into(),
            level,
            message: message.into(),
            fields,
        });
    }

    /// The most recent `n` entries, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        self.entries.read().iter().rev().take(n).cloned().collect()
    }

    /// Entries filtered by plugin and minimum level, newest first.
    #[must_use]
    pub fn filtered(
        &self,
        plugin: Option<&str>,
        min_level: Option<LogLevel>,
        limit: usize,
    ) -> Vec<LogEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| plugin.is_none_or(|p| e.plugin == p))
            .filter(|e| min_level.is_none_or(|min| e.level >= min))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

static GLOBAL: Lazy<RwLock<Arc<LogRing>>> =
    Lazy::new(|| RwLock::new(Arc::new(LogRing::new(DEFAULT_CAPACITY))));

/// The process-global ring, lazily materialized on first access.
#[must_use]
pub fn global() -> Arc<LogRing> {
    Arc::clone(&GLOBAL.read())
}

/// Replace the process-global ring. Tests install their own before calling
/// into manager APIs; existing holders keep the ring they already fetched.
pub fn set_global(ring: Arc<LogRing>) {
    *GLOBAL.write() = ring;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(plugin: &str, level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            plugin: plugin.to_string(),
            level,
            message: message.to_string(),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn overwrites_oldest_past_capacity() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(entry("stats", LogLevel::Info, &format!("m{i}")));
        }
        assert_eq!(ring.len(), 3);
        let recent = ring.recent(10);
        assert_eq!(recent[0].message, "m4");
        assert_eq!(recent[2].message, "m2");
    }

    #[test]
    fn recent_is_newest_first() {
        let ring = LogRing::new(10);
        ring.push(entry("a", LogLevel::Info, "first"));
        ring.push(entry("a", LogLevel::Info, "second"));
        let recent = ring.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "second");
    }

    #[test]
    fn filters_by_plugin_and_level() {
        let ring = LogRing::new(10);
        ring.push(entry("stats", LogLevel::Debug, "noise"));
        ring.push(entry("stats", LogLevel::Error, "broken"));
        ring.push(entry("mail", LogLevel::Error, "other"));

        let stats_errors = ring.filtered(Some("stats"), Some(LogLevel::Warn), 10);
        assert_eq!(stats_errors.len(), 1);
        assert_eq!(stats_errors[0].message, "broken");

        let all_warn_up = ring.filtered(None, Some(LogLevel::Warn), 10);
        assert_eq!(all_warn_up.len(), 2);

        let all_stats = ring.filtered(Some("stats"), None, 10);
        assert_eq!(all_stats.len(), 2);
    }

    #[test]
    fn global_is_swappable() {
        let mine = Arc::new(LogRing::new(5));
        set_global(Arc::clone(&mine));
        global().record("x", LogLevel::Info, "hello", BTreeMap::new());
        assert_eq!(mine.len(), 1);
        // Restore a fresh default so other tests see a clean global.
        set_global(Arc::new(LogRing::new(DEFAULT_CAPACITY)));
    }
}
