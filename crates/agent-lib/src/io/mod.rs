//! Collaborator interfaces consumed by the core
//!
//! The core never opens its own storage connections. It pulls logs from a
//! [`LogSource`], hands anomalies to an [`AnomalySink`] and writes status
//! records to a [`StatusPublisher`]. File-backed and in-memory
//! implementations are provided for the daemon and for tests.

mod jsonl;
mod status;

pub use jsonl::{JsonLinesAnomalySink, JsonLinesLogSource};
pub use status::{MemoryStatusStore, NoopStatusPublisher};

use crate::models::{Anomaly, LogEntry};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Read access to device logs
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Entries from any of `sources` with `window_start <= timestamp < window_end`.
    /// An empty filter set matches every source.
    async fn fetch_logs(
        &self,
        sources: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>>;
}

/// Destination for detected anomalies
#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn persist_anomaly(&self, anomaly: &Anomaly) -> Result<()>;
}

/// Write-only key/value status store
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// Whether `entry` passes an agent's source filter
pub fn matches_sources(sources: &BTreeSet<String>, entry: &LogEntry) -> bool {
    sources.is_empty() || sources.contains(&entry.source)
}
