//! JSON-lines file adapters
//!
//! The log source reads every `*.jsonl` file under a directory, one
//! [`LogEntry`] per line. The anomaly sink appends one [`Anomaly`] per line.

use super::{matches_sources, AnomalySink, LogSource};
use crate::models::{Anomaly, LogEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Reads log entries from `*.jsonl` files in a directory
#[derive(Debug, Clone)]
pub struct JsonLinesLogSource {
    dir: PathBuf,
}

impl JsonLinesLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn scan(
        dir: &Path,
        sources: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read log directory {:?}", dir))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .collect();
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let file = fs::File::open(&path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            for (line_no, raw) in BufReader::new(file).split(b'\n').enumerate() {
                let raw = raw.with_context(|| format!("Failed to read {:?}", path))?;
                let line = match std::str::from_utf8(&raw) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(
                            file = ?path,
                            line = line_no + 1,
                            error = %e,
                            "Skipping undecodable log line"
                        );
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = match serde_json::from_str(line) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(
                            file = ?path,
                            line = line_no + 1,
                            error = %e,
                            "Skipping malformed log line"
                        );
                        continue;
                    }
                };
                if entry.timestamp >= window_start
                    && entry.timestamp < window_end
                    && matches_sources(sources, &entry)
                {
                    entries.push(entry);
                }
            }
        }

        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }
}

#[async_trait]
impl LogSource for JsonLinesLogSource {
    async fn fetch_logs(
        &self,
        sources: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        let dir = self.dir.clone();
        let sources = sources.clone();
        let entries = tokio::task::spawn_blocking(move || {
            Self::scan(&dir, &sources, window_start, window_end)
        })
        .await
        .context("Log scan task panicked")??;

        debug!(dir = ?self.dir, count = entries.len(), "Fetched log entries");
        Ok(entries)
    }
}

/// Appends anomalies to a JSON-lines file
#[derive(Debug)]
pub struct JsonLinesAnomalySink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAnomalySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AnomalySink for JsonLinesAnomalySink {
    async fn persist_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        let mut line = serde_json::to_vec(anomaly).context("Failed to serialize anomaly")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open anomaly file {:?}", path))?;
            file.write_all(&line)?;
            file.flush()?;
            Ok(())
        })
        .await
        .context("Anomaly write task panicked")??;

        Ok(())
    }
}
