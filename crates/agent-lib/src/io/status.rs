//! Status publisher implementations

use super::StatusPublisher;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// In-process status store, last write wins per key
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: DashMap<String, serde_json::Value>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StatusPublisher for MemoryStatusStore {
    async fn publish(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusPublisher;

#[async_trait]
impl StatusPublisher for NoopStatusPublisher {
    async fn publish(&self, _key: &str, _value: serde_json::Value) -> Result<()> {
        Ok(())
    }
}
