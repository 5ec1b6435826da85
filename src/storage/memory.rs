//! In-memory table implementation

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{Expected, KeyVersion, Table, Versioned};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Vec<u8>, (Vec<u8>, KeyVersion)>,
    next_version: u64,
}

/// Table kept in a sorted map; version tokens come from a table-wide counter
#[derive(Default)]
pub struct MemoryTable {
    inner: RwLock<Inner>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Table for MemoryTable {
    async fn get_with_version(&self, key: &[u8]) -> Result<Option<Versioned<Vec<u8>>>> {
        let inner = self.inner.read().await;
        Ok(inner.entries.get(key).map(|(value, version)| Versioned {
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(&self, key: &[u8], value: Vec<u8>, expected: Expected) -> Result<KeyVersion> {
        let mut inner = self.inner.write().await;
        let current = inner.entries.get(key).map(|(_, version)| *version);
        expected.check(key, current)?;

        inner.next_version += 1;
        let version = KeyVersion(inner.next_version);
        inner.entries.insert(key.to_vec(), (value, version));
        Ok(version)
    }

    async fn delete(&self, key: &[u8], expected: Expected) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = inner.entries.get(key).map(|(_, version)| *version);
        if current.is_none() && expected == Expected::Any {
            return Ok(());
        }
        expected.check(key, current)?;
        inner.entries.remove(key);
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }
}
