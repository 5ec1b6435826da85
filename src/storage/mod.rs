//! Key/value table primitive
//!
//! Tables hold opaque byte keys and values with a per-key version token.
//! The only hard requirement on an implementation is linearizable
//! compare-and-swap per key. [`TypedTable`] layers record encoding and the
//! retried read-modify-write helpers on top.

mod memory;

pub use memory::MemoryTable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec::{self, Record};
use crate::error::{RegistryError, Result};
use crate::retry::{retry_on_conflict, Backoff};

/// Version token of a table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyVersion(pub u64);

/// Precondition for a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The key must not exist
    Absent,
    /// The key must exist at exactly this version
    Version(KeyVersion),
    /// No precondition
    Any,
}

/// A value together with its version token
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: KeyVersion,
}

/// Filter over raw keys used by [`Table::scan_filtered`]
pub type KeyFilter<'a> = &'a (dyn Fn(&[u8]) -> bool + Send + Sync);

/// Storage interface shared by indexes and the application registry
#[async_trait]
pub trait Table: Send + Sync {
    async fn get_with_version(&self, key: &[u8]) -> Result<Option<Versioned<Vec<u8>>>>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_with_version(key).await?.map(|v| v.value))
    }

    /// Conditional write; a failed precondition is a [`RegistryError::WriteConflict`]
    async fn put(&self, key: &[u8], value: Vec<u8>, expected: Expected) -> Result<KeyVersion>;

    /// Insert unless the key exists. Returns whether the value was written.
    async fn add_if_absent(&self, key: &[u8], value: Vec<u8>) -> Result<bool> {
        match self.put(key, value, Expected::Absent).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_write_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &[u8], expected: Expected) -> Result<()>;

    async fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn scan_filtered(&self, filter: KeyFilter<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .scan_all()
            .await?
            .into_iter()
            .filter(|(k, _)| filter(k))
            .collect())
    }
}

/// Table of encoded records keyed by encoded records
pub struct TypedTable<K, V> {
    table: Arc<dyn Table>,
    backoff: Backoff,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> TypedTable<K, V>
where
    K: Record + Send + Sync,
    V: Record + Send + Sync,
{
    pub fn new(table: Arc<dyn Table>, backoff: Backoff) -> Self {
        Self {
            table,
            backoff,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let raw = self.table.get(&codec::encode(key)?).await?;
        raw.map(|bytes| codec::decode(&bytes)).transpose()
    }

    pub async fn get_with_version(&self, key: &K) -> Result<Option<Versioned<V>>> {
        self.get_raw_with_version(&codec::encode(key)?).await
    }

    async fn get_raw_with_version(&self, key: &[u8]) -> Result<Option<Versioned<V>>> {
        match self.table.get_with_version(key).await? {
            Some(entry) => Ok(Some(Versioned {
                value: codec::decode(&entry.value)?,
                version: entry.version,
            })),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &K, value: &V, expected: Expected) -> Result<KeyVersion> {
        self.table
            .put(&codec::encode(key)?, codec::encode(value)?, expected)
            .await
    }

    pub async fn add_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        self.table
            .add_if_absent(&codec::encode(key)?, codec::encode(value)?)
            .await
    }

    pub async fn delete(&self, key: &K, expected: Expected) -> Result<()> {
        self.table.delete(&codec::encode(key)?, expected).await
    }

    /// Decoded entries whose key satisfies `filter`
    pub async fn scan<F>(&self, filter: F) -> Result<Vec<(K, V)>>
    where
        F: Fn(&K) -> bool,
    {
        let mut out = Vec::new();
        for (raw_key, raw_value) in self.table.scan_all().await? {
            let key: K = codec::decode(&raw_key)?;
            if filter(&key) {
                out.push((key, codec::decode(&raw_value)?));
            }
        }
        Ok(out)
    }

    /// Read-modify-write of one key, retried with backoff on conflict.
    ///
    /// `f` sees the current value (if any) and returns the replacement, or
    /// `None` to leave the entry untouched. Returns whether a write happened.
    pub async fn update<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: Fn(Option<&V>) -> Option<V> + Sync,
    {
        let raw_key = codec::encode(key)?;
        let raw_key = raw_key.as_slice();
        let f = &f;
        retry_on_conflict(&self.backoff, "table update", || async move {
            let current = self.get_raw_with_version(raw_key).await?;
            let (replacement, expected) = match &current {
                Some(entry) => (f(Some(&entry.value)), Expected::Version(entry.version)),
                None => (f(None), Expected::Absent),
            };
            match replacement {
                Some(value) => {
                    self.table.put(raw_key, codec::encode(&value)?, expected).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
    }

    /// Store `value` unless the current value is at least as new.
    ///
    /// Safe to race: the last writer can only move the entry forward.
    pub async fn get_and_set_if_newer<F>(&self, key: &K, value: V, is_newer: F) -> Result<bool>
    where
        F: Fn(&V, &V) -> bool + Sync,
        V: Clone,
    {
        self.update(key, |current| match current {
            Some(existing) if !is_newer(&value, existing) => None,
            _ => Some(value.clone()),
        })
        .await
    }
}

/// Add `item` to `list` unless present. Returns whether the list changed.
pub(crate) fn merge_into<T: PartialEq + Clone>(list: &[T], item: &T) -> Option<Vec<T>> {
    if list.contains(item) {
        None
    } else {
        let mut merged = list.to_vec();
        merged.push(item.clone());
        Some(merged)
    }
}

impl From<KeyVersion> for Expected {
    fn from(version: KeyVersion) -> Self {
        Expected::Version(version)
    }
}

impl Expected {
    /// Precondition matching an optional observed version
    pub fn from_observed(version: Option<KeyVersion>) -> Self {
        version.map_or(Expected::Absent, Expected::Version)
    }

    pub(crate) fn check(&self, key: &[u8], current: Option<KeyVersion>) -> Result<()> {
        let ok = match (self, current) {
            (Expected::Any, _) => true,
            (Expected::Absent, None) => true,
            (Expected::Version(want), Some(have)) => *want == have,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(RegistryError::conflict(String::from_utf8_lossy(key)))
        }
    }
}
