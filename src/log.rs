//! Positioned append-only log of group records
//!
//! The log is the source of truth for a group. Every accepted record gets a
//! [`Position`]; appends are conditional on the caller's expected position,
//! which doubles as the group's write-conflict token (etag).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use tracing::trace;

use crate::codec::{self, Record, FAMILY_LOG_RECORD};
use crate::compatibility::Compatibility;
use crate::error::{RegistryError, Result};
use crate::types::{CodecType, EncodingId, GroupProperties, SchemaInfo, VersionInfo};

/// Totally ordered cursor into a group log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position(u64);

impl Position {
    /// Position of the first record; also the etag of an empty log
    pub const START: Position = Position(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Position {
        Position(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A record in a group log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    /// First record of every group
    GroupProperties { properties: GroupProperties },
    ValidationPolicy { compatibility: Compatibility },
    SchemaRegistered {
        schema: SchemaInfo,
        version: VersionInfo,
        timestamp: DateTime<Utc>,
    },
    EncodingAssigned {
        id: EncodingId,
        version: VersionInfo,
        codec: CodecType,
    },
    CodecRegistered { codec: CodecType },
}

impl Record for LogRecord {
    const FAMILY: u8 = FAMILY_LOG_RECORD;
    const REVISION: u8 = 0;
}

impl LogRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::GroupProperties { .. } => "group_properties",
            LogRecord::ValidationPolicy { .. } => "validation_policy",
            LogRecord::SchemaRegistered { .. } => "schema_registered",
            LogRecord::EncodingAssigned { .. } => "encoding_assigned",
            LogRecord::CodecRegistered { .. } => "codec_registered",
        }
    }
}

/// A record read back with its position and the position following it
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub record: LogRecord,
    pub position: Position,
    pub next: Position,
}

/// Append-only positioned log
#[async_trait]
pub trait Log: Send + Sync {
    /// Append `record` if the log currently ends at `expected`.
    ///
    /// The record lands at `expected`; the returned position is the new end
    /// of the log. A stale `expected` is a [`RegistryError::WriteConflict`].
    async fn append(&self, record: &LogRecord, expected: Position) -> Result<Position>;

    /// Records at or after `from`, in order. `None` reads from the beginning.
    async fn read_from(&self, from: Option<Position>) -> Result<Vec<LogEntry>>;

    /// The record stored at `position`
    async fn read_at(&self, position: Position) -> Result<LogRecord>;

    /// End of the log: the position the next record will get
    async fn current_position(&self) -> Result<Position>;
}

/// Log held in memory as encoded records
#[derive(Default)]
pub struct MemoryLog {
    records: RwLock<Vec<Vec<u8>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn append(&self, record: &LogRecord, expected: Position) -> Result<Position> {
        let encoded = codec::encode(record)?;
        let mut records = self.records.write().await;
        let end = Position(records.len() as u64);
        if end != expected {
            return Err(RegistryError::conflict(format!(
                "log position (expected {}, at {})",
                expected, end
            )));
        }
        records.push(encoded);
        trace!(kind = record.kind(), position = %end, "appended log record");
        Ok(end.next())
    }

    async fn read_from(&self, from: Option<Position>) -> Result<Vec<LogEntry>> {
        let records = self.records.read().await;
        let start = from.unwrap_or(Position::START).offset() as usize;
        records
            .iter()
            .enumerate()
            .skip(start)
            .map(|(offset, bytes)| {
                let position = Position(offset as u64);
                Ok(LogEntry {
                    record: codec::decode(bytes)?,
                    position,
                    next: position.next(),
                })
            })
            .collect()
    }

    async fn read_at(&self, position: Position) -> Result<LogRecord> {
        let records = self.records.read().await;
        let bytes = records
            .get(position.offset() as usize)
            .ok_or_else(|| RegistryError::not_found("log record", position))?;
        codec::decode(bytes)
    }

    async fn current_position(&self) -> Result<Position> {
        Ok(Position(self.records.read().await.len() as u64))
    }
}
