//! Catch-up index over a group log
//!
//! The index holds queryable projections of the log. It is populated by
//! replaying log records from its synced-till marker; every derived write is
//! idempotent (insert-if-absent, set union, or newer-wins), so replays may
//! overlap and race without corrupting state. The index never runs ahead of
//! the log and its synced-till marker only moves forward.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::codec::{Record, FAMILY_INDEX_KEY, FAMILY_INDEX_VALUE};
use crate::compatibility::Compatibility;
use crate::error::{RegistryError, Result};
use crate::fingerprint::Fingerprint;
use crate::log::{Log, LogEntry, LogRecord, Position};
use crate::retry::Backoff;
use crate::storage::{merge_into, Table, TypedTable};
use crate::types::{CodecType, EncodingId, GroupProperties, VersionInfo};

/// Keys stored in a group index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum IndexKey {
    SyncedTill,
    GroupProperties,
    ValidationPolicy,
    /// Log position of a registered version
    Version { version: VersionInfo },
    Fingerprint { fingerprint: Fingerprint },
    /// Most recently registered version in the group
    LatestVersion,
    LatestVersionFor { schema_name: String },
    EncodingId { id: EncodingId },
    EncodingInfo { version: VersionInfo, codec: CodecType },
    LatestEncodingId,
    Codecs,
}

impl Record for IndexKey {
    const FAMILY: u8 = FAMILY_INDEX_KEY;
    const REVISION: u8 = 0;
}

/// Values stored in a group index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value", rename_all = "snake_case")]
pub enum IndexValue {
    Position { position: Position },
    Properties { properties: GroupProperties },
    Policy { compatibility: Compatibility, position: Position },
    Versions { versions: Vec<VersionInfo> },
    Latest { version: VersionInfo, position: Position },
    Encoding { version: VersionInfo, codec: CodecType },
    EncodingId { id: EncodingId },
    Codecs { codecs: Vec<CodecType> },
}

impl Record for IndexValue {
    const FAMILY: u8 = FAMILY_INDEX_VALUE;
    const REVISION: u8 = 0;
}

fn unexpected(key: &IndexKey, value: &IndexValue) -> RegistryError {
    RegistryError::Serialization(format!("unexpected value {:?} under {:?}", value, key))
}

/// Typed view of a group's index table
pub struct Index {
    table: TypedTable<IndexKey, IndexValue>,
}

impl Index {
    pub fn new(table: Arc<dyn Table>, backoff: Backoff) -> Self {
        Self {
            table: TypedTable::new(table, backoff),
        }
    }

    async fn get(&self, key: &IndexKey) -> Result<Option<IndexValue>> {
        self.table.get(key).await
    }

    pub async fn synced_till(&self) -> Result<Option<Position>> {
        let key = IndexKey::SyncedTill;
        match self.get(&key).await? {
            Some(IndexValue::Position { position }) => Ok(Some(position)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn group_properties(&self) -> Result<Option<GroupProperties>> {
        let key = IndexKey::GroupProperties;
        match self.get(&key).await? {
            Some(IndexValue::Properties { properties }) => Ok(Some(properties)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    /// Current policy and the log position of the record that set it
    pub async fn policy(&self) -> Result<Option<(Compatibility, Position)>> {
        let key = IndexKey::ValidationPolicy;
        match self.get(&key).await? {
            Some(IndexValue::Policy {
                compatibility,
                position,
            }) => Ok(Some((compatibility, position))),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn version_position(&self, version: &VersionInfo) -> Result<Option<Position>> {
        let key = IndexKey::Version {
            version: version.clone(),
        };
        match self.get(&key).await? {
            Some(IndexValue::Position { position }) => Ok(Some(position)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    /// Candidate versions whose schema bytes share `fingerprint`
    pub async fn versions_with_fingerprint(
        &self,
        fingerprint: Fingerprint,
    ) -> Result<Vec<VersionInfo>> {
        let key = IndexKey::Fingerprint { fingerprint };
        match self.get(&key).await? {
            Some(IndexValue::Versions { versions }) => Ok(versions),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(Vec::new()),
        }
    }

    /// Latest version overall, or for one object type
    pub async fn latest_version(&self, schema_name: Option<&str>) -> Result<Option<VersionInfo>> {
        let key = match schema_name {
            Some(name) => IndexKey::LatestVersionFor {
                schema_name: name.to_string(),
            },
            None => IndexKey::LatestVersion,
        };
        match self.get(&key).await? {
            Some(IndexValue::Latest { version, .. }) => Ok(Some(version)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn encoding(&self, id: EncodingId) -> Result<Option<(VersionInfo, CodecType)>> {
        let key = IndexKey::EncodingId { id };
        match self.get(&key).await? {
            Some(IndexValue::Encoding { version, codec }) => Ok(Some((version, codec))),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn encoding_id(
        &self,
        version: &VersionInfo,
        codec: &CodecType,
    ) -> Result<Option<EncodingId>> {
        let key = IndexKey::EncodingInfo {
            version: version.clone(),
            codec: codec.clone(),
        };
        match self.get(&key).await? {
            Some(IndexValue::EncodingId { id }) => Ok(Some(id)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn latest_encoding_id(&self) -> Result<Option<EncodingId>> {
        let key = IndexKey::LatestEncodingId;
        match self.get(&key).await? {
            Some(IndexValue::EncodingId { id }) => Ok(Some(id)),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(None),
        }
    }

    pub async fn codecs(&self) -> Result<Vec<CodecType>> {
        let key = IndexKey::Codecs;
        match self.get(&key).await? {
            Some(IndexValue::Codecs { codecs }) => Ok(codecs),
            Some(other) => Err(unexpected(&key, &other)),
            None => Ok(Vec::new()),
        }
    }

    /// Every entry, ordered by encoded key
    pub async fn snapshot(&self) -> Result<Vec<(IndexKey, IndexValue)>> {
        self.table.scan(|_| true).await
    }

    /// Replay the log from the synced-till marker. Returns the number of records applied.
    pub async fn sync(&self, log: &dyn Log) -> Result<usize> {
        let from = self.synced_till().await?;
        let entries = log.read_from(from).await?;
        self.replay(&entries).await?;
        if !entries.is_empty() {
            debug!(
                from = ?from,
                records = entries.len(),
                "index caught up with log"
            );
        }
        Ok(entries.len())
    }

    /// Apply a run of log entries, then advance the synced-till marker past the last one
    pub async fn replay(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.apply(entry).await?;
        }
        if let Some(last) = entries.last() {
            self.advance_synced_till(last.next).await?;
        }
        Ok(())
    }

    async fn advance_synced_till(&self, next: Position) -> Result<()> {
        let value = IndexValue::Position { position: next };
        self.table
            .get_and_set_if_newer(&IndexKey::SyncedTill, value, |new, old| match (new, old) {
                (
                    IndexValue::Position { position: new },
                    IndexValue::Position { position: old },
                ) => new > old,
                _ => true,
            })
            .await?;
        Ok(())
    }

    /// Derive the index writes for one log entry
    pub async fn apply(&self, entry: &LogEntry) -> Result<()> {
        match &entry.record {
            LogRecord::GroupProperties { properties } => {
                self.table
                    .add_if_absent(
                        &IndexKey::GroupProperties,
                        &IndexValue::Properties {
                            properties: properties.clone(),
                        },
                    )
                    .await?;
                self.set_policy_if_newer(&properties.compatibility, entry.position).await
            }
            LogRecord::ValidationPolicy { compatibility } => {
                self.set_policy_if_newer(compatibility, entry.position).await
            }
            LogRecord::SchemaRegistered { schema, version, .. } => {
                self.table
                    .add_if_absent(
                        &IndexKey::Version {
                            version: version.clone(),
                        },
                        &IndexValue::Position {
                            position: entry.position,
                        },
                    )
                    .await?;
                self.add_fingerprint(schema.fingerprint(), version).await?;
                self.set_latest_if_newer(
                    IndexKey::LatestVersionFor {
                        schema_name: version.schema_name.clone(),
                    },
                    version,
                    entry.position,
                )
                .await?;
                self.set_latest_if_newer(IndexKey::LatestVersion, version, entry.position)
                    .await
            }
            LogRecord::EncodingAssigned { id, version, codec } => {
                self.table
                    .add_if_absent(
                        &IndexKey::EncodingId { id: *id },
                        &IndexValue::Encoding {
                            version: version.clone(),
                            codec: codec.clone(),
                        },
                    )
                    .await?;
                self.table
                    .add_if_absent(
                        &IndexKey::EncodingInfo {
                            version: version.clone(),
                            codec: codec.clone(),
                        },
                        &IndexValue::EncodingId { id: *id },
                    )
                    .await?;
                let latest = IndexValue::EncodingId { id: *id };
                self.table
                    .get_and_set_if_newer(&IndexKey::LatestEncodingId, latest, |new, old| {
                        match (new, old) {
                            (
                                IndexValue::EncodingId { id: new },
                                IndexValue::EncodingId { id: old },
                            ) => new > old,
                            _ => true,
                        }
                    })
                    .await?;
                Ok(())
            }
            LogRecord::CodecRegistered { codec } => {
                self.table
                    .update(&IndexKey::Codecs, |current| {
                        let codecs: &[CodecType] = match current {
                            Some(IndexValue::Codecs { codecs }) => codecs.as_slice(),
                            _ => &[],
                        };
                        merge_into(codecs, codec).map(|codecs| IndexValue::Codecs { codecs })
                    })
                    .await?;
                Ok(())
            }
        }
    }

    pub(crate) async fn add_fingerprint(
        &self,
        fingerprint: Fingerprint,
        version: &VersionInfo,
    ) -> Result<()> {
        self.table
            .update(&IndexKey::Fingerprint { fingerprint }, |current| {
                let versions: &[VersionInfo] = match current {
                    Some(IndexValue::Versions { versions }) => versions.as_slice(),
                    _ => &[],
                };
                merge_into(versions, version).map(|versions| IndexValue::Versions { versions })
            })
            .await?;
        Ok(())
    }

    /// Policy pointer moves only to a strictly later log position
    async fn set_policy_if_newer(
        &self,
        compatibility: &Compatibility,
        position: Position,
    ) -> Result<()> {
        let value = IndexValue::Policy {
            compatibility: compatibility.clone(),
            position,
        };
        self.table
            .get_and_set_if_newer(&IndexKey::ValidationPolicy, value, |new, old| match (new, old) {
                (
                    IndexValue::Policy { position: new, .. },
                    IndexValue::Policy { position: old, .. },
                ) => new > old,
                _ => true,
            })
            .await?;
        Ok(())
    }

    /// Latest markers move only to a strictly later log position
    async fn set_latest_if_newer(
        &self,
        key: IndexKey,
        version: &VersionInfo,
        position: Position,
    ) -> Result<()> {
        let value = IndexValue::Latest {
            version: version.clone(),
            position,
        };
        self.table
            .get_and_set_if_newer(&key, value, |new, old| match (new, old) {
                (
                    IndexValue::Latest { position: new, .. },
                    IndexValue::Latest { position: old, .. },
                ) => new > old,
                _ => true,
            })
            .await?;
        Ok(())
    }
}
