//! Schema group: orchestration of one group's log and index
//!
//! Writes append to the log under the caller's etag and then index the new
//! record directly. Reads go to the index first and fall back to a single
//! catch-up sync when the lookup misses.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compatibility::Compatibility;
use crate::error::{RegistryError, Result};
use crate::index::Index;
use crate::log::{Log, LogEntry, LogRecord, Position};
use crate::retry::{retry_on_conflict, Backoff};
use crate::storage::Table;
use crate::types::{
    CodecType, EncodingId, EncodingInfo, GroupProperties, SchemaEvolution, SchemaInfo,
    SchemaWithVersion, VersionInfo,
};

/// One schema group
pub struct Group {
    id: String,
    log: Arc<dyn Log>,
    index: Index,
    backoff: Backoff,
}

impl Group {
    pub fn new(
        id: impl Into<String>,
        log: Arc<dyn Log>,
        table: Arc<dyn Table>,
        backoff: Backoff,
    ) -> Self {
        Self {
            id: id.into(),
            log,
            index: Index::new(table, backoff),
            backoff,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The group's index
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Catch the index up with the log
    pub async fn sync_index(&self) -> Result<usize> {
        self.index.sync(self.log.as_ref()).await
    }

    /// Look up through the index, syncing once on a miss
    async fn read_through<T, F, Fut>(&self, read: F) -> Result<Option<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(found) = read().await? {
            return Ok(Some(found));
        }
        self.sync_index().await?;
        read().await
    }

    /// Append at `etag` and index the new record.
    ///
    /// Once the log accepts the record the write has happened; an index
    /// failure after that is left for the next sync to repair.
    async fn append(&self, record: LogRecord, etag: Position) -> Result<Position> {
        let next = self.log.append(&record, etag).await?;
        let kind = record.kind();
        let entry = LogEntry {
            record,
            position: etag,
            next,
        };
        if let Err(e) = self.index.apply(&entry).await {
            warn!(
                group = %self.id,
                kind,
                position = %etag,
                error = %e,
                "indexing appended record failed"
            );
        }
        Ok(next)
    }

    /// Current end of the log, used as the write-conflict token
    pub async fn current_etag(&self) -> Result<Position> {
        self.log.current_position().await
    }

    pub async fn is_created(&self) -> Result<bool> {
        Ok(self.current_etag().await? > Position::START)
    }

    /// Write the group's first record
    pub async fn create(&self, properties: GroupProperties) -> Result<()> {
        let record = LogRecord::GroupProperties { properties };
        match self.append(record, Position::START).await {
            Ok(_) => {
                info!(group = %self.id, "created group");
                Ok(())
            }
            Err(e) if e.is_write_conflict() => {
                Err(RegistryError::GroupAlreadyExists(self.id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Group properties with the policy currently in force
    pub async fn group_properties(&self) -> Result<GroupProperties> {
        let mut properties = self
            .read_through(|| self.index.group_properties())
            .await?
            .ok_or_else(|| RegistryError::not_found("group", &self.id))?;
        if let Some((policy, _)) = self.index.policy().await? {
            properties.compatibility = policy;
        }
        Ok(properties)
    }

    /// Replace the validation policy. Fails with a write conflict if `etag` is stale.
    pub async fn update_validation_policy(
        &self,
        compatibility: Compatibility,
        etag: Position,
    ) -> Result<Position> {
        self.group_properties().await?;
        let name = compatibility.name();
        let next = self
            .append(LogRecord::ValidationPolicy { compatibility }, etag)
            .await?;
        info!(group = %self.id, policy = name, "updated validation policy");
        Ok(next)
    }

    /// Register a codec with the group. Registering a known codec is a no-op.
    pub async fn add_codec(&self, codec: CodecType) -> Result<()> {
        let codec = &codec;
        retry_on_conflict(&self.backoff, "add codec", || async move {
            let etag = self.current_etag().await?;
            self.sync_index().await?;
            if self.index.codecs().await?.contains(codec) {
                return Ok(());
            }
            self.append(LogRecord::CodecRegistered { codec: codec.clone() }, etag)
                .await?;
            debug!(group = %self.id, codec = %codec, "registered codec");
            Ok(())
        })
        .await
    }

    /// Every codec registered with the group.
    ///
    /// Always syncs first: a hit on a lagging index would be an incomplete list.
    pub async fn codec_types(&self) -> Result<Vec<CodecType>> {
        self.sync_index().await?;
        self.index.codecs().await
    }

    /// Version the next registration of `schema_name` should get.
    ///
    /// Always syncs first, since a lagging index still answers with an older
    /// latest version.
    pub async fn next_version(&self, schema_name: &str) -> Result<VersionInfo> {
        let properties = self.group_properties().await?;
        self.sync_index().await?;
        let scope = properties.validate_by_object_type.then_some(schema_name);
        let next = match self.index.latest_version(scope).await? {
            Some(latest) => latest.version + 1,
            None => 0,
        };
        Ok(VersionInfo::new(schema_name, next))
    }

    /// Append a schema registration at `etag`.
    ///
    /// `version` must be the next version in the schema's scope; a mismatch
    /// means the caller's view is stale and is reported as a write conflict.
    pub async fn add_schema_to_group(
        &self,
        schema: SchemaInfo,
        version: VersionInfo,
        etag: Position,
    ) -> Result<VersionInfo> {
        let properties = self.group_properties().await?;
        if !properties.format.admits(&schema.format) {
            return Err(RegistryError::SchemaTypeMismatch {
                expected: properties.format.to_string(),
                actual: schema.format.to_string(),
            });
        }

        let expected = self.next_version(&schema.name).await?;
        if version != expected {
            return Err(RegistryError::conflict(format!(
                "schema version {} (next is {})",
                version, expected
            )));
        }

        let record = LogRecord::SchemaRegistered {
            schema,
            version: version.clone(),
            timestamp: Utc::now(),
        };
        self.append(record, etag).await?;
        info!(group = %self.id, version = %version, "registered schema");
        Ok(version)
    }

    /// Stored schema of a registered version
    pub async fn get_schema(&self, version: &VersionInfo) -> Result<SchemaInfo> {
        let position = self
            .read_through(|| self.index.version_position(version))
            .await?
            .ok_or_else(|| RegistryError::not_found("schema version", version))?;
        match self.log.read_at(position).await? {
            LogRecord::SchemaRegistered { schema, .. } => Ok(schema),
            other => Err(RegistryError::Serialization(format!(
                "version {} points at a {} record",
                version,
                other.kind()
            ))),
        }
    }

    /// Version under which `schema` was registered.
    ///
    /// Fingerprint matches are confirmed by comparing name and bytes.
    pub async fn get_version(&self, schema: &SchemaInfo) -> Result<VersionInfo> {
        if let Some(version) = self.find_version(schema).await? {
            return Ok(version);
        }
        self.sync_index().await?;
        self.find_version(schema)
            .await?
            .ok_or_else(|| RegistryError::not_found("schema", &schema.name))
    }

    async fn find_version(&self, schema: &SchemaInfo) -> Result<Option<VersionInfo>> {
        for candidate in self.index.versions_with_fingerprint(schema.fingerprint()).await? {
            if candidate.schema_name != schema.name {
                continue;
            }
            if self.get_schema(&candidate).await?.same_content(schema) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Most recent registration, overall or for one object type.
    ///
    /// Syncs first for the same reason as [`Group::next_version`].
    pub async fn get_latest_schema(&self, schema_name: Option<&str>) -> Result<SchemaWithVersion> {
        self.sync_index().await?;
        let version = self
            .index
            .latest_version(schema_name)
            .await?
            .ok_or_else(|| {
                RegistryError::not_found("schema", schema_name.unwrap_or(self.id.as_str()))
            })?;
        let schema = self.get_schema(&version).await?;
        Ok(SchemaWithVersion { schema, version })
    }

    /// Registered schemas in log order, starting at `from` if given
    pub async fn get_schemas(&self, from: Option<&VersionInfo>) -> Result<Vec<SchemaWithVersion>> {
        let start = match from {
            Some(version) => Some(
                self.read_through(|| self.index.version_position(version))
                    .await?
                    .ok_or_else(|| RegistryError::not_found("schema version", version))?,
            ),
            None => None,
        };

        Ok(self
            .log
            .read_from(start)
            .await?
            .into_iter()
            .filter_map(|entry| match entry.record {
                LogRecord::SchemaRegistered { schema, version, .. } => {
                    Some(SchemaWithVersion { schema, version })
                }
                _ => None,
            })
            .collect())
    }

    /// Evolution history, optionally restricted to one object type.
    ///
    /// Each entry carries the policy set by the closest preceding policy
    /// record, the group's initial policy being the first.
    pub async fn get_history(&self, schema_name: Option<&str>) -> Result<Vec<SchemaEvolution>> {
        let mut policy: Option<Compatibility> = None;
        let mut history = Vec::new();

        for entry in self.log.read_from(None).await? {
            match entry.record {
                LogRecord::GroupProperties { properties } => {
                    policy = Some(properties.compatibility)
                }
                LogRecord::ValidationPolicy { compatibility } => policy = Some(compatibility),
                LogRecord::SchemaRegistered {
                    schema,
                    version,
                    timestamp,
                } => {
                    if schema_name.is_some_and(|name| name != version.schema_name) {
                        continue;
                    }
                    let compatibility = policy
                        .clone()
                        .ok_or_else(|| RegistryError::not_found("group", &self.id))?;
                    history.push(SchemaEvolution {
                        schema,
                        version,
                        compatibility,
                        timestamp,
                    });
                }
                LogRecord::EncodingAssigned { .. } | LogRecord::CodecRegistered { .. } => {}
            }
        }
        Ok(history)
    }

    /// Whether the group knows `codec`, syncing once if the index does not
    async fn has_codec(&self, codec: &CodecType) -> Result<bool> {
        if self.index.codecs().await?.contains(codec) {
            return Ok(true);
        }
        self.sync_index().await?;
        Ok(self.index.codecs().await?.contains(codec))
    }

    /// Encoding id for a (version, codec) pair, allocating the next id on first use
    pub async fn get_encoding_id(
        &self,
        version: &VersionInfo,
        codec: &CodecType,
    ) -> Result<EncodingId> {
        if !self.has_codec(codec).await? {
            return Err(RegistryError::CodecNotFound(codec.name.clone()));
        }
        if let Some(id) = self.index.encoding_id(version, codec).await? {
            return Ok(id);
        }
        self.get_schema(version).await?;

        retry_on_conflict(&self.backoff, "allocate encoding id", || async move {
            let etag = self.current_etag().await?;
            self.sync_index().await?;
            if let Some(id) = self.index.encoding_id(version, codec).await? {
                return Ok(id);
            }

            let id = match self.index.latest_encoding_id().await? {
                Some(EncodingId(latest)) => EncodingId(latest + 1),
                None => EncodingId(0),
            };
            let record = LogRecord::EncodingAssigned {
                id,
                version: version.clone(),
                codec: codec.clone(),
            };
            self.append(record, etag).await?;
            debug!(
                group = %self.id,
                id = %id,
                version = %version,
                codec = %codec,
                "assigned encoding id"
            );
            Ok(id)
        })
        .await
    }

    pub async fn get_encoding_info(&self, id: EncodingId) -> Result<EncodingInfo> {
        let (version, codec) = self
            .read_through(|| self.index.encoding(id))
            .await?
            .ok_or_else(|| RegistryError::not_found("encoding id", id))?;
        let schema = self.get_schema(&version).await?;
        Ok(EncodingInfo { version, schema, codec })
    }

    /// Highest allocated encoding id. Syncs first, like [`Group::next_version`].
    pub async fn latest_encoding_id(&self) -> Result<Option<EncodingId>> {
        self.sync_index().await?;
        self.index.latest_encoding_id().await
    }
}
