//! Multi-group registry service
//!
//! [`SchemaRegistry`] owns any number of independent groups. Each group gets
//! its own log and index from a [`StoreFactory`]; the group map is the only
//! state shared between groups.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::application::{
    ApplicationRegistry, GroupCodecProvider, GroupHistoryProvider, GroupPropertiesProvider,
};
use crate::compatibility::Compatibility;
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::group::Group;
use crate::log::{Log, MemoryLog, Position};
use crate::retry::Backoff;
use crate::storage::{MemoryTable, Table};
use crate::types::{
    CodecType, EncodingId, EncodingInfo, GroupProperties, SchemaEvolution, SchemaInfo,
    SchemaWithVersion, VersionInfo,
};

/// Creates the backing stores for groups and applications
pub trait StoreFactory: Send + Sync {
    fn create_log(&self, group_id: &str) -> Arc<dyn Log>;

    fn create_index_table(&self, group_id: &str) -> Arc<dyn Table>;

    fn create_application_table(&self) -> Arc<dyn Table>;
}

/// Stores held in process memory
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryStoreFactory;

impl StoreFactory for InMemoryStoreFactory {
    fn create_log(&self, _group_id: &str) -> Arc<dyn Log> {
        Arc::new(MemoryLog::new())
    }

    fn create_index_table(&self, _group_id: &str) -> Arc<dyn Table> {
        Arc::new(MemoryTable::new())
    }

    fn create_application_table(&self) -> Arc<dyn Table> {
        Arc::new(MemoryTable::new())
    }
}

/// The schema registry
pub struct SchemaRegistry {
    config: RegistryConfig,
    backoff: Backoff,
    name_pattern: Regex,
    factory: Arc<dyn StoreFactory>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    applications: Arc<dyn Table>,
}

impl SchemaRegistry {
    /// Registry backed by in-memory stores
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(InMemoryStoreFactory))
    }

    pub fn with_factory(config: RegistryConfig, factory: Arc<dyn StoreFactory>) -> Result<Self> {
        let name_pattern = config.groups.name_regex()?;
        // fail early on a bad default policy
        config.groups.properties()?;
        Ok(Self {
            backoff: Backoff::from(&config.retry),
            name_pattern,
            applications: factory.create_application_table(),
            factory,
            groups: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Application registry validating against this registry's groups
    pub fn applications(self: &Arc<Self>) -> ApplicationRegistry {
        ApplicationRegistry::with_provider(self.applications.clone(), self.backoff, self.clone())
    }

    fn validate_name(&self, kind: &str, name: &str) -> Result<()> {
        if self.name_pattern.is_match(name) {
            Ok(())
        } else {
            Err(RegistryError::InvalidName(format!(
                "{} {:?} does not match {}",
                kind,
                name,
                self.name_pattern.as_str()
            )))
        }
    }

    async fn group(&self, group_id: &str) -> Result<Arc<Group>> {
        self.groups
            .read()
            .await
            .get(group_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("group", group_id))
    }

    /// Create a group. Returns false if it already exists.
    ///
    /// Without explicit properties the configured group defaults apply.
    pub async fn create_group(
        &self,
        group_id: &str,
        properties: Option<GroupProperties>,
    ) -> Result<bool> {
        self.validate_name("group id", group_id)?;
        let properties = match properties {
            Some(properties) => properties,
            None => self.config.groups.properties()?,
        };

        let group = {
            let mut groups = self.groups.write().await;
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Group::new(
                        group_id,
                        self.factory.create_log(group_id),
                        self.factory.create_index_table(group_id),
                        self.backoff,
                    ))
                })
                .clone()
        };

        match group.create(properties).await {
            Ok(()) => Ok(true),
            Err(RegistryError::GroupAlreadyExists(_)) => {
                debug!(group = group_id, "group already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a group with its log, index and application memberships.
    /// Returns false if there was none.
    pub async fn delete_group(self: &Arc<Self>, group_id: &str) -> Result<bool> {
        let removed = self.groups.write().await.remove(group_id).is_some();
        if removed {
            self.applications().remove_group(group_id).await?;
            info!(group = group_id, "deleted group");
        }
        Ok(removed)
    }

    /// Ids of all created groups, sorted
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let groups: Vec<Arc<Group>> = self.groups.read().await.values().cloned().collect();
        let mut ids = Vec::with_capacity(groups.len());
        for group in groups {
            if group.is_created().await? {
                ids.push(group.id().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn get_group_properties(&self, group_id: &str) -> Result<GroupProperties> {
        self.group(group_id).await?.group_properties().await
    }

    /// Current etag of the group's log
    pub async fn get_group_etag(&self, group_id: &str) -> Result<Position> {
        self.group(group_id).await?.current_etag().await
    }

    pub async fn update_policy(
        &self,
        group_id: &str,
        policy: Compatibility,
        etag: Position,
    ) -> Result<Position> {
        self.group(group_id)
            .await?
            .update_validation_policy(policy, etag)
            .await
    }

    /// Register a schema, returning its version.
    ///
    /// A schema already present in the group (same name and bytes) returns
    /// its existing version. Without an etag the group's current one is used.
    pub async fn add_schema(
        &self,
        group_id: &str,
        schema: SchemaInfo,
        etag: Option<Position>,
    ) -> Result<VersionInfo> {
        self.validate_name("schema name", &schema.name)?;
        let group = self.group(group_id).await?;

        match group.get_version(&schema).await {
            Ok(existing) => {
                debug!(group = group_id, version = %existing, "schema already registered");
                return Ok(existing);
            }
            Err(RegistryError::DataNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let etag = match etag {
            Some(etag) => etag,
            None => group.current_etag().await?,
        };
        let version = group.next_version(&schema.name).await?;
        group.add_schema_to_group(schema, version, etag).await
    }

    /// Registered schemas in log order, optionally for one object type
    pub async fn get_schemas(
        &self,
        group_id: &str,
        object_type: Option<&str>,
    ) -> Result<Vec<SchemaWithVersion>> {
        let schemas = self.group(group_id).await?.get_schemas(None).await?;
        Ok(match object_type {
            Some(name) => schemas
                .into_iter()
                .filter(|s| s.version.schema_name == name)
                .collect(),
            None => schemas,
        })
    }

    pub async fn get_schema_for_version(
        &self,
        group_id: &str,
        version: &VersionInfo,
    ) -> Result<SchemaInfo> {
        self.group(group_id).await?.get_schema(version).await
    }

    pub async fn get_schema_version(
        &self,
        group_id: &str,
        schema: &SchemaInfo,
    ) -> Result<VersionInfo> {
        self.group(group_id).await?.get_version(schema).await
    }

    pub async fn get_latest_schema(
        &self,
        group_id: &str,
        object_type: Option<&str>,
    ) -> Result<SchemaWithVersion> {
        self.group(group_id)
            .await?
            .get_latest_schema(object_type)
            .await
    }

    pub async fn add_codec_type(&self, group_id: &str, codec: CodecType) -> Result<()> {
        self.group(group_id).await?.add_codec(codec).await
    }

    pub async fn get_codec_types(&self, group_id: &str) -> Result<Vec<CodecType>> {
        self.group(group_id).await?.codec_types().await
    }

    /// Encoding id for the pair, allocated on first request
    pub async fn get_encoding_id(
        &self,
        group_id: &str,
        version: &VersionInfo,
        codec: &CodecType,
    ) -> Result<EncodingId> {
        self.group(group_id)
            .await?
            .get_encoding_id(version, codec)
            .await
    }

    pub async fn get_encoding_info(&self, group_id: &str, id: EncodingId) -> Result<EncodingInfo> {
        self.group(group_id).await?.get_encoding_info(id).await
    }

    pub async fn get_group_history(
        &self,
        group_id: &str,
        object_type: Option<&str>,
    ) -> Result<Vec<SchemaEvolution>> {
        self.group(group_id).await?.get_history(object_type).await
    }
}

#[async_trait]
impl GroupPropertiesProvider for SchemaRegistry {
    async fn group_properties(&self, group_id: &str) -> Result<GroupProperties> {
        self.get_group_properties(group_id).await
    }
}

#[async_trait]
impl GroupHistoryProvider for SchemaRegistry {
    async fn group_history(&self, group_id: &str) -> Result<Vec<SchemaEvolution>> {
        self.get_group_history(group_id, None).await
    }
}

#[async_trait]
impl GroupCodecProvider for SchemaRegistry {
    async fn codec_types(&self, group_id: &str) -> Result<Vec<CodecType>> {
        self.get_codec_types(group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SerializationFormat;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(RegistryConfig::default()).unwrap()
    }

    fn json(name: &str, body: &str) -> SchemaInfo {
        SchemaInfo::new(name, SerializationFormat::Json, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_create_group_with_defaults() {
        let registry = registry();
        assert!(registry.create_group("events", None).await.unwrap());
        assert!(!registry.create_group("events", None).await.unwrap());

        let props = registry.get_group_properties("events").await.unwrap();
        assert_eq!(props.compatibility, Compatibility::Backward);
        assert_eq!(props.format, SerializationFormat::Any);
        assert_eq!(registry.list_groups().await.unwrap(), vec!["events".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.create_group("bad name!", None).await,
            Err(RegistryError::InvalidName(_))
        ));
        registry.create_group("ok", None).await.unwrap();
        assert!(matches!(
            registry.add_schema("ok", json("", "{}"), None).await,
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let registry = registry();
        assert!(matches!(
            registry.get_group_properties("missing").await,
            Err(RegistryError::DataNotFound { kind: "group", .. })
        ));
        assert!(registry.add_schema("missing", json("A", "{}"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_add_schema_is_idempotent() {
        let registry = registry();
        registry.create_group("events", None).await.unwrap();
        let first = registry.add_schema("events", json("Click", "{}"), None).await.unwrap();
        let etag = registry.get_group_etag("events").await.unwrap();

        let again = registry.add_schema("events", json("Click", "{}"), None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(registry.get_group_etag("events").await.unwrap(), etag);

        let next = registry
            .add_schema("events", json("Click", r#"{"v":1}"#), None)
            .await
            .unwrap();
        assert_eq!(next.version, 1);
        assert_eq!(registry.get_schemas("events", Some("Click")).await.unwrap().len(), 2);
        assert!(registry.get_schemas("events", Some("View")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_group() {
        let registry = Arc::new(registry());
        registry.create_group("tmp", None).await.unwrap();
        assert!(registry.delete_group("tmp").await.unwrap());
        assert!(!registry.delete_group("tmp").await.unwrap());
        assert!(registry.list_groups().await.unwrap().is_empty());
        // the id is free again
        assert!(registry.create_group("tmp", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_recreated_group_starts_without_members() {
        let registry = Arc::new(registry());
        let props = || {
            GroupProperties::new(SerializationFormat::Any, Compatibility::ForwardTransitive, false)
        };
        registry.create_group("g", Some(props())).await.unwrap();
        registry.add_codec_type("g", CodecType::new("none")).await.unwrap();
        let mut v3 = None;
        for i in 0..4 {
            let body = format!("a-{}", i);
            v3 = Some(registry.add_schema("g", json("A", &body), None).await.unwrap());
        }
        let v3 = v3.unwrap();

        let apps = registry.applications();
        apps.add_reader(
            "consumer",
            "r",
            "g",
            crate::application::Reader {
                versions: vec![v3],
                codecs: vec![CodecType::new("none")],
            },
            None,
        )
        .await
        .unwrap();

        assert!(registry.delete_group("g").await.unwrap());
        assert!(apps.list_readers("g").await.unwrap().is_empty());
        assert_eq!(apps.get_group_etag("g").await.unwrap(), None);
        let consumer = apps.get_application("consumer").await.unwrap();
        assert!(consumer.reading_from.is_empty());

        registry.create_group("g", Some(props())).await.unwrap();
        registry.add_codec_type("g", CodecType::new("none")).await.unwrap();
        let v0 = registry.add_schema("g", json("A", "fresh"), None).await.unwrap();
        assert_eq!(v0.version, 0);

        // nothing left over from the discarded group constrains the new writer
        apps.add_writer(
            "producer",
            "w",
            "g",
            crate::application::Writer {
                versions: vec![v0],
                codec: CodecType::new("none"),
            },
            None,
        )
        .await
        .unwrap();
        assert_eq!(apps.list_writers("g").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_applications_use_registry_groups() {
        let registry = Arc::new(registry());
        registry.create_group("events", None).await.unwrap();
        let v0 = registry.add_schema("events", json("Click", "{}"), None).await.unwrap();
        registry.add_codec_type("events", CodecType::new("none")).await.unwrap();

        let apps = registry.applications();
        apps.add_writer(
            "tracker",
            "clicks",
            "events",
            crate::application::Writer {
                versions: vec![v0.clone()],
                codec: CodecType::new("none"),
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(registry.applications().list_writers("events").await.unwrap().len(), 1);
    }
}
