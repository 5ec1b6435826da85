//! Application registry
//!
//! Tracks which applications write to and read from which groups, and admits
//! a new writer or reader only if it passes the group's compatibility policy
//! and the codec gate against the other side.
//!
//! All writers and readers of one group live in a single entry, so admitting
//! a member is one conditional write. The entry's version token is the
//! group's application etag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::codec::{Record, FAMILY_APP_KEY, FAMILY_APP_VALUE};
use crate::compatibility::{check_reader_codecs, check_writer_codec, CompatibilityChecker};
use crate::error::{RegistryError, Result};
use crate::retry::Backoff;
use crate::storage::{Expected, KeyVersion, Table, TypedTable};
use crate::types::{CodecType, GroupProperties, SchemaEvolution, VersionInfo};

/// Supplies a group's current properties
#[async_trait]
pub trait GroupPropertiesProvider: Send + Sync {
    async fn group_properties(&self, group_id: &str) -> Result<GroupProperties>;
}

/// Supplies a group's evolution history in log order
#[async_trait]
pub trait GroupHistoryProvider: Send + Sync {
    async fn group_history(&self, group_id: &str) -> Result<Vec<SchemaEvolution>>;
}

/// Supplies the codecs registered with a group
#[async_trait]
pub trait GroupCodecProvider: Send + Sync {
    async fn codec_types(&self, group_id: &str) -> Result<Vec<CodecType>>;
}

/// An application and the groups it writes to or reads from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    /// writer id -> group id
    #[serde(default)]
    pub writing_to: BTreeMap<String, String>,
    /// reader id -> group id
    #[serde(default)]
    pub reading_from: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Application {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Versions an application writes, and the codec it compresses with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Writer {
    pub versions: Vec<VersionInfo>,
    pub codec: CodecType,
}

/// Versions an application reads, and the codecs it can decode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
    pub versions: Vec<VersionInfo>,
    pub codecs: Vec<CodecType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterEntry {
    pub app_id: String,
    pub writer_id: String,
    pub writer: Writer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderEntry {
    pub app_id: String,
    pub reader_id: String,
    pub reader: Reader,
}

/// Writers and readers registered with one group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupMembers {
    #[serde(default)]
    pub writers: Vec<WriterEntry>,
    #[serde(default)]
    pub readers: Vec<ReaderEntry>,
}

impl GroupMembers {
    fn writer_versions(&self) -> Vec<VersionInfo> {
        self.writers
            .iter()
            .flat_map(|w| w.writer.versions.iter().cloned())
            .collect()
    }

    fn reader_versions(&self) -> Vec<VersionInfo> {
        self.readers
            .iter()
            .flat_map(|r| r.reader.versions.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum AppKey {
    Application { id: String },
    GroupMembers { group_id: String },
}

impl Record for AppKey {
    const FAMILY: u8 = FAMILY_APP_KEY;
    const REVISION: u8 = 0;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "value", rename_all = "snake_case")]
pub enum AppValue {
    Application { application: Application },
    Members { members: GroupMembers },
}

impl Record for AppValue {
    const FAMILY: u8 = FAMILY_APP_VALUE;
    const REVISION: u8 = 0;
}

/// Registry of applications and their group memberships
pub struct ApplicationRegistry {
    table: TypedTable<AppKey, AppValue>,
    properties: Arc<dyn GroupPropertiesProvider>,
    history: Arc<dyn GroupHistoryProvider>,
    codecs: Arc<dyn GroupCodecProvider>,
}

impl ApplicationRegistry {
    pub fn new(
        table: Arc<dyn Table>,
        backoff: Backoff,
        properties: Arc<dyn GroupPropertiesProvider>,
        history: Arc<dyn GroupHistoryProvider>,
        codecs: Arc<dyn GroupCodecProvider>,
    ) -> Self {
        Self {
            table: TypedTable::new(table, backoff),
            properties,
            history,
            codecs,
        }
    }

    /// Use one object for all three group data sources
    pub fn with_provider<P>(table: Arc<dyn Table>, backoff: Backoff, provider: Arc<P>) -> Self
    where
        P: GroupPropertiesProvider + GroupHistoryProvider + GroupCodecProvider + 'static,
    {
        Self::new(table, backoff, provider.clone(), provider.clone(), provider)
    }

    /// Create an application. Returns false if it already exists.
    pub async fn create_application(
        &self,
        id: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<bool> {
        let application = Application {
            properties,
            ..Application::new(id)
        };
        let created = self
            .table
            .add_if_absent(
                &AppKey::Application { id: id.to_string() },
                &AppValue::Application { application },
            )
            .await?;
        if created {
            info!(app = id, "created application");
        }
        Ok(created)
    }

    pub async fn get_application(&self, id: &str) -> Result<Application> {
        let key = AppKey::Application { id: id.to_string() };
        match self.table.get(&key).await? {
            Some(AppValue::Application { application }) => Ok(application),
            Some(other) => Err(unexpected(&key, &other)),
            None => Err(RegistryError::not_found("application", id)),
        }
    }

    /// Version token of the group's membership entry, `None` before the first member joins
    pub async fn get_group_etag(&self, group_id: &str) -> Result<Option<KeyVersion>> {
        Ok(self.members(group_id).await?.map(|(_, version)| version))
    }

    pub async fn list_writers(&self, group_id: &str) -> Result<Vec<WriterEntry>> {
        Ok(self
            .members(group_id)
            .await?
            .map(|(members, _)| members.writers)
            .unwrap_or_default())
    }

    pub async fn list_readers(&self, group_id: &str) -> Result<Vec<ReaderEntry>> {
        Ok(self
            .members(group_id)
            .await?
            .map(|(members, _)| members.readers)
            .unwrap_or_default())
    }

    /// Register a writer after checking it against the group's readers.
    ///
    /// With an `etag` the write only succeeds if group membership is unchanged
    /// since the caller read it. Returns the new etag.
    pub async fn add_writer(
        &self,
        app_id: &str,
        writer_id: &str,
        group_id: &str,
        writer: Writer,
        etag: Option<KeyVersion>,
    ) -> Result<KeyVersion> {
        let (members, observed) = self.members_for_update(group_id).await?;
        let expected = expect(etag, observed);

        let properties = self.properties.group_properties(group_id).await?;
        let history = self.history.group_history(group_id).await?;
        require_registered(group_id, &writer.versions, &history)?;

        let checker = CompatibilityChecker::new(
            &properties.compatibility,
            &history,
            properties.validate_by_object_type,
        );
        let readers = members.reader_versions();
        for version in &writer.versions {
            let verdict = checker.check_writer(version, &readers);
            if !verdict.is_compatible {
                info!(
                    group = group_id,
                    app = app_id,
                    writer = writer_id,
                    cause = %verdict.summary,
                    "writer rejected"
                );
            }
            verdict.into_result()?;
        }

        if !self.codecs.codec_types(group_id).await?.contains(&writer.codec) {
            return Err(RegistryError::CodecNotFound(writer.codec.name.clone()));
        }
        let reader_codecs: Vec<Vec<CodecType>> = members
            .readers
            .iter()
            .map(|r| r.reader.codecs.clone())
            .collect();
        check_writer_codec(&writer.codec, &reader_codecs)?;

        let mut updated = members;
        updated
            .writers
            .retain(|w| !(w.app_id == app_id && w.writer_id == writer_id));
        updated.writers.push(WriterEntry {
            app_id: app_id.to_string(),
            writer_id: writer_id.to_string(),
            writer,
        });
        let version = self.put_members(group_id, updated, expected).await?;

        self.update_application(app_id, |app| {
            app.writing_to.insert(writer_id.to_string(), group_id.to_string());
        })
        .await?;
        info!(group = group_id, app = app_id, writer = writer_id, "added writer");
        Ok(version)
    }

    /// Register a reader after checking it against the group's writers.
    ///
    /// Etag handling matches [`add_writer`](Self::add_writer).
    pub async fn add_reader(
        &self,
        app_id: &str,
        reader_id: &str,
        group_id: &str,
        reader: Reader,
        etag: Option<KeyVersion>,
    ) -> Result<KeyVersion> {
        let (members, observed) = self.members_for_update(group_id).await?;
        let expected = expect(etag, observed);

        let properties = self.properties.group_properties(group_id).await?;
        let history = self.history.group_history(group_id).await?;
        require_registered(group_id, &reader.versions, &history)?;

        let checker = CompatibilityChecker::new(
            &properties.compatibility,
            &history,
            properties.validate_by_object_type,
        );
        let writers = members.writer_versions();
        for version in &reader.versions {
            let verdict = checker.check_reader(version, &writers);
            if !verdict.is_compatible {
                info!(
                    group = group_id,
                    app = app_id,
                    reader = reader_id,
                    cause = %verdict.summary,
                    "reader rejected"
                );
            }
            verdict.into_result()?;
        }

        let writer_codecs: Vec<CodecType> =
            members.writers.iter().map(|w| w.writer.codec.clone()).collect();
        check_reader_codecs(&reader.codecs, &writer_codecs)?;

        let mut updated = members;
        updated
            .readers
            .retain(|r| !(r.app_id == app_id && r.reader_id == reader_id));
        updated.readers.push(ReaderEntry {
            app_id: app_id.to_string(),
            reader_id: reader_id.to_string(),
            reader,
        });
        let version = self.put_members(group_id, updated, expected).await?;

        self.update_application(app_id, |app| {
            app.reading_from.insert(reader_id.to_string(), group_id.to_string());
        })
        .await?;
        info!(group = group_id, app = app_id, reader = reader_id, "added reader");
        Ok(version)
    }

    /// Remove a writer. Returns the group's new etag.
    pub async fn remove_writer(
        &self,
        app_id: &str,
        writer_id: &str,
        etag: Option<KeyVersion>,
    ) -> Result<KeyVersion> {
        let application = self.get_application(app_id).await?;
        let group_id = application
            .writing_to
            .get(writer_id)
            .ok_or_else(|| {
                RegistryError::not_found("writer", format!("{}/{}", app_id, writer_id))
            })?;

        let (mut members, observed) = self.members_for_update(group_id).await?;
        members
            .writers
            .retain(|w| !(w.app_id == app_id && w.writer_id == writer_id));
        let version = self.put_members(group_id, members, expect(etag, observed)).await?;

        self.update_application(app_id, |app| {
            app.writing_to.remove(writer_id);
        })
        .await?;
        info!(group = %group_id, app = app_id, writer = writer_id, "removed writer");
        Ok(version)
    }

    /// Remove a reader. Returns the group's new etag.
    pub async fn remove_reader(
        &self,
        app_id: &str,
        reader_id: &str,
        etag: Option<KeyVersion>,
    ) -> Result<KeyVersion> {
        let application = self.get_application(app_id).await?;
        let group_id = application
            .reading_from
            .get(reader_id)
            .ok_or_else(|| {
                RegistryError::not_found("reader", format!("{}/{}", app_id, reader_id))
            })?;

        let (mut members, observed) = self.members_for_update(group_id).await?;
        members
            .readers
            .retain(|r| !(r.app_id == app_id && r.reader_id == reader_id));
        let version = self.put_members(group_id, members, expect(etag, observed)).await?;

        self.update_application(app_id, |app| {
            app.reading_from.remove(reader_id);
        })
        .await?;
        info!(group = %group_id, app = app_id, reader = reader_id, "removed reader");
        Ok(version)
    }

    /// Forget every writer and reader of a group.
    ///
    /// Application records drop their links to the group before the
    /// membership entry goes, so a recreated group starts with no members.
    pub async fn remove_group(&self, group_id: &str) -> Result<()> {
        let Some((members, _)) = self.members(group_id).await? else {
            return Ok(());
        };

        for entry in &members.writers {
            self.update_application(&entry.app_id, |app| {
                if app.writing_to.get(&entry.writer_id).map(String::as_str) == Some(group_id) {
                    app.writing_to.remove(&entry.writer_id);
                }
            })
            .await?;
        }
        for entry in &members.readers {
            self.update_application(&entry.app_id, |app| {
                if app.reading_from.get(&entry.reader_id).map(String::as_str) == Some(group_id) {
                    app.reading_from.remove(&entry.reader_id);
                }
            })
            .await?;
        }

        let key = AppKey::GroupMembers {
            group_id: group_id.to_string(),
        };
        self.table.delete(&key, Expected::Any).await?;
        info!(
            group = group_id,
            writers = members.writers.len(),
            readers = members.readers.len(),
            "removed group members"
        );
        Ok(())
    }

    async fn members(&self, group_id: &str) -> Result<Option<(GroupMembers, KeyVersion)>> {
        let key = AppKey::GroupMembers {
            group_id: group_id.to_string(),
        };
        match self.table.get_with_version(&key).await? {
            Some(entry) => match entry.value {
                AppValue::Members { members } => Ok(Some((members, entry.version))),
                other => Err(unexpected(&key, &other)),
            },
            None => Ok(None),
        }
    }

    async fn members_for_update(
        &self,
        group_id: &str,
    ) -> Result<(GroupMembers, Option<KeyVersion>)> {
        Ok(match self.members(group_id).await? {
            Some((members, version)) => (members, Some(version)),
            None => (GroupMembers::default(), None),
        })
    }

    async fn put_members(
        &self,
        group_id: &str,
        members: GroupMembers,
        expected: Expected,
    ) -> Result<KeyVersion> {
        self.table
            .put(
                &AppKey::GroupMembers {
                    group_id: group_id.to_string(),
                },
                &AppValue::Members { members },
                expected,
            )
            .await
    }

    /// Apply `change` to the application record, creating it on first use
    async fn update_application<F>(&self, app_id: &str, change: F) -> Result<()>
    where
        F: Fn(&mut Application) + Sync,
    {
        let key = AppKey::Application { id: app_id.to_string() };
        self.table
            .update(&key, |current| {
                let mut application = match current {
                    Some(AppValue::Application { application }) => application.clone(),
                    _ => Application::new(app_id),
                };
                change(&mut application);
                Some(AppValue::Application { application })
            })
            .await?;
        Ok(())
    }
}

/// Precondition for a membership write: the caller's etag, or else what was just read
fn expect(etag: Option<KeyVersion>, observed: Option<KeyVersion>) -> Expected {
    match etag {
        Some(etag) => Expected::Version(etag),
        None => Expected::from_observed(observed),
    }
}

fn require_registered(
    group_id: &str,
    versions: &[VersionInfo],
    history: &[SchemaEvolution],
) -> Result<()> {
    for version in versions {
        if !history.iter().any(|e| &e.version == version) {
            return Err(RegistryError::not_found(
                "schema version",
                format!("{} in group {}", version, group_id),
            ));
        }
    }
    Ok(())
}

fn unexpected(key: &AppKey, value: &AppValue) -> RegistryError {
    RegistryError::Serialization(format!("unexpected value {:?} under {:?}", value, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::Compatibility;
    use crate::storage::MemoryTable;
    use crate::types::{SchemaInfo, SerializationFormat};
    use chrono::Utc;

    /// Fixed group data for one group named "orders"
    struct StaticGroup {
        properties: GroupProperties,
        history: Vec<SchemaEvolution>,
        codecs: Vec<CodecType>,
    }

    impl StaticGroup {
        fn new(policy: Compatibility, latest: i32) -> Self {
            let history = (0..=latest)
                .map(|v| SchemaEvolution {
                    schema: SchemaInfo::new(
                        "Order",
                        SerializationFormat::Avro,
                        format!("order-{}", v),
                    ),
                    version: VersionInfo::new("Order", v),
                    compatibility: policy.clone(),
                    timestamp: Utc::now(),
                })
                .collect();
            Self {
                properties: GroupProperties::new(SerializationFormat::Avro, policy, false),
                history,
                codecs: vec![CodecType::new("none"), CodecType::new("gzip")],
            }
        }
    }

    #[async_trait]
    impl GroupPropertiesProvider for StaticGroup {
        async fn group_properties(&self, group_id: &str) -> Result<GroupProperties> {
            match group_id {
                "orders" => Ok(self.properties.clone()),
                _ => Err(RegistryError::not_found("group", group_id)),
            }
        }
    }

    #[async_trait]
    impl GroupHistoryProvider for StaticGroup {
        async fn group_history(&self, _group_id: &str) -> Result<Vec<SchemaEvolution>> {
            Ok(self.history.clone())
        }
    }

    #[async_trait]
    impl GroupCodecProvider for StaticGroup {
        async fn codec_types(&self, _group_id: &str) -> Result<Vec<CodecType>> {
            Ok(self.codecs.clone())
        }
    }

    fn registry(policy: Compatibility, latest: i32) -> ApplicationRegistry {
        ApplicationRegistry::with_provider(
            Arc::new(MemoryTable::new()),
            Backoff::default(),
            Arc::new(StaticGroup::new(policy, latest)),
        )
    }

    fn writer(version: i32, codec: &str) -> Writer {
        Writer {
            versions: vec![VersionInfo::new("Order", version)],
            codec: CodecType::new(codec),
        }
    }

    fn reader(version: i32, codecs: &[&str]) -> Reader {
        Reader {
            versions: vec![VersionInfo::new("Order", version)],
            codecs: codecs.iter().map(|c| CodecType::new(*c)).collect(),
        }
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let apps = registry(Compatibility::AllowAny, 2);
        assert!(apps.create_application("billing", BTreeMap::new()).await.unwrap());
        assert!(!apps.create_application("billing", BTreeMap::new()).await.unwrap());

        apps.add_writer("billing", "w1", "orders", writer(2, "none"), None)
            .await
            .unwrap();
        apps.add_reader("billing", "r1", "orders", reader(1, &["none"]), None)
            .await
            .unwrap();

        let app = apps.get_application("billing").await.unwrap();
        assert_eq!(app.writing_to.get("w1").map(String::as_str), Some("orders"));
        assert_eq!(app.reading_from.get("r1").map(String::as_str), Some("orders"));
        assert_eq!(apps.list_writers("orders").await.unwrap().len(), 1);

        apps.remove_writer("billing", "w1", None).await.unwrap();
        apps.remove_reader("billing", "r1", None).await.unwrap();
        let app = apps.get_application("billing").await.unwrap();
        assert!(app.writing_to.is_empty() && app.reading_from.is_empty());
        assert!(apps.list_writers("orders").await.unwrap().is_empty());
        assert!(apps.list_readers("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_registration_creates_application() {
        let apps = registry(Compatibility::AllowAny, 0);
        apps.add_reader("audit", "r", "orders", reader(0, &["none"]), None)
            .await
            .unwrap();
        assert_eq!(apps.get_application("audit").await.unwrap().id, "audit");
        assert!(matches!(
            apps.get_application("nobody").await,
            Err(RegistryError::DataNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_incompatible_writer_rejected() {
        let apps = registry(Compatibility::ForwardTransitive, 4);
        apps.add_reader("a", "r2", "orders", reader(2, &["none"]), None)
            .await
            .unwrap();
        apps.add_reader("a", "r3", "orders", reader(3, &["none"]), None)
            .await
            .unwrap();

        let err = apps
            .add_writer("b", "w", "orders", writer(1, "none"), None)
            .await
            .unwrap_err();
        match err {
            RegistryError::IncompatibleSchema(cause) => assert!(cause.contains("at least 3")),
            other => panic!("unexpected error: {other}"),
        }
        apps.add_writer("b", "w", "orders", writer(4, "none"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_codec_gate() {
        let apps = registry(Compatibility::AllowAny, 1);
        apps.add_reader("a", "r", "orders", reader(1, &["none"]), None)
            .await
            .unwrap();

        let err = apps
            .add_writer("b", "w", "orders", writer(1, "gzip"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CodecMismatch(_)));

        let err = apps
            .add_writer("b", "w", "orders", writer(1, "zstd"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CodecNotFound(_)));
        assert!(apps.list_writers("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_codec_gate() {
        let apps = registry(Compatibility::AllowAny, 1);
        apps.add_writer("a", "w", "orders", writer(1, "gzip"), None)
            .await
            .unwrap();
        let err = apps
            .add_reader("b", "r", "orders", reader(1, &["none"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CodecMismatch(_)));
        apps.add_reader("b", "r", "orders", reader(1, &["none", "gzip"]), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let apps = registry(Compatibility::AllowAny, 1);
        let err = apps
            .add_writer("a", "w", "orders", writer(7, "none"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DataNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stale_group_etag_conflicts() {
        let apps = registry(Compatibility::AllowAny, 1);
        assert_eq!(apps.get_group_etag("orders").await.unwrap(), None);

        let first = apps
            .add_writer("a", "w1", "orders", writer(1, "none"), None)
            .await
            .unwrap();
        assert_eq!(apps.get_group_etag("orders").await.unwrap(), Some(first));

        let second = apps
            .add_writer("a", "w2", "orders", writer(1, "none"), Some(first))
            .await
            .unwrap();

        let stale = apps
            .add_reader("b", "r", "orders", reader(1, &["none"]), Some(first))
            .await;
        assert!(matches!(stale, Err(RegistryError::WriteConflict { .. })));
        assert!(apps.list_readers("orders").await.unwrap().is_empty());

        apps.add_reader("b", "r", "orders", reader(1, &["none"]), Some(second))
            .await
            .unwrap();
    }
}
