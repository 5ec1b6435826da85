//! Schema, version and encoding types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::compatibility::Compatibility;
use crate::fingerprint::Fingerprint;

/// Serialization format of a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    Avro,
    Protobuf,
    Json,
    /// Group-level wildcard: any format may be registered
    Any,
    /// A format this store treats as opaque, identified by name
    Custom(String),
}

impl SerializationFormat {
    /// Parse a format name as used in configuration files
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "avro" => Self::Avro,
            "protobuf" => Self::Protobuf,
            "json" => Self::Json,
            "any" => Self::Any,
            _ => Self::Custom(name.to_string()),
        }
    }

    /// Whether a group of this format admits a schema of `other`'s format
    pub fn admits(&self, other: &SerializationFormat) -> bool {
        matches!(self, Self::Any) || self == other
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avro => write!(f, "avro"),
            Self::Protobuf => write!(f, "protobuf"),
            Self::Json => write!(f, "json"),
            Self::Any => write!(f, "any"),
            Self::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// A schema definition. The payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Object type name (e.g. "com.example.User")
    pub name: String,
    pub format: SerializationFormat,
    /// Raw schema bytes
    pub data: Vec<u8>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SchemaInfo {
    pub fn new(
        name: impl Into<String>,
        format: SerializationFormat,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            data: data.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Attach a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Content fingerprint of the schema bytes
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_bytes(&self.data)
    }

    /// Exact identity: same object type name and byte-identical payload
    pub fn same_content(&self, other: &SchemaInfo) -> bool {
        self.name == other.name && self.data == other.data
    }
}

/// A registered version of a schema within a group.
///
/// Ordinals are assigned at registration, start at 0 and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionInfo {
    pub schema_name: String,
    pub version: i32,
}

impl VersionInfo {
    pub fn new(schema_name: impl Into<String>, version: i32) -> Self {
        Self {
            schema_name: schema_name.into(),
            version,
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}", self.schema_name, self.version)
    }
}

/// A schema together with the version it was registered under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaWithVersion {
    pub schema: SchemaInfo,
    pub version: VersionInfo,
}

/// One entry of a group's evolution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEvolution {
    pub schema: SchemaInfo,
    pub version: VersionInfo,
    /// Policy that was in force when the schema was registered
    pub compatibility: Compatibility,
    pub timestamp: DateTime<Utc>,
}

/// Group-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProperties {
    pub format: SerializationFormat,
    pub compatibility: Compatibility,
    /// Scope version comparisons to schemas sharing an object type name
    pub validate_by_object_type: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl GroupProperties {
    pub fn new(
        format: SerializationFormat,
        compatibility: Compatibility,
        validate_by_object_type: bool,
    ) -> Self {
        Self {
            format,
            compatibility,
            validate_by_object_type,
            properties: BTreeMap::new(),
        }
    }
}

/// Codec applied to serialized payloads (e.g. "gzip", "none")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodecType {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CodecType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Dense group-scoped alias for a (version, codec) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EncodingId(pub i32);

impl fmt::Display for EncodingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reverse mapping of an [`EncodingId`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingInfo {
    pub version: VersionInfo,
    pub schema: SchemaInfo,
    pub codec: CodecType,
}
