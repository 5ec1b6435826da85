//! Configuration management for the schema group store
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schema-groups.toml)
//! - Environment variables (SCHEMA_GROUPS__*)
//!
//! ## Example config file (schema-groups.toml):
//! ```toml
//! [retry]
//! base_delay_ms = 1
//! multiplier = 2
//! max_delay_ms = 1000
//!
//! [groups]
//! default_format = "avro"
//! default_policy = "backward_transitive"
//! validate_by_object_type = false
//! name_pattern = "^[A-Za-z0-9_.-]{1,256}$"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compatibility::Compatibility;
use crate::error::{RegistryError, Result};
use crate::types::{GroupProperties, SerializationFormat};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Conflict retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Defaults applied to new groups
    #[serde(default)]
    pub groups: GroupDefaults,
}

/// Backoff applied to internally retried index writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Upper bound for a single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Group defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefaults {
    #[serde(default = "default_format")]
    pub default_format: String,

    /// Policy name, e.g. "backward" or "full_transitive"
    #[serde(default = "default_policy")]
    pub default_policy: String,

    #[serde(default)]
    pub validate_by_object_type: bool,

    /// Pattern group ids, application ids and schema names must match
    #[serde(default = "default_name_pattern")]
    pub name_pattern: String,
}

fn default_base_delay_ms() -> u64 {
    1
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_format() -> String {
    "any".to_string()
}

fn default_policy() -> String {
    "backward".to_string()
}

fn default_name_pattern() -> String {
    "^[A-Za-z0-9_.-]{1,256}$".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            default_policy: default_policy(),
            validate_by_object_type: false,
            name_pattern: default_name_pattern(),
        }
    }
}

impl GroupDefaults {
    /// Properties for a group created without explicit settings
    pub fn properties(&self) -> Result<GroupProperties> {
        let policy = Compatibility::parse(&self.default_policy, None, None)?;
        Ok(GroupProperties::new(
            SerializationFormat::parse(&self.default_format),
            policy,
            self.validate_by_object_type,
        ))
    }

    /// Compiled name pattern
    pub fn name_regex(&self) -> Result<Regex> {
        Regex::new(&self.name_pattern).map_err(|e| {
            RegistryError::InvalidName(format!("bad name pattern {}: {}", self.name_pattern, e))
        })
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the defaults
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = [
            "schema-groups.toml",
            ".schema-groups.toml",
            "config/schema-groups.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        let project_dirs = directories::ProjectDirs::from("dev", "familiar", "schema-groups");
        if let Some(config_dir) = project_dirs {
            let xdg_config = config_dir.config_dir().join("schema-groups.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_GROUPS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.retry.base_delay_ms, 1);
        assert_eq!(config.retry.multiplier, 2);
        let props = config.groups.properties().unwrap();
        assert_eq!(props.compatibility, Compatibility::Backward);
        assert_eq!(props.format, SerializationFormat::Any);
    }

    #[test]
    fn test_serialize_config() {
        let config = RegistryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[retry]"));
        assert!(toml_str.contains("[groups]"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[groups]\ndefault_format = \"avro\"\ndefault_policy = \"full_transitive\"\n\n\
             [retry]\nmax_delay_ms = 50\n",
        )
        .unwrap();

        let config = RegistryConfig::load_from(path.to_str()).unwrap();
        assert_eq!(config.retry.max_delay_ms, 50);
        assert_eq!(config.retry.base_delay_ms, 1);

        let props = config.groups.properties().unwrap();
        assert_eq!(props.format, SerializationFormat::Avro);
        assert_eq!(props.compatibility, Compatibility::FullTransitive);
    }

    #[test]
    fn test_unknown_default_policy() {
        let groups = GroupDefaults {
            default_policy: "sideways".to_string(),
            ..GroupDefaults::default()
        };
        assert!(matches!(groups.properties(), Err(RegistryError::UnknownPolicy(_))));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = RegistryConfig::default();
        config.groups.validate_by_object_type = true;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = RegistryConfig::load_from(path.to_str()).unwrap();
        assert!(loaded.groups.validate_by_object_type);
    }

    #[test]
    fn test_name_regex() {
        let re = GroupDefaults::default().name_regex().unwrap();
        assert!(re.is_match("payments.v1"));
        assert!(!re.is_match("bad name"));
    }
}
