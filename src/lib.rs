//! Schema Groups
//!
//! A versioned schema store for stream processing. Producers and consumers
//! share schemas through groups; the registry decides whether a new writer or
//! reader version may join a group under the group's compatibility policy.
//!
//! ## Features
//!
//! - **Append-only Groups**: Every group change is a record in a positioned log
//! - **Catch-up Index**: Queryable projections rebuilt idempotently from the log
//! - **Optimistic Concurrency**: Log positions double as etags for conditional writes
//! - **Compatibility Policies**: Eleven policies, from `AllowAny` to `DenyAll`
//! - **Encoding Ids**: Dense integer aliases for (version, codec) pairs
//!
//! ## Architecture
//!
//! ```text
//! SchemaRegistry
//! ├── Group "orders"
//! │   ├── Log     GroupProperties, SchemaRegistered, EncodingAssigned, ...
//! │   └── Index   synced-till, version -> position, fingerprint -> versions, ...
//! ├── Group "payments"
//! └── ApplicationRegistry
//!     └── writers / readers per group, validated by CompatibilityChecker
//! ```

pub mod application;
pub mod codec;
pub mod compatibility;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod group;
pub mod index;
pub mod log;
pub mod retry;
pub mod service;
pub mod storage;
pub mod types;

pub use application::{
    Application, ApplicationRegistry, GroupCodecProvider, GroupHistoryProvider,
    GroupPropertiesProvider, Reader, Writer,
};
pub use compatibility::{Compatibility, CompatibilityChecker, CompatibilityResult, Role};
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use fingerprint::Fingerprint;
pub use group::Group;
pub use log::{Log, LogRecord, MemoryLog, Position};
pub use service::{InMemoryStoreFactory, SchemaRegistry, StoreFactory};
pub use storage::{Expected, KeyVersion, MemoryTable, Table};
pub use types::{
    CodecType, EncodingId, EncodingInfo, GroupProperties, SchemaEvolution, SchemaInfo,
    SchemaWithVersion, SerializationFormat, VersionInfo,
};
