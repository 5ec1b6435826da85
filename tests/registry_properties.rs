//! End-to-end properties of the registry: version ordering, replay,
//! compatibility decisions, codec gating and concurrent registration.

use std::collections::BTreeSet;
use std::sync::Arc;

use schema_groups::{
    CodecType, Compatibility, EncodingId, Group, GroupProperties, Log, MemoryLog, MemoryTable,
    Reader, RegistryConfig, RegistryError, SchemaInfo, SchemaRegistry, SerializationFormat,
    VersionInfo, Writer,
};
use schema_groups::retry::Backoff;

fn avro(name: &str, body: &str) -> SchemaInfo {
    SchemaInfo::new(name, SerializationFormat::Avro, body.as_bytes().to_vec())
}

async fn registry_with_group(
    policy: Compatibility,
    validate_by_object_type: bool,
) -> Arc<SchemaRegistry> {
    let registry = Arc::new(SchemaRegistry::new(RegistryConfig::default()).unwrap());
    let props = GroupProperties::new(SerializationFormat::Avro, policy, validate_by_object_type);
    assert!(registry.create_group("orders", Some(props)).await.unwrap());
    registry
        .add_codec_type("orders", CodecType::new("none"))
        .await
        .unwrap();
    registry
        .add_codec_type("orders", CodecType::new("gzip"))
        .await
        .unwrap();
    registry
}

/// Register `count` distinct "Order" schemas, returning their versions
async fn register_orders(registry: &SchemaRegistry, count: usize) -> Vec<VersionInfo> {
    let mut versions = Vec::new();
    for i in 0..count {
        let schema = avro("Order", &format!("order-{}", i));
        versions.push(registry.add_schema("orders", schema, None).await.unwrap());
    }
    versions
}

fn writer(version: &VersionInfo, codec: &str) -> Writer {
    Writer {
        versions: vec![version.clone()],
        codec: CodecType::new(codec),
    }
}

fn reader(version: &VersionInfo, codecs: &[&str]) -> Reader {
    Reader {
        versions: vec![version.clone()],
        codecs: codecs.iter().map(|c| CodecType::new(*c)).collect(),
    }
}

#[tokio::test]
async fn test_versions_are_monotonic_without_gaps() {
    let registry = registry_with_group(Compatibility::AllowAny, true).await;
    let mut seen: Vec<VersionInfo> = Vec::new();
    for (i, name) in ["Order", "Refund", "Order", "Order", "Refund"].iter().enumerate() {
        let v = registry
            .add_schema("orders", avro(name, &format!("body-{}", i)), None)
            .await
            .unwrap();
        seen.push(v);
    }

    let ordinals = |name: &str| -> Vec<i32> {
        seen.iter().filter(|v| v.schema_name == name).map(|v| v.version).collect()
    };
    assert_eq!(ordinals("Order"), vec![0, 1, 2]);
    assert_eq!(ordinals("Refund"), vec![0, 1]);
}

#[tokio::test]
async fn test_same_bytes_under_different_names_stay_distinct() {
    let registry = registry_with_group(Compatibility::AllowAny, false).await;
    let a = registry.add_schema("orders", avro("Order", "shared"), None).await.unwrap();
    let b = registry.add_schema("orders", avro("Refund", "shared"), None).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(
        registry
            .get_schema_version("orders", &avro("Refund", "shared"))
            .await
            .unwrap(),
        b
    );
    assert_eq!(
        registry
            .get_schema_version("orders", &avro("Order", "shared"))
            .await
            .unwrap(),
        a
    );
}

#[tokio::test]
async fn test_replaying_twice_matches_replaying_once() {
    let log = Arc::new(MemoryLog::new());
    let writer = Group::new("g", log.clone(), Arc::new(MemoryTable::new()), Backoff::default());
    writer
        .create(GroupProperties::new(SerializationFormat::Any, Compatibility::Full, false))
        .await
        .unwrap();
    writer.add_codec(CodecType::new("none")).await.unwrap();
    for i in 0..3 {
        let etag = writer.current_etag().await.unwrap();
        let version = writer.next_version("Order").await.unwrap();
        writer
            .add_schema_to_group(avro("Order", &format!("o{}", i)), version, etag)
            .await
            .unwrap();
    }

    let once = Group::new("g", log.clone(), Arc::new(MemoryTable::new()), Backoff::default());
    once.sync_index().await.unwrap();

    let twice = Group::new("g", log.clone(), Arc::new(MemoryTable::new()), Backoff::default());
    twice.sync_index().await.unwrap();
    let entries = log.read_from(None).await.unwrap();
    twice.index().replay(&entries).await.unwrap();

    assert_eq!(
        once.index().snapshot().await.unwrap(),
        twice.index().snapshot().await.unwrap()
    );
}

#[tokio::test]
async fn test_forward_transitive_writer_against_readers() {
    let registry = registry_with_group(Compatibility::ForwardTransitive, false).await;
    let v = register_orders(&registry, 5).await;
    let apps = registry.applications();
    apps.add_reader("analytics", "r2", "orders", reader(&v[2], &["none"]), None)
        .await
        .unwrap();
    apps.add_reader("analytics", "r3", "orders", reader(&v[3], &["none"]), None)
        .await
        .unwrap();

    match apps.add_writer("ingest", "w", "orders", writer(&v[1], "none"), None).await {
        Err(RegistryError::IncompatibleSchema(cause)) => {
            assert!(cause.contains("at least 3"), "{cause}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    apps.add_writer("ingest", "w", "orders", writer(&v[4], "none"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_backward_writer_upper_bound_is_inclusive() {
    let registry = registry_with_group(Compatibility::Backward, false).await;
    let v = register_orders(&registry, 5).await;
    let apps = registry.applications();
    apps.add_reader("analytics", "r3", "orders", reader(&v[3], &["none"]), None)
        .await
        .unwrap();
    apps.add_reader("analytics", "r4", "orders", reader(&v[4], &["none"]), None)
        .await
        .unwrap();

    apps.add_writer("ingest", "w3", "orders", writer(&v[3], "none"), None)
        .await
        .unwrap();
    match apps.add_writer("ingest", "w4", "orders", writer(&v[4], "none"), None).await {
        Err(RegistryError::IncompatibleSchema(cause)) => {
            assert!(cause.contains("at most 3"), "{cause}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deny_all_accepts_only_latest() {
    let registry = registry_with_group(Compatibility::DenyAll, false).await;
    let v = register_orders(&registry, 3).await;
    let apps = registry.applications();

    for stale in &v[..2] {
        match apps.add_writer("ingest", "w", "orders", writer(stale, "none"), None).await {
            Err(RegistryError::IncompatibleSchema(cause)) => {
                assert!(cause.contains("exactly the latest version 2"), "{cause}")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
    apps.add_writer("ingest", "w", "orders", writer(&v[2], "none"), None)
        .await
        .unwrap();
    assert!(apps
        .add_reader("analytics", "r", "orders", reader(&v[0], &["none"]), None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_codec_gate_applies_after_version_check_passes() {
    let registry = registry_with_group(Compatibility::FullTransitive, false).await;
    let v = register_orders(&registry, 2).await;
    let apps = registry.applications();
    apps.add_reader("analytics", "r", "orders", reader(&v[1], &["none"]), None)
        .await
        .unwrap();

    let err = apps
        .add_writer("ingest", "w", "orders", writer(&v[1], "gzip"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::CodecMismatch(_)), "{err}");
}

#[tokio::test]
async fn test_encoding_ids_are_stable_and_invertible() {
    let registry = registry_with_group(Compatibility::AllowAny, false).await;
    let v = register_orders(&registry, 2).await;
    let gzip = CodecType::new("gzip");

    let id = registry.get_encoding_id("orders", &v[1], &gzip).await.unwrap();
    assert_eq!(id, EncodingId(0));
    assert_eq!(registry.get_encoding_id("orders", &v[1], &gzip).await.unwrap(), id);

    let info = registry.get_encoding_info("orders", id).await.unwrap();
    assert_eq!(info.version, v[1]);
    assert_eq!(info.codec, gzip);
    assert_eq!(info.schema, avro("Order", "order-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_converge() {
    let registry = registry_with_group(Compatibility::AllowAny, false).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let schema = avro("Order", &format!("concurrent-{}", i));
            loop {
                match registry.add_schema("orders", schema.clone(), None).await {
                    Ok(version) => return version,
                    Err(e) if e.is_write_conflict() => tokio::task::yield_now().await,
                    Err(e) => panic!("registration failed: {e}"),
                }
            }
        }));
    }

    let mut ordinals = BTreeSet::new();
    for handle in handles {
        ordinals.insert(handle.await.unwrap().version);
    }
    assert_eq!(ordinals, (0..8).collect::<BTreeSet<i32>>());
}

#[tokio::test]
async fn test_history_reports_policy_in_force_at_registration() {
    let registry = registry_with_group(Compatibility::Backward, false).await;
    register_orders(&registry, 1).await;

    let etag = registry.get_group_etag("orders").await.unwrap();
    let till = Compatibility::BackwardTill {
        backward_till: Some(VersionInfo::new("Order", 0)),
    };
    registry.update_policy("orders", till.clone(), etag).await.unwrap();
    assert!(registry
        .update_policy("orders", Compatibility::Full, etag)
        .await
        .unwrap_err()
        .is_write_conflict());

    registry.add_schema("orders", avro("Order", "later"), None).await.unwrap();

    let history = registry.get_group_history("orders", None).await.unwrap();
    let policies: Vec<Compatibility> = history.into_iter().map(|e| e.compatibility).collect();
    assert_eq!(policies, vec![Compatibility::Backward, till.clone()]);
    assert_eq!(
        registry.get_group_properties("orders").await.unwrap().compatibility,
        till
    );
}
