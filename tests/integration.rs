//! End-to-end pipeline scenarios
//!
//! Drives the decision flow against a real quarantine store and schema
//! registry, with a mock publisher standing in for the upstream connection.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use mqtt_schema_proxy::audit::AuditSink;
use mqtt_schema_proxy::broker::MessageForwarder;
use mqtt_schema_proxy::config::{
    AuditConfig, AuditDestination, ProxyConfig, SchemaFileConfig, SchemaMapping,
};
use mqtt_schema_proxy::error::PublishError;
use mqtt_schema_proxy::metrics::{MessageStatus, MetricsRegistry};
use mqtt_schema_proxy::quarantine::{ListFilter, Page, QuarantineReason, QuarantineStore};
use mqtt_schema_proxy::schema::SchemaRegistry;
use mqtt_schema_proxy::topic::TopicMatcher;
use mqtt_schema_proxy::{Message, PipelineContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Records forwarded messages; can be switched to fail like a saturated or
/// dead upstream connection.
#[derive(Default)]
struct MockForwarder {
    published: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
    offline: AtomicBool,
}

impl MockForwarder {
    fn published(&self) -> Vec<(String, Vec<u8>, u8, bool)> {
        self.published.lock().clone()
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageForwarder for MockForwarder {
    async fn forward(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        self.published
            .lock()
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }
}

struct Harness {
    ctx: Arc<PipelineContext>,
    forwarder: Arc<MockForwarder>,
    audit_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn write_schema(dir: &tempfile::TempDir, name: &str, schema: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, schema.to_string()).unwrap();
    path
}

fn temperature_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "deviceId": {"type": "string"},
            "temperature": {"type": "number"}
        },
        "required": ["deviceId", "temperature"],
        "additionalProperties": false
    })
}

fn build_harness(mutate: impl FnOnce(&mut ProxyConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = ProxyConfig::default();
    config
        .validation
        .topic_patterns
        .push("devices/+/telemetry".to_string());
    config.validation.schema_mappings.push(SchemaMapping {
        pattern: "devices/+/telemetry".to_string(),
        schema_id: "temperature_v1".to_string(),
    });
    config.validation.schema_files.insert(
        "temperature_v1".to_string(),
        SchemaFileConfig {
            file: write_schema(&dir, "temperature.json", temperature_schema()),
            format: Default::default(),
            draft: Default::default(),
            message_type: None,
        },
    );
    config.storage.quarantine.path = dir.path().join("quarantine.sqlite3");
    config.storage.payloads.root = dir.path().join("payloads");
    config.monitoring.audit = AuditConfig {
        destination: AuditDestination::File,
        path: dir.path().join("audit.jsonl"),
        ..Default::default()
    };
    mutate(&mut config);
    config.validate().unwrap();

    let matcher = TopicMatcher::build(&config.validation).unwrap();
    let registry =
        SchemaRegistry::load_all(&config.validation, config.validation_cache_size()).unwrap();
    let store = Arc::new(QuarantineStore::open(&config.storage).unwrap());
    let audit = AuditSink::start(&config.monitoring.audit).unwrap();
    let metrics = MetricsRegistry::new().unwrap();
    let forwarder = Arc::new(MockForwarder::default());
    let audit_path = config.monitoring.audit.path.clone();

    let ctx = Arc::new(PipelineContext::new(
        config,
        matcher,
        registry,
        store,
        audit,
        metrics,
        forwarder.clone(),
    ));

    Harness {
        ctx,
        forwarder,
        audit_path,
        _dir: dir,
    }
}

fn message(topic: &str, payload: &[u8]) -> Message {
    Message {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos: 1,
        retain: false,
        client_id: String::new(),
        received_at: Utc::now(),
        enqueued_at: Instant::now(),
    }
}

fn quarantined(harness: &Harness) -> Vec<mqtt_schema_proxy::quarantine::QuarantineRecord> {
    harness
        .ctx
        .store()
        .list(&ListFilter::default(), &Page::default())
        .unwrap()
}

fn audit_lines(harness: &Harness) -> Vec<serde_json::Value> {
    harness.ctx.audit().shutdown();
    std::fs::read_to_string(&harness.audit_path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn valid_message_is_forwarded_byte_identical() {
    let harness = build_harness(|_| {});
    let payload = br#"{"deviceId":"TEMP-001","temperature":23.5}"#;

    harness
        .ctx
        .process(message("devices/TEMP-001/telemetry", payload))
        .await;

    let published = harness.forwarder.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "devices/TEMP-001/telemetry");
    assert_eq!(published[0].1, payload);
    assert_eq!(published[0].2, 1);

    let metrics = harness.ctx.metrics();
    assert_eq!(metrics.message_count(MessageStatus::Valid), 1);
    assert_eq!(metrics.message_count(MessageStatus::Forwarded), 1);
    assert!(quarantined(&harness).is_empty());

    let lines = audit_lines(&harness);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["decision"], "forwarded");
    assert_eq!(lines[0]["forwarded"], true);
}

#[tokio::test]
async fn schema_violation_is_quarantined_with_detail() {
    let harness = build_harness(|_| {});

    harness
        .ctx
        .process(message(
            "devices/TEMP-001/telemetry",
            br#"{"deviceId":"TEMP-001","temperature":"hot"}"#,
        ))
        .await;

    assert!(harness.forwarder.published().is_empty());

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::SchemaValidationError);
    assert!(records[0].detail.contains("temperature"));
    assert!(records[0].detail.contains("type"));
    assert_eq!(records[0].schema_id.as_deref(), Some("temperature_v1"));

    let metrics = harness.ctx.metrics();
    assert_eq!(metrics.message_count(MessageStatus::Invalid), 1);
    assert_eq!(metrics.quarantined_count("schema_validation_error"), 1);
}

#[tokio::test]
async fn unlisted_topic_is_quarantined_without_publisher_call() {
    let harness = build_harness(|_| {});

    harness
        .ctx
        .process(message(
            "devices/TEMP-001/status",
            br#"{"deviceId":"TEMP-001","temperature":1}"#,
        ))
        .await;

    assert!(harness.forwarder.published().is_empty());
    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::TopicNotAllowed);
}

#[tokio::test]
async fn dry_run_validates_and_audits_but_never_publishes() {
    let harness = build_harness(|config| {
        config.global.dry_run = true;
    });

    harness
        .ctx
        .process(message(
            "devices/TEMP-001/telemetry",
            br#"{"deviceId":"TEMP-001","temperature":23.5}"#,
        ))
        .await;

    assert!(harness.forwarder.published().is_empty());

    let metrics = harness.ctx.metrics();
    assert_eq!(metrics.message_count(MessageStatus::Valid), 1);
    assert_eq!(metrics.message_count(MessageStatus::Forwarded), 0);

    let lines = audit_lines(&harness);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["forwarded"], false);
    assert_eq!(lines[0]["dry_run"], true);
}

#[tokio::test]
async fn offline_upstream_quarantines_as_upstream_unavailable() {
    let harness = build_harness(|_| {});
    harness.forwarder.set_offline(true);

    harness
        .ctx
        .process(message(
            "devices/TEMP-001/telemetry",
            br#"{"deviceId":"TEMP-001","temperature":23.5}"#,
        ))
        .await;

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::UpstreamUnavailable);

    // Payload survives for replay once the upstream is back
    let payload = harness.ctx.store().read_payload(&records[0]).unwrap();
    assert_eq!(payload, br#"{"deviceId":"TEMP-001","temperature":23.5}"#);
}

#[tokio::test]
async fn first_listed_mapping_wins_for_overlapping_patterns() {
    // A broader second binding whose schema would reject the payload; the
    // first-listed binding (temperature_v1) must win.
    let strict_dir = tempfile::tempdir().unwrap();
    let strict_path = write_schema(
        &strict_dir,
        "strict.json",
        serde_json::json!({"type": "object", "required": ["mustHave"]}),
    );
    let harness = build_harness(move |config| {
        config
            .validation
            .topic_patterns
            .push("devices/#".to_string());
        config.validation.schema_mappings.push(SchemaMapping {
            pattern: "devices/#".to_string(),
            schema_id: "strict_v1".to_string(),
        });
        config.validation.schema_files.insert(
            "strict_v1".to_string(),
            SchemaFileConfig {
                file: strict_path,
                format: Default::default(),
                draft: Default::default(),
                message_type: None,
            },
        );
    });

    harness
        .ctx
        .process(message(
            "devices/x/telemetry",
            br#"{"deviceId":"x","temperature":1}"#,
        ))
        .await;

    // Forwarded: the first-listed binding (temperature_v1) was used
    assert_eq!(harness.forwarder.published().len(), 1);
    assert!(quarantined(&harness).is_empty());
}

#[tokio::test]
async fn payload_size_boundary() {
    let harness = build_harness(|config| {
        config.global.max_message_size = 1024;
    });

    // Exactly at the limit: accepted (JSON padded with trailing spaces)
    let mut at_limit = br#"{"deviceId":"d","temperature":1}"#.to_vec();
    at_limit.resize(1024, b' ');
    harness
        .ctx
        .process(message("devices/d/telemetry", &at_limit))
        .await;
    assert_eq!(harness.forwarder.published().len(), 1);

    // One byte over: quarantined PayloadTooLarge
    let mut over_limit = at_limit.clone();
    over_limit.push(b' ');
    harness
        .ctx
        .process(message("devices/d/telemetry", &over_limit))
        .await;

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::PayloadTooLarge);
}

#[tokio::test]
async fn malformed_topic_is_rejected() {
    let harness = build_harness(|_| {});

    harness
        .ctx
        .process(message("devices/d/telemetry/", b"{}"))
        .await;

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::TopicNotAllowed);
    assert!(records[0].detail.contains("malformed"));
}

#[tokio::test]
async fn rate_limited_client_is_quarantined() {
    let harness = build_harness(|config| {
        config.security.rate_limiting.enabled = true;
        config.security.rate_limiting.rate_limit = 1;
    });
    let payload = br#"{"deviceId":"d","temperature":1}"#;

    let mut msg = message("devices/d/telemetry", payload);
    msg.client_id = "sensor-01".to_string();
    harness.ctx.process(msg.clone()).await;
    harness.ctx.process(msg).await;

    assert_eq!(harness.forwarder.published().len(), 1);
    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::RateLimited);
}

#[tokio::test]
async fn client_rules_restrict_topics() {
    let harness = build_harness(|config| {
        config.validation.client_rules.insert(
            "sensor-01".to_string(),
            mqtt_schema_proxy::config::ClientRules {
                allowed_topics: vec!["devices/sensor-01/#".to_string()],
            },
        );
    });
    let payload = br#"{"deviceId":"d","temperature":1}"#;

    let mut allowed = message("devices/sensor-01/telemetry", payload);
    allowed.client_id = "sensor-01".to_string();
    harness.ctx.process(allowed).await;
    assert_eq!(harness.forwarder.published().len(), 1);

    let mut denied = message("devices/other/telemetry", payload);
    denied.client_id = "sensor-01".to_string();
    harness.ctx.process(denied).await;

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::TopicNotAllowed);
}

#[tokio::test]
async fn warn_only_mode_forwards_violations_with_warning() {
    let harness = build_harness(|config| {
        config.validation.validation_mode =
            mqtt_schema_proxy::config::ValidationMode::WarnOnly;
    });

    harness
        .ctx
        .process(message(
            "devices/d/telemetry",
            br#"{"deviceId":"d","temperature":"hot"}"#,
        ))
        .await;

    assert_eq!(harness.forwarder.published().len(), 1);
    assert!(quarantined(&harness).is_empty());

    let lines = audit_lines(&harness);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["decision"], "forwarded");
    assert!(lines[0]["warning"].as_str().unwrap().contains("type"));
}

#[tokio::test]
async fn no_binding_for_allowed_topic_is_no_schema_bound() {
    let harness = build_harness(|config| {
        config.validation.topic_patterns.push("events/#".to_string());
    });

    harness.ctx.process(message("events/boot", b"{}")).await;

    let records = quarantined(&harness);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, QuarantineReason::NoSchemaBound);
}

#[tokio::test]
async fn hot_reload_swaps_patterns_at_message_boundary() {
    let harness = build_harness(|_| {});
    let payload = br#"{"deviceId":"d","temperature":1}"#;

    harness
        .ctx
        .process(message("sensors/d/telemetry", payload))
        .await;
    assert_eq!(quarantined(&harness).len(), 1);

    // Widen the allow-list and rebind
    let mut new_config = harness.ctx.config().as_ref().clone();
    new_config
        .validation
        .topic_patterns
        .push("sensors/+/telemetry".to_string());
    new_config.validation.schema_mappings.push(SchemaMapping {
        pattern: "sensors/+/telemetry".to_string(),
        schema_id: "temperature_v1".to_string(),
    });
    harness.ctx.reload(new_config).unwrap();

    harness
        .ctx
        .process(message("sensors/d/telemetry", payload))
        .await;
    assert_eq!(harness.forwarder.published().len(), 1);
}
