//! Prometheus metrics for the proxy
//!
//! Counters, histograms, and gauges for the message pipeline, schema
//! validation, quarantine storage, and broker connectivity. All metrics use
//! interior mutability and are safe to share across workers.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Instant;
use thiserror::Error;

/// Histogram buckets for validation latency (seconds).
const VALIDATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25];

/// Histogram buckets for forward latency (seconds).
const FORWARD_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Message terminal status labels for `messages_total`.
#[derive(Debug, Clone, Copy)]
pub enum MessageStatus {
    Valid,
    Invalid,
    Forwarded,
    Dropped,
}

impl MessageStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Forwarded => "forwarded",
            Self::Dropped => "dropped",
        }
    }
}

/// Broker role labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    Subscriber,
    Publisher,
}

impl BrokerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscriber => "subscriber",
            Self::Publisher => "publisher",
        }
    }
}

/// Shared metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,

    messages_total: IntCounterVec,
    quarantine_records_total: IntCounterVec,
    schema_validations_total: IntCounterVec,
    broker_reconnects_total: IntCounterVec,
    dropped_backpressure_total: IntCounter,
    audit_events_dropped_total: IntCounter,

    validation_duration: Histogram,
    forward_duration: Histogram,

    queue_depth: IntGauge,
    quarantine_bytes: IntGauge,
    broker_connected: IntGaugeVec,
    uptime_seconds: IntGauge,

    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new("mqtt_proxy_messages_total", "Messages by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let quarantine_records_total = IntCounterVec::new(
            Opts::new(
                "mqtt_proxy_quarantine_records_total",
                "Quarantined messages by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(quarantine_records_total.clone()))?;

        let schema_validations_total = IntCounterVec::new(
            Opts::new(
                "mqtt_proxy_schema_validations_total",
                "Schema validations by schema id and result",
            ),
            &["schema_id", "result"],
        )?;
        registry.register(Box::new(schema_validations_total.clone()))?;

        let broker_reconnects_total = IntCounterVec::new(
            Opts::new(
                "mqtt_proxy_broker_reconnects_total",
                "Broker reconnect attempts by role",
            ),
            &["role"],
        )?;
        registry.register(Box::new(broker_reconnects_total.clone()))?;

        let dropped_backpressure_total = IntCounter::new(
            "mqtt_proxy_dropped_backpressure_total",
            "Messages dropped because the work queue stayed full",
        )?;
        registry.register(Box::new(dropped_backpressure_total.clone()))?;

        let audit_events_dropped_total = IntCounter::new(
            "mqtt_proxy_audit_events_dropped_total",
            "Audit records dropped due to buffer overflow",
        )?;
        registry.register(Box::new(audit_events_dropped_total.clone()))?;

        let validation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mqtt_proxy_validation_duration_seconds",
                "Time spent validating a message",
            )
            .buckets(VALIDATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(validation_duration.clone()))?;

        let forward_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mqtt_proxy_forward_duration_seconds",
                "Time spent forwarding a message upstream",
            )
            .buckets(FORWARD_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(forward_duration.clone()))?;

        let queue_depth = IntGauge::new("mqtt_proxy_queue_depth", "Messages waiting in the work queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let quarantine_bytes = IntGauge::new(
            "mqtt_proxy_quarantine_bytes",
            "Total payload bytes referenced by quarantine records",
        )?;
        registry.register(Box::new(quarantine_bytes.clone()))?;

        let broker_connected = IntGaugeVec::new(
            Opts::new(
                "mqtt_proxy_broker_connected",
                "Broker connection status by role (1=connected)",
            ),
            &["role"],
        )?;
        registry.register(Box::new(broker_connected.clone()))?;

        let uptime_seconds = IntGauge::new("mqtt_proxy_uptime_seconds", "Proxy uptime")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            messages_total,
            quarantine_records_total,
            schema_validations_total,
            broker_reconnects_total,
            dropped_backpressure_total,
            audit_events_dropped_total,
            validation_duration,
            forward_duration,
            queue_depth,
            quarantine_bytes,
            broker_connected,
            uptime_seconds,
            started_at: Instant::now(),
        })
    }

    pub fn message(&self, status: MessageStatus) {
        self.messages_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn quarantined(&self, reason: &str) {
        self.quarantine_records_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn schema_validation(&self, schema_id: &str, passed: bool) {
        let result = if passed { "pass" } else { "fail" };
        self.schema_validations_total
            .with_label_values(&[schema_id, result])
            .inc();
    }

    pub fn broker_reconnect(&self, role: BrokerRole) {
        self.broker_reconnects_total
            .with_label_values(&[role.as_str()])
            .inc();
    }

    pub fn dropped_backpressure(&self) {
        self.dropped_backpressure_total.inc();
    }

    pub fn set_audit_events_dropped(&self, total: u64) {
        // The sink tracks the authoritative count
        let current = self.audit_events_dropped_total.get();
        if total > current {
            self.audit_events_dropped_total.inc_by(total - current);
        }
    }

    pub fn observe_validation_duration(&self, seconds: f64) {
        self.validation_duration.observe(seconds);
    }

    pub fn observe_forward_duration(&self, seconds: f64) {
        self.forward_duration.observe(seconds);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_quarantine_bytes(&self, bytes: u64) {
        self.quarantine_bytes.set(bytes as i64);
    }

    pub fn set_broker_connected(&self, role: BrokerRole, connected: bool) {
        self.broker_connected
            .with_label_values(&[role.as_str()])
            .set(i64::from(connected));
    }

    /// Refresh derived gauges; called before each scrape.
    pub fn refresh_uptime(&self) {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);
    }

    /// Render the Prometheus text exposition.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        self.refresh_uptime();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    pub fn message_count(&self, status: MessageStatus) -> u64 {
        self.messages_total
            .with_label_values(&[status.as_str()])
            .get()
    }

    pub fn quarantined_count(&self, reason: &str) -> u64 {
        self.quarantine_records_total
            .with_label_values(&[reason])
            .get()
    }

    pub fn reconnect_count(&self, role: BrokerRole) -> u64 {
        self.broker_reconnects_total
            .with_label_values(&[role.as_str()])
            .get()
    }
}
