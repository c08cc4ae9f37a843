//! MQTT Schema Governance Proxy
//!
//! A store-and-forward governance proxy for MQTT. The proxy subscribes to
//! configured topic filters on an upstream broker, validates every published
//! message, and either forwards it through a second publisher connection or
//! quarantines it with diagnostic metadata:
//!
//! - **Topic governance**: allow-list of MQTT wildcard patterns compiled
//!   into a trie, plus per-client topic restrictions
//! - **Schema governance**: JSON Schema (draft-04/06/07) and protobuf
//!   descriptor validation with a bounded verdict cache
//! - **Quarantine**: append-only SQLite metadata index plus a
//!   content-addressed payload blob store with retention and dedup
//! - **Observability**: line-JSON audit trail, Prometheus metrics, and
//!   health endpoints
//!
//! # Architecture
//!
//! The subscriber connection feeds a bounded work queue; a pool of workers
//! drains it and runs each message through the decision flow. Every message
//! reaches exactly one terminal state (forwarded, quarantined, or dropped
//! with an internal error), each recorded in the audit trail and metrics.
//! Dry-run mode keeps validation and audit but suppresses forwarding.
//!
//! # Example Configuration
//!
//! ```yaml
//! global:
//!   client-id-prefix: schema-proxy
//!   max-message-size: 1048576
//! brokers:
//!   subscriber: { host: broker.internal, port: 1883 }
//!   publisher: { host: upstream.internal, port: 1883 }
//! validation:
//!   topic-patterns:
//!     - "devices/+/telemetry"
//!   schema-mappings:
//!     - pattern: "devices/+/telemetry"
//!       schema-id: temperature_v1
//!   schema-files:
//!     temperature_v1:
//!       file: schemas/temperature.json
//!       format: jsonschema
//! ```

pub mod audit;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod quarantine;
pub mod ratelimit;
pub mod schema;
pub mod topic;

// Re-export main types
pub use config::ProxyConfig;
pub use pipeline::{Message, Pipeline, PipelineContext};
