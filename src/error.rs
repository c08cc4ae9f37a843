//! Error taxonomies for the proxy
//!
//! Startup failures (configuration, schema compilation) are fatal and abort
//! the process. Everything that happens after the pipeline is running maps to
//! a per-message decision or a transient operational error; worker-level
//! failures never terminate the pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("schema mapping '{pattern}' refers to unknown schema id '{schema_id}'")]
    UnknownSchemaId { pattern: String, schema_id: String },

    #[error("invalid override '{0}': expected key=value")]
    InvalidOverride(String),

    #[error("unsupported storage driver '{0}': this build includes the embedded driver only")]
    UnsupportedDriver(String),

    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Schema compilation failures. Fatal at startup, non-fatal on hot reload
/// (the previous snapshot stays in service).
#[derive(Debug, Error)]
pub enum SchemaLoadError {
    #[error("failed to read schema file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema '{schema_id}' is not valid JSON: {reason}")]
    InvalidJson { schema_id: String, reason: String },

    #[error("failed to compile JSON schema '{schema_id}': {reason}")]
    Compile { schema_id: String, reason: String },

    #[error("failed to decode descriptor set for '{schema_id}': {reason}")]
    InvalidDescriptorSet { schema_id: String, reason: String },

    #[error("message type '{message_type}' not found in descriptor set for '{schema_id}'")]
    UnknownMessageType {
        schema_id: String,
        message_type: String,
    },

    #[error("protobuf schema '{schema_id}' is missing a message-type binding")]
    MissingMessageType { schema_id: String },
}

/// Quarantine store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("blob write failed for {hash}: {source}")]
    BlobWrite {
        hash: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publisher-side failures, distinguished so the pipeline can tell transient
/// saturation apart from a dead connection.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher outgoing queue is saturated")]
    QueueFull,

    #[error("publisher is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Client(String),
}
