//! Schema registry: compile, cache, validate
//!
//! Schemas are compiled once at load time and are immutable afterwards.
//! Workers hold read-only views keyed by schema id; hot reload swaps the
//! compiled set off the worker path and invalidates the validation cache for
//! the affected ids.

mod cache;
mod json;
mod protobuf;

pub use cache::ValidationCache;

use crate::config::{SchemaFormat, ValidationConfig, ValidationMode};
use crate::error::SchemaLoadError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Schema flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    JsonSchema,
    Protobuf,
}

/// A single validation failure with a stable machine code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Stable code, e.g. `schema.type_mismatch` or `protobuf.parse_error`
    pub code: &'static str,
    /// Failing field path where available
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} at {}", self.code, self.message, self.path)
        }
    }
}

/// Outcome of validating one payload against one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Payload conforms
    Pass,
    /// Payload violates the schema but the registry runs in warn-only mode;
    /// the message is still forwarded
    Warn(ValidationError),
    /// Payload violates the schema
    Fail(ValidationError),
}

/// One compiled schema with its provenance.
struct CompiledSchema {
    kind: SchemaKind,
    #[allow(dead_code)]
    source_path: PathBuf,
    #[allow(dead_code)]
    loaded_at: DateTime<Utc>,
    form: CompiledForm,
}

enum CompiledForm {
    Json(json::JsonValidator),
    Proto(protobuf::ProtoValidator),
}

/// Registry of compiled schemas plus the bounded validation cache.
pub struct SchemaRegistry {
    schemas: RwLock<Arc<HashMap<String, Arc<CompiledSchema>>>>,
    mode: RwLock<ValidationMode>,
    cache: ValidationCache,
}

impl SchemaRegistry {
    /// Compile every configured schema. Any failure is fatal.
    pub fn load_all(
        validation: &ValidationConfig,
        cache_size: usize,
    ) -> Result<Self, SchemaLoadError> {
        let schemas = compile_set(validation)?;
        info!(schemas = schemas.len(), "schema registry loaded");
        Ok(Self {
            schemas: RwLock::new(Arc::new(schemas)),
            mode: RwLock::new(validation.validation_mode),
            cache: ValidationCache::new(cache_size),
        })
    }

    /// Recompile from a new snapshot and swap. The previous compiled set
    /// stays in service if any schema fails to compile. Cache entries for
    /// every schema id in the new snapshot are invalidated.
    pub fn reload(&self, validation: &ValidationConfig) -> Result<(), SchemaLoadError> {
        let schemas = compile_set(validation)?;
        for id in schemas.keys() {
            self.cache.invalidate_schema(id);
        }
        *self.mode.write() = validation.validation_mode;
        *self.schemas.write() = Arc::new(schemas);
        info!("schema registry reloaded");
        Ok(())
    }

    /// Kind of a registered schema.
    pub fn kind(&self, schema_id: &str) -> Option<SchemaKind> {
        self.schemas.read().get(schema_id).map(|s| s.kind)
    }

    /// Validate a payload. Repeated identical payloads short-circuit through
    /// the cache.
    pub fn validate(&self, schema_id: &str, payload: &[u8]) -> Verdict {
        let payload_hash: [u8; 32] = Sha256::digest(payload).into();
        if let Some(verdict) = self.cache.get(schema_id, &payload_hash) {
            debug!(schema_id, "validation cache hit");
            return verdict;
        }

        let verdict = self.validate_uncached(schema_id, payload);
        self.cache.put(schema_id, payload_hash, verdict.clone());
        verdict
    }

    fn validate_uncached(&self, schema_id: &str, payload: &[u8]) -> Verdict {
        let schemas = self.schemas.read().clone();
        let schema = match schemas.get(schema_id) {
            Some(s) => s.clone(),
            None => {
                return Verdict::Fail(ValidationError {
                    code: "schema.unknown",
                    path: String::new(),
                    message: format!("schema id '{schema_id}' is not registered"),
                });
            }
        };
        let mode = *self.mode.read();

        let errors = match &schema.form {
            CompiledForm::Json(v) => v.validate(payload),
            CompiledForm::Proto(v) => v.validate(payload),
        };

        let mut errors = match errors {
            Ok(()) => return Verdict::Pass,
            Err(errors) => errors,
        };

        // Lenient mode tolerates unknown properties even when the schema
        // forbids them.
        if mode == ValidationMode::Lenient {
            errors.retain(|e| e.code != "schema.additional_property");
            if errors.is_empty() {
                return Verdict::Pass;
            }
        }

        let first = errors.remove(0);
        match mode {
            ValidationMode::WarnOnly => Verdict::Warn(first),
            _ => Verdict::Fail(first),
        }
    }
}

fn compile_set(
    validation: &ValidationConfig,
) -> Result<HashMap<String, Arc<CompiledSchema>>, SchemaLoadError> {
    let mut schemas = HashMap::with_capacity(validation.schema_files.len());
    for (schema_id, file_config) in &validation.schema_files {
        let bytes =
            std::fs::read(&file_config.file).map_err(|source| SchemaLoadError::Read {
                path: file_config.file.clone(),
                source,
            })?;

        let (kind, form) = match file_config.format {
            SchemaFormat::Jsonschema => {
                let validator =
                    json::JsonValidator::compile(schema_id, &bytes, file_config.draft)?;
                (SchemaKind::JsonSchema, CompiledForm::Json(validator))
            }
            SchemaFormat::Protobuf => {
                let message_type = file_config.message_type.as_deref().ok_or_else(|| {
                    SchemaLoadError::MissingMessageType {
                        schema_id: schema_id.clone(),
                    }
                })?;
                let validator =
                    protobuf::ProtoValidator::compile(schema_id, &bytes, message_type)?;
                (SchemaKind::Protobuf, CompiledForm::Proto(validator))
            }
        };

        debug!(schema_id, kind = ?kind, file = %file_config.file.display(), "schema compiled");
        schemas.insert(
            schema_id.clone(),
            Arc::new(CompiledSchema {
                kind,
                source_path: file_config.file.clone(),
                loaded_at: Utc::now(),
                form,
            }),
        );
    }
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaFileConfig;
    use serde_json::json;
    use std::io::Write;

    fn temperature_schema_file(dir: &tempfile::TempDir) -> PathBuf {
        let schema = json!({
            "type": "object",
            "properties": {
                "deviceId": {"type": "string"},
                "temperature": {"type": "number", "minimum": -50, "maximum": 100}
            },
            "required": ["deviceId", "temperature"],
            "additionalProperties": false
        });
        let path = dir.path().join("temperature.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(schema.to_string().as_bytes()).unwrap();
        path
    }

    fn registry_with_mode(mode: ValidationMode) -> (SchemaRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = temperature_schema_file(&dir);
        let mut validation = ValidationConfig::default();
        validation.validation_mode = mode;
        validation.schema_files.insert(
            "temperature_v1".to_string(),
            SchemaFileConfig {
                file: path,
                format: SchemaFormat::Jsonschema,
                draft: Default::default(),
                message_type: None,
            },
        );
        let registry = SchemaRegistry::load_all(&validation, 16).unwrap();
        (registry, dir)
    }

    #[test]
    fn test_valid_payload_passes() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        let verdict = registry.validate(
            "temperature_v1",
            br#"{"deviceId":"TEMP-001","temperature":23.5}"#,
        );
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(registry.kind("temperature_v1"), Some(SchemaKind::JsonSchema));
    }

    #[test]
    fn test_type_mismatch_fails_with_code_and_path() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        let verdict = registry.validate(
            "temperature_v1",
            br#"{"deviceId":"TEMP-001","temperature":"hot"}"#,
        );
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.code, "schema.type_mismatch");
                assert!(err.path.contains("temperature"), "path: {}", err.path);
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        let verdict = registry.validate("temperature_v1", br#"{"temperature":20}"#);
        match verdict {
            Verdict::Fail(err) => assert_eq!(err.code, "schema.missing_required"),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        let verdict = registry.validate(
            "temperature_v1",
            br#"{"deviceId":"TEMP-001","temperature":400}"#,
        );
        match verdict {
            Verdict::Fail(err) => assert_eq!(err.code, "schema.out_of_range"),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_additional_property_strict_vs_lenient() {
        let payload = br#"{"deviceId":"d","temperature":1,"extra":true}"#;

        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        match registry.validate("temperature_v1", payload) {
            Verdict::Fail(err) => assert_eq!(err.code, "schema.additional_property"),
            other => panic!("expected Fail, got {other:?}"),
        }

        let (registry, _dir) = registry_with_mode(ValidationMode::Lenient);
        assert_eq!(registry.validate("temperature_v1", payload), Verdict::Pass);
    }

    #[test]
    fn test_warn_only_mode() {
        let (registry, _dir) = registry_with_mode(ValidationMode::WarnOnly);
        let verdict = registry.validate(
            "temperature_v1",
            br#"{"deviceId":"d","temperature":"hot"}"#,
        );
        assert!(matches!(verdict, Verdict::Warn(_)));
    }

    #[test]
    fn test_invalid_json_payload() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        match registry.validate("temperature_v1", b"not json") {
            Verdict::Fail(err) => assert_eq!(err.code, "schema.invalid_json"),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_schema_id() {
        let (registry, _dir) = registry_with_mode(ValidationMode::Strict);
        match registry.validate("nope", b"{}") {
            Verdict::Fail(err) => assert_eq!(err.code, "schema.unknown"),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_reload_keeps_verdicts_for_unchanged_files() {
        let (registry, dir) = registry_with_mode(ValidationMode::Strict);
        let good = br#"{"deviceId":"d","temperature":1}"#;
        let bad = br#"{"deviceId":"d","temperature":"x"}"#;

        assert_eq!(registry.validate("temperature_v1", good), Verdict::Pass);

        let path = temperature_schema_file(&dir);
        let mut validation = ValidationConfig::default();
        validation.schema_files.insert(
            "temperature_v1".to_string(),
            SchemaFileConfig {
                file: path,
                format: SchemaFormat::Jsonschema,
                draft: Default::default(),
                message_type: None,
            },
        );
        registry.reload(&validation).unwrap();

        assert_eq!(registry.validate("temperature_v1", good), Verdict::Pass);
        assert!(matches!(
            registry.validate("temperature_v1", bad),
            Verdict::Fail(_)
        ));
    }

    #[test]
    fn test_missing_schema_file_fails_load() {
        let mut validation = ValidationConfig::default();
        validation.schema_files.insert(
            "ghost".to_string(),
            SchemaFileConfig {
                file: PathBuf::from("/nonexistent/ghost.json"),
                format: SchemaFormat::Jsonschema,
                draft: Default::default(),
                message_type: None,
            },
        );
        assert!(SchemaRegistry::load_all(&validation, 16).is_err());
    }
}
