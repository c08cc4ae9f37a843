//! JSON Schema compilation and validation

use super::ValidationError;
use crate::config::JsonSchemaDraft;
use crate::error::SchemaLoadError;
use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};

/// A JSON Schema validator bound to a specific draft.
pub struct JsonValidator {
    compiled: JSONSchema,
}

impl JsonValidator {
    /// Compile a schema document.
    pub fn compile(
        schema_id: &str,
        bytes: &[u8],
        draft: JsonSchemaDraft,
    ) -> Result<Self, SchemaLoadError> {
        let document: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| SchemaLoadError::InvalidJson {
                schema_id: schema_id.to_string(),
                reason: e.to_string(),
            })?;

        let draft = match draft {
            JsonSchemaDraft::Draft4 => Draft::Draft4,
            JsonSchemaDraft::Draft6 => Draft::Draft6,
            JsonSchemaDraft::Draft7 => Draft::Draft7,
        };

        let compiled = JSONSchema::options()
            .with_draft(draft)
            .compile(&document)
            .map_err(|e| SchemaLoadError::Compile {
                schema_id: schema_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { compiled })
    }

    /// Validate a payload; returns every violation so the caller can apply
    /// mode-specific filtering.
    pub fn validate(&self, payload: &[u8]) -> Result<(), Vec<ValidationError>> {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return Err(vec![ValidationError {
                    code: "schema.invalid_json",
                    path: String::new(),
                    message: format!("payload is not valid JSON: {e}"),
                }]);
            }
        };

        let result = match self.compiled.validate(&value) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| ValidationError {
                    code: error_code(&e.kind),
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect()),
        };
        result
    }
}

/// Map validator failures to the stable code set.
fn error_code(kind: &ValidationErrorKind) -> &'static str {
    match kind {
        ValidationErrorKind::Required { .. } => "schema.missing_required",
        ValidationErrorKind::Type { .. } => "schema.type_mismatch",
        ValidationErrorKind::AdditionalProperties { .. } => "schema.additional_property",
        ValidationErrorKind::Maximum { .. }
        | ValidationErrorKind::Minimum { .. }
        | ValidationErrorKind::ExclusiveMaximum { .. }
        | ValidationErrorKind::ExclusiveMinimum { .. }
        | ValidationErrorKind::MaxLength { .. }
        | ValidationErrorKind::MinLength { .. }
        | ValidationErrorKind::MaxItems { .. }
        | ValidationErrorKind::MinItems { .. }
        | ValidationErrorKind::MaxProperties { .. }
        | ValidationErrorKind::MinProperties { .. }
        | ValidationErrorKind::MultipleOf { .. } => "schema.out_of_range",
        _ => "schema.violation",
    }
}
