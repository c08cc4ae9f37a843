//! Protobuf payload validation
//!
//! A protobuf schema is a compiled `FileDescriptorSet` (the output of
//! `protoc --descriptor_set_out`) plus one fully-qualified message type.
//! Validation decodes the wire-format payload into that message type; a
//! payload that does not decode is rejected.

use super::ValidationError;
use crate::error::SchemaLoadError;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};

/// A parser bound to a single message type within a descriptor set.
pub struct ProtoValidator {
    descriptor: MessageDescriptor,
}

impl ProtoValidator {
    /// Decode the descriptor set and resolve the message type.
    pub fn compile(
        schema_id: &str,
        descriptor_set: &[u8],
        message_type: &str,
    ) -> Result<Self, SchemaLoadError> {
        let pool = DescriptorPool::decode(descriptor_set).map_err(|e| {
            SchemaLoadError::InvalidDescriptorSet {
                schema_id: schema_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        let descriptor = pool.get_message_by_name(message_type).ok_or_else(|| {
            SchemaLoadError::UnknownMessageType {
                schema_id: schema_id.to_string(),
                message_type: message_type.to_string(),
            }
        })?;

        Ok(Self { descriptor })
    }

    pub fn validate(&self, payload: &[u8]) -> Result<(), Vec<ValidationError>> {
        match DynamicMessage::decode(self.descriptor.clone(), payload) {
            Ok(_) => Ok(()),
            Err(e) => Err(vec![ValidationError {
                code: "protobuf.parse_error",
                path: String::new(),
                message: format!(
                    "payload does not decode as {}: {e}",
                    self.descriptor.full_name()
                ),
            }]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    };

    /// Descriptor set equivalent to:
    /// ```proto
    /// package telemetry;
    /// message Reading { string device_id = 1; double temperature = 2; }
    /// ```
    fn reading_descriptor_set() -> Vec<u8> {
        let message = DescriptorProto {
            name: Some("Reading".to_string()),
            field: vec![
                FieldDescriptorProto {
                    name: Some("device_id".to_string()),
                    number: Some(1),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::String as i32),
                    ..Default::default()
                },
                FieldDescriptorProto {
                    name: Some("temperature".to_string()),
                    number: Some(2),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::Double as i32),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("telemetry.proto".to_string()),
            package: Some("telemetry".to_string()),
            message_type: vec![message],
            syntax: Some("proto3".to_string()),
            ..Default::default()
        };
        FileDescriptorSet { file: vec![file] }.encode_to_vec()
    }

    #[test]
    fn test_resolves_message_type() {
        let set = reading_descriptor_set();
        assert!(ProtoValidator::compile("r", &set, "telemetry.Reading").is_ok());
    }

    #[test]
    fn test_unknown_message_type() {
        let set = reading_descriptor_set();
        let result = ProtoValidator::compile("r", &set, "telemetry.Missing");
        assert!(matches!(
            result,
            Err(SchemaLoadError::UnknownMessageType { .. })
        ));
    }

    #[test]
    fn test_decodes_valid_wire_format() {
        let set = reading_descriptor_set();
        let validator = ProtoValidator::compile("r", &set, "telemetry.Reading").unwrap();

        // field 1 (string "t-1"), field 2 (double 23.5)
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x0a, 0x03]);
        payload.extend_from_slice(b"t-1");
        payload.push(0x11);
        payload.extend_from_slice(&23.5f64.to_le_bytes());

        assert!(validator.validate(&payload).is_ok());
    }

    #[test]
    fn test_rejects_garbage() {
        let set = reading_descriptor_set();
        let validator = ProtoValidator::compile("r", &set, "telemetry.Reading").unwrap();

        let errs = validator.validate(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(errs[0].code, "protobuf.parse_error");
    }

    #[test]
    fn test_garbage_descriptor_set() {
        let result = ProtoValidator::compile("r", &[0xde, 0xad], "x.Y");
        assert!(matches!(
            result,
            Err(SchemaLoadError::InvalidDescriptorSet { .. })
        ));
    }
}
