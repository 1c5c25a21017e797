//! ETSI GS QKD 014 V1.1.1 JSON data formats

use qkme_core::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum accepted request body (prevents DoS)
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Body too large: {0} bytes (max: {1})")]
    BodyTooLarge(usize, usize),

    #[error("Invalid query parameter {0}: {1}")]
    InvalidQuery(String, String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl From<ProtocolError> for KmeError {
    fn from(e: ProtocolError) -> Self {
        let parameter = match &e {
            ProtocolError::MalformedBody(_) | ProtocolError::BodyTooLarge(..) => "body".to_string(),
            ProtocolError::InvalidQuery(name, _) | ProtocolError::MissingField(name) => {
                name.clone()
            }
        };
        KmeError::Validation {
            message: e.to_string(),
            details: vec![ErrorDetail::new(parameter, e.to_string())],
        }
    }
}

/// Response to `GET /api/v1/keys/{slave_SAE_ID}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "source_KME_ID")]
    pub source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    pub target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    pub key_size: u32,
    pub stored_key_count: u64,
    pub max_key_count: u64,
    pub max_key_per_request: u32,
    pub max_key_size: u32,
    pub min_key_size: u32,
    #[serde(rename = "max_SAE_ID_count")]
    pub max_sae_id_count: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_extension: Option<Value>,
}

/// Body of `enc_keys`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u32>,
    #[serde(
        rename = "additional_slave_SAE_IDs",
        skip_serializing_if = "Vec::is_empty",
        default
    )]
    pub additional_slave_sae_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extension_mandatory: Vec<Map<String, Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extension_optional: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyIdEntry {
    #[serde(rename = "key_ID")]
    pub key_id: String,
    #[serde(
        rename = "key_ID_extension",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub key_id_extension: Option<Value>,
}

/// Body of `dec_keys`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyIds {
    #[serde(rename = "key_IDs")]
    pub key_ids: Vec<KeyIdEntry>,
    #[serde(
        rename = "key_IDs_extension",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub key_ids_extension: Option<Value>,
}

impl KeyIds {
    pub fn ids(&self) -> Vec<String> {
        self.key_ids.iter().map(|entry| entry.key_id.clone()).collect()
    }
}

/// One key in a container, material Base64-encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "key_ID")]
    pub key_id: String,
    pub key: String,
    #[serde(
        rename = "key_ID_extension",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub key_id_extension: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_extension: Option<Value>,
}

impl Key {
    pub fn new(key_id: &KeyId, material: &KeyMaterial) -> Self {
        Key {
            key_id: key_id.to_string(),
            key: material.to_base64(),
            key_id_extension: None,
            key_extension: None,
        }
    }
}

/// Response to `enc_keys` and `dec_keys`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyContainer {
    pub keys: Vec<Key>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_container_extension: Option<Value>,
}

/// ETSI error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub details: Vec<ErrorDetail>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorResponse {
            message: message.into(),
            details: Vec::new(),
        }
    }
}

impl From<&KmeError> for ErrorResponse {
    fn from(e: &KmeError) -> Self {
        ErrorResponse {
            message: e.public_message(),
            details: e.details().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_request_field_names() {
        let body = json!({
            "number": 2,
            "size": 256,
            "additional_slave_SAE_IDs": ["AAAAAAAAAAAAAAAA"],
            "extension_mandatory": [{"route_type": "direct"}],
        });
        let request: KeyRequest = serde_json::from_value(body).unwrap();

        assert_eq!(request.number, Some(2));
        assert_eq!(request.additional_slave_sae_ids, vec!["AAAAAAAAAAAAAAAA"]);
        assert_eq!(request.extension_mandatory.len(), 1);
        assert!(request.extension_optional.is_empty());
    }

    #[test]
    fn test_status_serializes_etsi_names() {
        let status = Status {
            source_kme_id: "AAAAAAAAAAAAAAAA".into(),
            target_kme_id: "BBBBBBBBBBBBBBBB".into(),
            master_sae_id: "MMMMMMMMMMMMMMMM".into(),
            slave_sae_id: "SSSSSSSSSSSSSSSS".into(),
            key_size: 256,
            stored_key_count: 10,
            max_key_count: 100,
            max_key_per_request: 128,
            max_key_size: 1024,
            min_key_size: 64,
            max_sae_id_count: 2,
            status_extension: None,
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["source_KME_ID"], "AAAAAAAAAAAAAAAA");
        assert_eq!(value["max_SAE_ID_count"], 2);
        assert!(value.get("status_extension").is_none());
    }

    #[test]
    fn test_container_omits_empty_extensions() {
        let key_id = KeyId::generate();
        let container = KeyContainer {
            keys: vec![Key::new(&key_id, &KeyMaterial::new(vec![0xff; 4]))],
            key_container_extension: None,
        };

        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["keys"][0]["key_ID"], key_id.to_string());
        assert_eq!(value["keys"][0]["key"], "/////w==");
        assert!(value["keys"][0].get("key_extension").is_none());
        assert!(value.get("key_container_extension").is_none());
    }

    #[test]
    fn test_error_response_hides_internal_detail() {
        let err = KmeError::Storage("fjall journal write failed".into());
        let body = ErrorResponse::from(&err);
        assert!(!body.message.contains("fjall"));
        assert!(body.details.is_empty());

        let err = KmeError::invalid("size", "must be a multiple of 8");
        let value = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(value["details"][0]["parameter"], "size");
    }
}
