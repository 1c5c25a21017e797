//! Request routing and decoding

use crate::protocol::{KeyIdEntry, KeyIds, KeyRequest, ProtocolError, MAX_BODY_SIZE};
use qkme_core::*;
use serde::de::DeserializeOwned;

/// Path prefix of every ETSI GS QKD 014 endpoint
pub const API_PREFIX: &str = "/api/v1/keys/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Status,
    EncKeys,
    DecKeys,
}

impl Endpoint {
    /// Name of the path SAE_ID parameter for this endpoint
    pub fn sae_parameter(&self) -> &'static str {
        match self {
            Endpoint::Status | Endpoint::EncKeys => "slave_SAE_ID",
            Endpoint::DecKeys => "master_SAE_ID",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Status => write!(f, "status"),
            Endpoint::EncKeys => write!(f, "enc_keys"),
            Endpoint::DecKeys => write!(f, "dec_keys"),
        }
    }
}

/// A routed API request: the SAE_ID from the path and the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRoute {
    pub sae_id: SaeId,
    pub endpoint: Endpoint,
}

/// Parse "/api/v1/keys/{SAE_ID}/{operation}".
///
/// Returns `Ok(None)` for paths outside the API and a validation error
/// when the path names a known operation with a malformed SAE_ID.
pub fn parse_api_path(path: &str) -> Result<Option<ApiRoute>> {
    let rest = match path.strip_prefix(API_PREFIX) {
        Some(rest) => rest.trim_end_matches('/'),
        None => return Ok(None),
    };

    let (sae_id, operation) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return Ok(None),
    };

    let endpoint = match operation {
        "status" => Endpoint::Status,
        "enc_keys" => Endpoint::EncKeys,
        "dec_keys" => Endpoint::DecKeys,
        _ => return Ok(None),
    };

    let sae_id = SaeId::new(sae_id).map_err(|_| {
        KmeError::invalid(
            endpoint.sae_parameter(),
            format!("'{}' is not a 16-character alphanumeric SAE_ID", sae_id),
        )
    })?;

    Ok(Some(ApiRoute { sae_id, endpoint }))
}

fn decode_json<T: DeserializeOwned + Default>(body: &[u8]) -> std::result::Result<T, ProtocolError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(body.len(), MAX_BODY_SIZE));
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedBody(e.to_string()))
}

/// Decode an `enc_keys` POST body. An empty body means all defaults.
pub fn decode_key_request(body: &[u8]) -> std::result::Result<KeyRequest, ProtocolError> {
    decode_json(body)
}

/// Decode a `dec_keys` POST body
pub fn decode_key_ids(body: &[u8]) -> std::result::Result<KeyIds, ProtocolError> {
    let key_ids: KeyIds = decode_json(body)?;
    if key_ids.key_ids.is_empty() {
        return Err(ProtocolError::MissingField("key_IDs".to_string()));
    }
    Ok(key_ids)
}

fn query_pairs(query: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn parse_number(name: &str, value: &str) -> std::result::Result<u32, ProtocolError> {
    value.parse().map_err(|_| {
        ProtocolError::InvalidQuery(name.to_string(), format!("'{}' is not a number", value))
    })
}

/// Build a key request from `GET .../enc_keys?number=N&size=S`
pub fn parse_enc_keys_query(query: Option<&str>) -> std::result::Result<KeyRequest, ProtocolError> {
    let mut request = KeyRequest::default();
    for (name, value) in query_pairs(query) {
        match name {
            "number" => request.number = Some(parse_number(name, value)?),
            "size" => request.size = Some(parse_number(name, value)?),
            _ => {}
        }
    }
    Ok(request)
}

/// Build a key ID list from `GET .../dec_keys?key_ID=...`. The parameter may repeat.
pub fn parse_dec_keys_query(query: Option<&str>) -> std::result::Result<KeyIds, ProtocolError> {
    let key_ids: Vec<KeyIdEntry> = query_pairs(query)
        .filter(|(name, _)| *name == "key_ID")
        .map(|(_, value)| KeyIdEntry {
            key_id: value.to_string(),
            key_id_extension: None,
        })
        .collect();

    if key_ids.is_empty() {
        return Err(ProtocolError::MissingField("key_ID".to_string()));
    }

    Ok(KeyIds {
        key_ids,
        key_ids_extension: None,
    })
}
