//! Core data types for qkme

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::{KmeError, Result};

/// Length of SAE and KME identifiers
pub const ID_LEN: usize = 16;

fn validate_id(parameter: &str, value: &str) -> Result<()> {
    if value.len() != ID_LEN {
        return Err(KmeError::invalid(
            parameter,
            format!("must be exactly {} characters, got {}", ID_LEN, value.len()),
        ));
    }

    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(KmeError::invalid(
            parameter,
            "must contain only ASCII letters and digits",
        ));
    }

    Ok(())
}

/// Secure Application Entity identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SaeId(String);

impl SaeId {
    /// Create a new SAE ID with validation
    pub fn new(id: &str) -> Result<Self> {
        validate_id("SAE_ID", id)?;
        Ok(SaeId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SaeId {
    type Error = KmeError;

    fn try_from(value: String) -> Result<Self> {
        validate_id("SAE_ID", &value)?;
        Ok(SaeId(value))
    }
}

impl From<SaeId> for String {
    fn from(id: SaeId) -> String {
        id.0
    }
}

impl fmt::Display for SaeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key Management Entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KmeId(String);

impl KmeId {
    pub fn new(id: &str) -> Result<Self> {
        validate_id("KME_ID", id)?;
        Ok(KmeId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for KmeId {
    type Error = KmeError;

    fn try_from(value: String) -> Result<Self> {
        validate_id("KME_ID", &value)?;
        Ok(KmeId(value))
    }
}

impl From<KmeId> for String {
    fn from(id: KmeId) -> String {
        id.0
    }
}

impl fmt::Display for KmeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key identifier, always issued as UUIDv4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Issue a fresh random key ID
    pub fn generate() -> Self {
        KeyId(Uuid::new_v4())
    }

    /// Parse a key ID received from a client
    pub fn parse(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(KeyId)
            .map_err(|_| KmeError::invalid("key_ID", format!("'{}' is not a valid UUID", value)))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Raw key bytes. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        KeyMaterial(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key in bits
    pub fn bit_len(&self) -> u32 {
        (self.0.len() * 8) as u32
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Overwrite the material in place and drop it
    pub fn wipe(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = 0;
        }
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bits)", self.bit_len())
    }
}

/// Lifecycle state of a key record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyState {
    Available,
    Reserved,
    Delivered,
    Retired,
}

/// A unit of key material tracked by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub material: KeyMaterial,
    pub size_bits: u32,
    pub state: KeyState,
    /// Monotonic insertion order, used for FIFO hand-out
    pub sequence: u64,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl KeyRecord {
    /// Create a fresh AVAILABLE record
    pub fn new(material: KeyMaterial, sequence: u64, ttl: Duration) -> Self {
        let created_at = SystemTime::now();
        KeyRecord {
            key_id: KeyId::generate(),
            size_bits: material.bit_len(),
            material,
            state: KeyState::Available,
            sequence,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Move to RETIRED and destroy the material.
    /// `expires_at` is pulled forward so it doubles as the retirement time.
    pub fn retire(&mut self) {
        self.state = KeyState::Retired;
        self.material.wipe();
        self.expires_at = self.expires_at.min(SystemTime::now());
    }
}

/// Registration status of an SAE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaeStatus {
    Active,
    Inactive,
    Suspended,
    Revoked,
    Expired,
}

impl fmt::Display for SaeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaeStatus::Active => "active",
            SaeStatus::Inactive => "inactive",
            SaeStatus::Suspended => "suspended",
            SaeStatus::Revoked => "revoked",
            SaeStatus::Expired => "expired",
        };
        write!(f, "{}", name)
    }
}

/// Per-SAE capability limits advertised in the status response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaeLimits {
    pub max_key_per_request: u32,
    pub max_key_size: u32,
    pub min_key_size: u32,
    #[serde(rename = "max_SAE_ID_count")]
    pub max_sae_id_count: u32,
}

impl Default for SaeLimits {
    fn default() -> Self {
        SaeLimits {
            max_key_per_request: 128,
            max_key_size: 1024,
            min_key_size: 64,
            max_sae_id_count: 2,
        }
    }
}

/// A registered SAE as seen by the KME
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaeIdentity {
    pub sae_id: SaeId,
    /// Lowercase hex SHA-256 of the DER client certificate
    pub fingerprint: String,
    pub status: SaeStatus,
    #[serde(default)]
    pub limits: SaeLimits,
}

impl SaeIdentity {
    pub fn is_active(&self) -> bool {
        self.status == SaeStatus::Active
    }
}

/// What happens to a multicast key once a slave retrieves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MulticastRetirement {
    /// Retire only after every authorized slave has retrieved the key
    #[default]
    AllSlaves,
    /// Retire after the first authorized slave retrieves the key
    FirstSlave,
}

/// Record of which SAEs may retrieve a delivered key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionGrant {
    pub key_id: KeyId,
    pub master_sae_id: SaeId,
    pub authorized_slave_sae_ids: BTreeSet<SaeId>,
    pub consumed_by: BTreeSet<SaeId>,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl DistributionGrant {
    pub fn new(
        key_id: KeyId,
        master_sae_id: SaeId,
        authorized_slave_sae_ids: BTreeSet<SaeId>,
        expires_at: SystemTime,
    ) -> Self {
        DistributionGrant {
            key_id,
            master_sae_id,
            authorized_slave_sae_ids,
            consumed_by: BTreeSet::new(),
            created_at: SystemTime::now(),
            expires_at,
        }
    }

    pub fn is_authorized(&self, sae_id: &SaeId) -> bool {
        self.authorized_slave_sae_ids.contains(sae_id)
    }

    pub fn has_consumed(&self, sae_id: &SaeId) -> bool {
        self.consumed_by.contains(sae_id)
    }

    /// Add a consumer, keeping `consumed_by` a subset of the authorized set
    pub fn record_consumption(&mut self, sae_id: &SaeId) -> Result<()> {
        if !self.is_authorized(sae_id) {
            return Err(KmeError::Authorization(format!(
                "{} is not authorized for key {}",
                sae_id, self.key_id
            )));
        }

        if !self.consumed_by.insert(sae_id.clone()) {
            return Err(KmeError::Authorization(format!(
                "key {} already retrieved by {}",
                self.key_id, sae_id
            )));
        }

        Ok(())
    }

    pub fn is_fully_consumed(&self, policy: MulticastRetirement) -> bool {
        match policy {
            MulticastRetirement::AllSlaves => self.consumed_by == self.authorized_slave_sae_ids,
            MulticastRetirement::FirstSlave => !self.consumed_by.is_empty(),
        }
    }
}

/// Cached aggregate of the key pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolLevels {
    pub stored_key_count: u64,
    pub max_key_count: u64,
}

/// A named extension parameter taken from a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionParameter {
    pub name: String,
    pub value: serde_json::Value,
    pub mandatory: bool,
}
