//! Durable persistence for key records and distribution grants using fjall

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use qkme_core::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const RECORDS_PARTITION: &str = "key_records";
const GRANTS_PARTITION: &str = "grants";

/// Full contents of the backing store
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub records: Vec<KeyRecord>,
    pub grants: Vec<DistributionGrant>,
}

/// A set of mutations written as one atomic batch
#[derive(Debug, Default)]
pub struct StoreChanges {
    pub upsert_records: Vec<KeyRecord>,
    pub delete_records: Vec<KeyId>,
    pub upsert_grants: Vec<DistributionGrant>,
    pub delete_grants: Vec<KeyId>,
}

impl StoreChanges {
    pub fn is_empty(&self) -> bool {
        self.upsert_records.is_empty()
            && self.delete_records.is_empty()
            && self.upsert_grants.is_empty()
            && self.delete_grants.is_empty()
    }
}

/// Load/Save interface of the backing store
pub trait PersistentStore: Send + Sync {
    /// Read every record and grant
    fn load(&self) -> Result<StoreSnapshot>;

    /// Apply `changes` atomically and make them durable
    fn save(&self, changes: &StoreChanges) -> Result<()>;
}

/// Record as written to disk, with an integrity checksum over the material
#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    record: KeyRecord,
    checksum: String,
}

impl PersistedRecord {
    fn new(record: &KeyRecord) -> Self {
        PersistedRecord {
            checksum: checksum(&record.material),
            record: record.clone(),
        }
    }
}

fn checksum(material: &KeyMaterial) -> String {
    blake3::hash(material.as_bytes()).to_hex().to_string()
}

fn storage_err(e: impl std::fmt::Display) -> KmeError {
    KmeError::Storage(e.to_string())
}

/// fjall-backed store with one partition for records and one for grants
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    records: PartitionHandle,
    grants: PartitionHandle,
}

impl FjallStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = Config::new(path).open().map_err(storage_err)?;

        let records = keyspace
            .open_partition(RECORDS_PARTITION, PartitionCreateOptions::default())
            .map_err(storage_err)?;
        let grants = keyspace
            .open_partition(GRANTS_PARTITION, PartitionCreateOptions::default())
            .map_err(storage_err)?;

        Ok(FjallStore {
            keyspace: Arc::new(keyspace),
            records,
            grants,
        })
    }

    /// Create temporary store for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir().map_err(|e| KmeError::Internal(e.to_string()))?;
        let store = Self::open(temp_dir.path())?;
        Ok((store, temp_dir))
    }
}

impl PersistentStore for FjallStore {
    fn load(&self) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::default();

        for item in self.records.iter() {
            let (_, value) = item.map_err(storage_err)?;
            let persisted: PersistedRecord = serde_json::from_slice(&value)?;

            if persisted.record.state != KeyState::Retired
                && checksum(&persisted.record.material) != persisted.checksum
            {
                return Err(KmeError::Storage(format!(
                    "checksum mismatch for key {}",
                    persisted.record.key_id
                )));
            }
            snapshot.records.push(persisted.record);
        }

        for item in self.grants.iter() {
            let (_, value) = item.map_err(storage_err)?;
            snapshot.grants.push(serde_json::from_slice(&value)?);
        }

        Ok(snapshot)
    }

    fn save(&self, changes: &StoreChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut batch = self.keyspace.batch();

        for record in &changes.upsert_records {
            let value = serde_json::to_vec(&PersistedRecord::new(record))?;
            batch.insert(&self.records, record.key_id.as_bytes().to_vec(), value);
        }
        for key_id in &changes.delete_records {
            batch.remove(&self.records, key_id.as_bytes().to_vec());
        }
        for grant in &changes.upsert_grants {
            let value = serde_json::to_vec(grant)?;
            batch.insert(&self.grants, grant.key_id.as_bytes().to_vec(), value);
        }
        for key_id in &changes.delete_grants {
            batch.remove(&self.grants, key_id.as_bytes().to_vec());
        }

        batch.commit().map_err(storage_err)?;
        // Journal data only; file metadata is not needed to replay the batch
        self.keyspace
            .persist(PersistMode::SyncData)
            .map_err(storage_err)
    }
}
