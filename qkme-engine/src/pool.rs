//! Key pool store
//!
//! All key records and distribution grants live behind a single mutex.
//! Every public operation takes the lock once, so each state transition
//! (AVAILABLE -> RESERVED, RESERVED -> DELIVERED, `consumed_by += SAE`) is
//! a single serialized step. Durable writes happen inside the same critical
//! section; a failed write leaves the in-memory state untouched.
//!
//! Records are pooled at whatever size they were generated. A request for a
//! size with too few matching records is served by cutting keys out of the
//! oldest AVAILABLE material: the source records are held RESERVED with the
//! derived keys, retire on commit and return to the pool on rollback.

use crate::storage::{PersistentStore, StoreChanges};
use parking_lot::Mutex;
use qkme_core::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

#[derive(Default)]
struct PoolState {
    records: HashMap<KeyId, KeyRecord>,
    /// AVAILABLE records indexed by size, then by insertion sequence
    available: BTreeMap<u32, BTreeMap<u64, KeyId>>,
    grants: HashMap<KeyId, DistributionGrant>,
    next_sequence: u64,
}

impl PoolState {
    fn available_count(&self) -> u64 {
        self.available.values().map(|by_seq| by_seq.len() as u64).sum()
    }

    fn available_of_size(&self, size_bits: u32) -> usize {
        self.available.get(&size_bits).map_or(0, BTreeMap::len)
    }

    fn available_bits(&self) -> u64 {
        self.available
            .iter()
            .map(|(size, by_seq)| u64::from(*size) * by_seq.len() as u64)
            .sum()
    }

    /// Keys of `size_bits` obtainable by exact match or by cutting
    fn obtainable(&self, size_bits: u32) -> usize {
        if size_bits == 0 {
            return 0;
        }
        let exact = self.available_of_size(size_bits);
        exact.max((self.available_bits() / u64::from(size_bits)) as usize)
    }

    /// AVAILABLE records of every size in insertion order
    fn available_in_order(&self) -> Vec<KeyId> {
        let mut all: Vec<(u64, KeyId)> = self
            .available
            .values()
            .flat_map(|by_seq| by_seq.iter().map(|(seq, id)| (*seq, *id)))
            .collect();
        all.sort_unstable_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, id)| id).collect()
    }

    /// Mark an AVAILABLE record RESERVED and drop it from the index
    fn take_available(&mut self, key_id: &KeyId) -> Option<KeyRecord> {
        let record = self
            .records
            .get_mut(key_id)
            .filter(|r| r.state == KeyState::Available)?;
        record.state = KeyState::Reserved;
        let record = record.clone();
        self.unindex_available(&record);
        Some(record)
    }

    fn index_available(&mut self, record: &KeyRecord) {
        self.available
            .entry(record.size_bits)
            .or_default()
            .insert(record.sequence, record.key_id);
    }

    fn unindex_available(&mut self, record: &KeyRecord) {
        if let Some(by_seq) = self.available.get_mut(&record.size_bits) {
            by_seq.remove(&record.sequence);
            if by_seq.is_empty() {
                self.available.remove(&record.size_bits);
            }
        }
    }
}

/// Result of an attempt to reserve keys
#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(Vec<KeyRecord>),
    /// Not enough AVAILABLE keys of the requested size; nothing was reserved
    Shortfall { available: usize },
}

/// Counts from one expiry sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_available: usize,
    pub expired_delivered: usize,
    pub purged: usize,
}

/// Mutex-guarded set of key records and grants
pub struct KeyPoolStore {
    state: Mutex<PoolState>,
    persistence: Option<Arc<dyn PersistentStore>>,
    max_key_count: u64,
    retirement: MulticastRetirement,
    stored: AtomicU64,
}

impl KeyPoolStore {
    /// Create a store without durable backing
    pub fn in_memory(max_key_count: u64, retirement: MulticastRetirement) -> Self {
        KeyPoolStore {
            state: Mutex::new(PoolState::default()),
            persistence: None,
            max_key_count,
            retirement,
            stored: AtomicU64::new(0),
        }
    }

    /// Create a store backed by `persistence`, loading its current contents.
    /// Records left RESERVED by an interrupted request return to AVAILABLE.
    pub fn with_persistence(
        persistence: Arc<dyn PersistentStore>,
        max_key_count: u64,
        retirement: MulticastRetirement,
    ) -> Result<Self> {
        let snapshot = persistence.load()?;
        let mut state = PoolState::default();
        let mut recovered = Vec::new();

        for mut record in snapshot.records {
            if record.state == KeyState::Reserved {
                record.state = KeyState::Available;
                recovered.push(record.clone());
            }
            if record.state == KeyState::Available {
                state.index_available(&record);
            }
            state.next_sequence = state.next_sequence.max(record.sequence + 1);
            state.records.insert(record.key_id, record);
        }

        for grant in snapshot.grants {
            state.grants.insert(grant.key_id, grant);
        }

        if !recovered.is_empty() {
            warn!("Returning {} reserved keys to the pool after restart", recovered.len());
            persistence.save(&StoreChanges {
                upsert_records: recovered,
                ..Default::default()
            })?;
        }

        let stored = state.available_count();
        debug!(
            "Loaded key pool: {} records, {} available, {} grants",
            state.records.len(),
            stored,
            state.grants.len()
        );

        Ok(KeyPoolStore {
            state: Mutex::new(state),
            persistence: Some(persistence),
            max_key_count,
            retirement,
            stored: AtomicU64::new(stored),
        })
    }

    fn persist(&self, changes: &StoreChanges) -> Result<()> {
        match &self.persistence {
            Some(store) => store.save(changes),
            None => Ok(()),
        }
    }

    fn refresh_levels(&self, state: &PoolState) {
        self.stored.store(state.available_count(), Ordering::Release);
    }

    /// Cached pool aggregate
    pub fn levels(&self) -> PoolLevels {
        PoolLevels {
            stored_key_count: self.stored.load(Ordering::Acquire),
            max_key_count: self.max_key_count,
        }
    }

    /// Recompute the aggregate from the record set
    pub fn recompute_levels(&self) -> PoolLevels {
        let state = self.state.lock();
        self.refresh_levels(&state);
        self.levels()
    }

    pub fn max_key_count(&self) -> u64 {
        self.max_key_count
    }

    pub fn retirement(&self) -> MulticastRetirement {
        self.retirement
    }

    /// Total bits held by AVAILABLE records
    pub fn available_bits(&self) -> u64 {
        self.state.lock().available_bits()
    }

    /// Free capacity below `max_key_count`
    pub fn headroom(&self) -> u64 {
        self.max_key_count.saturating_sub(self.levels().stored_key_count)
    }

    /// Add freshly generated material. Material beyond capacity is discarded.
    pub fn insert(&self, materials: Vec<KeyMaterial>, ttl: Duration) -> Result<usize> {
        let mut state = self.state.lock();
        let room = self.max_key_count.saturating_sub(state.available_count()) as usize;
        if materials.len() > room {
            debug!("Discarding {} keys above pool capacity", materials.len() - room);
        }

        let mut sequence = state.next_sequence;
        let records: Vec<KeyRecord> = materials
            .into_iter()
            .take(room)
            .map(|material| {
                let record = KeyRecord::new(material, sequence, ttl);
                sequence += 1;
                record
            })
            .collect();

        if records.is_empty() {
            return Ok(0);
        }

        self.persist(&StoreChanges {
            upsert_records: records.clone(),
            ..Default::default()
        })?;

        state.next_sequence = sequence;
        let inserted = records.len();
        for record in records {
            state.index_available(&record);
            state.records.insert(record.key_id, record);
        }
        self.refresh_levels(&state);

        Ok(inserted)
    }

    /// Reserve `number` keys of `size_bits`, oldest first, or none at all
    pub fn reserve(self: &Arc<Self>, number: usize, size_bits: u32) -> Reservation {
        let (outcome, sources) = self.try_reserve(number, size_bits);
        Reservation {
            store: Arc::clone(self),
            outcome,
            sources,
            committed: false,
        }
    }

    fn try_reserve(&self, number: usize, size_bits: u32) -> (ReserveOutcome, Vec<KeyId>) {
        let mut state = self.state.lock();
        let available = state.obtainable(size_bits);
        if number == 0 || available < number {
            return (ReserveOutcome::Shortfall { available }, Vec::new());
        }

        if state.available_of_size(size_bits) >= number {
            let ids: Vec<KeyId> = match state.available.get(&size_bits) {
                Some(by_seq) => by_seq.values().take(number).copied().collect(),
                None => Vec::new(),
            };
            let reserved: Vec<KeyRecord> =
                ids.iter().filter_map(|id| state.take_available(id)).collect();
            self.refresh_levels(&state);
            return (ReserveOutcome::Reserved(reserved), Vec::new());
        }

        let (derived, sources) = Self::cut(&mut state, number, size_bits);
        self.refresh_levels(&state);
        debug!(
            "Cut {} x {}-bit keys from {} pooled records",
            derived.len(),
            size_bits,
            sources.len()
        );
        (ReserveOutcome::Reserved(derived), sources)
    }

    /// Derive `number` keys of `size_bits` from the oldest AVAILABLE material.
    /// The caller has checked that enough bits are pooled.
    fn cut(
        state: &mut PoolState,
        number: usize,
        size_bits: u32,
    ) -> (Vec<KeyRecord>, Vec<KeyId>) {
        let key_bytes = (size_bits / 8) as usize;
        let needed = key_bytes * number;

        let mut bits = Vec::with_capacity(needed);
        let mut sources = Vec::new();
        let mut expires_at: Option<SystemTime> = None;
        for key_id in state.available_in_order() {
            if bits.len() >= needed {
                break;
            }
            if let Some(source) = state.take_available(&key_id) {
                bits.extend_from_slice(source.material.as_bytes());
                expires_at = Some(match expires_at {
                    Some(at) => at.min(source.expires_at),
                    None => source.expires_at,
                });
                sources.push(key_id);
            }
        }

        let mut derived = Vec::with_capacity(number);
        for chunk in bits.chunks_exact(key_bytes).take(number) {
            let material = KeyMaterial::new(chunk.to_vec());
            let mut record = KeyRecord::new(material, state.next_sequence, Duration::ZERO);
            state.next_sequence += 1;
            record.state = KeyState::Reserved;
            record.expires_at = expires_at.unwrap_or(record.expires_at);
            state.records.insert(record.key_id, record.clone());
            derived.push(record);
        }

        // Leftover bits past the last key go with the sources
        let mut scratch = KeyMaterial::new(bits);
        scratch.wipe();

        (derived, sources)
    }

    /// Move reserved records to DELIVERED, store their grants and retire
    /// any records the keys were cut from
    fn commit(
        &self,
        records: &[KeyRecord],
        sources: &[KeyId],
        grants: Vec<DistributionGrant>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let mut updated = Vec::with_capacity(records.len() + sources.len());

        for grant in &grants {
            let record = state
                .records
                .get(&grant.key_id)
                .filter(|r| r.state == KeyState::Reserved)
                .ok_or_else(|| {
                    KmeError::Internal(format!("key {} is not reserved", grant.key_id))
                })?;
            let mut record = record.clone();
            record.state = KeyState::Delivered;
            record.expires_at = grant.expires_at;
            updated.push(record);
        }

        if updated.len() != records.len() {
            return Err(KmeError::Internal(
                "grant set does not match reservation".to_string(),
            ));
        }

        for key_id in sources {
            let mut source = state
                .records
                .get(key_id)
                .filter(|r| r.state == KeyState::Reserved)
                .cloned()
                .ok_or_else(|| {
                    KmeError::Internal(format!("source key {} is not reserved", key_id))
                })?;
            source.retire();
            updated.push(source);
        }

        self.persist(&StoreChanges {
            upsert_records: updated.clone(),
            upsert_grants: grants.clone(),
            ..Default::default()
        })?;

        for record in updated {
            state.records.insert(record.key_id, record);
        }
        for grant in grants {
            state.grants.insert(grant.key_id, grant);
        }

        Ok(())
    }

    /// Return reserved records to AVAILABLE at their original FIFO position.
    /// Keys cut from `sources` are discarded and the sources restored instead.
    fn rollback(&self, key_ids: &[KeyId], sources: &[KeyId]) {
        let mut state = self.state.lock();

        let restore = if sources.is_empty() {
            key_ids
        } else {
            for key_id in key_ids {
                if let Some(mut derived) = state.records.remove(key_id) {
                    derived.material.wipe();
                }
            }
            sources
        };

        let mut restored = 0;
        for key_id in restore {
            let record = match state.records.get_mut(key_id) {
                Some(record) if record.state == KeyState::Reserved => {
                    record.state = KeyState::Available;
                    record.clone()
                }
                _ => continue,
            };
            state.index_available(&record);
            restored += 1;
        }

        self.refresh_levels(&state);
        debug!("Rolled back {} reserved keys", restored);
    }

    /// Retire DELIVERED records among `key_ids` whose grant has lapsed
    fn retire_lapsed(
        &self,
        state: &mut PoolState,
        key_ids: &[KeyId],
        now: SystemTime,
    ) -> Result<()> {
        let mut changes = StoreChanges::default();
        for key_id in key_ids {
            let lapsed = state
                .records
                .get(key_id)
                .filter(|r| r.state == KeyState::Delivered && r.is_expired(now));
            if let Some(record) = lapsed {
                let mut retired = record.clone();
                retired.retire();
                changes.upsert_records.push(retired);
                changes.delete_grants.push(*key_id);
            }
        }

        if changes.is_empty() {
            return Ok(());
        }
        self.persist(&changes)?;

        for key_id in &changes.delete_grants {
            state.grants.remove(key_id);
        }
        for retired in changes.upsert_records {
            debug!("Key {} retired, grant lapsed before retrieval", retired.key_id);
            state.records.insert(retired.key_id, retired);
        }
        Ok(())
    }

    /// Record retrieval of `key_ids` by `requester` from keys issued to `master`.
    ///
    /// Records named in the batch whose grant has lapsed are retired first,
    /// whatever the outcome of the batch. Every key is then checked before
    /// anything else changes. `authorize` sees each key's grant, or `None`
    /// when the key has no live grant (unknown, retired or expired). Any
    /// failure aborts the whole batch.
    pub fn consume<F>(
        &self,
        requester: &SaeId,
        master: &SaeId,
        key_ids: &[KeyId],
        mut authorize: F,
    ) -> Result<Vec<KeyRecord>>
    where
        F: FnMut(&KeyId, Option<&DistributionGrant>) -> Result<()>,
    {
        let mut state = self.state.lock();
        let now = SystemTime::now();
        self.retire_lapsed(&mut state, key_ids, now)?;

        let mut grants = Vec::with_capacity(key_ids.len());
        let mut delivered = Vec::with_capacity(key_ids.len());
        let mut seen = HashSet::with_capacity(key_ids.len());

        for key_id in key_ids {
            if !seen.insert(*key_id) {
                return Err(KmeError::invalid(
                    "key_ID",
                    format!("{} appears more than once", key_id),
                ));
            }

            let record = state
                .records
                .get(key_id)
                .filter(|r| r.state == KeyState::Delivered && !r.is_expired(now));
            let grant = record.and_then(|_| state.grants.get(key_id));

            authorize(key_id, grant)?;

            let (record, grant) = match (record, grant) {
                (Some(record), Some(grant)) if &grant.master_sae_id == master => (record, grant),
                _ => {
                    return Err(KmeError::Authorization(format!(
                        "{} may not retrieve key {}",
                        requester, key_id
                    )))
                }
            };

            let mut grant = grant.clone();
            grant.record_consumption(requester)?;
            grants.push(grant);
            delivered.push(record.clone());
        }

        let mut changes = StoreChanges::default();
        for (grant, record) in grants.iter().zip(&delivered) {
            if grant.is_fully_consumed(self.retirement) {
                let mut retired = record.clone();
                retired.retire();
                changes.upsert_records.push(retired);
                changes.delete_grants.push(grant.key_id);
            } else {
                changes.upsert_grants.push(grant.clone());
            }
        }

        self.persist(&changes)?;

        for retired in changes.upsert_records {
            debug!("Key {} retired after retrieval", retired.key_id);
            state.grants.remove(&retired.key_id);
            state.records.insert(retired.key_id, retired);
        }
        for grant in changes.upsert_grants {
            state.grants.insert(grant.key_id, grant);
        }

        Ok(delivered)
    }

    /// Retire expired records and purge those retired longer than `retention`
    pub fn sweep(&self, now: SystemTime, retention: Duration) -> Result<SweepReport> {
        let mut state = self.state.lock();
        let mut report = SweepReport::default();
        let mut changes = StoreChanges::default();

        for record in state.records.values() {
            match record.state {
                KeyState::Available | KeyState::Delivered if record.is_expired(now) => {
                    let mut retired = record.clone();
                    retired.retire();
                    if record.state == KeyState::Available {
                        report.expired_available += 1;
                    } else {
                        report.expired_delivered += 1;
                        changes.delete_grants.push(record.key_id);
                    }
                    changes.upsert_records.push(retired);
                }
                KeyState::Retired if record.expires_at + retention <= now => {
                    report.purged += 1;
                    changes.delete_records.push(record.key_id);
                }
                _ => {}
            }
        }

        if changes.is_empty() {
            return Ok(report);
        }

        self.persist(&changes)?;

        for retired in changes.upsert_records {
            if let Some(previous) = state.records.get(&retired.key_id).cloned() {
                if previous.state == KeyState::Available {
                    state.unindex_available(&previous);
                }
            }
            state.records.insert(retired.key_id, retired);
        }
        for key_id in &changes.delete_grants {
            state.grants.remove(key_id);
        }
        for key_id in &changes.delete_records {
            state.records.remove(key_id);
        }
        self.refresh_levels(&state);

        Ok(report)
    }

    /// Current grant for a key, if any
    pub fn grant(&self, key_id: &KeyId) -> Option<DistributionGrant> {
        self.state.lock().grants.get(key_id).cloned()
    }

    /// Current state of a key, if the record still exists
    pub fn key_state(&self, key_id: &KeyId) -> Option<KeyState> {
        self.state.lock().records.get(key_id).map(|r| r.state)
    }

    /// Total number of records in any state
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

/// Keys held for one in-flight request.
///
/// Dropping a reservation that was not committed returns its keys to the
/// pool, so a cancelled or timed-out request never leaks key material.
pub struct Reservation {
    store: Arc<KeyPoolStore>,
    outcome: ReserveOutcome,
    /// Pooled records the reserved keys were cut from
    sources: Vec<KeyId>,
    committed: bool,
}

impl Reservation {
    pub fn outcome(&self) -> &ReserveOutcome {
        &self.outcome
    }

    /// Reserved records; empty on shortfall
    pub fn records(&self) -> &[KeyRecord] {
        match &self.outcome {
            ReserveOutcome::Reserved(records) => records,
            ReserveOutcome::Shortfall { .. } => &[],
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self.outcome, ReserveOutcome::Reserved(_))
    }

    /// Whether the keys were cut from pooled records of another size
    pub fn is_derived(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Finalize delivery: records become DELIVERED and grants are stored.
    /// On error the reservation is rolled back when dropped.
    pub fn commit(mut self, grants: Vec<DistributionGrant>) -> Result<Vec<KeyRecord>> {
        let records = match &self.outcome {
            ReserveOutcome::Reserved(records) => records.clone(),
            ReserveOutcome::Shortfall { .. } => {
                return Err(KmeError::Internal("cannot commit a shortfall".to_string()))
            }
        };

        self.store.commit(&records, &self.sources, grants)?;
        self.committed = true;
        Ok(records)
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("outcome", &self.outcome)
            .field("sources", &self.sources)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let ReserveOutcome::Reserved(records) = &self.outcome {
            let ids: Vec<KeyId> = records.iter().map(|r| r.key_id).collect();
            self.store.rollback(&ids, &self.sources);
        }
    }
}
