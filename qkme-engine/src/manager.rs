//! Key pool manager
//!
//! Sits between the distribution engine and the pool store. It answers
//! status queries, reserves keys with the exhaustion policy applied, and
//! keeps the pool topped up from the key generator.

use crate::generator::KeyGenerator;
use crate::pool::{KeyPoolStore, Reservation, ReserveOutcome, SweepReport};
use qkme_core::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunables for one key pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Key size in bits used when a request omits `size`, and the size of
    /// generated material
    pub default_key_size: u32,
    pub max_key_count: u64,
    /// Lifetime of an AVAILABLE key
    pub key_ttl: Duration,
    /// Lifetime of a grant once a key is delivered
    pub grant_ttl: Duration,
    /// Background replenishment starts below this many AVAILABLE keys
    pub low_watermark: u64,
    pub replenish_batch: usize,
    /// Largest deficit, in default-size keys, served by a synchronous top-up
    pub emergency_max_keys: usize,
    pub emergency_timeout: Duration,
    /// How long RETIRED records are kept before purging
    pub retired_retention: Duration,
    pub retirement: MulticastRetirement,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            default_key_size: 256,
            max_key_count: 1000,
            key_ttl: Duration::from_secs(24 * 3600),
            grant_ttl: Duration::from_secs(3600),
            low_watermark: 250,
            replenish_batch: 64,
            emergency_max_keys: 16,
            emergency_timeout: Duration::from_secs(2),
            retired_retention: Duration::from_secs(600),
            retirement: MulticastRetirement::AllSlaves,
        }
    }
}

/// Snapshot returned by [`KeyPoolManager::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub levels: PoolLevels,
    pub limits: SaeLimits,
    pub key_size: u32,
    pub low_watermark: u64,
    pub replenishing: bool,
}

/// Clears the single-flight flag when the replenishment job ends
struct ReplenishFlag(Arc<AtomicBool>);

impl ReplenishFlag {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReplenishFlag(Arc::clone(flag)))
    }
}

impl Drop for ReplenishFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct KeyPoolManager {
    store: Arc<KeyPoolStore>,
    generator: Arc<dyn KeyGenerator>,
    config: Arc<PoolConfig>,
    top_up: Arc<tokio::sync::Mutex<()>>,
    replenishing: Arc<AtomicBool>,
}

impl KeyPoolManager {
    pub fn new(
        store: Arc<KeyPoolStore>,
        generator: Arc<dyn KeyGenerator>,
        config: PoolConfig,
    ) -> Self {
        KeyPoolManager {
            store,
            generator,
            config: Arc::new(config),
            top_up: Arc::new(tokio::sync::Mutex::new(())),
            replenishing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<KeyPoolStore> {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_replenishing(&self) -> bool {
        self.replenishing.load(Ordering::Acquire)
    }

    /// Pool levels and the caller's limits. Refreshes the cached aggregate.
    pub fn status(&self, caller: &SaeIdentity) -> PoolStatus {
        PoolStatus {
            levels: self.store.recompute_levels(),
            limits: caller.limits,
            key_size: self.config.default_key_size,
            low_watermark: self.config.low_watermark,
            replenishing: self.is_replenishing(),
        }
    }

    /// Reserve `number` keys of `size_bits` for `master`.
    ///
    /// Keys of any size are served from pooled material, cut to length when
    /// no records of that size are left. A small deficit is covered by one
    /// synchronous top-up bounded by `emergency_timeout`. Otherwise background
    /// replenishment is queued and the request fails with
    /// `ResourceExhausted`, leaving the pool as it was.
    pub async fn reserve(
        &self,
        number: usize,
        size_bits: u32,
        master: &SaeId,
    ) -> Result<Reservation> {
        let reservation = self.store.reserve(number, size_bits);
        if reservation.is_reserved() {
            debug!("Reserved {} x {}-bit keys for {}", number, size_bits, master);
            self.check_watermark();
            return Ok(reservation);
        }
        let available = match reservation.outcome() {
            ReserveOutcome::Shortfall { available } => *available,
            ReserveOutcome::Reserved(_) => 0,
        };
        drop(reservation);

        if self.emergency_top_up(number, size_bits).await? {
            let reservation = self.store.reserve(number, size_bits);
            if reservation.is_reserved() {
                debug!("Reserved {} x {}-bit keys for {} after top-up", number, size_bits, master);
                self.check_watermark();
                return Ok(reservation);
            }
        }

        self.trigger_replenishment();
        warn!(
            "Key pool exhausted: {} requested {} x {}-bit keys, {} available",
            master, number, size_bits, available
        );
        Err(KmeError::ResourceExhausted(format!(
            "{} keys of {} bits requested, {} available",
            number, size_bits, available
        )))
    }

    /// Default-size keys needed to pool `bits` more bits
    fn keys_for_bits(&self, bits: u64) -> usize {
        let unit = u64::from(self.config.default_key_size.max(8));
        bits.div_ceil(unit) as usize
    }

    /// Generate the missing material in place, bounded by the emergency
    /// timeout. Material is only added when it covers the whole deficit.
    async fn emergency_top_up(&self, number: usize, size_bits: u32) -> Result<bool> {
        let attempt = async {
            let _serialized = self.top_up.lock().await;

            let wanted = number as u64 * u64::from(size_bits);
            let pooled = self.store.available_bits();
            if pooled >= wanted {
                return Ok(true);
            }
            let deficit = self.keys_for_bits(wanted - pooled);
            if deficit > self.config.emergency_max_keys {
                debug!(
                    "Deficit of {} keys is above the emergency limit {}",
                    deficit, self.config.emergency_max_keys
                );
                return Ok(false);
            }
            if (self.store.headroom() as usize) < deficit {
                debug!("No headroom for a {}-key top-up", deficit);
                return Ok(false);
            }

            let materials = match self.generate(deficit, self.config.default_key_size).await {
                Ok(materials) => materials,
                Err(e) => {
                    warn!("Emergency top-up failed: {}", e);
                    return Ok(false);
                }
            };
            if materials.len() < deficit {
                debug!("Top-up produced {} of {} keys, discarding", materials.len(), deficit);
                return Ok(false);
            }

            let inserted = self.store.insert(materials, self.config.key_ttl)?;
            Ok::<_, KmeError>(inserted >= deficit)
        };

        match tokio::time::timeout(self.config.emergency_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Emergency top-up for {}-bit keys timed out after {:?}",
                    size_bits, self.config.emergency_timeout
                );
                Ok(false)
            }
        }
    }

    async fn generate(&self, count: usize, size_bits: u32) -> Result<Vec<KeyMaterial>> {
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || generator.generate(count, size_bits))
            .await
            .map_err(|e| KmeError::Internal(format!("key generation task failed: {}", e)))?
    }

    /// Queue a background replenishment job unless one is already running.
    /// Returns whether a job was started.
    pub fn trigger_replenishment(&self) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        let Some(flag) = ReplenishFlag::acquire(&self.replenishing) else {
            return false;
        };

        let manager = self.clone();
        handle.spawn(async move {
            let _flag = flag;
            match manager.fill().await {
                Ok(0) => debug!("Replenishment added no keys"),
                Ok(added) => info!("Replenishment added {} keys", added),
                Err(e) => warn!("Replenishment failed: {}", e),
            }
        });
        true
    }

    /// Run a replenishment pass now. Returns 0 when another job is in flight.
    pub async fn replenish(&self) -> Result<usize> {
        let Some(_flag) = ReplenishFlag::acquire(&self.replenishing) else {
            return Ok(0);
        };
        self.fill().await
    }

    /// Fill the pool to capacity with default-size keys
    async fn fill(&self) -> Result<usize> {
        let mut added = 0;
        loop {
            let headroom = self.store.headroom() as usize;
            if headroom == 0 {
                break;
            }

            let count = headroom.min(self.config.replenish_batch);
            let materials = self.generate(count, self.config.default_key_size).await?;
            if materials.is_empty() {
                break;
            }
            added += self.store.insert(materials, self.config.key_ttl)?;
        }
        Ok(added)
    }

    /// Queue replenishment if the pool is below its low watermark
    pub fn check_watermark(&self) -> bool {
        let stored = self.store.levels().stored_key_count;
        if stored < self.config.low_watermark {
            debug!(
                "Pool at {} keys, below watermark {}",
                stored, self.config.low_watermark
            );
            return self.trigger_replenishment();
        }
        false
    }

    /// Retire expired keys and purge old retired ones
    pub fn sweep(&self) -> Result<SweepReport> {
        self.store.sweep(SystemTime::now(), self.config.retired_retention)
    }

    /// Spawn the periodic sweep and watermark check
    pub fn run_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match manager.sweep() {
                    Ok(report) if report != SweepReport::default() => info!(
                        "Sweep retired {} available and {} delivered keys, purged {}",
                        report.expired_available, report.expired_delivered, report.purged
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Sweep failed: {}", e),
                }
                manager.check_watermark();
            }
        })
    }
}
