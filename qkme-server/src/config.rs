//! KME configuration file

use anyhow::{bail, Context};
use qkme_core::{KmeId, MulticastRetirement, SaeLimits};
use qkme_engine::PoolConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Certificate material for the mTLS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain presented to SAEs
    pub cert: PathBuf,
    /// PEM private key for `cert`
    pub key: PathBuf,
    /// PEM bundle of CAs that issue SAE client certificates
    pub client_ca: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub default_key_size: u32,
    pub max_key_count: u64,
    pub key_ttl_secs: u64,
    pub grant_ttl_secs: u64,
    pub low_watermark: u64,
    pub replenish_batch: usize,
    pub emergency_max_keys: usize,
    pub emergency_timeout_ms: u64,
    pub retired_retention_secs: u64,
    pub retirement: MulticastRetirement,
    pub maintenance_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        PoolSettings {
            default_key_size: pool.default_key_size,
            max_key_count: pool.max_key_count,
            key_ttl_secs: pool.key_ttl.as_secs(),
            grant_ttl_secs: pool.grant_ttl.as_secs(),
            low_watermark: pool.low_watermark,
            replenish_batch: pool.replenish_batch,
            emergency_max_keys: pool.emergency_max_keys,
            emergency_timeout_ms: pool.emergency_timeout.as_millis() as u64,
            retired_retention_secs: pool.retired_retention.as_secs(),
            retirement: pool.retirement,
            maintenance_interval_secs: 30,
        }
    }
}

/// Parameters of the simulated QKD link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub latency_ms: u64,
    pub max_batch: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            latency_ms: 5,
            max_batch: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmeConfig {
    /// This KME, reported as `source_KME_ID`
    pub kme_id: String,
    /// KME at the other end of the QKD link, reported as `target_KME_ID`
    pub peer_kme_id: String,
    pub bind: SocketAddr,
    /// fjall directory; keys are kept in memory only when unset
    pub data_dir: Option<PathBuf>,
    /// SAE registry document written by admin tooling
    pub registry: PathBuf,
    /// Append-only JSON-lines audit file
    pub audit_log: Option<PathBuf>,
    pub tls: Option<TlsSettings>,
    pub request_timeout_ms: u64,
    pub pool: PoolSettings,
    pub link: LinkSettings,
}

impl Default for KmeConfig {
    fn default() -> Self {
        KmeConfig {
            kme_id: "KME0000000000001".to_string(),
            peer_kme_id: "KME0000000000002".to_string(),
            bind: SocketAddr::from(([127, 0, 0, 1], 8443)),
            data_dir: None,
            registry: PathBuf::from("registry.json"),
            audit_log: None,
            tls: None,
            request_timeout_ms: 5_000,
            pool: PoolSettings::default(),
            link: LinkSettings::default(),
        }
    }
}

impl KmeConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: KmeConfig = serde_json::from_slice(&data)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings the KME cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        KmeId::new(&self.kme_id).context("kme_id")?;
        KmeId::new(&self.peer_kme_id).context("peer_kme_id")?;

        let pool = &self.pool;
        if pool.default_key_size == 0 || pool.default_key_size % 8 != 0 {
            bail!("pool.default_key_size must be a positive multiple of 8");
        }
        let limits = SaeLimits::default();
        if pool.default_key_size < limits.min_key_size || pool.default_key_size > limits.max_key_size
        {
            bail!("pool.default_key_size is outside the default SAE key size limits");
        }
        if pool.max_key_count == 0 {
            bail!("pool.max_key_count must be at least 1");
        }
        if pool.low_watermark > pool.max_key_count {
            bail!("pool.low_watermark cannot exceed pool.max_key_count");
        }
        if pool.replenish_batch == 0 {
            bail!("pool.replenish_batch must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            default_key_size: pool.default_key_size,
            max_key_count: pool.max_key_count,
            key_ttl: Duration::from_secs(pool.key_ttl_secs),
            grant_ttl: Duration::from_secs(pool.grant_ttl_secs),
            low_watermark: pool.low_watermark,
            replenish_batch: pool.replenish_batch,
            emergency_max_keys: pool.emergency_max_keys,
            emergency_timeout: Duration::from_millis(pool.emergency_timeout_ms),
            retired_retention: Duration::from_secs(pool.retired_retention_secs),
            retirement: pool.retirement,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.pool.maintenance_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = KmeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool_config().default_key_size, 256);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"kme_id": "AAAAAAAAAAAAAAAA", "pool": {{"max_key_count": 50, "retirement": "first_slave"}}}}"#
        )
        .unwrap();

        let config = KmeConfig::load(file.path()).unwrap();
        assert_eq!(config.kme_id, "AAAAAAAAAAAAAAAA");
        assert_eq!(config.pool.max_key_count, 50);
        assert_eq!(config.pool.retirement, MulticastRetirement::FirstSlave);
        assert_eq!(config.pool.default_key_size, 256);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = KmeConfig::default();
        config.kme_id = "bad".to_string();
        assert!(config.validate().is_err());

        let mut config = KmeConfig::default();
        config.pool.default_key_size = 100;
        assert!(config.validate().is_err());

        let mut config = KmeConfig::default();
        config.pool.low_watermark = config.pool.max_key_count + 1;
        assert!(config.validate().is_err());
    }
}
