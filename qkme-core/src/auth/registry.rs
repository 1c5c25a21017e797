//! SAE registry
//!
//! Registry entries are created out-of-band by admin tooling. The KME only
//! reads them, but the in-memory registry can be reloaded while running.

use crate::{
    auth::{fingerprints_match, PeerCertificate},
    KmeError, Result, SaeId, SaeIdentity, SaeStatus,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Lookup interface over registered SAEs
pub trait SaeRegistry: Send + Sync {
    /// Fetch the current registration of an SAE
    fn lookup(&self, sae_id: &SaeId) -> Option<SaeIdentity>;

    /// Check the presented certificate against the registered fingerprint
    fn verify_fingerprint(&self, sae_id: &SaeId, cert: &PeerCertificate) -> bool {
        match self.lookup(sae_id) {
            Some(identity) => fingerprints_match(&cert.fingerprint, &identity.fingerprint),
            None => false,
        }
    }
}

/// On-disk registry document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    pub saes: Vec<SaeIdentity>,
}

/// Registry held in memory, optionally loaded from a JSON document
#[derive(Debug, Default)]
pub struct InMemorySaeRegistry {
    entries: RwLock<HashMap<SaeId, SaeIdentity>>,
}

impl InMemorySaeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of identities; later duplicates win
    pub fn from_identities(identities: impl IntoIterator<Item = SaeIdentity>) -> Self {
        let entries = identities
            .into_iter()
            .map(|identity| (identity.sae_id.clone(), identity))
            .collect();

        InMemorySaeRegistry {
            entries: RwLock::new(entries),
        }
    }

    /// Load a registry document written by admin tooling
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let registry = Self::new();
        registry.reload(path)?;
        Ok(registry)
    }

    /// Replace all entries with the contents of `path`
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = std::fs::read(path.as_ref())?;
        let file: RegistryFile = serde_json::from_slice(&bytes)?;

        let mut entries = HashMap::with_capacity(file.saes.len());
        for identity in file.saes {
            if identity.fingerprint.is_empty() {
                return Err(KmeError::Internal(format!(
                    "registry entry {} has no certificate fingerprint",
                    identity.sae_id
                )));
            }
            entries.insert(identity.sae_id.clone(), identity);
        }

        let count = entries.len();
        *self.entries.write() = entries;
        tracing::info!("Loaded {} SAE registry entries", count);
        Ok(count)
    }

    /// Insert or replace an entry
    pub fn upsert(&self, identity: SaeIdentity) {
        self.entries.write().insert(identity.sae_id.clone(), identity);
    }

    /// Change the status of a registered SAE
    pub fn set_status(&self, sae_id: &SaeId, status: SaeStatus) -> Result<()> {
        match self.entries.write().get_mut(sae_id) {
            Some(identity) => {
                identity.status = status;
                Ok(())
            }
            None => Err(KmeError::Internal(format!("SAE {} is not registered", sae_id))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SaeRegistry for InMemorySaeRegistry {
    fn lookup(&self, sae_id: &SaeId) -> Option<SaeIdentity> {
        self.entries.read().get(sae_id).cloned()
    }
}
