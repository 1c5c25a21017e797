//! Key distribution engine
//!
//! `request_keys` serves `enc_keys`: it validates the request against the
//! master's limits, reserves keys and records one grant per key.
//! `retrieve_keys_by_id` serves `dec_keys`: it hands each key to an
//! authorized slave at most once.

use crate::audit::Operation;
use crate::authorization::{AuthorizationEngine, AuthzTarget};
use crate::manager::KeyPoolManager;
use qkme_core::auth::SaeRegistry;
use qkme_core::extensions::AppliedExtensions;
use qkme_core::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// A key handed to an SAE
#[derive(Debug, Clone)]
pub struct DeliveredKey {
    pub key_id: KeyId,
    pub material: KeyMaterial,
}

impl From<KeyRecord> for DeliveredKey {
    fn from(record: KeyRecord) -> Self {
        DeliveredKey {
            key_id: record.key_id,
            material: record.material,
        }
    }
}

#[derive(Clone)]
pub struct KeyDistributionEngine {
    manager: KeyPoolManager,
    authz: AuthorizationEngine,
    registry: Arc<dyn SaeRegistry>,
}

impl KeyDistributionEngine {
    pub fn new(
        manager: KeyPoolManager,
        authz: AuthorizationEngine,
        registry: Arc<dyn SaeRegistry>,
    ) -> Self {
        KeyDistributionEngine {
            manager,
            authz,
            registry,
        }
    }

    pub fn manager(&self) -> &KeyPoolManager {
        &self.manager
    }

    pub fn authorization(&self) -> &AuthorizationEngine {
        &self.authz
    }

    /// Check that `master` may originate keys shared with `slave`
    pub fn authorize_request(&self, master: &SaeIdentity, slave: &SaeId) -> Result<()> {
        self.authz
            .require(master, Operation::EncKeys, AuthzTarget::NewKeys { slave })
    }

    /// Check that `caller` may read the status of the pool shared with `slave`
    pub fn authorize_status(&self, caller: &SaeIdentity, slave: &SaeId) -> Result<()> {
        self.authz
            .require(caller, Operation::Status, AuthzTarget::Pool { slave })
    }

    /// Deliver `number` fresh keys of `size` bits to `master`, retrievable by
    /// `slave` and every SAE in `additional`.
    pub async fn request_keys(
        &self,
        master: &SaeIdentity,
        slave: &SaeId,
        number: Option<u32>,
        size: Option<u32>,
        additional: &[SaeId],
        extensions: &AppliedExtensions,
    ) -> Result<Vec<DeliveredKey>> {
        let limits = &master.limits;
        let config = self.manager.config();

        let number = number.unwrap_or(1);
        if number < 1 || number > limits.max_key_per_request {
            return Err(KmeError::invalid(
                "number",
                format!("must be between 1 and {}", limits.max_key_per_request),
            ));
        }

        let size = size.unwrap_or(config.default_key_size);
        if size < limits.min_key_size || size > limits.max_key_size {
            return Err(KmeError::invalid(
                "size",
                format!(
                    "must be between {} and {}",
                    limits.min_key_size, limits.max_key_size
                ),
            ));
        }
        if size % 8 != 0 {
            return Err(KmeError::invalid("size", "must be a multiple of 8"));
        }

        if additional.len() > limits.max_sae_id_count as usize {
            return Err(KmeError::invalid(
                "additional_slave_SAE_IDs",
                format!("at most {} SAE IDs allowed", limits.max_sae_id_count),
            ));
        }

        for sae_id in additional {
            if sae_id == &master.sae_id {
                return Err(KmeError::invalid(
                    "additional_slave_SAE_IDs",
                    "the master SAE cannot be a slave",
                ));
            }
            if !self.is_active(sae_id) {
                return Err(KmeError::invalid(
                    "additional_slave_SAE_IDs",
                    format!("{} is not a registered active SAE", sae_id),
                ));
            }
        }

        if slave == &master.sae_id {
            return Err(KmeError::invalid(
                "slave_SAE_ID",
                "the master SAE cannot be its own slave",
            ));
        }
        if !self.is_active(slave) {
            return Err(KmeError::invalid(
                "slave_SAE_ID",
                format!("{} is not a registered active SAE", slave),
            ));
        }

        let reservation = self
            .manager
            .reserve(number as usize, size, &master.sae_id)
            .await?;

        let mut authorized: BTreeSet<SaeId> = additional.iter().cloned().collect();
        authorized.insert(slave.clone());

        let lifetime = match extensions.max_age {
            Some(max_age) => max_age.min(config.grant_ttl),
            None => config.grant_ttl,
        };
        let expires_at = SystemTime::now() + lifetime;

        let grants = reservation
            .records()
            .iter()
            .map(|record| {
                DistributionGrant::new(
                    record.key_id,
                    master.sae_id.clone(),
                    authorized.clone(),
                    expires_at,
                )
            })
            .collect();

        let records = reservation.commit(grants)?;
        debug!(
            "Delivered {} keys from {} to {} (+{} additional)",
            records.len(),
            master.sae_id,
            slave,
            additional.len()
        );

        Ok(records.into_iter().map(DeliveredKey::from).collect())
    }

    /// Hand the keys named by `key_ids` to `requester`. Either every key is
    /// delivered or none is.
    pub fn retrieve_keys_by_id(
        &self,
        requester: &SaeIdentity,
        master: &SaeId,
        key_ids: &[String],
    ) -> Result<Vec<DeliveredKey>> {
        if key_ids.is_empty() {
            return Err(KmeError::invalid("key_IDs", "at least one key_ID is required"));
        }
        if key_ids.len() > requester.limits.max_key_per_request as usize {
            return Err(KmeError::invalid(
                "key_IDs",
                format!(
                    "at most {} key_IDs per request",
                    requester.limits.max_key_per_request
                ),
            ));
        }

        let key_ids = key_ids
            .iter()
            .map(|id| KeyId::parse(id))
            .collect::<Result<Vec<_>>>()?;

        // Audit events are written after the pool lock is released
        let mut decisions = Vec::with_capacity(key_ids.len());
        let consumed = self.manager.store().consume(
            &requester.sae_id,
            master,
            &key_ids,
            |key_id, grant| {
                let (decision, event) = self.authz.evaluate(
                    requester,
                    Operation::DecKeys,
                    AuthzTarget::Key {
                        key_id,
                        master,
                        grant,
                    },
                );
                decisions.push(event);
                decision.into_result()
            },
        );
        self.authz.record(decisions);
        let records = consumed?;

        debug!(
            "{} retrieved {} keys issued to {}",
            requester.sae_id,
            records.len(),
            master
        );
        Ok(records.into_iter().map(DeliveredKey::from).collect())
    }

    fn is_active(&self, sae_id: &SaeId) -> bool {
        self.registry
            .lookup(sae_id)
            .map_or(false, |identity| identity.is_active())
    }
}
