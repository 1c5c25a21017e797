//! Identity resolution from mTLS client certificates

use crate::{
    auth::{PeerCertificate, SaeRegistry},
    KmeError, Result, SaeId, SaeStatus,
};
use std::sync::Arc;
use std::time::SystemTime;

/// Maps a verified client certificate to a registered SAE
#[derive(Clone)]
pub struct IdentityResolver {
    registry: Arc<dyn SaeRegistry>,
}

impl IdentityResolver {
    pub fn new(registry: Arc<dyn SaeRegistry>) -> Self {
        IdentityResolver { registry }
    }

    /// Resolve the SAE behind a peer certificate at the current time
    pub fn resolve(&self, cert: &PeerCertificate) -> Result<SaeId> {
        self.resolve_at(cert, SystemTime::now())
    }

    /// Resolve the SAE behind a peer certificate at `now`
    pub fn resolve_at(&self, cert: &PeerCertificate, now: SystemTime) -> Result<SaeId> {
        let common_name = cert
            .common_name
            .as_deref()
            .ok_or_else(|| KmeError::Authentication("certificate has no common name".to_string()))?;

        let sae_id = SaeId::new(common_name).map_err(|_| {
            KmeError::Authentication(format!("common name '{}' is not a valid SAE_ID", common_name))
        })?;

        if !cert.is_valid_at(now) {
            return Err(KmeError::Authentication(format!(
                "certificate for {} is outside its validity period",
                sae_id
            )));
        }

        let identity = self
            .registry
            .lookup(&sae_id)
            .ok_or_else(|| KmeError::Authentication(format!("SAE {} is not registered", sae_id)))?;

        if matches!(identity.status, SaeStatus::Revoked | SaeStatus::Expired) {
            return Err(KmeError::Authentication(format!(
                "SAE {} registration is {}",
                sae_id, identity.status
            )));
        }

        if !self.registry.verify_fingerprint(&sae_id, cert) {
            return Err(KmeError::Authentication(format!(
                "certificate fingerprint mismatch for {}",
                sae_id
            )));
        }

        Ok(sae_id)
    }

    pub fn registry(&self) -> &Arc<dyn SaeRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::InMemorySaeRegistry, SaeIdentity, SaeLimits};
    use std::time::Duration;

    const MASTER: &str = "MMMMMMMMMMMMMMMM";

    fn setup(status: SaeStatus) -> (IdentityResolver, Arc<InMemorySaeRegistry>) {
        let registry = Arc::new(InMemorySaeRegistry::from_identities([SaeIdentity {
            sae_id: SaeId::new(MASTER).unwrap(),
            fingerprint: "00ff".to_string(),
            status,
            limits: SaeLimits::default(),
        }]));
        (IdentityResolver::new(registry.clone()), registry)
    }

    fn cert(cn: &str, fingerprint: &str) -> PeerCertificate {
        let now = SystemTime::now();
        PeerCertificate {
            common_name: Some(cn.to_string()),
            fingerprint: fingerprint.to_string(),
            not_before: now - Duration::from_secs(3600),
            not_after: now + Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_resolves_registered_sae() {
        let (resolver, _) = setup(SaeStatus::Active);
        let sae_id = resolver.resolve(&cert(MASTER, "00FF")).unwrap();
        assert_eq!(sae_id.as_str(), MASTER);
    }

    #[test]
    fn test_inactive_sae_still_resolves() {
        // Status other than revoked/expired is an authorization decision
        let (resolver, _) = setup(SaeStatus::Suspended);
        assert!(resolver.resolve(&cert(MASTER, "00ff")).is_ok());
    }

    #[test]
    fn test_rejections() {
        let (resolver, registry) = setup(SaeStatus::Active);

        let err = resolver.resolve(&cert("bad-cn", "00ff")).unwrap_err();
        assert!(matches!(err, KmeError::Authentication(_)));

        let err = resolver.resolve(&cert("UUUUUUUUUUUUUUUU", "00ff")).unwrap_err();
        assert!(matches!(err, KmeError::Authentication(_)));

        let err = resolver.resolve(&cert(MASTER, "11ff")).unwrap_err();
        assert!(err.to_string().contains("fingerprint"));

        let mut expired = cert(MASTER, "00ff");
        expired.not_after = SystemTime::now() - Duration::from_secs(1);
        assert!(resolver.resolve(&expired).is_err());

        let mut no_cn = cert(MASTER, "00ff");
        no_cn.common_name = None;
        assert!(resolver.resolve(&no_cn).is_err());

        registry
            .set_status(&SaeId::new(MASTER).unwrap(), SaeStatus::Revoked)
            .unwrap();
        let err = resolver.resolve(&cert(MASTER, "00ff")).unwrap_err();
        assert!(err.to_string().contains("revoked"));
    }
}
