//! Authorization decisions for the three protocol operations
//!
//! Every decision, allow or deny, is written to the audit log before the
//! caller sees it. Decisions taken while the key pool is locked are
//! evaluated with [`AuthorizationEngine::evaluate`] and recorded once the
//! lock is released, so audit I/O never runs inside the pool's critical
//! section.

use crate::audit::{AuditEvent, AuditLog, Operation};
use qkme_core::*;
use std::fmt;

/// Resource an operation acts on
#[derive(Debug, Clone, Copy)]
pub enum AuthzTarget<'a> {
    /// The key pool shared with `slave` (status)
    Pool { slave: &'a SaeId },
    /// Fresh keys to be shared with `slave` (enc_keys)
    NewKeys { slave: &'a SaeId },
    /// An existing key issued to `master` (dec_keys). `grant` is `None`
    /// when the key has no live grant.
    Key {
        key_id: &'a KeyId,
        master: &'a SaeId,
        grant: Option<&'a DistributionGrant>,
    },
}

impl fmt::Display for AuthzTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthzTarget::Pool { slave } => write!(f, "pool:{}", slave),
            AuthzTarget::NewKeys { slave } => write!(f, "new_keys:{}", slave),
            AuthzTarget::Key { key_id, .. } => write!(f, "key:{}", key_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Decision {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Decision {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(KmeError::Authorization(self.reason))
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthorizationEngine {
    audit: AuditLog,
}

impl AuthorizationEngine {
    pub fn new(audit: AuditLog) -> Self {
        AuthorizationEngine { audit }
    }

    /// Decide whether `caller` may perform `operation` on `target`
    pub fn authorize(
        &self,
        caller: &SaeIdentity,
        operation: Operation,
        target: AuthzTarget<'_>,
    ) -> Decision {
        let (decision, event) = self.evaluate(caller, operation, target);
        self.audit.record(event);
        decision
    }

    /// Decide without recording. The returned event must be passed to
    /// [`record`](Self::record) before the decision reaches the caller.
    pub fn evaluate(
        &self,
        caller: &SaeIdentity,
        operation: Operation,
        target: AuthzTarget<'_>,
    ) -> (Decision, AuditEvent) {
        let decision = Self::decide(caller, operation, &target);
        let event = AuditEvent::new(
            operation,
            &caller.sae_id,
            target.to_string(),
            decision.allowed,
            decision.reason.clone(),
        );
        (decision, event)
    }

    /// Write deferred decisions to the audit log
    pub fn record(&self, events: impl IntoIterator<Item = AuditEvent>) {
        for event in events {
            self.audit.record(event);
        }
    }

    /// Like [`authorize`](Self::authorize), turning a denial into an error
    pub fn require(
        &self,
        caller: &SaeIdentity,
        operation: Operation,
        target: AuthzTarget<'_>,
    ) -> Result<()> {
        self.authorize(caller, operation, target).into_result()
    }

    fn decide(caller: &SaeIdentity, operation: Operation, target: &AuthzTarget<'_>) -> Decision {
        if !caller.is_active() {
            return Decision::deny(format!("SAE {} is {}", caller.sae_id, caller.status));
        }

        match (operation, target) {
            (Operation::Status, AuthzTarget::Pool { .. }) => Decision::allow("active SAE"),
            (Operation::EncKeys, AuthzTarget::NewKeys { .. }) => Decision::allow("originator"),
            (Operation::DecKeys, AuthzTarget::Key { key_id, master, grant }) => {
                let grant = match grant {
                    Some(grant) => grant,
                    None => return Decision::deny(format!("key {} is not available", key_id)),
                };
                if &grant.master_sae_id != *master {
                    Decision::deny(format!("key {} was not issued to {}", key_id, master))
                } else if !grant.is_authorized(&caller.sae_id) {
                    Decision::deny(format!("not an authorized slave for key {}", key_id))
                } else if grant.has_consumed(&caller.sae_id) {
                    Decision::deny(format!("key {} already retrieved", key_id))
                } else {
                    Decision::allow("authorized slave")
                }
            }
            (operation, target) => {
                Decision::deny(format!("{} does not apply to {}", operation, target))
            }
        }
    }
}
