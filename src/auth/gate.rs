//! Capability checks against an entity's ACL.
//!
//! Every Ace naming the caller or one of the caller's roles is considered.
//! A matching deny that covers the bit refuses access no matter what the
//! allow entries say; otherwise one covering allow is enough. Root skips
//! evaluation entirely.

use crate::error::{Error, Result};
use crate::model::{Ace, Identity, Right};

/// Stateless ACL evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizationGate;

impl AuthorizationGate {
    pub fn has_right(identity: &Identity, acl: &[Ace], right: Right) -> bool {
        if identity.is_root() {
            return true;
        }

        let mut allowed = false;
        for ace in acl {
            if !identity.principals().any(|p| p == ace.id) {
                continue;
            }
            if !ace.rights.covers(right) {
                continue;
            }
            if ace.deny {
                return false;
            }
            allowed = true;
        }
        allowed
    }

    /// Check a raw document's `_acl`.
    pub fn document_has_right(identity: &Identity, doc: &serde_json::Value, right: Right) -> bool {
        if identity.is_root() {
            return true;
        }
        Self::has_right(identity, &crate::model::acl::acl_of(doc), right)
    }

    /// Point check that turns a refusal into `AccessDenied`.
    pub fn require(identity: &Identity, acl: &[Ace], right: Right, what: &str) -> Result<()> {
        if Self::has_right(identity, acl, right) {
            Ok(())
        } else {
            tracing::debug!(user = %identity.username, %right, target = what, "access denied");
            Err(Error::AccessDenied(format!(
                "Unknown {what} or {} is missing {right} rights",
                identity.username
            )))
        }
    }
}
