//! Behavioural switches for the dispatcher, namespace guard and queue engine.
//!
//! Every field has a default, so an empty TOML file is a valid policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Mint a short-lived guest identity when a request carries no credential.
    pub enable_guest: bool,
    pub guest_token_ttl_secs: u64,
    /// Lifetime of tokens issued by signin and refreshtoken.
    pub token_ttl_secs: u64,
    /// Levels of role-in-role membership followed when building a role closure.
    pub max_role_depth: usize,
    /// Minimum spacing between queue-monitor wake-ups for one queue.
    pub queue_monitor_interval_secs: u64,
    pub rate_limit: RateLimitPolicy,
    pub offload: OffloadPolicy,
    pub namespace: NamespacePolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enable_guest: false,
            guest_token_ttl_secs: 300,
            token_ttl_secs: 3600,
            max_role_depth: 2,
            queue_monitor_interval_secs: 5,
            rate_limit: RateLimitPolicy::default(),
            offload: OffloadPolicy::default(),
            namespace: NamespacePolicy::default(),
        }
    }
}

impl Policy {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid policy file: {e}")))
    }

    pub fn guest_token_ttl(&self) -> Duration {
        Duration::from_secs(self.guest_token_ttl_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn queue_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.queue_monitor_interval_secs)
    }
}

/// Per-connection token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    /// Requests allowed per window.
    pub points: u32,
    pub duration_secs: u64,
    /// Requests within one window after which the connection is closed.
    pub disconnect_points: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            points: 30,
            duration_secs: 1,
            disconnect_points: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadPolicy {
    pub enabled: bool,
    /// Queue consumed by offload workers.
    pub queue: String,
    pub reply_timeout_secs: u64,
    pub expiration_secs: u64,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            queue: "flowgate".to_string(),
            reply_timeout_secs: 60,
            expiration_secs: 60,
        }
    }
}

impl OffloadPolicy {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespacePolicy {
    pub force_queue_prefix: bool,
    pub force_exchange_prefix: bool,
    /// Binding to an existing queue requires read on its backing entity.
    pub sender_has_read: bool,
    /// Binding to an existing queue requires invoke on its backing entity.
    pub sender_has_invoke: bool,
    /// Consumers of an id-named queue need update, not just read.
    pub consumer_has_update: bool,
    pub enable_exchanges: bool,
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        Self {
            force_queue_prefix: false,
            force_exchange_prefix: false,
            sender_has_read: true,
            sender_has_invoke: false,
            consumer_has_update: false,
            enable_exchanges: true,
        }
    }
}

impl NamespacePolicy {
    /// Whether existing backing entities are checked at all.
    pub fn checks_backing_entity(&self) -> bool {
        self.sender_has_read || self.sender_has_invoke
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let policy = Policy::from_toml("").unwrap();
        assert!(!policy.enable_guest);
        assert_eq!(policy.max_role_depth, 2);
        assert_eq!(policy.rate_limit.points, 30);
        assert_eq!(policy.rate_limit.disconnect_points, 100);
        assert!(policy.namespace.sender_has_read);
    }

    #[test]
    fn nested_sections_override_fields() {
        let policy = Policy::from_toml(
            r#"
            enable_guest = true

            [rate_limit]
            points = 5

            [namespace]
            force_queue_prefix = true
            "#,
        )
        .unwrap();
        assert!(policy.enable_guest);
        assert_eq!(policy.rate_limit.points, 5);
        assert_eq!(policy.rate_limit.duration_secs, 1);
        assert!(policy.namespace.force_queue_prefix);
        assert!(!policy.namespace.force_exchange_prefix);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let result = Policy::from_toml("enable_guest = \"maybe\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
