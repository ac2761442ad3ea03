//! Broker configuration, read from the environment with sensible defaults.
//!
//! Mirrors `RateLimitConfig::from_env()`: one struct, one `from_env`
//! constructor, defaults that work out of the box for local development.

use std::env;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// SQLite path backing the workflow/permission store stand-ins.
    pub database_path: String,
    /// Base URL of the identity service the Session Authenticator calls.
    /// When unset, the broker falls back to its local HMAC token verifier.
    pub identity_service_url: Option<String>,
    /// Base URL of the permission service the Access Resolver calls.
    /// When unset, the broker falls back to its local SQLite permission store.
    pub permission_service_url: Option<String>,
    /// Shared secret the Ingress Adapter requires on inbound HTTP calls, if set.
    pub ingress_shared_secret: Option<String>,
    /// How long a deleted workflow's id is rejected for re-join after deletion.
    pub tombstone_ttl_secs: u64,
    /// Max `workflow-operation` messages accepted per connection per window.
    pub operation_rate_max: usize,
    pub operation_rate_window_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_path: "data/broker.db".to_string(),
            identity_service_url: None,
            permission_service_url: None,
            ingress_shared_secret: None,
            tombstone_ttl_secs: 60,
            operation_rate_max: 120,
            operation_rate_window_secs: 60,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("DATABASE_PATH") {
            config.database_path = val;
        }
        if let Ok(val) = env::var("IDENTITY_SERVICE_URL") {
            config.identity_service_url = Some(val);
        }
        if let Ok(val) = env::var("PERMISSION_SERVICE_URL") {
            config.permission_service_url = Some(val);
        }
        if let Ok(val) = env::var("INGRESS_SHARED_SECRET") {
            config.ingress_shared_secret = Some(val);
        }
        if let Ok(val) = env::var("TOMBSTONE_TTL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.tombstone_ttl_secs = n;
        }
        if let Ok(val) = env::var("OPERATION_RATE_MAX")
            && let Ok(n) = val.parse::<usize>()
        {
            config.operation_rate_max = n;
        }
        if let Ok(val) = env::var("OPERATION_RATE_WINDOW_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.operation_rate_window_secs = n;
        }

        config
    }
}
