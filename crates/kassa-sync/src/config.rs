//! Adapter configuration module.
//!
//! Configuration is loaded from environment variables with fallback to
//! defaults. Every knob the daemon, breaker, and OFD transport use lives
//! here so a deployment is fully described by its environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Transport Selection
// =============================================================================

/// Which OFD transport the adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfdTransport {
    /// In-process scriptable mock (development, integration tests).
    Mock,
    /// Real HTTP transport against `ofd_base_url`.
    Http,
}

impl std::fmt::Display for OfdTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfdTransport::Mock => write!(f, "mock"),
            OfdTransport::Http => write!(f, "http"),
        }
    }
}

// =============================================================================
// Adapter Configuration
// =============================================================================

/// Full adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Identifier of this point-of-sale terminal (stamped on receipts).
    pub pos_id: String,

    /// HTTP port the adapter listens on.
    pub http_port: u16,

    /// Path to the SQLite buffer database.
    pub buffer_db_path: String,

    /// Ceiling on active (pending/syncing) receipts.
    pub buffer_capacity: u32,

    // -------------------------------------------------------------------------
    // OFD transport
    // -------------------------------------------------------------------------
    /// Selected OFD transport.
    pub ofd_transport: OfdTransport,

    /// Base URL of the fiscal data operator (http transport only).
    pub ofd_base_url: Option<String>,

    /// Per-request timeout against the operator, in seconds.
    pub ofd_request_timeout_secs: u64,

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------
    /// Consecutive failures that open the circuit.
    pub breaker_failure_threshold: u32,

    /// Consecutive half-open trial successes that close the circuit.
    pub breaker_success_threshold: u32,

    /// How long the circuit stays open before a half-open trial, in seconds.
    pub breaker_recovery_timeout_secs: u64,

    // -------------------------------------------------------------------------
    // Sync daemon
    // -------------------------------------------------------------------------
    /// Seconds between sync cycles.
    pub sync_interval_secs: u64,

    /// Maximum receipts drained per cycle.
    pub sync_batch_size: u32,

    /// Retry budget per receipt before dead-letter promotion.
    pub sync_max_retries: i64,

    /// Exponential backoff base, in seconds.
    pub backoff_base_secs: u64,

    /// Exponential backoff ceiling, in seconds.
    pub backoff_cap_secs: u64,

    // -------------------------------------------------------------------------
    // Lease lock
    // -------------------------------------------------------------------------
    /// Redis connection string for the cycle lease lock. When unset the
    /// adapter falls back to an in-process lock (single-instance deployment).
    pub redis_url: Option<String>,
}

impl AdapterConfig {
    /// Load configuration from environment variables.
    pub fn load() -> SyncResult<Self> {
        let ofd_transport = match env::var("OFD_TRANSPORT")
            .unwrap_or_else(|_| "mock".to_string())
            .to_lowercase()
            .as_str()
        {
            "mock" => OfdTransport::Mock,
            "http" => OfdTransport::Http,
            other => {
                return Err(SyncError::InvalidConfig(format!(
                    "OFD_TRANSPORT must be 'mock' or 'http', got '{other}'"
                )))
            }
        };

        let config = AdapterConfig {
            pos_id: env::var("POS_ID").unwrap_or_else(|_| "pos-dev".to_string()),

            http_port: parse_env("HTTP_PORT", "8080")?,

            buffer_db_path: env::var("BUFFER_DB_PATH")
                .unwrap_or_else(|_| "kassa-buffer.db".to_string()),

            buffer_capacity: parse_env("BUFFER_CAPACITY", "200")?,

            ofd_transport,

            ofd_base_url: env::var("OFD_BASE_URL").ok(),

            ofd_request_timeout_secs: parse_env("OFD_REQUEST_TIMEOUT_SECS", "10")?,

            breaker_failure_threshold: parse_env("BREAKER_FAILURE_THRESHOLD", "5")?,

            breaker_success_threshold: parse_env("BREAKER_SUCCESS_THRESHOLD", "1")?,

            breaker_recovery_timeout_secs: parse_env("BREAKER_RECOVERY_TIMEOUT_SECS", "60")?,

            sync_interval_secs: parse_env("SYNC_INTERVAL_SECS", "10")?,

            sync_batch_size: parse_env("SYNC_BATCH_SIZE", "50")?,

            sync_max_retries: parse_env("SYNC_MAX_RETRIES", "5")?,

            backoff_base_secs: parse_env("BACKOFF_BASE_SECS", "1")?,

            backoff_cap_secs: parse_env("BACKOFF_CAP_SECS", "300")?,

            redis_url: env::var("REDIS_URL").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> SyncResult<()> {
        if self.ofd_transport == OfdTransport::Http && self.ofd_base_url.is_none() {
            return Err(SyncError::InvalidConfig(
                "OFD_BASE_URL required when OFD_TRANSPORT=http".into(),
            ));
        }

        if self.buffer_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "BUFFER_CAPACITY must be at least 1".into(),
            ));
        }

        if self.sync_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "SYNC_BATCH_SIZE must be at least 1".into(),
            ));
        }

        if self.backoff_base_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "BACKOFF_BASE_SECS must be at least 1".into(),
            ));
        }

        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(SyncError::InvalidConfig(
                "BACKOFF_CAP_SECS must be >= BACKOFF_BASE_SECS".into(),
            ));
        }

        Ok(())
    }

    /// Sync cycle interval as a Duration.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// OFD request timeout as a Duration.
    pub fn ofd_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ofd_request_timeout_secs)
    }

    /// TTL for the cross-instance sync lease: 90% of the cycle interval,
    /// strictly shorter than it, so a crashed holder expires before the
    /// next tick instead of blocking every peer.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.sync_interval_secs.saturating_mul(900))
    }

    /// Reasonable defaults for tests (mock transport, local lock).
    pub fn for_tests() -> Self {
        AdapterConfig {
            pos_id: "pos-test".into(),
            http_port: 0,
            buffer_db_path: ":memory:".into(),
            buffer_capacity: 200,
            ofd_transport: OfdTransport::Mock,
            ofd_base_url: None,
            ofd_request_timeout_secs: 1,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 1,
            breaker_recovery_timeout_secs: 60,
            sync_interval_secs: 10,
            sync_batch_size: 50,
            sync_max_retries: 5,
            backoff_base_secs: 1,
            backoff_cap_secs: 300,
            redis_url: None,
        }
    }
}

/// Parses an environment variable with a default, mapping parse failures
/// to a named config error.
fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> SyncResult<T> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| SyncError::InvalidConfig(format!("Invalid value for {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AdapterConfig::for_tests();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_lease_ttl_shorter_than_interval() {
        let mut config = AdapterConfig::for_tests();
        assert!(config.lease_ttl() < config.sync_interval());

        // Holds at the short end too
        config.sync_interval_secs = 1;
        assert!(config.lease_ttl() < config.sync_interval());
    }

    #[test]
    fn test_http_transport_requires_base_url() {
        let mut config = AdapterConfig::for_tests();
        config.ofd_transport = OfdTransport::Http;
        assert!(config.validate().is_err());

        config.ofd_base_url = Some("https://ofd.example.com".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let mut config = AdapterConfig::for_tests();
        config.backoff_cap_secs = 0;
        assert!(config.validate().is_err());
    }
}
