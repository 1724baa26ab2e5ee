//! Client configuration.

use std::time::Duration;

use firekit_models::DatabaseId;

use crate::error::{FirestoreError, FirestoreResult};
use crate::pool::{PoolConfig, DEFAULT_MAX_CONCURRENT_PER_CLIENT};
use crate::retry::{env_parse, RetryConfig};

/// Production REST endpoint.
pub const DEFAULT_HOST: &str = "https://firestore.googleapis.com";

/// Environment variable pointing the client at a local emulator.
pub const EMULATOR_HOST_ENV: &str = "FIRESTORE_EMULATOR_HOST";

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Base URL of the REST endpoint, without the `/v1` suffix
    pub host: String,
    /// `host:port` of an emulator; when set, TLS and OAuth are disabled
    pub emulator_host: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry policy for unary requests
    pub retry: RetryConfig,
    /// Transport client pool sizing
    pub pool: PoolConfig,
}

impl FirestoreConfig {
    /// Config for a project with default settings.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: DatabaseId::DEFAULT.to_string(),
            host: DEFAULT_HOST.to_string(),
            emulator_host: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .or_else(|_| std::env::var("GOOGLE_CLOUD_PROJECT"))
            .map_err(|_| {
                FirestoreError::auth_error(
                    "GCP_PROJECT_ID, FIREBASE_PROJECT_ID or GOOGLE_CLOUD_PROJECT must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error("Firestore project ID cannot be empty"));
        }

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_concurrent_per_client: env_parse("FIRESTORE_MAX_CONCURRENT_PER_CLIENT")
                .unwrap_or(DEFAULT_MAX_CONCURRENT_PER_CLIENT),
            max_pool_size: env_parse("FIRESTORE_MAX_POOL_SIZE").unwrap_or(defaults.max_pool_size),
            max_idle_clients: env_parse("FIRESTORE_MAX_IDLE_CLIENTS")
                .unwrap_or(defaults.max_idle_clients),
        };

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| DatabaseId::DEFAULT.to_string()),
            host: DEFAULT_HOST.to_string(),
            emulator_host: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(
                env_parse("FIRESTORE_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            ),
            retry: RetryConfig::from_env(),
            pool,
        }
        .with_emulator_from_env())
    }

    /// Take the emulator from `FIRESTORE_EMULATOR_HOST` unless one is
    /// already configured.
    pub fn with_emulator_from_env(mut self) -> Self {
        if self.emulator_host.is_none() {
            self.emulator_host = std::env::var(EMULATOR_HOST_ENV)
                .ok()
                .filter(|host| !host.is_empty());
        }
        self
    }

    /// Point the client at an emulator (`host:port`).
    pub fn with_emulator(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }

    pub fn with_database(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = database_id.into();
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn database(&self) -> DatabaseId {
        DatabaseId::new(&self.project_id, &self.database_id)
    }

    /// REST base URL including the API version.
    pub fn base_url(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{}/v1", host.trim_end_matches('/')),
            None => format!("{}/v1", self.host.trim_end_matches('/')),
        }
    }

    pub fn is_emulator(&self) -> bool {
        self.emulator_host.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tokio_test::{assert_err, assert_ok};

    fn clear_env() {
        for var in [
            "GCP_PROJECT_ID",
            "FIREBASE_PROJECT_ID",
            "GOOGLE_CLOUD_PROJECT",
            "FIRESTORE_DATABASE_ID",
            "FIRESTORE_CONNECT_TIMEOUT_SECS",
            "FIRESTORE_RETRY_BASE_MS",
            "FIRESTORE_RETRY_MAX_MS",
            "FIRESTORE_MAX_RETRIES",
            "FIRESTORE_MAX_CONCURRENT_PER_CLIENT",
            "FIRESTORE_MAX_POOL_SIZE",
            "FIRESTORE_MAX_IDLE_CLIENTS",
            EMULATOR_HOST_ENV,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_from_env_requires_project_id() {
        clear_env();
        assert_err!(FirestoreConfig::from_env());
    }

    #[test]
    #[serial]
    fn test_config_validates_empty_project_id() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "");
        assert_err!(FirestoreConfig::from_env());
    }

    #[test]
    #[serial]
    fn test_config_default_values() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "test-project");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.database_id, "(default)");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.pool, PoolConfig::default());
        assert!(!config.is_emulator());
        assert_eq!(config.base_url(), "https://firestore.googleapis.com/v1");
    }

    #[test]
    #[serial]
    fn test_config_prefers_gcp_project_id() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "gcp-project");
        std::env::set_var("FIREBASE_PROJECT_ID", "firebase-project");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.project_id, "gcp-project");
    }

    #[test]
    #[serial]
    fn test_config_accepts_firebase_project_id() {
        clear_env();
        std::env::set_var("FIREBASE_PROJECT_ID", "firebase-project");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.project_id, "firebase-project");
    }

    #[test]
    #[serial]
    fn test_emulator_host_disables_tls() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "demo");
        std::env::set_var(EMULATOR_HOST_ENV, "localhost:8080");
        let config = assert_ok!(FirestoreConfig::from_env());
        assert!(config.is_emulator());
        assert_eq!(config.base_url(), "http://localhost:8080/v1");
    }

    #[test]
    #[serial]
    fn test_explicit_emulator_wins_over_env() {
        clear_env();
        std::env::set_var(EMULATOR_HOST_ENV, "localhost:8080");
        let config = FirestoreConfig::new("demo")
            .with_emulator("127.0.0.1:9000")
            .with_emulator_from_env();
        assert_eq!(config.base_url(), "http://127.0.0.1:9000/v1");

        std::env::set_var(EMULATOR_HOST_ENV, "");
        assert!(!FirestoreConfig::new("demo").with_emulator_from_env().is_emulator());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_parses_pool_and_retry_env_vars() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "test");
        std::env::set_var("FIRESTORE_MAX_CONCURRENT_PER_CLIENT", "10");
        std::env::set_var("FIRESTORE_MAX_POOL_SIZE", "4");
        std::env::set_var("FIRESTORE_RETRY_BASE_MS", "50");
        std::env::set_var("FIRESTORE_RETRY_MAX_MS", "2000");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.pool.max_concurrent_per_client, 10);
        assert_eq!(config.pool.max_pool_size, 4);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert_eq!(config.retry.max_delay_ms, 2000);
    }

    #[test]
    #[serial]
    fn test_config_handles_invalid_env_values() {
        clear_env();
        std::env::set_var("GCP_PROJECT_ID", "test");
        std::env::set_var("FIRESTORE_CONNECT_TIMEOUT_SECS", "not-a-number");
        std::env::set_var("FIRESTORE_MAX_POOL_SIZE", "lots");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.max_pool_size, usize::MAX);
    }
}
