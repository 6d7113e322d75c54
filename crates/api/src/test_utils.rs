//! Shared test utilities for API handler tests.
//!
//! Provides a `TestStateBuilder` for constructing `AppState` instances.
//! The in-memory stores (TTL, registry) are real - they are deterministic
//! and cheap, and handler tests exercise the actual rendezvous; only the
//! durable user repository is mocked.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::test_utils::TestStateBuilder;
//!
//! let mut users = MockUserRepo::new();
//! users.expect_exists().returning(|_| Ok(false));
//!
//! let state = TestStateBuilder::new().with_user_repo(users).build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::repos::MockUserRepo;
use crate::state::AppState;
use crate::stores::{MemoryTtlStore, TtlStoreConfig, VerificationRegistry};
use crate::workers::{WorkManager, WorkManagerConfig};

/// Creates a test configuration with dummy values.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        database_path: ":memory:".to_string(),
        smtp_listen_addr: "127.0.0.1:2525".to_string(),
        smtp_domain: "example.com".to_string(),
        smtp_recipient_prefix: "verify".to_string(),
        smtp_max_recipients: 5,
        smtp_max_message_bytes: 1 << 20,
        smtp_spf_enabled: false,
        smtp_dkim_enabled: false,
        smtp_verify_mode: "unrestricted".to_string(),
        db_workers: 1,
        crypto_workers: 1,
        smtp_workers: 1,
        worker_queue_size: 32,
        registration_ttl_secs: 180,
        max_request_body: "1MB".to_string(),
        env: "test".to_string(),
    }
}

/// Builder for constructing test `AppState` with custom mocks.
///
/// Uses a default (empty) user repo mock if none is provided, so tests
/// only configure what they actually touch.
pub struct TestStateBuilder {
    user_repo: Option<MockUserRepo>,
    config: Config,
}

impl TestStateBuilder {
    pub fn new() -> Self {
        Self {
            user_repo: None,
            config: test_config(),
        }
    }

    pub fn with_user_repo(mut self, repo: MockUserRepo) -> Self {
        self.user_repo = Some(repo);
        self
    }

    #[allow(dead_code)]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Builds the `AppState`. Must run inside a tokio runtime (the TTL
    /// store spawns its sweep task).
    pub fn build(self) -> AppState {
        let users = Arc::new(self.user_repo.unwrap_or_else(MockUserRepo::new));
        let ttl = MemoryTtlStore::with_config(TtlStoreConfig {
            capacity: 1000,
            sweep_interval: Duration::from_secs(3600),
        });
        let registry = Arc::new(VerificationRegistry::new());
        let workers = Arc::new(WorkManager::new(WorkManagerConfig {
            db_workers: self.config.db_workers,
            crypto_workers: self.config.crypto_workers,
            smtp_workers: self.config.smtp_workers,
            queue_size: self.config.worker_queue_size,
        }));
        // Lazy connect: the pool only dials when a test actually queries.
        let database = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_lazy("sqlite::memory:")
            .expect("in-memory sqlite pool");

        AppState {
            config: self.config,
            database,
            users,
            ttl,
            registry,
            workers,
        }
    }
}

impl Default for TestStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
