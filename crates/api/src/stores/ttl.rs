//! In-memory key/value store with per-entry TTL.
//!
//! Backs the two ephemeral keys of the registration flow:
//! `expected:<nonce>` (claimed email, written by the HTTP handler) and the
//! bare nonce (verified email, written by the SMTP processor). Entries are
//! invisible to readers the moment they expire; a background task sweeps
//! them out periodically, and reads evict expired entries they encounter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;

const MAX_KEY_LENGTH: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TtlStoreError {
    #[error("key exceeds {MAX_KEY_LENGTH} bytes")]
    KeyTooLong,
    #[error("store is at capacity")]
    StoreFull,
}

#[derive(Debug, Clone)]
pub struct TtlStoreConfig {
    /// Max live entries before `set` starts failing with `StoreFull`.
    pub capacity: usize,
    /// How often the background sweep removes expired entries.
    pub sweep_interval: Duration,
}

impl Default for TtlStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

struct Inner {
    data: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared in-memory TTL store. Cloning is cheap and all clones see the
/// same data. Requires a tokio runtime for the background sweep task;
/// the task stops when the last clone is dropped.
#[derive(Clone)]
pub struct MemoryTtlStore {
    inner: Arc<Inner>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::with_config(TtlStoreConfig::default())
    }

    pub fn with_config(config: TtlStoreConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            data: RwLock::new(HashMap::new()),
            capacity: config.capacity,
            shutdown_tx,
        });

        let sweep_inner = Arc::clone(&inner);
        tokio::spawn(Self::sweep_task(sweep_inner, config.sweep_interval, shutdown_rx));

        Self { inner }
    }

    async fn sweep_task(
        inner: Arc<Inner>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = Self::sweep_expired(&inner.data);
                    if removed > 0 {
                        tracing::debug!(removed, "ttl store sweep removed expired entries");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn sweep_expired(data: &RwLock<HashMap<String, Entry>>) -> usize {
        let now = Instant::now();
        let mut data = data.write();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        before - data.len()
    }

    /// Stores a key with an empty value.
    pub fn set(&self, key: &str, ttl: Duration) -> Result<(), TtlStoreError> {
        self.set_with_value(key, "", ttl)
    }

    /// Stores `value` under `key`, replacing any existing entry.
    pub fn set_with_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TtlStoreError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(TtlStoreError::KeyTooLong);
        }

        let now = Instant::now();
        let mut data = self.inner.data.write();

        // Overwrites never count against capacity. When full, expired
        // entries are reclaimed in place before giving up.
        if data.len() >= self.inner.capacity && !data.contains_key(key) {
            data.retain(|_, entry| !entry.is_expired(now));
            if data.len() >= self.inner.capacity {
                return Err(TtlStoreError::StoreFull);
            }
        }

        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    /// Returns the live value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let data = self.inner.data.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and evict, re-checking in case
        // a writer replaced the entry in between.
        let mut data = self.inner.data.write();
        if let Some(entry) = data.get(key) {
            if entry.is_expired(Instant::now()) {
                data.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes `key`. Idempotent.
    pub fn delete(&self, key: &str) {
        self.inner.data.write().remove(key);
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the background sweep task. Also happens automatically when
    /// the last clone is dropped.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl Default for MemoryTtlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
