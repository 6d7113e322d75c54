//! Sliding-window rate limiting for SMTP sender addresses.
//!
//! Tracks attempt timestamps per key and admits a request only while the
//! in-window count stays under the limit. A background task purges keys
//! that have gone quiet so the map does not grow with every address a
//! spammer ever used.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

struct Inner {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
    shutdown_tx: watch::Sender<bool>,
}

/// Per-key sliding-window limiter. Cloning shares state.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    inner: Arc<Inner>,
}

impl SlidingWindowLimiter {
    /// Interval for the background purge of stale keys.
    const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new(max_attempts: usize, window: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window,
            shutdown_tx,
        });

        let purge_inner = Arc::clone(&inner);
        tokio::spawn(Self::purge_task(purge_inner, shutdown_rx));

        Self { inner }
    }

    /// Admits the attempt iff fewer than `max_attempts` admitted attempts
    /// fall inside the current window; records the attempt on admit.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now - self.inner.window;

        let mut attempts = self.inner.attempts.lock();
        let timestamps = attempts.entry(key.to_string()).or_default();
        timestamps.retain(|t| *t > cutoff);

        if timestamps.len() >= self.inner.max_attempts {
            return false;
        }

        timestamps.push(now);
        true
    }

    async fn purge_task(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Self::PURGE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => Self::purge_stale(&inner),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Drops keys whose newest attempt is older than twice the window.
    fn purge_stale(inner: &Inner) {
        let cutoff = Instant::now() - inner.window * 2;
        inner
            .attempts
            .lock()
            .retain(|_, timestamps| matches!(timestamps.last(), Some(t) if *t > cutoff));
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.inner.attempts.lock().len()
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
