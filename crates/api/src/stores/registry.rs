//! Rendezvous between HTTP completion handlers and the SMTP processor.
//!
//! A completion handler registers its nonce and parks on the returned
//! receiver; the SMTP nonce processor calls `notify` once sender checks
//! pass. Channels have capacity one, so the first notification wakes the
//! waiter and any further ones are dropped. Deleting a registration drops
//! the sender, which a parked waiter observes as `None` (closed) rather
//! than a wake-up.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::utils::hash_email;

/// Process-local nonce → wait-channel map. Single-node by design: scaling
/// out would need a shared pub/sub keyed by nonce, which this service
/// deliberately does not attempt.
#[derive(Default)]
pub struct VerificationRegistry {
    channels: RwLock<HashMap<String, mpsc::Sender<()>>>,
}

impl VerificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait channel for `nonce` and returns the receiving end.
    ///
    /// Callers are contracted to pair every `register` with a `delete`.
    /// Registering a nonce that is already present replaces the channel;
    /// the previous waiter observes a close. That only happens when a
    /// caller broke the contract, so it is logged at debug level.
    pub fn register(&self, nonce: &str) -> mpsc::Receiver<()> {
        // Capacity 1: notify never blocks even if the handler already left.
        let (tx, rx) = mpsc::channel(1);
        let previous = self.channels.write().insert(nonce.to_string(), tx);
        if previous.is_some() {
            tracing::debug!(nonce = %hash_email(nonce), "replaced existing wait channel");
        }
        rx
    }

    /// Wakes the waiter for `nonce`, if any. Never blocks.
    ///
    /// A full channel (already notified) or a missing/closed registration
    /// is a silent no-op. Holding only a cloned sender keeps this safe
    /// against a concurrent `delete`: sending on a closed channel is an
    /// `Err`, not a panic.
    pub fn notify(&self, nonce: &str) {
        let sender = self.channels.read().get(nonce).cloned();
        let Some(sender) = sender else {
            tracing::debug!(nonce = %hash_email(nonce), "notify with no registered waiter");
            return;
        };

        match sender.try_send(()) {
            Ok(()) => tracing::debug!(nonce = %hash_email(nonce), "verification notification sent"),
            Err(_) => {
                tracing::debug!(nonce = %hash_email(nonce), "wait channel already fired or closed")
            }
        }
    }

    /// Removes the registration for `nonce`, unblocking a parked waiter
    /// with a closed-channel observation. Idempotent.
    pub fn delete(&self, nonce: &str) {
        let removed = self.channels.write().remove(nonce);
        if removed.is_some() {
            tracing::debug!(nonce = %hash_email(nonce), "wait channel removed");
        }
    }

    /// Number of registered wait channels.
    pub fn count(&self) -> usize {
        self.channels.read().len()
    }
}
