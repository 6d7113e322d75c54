//! The nonce processor: turns an accepted plus-tagged recipient into a
//! wake-up for the HTTP handler parked on that nonce.
//!
//! Runs on the SMTP worker pool, never inline in the session. Every early
//! return here is silent towards the SMTP client; the sender learns
//! nothing about whether a registration is pending.

use std::sync::Arc;
use std::time::Duration;

use crate::stores::{MemoryTtlStore, SlidingWindowLimiter, VerificationRegistry};
use crate::utils::hash_email;

/// Key prefix under which the HTTP handler stores the email it expects
/// the verification mail to come from.
pub const EXPECTED_KEY_PREFIX: &str = "expected:";

pub fn expected_key(nonce: &str) -> String {
    format!("{EXPECTED_KEY_PREFIX}{nonce}")
}

/// Lowercases, trims, and strips one layer of angle brackets from an SMTP
/// address as it appeared in MAIL FROM.
pub fn normalize_address(addr: &str) -> String {
    addr.trim()
        .trim_matches(|c| c == '<' || c == '>')
        .trim()
        .to_lowercase()
}

/// Shared dependencies of the nonce processor.
#[derive(Clone)]
pub struct NonceProcessor {
    pub ttl: MemoryTtlStore,
    pub registry: Arc<VerificationRegistry>,
    pub rate_limiter: SlidingWindowLimiter,
    /// TTL for the verified-email entry; matches the registration window.
    pub verified_ttl: Duration,
}

impl NonceProcessor {
    /// Validates that `sender_email` is the one a pending registration
    /// expects for `nonce`, records the verified email, and wakes the
    /// waiting HTTP handler.
    ///
    /// The verified-email write strictly precedes the notify so the woken
    /// handler always observes it.
    pub fn process(&self, nonce: &str, sender_email: &str, remote_addr: &str) {
        let sender = normalize_address(sender_email);
        if sender.is_empty() {
            tracing::warn!(remote = remote_addr, "smtp verify failed: empty sender");
            return;
        }

        if !self.rate_limiter.allow(&sender) {
            tracing::warn!(
                sender = %hash_email(&sender),
                remote = remote_addr,
                "smtp verify failed: rate limit exceeded"
            );
            return;
        }

        let Some(expected) = self.ttl.get(&expected_key(nonce)) else {
            tracing::warn!(
                nonce = %hash_email(nonce),
                remote = remote_addr,
                "smtp verify failed: no pending registration"
            );
            return;
        };

        let expected = normalize_address(&expected);
        if sender != expected {
            tracing::warn!(
                sender = %hash_email(&sender),
                expected = %hash_email(&expected),
                nonce = %hash_email(nonce),
                "smtp verify failed: email mismatch"
            );
            return;
        }

        if let Err(err) = self.ttl.set_with_value(nonce, &sender, self.verified_ttl) {
            tracing::error!(
                nonce = %hash_email(nonce),
                error = %err,
                "smtp verify failed: could not store verified email"
            );
            return;
        }

        self.registry.notify(nonce);
        tracing::info!(sender = %hash_email(&sender), "smtp verify success");
    }
}
