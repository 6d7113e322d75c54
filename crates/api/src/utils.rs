//! Log-safe hashing for PII.
//!
//! Emails, usernames, and nonces never appear in logs verbatim. Instead we
//! log a stable short hash so operators can correlate log lines for the
//! same identity without the logs becoming a PII store.

use sha2::{Digest, Sha256};

/// Stable 12-char hash for correlating emails (and nonces) in logs.
pub fn hash_email(email: &str) -> String {
    let digest = Sha256::digest(email.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Stable 8-char hash for correlating usernames in logs.
pub fn hash_username(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    hex::encode(digest)[..8].to_string()
}
