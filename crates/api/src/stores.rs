//! Ephemeral in-process state.
//!
//! Everything in here lives and dies with the process; pending
//! registrations deliberately do not survive restarts.
//!
//! ## Stores
//!
//! - **ttl** - Key/value entries with per-entry expiry (expected and
//!   verified emails, keyed by nonce)
//! - **registry** - Rendezvous channels waking suspended HTTP handlers
//!   from the SMTP side
//! - **rate_limit** - Sliding-window attempt counters per sender address
//!
//! ## Key patterns (ttl store)
//!
//! ```text
//! expected:{nonce}   → email the HTTP client claims (written before the wait)
//! {nonce}            → email the SMTP listener verified (written before notify)
//! ```

mod rate_limit;
mod registry;
mod ttl;

pub use rate_limit::SlidingWindowLimiter;
pub use registry::VerificationRegistry;
pub use ttl::{MemoryTtlStore, TtlStoreConfig, TtlStoreError};
