//! The verification SMTP listener.
//!
//! Inbound mail is the proof of address control: the client sends a
//! message from the address it is registering, to
//! `<prefix>+<nonce>@<domain>`. The session validates the plus-tag,
//! optionally gates on SPF/DKIM, and hands each nonce to the worker pool,
//! where the processor cross-checks the sender against the pending
//! registration and wakes the suspended HTTP handler.

pub mod auth;
pub mod server;
pub mod verify;

pub use auth::{MailAuthDkimVerifier, MailAuthSpfVerifier};
pub use server::{SmtpConfig, SmtpServer};
pub use verify::NonceProcessor;
