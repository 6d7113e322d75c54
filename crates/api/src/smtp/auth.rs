//! Sender-identity oracles: SPF and DKIM.
//!
//! The session only consumes the disposition enums; the `mail-auth`
//! plumbing stays behind these traits so tests can script outcomes.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use mail_auth::{AuthenticatedMessage, DkimResult, Resolver, SpfResult};

/// Outcome of an SPF evaluation for a sender IP/address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfDisposition {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl SpfDisposition {
    /// Failures that gate acceptance in warn/strict modes.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::SoftFail)
    }
}

impl fmt::Display for SpfDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        };
        f.write_str(s)
    }
}

/// Outcome of DKIM verification over a buffered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimDisposition {
    /// No signatures present.
    None,
    /// At least one signature verified.
    Pass,
    /// Signatures present, none verified.
    Fail,
    TempError,
    PermError,
}

impl DkimDisposition {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail)
    }
}

impl fmt::Display for DkimDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        };
        f.write_str(s)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpfVerifier: Send + Sync {
    /// Evaluates SPF for mail from `sender_email` arriving from `sender_ip`.
    async fn check(&self, sender_ip: IpAddr, sender_email: &str) -> SpfDisposition;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DkimVerifier: Send + Sync {
    /// Verifies DKIM signatures over the full buffered message
    /// (headers + body).
    async fn check(&self, message: &[u8]) -> DkimDisposition;
}

/// DNS-backed SPF evaluation via `mail-auth`.
pub struct MailAuthSpfVerifier {
    resolver: Resolver,
    host_domain: String,
}

impl MailAuthSpfVerifier {
    pub fn new(host_domain: &str) -> anyhow::Result<Self> {
        Ok(Self {
            resolver: Resolver::new_cloudflare_tls()?,
            host_domain: host_domain.to_string(),
        })
    }
}

#[async_trait]
impl SpfVerifier for MailAuthSpfVerifier {
    async fn check(&self, sender_ip: IpAddr, sender_email: &str) -> SpfDisposition {
        let helo_domain = sender_email.rsplit('@').next().unwrap_or(sender_email);
        let output = self
            .resolver
            .verify_spf_sender(sender_ip, helo_domain, &self.host_domain, sender_email)
            .await;

        match output.result() {
            SpfResult::Pass => SpfDisposition::Pass,
            SpfResult::Fail => SpfDisposition::Fail,
            SpfResult::SoftFail => SpfDisposition::SoftFail,
            SpfResult::Neutral => SpfDisposition::Neutral,
            SpfResult::TempError => SpfDisposition::TempError,
            SpfResult::PermError => SpfDisposition::PermError,
            SpfResult::None => SpfDisposition::None,
        }
    }
}

/// DNS-backed DKIM verification via `mail-auth`. A message passes when at
/// least one of its signatures verifies.
pub struct MailAuthDkimVerifier {
    resolver: Resolver,
}

impl MailAuthDkimVerifier {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: Resolver::new_cloudflare_tls()?,
        })
    }
}

#[async_trait]
impl DkimVerifier for MailAuthDkimVerifier {
    async fn check(&self, message: &[u8]) -> DkimDisposition {
        let Some(parsed) = AuthenticatedMessage::parse(message) else {
            tracing::debug!("dkim check: message unparseable");
            return DkimDisposition::PermError;
        };

        let outputs = self.resolver.verify_dkim(&parsed).await;
        if outputs.is_empty() {
            return DkimDisposition::None;
        }

        let mut saw_temp_error = false;
        for output in &outputs {
            match output.result() {
                DkimResult::Pass => return DkimDisposition::Pass,
                DkimResult::TempError(_) => saw_temp_error = true,
                DkimResult::None => return DkimDisposition::None,
                DkimResult::Neutral(_) | DkimResult::Fail(_) | DkimResult::PermError(_) => {}
            }
        }

        if saw_temp_error {
            DkimDisposition::TempError
        } else {
            DkimDisposition::Fail
        }
    }
}
