use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How SPF/DKIM failures affect SMTP acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// No sender-identity checks at all.
    Unrestricted,
    /// Run the checks, log failures, accept anyway.
    Warn,
    /// Reject failing senders with 550 5.7.1.
    Strict,
}

impl FromStr for VerifyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unrestricted" => Ok(Self::Unrestricted),
            "warn" => Ok(Self::Warn),
            "strict" => Ok(Self::Strict),
            other => anyhow::bail!("invalid verify mode {other:?} (expected unrestricted, warn, or strict)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database file. Created with 0600 permissions.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Address the verification SMTP listener binds.
    #[serde(default = "default_smtp_listen_addr")]
    pub smtp_listen_addr: String,
    /// Mail domain this instance accepts verification mail for.
    pub smtp_domain: String,
    /// Local-part prefix of plus-tagged verification addresses
    /// (`<prefix>+<nonce>@<domain>`).
    #[serde(default = "default_recipient_prefix")]
    pub smtp_recipient_prefix: String,
    #[serde(default = "default_max_recipients")]
    pub smtp_max_recipients: usize,
    #[serde(default = "default_max_message_bytes")]
    pub smtp_max_message_bytes: usize,
    #[serde(default = "default_true")]
    pub smtp_spf_enabled: bool,
    #[serde(default = "default_true")]
    pub smtp_dkim_enabled: bool,
    /// One of `unrestricted`, `warn`, `strict`.
    #[serde(default = "default_verify_mode")]
    pub smtp_verify_mode: String,

    #[serde(default = "default_db_workers")]
    pub db_workers: usize,
    #[serde(default = "default_crypto_workers")]
    pub crypto_workers: usize,
    #[serde(default = "default_smtp_workers")]
    pub smtp_workers: usize,
    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,

    /// How long a pending registration may wait for its email, and the
    /// TTL on both ephemeral entries it creates.
    #[serde(default = "default_registration_ttl_secs")]
    pub registration_ttl_secs: u64,

    /// Max HTTP request body size. Accepts raw bytes or `512KB` / `1MB`.
    #[serde(default = "default_max_request_body")]
    pub max_request_body: String,

    /// Set to "production" for JSON logging, anything else for human-readable.
    #[serde(default)]
    pub env: String,
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_secs)
    }

    pub fn verify_mode(&self) -> anyhow::Result<VerifyMode> {
        self.smtp_verify_mode.parse()
    }

    pub fn max_request_body_bytes(&self) -> usize {
        parse_bytes(&self.max_request_body).unwrap_or(1 << 20)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "vouch.db".to_string()
}

fn default_smtp_listen_addr() -> String {
    "0.0.0.0:2525".to_string()
}

fn default_recipient_prefix() -> String {
    "verify".to_string()
}

fn default_max_recipients() -> usize {
    5
}

fn default_max_message_bytes() -> usize {
    1 << 20
}

fn default_true() -> bool {
    true
}

fn default_verify_mode() -> String {
    "warn".to_string()
}

fn default_db_workers() -> usize {
    4
}

fn default_crypto_workers() -> usize {
    4
}

fn default_smtp_workers() -> usize {
    2
}

fn default_worker_queue_size() -> usize {
    1024
}

fn default_registration_ttl_secs() -> u64 {
    180
}

fn default_max_request_body() -> String {
    "1MB".to_string()
}

/// Parses `1048576`, `512KB`, `1MB`, `2GB` into bytes.
fn parse_bytes(s: &str) -> Option<usize> {
    let s = s.trim().to_uppercase();
    if let Ok(n) = s.parse::<usize>() {
        return Some(n);
    }

    let (base, mult) = if let Some(base) = s.strip_suffix("KB") {
        (base, 1usize << 10)
    } else if let Some(base) = s.strip_suffix("MB") {
        (base, 1 << 20)
    } else if let Some(base) = s.strip_suffix("GB") {
        (base, 1 << 30)
    } else {
        return None;
    };

    let value: f64 = base.trim().parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some((value * mult as f64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            smtp_listen_addr: default_smtp_listen_addr(),
            smtp_domain: "example.com".to_string(),
            smtp_recipient_prefix: default_recipient_prefix(),
            smtp_max_recipients: default_max_recipients(),
            smtp_max_message_bytes: default_max_message_bytes(),
            smtp_spf_enabled: true,
            smtp_dkim_enabled: true,
            smtp_verify_mode: default_verify_mode(),
            db_workers: default_db_workers(),
            crypto_workers: default_crypto_workers(),
            smtp_workers: default_smtp_workers(),
            worker_queue_size: default_worker_queue_size(),
            registration_ttl_secs: default_registration_ttl_secs(),
            max_request_body: default_max_request_body(),
            env: String::new(),
        }
    }

    #[test]
    fn verify_mode_parses_all_three_states() {
        assert_eq!("unrestricted".parse::<VerifyMode>().unwrap(), VerifyMode::Unrestricted);
        assert_eq!("warn".parse::<VerifyMode>().unwrap(), VerifyMode::Warn);
        assert_eq!("strict".parse::<VerifyMode>().unwrap(), VerifyMode::Strict);
        assert_eq!("STRICT".parse::<VerifyMode>().unwrap(), VerifyMode::Strict);
    }

    #[test]
    fn unknown_verify_mode_is_error() {
        assert!("paranoid".parse::<VerifyMode>().is_err());
    }

    #[test]
    fn parse_bytes_accepts_units_and_raw() {
        assert_eq!(parse_bytes("1048576"), Some(1 << 20));
        assert_eq!(parse_bytes("512KB"), Some(512 << 10));
        assert_eq!(parse_bytes("1MB"), Some(1 << 20));
        assert_eq!(parse_bytes("2GB"), Some(2 << 30));
        assert_eq!(parse_bytes("1.5MB"), Some((1.5 * (1 << 20) as f64) as usize));
    }

    #[test]
    fn parse_bytes_rejects_garbage() {
        assert_eq!(parse_bytes("lots"), None);
        assert_eq!(parse_bytes("-1MB"), None);
    }

    #[test]
    fn request_body_cap_falls_back_to_one_megabyte() {
        let mut config = base_config();
        config.max_request_body = "bogus".to_string();
        assert_eq!(config.max_request_body_bytes(), 1 << 20);
    }

    #[test]
    fn registration_ttl_is_three_minutes_by_default() {
        assert_eq!(base_config().registration_ttl(), Duration::from_secs(180));
    }
}
