//! Receive-only ESMTP listener for verification mail.
//!
//! Speaks just enough SMTP to accept a message: HELO/EHLO, MAIL, RCPT,
//! DATA, RSET, NOOP, QUIT. AUTH is refused. Recipients that are not
//! `<prefix>+<nonce>@<domain>` are accepted with 250 and ignored, so a
//! probing sender cannot distinguish a live verification address from a
//! dead one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::VerifyMode;
use crate::smtp::auth::{DkimVerifier, SpfVerifier};
use crate::smtp::verify::{normalize_address, NonceProcessor};
use crate::utils::hash_email;
use crate::workers::{run_with_timeout, WorkManager};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-nonce processing bound once dispatched to the SMTP pool.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
/// RFC 5321 caps command lines at 512 octets; allow some slack.
const MAX_LINE_BYTES: u64 = 2048;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub domain: String,
    pub recipient_prefix: String,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    pub spf_enabled: bool,
    pub dkim_enabled: bool,
    pub verify_mode: VerifyMode,
}

/// The verification SMTP endpoint. Cheap to clone; one clone serves each
/// connection.
#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    processor: NonceProcessor,
    workers: Arc<WorkManager>,
    spf: Arc<dyn SpfVerifier>,
    dkim: Arc<dyn DkimVerifier>,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        processor: NonceProcessor,
        workers: Arc<WorkManager>,
        spf: Arc<dyn SpfVerifier>,
        dkim: Arc<dyn DkimVerifier>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            processor,
            workers,
            spf,
            dkim,
        }
    }

    /// Accept loop. Returns when the shutdown signal fires; in-flight
    /// sessions finish on their own tasks.
    pub async fn serve(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, domain = %self.config.domain, "smtp listener started");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_connection(stream, peer).await {
                                    tracing::debug!(peer = %peer, error = %err, "smtp session ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "smtp accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("smtp listener stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut session = Session {
            server: self.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            sender: None,
            rcpt_seen: false,
            nonces: Vec::new(),
        };
        session.run().await
    }
}

/// Per-connection protocol state.
struct Session {
    server: SmtpServer,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    /// Normalized MAIL FROM address, if seen.
    sender: Option<String>,
    /// Whether any RCPT command succeeded from the client's view,
    /// including ones we silently ignored.
    rcpt_seen: bool,
    /// Nonces extracted from accepted plus-tagged recipients.
    nonces: Vec<String>,
}

impl Session {
    async fn run(&mut self) -> std::io::Result<()> {
        let greeting = format!("220 {} ESMTP service ready", self.server.config.domain);
        self.reply(&greeting).await?;

        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(()); // client hung up
            };
            let upper = line.to_ascii_uppercase();

            if upper.starts_with("EHLO") {
                let reply = format!(
                    "250-{} Hello\r\n250 SIZE {}",
                    self.server.config.domain, self.server.config.max_message_bytes
                );
                self.reply(&reply).await?;
            } else if upper.starts_with("HELO") {
                let reply = format!("250 {} Hello", self.server.config.domain);
                self.reply(&reply).await?;
            } else if let Some(arg) = strip_command(&line, "MAIL FROM:") {
                self.sender = Some(normalize_address(extract_address(arg)));
                self.reply("250 2.1.0 OK").await?;
            } else if let Some(arg) = strip_command(&line, "RCPT TO:") {
                let reply = self.handle_rcpt(extract_address(arg));
                self.reply(&reply).await?;
            } else if upper == "DATA" {
                self.handle_data().await?;
            } else if upper == "RSET" {
                self.reset();
                self.reply("250 2.0.0 OK").await?;
            } else if upper == "NOOP" {
                self.reply("250 2.0.0 OK").await?;
            } else if upper == "QUIT" {
                self.reply("221 2.0.0 Bye").await?;
                return Ok(());
            } else if upper.starts_with("AUTH") {
                self.reply("502 5.7.0 authentication not available").await?;
            } else {
                self.reply("502 5.5.2 command not implemented").await?;
            }
        }
    }

    /// RCPT TO. Only `<prefix>+<nonce>@<domain>` recipients are queued;
    /// everything else is waved through with 250 and dropped so that
    /// probing for live addresses tells the sender nothing.
    fn handle_rcpt(&mut self, arg: &str) -> String {
        if self.sender.is_none() {
            return "503 5.5.1 MAIL first".to_string();
        }

        let addr = normalize_address(arg);
        let Some((local, domain)) = addr.rsplit_once('@') else {
            self.rcpt_seen = true;
            return "250 2.1.5 OK".to_string();
        };

        if !domain.eq_ignore_ascii_case(&self.server.config.domain) {
            tracing::debug!(peer = %self.peer, "smtp rcpt ignored: wrong domain");
            self.rcpt_seen = true;
            return "250 2.1.5 OK".to_string();
        }

        let prefix = self.server.config.recipient_prefix.to_lowercase();
        let nonce = match local.split_once('+') {
            Some((p, nonce)) if p.to_lowercase() == prefix => nonce.trim(),
            _ => {
                tracing::debug!(
                    peer = %self.peer,
                    local = %hash_email(local),
                    "smtp rcpt ignored: not a verification address"
                );
                self.rcpt_seen = true;
                return "250 2.1.5 OK".to_string();
            }
        };

        if self.nonces.len() >= self.server.config.max_recipients {
            return "452 5.3.3 too many recipients".to_string();
        }

        if !nonce.is_empty() {
            self.nonces.push(nonce.to_string());
        }
        self.rcpt_seen = true;
        "250 2.1.5 OK".to_string()
    }

    async fn handle_data(&mut self) -> std::io::Result<()> {
        if self.sender.is_none() || !self.rcpt_seen {
            return self.reply("503 5.5.1 MAIL and RCPT first").await;
        }

        self.reply("354 start mail input; end with <CRLF>.<CRLF>").await?;
        let message = match self.read_message_body().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(peer = %self.peer, error = %err, "smtp data: error reading message");
                self.reply("451 4.3.0 error reading message").await?;
                return Err(err);
            }
        };

        if !self.sender_checks_pass(&message).await? {
            self.reset();
            return Ok(());
        }

        self.dispatch_nonces();
        self.reply("250 2.0.0 OK: queued").await?;
        self.reset();
        Ok(())
    }

    /// Reads the DATA payload up to the terminating `.` line, buffering at
    /// most `max_message_bytes` (the prefix DKIM needs); the rest is
    /// drained and discarded.
    async fn read_message_body(&mut self) -> std::io::Result<Vec<u8>> {
        let max = self.server.config.max_message_bytes;
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;

        loop {
            let mut line = Vec::new();
            let n = tokio::time::timeout(
                READ_TIMEOUT,
                self.reader.read_until(b'\n', &mut line),
            )
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ));
            }

            let trimmed = trim_crlf(&line);
            if trimmed == b"." {
                break;
            }

            // Transparency per RFC 5321 §4.5.2: a leading dot was doubled
            // by the sender.
            let payload = if trimmed.starts_with(b"..") { &line[1..] } else { &line[..] };

            if body.len() + payload.len() <= max {
                body.extend_from_slice(payload);
            } else if !truncated {
                truncated = true;
                tracing::warn!(peer = %self.peer, "smtp data: message exceeds size limit, truncating buffer");
            }
        }

        Ok(body)
    }

    /// Applies SPF/DKIM according to the configured verify mode. Returns
    /// false after writing the rejection if the message must be refused.
    async fn sender_checks_pass(&mut self, message: &[u8]) -> std::io::Result<bool> {
        let mode = self.server.config.verify_mode;
        if mode == VerifyMode::Unrestricted {
            return Ok(true);
        }

        if self.server.config.spf_enabled {
            if let Some(sender) = self.sender.clone().filter(|s| !s.is_empty()) {
                let disposition = self.server.spf.check(self.peer.ip(), &sender).await;
                if disposition.is_failure() {
                    match mode {
                        VerifyMode::Strict => {
                            tracing::warn!(
                                peer = %self.peer,
                                sender = %hash_email(&sender),
                                result = %disposition,
                                "smtp spf check failed, rejecting"
                            );
                            self.reply("550 5.7.1 SPF check failed").await?;
                            return Ok(false);
                        }
                        _ => {
                            tracing::warn!(
                                peer = %self.peer,
                                sender = %hash_email(&sender),
                                result = %disposition,
                                "smtp spf check failed, accepting anyway"
                            );
                        }
                    }
                }
            }
        }

        if self.server.config.dkim_enabled && !message.is_empty() {
            let disposition = self.server.dkim.check(message).await;
            if disposition.is_failure() {
                match mode {
                    VerifyMode::Strict => {
                        tracing::warn!(
                            peer = %self.peer,
                            result = %disposition,
                            "smtp dkim check failed, rejecting"
                        );
                        self.reply("550 5.7.1 DKIM verification failed").await?;
                        return Ok(false);
                    }
                    _ => {
                        tracing::warn!(
                            peer = %self.peer,
                            result = %disposition,
                            "smtp dkim check failed, accepting anyway"
                        );
                    }
                }
            }
        }

        Ok(true)
    }

    /// Hands every queued nonce to the SMTP pool. Each nonce gets its own
    /// bounded processing slot; a full queue drops the nonce (the client
    /// retries by sending another email).
    fn dispatch_nonces(&mut self) {
        let Some(sender) = self.sender.clone() else {
            return;
        };
        let remote = self.peer.to_string();

        for nonce in self.nonces.drain(..) {
            let processor = self.server.processor.clone();
            let sender = sender.clone();
            let remote = remote.clone();

            let submitted = self.server.workers.submit_smtp(async move {
                let nonce_for_log = nonce.clone();
                let completed = run_with_timeout(DISPATCH_TIMEOUT, async move {
                    processor.process(&nonce, &sender, &remote);
                })
                .await;
                if !completed {
                    tracing::warn!(
                        nonce = %hash_email(&nonce_for_log),
                        "smtp nonce processing timed out"
                    );
                }
            });

            if let Err(err) = submitted {
                tracing::warn!(error = %err, "smtp pool rejected nonce processing task");
            }
        }
    }

    fn reset(&mut self) {
        self.sender = None;
        self.rcpt_seen = false;
        self.nonces.clear();
    }

    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = Vec::new();
        let n = tokio::time::timeout(
            READ_TIMEOUT,
            (&mut self.reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut line),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;

        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") && n as u64 >= MAX_LINE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "command line too long",
            ));
        }

        Ok(Some(String::from_utf8_lossy(trim_crlf(&line)).into_owned()))
    }

    async fn reply(&mut self, text: &str) -> std::io::Result<()> {
        let wire = format!("{text}\r\n");
        tokio::time::timeout(WRITE_TIMEOUT, self.writer.write_all(wire.as_bytes()))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??;
        tokio::time::timeout(WRITE_TIMEOUT, self.writer.flush())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??;
        Ok(())
    }
}

/// Case-insensitive command prefix match; returns the argument remainder.
fn strip_command<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    if line.len() >= command.len() && line[..command.len()].eq_ignore_ascii_case(command) {
        Some(line[command.len()..].trim())
    } else {
        None
    }
}

/// Pulls the address out of a MAIL/RCPT argument, dropping ESMTP
/// parameters like `SIZE=..` that may follow the angle-bracket form.
fn extract_address(arg: &str) -> &str {
    if let Some(start) = arg.find('<') {
        if let Some(len) = arg[start..].find('>') {
            return &arg[start + 1..start + len];
        }
    }
    arg.split_whitespace().next().unwrap_or("")
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::auth::{
        DkimDisposition, MockDkimVerifier, MockSpfVerifier, SpfDisposition,
    };
    use crate::smtp::verify::expected_key;
    use crate::stores::{MemoryTtlStore, SlidingWindowLimiter, TtlStoreConfig, VerificationRegistry};
    use crate::workers::{WorkManager, WorkManagerConfig};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct TestHarness {
        ttl: MemoryTtlStore,
        registry: Arc<VerificationRegistry>,
        _shutdown_tx: watch::Sender<bool>,
        addr: SocketAddr,
    }

    async fn harness_with(
        verify_mode: VerifyMode,
        spf: MockSpfVerifier,
        dkim: MockDkimVerifier,
    ) -> TestHarness {
        let ttl = MemoryTtlStore::with_config(TtlStoreConfig {
            capacity: 100,
            sweep_interval: Duration::from_secs(3600),
        });
        let registry = Arc::new(VerificationRegistry::new());
        let processor = NonceProcessor {
            ttl: ttl.clone(),
            registry: Arc::clone(&registry),
            rate_limiter: SlidingWindowLimiter::new(100, Duration::from_secs(300)),
            verified_ttl: Duration::from_secs(180),
        };
        let workers = Arc::new(WorkManager::new(WorkManagerConfig {
            db_workers: 1,
            crypto_workers: 1,
            smtp_workers: 2,
            queue_size: 32,
        }));
        let server = SmtpServer::new(
            SmtpConfig {
                domain: "example.com".to_string(),
                recipient_prefix: "verify".to_string(),
                max_recipients: 2,
                max_message_bytes: 4096,
                spf_enabled: true,
                dkim_enabled: true,
                verify_mode,
            },
            processor,
            workers,
            Arc::new(spf),
            Arc::new(dkim),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.serve(listener, shutdown_rx));

        TestHarness {
            ttl,
            registry,
            _shutdown_tx: shutdown_tx,
            addr,
        }
    }

    async fn harness() -> TestHarness {
        harness_with(
            VerifyMode::Unrestricted,
            MockSpfVerifier::new(),
            MockDkimVerifier::new(),
        )
        .await
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(read_half),
                writer: write_half,
            };
            let banner = client.read_reply().await;
            assert!(banner.starts_with("220"), "unexpected banner: {banner}");
            client
        }

        async fn send(&mut self, line: &str) -> String {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
            self.read_reply().await
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn read_reply(&mut self) -> String {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                // Skip continuation lines of multi-line replies.
                if line.len() >= 4 && line.as_bytes()[3] == b'-' {
                    continue;
                }
                return line.trim_end().to_string();
            }
        }
    }

    async fn send_message(client: &mut Client, from: &str, rcpt: &str) -> String {
        assert!(client.send(&format!("MAIL FROM:<{from}>")).await.starts_with("250"));
        assert!(client.send(&format!("RCPT TO:<{rcpt}>")).await.starts_with("250"));
        let data = client.send("DATA").await;
        assert!(data.starts_with("354"), "unexpected DATA reply: {data}");
        client.send_raw("Subject: hi").await;
        client.send_raw("").await;
        client.send_raw("verification mail").await;
        client.send(".").await
    }

    #[tokio::test]
    async fn matching_recipient_triggers_verification() {
        let h = harness().await;
        let nonce = "a".repeat(64);
        h.ttl
            .set_with_value(&expected_key(&nonce), "alice@example.com", Duration::from_secs(180))
            .unwrap();
        let mut rx = h.registry.register(&nonce);

        let mut client = Client::connect(h.addr).await;
        let reply = send_message(
            &mut client,
            "alice@example.com",
            &format!("verify+{nonce}@example.com"),
        )
        .await;
        assert!(reply.starts_with("250"), "unexpected reply: {reply}");

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handler was not notified")
            .expect("channel closed without firing");
        assert_eq!(h.ttl.get(&nonce), Some("alice@example.com".to_string()));
    }

    #[tokio::test]
    async fn wrong_domain_accepted_but_ignored() {
        let h = harness().await;
        let nonce = "b".repeat(64);
        h.ttl
            .set_with_value(&expected_key(&nonce), "alice@example.com", Duration::from_secs(180))
            .unwrap();

        let mut client = Client::connect(h.addr).await;
        let reply = send_message(
            &mut client,
            "alice@example.com",
            &format!("verify+{nonce}@elsewhere.org"),
        )
        .await;
        assert!(reply.starts_with("250"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ttl.get(&nonce), None);
    }

    #[tokio::test]
    async fn wrong_prefix_accepted_but_ignored() {
        let h = harness().await;
        let nonce = "c".repeat(64);
        h.ttl
            .set_with_value(&expected_key(&nonce), "alice@example.com", Duration::from_secs(180))
            .unwrap();

        let mut client = Client::connect(h.addr).await;
        let reply = send_message(
            &mut client,
            "alice@example.com",
            &format!("support+{nonce}@example.com"),
        )
        .await;
        assert!(reply.starts_with("250"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ttl.get(&nonce), None);
    }

    #[tokio::test]
    async fn untagged_recipient_accepted_but_ignored() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        assert!(client.send("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        let reply = client.send("RCPT TO:<postmaster@example.com>").await;
        assert!(reply.starts_with("250"));
    }

    #[tokio::test]
    async fn recipient_limit_enforced() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        assert!(client.send("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        for i in 0..2 {
            let nonce = format!("{i}").repeat(64);
            let reply = client.send(&format!("RCPT TO:<verify+{nonce}@example.com>")).await;
            assert!(reply.starts_with("250"));
        }

        let nonce = "9".repeat(64);
        let reply = client.send(&format!("RCPT TO:<verify+{nonce}@example.com>")).await;
        assert!(reply.starts_with("452"), "unexpected reply: {reply}");
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_rejected() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        let reply = client.send("RCPT TO:<verify+abc@example.com>").await;
        assert!(reply.starts_with("503"));
    }

    #[tokio::test]
    async fn auth_is_refused() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        let reply = client.send("AUTH LOGIN").await;
        assert!(reply.starts_with("502"));
    }

    #[tokio::test]
    async fn rset_clears_session_state() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        assert!(client.send("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        assert!(client.send("RSET").await.starts_with("250"));
        // Sender was cleared, so RCPT is now out of sequence.
        let reply = client.send("RCPT TO:<verify+abc@example.com>").await;
        assert!(reply.starts_with("503"));
    }

    #[tokio::test]
    async fn quit_closes_politely() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        let reply = client.send("QUIT").await;
        assert!(reply.starts_with("221"));
    }

    #[tokio::test]
    async fn strict_spf_failure_rejects_message() {
        let mut spf = MockSpfVerifier::new();
        spf.expect_check().returning(|_, _| SpfDisposition::Fail);
        let mut dkim = MockDkimVerifier::new();
        dkim.expect_check().returning(|_| DkimDisposition::Pass);

        let h = harness_with(VerifyMode::Strict, spf, dkim).await;
        let mut client = Client::connect(h.addr).await;
        let reply = send_message(&mut client, "alice@example.com", "verify+abc@example.com").await;

        assert!(reply.starts_with("550"), "unexpected reply: {reply}");
    }

    #[tokio::test]
    async fn strict_dkim_failure_rejects_message() {
        let mut spf = MockSpfVerifier::new();
        spf.expect_check().returning(|_, _| SpfDisposition::Pass);
        let mut dkim = MockDkimVerifier::new();
        dkim.expect_check().returning(|_| DkimDisposition::Fail);

        let h = harness_with(VerifyMode::Strict, spf, dkim).await;
        let mut client = Client::connect(h.addr).await;
        let reply = send_message(&mut client, "alice@example.com", "verify+abc@example.com").await;

        assert!(reply.starts_with("550"), "unexpected reply: {reply}");
    }

    #[tokio::test]
    async fn warn_mode_accepts_despite_failures() {
        let mut spf = MockSpfVerifier::new();
        spf.expect_check().returning(|_, _| SpfDisposition::SoftFail);
        let mut dkim = MockDkimVerifier::new();
        dkim.expect_check().returning(|_| DkimDisposition::Fail);

        let h = harness_with(VerifyMode::Warn, spf, dkim).await;
        let nonce = "d".repeat(64);
        h.ttl
            .set_with_value(&expected_key(&nonce), "alice@example.com", Duration::from_secs(180))
            .unwrap();
        let mut rx = h.registry.register(&nonce);

        let mut client = Client::connect(h.addr).await;
        let reply = send_message(
            &mut client,
            "alice@example.com",
            &format!("verify+{nonce}@example.com"),
        )
        .await;
        assert!(reply.starts_with("250"));

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handler was not notified")
            .expect("channel closed without firing");
    }

    #[test]
    fn extract_address_handles_params_and_bare_forms() {
        assert_eq!(extract_address("<alice@example.com> SIZE=1024"), "alice@example.com");
        assert_eq!(extract_address("<alice@example.com>"), "alice@example.com");
        assert_eq!(extract_address("alice@example.com"), "alice@example.com");
        assert_eq!(extract_address(""), "");
    }

    #[test]
    fn strip_command_is_case_insensitive() {
        assert_eq!(strip_command("mail from:<a@b>", "MAIL FROM:"), Some("<a@b>"));
        assert_eq!(strip_command("RCPT TO: <a@b>", "RCPT TO:"), Some("<a@b>"));
        assert_eq!(strip_command("DATA", "MAIL FROM:"), None);
    }

    #[tokio::test]
    async fn dot_stuffed_lines_are_unstuffed() {
        let h = harness().await;
        let mut client = Client::connect(h.addr).await;

        assert!(client.send("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        assert!(client.send("RCPT TO:<other@example.com>").await.starts_with("250"));
        assert!(client.send("DATA").await.starts_with("354"));
        client.send_raw("..leading dot line").await;
        let reply = client.send(".").await;
        assert!(reply.starts_with("250"));
    }
}
