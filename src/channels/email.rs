//! Mail provider — raw IMAP over rustls for inbound, SMTP via lettre for
//! outbound.
//!
//! The IMAP side speaks the protocol directly over a TLS stream (LOGIN /
//! SELECT / SEARCH / FETCH / STORE); each trait call opens a fresh
//! connection inside `spawn_blocking`. External ids are `Message-ID` header
//! values so dedup survives restarts; messages without one fall back to a
//! sequence-number id.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;

use crate::channels::{InboundEmail, MailProvider, OutboundReply};
use crate::error::ChannelError;
use crate::store::ReplyHeaders;

/// IMAP/SMTP socket read timeout.
const SOCKET_TIMEOUT_SECS: u64 = 30;

/// Prefix for fallback ids of messages that carry no Message-ID header.
const SEQ_ID_PREFIX: &str = "seq:";

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAIL_IMAP_HOST` is not set (mail disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("MAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("MAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("MAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("MAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("MAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Provider ────────────────────────────────────────────────────────

/// IMAP + SMTP implementation of [`MailProvider`].
pub struct ImapSmtpMail {
    config: EmailConfig,
}

impl ImapSmtpMail {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn send_failed(reason: impl std::fmt::Display) -> ChannelError {
        ChannelError::SendFailed {
            name: "mail".into(),
            reason: reason.to_string(),
        }
    }

    fn fetch_failed(reason: impl std::fmt::Display) -> ChannelError {
        ChannelError::FetchFailed {
            name: "mail".into(),
            reason: reason.to_string(),
        }
    }

    /// Send an email via SMTP (blocking — run in spawn_blocking).
    fn send_smtp(config: &EmailConfig, reply: &OutboundReply) -> Result<(), ChannelError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| Self::send_failed(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))
            .build();

        let mut builder = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| Self::send_failed(format!("Invalid from address: {e}")))?,
            )
            .to(reply
                .to
                .parse()
                .map_err(|e| Self::send_failed(format!("Invalid to address: {e}")))?)
            .subject(&reply.subject);

        if let Some(ref message_id) = reply.headers.message_id {
            builder = builder.in_reply_to(message_id.clone());
            let references = match reply.headers.references {
                Some(ref refs) => format!("{refs} {message_id}"),
                None => message_id.clone(),
            };
            builder = builder.references(references);
        }

        let email = builder
            .body(reply.body.clone())
            .map_err(|e| Self::send_failed(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| Self::send_failed(format!("SMTP send failed: {e}")))?;

        tracing::info!(to = %reply.to, "Reply email sent");
        Ok(())
    }
}

#[async_trait]
impl MailProvider for ImapSmtpMail {
    async fn list_unread(&self) -> Result<Vec<String>, ChannelError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut client = ImapClient::connect(&config)?;
            let seqs = client.search_unseen()?;
            let mut ids = Vec::with_capacity(seqs.len());
            for seq in seqs {
                match client.fetch_message_id(&seq)? {
                    Some(mid) => ids.push(mid),
                    None => ids.push(format!("{SEQ_ID_PREFIX}{seq}")),
                }
            }
            client.logout();
            Ok(ids)
        })
        .await
        .map_err(|e| Self::fetch_failed(format!("IMAP task panicked: {e}")))?
    }

    async fn fetch(&self, id: &str) -> Result<InboundEmail, ChannelError> {
        let config = self.config.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut client = ImapClient::connect(&config)?;
            let seq = client
                .resolve_seq(&id)?
                .ok_or_else(|| Self::fetch_failed(format!("message not found: {id}")))?;
            let raw = client.fetch_body(&seq)?;
            client.logout();

            let parsed = MessageParser::default()
                .parse(raw.as_bytes())
                .ok_or_else(|| Self::fetch_failed("unparseable message"))?;

            let sender = extract_sender(&parsed);
            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let body = extract_text(&parsed);
            let message_id = parsed.message_id().map(|m| format!("<{m}>"));
            let references = parsed
                .header_raw("References")
                .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|r| !r.is_empty());

            Ok(InboundEmail {
                id,
                sender,
                subject,
                body,
                headers: ReplyHeaders {
                    message_id,
                    references,
                    provider_thread_id: None,
                },
            })
        })
        .await
        .map_err(|e| Self::fetch_failed(format!("IMAP task panicked: {e}")))?
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), ChannelError> {
        let config = self.config.clone();
        let reply = reply.clone();
        tokio::task::spawn_blocking(move || Self::send_smtp(&config, &reply))
            .await
            .map_err(|e| Self::send_failed(format!("SMTP task panicked: {e}")))?
    }

    async fn mark_read(&self, id: &str) -> Result<(), ChannelError> {
        let config = self.config.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut client = ImapClient::connect(&config)?;
            if let Some(seq) = client.resolve_seq(&id)? {
                client.mark_seen(&seq)?;
            }
            client.logout();
            Ok(())
        })
        .await
        .map_err(|e| Self::fetch_failed(format!("IMAP task panicked: {e}")))?
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Derive the reply subject, without stacking `Re:` prefixes.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_ascii_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Blocking IMAP client ────────────────────────────────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal IMAP command client over TLS. One connection per operation.
struct ImapClient {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapClient {
    /// Connect, log in, and select INBOX.
    fn connect(config: &EmailConfig) -> Result<Self, ChannelError> {
        Self::connect_inner(config).map_err(|e| ChannelError::FetchFailed {
            name: "mail".into(),
            reason: e.to_string(),
        })
    }

    fn connect_inner(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut client = Self { tls, tag_counter: 1 };

        let _greeting = client.read_line()?;

        let login = client.send_cmd(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username, config.password
        ))?;
        if !login.last().is_some_and(|l| l.contains("OK")) {
            return Err("IMAP login failed".into());
        }

        let _select = client.send_cmd("SELECT \"INBOX\"")?;
        Ok(client)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send_cmd(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;

        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn wrap<T>(result: Result<T, ImapError>) -> Result<T, ChannelError> {
        result.map_err(|e| ChannelError::FetchFailed {
            name: "mail".into(),
            reason: e.to_string(),
        })
    }

    /// Sequence numbers of unseen messages.
    fn search_unseen(&mut self) -> Result<Vec<String>, ChannelError> {
        let resp = Self::wrap(self.send_cmd("SEARCH UNSEEN"))?;
        Ok(parse_search_response(&resp))
    }

    /// The Message-ID header of one message, angle brackets included.
    fn fetch_message_id(&mut self, seq: &str) -> Result<Option<String>, ChannelError> {
        let resp = Self::wrap(
            self.send_cmd(&format!(
                "FETCH {seq} BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)]"
            )),
        )?;
        Ok(parse_message_id_response(&resp))
    }

    /// Full RFC822 body of one message, without setting `\Seen`.
    fn fetch_body(&mut self, seq: &str) -> Result<String, ChannelError> {
        let resp = Self::wrap(self.send_cmd(&format!("FETCH {seq} BODY.PEEK[]")))?;
        // First line is the FETCH envelope, last is the tagged completion.
        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect();
        Ok(raw)
    }

    /// Resolve an external id back to a sequence number.
    fn resolve_seq(&mut self, id: &str) -> Result<Option<String>, ChannelError> {
        if let Some(seq) = id.strip_prefix(SEQ_ID_PREFIX) {
            return Ok(Some(seq.to_string()));
        }
        let resp = Self::wrap(
            self.send_cmd(&format!("SEARCH HEADER Message-ID \"{}\"", id)),
        )?;
        Ok(parse_search_response(&resp).into_iter().next())
    }

    fn mark_seen(&mut self, seq: &str) -> Result<(), ChannelError> {
        Self::wrap(self.send_cmd(&format!("STORE {seq} +FLAGS (\\Seen)")))?;
        Ok(())
    }

    fn logout(&mut self) {
        let _ = self.send_cmd("LOGOUT");
    }
}

/// Pull sequence numbers out of a `* SEARCH ...` response.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    let mut seqs = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            seqs.extend(
                line.split_whitespace()
                    .skip(2)
                    .map(|s| s.trim().to_string()),
            );
        }
    }
    seqs
}

/// Pull a `Message-ID:` value out of a header FETCH response.
fn parse_message_id_response(lines: &[String]) -> Option<String> {
    for line in lines {
        let lower = line.to_ascii_lowercase();
        if let Some(pos) = lower.find("message-id:") {
            let value = line[pos + "message-id:".len()..].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────────
