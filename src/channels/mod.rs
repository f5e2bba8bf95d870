//! Collaborator seams — pure I/O, no business logic.
//!
//! The router and ingestion loop only see these traits; concrete
//! implementations (IMAP/SMTP, Twilio WhatsApp) live alongside them.

pub mod email;
pub mod whatsapp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::store::ReplyHeaders;

pub use email::{EmailConfig, ImapSmtpMail};
pub use whatsapp::{TwilioConfig, TwilioMessenger};

/// A fetched source email, ready to become a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Provider-native identifier — the dedup key.
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// Threading metadata for reply linkage.
    pub headers: ReplyHeaders,
}

/// An outbound reply to a source email.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Threading metadata copied from the thread record.
    pub headers: ReplyHeaders,
}

/// Mail provider collaborator.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Identifiers of unread source messages.
    async fn list_unread(&self) -> Result<Vec<String>, ChannelError>;

    /// Fetch the full content of one message.
    async fn fetch(&self, id: &str) -> Result<InboundEmail, ChannelError>;

    /// Send a reply, threading it onto the original conversation.
    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), ChannelError>;

    /// Mark a source message read.
    async fn mark_read(&self, id: &str) -> Result<(), ChannelError>;
}

/// Push-messaging collaborator (the supervisor's chat channel).
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a plain text message.
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError>;

    /// Send a provider-mandated structured template message.
    ///
    /// Callers fall back to `send_text` when this fails or no template is
    /// configured.
    async fn send_template(
        &self,
        to: &str,
        template_ref: &str,
        vars: &[String],
    ) -> Result<(), ChannelError>;
}
