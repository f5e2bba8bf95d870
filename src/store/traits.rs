//! `ThreadStore` trait and the persisted thread model.
//!
//! One record per source email. The conversation is stored as an ordered
//! JSON list of role/content pairs — it is both the chat transcript shown
//! to the model and the audit trail of what the supervisor decided.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Lifecycle status of an email thread.
///
/// `PendingReview` is the initial and only re-enterable state. `Sent` and
/// `NoResponse` are terminal: no operation transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadStatus {
    PendingReview,
    Sent,
    NoResponse,
}

impl ThreadStatus {
    /// Database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "PENDING_REVIEW",
            Self::Sent => "SENT",
            Self::NoResponse => "NO_RESPONSE",
        }
    }

    /// Parse a status string from the DB. Unknown values fall back to
    /// `PendingReview` so a hand-edited row can't wedge the reader.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "SENT" => Self::Sent,
            "NO_RESPONSE" => Self::NoResponse,
            _ => Self::PendingReview,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingReview)
    }
}

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn in the supervisor conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Reply threading metadata copied from the originating message.
///
/// Immutable after creation; used to keep the outbound reply in the same
/// mail thread (`In-Reply-To` / `References` headers, provider thread id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyHeaders {
    pub message_id: Option<String>,
    pub references: Option<String>,
    pub provider_thread_id: Option<String>,
}

/// A persisted email thread.
#[derive(Debug, Clone)]
pub struct EmailThread {
    /// Opaque external identifier — unique key, never reused.
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// Derived once at creation.
    pub summary: String,
    pub status: ThreadStatus,
    /// Append-only; insertion order is chronological.
    pub conversation: Vec<ChatTurn>,
    /// Latest proposed reply body — overwritten, not appended.
    pub draft_response: Option<String>,
    pub headers: ReplyHeaders,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a thread. Everything else starts empty.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub summary: String,
    pub headers: ReplyHeaders,
}

/// Backend-agnostic thread persistence.
///
/// All mutations are keyed by `email_id`. Callers serialize mutations per
/// key through [`crate::store::KeyedLocks`]; the backend additionally
/// guards status transitions so terminal states are sticky under races.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Create a thread, or return the existing record if `email_id` is
    /// already present. This is the ingestion dedup invariant: at-least-once
    /// delivery of the same external event yields exactly one thread.
    async fn create_thread(&self, new: NewThread) -> Result<EmailThread, DatabaseError>;

    /// Look up a thread by its external email id.
    async fn get_thread(&self, email_id: &str) -> Result<Option<EmailThread>, DatabaseError>;

    /// The most-recently-created thread still pending review, if any.
    async fn latest_pending(&self) -> Result<Option<EmailThread>, DatabaseError>;

    /// All threads pending review, newest first.
    async fn pending_threads(&self) -> Result<Vec<EmailThread>, DatabaseError>;

    /// Append one user/assistant exchange to the conversation and, when
    /// given, overwrite the draft — committed as a single statement so a
    /// failure leaves the record untouched. Returns the updated thread.
    async fn append_exchange(
        &self,
        email_id: &str,
        user_msg: &str,
        assistant_msg: &str,
        new_draft: Option<&str>,
    ) -> Result<EmailThread, DatabaseError>;

    /// Transition a pending thread to a terminal status.
    ///
    /// Only PENDING_REVIEW → {SENT, NO_RESPONSE} is legal; any other
    /// transition returns `DatabaseError::Constraint` without mutating.
    async fn update_status(
        &self,
        email_id: &str,
        status: ThreadStatus,
    ) -> Result<(), DatabaseError>;

    /// Append a final exchange and move the thread to a terminal status in
    /// one statement — the SEND / NO_RESPONSE commit. Subject to the same
    /// transition guard as `update_status`.
    async fn finalize_thread(
        &self,
        email_id: &str,
        user_msg: &str,
        assistant_msg: &str,
        status: ThreadStatus,
    ) -> Result<EmailThread, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            ThreadStatus::PendingReview,
            ThreadStatus::Sent,
            ThreadStatus::NoResponse,
        ] {
            assert_eq!(ThreadStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_string_falls_back_to_pending() {
        assert_eq!(
            ThreadStatus::from_str_lossy("ARCHIVED"),
            ThreadStatus::PendingReview
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!ThreadStatus::PendingReview.is_terminal());
        assert!(ThreadStatus::Sent.is_terminal());
        assert!(ThreadStatus::NoResponse.is_terminal());
    }

    #[test]
    fn chat_turn_serializes_with_lowercase_roles() {
        let turn = ChatTurn::user("send it");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains("\"role\":\"user\""));

        let turn = ChatTurn::assistant("Done.");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
    }

    #[test]
    fn conversation_json_round_trip() {
        let turns = vec![
            ChatTurn::user("draft a reply"),
            ChatTurn::assistant("Here's a draft: ..."),
        ];
        let json = serde_json::to_string(&turns).unwrap();
        let parsed: Vec<ChatTurn> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].role, ChatRole::User);
        assert_eq!(parsed[1].content, "Here's a draft: ...");
    }
}
