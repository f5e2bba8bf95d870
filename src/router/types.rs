//! Shared types for the conversation router.

use serde::{Deserialize, Serialize};

use crate::store::EmailThread;

/// Classified supervisor purpose for an inbound message.
///
/// A closed set at the boundary: whatever the classifier model emits goes
/// through [`Intent::from_raw`], whose default arm is `DraftRequest` — the
/// safest outcome is a draft for supervisor review, never an unprompted
/// send or a silent discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    SendCommand,
    NoResponse,
    Question,
    DraftRequest,
    Refinement,
}

impl Intent {
    /// Total mapping from raw classifier output to the intent set.
    ///
    /// Tolerates case, surrounding punctuation, and trailing chatter; any
    /// out-of-set or malformed output coerces to `DraftRequest`.
    pub fn from_raw(raw: &str) -> Self {
        let token = raw
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .to_ascii_uppercase();

        match token.as_str() {
            "SEND_COMMAND" => Self::SendCommand,
            "NO_RESPONSE" => Self::NoResponse,
            "QUESTION" => Self::Question,
            "DRAFT_REQUEST" => Self::DraftRequest,
            "REFINEMENT" => Self::Refinement,
            _ => Self::DraftRequest,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendCommand => "send_command",
            Self::NoResponse => "no_response",
            Self::Question => "question",
            Self::DraftRequest => "draft_request",
            Self::Refinement => "refinement",
        }
    }
}

/// Snapshot of the originating email, passed to the AI layer.
#[derive(Debug, Clone)]
pub struct EmailContext {
    pub sender: String,
    pub subject: String,
    pub body: String,
}

impl From<&EmailThread> for EmailContext {
    fn from(thread: &EmailThread) -> Self {
        Self {
            sender: thread.sender.clone(),
            subject: thread.subject.clone(),
            body: thread.body.clone(),
        }
    }
}

/// How the router picks the thread an inbound message targets.
///
/// The state machine takes this as an explicit parameter; "most recent
/// pending" is the webhook caller's policy, not a global cursor baked into
/// the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadSelector {
    /// The most-recently-created thread still pending review.
    MostRecentPending,
    /// A specific thread, if it is still pending review.
    ByEmailId(String),
}
