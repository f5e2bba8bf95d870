//! Intent classifier — maps free-text supervisor input to the closed
//! intent set.
//!
//! One tight, low-temperature LLM call per inbound message. The model is
//! asked for a single intent name; whatever comes back (including a failed
//! call) is coerced into the set, so from the router's perspective this is
//! a total function.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::router::types::{EmailContext, Intent};

/// Max tokens for the classification call — one word is enough.
const CLASSIFY_MAX_TOKENS: u32 = 16;

/// Classification should be as deterministic as the model allows.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Intent classifier backed by an LLM provider.
pub struct IntentClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Classify a supervisor message. Always returns a member of the
    /// intent set; model failure or out-of-set output coerces to
    /// `DraftRequest`.
    pub async fn classify(&self, message: &str, ctx: &EmailContext, has_draft: bool) -> Intent {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(classify_system_prompt()),
            ChatMessage::user(classify_user_prompt(message, ctx, has_draft)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let raw = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => response.content,
            Ok(Err(e)) => {
                warn!(error = %e, "Intent classification failed, defaulting to draft request");
                return Intent::DraftRequest;
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Intent classification timed out, defaulting to draft request"
                );
                return Intent::DraftRequest;
            }
        };

        let intent = Intent::from_raw(&raw);
        debug!(raw = %raw.trim(), intent = intent.label(), "Classified supervisor message");
        intent
    }
}

fn classify_system_prompt() -> String {
    "You classify a supervisor's chat message about a pending email into exactly one intent.\n\n\
     Intents:\n\
     - SEND_COMMAND: approve and send the current draft (\"send it\", \"looks good, send\")\n\
     - NO_RESPONSE: dismiss the email, no reply needed (\"ignore this\", \"no response needed\")\n\
     - QUESTION: asking about the email or sender (\"what's this about?\", \"who sent this?\")\n\
     - DRAFT_REQUEST: asking for a reply to be written (\"draft a reply\", \"tell him yes\")\n\
     - REFINEMENT: asking to change an existing draft (\"make it friendlier\", \"shorter\")\n\n\
     Respond with ONLY the intent name. No punctuation, no explanation."
        .to_string()
}

fn classify_user_prompt(message: &str, ctx: &EmailContext, has_draft: bool) -> String {
    format!(
        "Email from: {sender}\n\
         Subject: {subject}\n\
         A draft reply {draft_state}.\n\n\
         Supervisor message: \"{message}\"",
        sender = ctx.sender,
        subject = ctx.subject,
        draft_state = if has_draft {
            "already exists"
        } else {
            "does not exist yet"
        },
    )
}
