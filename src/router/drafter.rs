//! Draft Engine — summarizes new mail, answers supervisor questions, and
//! generates/refines reply drafts.
//!
//! `draft_reply` asks the model for a structured `{"reply", "draft"}`
//! object so the caller never has to fish a draft out of prose. A
//! delimiter-scan shim ([`extract_delimited_draft`]) remains for models
//! that ignore the JSON instruction and emit a `---`-fenced draft instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider};
use crate::router::types::EmailContext;
use crate::store::{ChatRole, ChatTurn};

/// Turns of recent conversation given to question answering.
const QUESTION_CONTEXT_TURNS: usize = 6;

/// Max tokens for a summary — the notification must stay short.
const SUMMARY_MAX_TOKENS: u32 = 150;

/// Max tokens for draft generation.
const DRAFT_MAX_TOKENS: u32 = 600;

/// Structured outcome of a draft/refine call.
#[derive(Debug, Clone)]
pub struct DraftOutcome {
    /// Conversational text for the supervisor.
    pub reply: String,
    /// The proposed email body.
    pub draft: String,
}

/// Draft Engine backed by an LLM provider.
pub struct DraftEngine {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl DraftEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn call(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Summarize an email for the supervisor notification. Set once at
    /// thread creation.
    pub async fn summarize_email(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "Email from: {sender}\n\
             Subject: {subject}\n\n\
             Body:\n{body}\n\n\
             Provide a sharp, concise summary (2-3 sentences max):\n\
             - Sender's intent\n\
             - Key facts\n\
             - Action items or expectations\n\n\
             No opinions. No invented details. Just the facts."
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You are a concise, highly competent email assistant. \
                 Capture only what matters — no fluff, no drama.",
            ),
            ChatMessage::user(prompt),
        ])
        .with_temperature(0.5)
        .with_max_tokens(SUMMARY_MAX_TOKENS);

        Ok(self.call(request).await?.content.trim().to_string())
    }

    /// Answer a supervisor question using a short window of recent
    /// conversation. Never touches the draft.
    pub async fn answer_question(
        &self,
        question: &str,
        ctx: &EmailContext,
        conversation: &[ChatTurn],
    ) -> Result<String, LlmError> {
        let mut messages = vec![
            ChatMessage::system(
                "You are an email assistant chatting with your supervisor about one \
                 pending email. Answer their question directly in one or two \
                 sentences. Use only the email content and the conversation so far — \
                 never invent details.",
            ),
            ChatMessage::user(email_context_message(ctx)),
        ];

        let recent = conversation
            .iter()
            .skip(conversation.len().saturating_sub(QUESTION_CONTEXT_TURNS));
        for turn in recent {
            messages.push(turn_to_message(turn));
        }
        messages.push(ChatMessage::user(question));

        let request = CompletionRequest::new(messages)
            .with_temperature(0.6)
            .with_max_tokens(300);

        Ok(self.call(request).await?.content.trim().to_string())
    }

    /// Generate or refine a reply draft from the full conversation history.
    pub async fn draft_reply(
        &self,
        instruction: &str,
        ctx: &EmailContext,
        conversation: &[ChatTurn],
    ) -> Result<DraftOutcome, LlmError> {
        let mut messages = vec![
            ChatMessage::system(draft_system_prompt()),
            ChatMessage::user(email_context_message(ctx)),
        ];
        for turn in conversation {
            messages.push(turn_to_message(turn));
        }
        messages.push(ChatMessage::user(instruction));

        let request = CompletionRequest::new(messages)
            .with_temperature(0.6)
            .with_max_tokens(DRAFT_MAX_TOKENS);

        let response = self.call(request).await?;
        parse_draft_response(&response.content).ok_or_else(|| {
            warn!(
                raw_response = %response.content,
                "Draft response had neither JSON nor a delimited draft block"
            );
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "no draft found in model output".into(),
            }
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn draft_system_prompt() -> String {
    "You are a sharp, efficient email assistant drafting replies on behalf of \
     your supervisor.\n\n\
     BEHAVIOR RULES:\n\
     - Follow the supervisor's instructions EXACTLY\n\
     - If guidance is vague, write a reasonable professional draft\n\
     - Polite, clear, professional email tone\n\
     - No greetings or sign-offs unless the supervisor asks for them\n\
     - Never invent details, commitments, names, or times that are not in \
       the original email or the supervisor's instructions\n\n\
     OUTPUT:\n\
     Respond with ONLY a JSON object:\n\
     {\"reply\": \"<one short sentence to the supervisor about what you did>\", \
      \"draft\": \"<the full email body text>\"}\n\
     No other text."
        .to_string()
}

fn email_context_message(ctx: &EmailContext) -> String {
    format!(
        "Original email:\nFrom: {}\nSubject: {}\nBody: {}",
        ctx.sender, ctx.subject, ctx.body
    )
}

fn turn_to_message(turn: &ChatTurn) -> ChatMessage {
    match turn.role {
        ChatRole::User => ChatMessage::user(turn.content.clone()),
        ChatRole::Assistant => ChatMessage::assistant(turn.content.clone()),
    }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DraftResponse {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    draft: String,
}

/// Parse the model's draft output: structured JSON first, then the
/// delimiter shim for models that fenced the draft in `---` instead.
fn parse_draft_response(raw: &str) -> Option<DraftOutcome> {
    let json_str = extract_json_object(raw);
    if let Ok(parsed) = serde_json::from_str::<DraftResponse>(&json_str) {
        if !parsed.draft.trim().is_empty() {
            return Some(DraftOutcome {
                reply: if parsed.reply.trim().is_empty() {
                    "Here's the draft.".to_string()
                } else {
                    parsed.reply.trim().to_string()
                },
                draft: parsed.draft.trim().to_string(),
            });
        }
    }

    // Compatibility shim: a lone `---` fenced block in the raw text.
    let turns = [ChatTurn::assistant(raw)];
    let draft = extract_delimited_draft(&turns)?;
    let reply = strip_delimited_block(raw);
    Some(DraftOutcome {
        reply: if reply.is_empty() {
            "Here's the draft.".to_string()
        } else {
            reply
        },
        draft,
    })
}

/// Scan conversation turns newest-first for the most recent `---` fenced
/// draft block.
///
/// This is the degraded single-pass extraction path: correctness depends on
/// free-text formatting, so it runs only when structured output fails.
pub fn extract_delimited_draft(turns: &[ChatTurn]) -> Option<String> {
    let re = regex::Regex::new(r"(?s)---\s*(.*?)\s*---").expect("static regex");
    for turn in turns.iter().rev() {
        if let Some(captures) = re.captures(&turn.content) {
            let draft = captures.get(1)?.as_str().trim();
            if !draft.is_empty() {
                return Some(draft.to_string());
            }
        }
    }
    None
}

/// Remove the first `---` fenced block, leaving the conversational text.
fn strip_delimited_block(text: &str) -> String {
    let re = regex::Regex::new(r"(?s)---\s*.*?\s*---").expect("static regex");
    re.replace(text, "").trim().to_string()
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}
