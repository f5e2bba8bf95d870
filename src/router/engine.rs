//! The conversation router — the thread-lifecycle state machine.
//!
//! One inbound supervisor message in, exactly one outbound message out.
//! The router resolves the target thread through an explicit selector,
//! classifies the message, and dispatches to an intent handler. Each
//! handler's store mutation commits fully or leaves the record untouched;
//! conversation turns are persisted before the outbound reply is handed to
//! the messenger, so a crash after commit loses at most the notification.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channels::email::reply_subject;
use crate::channels::{MailProvider, OutboundReply};
use crate::error::DatabaseError;
use crate::router::classifier::IntentClassifier;
use crate::router::drafter::DraftEngine;
use crate::router::types::{EmailContext, Intent, ThreadSelector};
use crate::store::{EmailThread, KeyedLocks, ThreadStatus, ThreadStore};

/// Fixed reply when no thread is pending review.
pub const NOTHING_PENDING_MSG: &str =
    "No pending emails right now. You're all caught up!";

/// Reply to a send command when no draft exists yet.
pub const NO_DRAFT_MSG: &str =
    "There's no draft for this email yet — ask me to draft a reply first.";

/// Apologetic fallback when question answering fails.
pub const AI_TROUBLE_MSG: &str =
    "Sorry, I'm having trouble thinking right now. Give me a moment and ask again.";

/// Reply when a store write fails mid-handler.
pub const STORE_TROUBLE_MSG: &str =
    "Something went wrong saving our conversation — nothing was changed. Please try again.";

/// Conversation router.
pub struct Router {
    store: Arc<dyn ThreadStore>,
    mail: Arc<dyn MailProvider>,
    classifier: IntentClassifier,
    drafter: DraftEngine,
    locks: Arc<KeyedLocks>,
}

impl Router {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        mail: Arc<dyn MailProvider>,
        classifier: IntentClassifier,
        drafter: DraftEngine,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            store,
            mail,
            classifier,
            drafter,
            locks,
        }
    }

    /// Handle one inbound supervisor message and produce the outbound reply.
    ///
    /// Infallible from the caller's perspective: internal failures surface
    /// as supervisor-facing text, never as silence or an error.
    pub async fn handle_inbound(
        &self,
        raw_text: &str,
        from: &str,
        selector: ThreadSelector,
    ) -> String {
        let text = raw_text.trim();
        info!(from = %from, "Inbound supervisor message");

        let candidate = match self.resolve(&selector).await {
            Ok(Some(thread)) => thread,
            Ok(None) => return NOTHING_PENDING_MSG.to_string(),
            Err(e) => {
                error!(error = %e, "Failed to resolve active thread");
                return STORE_TROUBLE_MSG.to_string();
            }
        };

        // Serialize against the ingestion loop and concurrent inbound
        // messages, then re-read: the thread may have been finalized while
        // we waited for the lock.
        let _guard = self.locks.acquire(&candidate.email_id).await;
        let thread = match self.store.get_thread(&candidate.email_id).await {
            Ok(Some(t)) if t.status == ThreadStatus::PendingReview => t,
            Ok(_) => return NOTHING_PENDING_MSG.to_string(),
            Err(e) => {
                error!(error = %e, "Failed to re-read thread under lock");
                return STORE_TROUBLE_MSG.to_string();
            }
        };

        let ctx = EmailContext::from(&thread);
        let intent = self
            .classifier
            .classify(text, &ctx, thread.draft_response.is_some())
            .await;

        info!(
            email_id = %thread.email_id,
            intent = intent.label(),
            "Dispatching supervisor message"
        );

        match intent {
            Intent::SendCommand => self.handle_send(&thread, text).await,
            Intent::NoResponse => self.handle_no_response(&thread, text).await,
            Intent::Question => self.handle_question(&thread, &ctx, text).await,
            Intent::DraftRequest | Intent::Refinement => {
                self.handle_draft(&thread, &ctx, text).await
            }
        }
    }

    /// Pick the thread an inbound message targets.
    async fn resolve(
        &self,
        selector: &ThreadSelector,
    ) -> Result<Option<EmailThread>, DatabaseError> {
        match selector {
            ThreadSelector::MostRecentPending => self.store.latest_pending().await,
            ThreadSelector::ByEmailId(id) => Ok(self
                .store
                .get_thread(id)
                .await?
                .filter(|t| t.status == ThreadStatus::PendingReview)),
        }
    }

    /// SEND_COMMAND: requires a draft; mail-send failure leaves the thread
    /// pending and retryable.
    async fn handle_send(&self, thread: &EmailThread, text: &str) -> String {
        let Some(draft) = thread.draft_response.clone() else {
            return NO_DRAFT_MSG.to_string();
        };

        let reply = OutboundReply {
            to: thread.sender.clone(),
            subject: reply_subject(&thread.subject),
            body: draft,
            headers: thread.headers.clone(),
        };

        if let Err(e) = self.mail.send_reply(&reply).await {
            warn!(email_id = %thread.email_id, error = %e, "Reply send failed");
            return format!(
                "I tried to send it, but hit an error: {e}. \
                 The draft is still here — say \"send it\" to retry."
            );
        }

        // Source bookkeeping only; the reply is already out.
        if let Err(e) = self.mail.mark_read(&thread.email_id).await {
            warn!(email_id = %thread.email_id, error = %e, "Mark-read after send failed");
        }

        let confirmation = format!("Sent! Your reply to {} is on its way.", thread.sender);

        if let Err(e) = self
            .store
            .finalize_thread(&thread.email_id, text, &confirmation, ThreadStatus::Sent)
            .await
        {
            // The email went out; the record commit failed. Report the send
            // but flag the bookkeeping problem.
            error!(email_id = %thread.email_id, error = %e, "Failed to finalize sent thread");
            return format!("{confirmation} (But I had trouble updating my records: {e})");
        }

        confirmation
    }

    /// NO_RESPONSE: archive without replying. Mark-read is attempted after
    /// the commit and is non-fatal.
    async fn handle_no_response(&self, thread: &EmailThread, text: &str) -> String {
        let confirmation = format!(
            "Got it — no reply will be sent to {}. Archived.",
            thread.sender
        );

        if let Err(e) = self
            .store
            .finalize_thread(
                &thread.email_id,
                text,
                &confirmation,
                ThreadStatus::NoResponse,
            )
            .await
        {
            error!(email_id = %thread.email_id, error = %e, "Failed to archive thread");
            return STORE_TROUBLE_MSG.to_string();
        }

        if let Err(e) = self.mail.mark_read(&thread.email_id).await {
            warn!(email_id = %thread.email_id, error = %e, "Mark-read on archive failed");
        }

        confirmation
    }

    /// QUESTION: answer from a short context window; no draft mutation.
    async fn handle_question(&self, thread: &EmailThread, ctx: &EmailContext, text: &str) -> String {
        let answer = match self
            .drafter
            .answer_question(text, ctx, &thread.conversation)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(email_id = %thread.email_id, error = %e, "Question answering failed");
                return AI_TROUBLE_MSG.to_string();
            }
        };

        if let Err(e) = self
            .store
            .append_exchange(&thread.email_id, text, &answer, None)
            .await
        {
            error!(email_id = %thread.email_id, error = %e, "Failed to record Q&A exchange");
            return STORE_TROUBLE_MSG.to_string();
        }

        answer
    }

    /// DRAFT_REQUEST / REFINEMENT: generate or refine the draft from the
    /// full history; draft overwrite + history append commit together.
    async fn handle_draft(&self, thread: &EmailThread, ctx: &EmailContext, text: &str) -> String {
        let outcome = match self
            .drafter
            .draft_reply(text, ctx, &thread.conversation)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(email_id = %thread.email_id, error = %e, "Draft generation failed");
                return format!(
                    "I couldn't put a draft together just now ({e}). Try again in a moment."
                );
            }
        };

        let outbound = format!("{}\n\n---\n{}\n---", outcome.reply, outcome.draft);

        if let Err(e) = self
            .store
            .append_exchange(&thread.email_id, text, &outbound, Some(&outcome.draft))
            .await
        {
            error!(email_id = %thread.email_id, error = %e, "Failed to record draft exchange");
            return STORE_TROUBLE_MSG.to_string();
        }

        outbound
    }
}
