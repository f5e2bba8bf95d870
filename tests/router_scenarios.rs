//! End-to-end scenarios: ingestion → conversation → send/dismiss, against
//! an in-memory store with scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mail_triage::channels::{InboundEmail, MailProvider, Messenger, OutboundReply};
use mail_triage::error::{ChannelError, LlmError};
use mail_triage::ingest::{self, IngestConfig, IngestDeps};
use mail_triage::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use mail_triage::router::engine::{NO_DRAFT_MSG, NOTHING_PENDING_MSG};
use mail_triage::router::{DraftEngine, Intent, IntentClassifier, Router, ThreadSelector};
use mail_triage::store::{KeyedLocks, LibSqlBackend, ReplyHeaders, ThreadStatus, ThreadStore};

const SUPERVISOR: &str = "whatsapp:+15550001111";

// ── Scripted collaborators ──────────────────────────────────────────

/// LLM that replays a fixed script of responses.
struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, ()>>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Result<String, ()>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("LLM script exhausted");
        match next {
            Ok(content) => Ok(CompletionResponse {
                content,
                input_tokens: 10,
                output_tokens: 10,
            }),
            Err(()) => Err(LlmError::InvalidResponse {
                provider: "scripted".into(),
                reason: "scripted failure".into(),
            }),
        }
    }
}

/// Mailbox mock: a fixed set of messages, an unread flag per message, and
/// recordings of every send and mark-read.
#[derive(Default)]
struct ScenarioMail {
    messages: Mutex<HashMap<String, InboundEmail>>,
    unread: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundReply>>,
    marked_read: Mutex<Vec<String>>,
    fail_send: AtomicBool,
    fail_mark_read: AtomicBool,
    send_calls: AtomicUsize,
}

impl ScenarioMail {
    fn with_message(id: &str, sender: &str, subject: &str, body: &str) -> Arc<Self> {
        let mail = Self::default();
        mail.messages.lock().unwrap().insert(
            id.to_string(),
            InboundEmail {
                id: id.to_string(),
                sender: sender.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                headers: ReplyHeaders {
                    message_id: Some(format!("<{id}@example.com>")),
                    references: None,
                    provider_thread_id: Some(format!("thr-{id}")),
                },
            },
        );
        mail.unread.lock().unwrap().push(id.to_string());
        Arc::new(mail)
    }
}

#[async_trait]
impl MailProvider for ScenarioMail {
    async fn list_unread(&self) -> Result<Vec<String>, ChannelError> {
        Ok(self.unread.lock().unwrap().clone())
    }

    async fn fetch(&self, id: &str) -> Result<InboundEmail, ChannelError> {
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ChannelError::FetchFailed {
                name: "mail".into(),
                reason: format!("no such message {id}"),
            })
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), ChannelError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "mail".into(),
                reason: "smtp relay refused".into(),
            });
        }
        self.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }

    async fn mark_read(&self, id: &str) -> Result<(), ChannelError> {
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(ChannelError::FetchFailed {
                name: "mail".into(),
                reason: "imap store failed".into(),
            });
        }
        self.unread.lock().unwrap().retain(|u| u != id);
        self.marked_read.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Messenger mock recording texts and template sends.
#[derive(Default)]
struct ScenarioMessenger {
    texts: Mutex<Vec<(String, String)>>,
    templates: Mutex<Vec<(String, String, Vec<String>)>>,
    fail_template: AtomicBool,
}

#[async_trait]
impl Messenger for ScenarioMessenger {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        self.texts
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn send_template(
        &self,
        to: &str,
        template_ref: &str,
        vars: &[String],
    ) -> Result<(), ChannelError> {
        if self.fail_template.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: "template rejected".into(),
            });
        }
        self.templates
            .lock()
            .unwrap()
            .push((to.to_string(), template_ref.to_string(), vars.to_vec()));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<LibSqlBackend>,
    mail: Arc<ScenarioMail>,
    messenger: Arc<ScenarioMessenger>,
    router: Router,
    deps: IngestDeps,
}

async fn harness(mail: Arc<ScenarioMail>, llm: Arc<ScriptedLlm>) -> Harness {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let messenger = Arc::new(ScenarioMessenger::default());
    let locks = Arc::new(KeyedLocks::new());
    let timeout = Duration::from_secs(5);

    let router = Router::new(
        store.clone(),
        mail.clone(),
        IntentClassifier::new(llm.clone(), timeout),
        DraftEngine::new(llm.clone(), timeout),
        locks.clone(),
    );

    let deps = IngestDeps {
        store: store.clone(),
        mail: mail.clone(),
        messenger: messenger.clone(),
        drafter: DraftEngine::new(llm, timeout),
        locks,
    };

    Harness {
        store,
        mail,
        messenger,
        router,
        deps,
    }
}

fn ingest_config() -> IngestConfig {
    IngestConfig {
        supervisor: SUPERVISOR.to_string(),
        template_sid: None,
        poll_interval: Duration::from_secs(60),
    }
}

// ── Scenario A: nothing pending ─────────────────────────────────────

#[tokio::test]
async fn scenario_a_send_with_nothing_pending() {
    let h = harness(Arc::new(ScenarioMail::default()), ScriptedLlm::new(vec![])).await;

    let out = h
        .router
        .handle_inbound("send it", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;

    assert_eq!(out, NOTHING_PENDING_MSG);
    assert!(h.store.pending_threads().await.unwrap().is_empty());
}

// ── Scenario B: ingest → draft → send ───────────────────────────────

#[tokio::test]
async fn scenario_b_ingest_draft_send() {
    let mail = ScenarioMail::with_message(
        "m1",
        "john@company.com",
        "Q1 planning",
        "Can we meet Thursday 2pm?",
    );
    let llm = ScriptedLlm::new(vec![
        // ingestion: summarize
        Ok("John wants a Q1 planning meeting Thursday 2pm.".into()),
        // "draft a reply": classify, then generate
        Ok("DRAFT_REQUEST".into()),
        Ok(r#"{"reply": "Drafted an acceptance.", "draft": "Thursday 2pm works for me."}"#.into()),
        // "send it": classify
        Ok("SEND_COMMAND".into()),
    ]);
    let h = harness(mail, llm).await;

    // Ingestion creates the thread and notifies the supervisor.
    ingest::poll_once(&h.deps, &ingest_config()).await;

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::PendingReview);
    assert!(thread.draft_response.is_none());
    assert_eq!(thread.summary, "John wants a Q1 planning meeting Thursday 2pm.");

    let texts = h.messenger.texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].0, SUPERVISOR);
    assert!(texts[0].1.contains("Q1 planning"));

    // The source message was marked read only after create + notify.
    assert_eq!(h.mail.marked_read.lock().unwrap().clone(), vec!["m1"]);

    // Draft.
    let out = h
        .router
        .handle_inbound("draft a reply", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert!(out.contains("Thursday 2pm works for me."));

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.conversation.len(), 2);
    assert_eq!(
        thread.draft_response.as_deref(),
        Some("Thursday 2pm works for me.")
    );

    // Send.
    let out = h
        .router
        .handle_inbound("send it", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert!(out.contains("Sent!"));

    let sent = h.mail.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "john@company.com");
    assert_eq!(sent[0].subject, "Re: Q1 planning");
    assert_eq!(sent[0].body, "Thursday 2pm works for me.");
    assert_eq!(sent[0].headers.message_id.as_deref(), Some("<m1@example.com>"));
    assert_eq!(sent[0].headers.provider_thread_id.as_deref(), Some("thr-m1"));

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::Sent);
}

// ── Scenario C: dismiss with failing mark-read ──────────────────────

#[tokio::test]
async fn scenario_c_no_response_survives_mark_read_failure() {
    let mail = ScenarioMail::with_message("m1", "spam@list.com", "Newsletter", "Buy now!");
    let llm = ScriptedLlm::new(vec![
        Ok("Marketing newsletter, no action needed.".into()),
        Ok("NO_RESPONSE".into()),
    ]);
    let h = harness(mail, llm).await;

    ingest::poll_once(&h.deps, &ingest_config()).await;
    h.mail.fail_mark_read.store(true, Ordering::SeqCst);

    let out = h
        .router
        .handle_inbound("ignore this", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;

    // Status committed and success reported despite the mark-read failure.
    assert!(out.contains("Archived"));
    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::NoResponse);
    assert_eq!(thread.conversation.len(), 2);
}

// ── Scenario D: send failure keeps the thread retryable ─────────────

#[tokio::test]
async fn scenario_d_send_failure_is_retryable() {
    let mail = ScenarioMail::with_message("m1", "alice@x.com", "Figures", "Numbers please");
    let llm = ScriptedLlm::new(vec![
        Ok("Alice wants the figures.".into()),
        Ok("DRAFT_REQUEST".into()),
        Ok(r#"{"reply": "Done.", "draft": "Attached."}"#.into()),
        Ok("SEND_COMMAND".into()),
        Ok("SEND_COMMAND".into()),
    ]);
    let h = harness(mail, llm).await;

    ingest::poll_once(&h.deps, &ingest_config()).await;
    h.router
        .handle_inbound("draft a reply", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;

    h.mail.fail_send.store(true, Ordering::SeqCst);
    let out = h
        .router
        .handle_inbound("send it", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert!(out.contains("hit an error"));

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::PendingReview);

    // No "already sent" guard blocks the retry.
    h.mail.fail_send.store(false, Ordering::SeqCst);
    let out = h
        .router
        .handle_inbound("send it", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert!(out.contains("Sent!"));
    assert_eq!(h.mail.send_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.store.get_thread("m1").await.unwrap().unwrap().status,
        ThreadStatus::Sent
    );
}

// ── Ingestion idempotency ───────────────────────────────────────────

#[tokio::test]
async fn ingesting_same_message_twice_creates_one_thread() {
    let mail = ScenarioMail::with_message("m1", "a@x.com", "Hi", "Hello");
    // Mark-read fails on the first cycle, so the message stays unread and
    // gets listed again — the duplicate-prone external event.
    let llm = ScriptedLlm::new(vec![Ok("Greeting from a.".into())]);
    let h = harness(mail, llm).await;

    h.mail.fail_mark_read.store(true, Ordering::SeqCst);
    ingest::poll_once(&h.deps, &ingest_config()).await;

    h.mail.fail_mark_read.store(false, Ordering::SeqCst);
    ingest::poll_once(&h.deps, &ingest_config()).await;

    // Exactly one thread; the summary LLM ran once (script has one entry).
    assert_eq!(h.store.pending_threads().await.unwrap().len(), 1);

    // The second cycle re-notified (duplicate notification, never a silent
    // drop) and finally marked the source read.
    assert_eq!(h.messenger.texts.lock().unwrap().len(), 2);
    assert_eq!(h.mail.marked_read.lock().unwrap().clone(), vec!["m1"]);
}

// ── Template notification with fallback ─────────────────────────────

#[tokio::test]
async fn notification_uses_template_when_configured() {
    let mail = ScenarioMail::with_message(
        "m1",
        "John Smith <john@company.com>",
        "Budget",
        "Budget question",
    );
    let llm = ScriptedLlm::new(vec![Ok("John asks about the budget.".into())]);
    let h = harness(mail, llm).await;

    let config = IngestConfig {
        template_sid: Some("HX123".into()),
        ..ingest_config()
    };
    ingest::poll_once(&h.deps, &config).await;

    let templates = h.messenger.templates.lock().unwrap().clone();
    assert_eq!(templates.len(), 1);
    let (to, sid, vars) = &templates[0];
    assert_eq!(to, SUPERVISOR);
    assert_eq!(sid, "HX123");
    // Sanitized positional vars: display name only, then subject, then summary.
    assert_eq!(vars[0], "John Smith");
    assert_eq!(vars[1], "Budget");
    assert_eq!(vars[2], "John asks about the budget.");

    assert!(h.messenger.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn notification_falls_back_to_text_when_template_fails() {
    let mail = ScenarioMail::with_message("m1", "a@x.com", "Hi", "Hello");
    let llm = ScriptedLlm::new(vec![Ok("A greeting.".into())]);
    let h = harness(mail, llm).await;
    h.messenger.fail_template.store(true, Ordering::SeqCst);

    let config = IngestConfig {
        template_sid: Some("HX123".into()),
        ..ingest_config()
    };
    ingest::poll_once(&h.deps, &config).await;

    // Fallback text went out and the pipeline completed.
    assert_eq!(h.messenger.texts.lock().unwrap().len(), 1);
    assert_eq!(h.store.pending_threads().await.unwrap().len(), 1);
    assert_eq!(h.mail.marked_read.lock().unwrap().clone(), vec!["m1"]);
}

// ── Draft overwrite ─────────────────────────────────────────────────

#[tokio::test]
async fn consecutive_refinements_keep_one_draft() {
    let mail = ScenarioMail::with_message("m1", "a@x.com", "Plan", "Thoughts?");
    let llm = ScriptedLlm::new(vec![
        Ok("Asks for thoughts on the plan.".into()),
        Ok("DRAFT_REQUEST".into()),
        Ok(r#"{"reply": "First pass.", "draft": "Draft one."}"#.into()),
        Ok("REFINEMENT".into()),
        Ok(r#"{"reply": "Softened it.", "draft": "Draft two."}"#.into()),
        Ok("REFINEMENT".into()),
        Ok(r#"{"reply": "Shorter now.", "draft": "Draft three."}"#.into()),
    ]);
    let h = harness(mail, llm).await;

    ingest::poll_once(&h.deps, &ingest_config()).await;

    for (instruction, expected_len) in [
        ("draft a reply", 2usize),
        ("make it friendlier", 4),
        ("shorter", 6),
    ] {
        h.router
            .handle_inbound(instruction, SUPERVISOR, ThreadSelector::MostRecentPending)
            .await;
        let thread = h.store.get_thread("m1").await.unwrap().unwrap();
        assert_eq!(thread.conversation.len(), expected_len);
    }

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    // Exactly one draft value survives: the latest.
    assert_eq!(thread.draft_response.as_deref(), Some("Draft three."));
}

// ── Send precondition ───────────────────────────────────────────────

#[tokio::test]
async fn send_without_draft_never_touches_mail_or_status() {
    let mail = ScenarioMail::with_message("m1", "a@x.com", "Hi", "Hello");
    let llm = ScriptedLlm::new(vec![
        Ok("A greeting.".into()),
        Ok("SEND_COMMAND".into()),
    ]);
    let h = harness(mail, llm).await;

    ingest::poll_once(&h.deps, &ingest_config()).await;

    let out = h
        .router
        .handle_inbound("send it", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert_eq!(out, NO_DRAFT_MSG);

    assert_eq!(h.mail.send_calls.load(Ordering::SeqCst), 0);
    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::PendingReview);
}

// ── Classifier totality ─────────────────────────────────────────────

#[test]
fn classifier_output_always_maps_into_intent_set() {
    let inputs = [
        "SEND_COMMAND",
        "no_response",
        "Question?",
        "DRAFT_REQUEST please",
        "REFINEMENT",
        "FORWARD",
        "",
        "🤷",
        "The user appears to want a summary of the thread",
    ];
    for raw in inputs {
        let intent = Intent::from_raw(raw);
        assert!(matches!(
            intent,
            Intent::SendCommand
                | Intent::NoResponse
                | Intent::Question
                | Intent::DraftRequest
                | Intent::Refinement
        ));
    }
}

// ── Question handling keeps the draft intact ────────────────────────

#[tokio::test]
async fn questions_append_history_without_touching_draft() {
    let mail = ScenarioMail::with_message("m1", "a@x.com", "Plan", "Thoughts?");
    let llm = ScriptedLlm::new(vec![
        Ok("Asks for thoughts.".into()),
        Ok("DRAFT_REQUEST".into()),
        Ok(r#"{"reply": "Done.", "draft": "The draft."}"#.into()),
        Ok("QUESTION".into()),
        Ok("It's from a@x.com asking for your thoughts.".into()),
    ]);
    let h = harness(mail, llm).await;

    ingest::poll_once(&h.deps, &ingest_config()).await;
    h.router
        .handle_inbound("draft a reply", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;

    let out = h
        .router
        .handle_inbound("who sent this?", SUPERVISOR, ThreadSelector::MostRecentPending)
        .await;
    assert!(out.contains("a@x.com"));

    let thread = h.store.get_thread("m1").await.unwrap().unwrap();
    assert_eq!(thread.conversation.len(), 4);
    assert_eq!(thread.draft_response.as_deref(), Some("The draft."));
    assert_eq!(thread.status, ThreadStatus::PendingReview);
}
