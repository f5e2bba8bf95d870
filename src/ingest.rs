//! Ingestion loop — watches the mailbox and turns new mail into threads.
//!
//! Each cycle: list unread → per message: dedup against the store →
//! fetch → summarize → create thread → notify the supervisor → mark the
//! source read. Mark-read comes last so a crash mid-sequence can cause at
//! most a duplicate notification, never a message that was read but never
//! surfaced. Cycle failures are logged and retried on the next tick; the
//! loop itself never dies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{MailProvider, Messenger};
use crate::error::Error;
use crate::router::drafter::DraftEngine;
use crate::store::{KeyedLocks, NewThread, ThreadStore};

/// Provider template variable limits — oversized values get a template
/// message rejected outright.
const SENDER_VAR_MAX_CHARS: usize = 30;
const SUBJECT_VAR_MAX_CHARS: usize = 30;
const SUMMARY_VAR_MAX_CHARS: usize = 200;

/// Collaborators the loop needs.
pub struct IngestDeps {
    pub store: Arc<dyn ThreadStore>,
    pub mail: Arc<dyn MailProvider>,
    pub messenger: Arc<dyn Messenger>,
    pub drafter: DraftEngine,
    pub locks: Arc<KeyedLocks>,
}

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// The supervisor's chat address.
    pub supervisor: String,
    /// Optional provider template for business-initiated notifications.
    pub template_sid: Option<String>,
    pub poll_interval: Duration,
}

/// Spawn the background ingestion task.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop
/// polling after the current cycle.
pub fn spawn_ingest_loop(
    deps: IngestDeps,
    config: IngestConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = config.poll_interval.as_secs(),
            "Ingestion loop started"
        );

        let mut tick = tokio::time::interval(config.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Ingestion loop shutting down");
                return;
            }

            poll_once(&deps, &config).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle. Never fails — every error is logged and left
/// for the next cycle to retry.
pub async fn poll_once(deps: &IngestDeps, config: &IngestConfig) {
    let ids = match deps.mail.list_unread().await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to list unread mail");
            return;
        }
    };

    if ids.is_empty() {
        return;
    }

    debug!(count = ids.len(), "Unread mail found");

    for id in &ids {
        if let Err(e) = process_message(deps, config, id).await {
            error!(email_id = %id, error = %e, "Failed to ingest message");
        }
    }
}

/// Ingest one unread message.
async fn process_message(
    deps: &IngestDeps,
    config: &IngestConfig,
    id: &str,
) -> Result<(), Error> {
    // Already a thread? A crash between create, notify, and mark-read
    // leaves the source unread — re-send the notification from the stored
    // summary and try the mark-read again.
    if let Some(existing) = deps.store.get_thread(id).await.map_err(Error::from)? {
        debug!(email_id = %id, "Thread exists for unread message, re-surfacing");
        notify_supervisor(
            deps,
            config,
            &existing.sender,
            &existing.subject,
            &existing.summary,
        )
        .await?;
        if let Err(e) = deps.mail.mark_read(id).await {
            warn!(email_id = %id, error = %e, "Failed to mark re-surfaced message read");
        }
        return Ok(());
    }

    let content = deps.mail.fetch(id).await.map_err(Error::from)?;

    let summary = deps
        .drafter
        .summarize_email(&content.subject, &content.sender, &content.body)
        .await
        .map_err(Error::from)?;

    let _guard = deps.locks.acquire(id).await;
    let thread = deps
        .store
        .create_thread(NewThread {
            email_id: content.id.clone(),
            sender: content.sender.clone(),
            subject: content.subject.clone(),
            body: content.body.clone(),
            summary,
            headers: content.headers.clone(),
        })
        .await
        .map_err(Error::from)?;

    info!(email_id = %id, sender = %thread.sender, "New email thread created");

    // Notify before mark-read: if this fails the message stays unread and
    // the whole sequence reruns next cycle.
    notify_supervisor(deps, config, &thread.sender, &thread.subject, &thread.summary).await?;

    if let Err(e) = deps.mail.mark_read(id).await {
        warn!(email_id = %id, error = %e, "Failed to mark message read after notify");
    }

    Ok(())
}

/// Send the new-mail notification: provider template first (if configured),
/// plain text as fallback.
async fn notify_supervisor(
    deps: &IngestDeps,
    config: &IngestConfig,
    sender: &str,
    subject: &str,
    summary: &str,
) -> Result<(), Error> {
    if let Some(ref sid) = config.template_sid {
        let vars = vec![
            clean_sender(sender),
            clean_subject(subject),
            truncate_chars(summary, SUMMARY_VAR_MAX_CHARS),
        ];
        match deps
            .messenger
            .send_template(&config.supervisor, sid, &vars)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Template notification failed, falling back to text");
            }
        }
    }

    deps.messenger
        .send_text(
            &config.supervisor,
            &notification_text(sender, subject, summary),
        )
        .await
        .map_err(Error::from)
}

/// Plain-text notification body.
fn notification_text(sender: &str, subject: &str, summary: &str) -> String {
    format!(
        "\u{1F4E8} New email from {sender}\nSubject: {subject}\n\n{summary}\n\nReply with instructions."
    )
}

/// Sender display name only, capped — the address part trips template
/// character filters.
fn clean_sender(sender: &str) -> String {
    let name = sender.split('<').next().unwrap_or(sender).trim();
    let name = if name.is_empty() { sender.trim() } else { name };
    truncate_chars(name, SENDER_VAR_MAX_CHARS)
}

/// Subject with newlines flattened, capped.
fn clean_subject(subject: &str) -> String {
    let flat = subject.replace(['\n', '\r'], " ");
    truncate_chars(flat.trim(), SUBJECT_VAR_MAX_CHARS)
}

/// Truncate on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
