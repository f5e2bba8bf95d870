//! libSQL backend — async `ThreadStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is safe for concurrent
//! async use, and mutation ordering per thread is the caller's concern
//! (see `KeyedLocks`).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ChatTurn, EmailThread, NewThread, ReplyHeaders, ThreadStore, ThreadStatus,
};

/// libSQL thread store.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format — fixed-width so string ordering in
/// `ORDER BY created_at` matches chronological ordering.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const THREAD_COLUMNS: &str = "email_id, sender, subject, body, summary, status, \
     conversation_history, draft_response, created_at, updated_at, \
     message_id, email_references, provider_thread_id";

/// Map a libsql row (in `THREAD_COLUMNS` order) to an `EmailThread`.
fn row_to_thread(row: &libsql::Row) -> Result<EmailThread, DatabaseError> {
    let status_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("status column: {e}")))?;
    let history_json: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("conversation column: {e}")))?;
    let created_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("created_at column: {e}")))?;
    let updated_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("updated_at column: {e}")))?;

    let conversation: Vec<ChatTurn> = serde_json::from_str(&history_json)
        .map_err(|e| DatabaseError::Serialization(format!("conversation history: {e}")))?;

    Ok(EmailThread {
        email_id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("email_id column: {e}")))?,
        sender: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("sender column: {e}")))?,
        subject: row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("subject column: {e}")))?,
        body: row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("body column: {e}")))?,
        summary: row
            .get(4)
            .map_err(|e| DatabaseError::Query(format!("summary column: {e}")))?,
        status: ThreadStatus::from_str_lossy(&status_str),
        conversation,
        draft_response: row.get(7).ok(),
        headers: ReplyHeaders {
            message_id: row.get(10).ok(),
            references: row.get(11).ok(),
            provider_thread_id: row.get(12).ok(),
        },
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ThreadStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn create_thread(&self, new: NewThread) -> Result<EmailThread, DatabaseError> {
        let now = fmt_ts(Utc::now());

        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO email_threads
                    (email_id, sender, subject, body, summary, status,
                     conversation_history, draft_response, created_at, updated_at,
                     message_id, email_references, provider_thread_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING_REVIEW', '[]', NULL, ?6, ?6, ?7, ?8, ?9)",
                params![
                    new.email_id.clone(),
                    new.sender,
                    new.subject,
                    new.body,
                    new.summary,
                    now,
                    opt_text(new.headers.message_id.as_deref()),
                    opt_text(new.headers.references.as_deref()),
                    opt_text(new.headers.provider_thread_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert thread: {e}")))?;

        if affected == 0 {
            debug!(email_id = %new.email_id, "Thread already exists, returning existing record");
        }

        self.get_thread(&new.email_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(new.email_id))
    }

    async fn get_thread(&self, email_id: &str) -> Result<Option<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM email_threads WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get thread: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read thread row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_thread(&row)?)),
            None => Ok(None),
        }
    }

    async fn latest_pending(&self) -> Result<Option<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM email_threads
                     WHERE status = 'PENDING_REVIEW'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest pending: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read pending row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_thread(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending_threads(&self) -> Result<Vec<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM email_threads
                     WHERE status = 'PENDING_REVIEW'
                     ORDER BY created_at DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending threads: {e}")))?;

        let mut threads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read pending row: {e}")))?
        {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn append_exchange(
        &self,
        email_id: &str,
        user_msg: &str,
        assistant_msg: &str,
        new_draft: Option<&str>,
    ) -> Result<EmailThread, DatabaseError> {
        let thread = self
            .get_thread(email_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(email_id.to_string()))?;

        let mut conversation = thread.conversation;
        conversation.push(ChatTurn::user(user_msg));
        conversation.push(ChatTurn::assistant(assistant_msg));

        let history_json = serde_json::to_string(&conversation)
            .map_err(|e| DatabaseError::Serialization(format!("conversation history: {e}")))?;

        // History append + draft overwrite commit in one statement; a NULL
        // draft parameter leaves the stored draft untouched.
        self.conn()
            .execute(
                "UPDATE email_threads
                 SET conversation_history = ?1,
                     draft_response = CASE WHEN ?2 IS NULL THEN draft_response ELSE ?2 END,
                     updated_at = ?3
                 WHERE email_id = ?4",
                params![
                    history_json,
                    opt_text(new_draft),
                    fmt_ts(Utc::now()),
                    email_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append exchange: {e}")))?;

        self.get_thread(email_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(email_id.to_string()))
    }

    async fn update_status(
        &self,
        email_id: &str,
        status: ThreadStatus,
    ) -> Result<(), DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Constraint(format!(
                "cannot transition thread {email_id} back to {}",
                status.as_str()
            )));
        }

        // The WHERE clause is the transition guard: only a pending thread
        // can move, so terminal states stay sticky even under races.
        let affected = self
            .conn()
            .execute(
                "UPDATE email_threads
                 SET status = ?1, updated_at = ?2
                 WHERE email_id = ?3 AND status = 'PENDING_REVIEW'",
                params![status.as_str(), fmt_ts(Utc::now()), email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update status: {e}")))?;

        if affected == 0 {
            return match self.get_thread(email_id).await? {
                Some(thread) => Err(DatabaseError::Constraint(format!(
                    "thread {email_id} is already {} — no transition out of a terminal state",
                    thread.status.as_str()
                ))),
                None => Err(DatabaseError::NotFound(email_id.to_string())),
            };
        }

        Ok(())
    }

    async fn finalize_thread(
        &self,
        email_id: &str,
        user_msg: &str,
        assistant_msg: &str,
        status: ThreadStatus,
    ) -> Result<EmailThread, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Constraint(format!(
                "finalize requires a terminal status, got {}",
                status.as_str()
            )));
        }

        let thread = self
            .get_thread(email_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(email_id.to_string()))?;

        let mut conversation = thread.conversation;
        conversation.push(ChatTurn::user(user_msg));
        conversation.push(ChatTurn::assistant(assistant_msg));

        let history_json = serde_json::to_string(&conversation)
            .map_err(|e| DatabaseError::Serialization(format!("conversation history: {e}")))?;

        let affected = self
            .conn()
            .execute(
                "UPDATE email_threads
                 SET conversation_history = ?1, status = ?2, updated_at = ?3
                 WHERE email_id = ?4 AND status = 'PENDING_REVIEW'",
                params![history_json, status.as_str(), fmt_ts(Utc::now()), email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize thread: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::Constraint(format!(
                "thread {email_id} is no longer pending — nothing finalized"
            )));
        }

        self.get_thread(email_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(email_id.to_string()))
    }
}
