//! Inbound chat webhook + liveness routes.
//!
//! The messaging provider posts form-encoded `Body`/`From` pairs here. The
//! HTTP response is always an immediate acknowledgment; the conversational
//! reply travels back through the messenger on a spawned task, so provider
//! webhook timeouts never race the LLM.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Form, Json, Router as AxumRouter, extract::State};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::channels::Messenger;
use crate::router::{Router, ThreadSelector};

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub messenger: Arc<dyn Messenger>,
}

/// Build the axum router.
pub fn routes(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/webhook/whatsapp", post(inbound_message))
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(state)
}

/// Inbound chat message, as the provider posts it.
#[derive(Debug, Deserialize)]
struct InboundForm {
    #[serde(rename = "Body", default)]
    body: String,
    #[serde(rename = "From", default)]
    from: String,
}

async fn inbound_message(
    State(state): State<AppState>,
    Form(form): Form<InboundForm>,
) -> Json<serde_json::Value> {
    if form.from.is_empty() {
        // Scanners and misconfigured proxies hit this endpoint without a
        // sender; acknowledge and move on.
        warn!("Webhook request with no From address");
        return Json(serde_json::json!({
            "status": "error",
            "message": "Missing From number"
        }));
    }

    info!(from = %form.from, "Webhook message received");

    // The reply is delivered asynchronously through the messenger — the
    // HTTP response is only an acknowledgment.
    tokio::spawn(async move {
        let reply = state
            .router
            .handle_inbound(&form.body, &form.from, ThreadSelector::MostRecentPending)
            .await;

        if let Err(e) = state.messenger.send_text(&form.from, &reply).await {
            error!(to = %form.from, error = %e, "Failed to deliver router reply");
        }
    });

    Json(serde_json::json!({ "status": "ok" }))
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "mail-triage is running" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{InboundEmail, MailProvider, OutboundReply};
    use crate::error::{ChannelError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::router::{DraftEngine, IntentClassifier};
    use crate::store::{KeyedLocks, LibSqlBackend};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct NullLlm;

    #[async_trait]
    impl LlmProvider for NullLlm {
        fn model_name(&self) -> &str {
            "null"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::InvalidResponse {
                provider: "null".into(),
                reason: "not scripted".into(),
            })
        }
    }

    struct NullMail;

    #[async_trait]
    impl MailProvider for NullMail {
        async fn list_unread(&self) -> Result<Vec<String>, ChannelError> {
            Ok(vec![])
        }
        async fn fetch(&self, _id: &str) -> Result<InboundEmail, ChannelError> {
            unimplemented!()
        }
        async fn send_reply(&self, _reply: &OutboundReply) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn mark_read(&self, _id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((to.into(), body.into()));
            Ok(())
        }
        async fn send_template(
            &self,
            _to: &str,
            _template_ref: &str,
            _vars: &[String],
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    async fn test_state() -> (AppState, Arc<RecordingMessenger>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let llm: Arc<dyn LlmProvider> = Arc::new(NullLlm);
        let timeout = Duration::from_secs(1);
        let router = Arc::new(Router::new(
            store,
            Arc::new(NullMail),
            IntentClassifier::new(llm.clone(), timeout),
            DraftEngine::new(llm, timeout),
            Arc::new(KeyedLocks::new()),
        ));
        let messenger = Arc::new(RecordingMessenger::default());
        (
            AppState {
                router,
                messenger: messenger.clone(),
            },
            messenger,
        )
    }

    fn form_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook/whatsapp")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn webhook_acks_and_delivers_reply_via_messenger() {
        let (state, messenger) = test_state().await;
        let app = routes(state);

        let response = app
            .oneshot(form_request("Body=send+it&From=whatsapp%3A%2B15551234567"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");

        // The conversational reply arrives asynchronously.
        let mut delivered = Vec::new();
        for _ in 0..50 {
            delivered = messenger.sent.lock().unwrap().clone();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "whatsapp:+15551234567");
        // No threads exist, so the reply is the fixed nothing-pending text.
        assert_eq!(delivered[0].1, crate::router::engine::NOTHING_PENDING_MSG);
    }

    #[tokio::test]
    async fn webhook_rejects_missing_from_with_error_ack() {
        let (state, messenger) = test_state().await;
        let app = routes(state);

        let response = app.oneshot(form_request("Body=hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn liveness_routes_respond() {
        let (state, _) = test_state().await;
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
