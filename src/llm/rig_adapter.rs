//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, MessageRole,
};
use crate::llm::retry;

/// Adapter wrapping a rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's shape: system messages join into
/// the preamble, the trailing user message becomes the prompt, everything
/// between is chat history.
fn split_messages(
    messages: &[ChatMessage],
) -> Result<(Option<String>, Vec<ChatMessage>, String), LlmError> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut chat: Vec<ChatMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            MessageRole::System => system_parts.push(&msg.content),
            _ => chat.push(msg.clone()),
        }
    }

    let prompt = match chat.pop() {
        Some(msg) if msg.role == MessageRole::User => msg.content,
        Some(msg) => {
            // Trailing assistant turn — fold it back and prompt to continue.
            chat.push(msg);
            "Continue.".to_string()
        }
        None => {
            return Err(LlmError::InvalidResponse {
                provider: "rig".into(),
                reason: "completion request had no user message".into(),
            });
        }
    };

    let preamble = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    Ok((preamble, chat, prompt))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        retry::with_backoff(&self.model_name, || {
            let request = request.clone();
            async move { self.complete_once(request).await }
        })
        .await
    }
}

impl<M> RigAdapter<M>
where
    M: CompletionModel,
{
    async fn complete_once(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(&request.messages)?;

        let mut builder = self.model.completion_request(Message::user(prompt));

        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }

        for msg in history {
            let message = match msg.role {
                MessageRole::User => Message::user(msg.content),
                MessageRole::Assistant => Message::assistant(msg.content),
                MessageRole::System => continue,
            };
            builder = builder.message(message);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .into_iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "model returned no text content".into(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
        })
    }
}
