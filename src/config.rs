//! Service configuration, built from environment variables.

use secrecy::SecretString;

use crate::channels::{EmailConfig, TwilioConfig};
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default webhook port.
const DEFAULT_PORT: u16 = 8000;

/// Default mailbox poll interval.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default per-call LLM timeout.
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub email: EmailConfig,
    pub twilio: TwilioConfig,
    /// The supervisor's WhatsApp address.
    pub supervisor: String,
    /// Optional provider template for new-mail notifications.
    pub template_sid: Option<String>,
    pub db_path: String,
    pub port: u16,
    pub poll_interval_secs: u64,
    pub llm_timeout_secs: u64,
}

impl AppConfig {
    /// Build the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let supervisor = std::env::var("SUPERVISOR_WHATSAPP")
            .map_err(|_| ConfigError::MissingEnvVar("SUPERVISOR_WHATSAPP".into()))?;

        let email = EmailConfig::from_env()
            .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_IMAP_HOST".into()))?;

        let twilio = TwilioConfig::from_env()
            .ok_or_else(|| ConfigError::MissingEnvVar("TWILIO_ACCOUNT_SID".into()))?;

        let backend_name =
            std::env::var("TRIAGE_LLM_BACKEND").unwrap_or_else(|_| "anthropic".to_string());
        let backend = LlmBackend::from_name(&backend_name).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "TRIAGE_LLM_BACKEND".into(),
                message: format!("unknown backend '{backend_name}'"),
            }
        })?;

        let api_key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = std::env::var(api_key_var)
            .map_err(|_| ConfigError::MissingEnvVar(api_key_var.into()))?;

        let model =
            std::env::var("TRIAGE_MODEL").unwrap_or_else(|_| default_model(backend).to_string());

        let template_sid = std::env::var("WHATSAPP_TEMPLATE_SID")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let db_path = std::env::var("TRIAGE_DB_PATH")
            .unwrap_or_else(|_| "./data/mail-triage.db".to_string());

        let port: u16 = std::env::var("TRIAGE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let poll_interval_secs: u64 = std::env::var("MAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let llm_timeout_secs: u64 = std::env::var("TRIAGE_LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LLM_TIMEOUT_SECS);

        Ok(Self {
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
            email,
            twilio,
            supervisor,
            template_sid,
            db_path,
            port,
            poll_interval_secs,
            llm_timeout_secs,
        })
    }
}

/// Sensible default model per backend.
fn default_model(backend: LlmBackend) -> &'static str {
    match backend {
        LlmBackend::Anthropic => "claude-sonnet-4-20250514",
        LlmBackend::OpenAi => "gpt-4o-mini",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models_per_backend() {
        assert!(default_model(LlmBackend::Anthropic).starts_with("claude"));
        assert!(default_model(LlmBackend::OpenAi).starts_with("gpt"));
    }
}
