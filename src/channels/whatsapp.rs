//! WhatsApp messenger — Twilio REST API over reqwest.
//!
//! `send_text` posts a freeform message; `send_template` posts a
//! business-initiated content template (`ContentSid` + positional
//! `ContentVariables`). Template fallback policy lives with the caller.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::channels::Messenger;
use crate::error::ChannelError;

/// Outbound HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Twilio account configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// The sending WhatsApp number, with or without the `whatsapp:` prefix.
    pub from_number: String,
}

impl TwilioConfig {
    /// Build config from environment variables.
    /// Returns `None` if `TWILIO_ACCOUNT_SID` is not set (messaging disabled).
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID").ok()?;
        let auth_token = SecretString::from(std::env::var("TWILIO_AUTH_TOKEN").unwrap_or_default());
        let from_number = std::env::var("TWILIO_WHATSAPP_FROM").unwrap_or_default();

        Some(Self {
            account_sid,
            auth_token,
            from_number,
        })
    }
}

/// Twilio WhatsApp implementation of [`Messenger`].
pub struct TwilioMessenger {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioMessenger {
    pub fn new(config: TwilioConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn api_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        )
    }

    async fn post_message(&self, form: &[(&str, String)]) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(self.api_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout {
                        name: "whatsapp".into(),
                        secs: REQUEST_TIMEOUT_SECS,
                    }
                } else {
                    ChannelError::SendFailed {
                        name: "whatsapp".into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let detail = body["message"].as_str().unwrap_or("unknown error");
            return Err(ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: format!("Twilio returned {status}: {detail}"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Messenger for TwilioMessenger {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        let form = [
            ("From", normalize_whatsapp(&self.config.from_number)),
            ("To", normalize_whatsapp(to)),
            ("Body", body.to_string()),
        ];
        self.post_message(&form).await?;
        info!(to = %to, "WhatsApp message sent");
        Ok(())
    }

    async fn send_template(
        &self,
        to: &str,
        template_ref: &str,
        vars: &[String],
    ) -> Result<(), ChannelError> {
        let form = [
            ("From", normalize_whatsapp(&self.config.from_number)),
            ("To", normalize_whatsapp(to)),
            ("ContentSid", template_ref.to_string()),
            ("ContentVariables", content_variables(vars)),
        ];
        self.post_message(&form).await?;
        info!(to = %to, template = %template_ref, "WhatsApp template message sent");
        Ok(())
    }
}

/// Ensure an address carries the `whatsapp:` prefix Twilio expects.
pub fn normalize_whatsapp(number: &str) -> String {
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{number}")
    }
}

/// Positional template variables as the JSON object Twilio expects:
/// `{"1": "...", "2": "..."}`.
pub fn content_variables(vars: &[String]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = vars
        .iter()
        .enumerate()
        .map(|(i, v)| ((i + 1).to_string(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::Value::Object(map).to_string()
}
