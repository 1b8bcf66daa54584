//! Outbound email through the Postmark HTTP API.
//!
//! The client is blocking; call it from worker threads, never from inside an
//! async runtime.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_POSTMARK_API_BASE_URL: &str = "https://api.postmarkapp.com";
const POSTMARK_MESSAGE_STREAM: &str = "outbound";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct SendEmailParams {
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendEmailResponse {
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "SubmittedAt", default)]
    pub submitted_at: String,
    #[serde(rename = "MessageID", default)]
    pub message_id: String,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: i64,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("POSTMARK_SERVER_TOKEN not set")]
    MissingToken,
    #[error("sender address missing (set POSTMARK_FROM)")]
    MissingFrom,
    #[error("no recipients")]
    NoRecipients,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("postmark rejected message (status {status}, code {error_code}): {message}")]
    Rejected {
        status: u16,
        error_code: i64,
        message: String,
    },
}

#[derive(Debug, Serialize)]
struct PostmarkPayload<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "TextBody")]
    text_body: &'a str,
    #[serde(rename = "HtmlBody", skip_serializing_if = "Option::is_none")]
    html_body: Option<&'a str>,
    #[serde(rename = "ReplyTo", skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(rename = "MessageStream")]
    message_stream: &'a str,
}

#[derive(Debug, Clone)]
pub struct PostmarkConfig {
    pub api_base_url: String,
    pub server_token: String,
    pub default_from: Option<String>,
}

impl PostmarkConfig {
    /// Reads the transport settings. Both the server token and the sender
    /// address are required; a token alone cannot deliver anything.
    pub fn from_env() -> Result<Self, SendEmailError> {
        dotenvy::dotenv().ok();
        let server_token =
            non_empty_env("POSTMARK_SERVER_TOKEN").ok_or(SendEmailError::MissingToken)?;
        let default_from = non_empty_env("POSTMARK_FROM").ok_or(SendEmailError::MissingFrom)?;
        let api_base_url = non_empty_env("POSTMARK_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_POSTMARK_API_BASE_URL.to_string());
        Ok(Self {
            api_base_url,
            server_token,
            default_from: Some(default_from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostmarkClient {
    config: PostmarkConfig,
    http: reqwest::blocking::Client,
}

impl PostmarkClient {
    pub fn new(config: PostmarkConfig) -> Result<Self, SendEmailError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn send(&self, params: &SendEmailParams) -> Result<SendEmailResponse, SendEmailError> {
        let to = params
            .to
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>();
        if to.is_empty() {
            return Err(SendEmailError::NoRecipients);
        }
        let from = params
            .from
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or(self.config.default_from.as_deref())
            .ok_or(SendEmailError::MissingFrom)?;

        let payload = PostmarkPayload {
            from,
            to: to.join(", "),
            subject: params.subject.as_str(),
            text_body: params.text_body.as_str(),
            html_body: params.html_body.as_deref(),
            reply_to: params.reply_to.as_deref(),
            message_stream: POSTMARK_MESSAGE_STREAM,
        };

        let url = format!("{}/email", self.config.api_base_url.trim_end_matches('/'));
        debug!("postmark send to {} recipient(s)", to.len());
        let response = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", &self.config.server_token)
            .json(&payload)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        let parsed = serde_json::from_str::<SendEmailResponse>(&body).ok();
        match parsed {
            Some(parsed) if status.is_success() && parsed.error_code == 0 => Ok(parsed),
            Some(parsed) => Err(SendEmailError::Rejected {
                status: status.as_u16(),
                error_code: parsed.error_code,
                message: parsed.message,
            }),
            None => Err(SendEmailError::Rejected {
                status: status.as_u16(),
                error_code: -1,
                message: body,
            }),
        }
    }
}

/// Splits a comma or semicolon separated recipient list, dropping blanks.
pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
