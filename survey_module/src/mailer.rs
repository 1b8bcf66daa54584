use std::sync::Arc;

use send_emails_module::{PostmarkClient, PostmarkConfig, SendEmailError, SendEmailParams};
use tracing::info;

use crate::retry_executor::{RetryExecutor, RetryHandle};
use crate::survey_store::Survey;

pub type TransportError = SendEmailError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

/// Transmits one formatted message. Implementations block.
pub trait NotificationSender: Send + Sync {
    fn send_message(&self, message: &EmailMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct PostmarkNotificationSender {
    config: PostmarkConfig,
}

impl PostmarkNotificationSender {
    pub fn new(config: PostmarkConfig) -> Self {
        Self { config }
    }
}

impl NotificationSender for PostmarkNotificationSender {
    fn send_message(&self, message: &EmailMessage) -> Result<(), TransportError> {
        // The blocking client owns a runtime; build it on the worker thread.
        let client = PostmarkClient::new(self.config.clone())?;
        let response = client.send(&SendEmailParams {
            subject: message.subject.clone(),
            text_body: message.body_text.clone(),
            html_body: message.body_html.clone(),
            from: None,
            to: message.recipients.clone(),
            reply_to: None,
        })?;
        info!(
            "postmark accepted message {} for {}",
            response.message_id, response.to
        );
        Ok(())
    }
}

/// Hands outbound email to the retry executor.
#[derive(Clone)]
pub struct EmailDispatcher {
    executor: RetryExecutor,
    sender: Arc<dyn NotificationSender>,
}

impl EmailDispatcher {
    pub fn new(executor: RetryExecutor, sender: Arc<dyn NotificationSender>) -> Self {
        Self { executor, sender }
    }

    pub fn submit_email(
        &self,
        subject: impl Into<String>,
        recipients: Vec<String>,
        body: impl Into<String>,
        html: Option<String>,
    ) -> RetryHandle {
        let message = EmailMessage {
            recipients,
            subject: subject.into(),
            body_text: body.into(),
            body_html: html,
        };
        let label = format!(
            "email '{}' to {} recipient(s)",
            message.subject,
            message.recipients.len()
        );
        let sender = self.sender.clone();
        self.executor
            .submit(label, move |_attempt| sender.send_message(&message))
    }

    pub fn submit_invitation(
        &self,
        survey: &Survey,
        recipients: Vec<String>,
        survey_link: &str,
    ) -> RetryHandle {
        let invitation = invitation_message(survey, survey_link);
        self.submit_email(
            invitation.subject,
            recipients,
            invitation.body_text,
            invitation.body_html,
        )
    }
}

pub struct Invitation {
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

pub fn survey_link(public_base_url: &str, survey_id: uuid::Uuid) -> String {
    format!(
        "{}/surveys/{}/take",
        public_base_url.trim_end_matches('/'),
        survey_id
    )
}

pub fn invitation_message(survey: &Survey, survey_link: &str) -> Invitation {
    let subject = format!("You're invited: {}", survey.title);
    let mut body_text = format!("You have been invited to take the survey \"{}\".\n", survey.title);
    if !survey.description.trim().is_empty() {
        body_text.push_str(&format!("\n{}\n", survey.description.trim()));
    }
    body_text.push_str(&format!("\nTake the survey: {}\n", survey_link));

    let mut body_html = format!(
        "<p>You have been invited to take the survey <strong>{}</strong>.</p>",
        escape_html(&survey.title)
    );
    if !survey.description.trim().is_empty() {
        body_html.push_str(&format!(
            "<p>{}</p>",
            escape_html(survey.description.trim())
        ));
    }
    body_html.push_str(&format!(
        "<p><a href=\"{0}\">{0}</a></p>",
        escape_html(survey_link)
    ));

    Invitation {
        subject,
        body_text,
        body_html: Some(body_html),
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
