#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use survey_module::mailer::{EmailMessage, NotificationSender, TransportError};
use survey_module::retry_executor::RetryPolicy;
use survey_module::service::{AppState, ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES};
use tower::ServiceExt;

pub fn test_config(root: &Path) -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        runtime_root: root.to_path_buf(),
        survey_db_path: root.join("state").join("survey.db"),
        scheduler_state_path: root.join("state").join("tasks.db"),
        scheduler_poll_interval: Duration::from_millis(50),
        scheduler_max_concurrency: 2,
        scheduler_retry_base_delay: Duration::from_millis(20),
        scheduler_reconcile_interval: Duration::from_millis(50),
        email_retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        public_base_url: "http://surveys.test".to_string(),
        inbound_body_max_bytes: DEFAULT_INBOUND_BODY_MAX_BYTES,
        postmark: None,
    }
}

pub fn test_state(root: &Path, sender: Option<Arc<dyn NotificationSender>>) -> AppState {
    AppState::new(Arc::new(test_config(root)), sender).expect("app state")
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingSender {
    pub fn messages(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl NotificationSender for RecordingSender {
    fn send_message(&self, message: &EmailMessage) -> Result<(), TransportError> {
        self.sent.lock().expect("sent lock").push(message.clone());
        Ok(())
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    send(app, builder.body(body).expect("request")).await
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
