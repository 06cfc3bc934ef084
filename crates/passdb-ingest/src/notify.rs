//! Run notifications
//!
//! Progress messages are best effort: a failed delivery is logged by the
//! caller and never affects ingestion.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Pushover message endpoint
pub const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Default HTTP timeout for a single notification
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Sends messages to a phone through the Pushover API
#[derive(Debug, Clone)]
pub struct PushoverNotifier {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    user: String,
}

impl PushoverNotifier {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: PUSHOVER_API_URL.to_string(),
            token: token.into(),
            user: user.into(),
        })
    }

    /// Post to a different URL instead of the public API
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("token", self.token.as_str()),
                ("user", self.user.as_str()),
                ("message", message),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Writes messages to the log; used when no Pushover credentials are set
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        info!(target: "passdb::notify", "{}", message.replace('\n', " | "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_pushover_posts_form() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/1/messages.json"))
            .and(body_string_contains("token=app-token"))
            .and(body_string_contains("user=user-key"))
            .and(body_string_contains("message=Starting"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":1}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = PushoverNotifier::new("app-token", "user-key")
            .unwrap()
            .with_endpoint(format!("{}/1/messages.json", mock_server.uri()));

        notifier.notify("Starting").await.unwrap();
    }

    #[tokio::test]
    async fn test_pushover_rejection_is_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid token"))
            .mount(&mock_server)
            .await;

        let notifier = PushoverNotifier::new("bad", "user-key")
            .unwrap()
            .with_endpoint(mock_server.uri());

        let err = notifier.notify("hello").await.unwrap_err();
        match err {
            NotifyError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid token");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.notify("line one\nline two").await.is_ok());
    }
}
