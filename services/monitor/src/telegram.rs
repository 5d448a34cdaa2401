//! Telegram Bot API adapter.
//!
//! Implements the notification sink (`sendMessage`) and the long-poll
//! update feed (`getUpdates`) consumed by the command loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Secret;
use crate::notifier::{DeliveryError, NotificationSink};
use crate::subscribers::SubscriberId;

/// Descriptions Telegram returns for chats that will never accept a message.
const UNREACHABLE_MARKERS: &[&str] = &[
    "chat not found",
    "bot was blocked",
    "user is deactivated",
    "bot was kicked",
];

/// Bot API errors outside of message delivery.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("bot API error (status={status}): {description}")]
    Api { status: u16, description: String },
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// One entry of the update feed.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Classify a failed `sendMessage`.
pub fn classify_delivery(status: StatusCode, description: &str) -> DeliveryError {
    let lowered = description.to_lowercase();
    if status == StatusCode::FORBIDDEN || UNREACHABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        DeliveryError::Unreachable(format!("{status}: {description}"))
    } else {
        DeliveryError::Transient(format!("{status}: {description}"))
    }
}

/// Bot API client.
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(api_url: &str, token: &Secret, timeout: Duration) -> Result<Self, TelegramError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelegramError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token.expose()),
        })
    }

    /// Send an HTML message to a chat.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/sendMessage", self.base_url);
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(chat_id, "Message sent");
            return Ok(());
        }

        let description = response
            .json::<ApiResponse<serde_json::Value>>()
            .await
            .ok()
            .and_then(|r| r.description)
            .unwrap_or_default();
        Err(classify_delivery(status, &description))
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        poll_timeout: Duration,
    ) -> Result<Vec<Update>, TelegramError> {
        let url = format!("{}/getUpdates", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", poll_timeout.as_secs().to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(poll_timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| TelegramError::Transport(e.to_string()))?;

        let status = response.status();
        let payload: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| TelegramError::Transport(format!("invalid response: {e}")))?;

        if !status.is_success() || !payload.ok {
            return Err(TelegramError::Api {
                status: status.as_u16(),
                description: payload.description.unwrap_or_default(),
            });
        }

        Ok(payload.result.unwrap_or_default())
    }
}

#[async_trait]
impl NotificationSink for TelegramClient {
    async fn send_to(&self, id: SubscriberId, text: &str) -> Result<(), DeliveryError> {
        self.send_message(id.0, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TelegramClient {
        TelegramClient::new(&server.uri(), &Secret::new("T0KEN"), Duration::from_secs(5)).unwrap()
    }

    #[rstest]
    #[case(403, "Forbidden: bot was blocked by the user", true)]
    #[case(400, "Bad Request: chat not found", true)]
    #[case(403, "", true)]
    #[case(429, "Too Many Requests: retry after 5", false)]
    #[case(400, "Bad Request: can't parse entities", false)]
    #[case(502, "Bad Gateway", false)]
    fn test_classify_delivery(#[case] status: u16, #[case] description: &str, #[case] gone: bool) {
        let status = StatusCode::from_u16(status).unwrap();
        let err = classify_delivery(status, description);
        assert_eq!(matches!(err, DeliveryError::Unreachable(_)), gone);
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT0KEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": 42,
                "text": "<b>hi</b>",
                "parse_mode": "HTML"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true, "result": {"message_id": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .send_to(SubscriberId(42), "<b>hi</b>")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_chat_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT0KEN/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "ok": false, "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let err = client(&server).send_to(SubscriberId(1), "x").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_get_updates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botT0KEN/getUpdates"))
            .and(query_param("offset", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": [
                    {"update_id": 10, "message": {"message_id": 5, "chat": {"id": 7, "type": "private"}, "text": "/start"}},
                    {"update_id": 11}
                ]
            })))
            .mount(&server)
            .await;

        let updates = client(&server)
            .get_updates(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(updates.len(), 2);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 7);
        assert_eq!(message.text.as_deref(), Some("/start"));
        assert!(updates[1].message.is_none());
    }
}
