use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::ChatError;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TelegramSentMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

/// One inbound update, narrowed to what the relay acts on. Parsed once at the
/// webhook boundary; raw payloads never reach the chat store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Irrelevant,
    Reply {
        reply_target_id: i64,
        text: String,
        sender_chat_id: i64,
    },
    NonReply {
        text: String,
        sender_chat_id: i64,
        message_id: i64,
    },
}

pub fn classify_update(update: &TelegramUpdate) -> UpdateKind {
    let Some(message) = update.message.as_ref() else {
        return UpdateKind::Irrelevant;
    };
    let text = message.text.as_deref().unwrap_or("").trim();
    if text.is_empty() {
        return UpdateKind::Irrelevant;
    }
    match message.reply_to_message.as_deref() {
        Some(target) => UpdateKind::Reply {
            reply_target_id: target.message_id,
            text: text.to_string(),
            sender_chat_id: message.chat.id,
        },
        None => UpdateKind::NonReply {
            text: text.to_string(),
            sender_chat_id: message.chat.id,
            message_id: message.message_id,
        },
    }
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    admin_chat_id: i64,
    api_base: String,
}

impl TelegramClient {
    pub fn new(
        token: impl Into<String>,
        admin_chat_id: i64,
        timeout: Duration,
        api_base: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            token: token.into(),
            admin_chat_id,
            api_base: api_base.into(),
        })
    }

    pub fn admin_chat_id(&self) -> i64 {
        self.admin_chat_id
    }

    /// The webhook route embeds the bot token; compare digests rather than the
    /// raw strings.
    pub fn webhook_token_matches(&self, presented: &str) -> bool {
        sha256_hex(presented) == sha256_hex(&self.token)
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, ChatError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(reply_to) = reply_to_message_id {
            payload["reply_to_message_id"] = json!(reply_to);
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Relay(e.to_string()))?;

        let body = response
            .json::<TelegramResponse>()
            .await
            .map_err(|e| ChatError::Relay(e.to_string()))?;

        if !body.ok {
            return Err(ChatError::Relay(
                body.description
                    .unwrap_or_else(|| "request rejected".to_string()),
            ));
        }

        body.result
            .map(|sent| sent.message_id)
            .ok_or_else(|| ChatError::Relay("response missing message_id".to_string()))
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update(raw: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(raw).expect("update should deserialize")
    }

    #[test]
    fn update_without_message_is_irrelevant() {
        let update = update(json!({ "update_id": 1 }));
        assert_eq!(classify_update(&update), UpdateKind::Irrelevant);
    }

    #[test]
    fn update_without_text_is_irrelevant() {
        let update = update(json!({
            "update_id": 2,
            "message": { "message_id": 10, "chat": { "id": 42 } }
        }));
        assert_eq!(classify_update(&update), UpdateKind::Irrelevant);
    }

    #[test]
    fn whitespace_only_text_is_irrelevant() {
        let update = update(json!({
            "update_id": 3,
            "message": { "message_id": 11, "chat": { "id": 42 }, "text": "   " }
        }));
        assert_eq!(classify_update(&update), UpdateKind::Irrelevant);
    }

    #[test]
    fn reply_update_carries_target_and_sender() {
        let update = update(json!({
            "update_id": 4,
            "message": {
                "message_id": 12,
                "chat": { "id": 42 },
                "text": "  Yes, we ship tomorrow  ",
                "reply_to_message": { "message_id": 555, "chat": { "id": 42 } }
            }
        }));
        assert_eq!(
            classify_update(&update),
            UpdateKind::Reply {
                reply_target_id: 555,
                text: "Yes, we ship tomorrow".to_string(),
                sender_chat_id: 42,
            }
        );
    }

    #[test]
    fn non_reply_update_keeps_message_id_for_the_warning() {
        let update = update(json!({
            "update_id": 5,
            "message": { "message_id": 31, "chat": { "id": 42 }, "text": "hello?" }
        }));
        assert_eq!(
            classify_update(&update),
            UpdateKind::NonReply {
                text: "hello?".to_string(),
                sender_chat_id: 42,
                message_id: 31,
            }
        );
    }

    #[test]
    fn webhook_token_comparison() {
        let client = TelegramClient::new("secret-token", 1, Duration::from_secs(5), DEFAULT_API_BASE)
            .expect("client should build");
        assert!(client.webhook_token_matches("secret-token"));
        assert!(!client.webhook_token_matches("secret-token "));
        assert!(!client.webhook_token_matches("other"));
    }

    #[tokio::test]
    async fn send_message_returns_provider_message_id() {
        let server = MockServer::start().await;
        let client = TelegramClient::new("test-token", 42, Duration::from_secs(5), server.uri())
            .expect("client should build");

        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": 42,
                "text": "hello",
                "parse_mode": "Markdown",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "message_id": 555 }
            })))
            .mount(&server)
            .await;

        let sent = client
            .send_message(42, "hello", None)
            .await
            .expect("send should succeed");
        assert_eq!(sent, 555);
    }

    #[tokio::test]
    async fn send_message_includes_reply_target_when_given() {
        let server = MockServer::start().await;
        let client = TelegramClient::new("test-token", 42, Duration::from_secs(5), server.uri())
            .expect("client should build");

        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .and(body_partial_json(json!({ "reply_to_message_id": 31 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "message_id": 556 }
            })))
            .mount(&server)
            .await;

        let sent = client
            .send_message(42, "warning", Some(31))
            .await
            .expect("send should succeed");
        assert_eq!(sent, 556);
    }

    #[tokio::test]
    async fn send_message_surfaces_provider_description() {
        let server = MockServer::start().await;
        let client = TelegramClient::new("test-token", 42, Duration::from_secs(5), server.uri())
            .expect("client should build");

        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let err = client
            .send_message(42, "hello", None)
            .await
            .expect_err("send should fail");
        assert_eq!(err.to_string(), "Telegram Error: Bad Request: chat not found");
    }
}
