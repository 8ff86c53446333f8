use std::{
    collections::{HashMap, HashSet},
    sync::atomic::AtomicUsize,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use crate::telegram::TelegramClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender: String,
    pub content: String,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_message_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub customer_name: String,
    pub customer_mobile: String,
    pub status: String,
    pub created_at: String,
    pub last_message_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub customer_name: String,
    pub customer_mobile: String,
    pub status: String,
    pub created_at: String,
    pub last_message_at: String,
    pub last_message: Option<ChatMessage>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUnread {
    pub session_id: String,
    pub unread: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSnapshot {
    pub total: i64,
    pub sessions: Vec<SessionUnread>,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub consoles: HashSet<usize>,
    pub session_watchers: HashMap<String, HashSet<usize>>,
    pub watched_session: HashMap<usize, String>,
}

pub struct AppState {
    pub db: PgPool,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub telegram: TelegramClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub customer_name: String,
    pub customer_mobile: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub sender: Option<String>,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySendBody {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serializes_camel_case_and_drops_null_correlation() {
        let message = ChatMessage {
            id: "m1".to_string(),
            session_id: "s1".to_string(),
            sender: "customer".to_string(),
            content: "hello".to_string(),
            is_read: false,
            telegram_message_id: None,
            created_at: "2026-08-21T00:00:00+00:00".to_string(),
        };
        let value = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["isRead"], false);
        assert!(value.get("telegramMessageId").is_none());
    }

    #[test]
    fn message_serializes_correlation_id_when_set() {
        let message = ChatMessage {
            id: "m2".to_string(),
            session_id: "s1".to_string(),
            sender: "customer".to_string(),
            content: "hello".to_string(),
            is_read: false,
            telegram_message_id: Some(555),
            created_at: "2026-08-21T00:00:00+00:00".to_string(),
        };
        let value = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(value["telegramMessageId"], 555);
    }

    #[test]
    fn send_body_accepts_missing_sender() {
        let body: SendMessageBody =
            serde_json::from_value(json!({ "content": "hi" })).expect("body should parse");
        assert!(body.sender.is_none());
        assert_eq!(body.content, "hi");
    }

    #[test]
    fn event_envelope_defaults_data_to_null() {
        let envelope: EventEnvelopeIn =
            serde_json::from_str(r#"{"event":"console:join"}"#).expect("envelope should parse");
        assert_eq!(envelope.event, "console:join");
        assert!(envelope.data.is_null());
    }
}
