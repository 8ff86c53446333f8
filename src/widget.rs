use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::fs;
use tracing::warn;

use crate::{
    app::{add_message, create_session, get_session_db, relay_outbound},
    error::ChatError,
    types::{AppState, ChatMessage, Session},
};

/// Key under which the widget remembers its session id between visits.
pub const SESSION_STORAGE_KEY: &str = "chatSessionId";

pub fn validate_identity(name: &str, mobile: &str) -> Result<(), ChatError> {
    if name.trim().is_empty() || mobile.trim().is_empty() {
        return Err(ChatError::Validation("name and mobile are required"));
    }
    if mobile.trim().len() < 10 {
        return Err(ChatError::Validation("Please enter a valid mobile number"));
    }
    Ok(())
}

/// A cached session id is only honored while the referenced session still
/// carries both identity fields. `Ok(None)` means the id is stale and should
/// be discarded; `Err` means the store could not be asked.
pub async fn verify_resumable_session(
    state: &Arc<AppState>,
    session_id: &str,
) -> Result<Option<Session>, ChatError> {
    let Some(session) = get_session_db(&state.db, session_id).await? else {
        return Ok(None);
    };
    if session.customer_name.trim().is_empty() || session.customer_mobile.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(session))
}

/// One JSON object in a file; read/write/clear and nothing else.
pub struct SessionCache {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl SessionCache {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<HashMap<String, String>>(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self { path, entries }
    }

    pub fn read(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    pub async fn write(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
        self.persist().await;
    }

    pub async fn clear(&mut self, key: &str) {
        self.entries.remove(key);
        self.persist().await;
    }

    async fn persist(&self) {
        let Ok(raw) = serde_json::to_string(&self.entries) else {
            return;
        };
        if let Err(err) = fs::write(&self.path, raw).await {
            warn!(path = %self.path.display(), error = %err, "failed to persist widget cache");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetState {
    CollectingIdentity,
    ActiveChat { session_id: String },
}

/// Headless driver for the visitor side of a conversation. It goes through
/// the same operations the HTTP surface exposes; the cache is its only
/// private state.
pub struct ChatWidget {
    app: Arc<AppState>,
    cache: SessionCache,
    state: WidgetState,
}

impl ChatWidget {
    /// Restore from the cache. A stale id is dropped; a store outage leaves
    /// the id in place so a later visit can retry.
    pub async fn load(app: Arc<AppState>, mut cache: SessionCache) -> Self {
        let state = match cache.read(SESSION_STORAGE_KEY) {
            Some(session_id) => match verify_resumable_session(&app, &session_id).await {
                Ok(Some(_)) => WidgetState::ActiveChat { session_id },
                Ok(None) => {
                    cache.clear(SESSION_STORAGE_KEY).await;
                    WidgetState::CollectingIdentity
                }
                Err(err) => {
                    warn!(error = %err, "could not verify cached session");
                    WidgetState::CollectingIdentity
                }
            },
            None => WidgetState::CollectingIdentity,
        };
        Self { app, cache, state }
    }

    pub fn state(&self) -> &WidgetState {
        &self.state
    }

    pub async fn submit_identity(&mut self, name: &str, mobile: &str) -> Result<String, ChatError> {
        validate_identity(name, mobile)?;

        if let WidgetState::ActiveChat { session_id } = &self.state {
            return Ok(session_id.clone());
        }

        if let Some(cached) = self.cache.read(SESSION_STORAGE_KEY) {
            if let Ok(Some(_)) = verify_resumable_session(&self.app, &cached).await {
                self.state = WidgetState::ActiveChat {
                    session_id: cached.clone(),
                };
                return Ok(cached);
            }
        }

        let session = create_session(&self.app, name, mobile).await?;
        self.cache.write(SESSION_STORAGE_KEY, &session.id).await;
        self.state = WidgetState::ActiveChat {
            session_id: session.id.clone(),
        };
        Ok(session.id)
    }

    /// Store first, then relay. The message exists once the store confirms
    /// it; a failed relay is logged and the conversation continues.
    pub async fn send_message(&mut self, content: &str) -> Result<ChatMessage, ChatError> {
        let session_id = match &self.state {
            WidgetState::ActiveChat { session_id } => session_id.clone(),
            WidgetState::CollectingIdentity => {
                return Err(ChatError::Validation("identity details are required first"));
            }
        };

        let message = add_message(self.app.clone(), &session_id, "customer", content, false).await?;

        if let Err(err) = relay_outbound(&self.app, &message.id).await {
            warn!(message_id = %message.id, error = %err, "outbound relay failed");
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_cache_path() -> PathBuf {
        std::env::temp_dir().join(format!("widget-cache-{}.json", Uuid::new_v4()))
    }

    #[test]
    fn identity_requires_both_fields() {
        assert!(validate_identity("Asha", "9876543210").is_ok());
        assert!(validate_identity("", "9876543210").is_err());
        assert!(validate_identity("Asha", "   ").is_err());
    }

    #[test]
    fn short_mobile_is_rejected() {
        let err = validate_identity("Asha", "12345").expect_err("should reject");
        assert_eq!(err.to_string(), "Please enter a valid mobile number");
    }

    #[test]
    fn mobile_length_checked_after_trimming() {
        assert!(validate_identity("Asha", "  987654321  ").is_err());
        assert!(validate_identity("Asha", "  9876543210  ").is_ok());
    }

    #[tokio::test]
    async fn cache_round_trips_through_the_file() {
        let path = temp_cache_path();

        let mut cache = SessionCache::open(&path).await;
        assert!(cache.read(SESSION_STORAGE_KEY).is_none());
        cache.write(SESSION_STORAGE_KEY, "sess-1").await;

        let reopened = SessionCache::open(&path).await;
        assert_eq!(reopened.read(SESSION_STORAGE_KEY).as_deref(), Some("sess-1"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn cache_clear_removes_the_entry() {
        let path = temp_cache_path();

        let mut cache = SessionCache::open(&path).await;
        cache.write(SESSION_STORAGE_KEY, "sess-2").await;
        cache.clear(SESSION_STORAGE_KEY).await;
        assert!(cache.read(SESSION_STORAGE_KEY).is_none());

        let reopened = SessionCache::open(&path).await;
        assert!(reopened.read(SESSION_STORAGE_KEY).is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn cache_tolerates_a_corrupt_file() {
        let path = temp_cache_path();
        tokio::fs::write(&path, "not json").await.expect("write should succeed");

        let cache = SessionCache::open(&path).await;
        assert!(cache.read(SESSION_STORAGE_KEY).is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
