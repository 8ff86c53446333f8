use std::{
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::error::ChatError;
use crate::notify::{render_admin_notification, REPLY_WARNING_TEXT};
use crate::telegram::{
    classify_update, TelegramClient, TelegramUpdate, UpdateKind, DEFAULT_API_BASE,
};
use crate::types::*;
use crate::widget::{validate_identity, verify_resumable_session};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }

    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "shopchat".to_string());

    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn session_from_row(row: PgRow) -> Session {
    Session {
        id: row.get("id"),
        customer_name: row.get("customer_name"),
        customer_mobile: row.get("customer_mobile"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
    }
}

fn message_from_row(row: PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        sender: row.get("sender"),
        content: row.get("content"),
        is_read: row.get("is_read"),
        telegram_message_id: row.get("telegram_message_id"),
        created_at: row.get("created_at"),
    }
}

pub async fn create_session(
    state: &Arc<AppState>,
    customer_name: &str,
    customer_mobile: &str,
) -> Result<Session, ChatError> {
    let now = now_iso();
    let session = Session {
        id: Uuid::new_v4().to_string(),
        customer_name: customer_name.trim().to_string(),
        customer_mobile: customer_mobile.trim().to_string(),
        status: "active".to_string(),
        created_at: now.clone(),
        last_message_at: now,
    };

    sqlx::query(
        "INSERT INTO chat_sessions (id, customer_name, customer_mobile, status, created_at, last_message_at) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&session.id)
    .bind(&session.customer_name)
    .bind(&session.customer_mobile)
    .bind(&session.status)
    .bind(&session.created_at)
    .bind(&session.last_message_at)
    .execute(&state.db)
    .await?;

    emit_session_update(state, &session.id).await;
    Ok(session)
}

pub async fn get_session_db(pool: &PgPool, session_id: &str) -> Result<Option<Session>, ChatError> {
    let row = sqlx::query(
        "SELECT id, customer_name, customer_mobile, status, created_at, last_message_at FROM chat_sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(session_from_row))
}

pub async fn get_message_db(
    pool: &PgPool,
    message_id: &str,
) -> Result<Option<ChatMessage>, ChatError> {
    let row = sqlx::query(
        "SELECT id, session_id, sender, content, is_read, telegram_message_id, created_at FROM chat_messages WHERE id = $1",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(message_from_row))
}

pub async fn get_session_messages_db(
    pool: &PgPool,
    session_id: &str,
) -> Result<Vec<ChatMessage>, ChatError> {
    let rows = sqlx::query(
        "SELECT id, session_id, sender, content, is_read, telegram_message_id, created_at FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(message_from_row).collect())
}

pub async fn get_session_summary_db(
    pool: &PgPool,
    session_id: &str,
) -> Result<Option<SessionSummary>, ChatError> {
    let Some(session) = get_session_db(pool, session_id).await? else {
        return Ok(None);
    };

    let unread_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM chat_messages WHERE session_id = $1 AND sender = 'customer' AND is_read = FALSE",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await
    .unwrap_or(0);

    let last_message = sqlx::query(
        "SELECT id, session_id, sender, content, is_read, telegram_message_id, created_at FROM chat_messages WHERE session_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .map(message_from_row);

    Ok(Some(SessionSummary {
        id: session.id,
        customer_name: session.customer_name,
        customer_mobile: session.customer_mobile,
        status: session.status,
        created_at: session.created_at,
        last_message_at: session.last_message_at,
        last_message,
        unread_count,
    }))
}

pub async fn list_session_summaries(pool: &PgPool) -> Result<Vec<SessionSummary>, ChatError> {
    let rows = sqlx::query("SELECT id FROM chat_sessions ORDER BY last_message_at DESC")
        .fetch_all(pool)
        .await?;

    let mut list = Vec::with_capacity(rows.len());
    for row in rows {
        let session_id: String = row.get("id");
        if let Some(summary) = get_session_summary_db(pool, &session_id).await? {
            list.push(summary);
        }
    }
    Ok(list)
}

pub async fn mark_session_read(state: &Arc<AppState>, session_id: &str) -> Result<u64, ChatError> {
    let result = sqlx::query(
        "UPDATE chat_messages SET is_read = TRUE WHERE session_id = $1 AND sender = 'customer' AND is_read = FALSE",
    )
    .bind(session_id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() > 0 {
        emit_session_update(state, session_id).await;
    }
    Ok(result.rows_affected())
}

pub async fn close_session(
    state: &Arc<AppState>,
    session_id: &str,
) -> Result<Option<Session>, ChatError> {
    let row = sqlx::query(
        "UPDATE chat_sessions SET status = 'closed' WHERE id = $1 RETURNING id, customer_name, customer_mobile, status, created_at, last_message_at",
    )
    .bind(session_id)
    .fetch_optional(&state.db)
    .await?;

    let session = row.map(session_from_row);
    if session.is_some() {
        emit_session_update(state, session_id).await;
    }
    Ok(session)
}

pub async fn unread_overview(pool: &PgPool) -> Result<UnreadSnapshot, ChatError> {
    let rows = sqlx::query(
        "SELECT session_id, COUNT(1) AS unread FROM chat_messages WHERE sender = 'customer' AND is_read = FALSE GROUP BY session_id ORDER BY session_id",
    )
    .fetch_all(pool)
    .await?;

    let sessions = rows
        .into_iter()
        .map(|row| SessionUnread {
            session_id: row.get("session_id"),
            unread: row.get::<i64, _>("unread"),
        })
        .collect::<Vec<_>>();
    let total = sessions.iter().map(|s| s.unread).sum();

    Ok(UnreadSnapshot { total, sessions })
}

/// Persist one message and fan it out to everyone looking at the session.
/// Closed sessions still accept customer messages; status gates nothing here.
pub async fn add_message(
    state: Arc<AppState>,
    session_id: &str,
    sender: &str,
    content: &str,
    is_read: bool,
) -> Result<ChatMessage, ChatError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content is required"));
    }

    let mut message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        sender: sender.to_string(),
        content: trimmed.to_string(),
        is_read,
        telegram_message_id: None,
        created_at: now_iso(),
    };

    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, sender, content, is_read, telegram_message_id, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(&message.sender)
    .bind(&message.content)
    .bind(message.is_read)
    .bind(message.telegram_message_id)
    .bind(&message.created_at)
    .execute(&state.db)
    .await?;

    let _ = sqlx::query("UPDATE chat_sessions SET last_message_at = $1 WHERE id = $2")
        .bind(&message.created_at)
        .bind(session_id)
        .execute(&state.db)
        .await;

    // A customer message landing while a console has this session open is
    // read on arrival.
    if sender == "customer" {
        let console_watching = {
            let rt = state.realtime.lock().await;
            rt.watched_session
                .iter()
                .any(|(client_id, watched)| watched == session_id && rt.consoles.contains(client_id))
        };
        if console_watching {
            let _ = sqlx::query("UPDATE chat_messages SET is_read = TRUE WHERE id = $1")
                .bind(&message.id)
                .execute(&state.db)
                .await;
            message.is_read = true;
        }
    }

    let watchers = {
        let rt = state.realtime.lock().await;
        rt.session_watchers
            .get(session_id)
            .map(|ids| ids.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
    };
    let consoles = console_clients(&state).await;

    emit_to_clients(&state, &watchers, "message:new", message.clone()).await;
    emit_to_clients(&state, &consoles, "message:new", message.clone()).await;

    if let Ok(Some(summary)) = get_session_summary_db(&state.db, session_id).await {
        emit_to_clients(&state, &consoles, "session:updated", summary).await;
    }

    Ok(message)
}

/// Outbound leg: claim the message's single relay attempt and notify the admin
/// channel, then record the provider id so replies can find their way back.
pub async fn relay_outbound(state: &Arc<AppState>, message_id: &str) -> Result<i64, ChatError> {
    let Some(message) = get_message_db(&state.db, message_id).await? else {
        return Err(ChatError::Validation("message not found"));
    };
    let customer_name = get_session_db(&state.db, &message.session_id)
        .await?
        .map(|session| session.customer_name)
        .unwrap_or_default();

    let claimed = sqlx::query(
        "UPDATE chat_messages SET relay_attempted = TRUE WHERE id = $1 AND relay_attempted = FALSE RETURNING id",
    )
    .bind(message_id)
    .fetch_optional(&state.db)
    .await?;
    if claimed.is_none() {
        warn!(message_id, "relay already attempted, skipping");
        return Err(ChatError::Validation(
            "relay already attempted for this message",
        ));
    }

    let text = render_admin_notification(&customer_name, &message.content);
    let telegram_message_id = state
        .telegram
        .send_message(state.telegram.admin_chat_id(), &text, None)
        .await?;

    // Non-fatal: a row without a correlation id simply never matches a reply.
    if let Err(err) = sqlx::query("UPDATE chat_messages SET telegram_message_id = $1 WHERE id = $2")
        .bind(telegram_message_id)
        .bind(message_id)
        .execute(&state.db)
        .await
    {
        warn!(message_id, error = %err, "failed to record telegram message id");
    }

    Ok(telegram_message_id)
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_clients<T: Serialize + Clone>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn console_clients(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.consoles.iter().copied().collect::<Vec<_>>()
}

async fn emit_session_update(state: &Arc<AppState>, session_id: &str) {
    if let Ok(Some(summary)) = get_session_summary_db(&state.db, session_id).await {
        let consoles = console_clients(state).await;
        emit_to_clients(state, &consoles, "session:updated", summary).await;
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_widget_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> impl IntoResponse {
    if let Err(err) = validate_identity(&body.customer_name, &body.customer_mobile) {
        return err.into_response();
    }

    match create_session(&state, &body.customer_name, &body.customer_mobile).await {
        Ok(session) => {
            (StatusCode::CREATED, Json(json!({ "sessionId": session.id }))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_widget_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match verify_resumable_session(&state, &session_id).await {
        Ok(Some(session)) => Json(json!({ "session": session })).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match get_session_messages_db(&state.db, &session_id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    match get_session_db(&state.db, &session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "session not found" })),
            )
                .into_response();
        }
        Err(err) => return err.into_response(),
    }

    let sender = match body.sender.as_deref() {
        Some("admin") => "admin",
        _ => "customer",
    };
    let is_read = sender == "admin";

    match add_message(state.clone(), &session_id, sender, &body.content, is_read).await {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_console_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match list_session_summaries(&state.db).await {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_mark_read(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match mark_session_read(&state, &session_id).await {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_close_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match close_session(&state, &session_id).await {
        Ok(Some(session)) => Json(json!({ "session": session })).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_unread(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match unread_overview(&state.db).await {
        Ok(snapshot) => Json(json!({ "unread": snapshot })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn telegram_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RelaySendBody>,
) -> impl IntoResponse {
    let message_id = body.message_id.trim();
    if message_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "messageId is required" })),
        )
            .into_response();
    }

    match get_message_db(&state.db, message_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "message not found" })),
            )
                .into_response();
        }
        Err(err) => return err.into_response(),
    }

    match relay_outbound(&state, message_id).await {
        Ok(telegram_message_id) => Json(json!({
            "ok": true,
            "telegramMessageId": telegram_message_id
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn telegram_webhook(
    Path(token): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    if !state.telegram.webhook_token_matches(&token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook token" })),
        )
            .into_response();
    }

    let Ok(update) = serde_json::from_slice::<TelegramUpdate>(&body) else {
        return (StatusCode::OK, Json(json!({ "received": true, "processed": 0 })))
            .into_response();
    };

    let mut processed = 0usize;
    match classify_update(&update) {
        UpdateKind::Irrelevant => {}
        UpdateKind::NonReply {
            sender_chat_id,
            message_id,
            ..
        } => {
            if let Err(err) = state
                .telegram
                .send_message(sender_chat_id, REPLY_WARNING_TEXT, Some(message_id))
                .await
            {
                warn!(update_id = update.update_id, error = %err, "failed to send reply warning");
            }
        }
        UpdateKind::Reply {
            reply_target_id,
            text,
            ..
        } => {
            let session_id = match sqlx::query_scalar::<_, String>(
                "SELECT session_id FROM chat_messages WHERE telegram_message_id = $1 LIMIT 1",
            )
            .bind(reply_target_id)
            .fetch_optional(&state.db)
            .await
            {
                Ok(found) => found,
                Err(err) => {
                    error!(update_id = update.update_id, error = %err, "correlation lookup failed");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "correlation lookup failed" })),
                    )
                        .into_response();
                }
            };

            match session_id {
                Some(session_id) => {
                    match add_message(state.clone(), &session_id, "admin", &text, true).await {
                        Ok(_) => processed += 1,
                        Err(err) => {
                            warn!(update_id = update.update_id, session_id = %session_id, error = %err, "failed to store admin reply");
                        }
                    }
                }
                None => {
                    warn!(
                        update_id = update.update_id,
                        reply_target_id, "reply target matches no relayed message"
                    );
                }
            }
        }
    }

    (StatusCode::OK, Json(json!({ "received": true, "processed": processed }))).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "widget:join" => {
                if let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str) {
                    {
                        let mut rt = state.realtime.lock().await;
                        rt.session_watchers
                            .entry(session_id.to_string())
                            .or_default()
                            .insert(client_id);
                    }

                    match get_session_messages_db(&state.db, session_id).await {
                        Ok(history) => {
                            emit_to_client(&state, client_id, "session:history", history).await;
                        }
                        Err(err) => {
                            emit_to_client(
                                &state,
                                client_id,
                                "error",
                                json!({ "message": err.to_string() }),
                            )
                            .await;
                        }
                    }
                }
            }
            "console:join" => {
                {
                    let mut rt = state.realtime.lock().await;
                    rt.consoles.insert(client_id);
                }

                match list_session_summaries(&state.db).await {
                    Ok(sessions) => {
                        emit_to_client(&state, client_id, "session:snapshot", sessions).await;
                    }
                    Err(err) => {
                        emit_to_client(
                            &state,
                            client_id,
                            "error",
                            json!({ "message": err.to_string() }),
                        )
                        .await;
                    }
                }
            }
            "console:watch" => {
                if let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str) {
                    {
                        let mut rt = state.realtime.lock().await;
                        rt.watched_session.insert(client_id, session_id.to_string());
                    }

                    match get_session_messages_db(&state.db, session_id).await {
                        Ok(history) => {
                            emit_to_client(&state, client_id, "session:history", history).await;
                        }
                        Err(err) => {
                            emit_to_client(
                                &state,
                                client_id,
                                "error",
                                json!({ "message": err.to_string() }),
                            )
                            .await;
                        }
                    }

                    if let Err(err) = mark_session_read(&state, session_id).await {
                        warn!(session_id, error = %err, "failed to mark session read");
                    }
                }
            }
            _ => {}
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.consoles.remove(&client_id);
        rt.watched_session.remove(&client_id);
        for watchers in rt.session_watchers.values_mut() {
            watchers.remove(&client_id);
        }
    }

    send_task.abort();
}

fn spawn_unread_poller(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            match unread_overview(&state.db).await {
                Ok(snapshot) => {
                    let consoles = console_clients(&state).await;
                    if !consoles.is_empty() {
                        emit_to_clients(&state, &consoles, "unread:snapshot", snapshot).await;
                    }
                }
                Err(err) => warn!(error = %err, "unread poll failed"),
            }
        }
    });
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget/session", post(post_widget_session))
        .route("/api/widget/session/{session_id}", get(get_widget_session))
        .route("/api/session/{session_id}/messages", get(get_messages))
        .route("/api/session/{session_id}/message", post(post_message))
        .route("/api/console/sessions", get(get_console_sessions))
        .route("/api/console/session/{session_id}/read", post(post_mark_read))
        .route(
            "/api/console/session/{session_id}/close",
            post(post_close_session),
        )
        .route("/api/console/unread", get(get_unread))
        .route("/api/telegram/send", post(telegram_send))
        .route("/api/telegram/webhook/{token}", post(telegram_webhook))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let bot_token = env::var("TELEGRAM_BOT_TOKEN").expect("TELEGRAM_BOT_TOKEN is required");
    let admin_chat_id = env::var("TELEGRAM_CHAT_ID")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .expect("TELEGRAM_CHAT_ID is required and must be a chat id");
    let api_base = env::var("TELEGRAM_API_BASE")
        .unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
        .trim_end_matches('/')
        .to_string();
    let relay_timeout = env::var("RELAY_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let poll_interval = env::var("FEED_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);

    let telegram = TelegramClient::new(
        bot_token,
        admin_chat_id,
        Duration::from_secs(relay_timeout),
        api_base,
    )
    .expect("failed to build telegram client");

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        telegram,
    });

    spawn_unread_poller(state.clone(), Duration::from_secs(poll_interval));

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(port, "chat relay server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_wraps_event_and_data() {
        let payload = event_payload("message:new", json!({ "id": "m1" })).expect("should encode");
        let value: Value = serde_json::from_str(&payload).expect("should parse");
        assert_eq!(value["event"], "message:new");
        assert_eq!(value["data"]["id"], "m1");
    }

    #[test]
    fn now_iso_is_rfc3339_with_offset() {
        let now = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
