use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    dispatcher::EventDispatcher,
    document::{DocumentBridge, DocumentContext, FilterPatch},
    error::{ApiError, ApiResult, StartupError},
    facts,
    memory_sync::{profile_thread_id, MemoryMessage, MemorySync, SyncJob, ZepClient},
    profile_store::{MemoryProfileStore, PgProfileStore, ProfileStore},
    session_context,
    signature::{Verification, WebhookAuth},
    types::*,
};

const SIGNATURE_HEADERS: &[&str] = &["x-signature", "x-hume-ai-webhook-signature"];
const TIMESTAMP_HEADERS: &[&str] = &["x-timestamp", "x-hume-ai-webhook-timestamp"];

pub const PROFILE_SOURCE: &str = "profile_api";
pub const WEB_CHAT_SOURCE: &str = "web_chat";

fn header_text<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

fn required(value: Option<&str>, message: &str) -> ApiResult<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(message.to_string()))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn hume_webhook_verify() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "hume-webhook" }))
}

async fn hume_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = header_text(&headers, SIGNATURE_HEADERS);
    let timestamp = header_text(&headers, TIMESTAMP_HEADERS);

    match state
        .webhook_auth
        .check(&body, signature, timestamp, Utc::now().timestamp())
    {
        Verification::Verified => {}
        Verification::Skipped => {
            warn!("webhook verification skipped: development mode without a secret");
        }
        Verification::Rejected(reason) => {
            warn!(reason, "webhook rejected");
            return Err(ApiError::Unauthorized(reason));
        }
    }

    let event = WebhookPayload::parse(&body).map_err(|err| {
        warn!(error = %err, "webhook payload rejected");
        ApiError::from(err)
    })?;
    let context = session_context::decode(event.session_id());

    let user_label = if context.is_anonymous() {
        "anonymous"
    } else {
        context.user_id.as_str()
    };
    info!(
        event = event.wire_name(),
        chat_id = %event.chat_id(),
        user_id = user_label,
        "webhook received"
    );

    let outcome = state.dispatcher.dispatch(&event, &context);
    debug!(chat_id = %event.chat_id(), ?outcome, "webhook dispatched");

    Ok(Json(json!({
        "status": "success",
        "event": event.wire_name(),
        "chat_id": event.chat_id(),
    })))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
) -> ApiResult<Json<Value>> {
    let user_id = required(query.user_id.as_deref(), "userId required")?;
    let items = state.store.list(&user_id).await?;
    Ok(Json(json!({ "items": items })))
}

async fn post_profile(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertProfileBody>,
) -> ApiResult<Json<Value>> {
    let missing = "userId, itemType, and value required";
    let user_id = required(Some(body.user_id.as_str()), missing)?;
    let item_type = required(Some(body.item_type.as_str()), missing)?;
    let value = required(Some(body.value.as_str()), missing)?;
    let metadata = body.metadata.unwrap_or_default();
    let confirmed = body.confirmed.unwrap_or(false);

    let item = state
        .store
        .upsert(&user_id, &item_type, &value, &metadata, confirmed)
        .await?;

    let fact = facts::synthesize(&item_type, &value, &metadata);
    let queued = state
        .memory
        .sync(&user_id, &profile_thread_id(&user_id), vec![fact], PROFILE_SOURCE);
    debug!(user_id = %user_id, item_type = %item_type, queued, "profile item saved");

    Ok(Json(json!({ "success": true, "item": item })))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeleteProfileQuery>,
) -> ApiResult<Json<Value>> {
    let missing = "userId and itemId required";
    let user_id = required(query.user_id.as_deref(), missing)?;
    let item_id = required(query.item_id.as_deref().or(query.id.as_deref()), missing)?
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("itemId must be an integer".to_string()))?;

    let removed = state.store.delete(&user_id, item_id).await?;
    debug!(user_id = %user_id, item_id, removed, "profile item delete");
    Ok(Json(json!({ "success": true })))
}

async fn post_memory_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MemoryMessageBody>,
) -> impl IntoResponse {
    let user_id = body.user_id.trim();
    let content = body.content.trim();
    if user_id.is_empty() || content.is_empty() {
        return Json(json!({ "success": false, "error": "userId and content required" }));
    }
    if !state.memory.is_enabled() {
        return Json(json!({ "success": false, "error": "memory sync disabled" }));
    }

    let thread_id = body
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| profile_thread_id(user_id));
    let role = body
        .role
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("user");

    let queued = state.memory.submit(SyncJob {
        user_id: user_id.to_string(),
        thread_id,
        source: WEB_CHAT_SOURCE.to_string(),
        messages: vec![MemoryMessage {
            role: role.to_string(),
            content: content.to_string(),
            metadata: body.metadata,
        }],
    });

    Json(json!({ "success": true, "queued": queued }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentQuery {
    page: Option<String>,
    location: Option<String>,
    role: Option<String>,
    remote: Option<bool>,
    min_rate: Option<f64>,
    max_rate: Option<f64>,
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn document_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<DocumentQuery>,
) -> impl IntoResponse {
    let initial = FilterPatch {
        location: query.location,
        role: query.role,
        remote: query.remote,
        min_rate: query.min_rate,
        max_rate: query.max_rate,
    };
    let bridge = DocumentBridge::new(query.page.unwrap_or_default(), &initial).map(Arc::new);
    let document = DocumentContext::resolve(bridge);
    ws.on_upgrade(move |socket| handle_document_socket(socket, document))
}

/// One page view: the bridge lives exactly as long as the socket.
async fn handle_document_socket(socket: WebSocket, document: DocumentContext) {
    let view_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    if let Some(payload) = event_payload("document:state", document.state()) {
        let _ = tx.send(payload);
    }

    let watch_task = document.subscribe().map(|mut changes| {
        let tx = tx.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let snapshot = changes.borrow_and_update().clone();
                let Some(payload) = event_payload("document:state", snapshot) else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        })
    });

    debug!(view_id = %view_id, installed = document.is_installed(), "document view opened");

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
            "document:action" => {
                let name = envelope
                    .data
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let params = envelope.data.get("params").cloned().unwrap_or(Value::Null);
                let result = document.invoke(name, &params);
                debug!(
                    view_id = %view_id,
                    action = name,
                    applied = result.applied,
                    "document action"
                );
                if let Some(payload) = event_payload(
                    "document:action-result",
                    json!({ "name": name, "applied": result.applied, "message": result.message }),
                ) {
                    let _ = tx.send(payload);
                }
            }
            "document:read" => {
                if let Some(payload) = event_payload("document:readable", document.readable()) {
                    let _ = tx.send(payload);
                }
            }
            _ => {}
        }
    }

    if let Some(task) = watch_task {
        task.abort();
    }
    send_task.abort();
    debug!(view_id = %view_id, "document view closed");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/hume/webhook",
            get(hume_webhook_verify).post(hume_webhook_event),
        )
        .route(
            "/api/profile",
            get(get_profile).post(post_profile).delete(delete_profile),
        )
        .route("/api/memory/message", post(post_memory_message))
        .route("/ws/document", get(document_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config) -> Result<(), StartupError> {
    let store: Arc<dyn ProfileStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgProfileStore::connect(url).await?),
        None if config.dev_mode => {
            warn!("no database configured, using in-process profile store");
            Arc::new(MemoryProfileStore::new())
        }
        None => return Err(StartupError::DatabaseRequired),
    };

    let memory = match config.memory_api_key.as_deref() {
        Some(api_key) => {
            let client = Arc::new(ZepClient::new(
                &config.memory_api_url,
                api_key,
                Duration::from_secs(config.memory_timeout_secs),
            )?);
            let (memory, _worker) = MemorySync::spawn(client, config.sync_queue_capacity);
            memory
        }
        None => {
            warn!("ZEP_API_KEY not set, memory sync disabled");
            MemorySync::disabled()
        }
    };

    if config.webhook_secret.is_none() {
        if config.dev_mode {
            warn!("no webhook secret: signature verification disabled (development mode)");
        } else {
            warn!("no webhook secret: every webhook delivery will be rejected");
        }
    }

    let state = Arc::new(AppState {
        store,
        dispatcher: EventDispatcher::new(memory.clone()),
        memory,
        webhook_auth: WebhookAuth::new(
            config.webhook_secret.clone(),
            config.dev_mode,
            config.replay_window_secs,
        ),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!(port = config.port, dev_mode = config.dev_mode, "voice fact sync server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(StartupError::Serve)
}
