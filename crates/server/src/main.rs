use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use grants::{GrantConfig, GrantPurpose};
use serde::Deserialize;
use serde_json::json;
use server_api::{
    create_group_thread, create_quick_reply, delete_message, delete_message_for_me,
    delete_quick_reply, edit_message, fetch_messages, leave_thread, list_quick_replies,
    list_threads, mark_read, open_direct_thread, presence_snapshot, remove_member,
    report_user, request_download, request_upload, search_directory, search_messages,
    send_message, set_member_role, set_thread_muted, thread_info, toggle_block,
    toggle_message_pin, toggle_thread_pin, typing_recipients, update_presence,
    update_quick_reply, update_settings, ApiContext, Envelope,
};
use shared::{
    domain::{MessageId, ThreadId, UserId, UserKind},
    error::{ApiError, ErrorCode},
    protocol::{ActionRequest, AttachmentDraft, ClientSignal, ServerEvent},
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod config;

use config::{load_settings, prepare_database_url};

const MAX_BLOB_BYTES: usize = server_api::attachments::MAX_ATTACHMENT_BYTES as usize;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<Envelope>,
    blob_root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    thread_id: i64,
    cursor: Option<i64>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadInfoQuery {
    thread_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
    thread_id: i64,
    q: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    include_patients: bool,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct BlobQuery {
    grant: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    if settings.seed_demo_users {
        seed_demo_users(&storage).await?;
    }

    let api = ApiContext {
        storage,
        grants: GrantConfig {
            secret: settings.grant_secret,
            upload_ttl_seconds: settings.upload_grant_ttl_seconds,
            download_ttl_seconds: settings.download_grant_ttl_seconds,
        },
        public_base_url: settings.public_base_url,
    };
    let (events, _) = broadcast::channel(256);

    let state = AppState {
        api,
        events,
        blob_root: PathBuf::from(settings.blob_root),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn seed_demo_users(storage: &Storage) -> anyhow::Result<()> {
    if storage.count_users().await? > 0 {
        return Ok(());
    }
    for (name, kind) in [
        ("Dr. Demo", UserKind::Provider),
        ("Pat Demo", UserKind::Patient),
    ] {
        let user_id = storage.create_user(name, kind, None).await?;
        info!("seeded demo user '{}' with id {}", name, user_id.0);
    }
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/threads", get(http_list_threads))
        .route("/messages", get(http_list_messages))
        .route("/threadInfo", get(http_thread_info))
        .route("/search", get(http_search_messages))
        .route("/presence", get(http_presence))
        .route("/directory", get(http_directory))
        .route("/quickReplies", get(http_quick_replies))
        .route("/actions", post(http_actions))
        .route("/blobs/*path", get(http_get_blob).put(http_put_blob))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BLOB_BYTES + 64 * 1024))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Status plus the `{"ok": false, "error": ...}` body every failed
/// request answers with.
type ErrorReply = (StatusCode, Json<serde_json::Value>);

/// Resolves the caller from the `x-user-id` header. Anything short of a
/// real active account gets the same 401, before any routing happens.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ErrorReply> {
    let raw = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(unauthorized)?;
    let user = state
        .api
        .storage
        .get_user(UserId(raw))
        .await
        .map_err(storage_failure)?
        .filter(|user| user.is_active)
        .ok_or_else(unauthorized)?;
    Ok(user.user_id)
}

fn unauthorized() -> ErrorReply {
    error_response(ApiError::new(
        ErrorCode::Unauthorized,
        "authentication required",
    ))
}

fn storage_failure(err: anyhow::Error) -> ErrorReply {
    error_response(ApiError::new(ErrorCode::Upstream, err.to_string()))
}

fn error_response(err: ApiError) -> ErrorReply {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Blocked | ErrorCode::NotAccepting | ErrorCode::Forbidden => {
            StatusCode::FORBIDDEN
        }
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "ok": false, "error": err })))
}

fn publish(state: &AppState, envelopes: Vec<Envelope>) {
    for envelope in envelopes {
        // Send only fails when nobody is connected; that is fine.
        let _ = state.events.send(envelope);
    }
}

async fn http_actions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(action): Json<ActionRequest>,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let value = dispatch_action(&state, user_id, action)
        .await
        .map_err(error_response)?;
    Ok(Json(value))
}

async fn dispatch_action(
    state: &AppState,
    user_id: UserId,
    action: ActionRequest,
) -> Result<serde_json::Value, ApiError> {
    let api = &state.api;
    match action {
        ActionRequest::ThreadOpenDirect { peer_id } => {
            let (thread_id, created, envelopes) =
                open_direct_thread(api, user_id, peer_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "thread_id": thread_id, "created": created }))
        }
        ActionRequest::ThreadCreateGroup { title, member_ids } => {
            let (thread_id, envelopes) =
                create_group_thread(api, user_id, &title, &member_ids).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "thread_id": thread_id }))
        }
        ActionRequest::ThreadLeave { thread_id } => {
            let envelopes = leave_thread(api, user_id, thread_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true }))
        }
        ActionRequest::ThreadMute {
            thread_id,
            muted,
            until,
        } => {
            let envelopes = set_thread_muted(api, user_id, thread_id, muted, until).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "muted": muted }))
        }
        ActionRequest::ThreadTogglePinned { thread_id } => {
            let (pinned, envelopes) = toggle_thread_pin(api, user_id, thread_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "pinned": pinned }))
        }
        ActionRequest::MemberSetRole {
            thread_id,
            target_id,
            role,
        } => {
            let envelopes = set_member_role(api, user_id, thread_id, target_id, role).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true }))
        }
        ActionRequest::MemberRemove {
            thread_id,
            target_id,
        } => {
            let envelopes = remove_member(api, user_id, thread_id, target_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true }))
        }
        ActionRequest::MessageSend {
            thread_id,
            content,
            reply_to_message_id,
            attachments,
        } => {
            let (receipt, envelopes) = send_message(
                api,
                user_id,
                thread_id,
                content.as_deref(),
                reply_to_message_id,
                &attachments,
            )
            .await?;
            publish(state, envelopes);
            Ok(json!({
                "ok": true,
                "message": receipt.message,
                "upload_grants": receipt.upload_grants,
            }))
        }
        ActionRequest::MessageEdit {
            message_id,
            content,
        } => {
            let (message, envelopes) = edit_message(api, user_id, message_id, &content).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "message": message }))
        }
        ActionRequest::MessageDelete { message_id } => {
            let envelopes = delete_message(api, user_id, message_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true }))
        }
        ActionRequest::MessageDeleteForMe { message_id } => {
            delete_message_for_me(api, user_id, message_id).await?;
            Ok(json!({ "ok": true }))
        }
        ActionRequest::MessageTogglePinned { message_id } => {
            let pinned = toggle_message_pin(api, user_id, message_id).await?;
            Ok(json!({ "ok": true, "pinned": pinned }))
        }
        ActionRequest::MessageMarkRead {
            thread_id,
            message_id,
        } => {
            let envelopes = mark_read(api, user_id, thread_id, message_id).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true }))
        }
        ActionRequest::FileRequestUpload {
            message_id,
            file_name,
            file_type,
            size_bytes,
        } => {
            let draft = AttachmentDraft {
                file_name,
                file_type,
                size_bytes,
            };
            let grant = request_upload(api, user_id, message_id, &draft).await?;
            Ok(json!({
                "ok": true,
                "attachment_id": grant.attachment_id,
                "storage_path": grant.storage_path,
                "upload_url": grant.upload_url,
                "token": grant.token,
                "expires_at": grant.expires_at,
            }))
        }
        ActionRequest::FileGetDownloadUrl { attachment_id } => {
            let grant = request_download(api, user_id, attachment_id).await?;
            Ok(json!({
                "ok": true,
                "download_url": grant.download_url,
                "expires_at": grant.expires_at,
            }))
        }
        ActionRequest::UserBlockToggle { target_id } => {
            let blocked = toggle_block(api, user_id, target_id).await?;
            Ok(json!({ "ok": true, "blocked": blocked }))
        }
        ActionRequest::UserReport { target_id, reason } => {
            let report_id = report_user(api, user_id, target_id, &reason).await?;
            Ok(json!({ "ok": true, "report_id": report_id }))
        }
        ActionRequest::SettingsUpdate { accepts_new_chats } => {
            update_settings(api, user_id, accepts_new_chats).await?;
            Ok(json!({ "ok": true }))
        }
        ActionRequest::PresenceUpdate {
            status,
            status_message,
        } => {
            let (presence, envelopes) =
                update_presence(api, user_id, status, status_message.as_deref()).await?;
            publish(state, envelopes);
            Ok(json!({ "ok": true, "presence": presence }))
        }
        ActionRequest::QuickReplyCreate { label, body } => {
            let quick_reply = create_quick_reply(api, user_id, &label, &body).await?;
            Ok(json!({ "ok": true, "quick_reply": quick_reply }))
        }
        ActionRequest::QuickReplyUpdate {
            quick_reply_id,
            label,
            body,
        } => {
            update_quick_reply(api, user_id, quick_reply_id, &label, &body).await?;
            Ok(json!({ "ok": true }))
        }
        ActionRequest::QuickReplyDelete { quick_reply_id } => {
            delete_quick_reply(api, user_id, quick_reply_id).await?;
            Ok(json!({ "ok": true }))
        }
    }
}

async fn http_list_threads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let threads = list_threads(&state.api, user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "threads": threads })))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<shared::protocol::MessagePage>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let page = fetch_messages(
        &state.api,
        user_id,
        ThreadId(q.thread_id),
        q.cursor.map(MessageId),
        q.limit,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(page))
}

async fn http_thread_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ThreadInfoQuery>,
) -> Result<Json<shared::protocol::ThreadInfoResponse>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let info = thread_info(&state.api, user_id, ThreadId(q.thread_id))
        .await
        .map_err(error_response)?;
    Ok(Json(info))
}

async fn http_search_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let hits = search_messages(&state.api, user_id, ThreadId(q.thread_id), &q.q)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "messages": hits })))
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PresenceQuery>,
) -> Result<Json<shared::protocol::PresenceSnapshot>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let snapshot = presence_snapshot(&state.api, user_id, UserId(q.user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

async fn http_directory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<DirectoryQuery>,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let users = search_directory(&state.api, user_id, &q.q, q.include_patients)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "users": users })))
}

async fn http_quick_replies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    let user_id = authenticate(&state, &headers).await?;
    let quick_replies = list_quick_replies(&state.api, user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "quick_replies": quick_replies })))
}

/// Stores blob bytes under the path named by a valid upload grant. The
/// path inside the token was built server side, but stays checked against
/// traversal anyway.
async fn http_put_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(q): Query<BlobQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    grants::verify_grant(&state.api.grants, &q.grant, &path, GrantPurpose::Upload)
        .map_err(grant_rejected)?;
    validate_blob_path(&path)?;
    if body.is_empty() {
        return Err(error_response(ApiError::new(
            ErrorCode::Validation,
            "blob body cannot be empty",
        )));
    }
    if body.len() > MAX_BLOB_BYTES {
        return Err(error_response(ApiError::new(
            ErrorCode::PayloadTooLarge,
            "blob exceeds the 15 MiB limit",
        )));
    }

    let target = state.blob_root.join(&path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(blob_io_failure)?;
    }
    tokio::fs::write(&target, &body)
        .await
        .map_err(blob_io_failure)?;
    info!("stored blob {} ({} bytes)", path, body.len());
    Ok(Json(json!({ "stored": true, "size_bytes": body.len() })))
}

async fn http_get_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(q): Query<BlobQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    grants::verify_grant(&state.api.grants, &q.grant, &path, GrantPurpose::Download)
        .map_err(grant_rejected)?;
    validate_blob_path(&path)?;

    let target = state.blob_root.join(&path);
    let bytes = tokio::fs::read(&target).await.map_err(|_| {
        error_response(ApiError::new(ErrorCode::NotFound, "blob not found"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(name) = path.rsplit('/').next() {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok((StatusCode::OK, headers, bytes))
}

fn grant_rejected(err: grants::GrantError) -> ErrorReply {
    warn!("rejected blob grant: {err}");
    error_response(ApiError::new(
        ErrorCode::Forbidden,
        "invalid or expired grant",
    ))
}

fn blob_io_failure(err: std::io::Error) -> ErrorReply {
    error!("blob store io failure: {err}");
    error_response(ApiError::new(ErrorCode::Upstream, "blob store unavailable"))
}

fn validate_blob_path(path: &str) -> Result<(), ErrorReply> {
    let suspicious = path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if suspicious || path.contains('\\') {
        return Err(error_response(ApiError::new(
            ErrorCode::Validation,
            "malformed blob path",
        )));
    }
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let user_id = UserId(q.user_id);
    state
        .api
        .storage
        .get_user(user_id)
        .await
        .map_err(storage_failure)?
        .filter(|user| user.is_active)
        .ok_or_else(unauthorized)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(envelope) = events_rx.recv().await {
            if !envelope.includes(user_id) {
                continue;
            }
            let text = match serde_json::to_string(&envelope.event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(signal) = serde_json::from_str::<ClientSignal>(&text) else {
            continue;
        };
        match signal {
            ClientSignal::Typing {
                thread_id,
                is_typing,
            } => {
                // Typing from a non-member is dropped, not answered.
                if let Ok(recipients) =
                    typing_recipients(&state.api, user_id, thread_id).await
                {
                    let _ = state.events.send(Envelope::to(
                        recipients,
                        ServerEvent::Typing {
                            thread_id,
                            user_id,
                            is_typing,
                        },
                    ));
                }
            }
        }
    }

    send_task.abort();
}
