use super::*;
use axum::{
    extract::{ws::Message as AxumWsMessage, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::TimeZone;
use shared::domain::MessageKind;
use shared::error::ErrorCode;
use tokio::{net::TcpListener, sync::oneshot};

#[derive(Clone, Default)]
struct StubState {
    actions: Arc<Mutex<Vec<serde_json::Value>>>,
    fail_next_action: Arc<Mutex<Option<(StatusCode, ApiError)>>>,
    typing_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

fn row_json(message_id: i64, thread_id: i64, time: &str) -> serde_json::Value {
    serde_json::json!({
        "message_id": message_id,
        "thread_id": thread_id,
        "sender_id": 1,
        "sender_name": "Dr. Demo",
        "kind": "text",
        "content": format!("note {message_id}"),
        "attachments": [],
        "is_edited": false,
        "is_deleted": false,
        "created_at": format!("2026-01-10T{time}Z"),
    })
}

fn pushed_row(message_id: i64, thread_id: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(message_id),
        thread_id: ThreadId(thread_id),
        sender_id: UserId(2),
        sender_name: Some("Pat Demo".to_string()),
        kind: MessageKind::Text,
        content: Some("hello".to_string()),
        reply_to_message_id: None,
        attachments: Vec::new(),
        is_edited: false,
        edited_at: None,
        is_deleted: false,
        created_at: Utc.with_ymd_and_hms(2026, 1, 10, 10, 0, 0).unwrap(),
    }
}

async fn handle_threads() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "threads": [] }))
}

async fn handle_messages() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "messages": [row_json(71, 5, "09:58:00"), row_json(72, 5, "09:59:00")],
        "has_more": false
    }))
}

async fn handle_directory(
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "users": [{
            "user_id": 9,
            "display_name": params.get("q").cloned().unwrap_or_default(),
            "kind": "patient"
        }]
    }))
}

async fn handle_action(
    State(state): State<StubState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    state.actions.lock().await.push(body.clone());
    if let Some((status, error)) = state.fail_next_action.lock().await.take() {
        return Err((status, Json(serde_json::json!({ "ok": false, "error": error }))));
    }
    let reply = match body["action"].as_str().unwrap_or_default() {
        "thread.openDirect" => serde_json::json!({ "ok": true, "thread_id": 40, "created": true }),
        "message.send" => serde_json::json!({
            "ok": true,
            "message": {
                "message_id": 77,
                "thread_id": body["thread_id"],
                "sender_id": 1,
                "sender_name": "Dr. Demo",
                "kind": "text",
                "content": body["content"],
                "attachments": [],
                "is_edited": false,
                "is_deleted": false,
                "created_at": "2026-01-10T10:00:00Z"
            },
            "upload_grants": []
        }),
        _ => serde_json::json!({ "ok": true }),
    };
    Ok(Json(reply))
}

async fn handle_ws(State(state): State<StubState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let event = ServerEvent::ThreadUpdated {
            thread_id: ThreadId(5),
        };
        let text = serde_json::to_string(&event).expect("encode event");
        let _ = socket.send(AxumWsMessage::Text(text)).await;
        while let Some(Ok(frame)) = socket.recv().await {
            if let AxumWsMessage::Text(text) = frame {
                if let Some(tx) = state.typing_tx.lock().await.take() {
                    let _ = tx.send(text);
                }
            }
        }
    })
}

async fn spawn_stub() -> Result<(String, StubState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = StubState::default();
    let app = Router::new()
        .route("/threads", get(handle_threads))
        .route("/messages", get(handle_messages))
        .route("/directory", get(handle_directory))
        .route("/actions", post(handle_action))
        .route("/ws", get(handle_ws))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

async fn offline_client(server_url: &str, user_id: i64) -> Arc<MessagingClient> {
    let client = MessagingClient::new();
    {
        let mut inner = client.inner.lock().await;
        inner.server_url = Some(server_url.trim_end_matches('/').to_string());
        inner.user_id = Some(UserId(user_id));
    }
    client
}

#[tokio::test]
async fn api_errors_downcast_to_typed_exceptions() {
    let (server_url, state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;
    *state.fail_next_action.lock().await = Some((
        StatusCode::FORBIDDEN,
        ApiError::new(
            ErrorCode::Blocked,
            "messaging is blocked between these accounts",
        ),
    ));

    let err = client
        .open_direct_thread(UserId(2))
        .await
        .expect_err("must fail");
    let api = err.downcast_ref::<ApiException>().expect("typed error");
    assert_eq!(api.code, ErrorCode::Blocked);
}

#[tokio::test]
async fn failed_sends_park_and_retry_with_the_same_draft() {
    let (server_url, state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;
    *state.fail_next_action.lock().await = Some((
        StatusCode::BAD_REQUEST,
        ApiError::new(ErrorCode::Validation, "rejected"),
    ));

    let result = client
        .send_message(
            ThreadId(5),
            Some("hard to deliver".to_string()),
            None,
            Vec::new(),
        )
        .await;
    assert!(result.is_err());

    let entries = client.timeline_entries(ThreadId(5)).await;
    assert_eq!(entries.len(), 1);
    let temp_id = match &entries[0] {
        TimelineEntry::Local {
            temp_id, status, ..
        } => {
            assert_eq!(*status, timeline::SendStatus::Failed);
            *temp_id
        }
        TimelineEntry::Persisted(_) => panic!("expected a parked echo"),
    };

    let receipt = client
        .retry_send(ThreadId(5), temp_id)
        .await
        .expect("retry");
    assert_eq!(receipt.message.message_id, MessageId(77));

    let entries = client.timeline_entries(ThreadId(5)).await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(&entries[0], TimelineEntry::Persisted(m) if m.message_id == MessageId(77)));

    let actions = state.actions.lock().await;
    let sends: Vec<_> = actions
        .iter()
        .filter(|body| body["action"] == "message.send")
        .collect();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0]["content"], sends[1]["content"]);
}

#[tokio::test]
async fn fetched_pages_merge_into_the_timeline() {
    let (server_url, _state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;

    let page = client
        .fetch_messages(ThreadId(5), None, Some(40))
        .await
        .expect("fetch");
    assert_eq!(page.messages.len(), 2);
    assert!(!page.has_more);

    let entries = client.timeline_entries(ThreadId(5)).await;
    assert_eq!(entries.len(), 2);
    assert!(matches!(&entries[0], TimelineEntry::Persisted(m) if m.message_id == MessageId(71)));
    assert!(!client.has_older_messages(ThreadId(5)).await);
}

#[tokio::test]
async fn focused_threads_ack_incoming_rows() {
    let (server_url, state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;
    client
        .set_focused_thread(Some(ThreadId(5)))
        .await
        .expect("focus");

    client
        .ingest_server_event(ServerEvent::MessageReceived {
            message: pushed_row(77, 5),
        })
        .await;

    let actions = state.actions.lock().await;
    assert!(actions
        .iter()
        .any(|body| body["action"] == "message.markRead" && body["message_id"] == 77));
}

#[tokio::test]
async fn unfocused_threads_are_not_acked() {
    let (server_url, state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;

    client
        .ingest_server_event(ServerEvent::MessageReceived {
            message: pushed_row(77, 5),
        })
        .await;

    assert_eq!(client.timeline_entries(ThreadId(5)).await.len(), 1);
    let actions = state.actions.lock().await;
    assert!(actions
        .iter()
        .all(|body| body["action"] != "message.markRead"));
}

#[tokio::test]
async fn the_socket_delivers_events_and_carries_typing_signals() {
    let (server_url, state) = spawn_stub().await.expect("spawn stub");
    let (typing_tx, typing_rx) = oneshot::channel();
    *state.typing_tx.lock().await = Some(typing_tx);

    let client = MessagingClient::new();
    let mut events = client.subscribe_events();
    client.connect(&server_url, UserId(1)).await.expect("connect");

    let event = events.recv().await.expect("first event");
    assert!(matches!(
        event,
        ClientEvent::ThreadsChanged { thread_id } if thread_id == ThreadId(5)
    ));

    client.send_typing(ThreadId(5), true).await.expect("typing");
    let text = typing_rx.await.expect("typing frame");
    let ClientSignal::Typing {
        thread_id,
        is_typing,
    } = serde_json::from_str(&text).expect("decode signal");
    assert_eq!(thread_id, ThreadId(5));
    assert!(is_typing);
}

#[tokio::test]
async fn directory_queries_survive_url_encoding() {
    let (server_url, _state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;

    let users = client
        .search_directory("ann marie", true)
        .await
        .expect("search");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].display_name, "ann marie");
}

#[tokio::test]
async fn local_hides_prune_without_waiting_for_events() {
    let (server_url, _state) = spawn_stub().await.expect("spawn stub");
    let client = offline_client(&server_url, 1).await;

    client
        .ingest_server_event(ServerEvent::MessageReceived {
            message: pushed_row(77, 5),
        })
        .await;
    client
        .delete_message_for_me(ThreadId(5), MessageId(77))
        .await
        .expect("hide");
    assert!(client.timeline_entries(ThreadId(5)).await.is_empty());
}

#[tokio::test]
async fn connect_refuses_non_http_schemes() {
    let client = MessagingClient::new();
    let err = client
        .connect("ftp://example.invalid", UserId(1))
        .await
        .expect_err("must refuse");
    assert!(err.to_string().contains("http"));
}
