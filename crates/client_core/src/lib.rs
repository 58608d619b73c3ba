//! Client runtime for the messaging server.
//!
//! One [`MessagingClient`] owns the HTTP session, the WebSocket event feed,
//! per-thread timelines, and typing state. UI layers call the async
//! methods, subscribe to [`ClientEvent`]s, and re-read snapshots when a
//! `*Changed` event tells them to.

pub mod timeline;
pub mod typing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{
        AttachmentId, MemberRole, MessageId, PresenceStatus, QuickReplyId, ReportId, ThreadId,
        UserId,
    },
    error::{ApiError, ApiException},
    protocol::{
        ActionRequest, AttachmentDraft, ClientSignal, DownloadGrant, MessagePage, MessagePayload,
        PresenceSnapshot, QuickReplySummary, SendReceipt, ServerEvent, ThreadInfoResponse,
        ThreadSummary, UploadGrant, UserSummary,
    },
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::timeline::{OutboundDraft, Timeline, TimelineEntry};
use crate::typing::TypingTracker;

const USER_HEADER: &str = "x-user-id";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Notifications for UI layers. Pushes the client folds into local state
/// surface as `*Changed` markers; the data itself comes from the snapshot
/// methods.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The timeline for this thread changed shape; re-read the snapshot.
    TimelineChanged { thread_id: ThreadId },
    /// The live typist set for this thread changed.
    TypingChanged { thread_id: ThreadId },
    /// Thread metadata or membership changed server-side; refetch the list.
    ThreadsChanged { thread_id: ThreadId },
    PresenceChanged { presence: PresenceSnapshot },
    /// The server pushed an error over the socket.
    ServerError(ApiError),
    /// Local transport trouble worth showing.
    Error(String),
    /// The event feed closed; snapshots stay readable but go stale.
    Disconnected,
}

/// Failures establishing a session, kept apart from normal api errors.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("server url must be http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("websocket connect failed: {0}")]
    Websocket(String),
}

#[derive(Debug, Default)]
struct SessionState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    focused_thread: Option<ThreadId>,
    ws_connected: bool,
}

pub struct MessagingClient {
    http: reqwest::Client,
    inner: Mutex<SessionState>,
    timelines: Mutex<HashMap<ThreadId, Timeline>>,
    typing: Mutex<TypingTracker>,
    ws_sink: Mutex<Option<WsSink>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: reqwest::Client::new(),
            inner: Mutex::new(SessionState::default()),
            timelines: Mutex::new(HashMap::new()),
            typing: Mutex::new(TypingTracker::new()),
            ws_sink: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Binds the client to a server and identity, verifies the credentials
    /// with one authenticated request, and starts the event feed.
    pub async fn connect(self: &Arc<Self>, server_url: &str, user_id: UserId) -> Result<()> {
        let parsed = Url::parse(server_url).context("invalid server url")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConnectError::UnsupportedScheme(parsed.scheme().to_string()).into());
        }
        let server_url = server_url.trim_end_matches('/').to_string();
        {
            let mut inner = self.inner.lock().await;
            inner.server_url = Some(server_url.clone());
            inner.user_id = Some(user_id);
        }
        self.list_threads()
            .await
            .context("credential check failed")?;
        self.spawn_ws_events(&server_url, user_id).await
    }

    /// Tears the session down. The read loop notices the close and winds
    /// itself down.
    pub async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.close().await;
        }
        {
            let mut inner = self.inner.lock().await;
            inner.server_url = None;
            inner.user_id = None;
            inner.focused_thread = None;
            inner.ws_connected = false;
        }
        self.timelines.lock().await.clear();
        *self.typing.lock().await = TypingTracker::new();
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.ws_connected
    }

    // ---- threads ----

    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let body: ThreadListBody = self.http_get("/threads").await?;
        Ok(body.threads)
    }

    pub async fn thread_info(&self, thread_id: ThreadId) -> Result<ThreadInfoResponse> {
        self.http_get(&format!("/threadInfo?threadId={}", thread_id.0))
            .await
    }

    pub async fn open_direct_thread(&self, peer_id: UserId) -> Result<(ThreadId, bool)> {
        let body: OpenDirectBody = self
            .action(&ActionRequest::ThreadOpenDirect { peer_id })
            .await?;
        Ok((body.thread_id, body.created))
    }

    pub async fn create_group_thread(
        &self,
        title: &str,
        member_ids: Vec<UserId>,
    ) -> Result<ThreadId> {
        let body: CreateGroupBody = self
            .action(&ActionRequest::ThreadCreateGroup {
                title: title.to_string(),
                member_ids,
            })
            .await?;
        Ok(body.thread_id)
    }

    pub async fn leave_thread(&self, thread_id: ThreadId) -> Result<()> {
        self.post_action(&ActionRequest::ThreadLeave { thread_id })
            .await?;
        self.timelines.lock().await.remove(&thread_id);
        let mut inner = self.inner.lock().await;
        if inner.focused_thread == Some(thread_id) {
            inner.focused_thread = None;
        }
        Ok(())
    }

    pub async fn set_thread_muted(
        &self,
        thread_id: ThreadId,
        muted: bool,
        until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let body: MutedBody = self
            .action(&ActionRequest::ThreadMute {
                thread_id,
                muted,
                until,
            })
            .await?;
        Ok(body.muted)
    }

    pub async fn toggle_thread_pin(&self, thread_id: ThreadId) -> Result<bool> {
        let body: PinnedBody = self
            .action(&ActionRequest::ThreadTogglePinned { thread_id })
            .await?;
        Ok(body.pinned)
    }

    pub async fn set_member_role(
        &self,
        thread_id: ThreadId,
        target_id: UserId,
        role: MemberRole,
    ) -> Result<()> {
        self.post_action(&ActionRequest::MemberSetRole {
            thread_id,
            target_id,
            role,
        })
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, thread_id: ThreadId, target_id: UserId) -> Result<()> {
        self.post_action(&ActionRequest::MemberRemove {
            thread_id,
            target_id,
        })
        .await?;
        Ok(())
    }

    // ---- messages ----

    /// Sends with a local echo: the draft shows in the timeline at once,
    /// flips to the server row on success, and parks as failed on error so
    /// the user can retry or discard it.
    pub async fn send_message(
        &self,
        thread_id: ThreadId,
        content: Option<String>,
        reply_to_message_id: Option<MessageId>,
        attachments: Vec<AttachmentDraft>,
    ) -> Result<SendReceipt> {
        let draft = OutboundDraft {
            content,
            reply_to_message_id,
            attachments,
        };
        self.send_draft(thread_id, draft).await
    }

    /// Re-sends a failed echo with the exact original draft.
    pub async fn retry_send(&self, thread_id: ThreadId, temp_id: u64) -> Result<SendReceipt> {
        let draft = {
            let mut timelines = self.timelines.lock().await;
            timelines
                .get_mut(&thread_id)
                .and_then(|timeline| timeline.take_failed(temp_id))
        }
        .ok_or_else(|| anyhow!("no failed send with temp id {temp_id}"))?;
        self.send_draft(thread_id, draft).await
    }

    /// Drops a failed echo without retrying.
    pub async fn discard_failed_send(&self, thread_id: ThreadId, temp_id: u64) -> bool {
        let removed = {
            let mut timelines = self.timelines.lock().await;
            timelines
                .get_mut(&thread_id)
                .and_then(|timeline| timeline.take_failed(temp_id))
                .is_some()
        };
        if removed {
            let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
        }
        removed
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessagePayload> {
        let body: EditedBody = self
            .action(&ActionRequest::MessageEdit {
                message_id,
                content: content.to_string(),
            })
            .await?;
        let thread_id = body.message.thread_id;
        self.apply_to_timeline(
            thread_id,
            &ServerEvent::MessageEdited {
                message: body.message.clone(),
            },
        )
        .await;
        Ok(body.message)
    }

    /// Deletes for everyone. The pushed event tombstones the local row.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.post_action(&ActionRequest::MessageDelete { message_id })
            .await?;
        Ok(())
    }

    /// Hides a message for this account only. Nobody is notified, so the
    /// local row is pruned here instead of by a server event.
    pub async fn delete_message_for_me(
        &self,
        thread_id: ThreadId,
        message_id: MessageId,
    ) -> Result<()> {
        self.post_action(&ActionRequest::MessageDeleteForMe { message_id })
            .await?;
        let removed = {
            let mut timelines = self.timelines.lock().await;
            timelines
                .get_mut(&thread_id)
                .map(|timeline| timeline.remove(message_id))
                .unwrap_or(false)
        };
        if removed {
            let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
        }
        Ok(())
    }

    pub async fn toggle_message_pin(&self, message_id: MessageId) -> Result<bool> {
        let body: PinnedBody = self
            .action(&ActionRequest::MessageTogglePinned { message_id })
            .await?;
        Ok(body.pinned)
    }

    pub async fn mark_read(&self, thread_id: ThreadId, message_id: MessageId) -> Result<()> {
        self.post_action(&ActionRequest::MessageMarkRead {
            thread_id,
            message_id,
        })
        .await?;
        Ok(())
    }

    /// Fetches one history page and merges it into the local timeline.
    pub async fn fetch_messages(
        &self,
        thread_id: ThreadId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<MessagePage> {
        let mut path = format!("/messages?threadId={}", thread_id.0);
        if let Some(before) = before {
            path.push_str(&format!("&cursor={}", before.0));
        }
        if let Some(limit) = limit {
            path.push_str(&format!("&limit={limit}"));
        }
        let page: MessagePage = self.http_get(&path).await?;
        {
            let mut timelines = self.timelines.lock().await;
            timelines
                .entry(thread_id)
                .or_insert_with(|| Timeline::new(thread_id))
                .merge_page(&page.messages, page.has_more);
        }
        let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
        Ok(page)
    }

    pub async fn search_messages(
        &self,
        thread_id: ThreadId,
        query: &str,
    ) -> Result<Vec<MessagePayload>> {
        let body: MessageListBody = self
            .http_get_with(
                "/search",
                &[
                    ("threadId", thread_id.0.to_string()),
                    ("q", query.to_string()),
                ],
            )
            .await?;
        Ok(body.messages)
    }

    /// Cloned timeline view: confirmed rows oldest first, then pending
    /// echoes.
    pub async fn timeline_entries(&self, thread_id: ThreadId) -> Vec<TimelineEntry> {
        let timelines = self.timelines.lock().await;
        timelines
            .get(&thread_id)
            .map(|timeline| timeline.entries())
            .unwrap_or_default()
    }

    pub async fn has_older_messages(&self, thread_id: ThreadId) -> bool {
        let timelines = self.timelines.lock().await;
        timelines
            .get(&thread_id)
            .map(|timeline| timeline.has_more())
            .unwrap_or(false)
    }

    /// Marks the thread currently on screen. Focusing acks whatever is
    /// already loaded, and rows arriving over the socket for the focused
    /// thread are acked automatically.
    pub async fn set_focused_thread(&self, thread_id: Option<ThreadId>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.focused_thread = thread_id;
        }
        if let Some(thread_id) = thread_id {
            let newest = {
                let timelines = self.timelines.lock().await;
                timelines
                    .get(&thread_id)
                    .and_then(|timeline| timeline.newest_message_id())
            };
            if let Some(newest) = newest {
                self.mark_read(thread_id, newest).await?;
            }
        }
        Ok(())
    }

    // ---- attachments ----

    pub async fn request_download(&self, attachment_id: AttachmentId) -> Result<DownloadGrant> {
        self.action(&ActionRequest::FileGetDownloadUrl { attachment_id })
            .await
    }

    /// Mints a replacement upload slot on one of the caller's own
    /// messages, for bytes whose original grant expired unused.
    pub async fn request_upload(
        &self,
        message_id: MessageId,
        draft: AttachmentDraft,
    ) -> Result<UploadGrant> {
        self.action(&ActionRequest::FileRequestUpload {
            message_id,
            file_name: draft.file_name,
            file_type: draft.file_type,
            size_bytes: draft.size_bytes,
        })
        .await
    }

    /// Pushes the bytes for one freshly minted upload grant.
    pub async fn upload_attachment(&self, grant: &UploadGrant, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .put(grant.upload_url.as_str())
            .body(bytes)
            .send()
            .await
            .context("upload request failed")?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }

    pub async fn download_attachment(&self, attachment_id: AttachmentId) -> Result<Vec<u8>> {
        let grant = self.request_download(attachment_id).await?;
        let response = self
            .http
            .get(grant.download_url.as_str())
            .send()
            .await
            .context("download request failed")?;
        let status = response.status();
        if !status.is_success() {
            return match response.json::<ErrorBody>().await {
                Ok(body) => Err(ApiException::new(body.error.code, body.error.message).into()),
                Err(_) => Err(anyhow!("download failed with http status {status}")),
            };
        }
        Ok(response
            .bytes()
            .await
            .context("download stream failed")?
            .to_vec())
    }

    // ---- presence and typing ----

    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        status_message: Option<String>,
    ) -> Result<PresenceSnapshot> {
        let body: PresenceBody = self
            .action(&ActionRequest::PresenceUpdate {
                status,
                status_message,
            })
            .await?;
        Ok(body.presence)
    }

    pub async fn presence_of(&self, user_id: UserId) -> Result<PresenceSnapshot> {
        self.http_get(&format!("/presence?userId={}", user_id.0))
            .await
    }

    /// Pushes a typing signal over the socket. Requires a live feed.
    pub async fn send_typing(&self, thread_id: ThreadId, is_typing: bool) -> Result<()> {
        let signal = ClientSignal::Typing {
            thread_id,
            is_typing,
        };
        let text = serde_json::to_string(&signal)?;
        let mut guard = self.ws_sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("event feed not connected"))?;
        sink.send(WsMessage::Text(text))
            .await
            .context("typing signal failed")?;
        Ok(())
    }

    /// Who is typing in this thread right now, local expiry applied.
    pub async fn typists_in(&self, thread_id: ThreadId) -> Vec<UserId> {
        let mut typing = self.typing.lock().await;
        typing.typists_in(thread_id, Instant::now())
    }

    // ---- directory and account ----

    pub async fn search_directory(
        &self,
        query: &str,
        include_patients: bool,
    ) -> Result<Vec<UserSummary>> {
        let body: DirectoryBody = self
            .http_get_with(
                "/directory",
                &[
                    ("q", query.to_string()),
                    ("includePatients", include_patients.to_string()),
                ],
            )
            .await?;
        Ok(body.users)
    }

    pub async fn toggle_block(&self, target_id: UserId) -> Result<bool> {
        let body: BlockedBody = self
            .action(&ActionRequest::UserBlockToggle { target_id })
            .await?;
        Ok(body.blocked)
    }

    pub async fn report_user(&self, target_id: UserId, reason: &str) -> Result<ReportId> {
        let body: ReportedBody = self
            .action(&ActionRequest::UserReport {
                target_id,
                reason: reason.to_string(),
            })
            .await?;
        Ok(body.report_id)
    }

    pub async fn update_settings(&self, accepts_new_chats: bool) -> Result<()> {
        self.post_action(&ActionRequest::SettingsUpdate { accepts_new_chats })
            .await?;
        Ok(())
    }

    pub async fn list_quick_replies(&self) -> Result<Vec<QuickReplySummary>> {
        let body: QuickReplyListBody = self.http_get("/quickReplies").await?;
        Ok(body.quick_replies)
    }

    pub async fn create_quick_reply(&self, label: &str, body: &str) -> Result<QuickReplySummary> {
        let reply: QuickReplyBody = self
            .action(&ActionRequest::QuickReplyCreate {
                label: label.to_string(),
                body: body.to_string(),
            })
            .await?;
        Ok(reply.quick_reply)
    }

    pub async fn update_quick_reply(
        &self,
        quick_reply_id: QuickReplyId,
        label: &str,
        body: &str,
    ) -> Result<()> {
        self.post_action(&ActionRequest::QuickReplyUpdate {
            quick_reply_id,
            label: label.to_string(),
            body: body.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn delete_quick_reply(&self, quick_reply_id: QuickReplyId) -> Result<()> {
        self.post_action(&ActionRequest::QuickReplyDelete { quick_reply_id })
            .await?;
        Ok(())
    }

    // ---- internals ----

    async fn session(&self) -> Result<(String, UserId)> {
        let inner = self.inner.lock().await;
        let server_url = inner
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("not connected"))?;
        let user_id = inner.user_id.ok_or_else(|| anyhow!("not connected"))?;
        Ok((server_url, user_id))
    }

    async fn http_get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!("{server_url}{path_and_query}"))
            .header(USER_HEADER, user_id.0.to_string())
            .send()
            .await
            .context("request failed")?;
        read_json(response).await
    }

    async fn http_get_with<T, Q>(&self, path: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!("{server_url}{path}"))
            .query(query)
            .header(USER_HEADER, user_id.0.to_string())
            .send()
            .await
            .context("request failed")?;
        read_json(response).await
    }

    async fn post_action(&self, request: &ActionRequest) -> Result<serde_json::Value> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/actions"))
            .header(USER_HEADER, user_id.0.to_string())
            .json(request)
            .send()
            .await
            .context("action request failed")?;
        read_json(response).await
    }

    async fn action<T: DeserializeOwned>(&self, request: &ActionRequest) -> Result<T> {
        let value = self.post_action(request).await?;
        serde_json::from_value(value).context("malformed action response")
    }

    async fn send_draft(&self, thread_id: ThreadId, draft: OutboundDraft) -> Result<SendReceipt> {
        let temp_id = {
            let mut timelines = self.timelines.lock().await;
            timelines
                .entry(thread_id)
                .or_insert_with(|| Timeline::new(thread_id))
                .begin_send(draft.clone())
        };
        let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });

        let request = ActionRequest::MessageSend {
            thread_id,
            content: draft.content.clone(),
            reply_to_message_id: draft.reply_to_message_id,
            attachments: draft.attachments.clone(),
        };
        match self.action::<SendReceipt>(&request).await {
            Ok(receipt) => {
                {
                    let mut timelines = self.timelines.lock().await;
                    if let Some(timeline) = timelines.get_mut(&thread_id) {
                        timeline.confirm_send(temp_id, receipt.message.clone());
                    }
                }
                let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
                Ok(receipt)
            }
            Err(err) => {
                {
                    let mut timelines = self.timelines.lock().await;
                    if let Some(timeline) = timelines.get_mut(&thread_id) {
                        timeline.fail_send(temp_id);
                    }
                }
                let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
                Err(err)
            }
        }
    }

    async fn spawn_ws_events(self: &Arc<Self>, server_url: &str, user_id: UserId) -> Result<()> {
        let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ConnectError::UnsupportedScheme(server_url.to_string()).into());
        };
        let ws_url = format!("{ws_base}/ws?user_id={}", user_id.0);
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| ConnectError::Websocket(err.to_string()))?;
        let (ws_sink, mut ws_reader) = ws_stream.split();
        *self.ws_sink.lock().await = Some(ws_sink);
        self.inner.lock().await.ws_connected = true;
        info!(url = %ws_url, "event feed connected");

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.ingest_server_event(event).await,
                        Err(err) => {
                            warn!(error = %err, "dropping unreadable server event");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("event feed failed: {err}")));
                        break;
                    }
                }
            }
            *client.ws_sink.lock().await = None;
            client.inner.lock().await.ws_connected = false;
            let _ = client.events.send(ClientEvent::Disconnected);
        });
        Ok(())
    }

    async fn ingest_server_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::ThreadUpdated { thread_id } => {
                let _ = self.events.send(ClientEvent::ThreadsChanged {
                    thread_id: *thread_id,
                });
            }
            ServerEvent::MessageReceived { message } => {
                let thread_id = message.thread_id;
                let newest = message.message_id;
                {
                    let mut timelines = self.timelines.lock().await;
                    timelines
                        .entry(thread_id)
                        .or_insert_with(|| Timeline::new(thread_id))
                        .apply_event(&event);
                }
                let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
                let focused = self.inner.lock().await.focused_thread == Some(thread_id);
                if focused {
                    if let Err(err) = self.mark_read(thread_id, newest).await {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("read ack failed: {err}")));
                    }
                }
            }
            ServerEvent::MessageEdited { message } => {
                self.apply_to_timeline(message.thread_id, &event).await;
            }
            ServerEvent::MessageDeleted { thread_id, .. } => {
                self.apply_to_timeline(*thread_id, &event).await;
            }
            ServerEvent::Typing {
                thread_id,
                user_id,
                is_typing,
            } => {
                {
                    let mut typing = self.typing.lock().await;
                    typing.apply(*thread_id, *user_id, *is_typing, Instant::now());
                }
                let _ = self.events.send(ClientEvent::TypingChanged {
                    thread_id: *thread_id,
                });
            }
            ServerEvent::PresenceChanged { presence } => {
                let _ = self.events.send(ClientEvent::PresenceChanged {
                    presence: presence.clone(),
                });
            }
            ServerEvent::Error(error) => {
                let _ = self.events.send(ClientEvent::ServerError(error.clone()));
            }
        }
    }

    async fn apply_to_timeline(&self, thread_id: ThreadId, event: &ServerEvent) {
        let changed = {
            let mut timelines = self.timelines.lock().await;
            timelines
                .get_mut(&thread_id)
                .map(|timeline| timeline.apply_event(event))
                .unwrap_or(false)
        };
        if changed {
            let _ = self.events.send(ClientEvent::TimelineChanged { thread_id });
        }
    }
}

/// Decodes a response body, converting the server's `{"ok": false,
/// "error": ...}` shape into a typed [`ApiException`] on non-success
/// statuses.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .context("malformed server response");
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(ApiException::new(body.error.code, body.error.message).into()),
        Err(_) => Err(anyhow!("request failed with http status {status}")),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ThreadListBody {
    threads: Vec<ThreadSummary>,
}

#[derive(Debug, Deserialize)]
struct MessageListBody {
    messages: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct DirectoryBody {
    users: Vec<UserSummary>,
}

#[derive(Debug, Deserialize)]
struct QuickReplyListBody {
    quick_replies: Vec<QuickReplySummary>,
}

#[derive(Debug, Deserialize)]
struct OpenDirectBody {
    thread_id: ThreadId,
    created: bool,
}

#[derive(Debug, Deserialize)]
struct CreateGroupBody {
    thread_id: ThreadId,
}

#[derive(Debug, Deserialize)]
struct MutedBody {
    muted: bool,
}

#[derive(Debug, Deserialize)]
struct PinnedBody {
    pinned: bool,
}

#[derive(Debug, Deserialize)]
struct EditedBody {
    message: MessagePayload,
}

#[derive(Debug, Deserialize)]
struct BlockedBody {
    blocked: bool,
}

#[derive(Debug, Deserialize)]
struct ReportedBody {
    report_id: ReportId,
}

#[derive(Debug, Deserialize)]
struct PresenceBody {
    presence: PresenceSnapshot,
}

#[derive(Debug, Deserialize)]
struct QuickReplyBody {
    quick_reply: QuickReplySummary,
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
