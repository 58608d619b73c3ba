use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentId, MemberRole, MessageId, MessageKind, PresenceStatus, QuickReplyId, ThreadId,
        ThreadKind, UserId, UserKind,
    },
    error::ApiError,
};

/// Body of the single mutation endpoint. The `action` field selects the
/// operation; the remaining fields sit beside it in the same object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ActionRequest {
    #[serde(rename = "thread.openDirect")]
    ThreadOpenDirect { peer_id: UserId },
    #[serde(rename = "thread.createGroup")]
    ThreadCreateGroup {
        title: String,
        member_ids: Vec<UserId>,
    },
    #[serde(rename = "thread.leave")]
    ThreadLeave { thread_id: ThreadId },
    #[serde(rename = "thread.mute")]
    ThreadMute {
        thread_id: ThreadId,
        muted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
    #[serde(rename = "thread.togglePinned")]
    ThreadTogglePinned { thread_id: ThreadId },
    #[serde(rename = "member.setRole")]
    MemberSetRole {
        thread_id: ThreadId,
        target_id: UserId,
        role: MemberRole,
    },
    #[serde(rename = "member.remove")]
    MemberRemove {
        thread_id: ThreadId,
        target_id: UserId,
    },
    #[serde(rename = "message.send")]
    MessageSend {
        thread_id: ThreadId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_message_id: Option<MessageId>,
        #[serde(default)]
        attachments: Vec<AttachmentDraft>,
    },
    #[serde(rename = "message.edit")]
    MessageEdit {
        message_id: MessageId,
        content: String,
    },
    #[serde(rename = "message.delete")]
    MessageDelete { message_id: MessageId },
    #[serde(rename = "message.deleteForMe")]
    MessageDeleteForMe { message_id: MessageId },
    #[serde(rename = "message.togglePinned")]
    MessageTogglePinned { message_id: MessageId },
    #[serde(rename = "message.markRead")]
    MessageMarkRead {
        thread_id: ThreadId,
        message_id: MessageId,
    },
    #[serde(rename = "file.requestUpload")]
    FileRequestUpload {
        message_id: MessageId,
        file_name: String,
        file_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<i64>,
    },
    #[serde(rename = "file.getDownloadUrl")]
    FileGetDownloadUrl { attachment_id: AttachmentId },
    #[serde(rename = "user.blockToggle")]
    UserBlockToggle { target_id: UserId },
    #[serde(rename = "user.report")]
    UserReport { target_id: UserId, reason: String },
    #[serde(rename = "settings.update")]
    SettingsUpdate { accepts_new_chats: bool },
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },
    #[serde(rename = "quickReply.create")]
    QuickReplyCreate { label: String, body: String },
    #[serde(rename = "quickReply.update")]
    QuickReplyUpdate {
        quick_reply_id: QuickReplyId,
        label: String,
        body: String,
    },
    #[serde(rename = "quickReply.delete")]
    QuickReplyDelete { quick_reply_id: QuickReplyId },
}

/// Attachment metadata declared at send time, before any bytes move.
/// The size is what the client claims; a missing size passes the limit
/// check unexamined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDraft {
    pub file_name: String,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub kind: UserKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    /// Group title, or the peer's display name for direct threads.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<UserSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub muted: bool,
    pub pinned: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub display_name: String,
    pub kind: UserKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    /// Nulled once the message is deleted; the tombstone keeps its slot.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub file_name: String,
    pub file_type: String,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One page of history, oldest first. `has_more` is true exactly when the
/// page came back full, so an exactly-exhausted log costs one extra fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadInfoResponse {
    pub thread: ThreadSummary,
    pub members: Vec<MemberSummary>,
    pub recent_attachments: Vec<AttachmentPayload>,
    pub pinned_messages: Vec<MessagePayload>,
}

/// Everything the caller needs to push bytes for one pending attachment.
/// The url already carries the token; both are returned so callers that
/// build their own request can still do so.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadGrant {
    pub attachment_id: AttachmentId,
    pub storage_path: String,
    pub upload_url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message: MessagePayload,
    #[serde(default)]
    pub upload_grants: Vec<UploadGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadGrant {
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReplySummary {
    pub quick_reply_id: QuickReplyId,
    pub label: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

/// Signals a connected client may push over the WebSocket. Everything else
/// goes through HTTP; typing never touches the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientSignal {
    Typing {
        thread_id: ThreadId,
        is_typing: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Membership or metadata changed; clients refetch their thread list.
    ThreadUpdated { thread_id: ThreadId },
    MessageReceived { message: MessagePayload },
    MessageEdited { message: MessagePayload },
    MessageDeleted {
        thread_id: ThreadId,
        message_id: MessageId,
    },
    /// Relayed to the other members only; receivers expire a typing state
    /// themselves after three seconds without a renewal.
    Typing {
        thread_id: ThreadId,
        user_id: UserId,
        is_typing: bool,
    },
    PresenceChanged { presence: PresenceSnapshot },
    Error(ApiError),
}
