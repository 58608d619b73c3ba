use std::collections::HashMap;

use shared::{
    domain::{MessageId, MessageKind, ThreadId, ThreadKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentDraft, AttachmentPayload, MessagePage, MessagePayload, SendReceipt, ServerEvent,
    },
};
use storage::{StoredAttachment, StoredMessage};
use tracing::info;

use crate::{
    attachments::{register_attachment, validate_draft},
    display_name_of, ensure_active_membership, internal, ApiContext, Envelope,
};

const MAX_CONTENT_CHARS: usize = 4000;
const MAX_ATTACHMENTS_PER_SEND: usize = 10;
const DEFAULT_PAGE_SIZE: u32 = 40;
const MAX_PAGE_SIZE: u32 = 80;
const SEARCH_LIMIT: u32 = 50;

/// Appends a message and registers its attachments. Attachment rows and
/// their upload grants are created one by one after the message row; a
/// failure partway leaves the earlier ones standing, so clients retry the
/// send rather than trusting a rollback.
pub async fn send_message(
    ctx: &ApiContext,
    sender: UserId,
    thread_id: ThreadId,
    content: Option<&str>,
    reply_to: Option<MessageId>,
    drafts: &[AttachmentDraft],
) -> Result<(SendReceipt, Vec<Envelope>), ApiError> {
    ensure_active_membership(ctx, thread_id, sender).await?;
    ensure_direct_peer_not_blocked(ctx, thread_id, sender).await?;

    let content = content.map(str::trim).filter(|text| !text.is_empty());
    if content.is_none() && drafts.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message needs text or at least one attachment",
        ));
    }
    if let Some(text) = content {
        if text.chars().count() > MAX_CONTENT_CHARS {
            return Err(ApiError::new(ErrorCode::Validation, "message is too long"));
        }
    }
    if drafts.len() > MAX_ATTACHMENTS_PER_SEND {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "too many attachments in one message",
        ));
    }
    for draft in drafts {
        validate_draft(draft)?;
    }

    if let Some(reply_id) = reply_to {
        let target = ctx
            .storage
            .get_message(reply_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "reply target not found"))?;
        if target.thread_id != thread_id {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "reply target is in another thread",
            ));
        }
    }

    let kind = infer_kind(drafts);
    let message = ctx
        .storage
        .insert_message(thread_id, sender, kind, content, reply_to)
        .await
        .map_err(internal)?;

    let mut stored_attachments = Vec::with_capacity(drafts.len());
    let mut upload_grants = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let (attachment, grant) =
            register_attachment(ctx, sender, thread_id, message.message_id, draft).await?;
        upload_grants.push(grant);
        stored_attachments.push(attachment);
    }
    if !stored_attachments.is_empty() {
        info!(
            "message {} carries {} attachment(s)",
            message.message_id.0,
            stored_attachments.len()
        );
    }

    let sender_name = display_name_of(ctx, sender).await?;
    let payload = message_payload(
        message,
        stored_attachments.into_iter().map(attachment_payload).collect(),
        Some(sender_name),
    );

    let recipients = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    let envelopes = vec![Envelope::to(
        recipients,
        ServerEvent::MessageReceived {
            message: payload.clone(),
        },
    )];
    Ok((
        SendReceipt {
            message: payload,
            upload_grants,
        },
        envelopes,
    ))
}

pub async fn edit_message(
    ctx: &ApiContext,
    editor: UserId,
    message_id: MessageId,
    new_content: &str,
) -> Result<(MessagePayload, Vec<Envelope>), ApiError> {
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.is_deleted {
        return Err(ApiError::new(ErrorCode::NotFound, "message not found"));
    }
    if message.kind == MessageKind::System {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "system messages cannot be edited",
        ));
    }
    if message.sender_id != editor {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can edit a message",
        ));
    }
    ensure_active_membership(ctx, message.thread_id, editor).await?;

    let new_content = new_content.trim();
    if new_content.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message text is required"));
    }
    if new_content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "message is too long"));
    }

    let updated = ctx
        .storage
        .update_message_content(message_id, new_content)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "message not found"));
    }

    let refreshed = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    let attachments = ctx
        .storage
        .attachments_for_messages(&[message_id])
        .await
        .map_err(internal)?
        .into_iter()
        .map(attachment_payload)
        .collect();
    let sender_name = display_name_of(ctx, refreshed.sender_id).await?;
    let thread_id = refreshed.thread_id;
    let payload = message_payload(refreshed, attachments, Some(sender_name));

    let recipients = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    let envelopes = vec![Envelope::to(
        recipients,
        ServerEvent::MessageEdited {
            message: payload.clone(),
        },
    )];
    Ok((payload, envelopes))
}

/// Deletes for everyone. The row stays as a tombstone so replies keep
/// their anchor; deleting twice is a quiet no-op.
pub async fn delete_message(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
) -> Result<Vec<Envelope>, ApiError> {
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.kind == MessageKind::System {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "system messages cannot be deleted",
        ));
    }
    if message.sender_id != actor {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can delete a message",
        ));
    }
    ensure_active_membership(ctx, message.thread_id, actor).await?;

    let deleted = ctx
        .storage
        .tombstone_message(message_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Ok(Vec::new());
    }

    let recipients = ctx
        .storage
        .active_member_ids(message.thread_id)
        .await
        .map_err(internal)?;
    Ok(vec![Envelope::to(
        recipients,
        ServerEvent::MessageDeleted {
            thread_id: message.thread_id,
            message_id,
        },
    )])
}

/// Hides a message from the caller only. Nobody else sees a change, so no
/// events go out.
pub async fn delete_message_for_me(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    ensure_active_membership(ctx, message.thread_id, user_id).await?;
    ctx.storage
        .hide_message_for_user(user_id, message_id)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn toggle_message_pin(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<bool, ApiError> {
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .filter(|m| !m.is_deleted)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    ensure_active_membership(ctx, message.thread_id, user_id).await?;
    ctx.storage
        .toggle_pinned_message(user_id, message.thread_id, message_id)
        .await
        .map_err(internal)
}

/// Moves the caller's read cursor up to the given message. Stale acks from
/// old pages land behind the cursor and change nothing.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    thread_id: ThreadId,
    message_id: MessageId,
) -> Result<Vec<Envelope>, ApiError> {
    ensure_active_membership(ctx, thread_id, user_id).await?;
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.thread_id != thread_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message does not belong to this thread",
        ));
    }
    let moved = ctx
        .storage
        .advance_read_cursor(thread_id, user_id, message_id)
        .await
        .map_err(internal)?;
    if moved {
        Ok(vec![Envelope::to(
            vec![user_id],
            ServerEvent::ThreadUpdated { thread_id },
        )])
    } else {
        Ok(Vec::new())
    }
}

/// One page of history, oldest first. Reading a page counts as reading:
/// the caller's cursor advances to the newest row returned, which makes
/// re-fetching an old page harmless.
pub async fn fetch_messages(
    ctx: &ApiContext,
    viewer: UserId,
    thread_id: ThreadId,
    before: Option<MessageId>,
    limit: Option<u32>,
) -> Result<MessagePage, ApiError> {
    ensure_active_membership(ctx, thread_id, viewer).await?;
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let rows = ctx
        .storage
        .list_messages(thread_id, viewer, limit, before)
        .await
        .map_err(internal)?;
    let has_more = rows.len() as u32 == limit;

    if let Some(newest) = rows.last() {
        ctx.storage
            .advance_read_cursor(thread_id, viewer, newest.message_id)
            .await
            .map_err(internal)?;
    }

    let messages = payloads_for(ctx, rows).await?;
    Ok(MessagePage { messages, has_more })
}

pub async fn search_messages(
    ctx: &ApiContext,
    viewer: UserId,
    thread_id: ThreadId,
    query: &str,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_active_membership(ctx, thread_id, viewer).await?;
    let query = query.trim();
    if query.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "search query is required"));
    }
    let rows = ctx
        .storage
        .search_messages(thread_id, viewer, query, SEARCH_LIMIT)
        .await
        .map_err(internal)?;
    payloads_for(ctx, rows).await
}

async fn ensure_direct_peer_not_blocked(
    ctx: &ApiContext,
    thread_id: ThreadId,
    sender: UserId,
) -> Result<(), ApiError> {
    let thread = ctx
        .storage
        .get_thread(thread_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "thread not found"))?;
    if thread.kind != ThreadKind::Direct {
        return Ok(());
    }
    let members = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    for member in members {
        if member != sender
            && ctx
                .storage
                .is_blocked_between(sender, member)
                .await
                .map_err(internal)?
        {
            return Err(ApiError::new(
                ErrorCode::Blocked,
                "messaging is blocked between these accounts",
            ));
        }
    }
    Ok(())
}

/// The first attachment decides the message kind. Mixed bundles read as
/// whatever leads; text-only sends stay Text.
fn infer_kind(drafts: &[AttachmentDraft]) -> MessageKind {
    match drafts.first() {
        Some(first) if first.file_type.trim().starts_with("image/") => MessageKind::Image,
        Some(_) => MessageKind::File,
        None => MessageKind::Text,
    }
}

/// Builds wire payloads for a batch of rows with one attachment query and
/// a per-sender name cache.
pub(crate) async fn payloads_for(
    ctx: &ApiContext,
    rows: Vec<StoredMessage>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let message_ids: Vec<MessageId> = rows.iter().map(|row| row.message_id).collect();
    let mut by_message: HashMap<i64, Vec<AttachmentPayload>> = HashMap::new();
    for attachment in ctx
        .storage
        .attachments_for_messages(&message_ids)
        .await
        .map_err(internal)?
    {
        by_message
            .entry(attachment.message_id.0)
            .or_default()
            .push(attachment_payload(attachment));
    }

    let mut names: HashMap<UserId, String> = HashMap::new();
    let mut payloads = Vec::with_capacity(rows.len());
    for row in rows {
        let sender_name = match names.get(&row.sender_id) {
            Some(name) => name.clone(),
            None => {
                let name = display_name_of(ctx, row.sender_id).await?;
                names.insert(row.sender_id, name.clone());
                name
            }
        };
        let attachments = by_message.remove(&row.message_id.0).unwrap_or_default();
        payloads.push(message_payload(row, attachments, Some(sender_name)));
    }
    Ok(payloads)
}

pub(crate) fn message_payload(
    row: StoredMessage,
    attachments: Vec<AttachmentPayload>,
    sender_name: Option<String>,
) -> MessagePayload {
    MessagePayload {
        message_id: row.message_id,
        thread_id: row.thread_id,
        sender_id: row.sender_id,
        sender_name,
        kind: row.kind,
        content: row.content,
        reply_to_message_id: row.reply_to_message_id,
        attachments,
        is_edited: row.is_edited,
        edited_at: row.edited_at,
        is_deleted: row.is_deleted,
        created_at: row.created_at,
    }
}

pub(crate) fn attachment_payload(row: StoredAttachment) -> AttachmentPayload {
    AttachmentPayload {
        attachment_id: row.attachment_id,
        message_id: row.message_id,
        file_name: row.file_name,
        file_type: row.file_type,
        size_bytes: row.size_bytes,
        created_at: row.created_at,
    }
}
