use grants::GrantError;
use shared::{
    domain::{AttachmentId, MessageId, MessageKind, ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AttachmentDraft, DownloadGrant, UploadGrant},
};
use storage::StoredAttachment;
use uuid::Uuid;

use crate::{ensure_active_membership, internal, ApiContext};

/// Hard cap on a single attachment. The size a client declares is checked
/// here; the blob endpoint enforces the same cap on the actual bytes.
pub const MAX_ATTACHMENT_BYTES: i64 = 15 * 1024 * 1024;

const MAX_FILENAME_BYTES: usize = 180;

/// Adds a pending attachment row to an existing message and mints an
/// upload grant for it. Only the sender may add files, and the declared
/// size passes the same gate as at send time.
pub async fn request_upload(
    ctx: &ApiContext,
    caller: UserId,
    message_id: MessageId,
    draft: &AttachmentDraft,
) -> Result<UploadGrant, ApiError> {
    validate_draft(draft)?;
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .filter(|m| !m.is_deleted)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.kind == MessageKind::System {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "system messages cannot carry attachments",
        ));
    }
    if message.sender_id != caller {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can add attachments",
        ));
    }
    ensure_active_membership(ctx, message.thread_id, caller).await?;

    let (_, grant) =
        register_attachment(ctx, caller, message.thread_id, message_id, draft).await?;
    Ok(grant)
}

/// Mints a short-lived download grant for one attachment. Membership of
/// the owning thread is the only gate; hiding a message for yourself does
/// not revoke the file.
pub async fn request_download(
    ctx: &ApiContext,
    user_id: UserId,
    attachment_id: AttachmentId,
) -> Result<DownloadGrant, ApiError> {
    let attachment = ctx
        .storage
        .get_attachment(attachment_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "attachment not found"))?;
    let message = ctx
        .storage
        .get_message(attachment.message_id)
        .await
        .map_err(internal)?
        .filter(|m| !m.is_deleted)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "attachment not found"))?;
    ensure_active_membership(ctx, message.thread_id, user_id).await?;

    let grant = grants::mint_download_grant(&ctx.grants, user_id, &attachment.storage_path)
        .map_err(|e| grant_failed(e.into()))?;
    Ok(DownloadGrant {
        download_url: blob_url(&ctx.public_base_url, &attachment.storage_path, &grant.token),
        expires_at: grant.expires_at,
    })
}

/// Inserts the pending metadata row and mints the matching upload grant.
/// The row exists before any bytes do; whether the caller ever uses the
/// grant is not tracked.
pub(crate) async fn register_attachment(
    ctx: &ApiContext,
    uploader: UserId,
    thread_id: ThreadId,
    message_id: MessageId,
    draft: &AttachmentDraft,
) -> Result<(StoredAttachment, UploadGrant), ApiError> {
    let file_name = draft.file_name.trim();
    let storage_path = format!(
        "{}/{}/{}_{}",
        thread_id.0,
        message_id.0,
        Uuid::new_v4().simple(),
        sanitize_file_name(file_name)
    );
    let attachment = ctx
        .storage
        .insert_attachment(
            message_id,
            file_name,
            draft.file_type.trim(),
            draft.size_bytes,
            &storage_path,
        )
        .await
        .map_err(internal)?;
    let grant = grants::mint_upload_grant(&ctx.grants, uploader, &storage_path)
        .map_err(|e| grant_failed(e.into()))?;
    let upload = UploadGrant {
        attachment_id: attachment.attachment_id,
        upload_url: blob_url(&ctx.public_base_url, &storage_path, &grant.token),
        storage_path,
        token: grant.token,
        expires_at: grant.expires_at,
    };
    Ok((attachment, upload))
}

pub(crate) fn validate_draft(draft: &AttachmentDraft) -> Result<(), ApiError> {
    let file_name = draft.file_name.trim();
    if file_name.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "attachment needs a file name",
        ));
    }
    if file_name.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::new(ErrorCode::Validation, "file name is too long"));
    }
    if file_name.contains('/') || file_name.contains('\\') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "file name must not contain path separators",
        ));
    }
    if draft.file_type.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "attachment needs a content type",
        ));
    }
    match draft.size_bytes {
        Some(size) if size < 0 => Err(ApiError::new(
            ErrorCode::Validation,
            "attachment size cannot be negative",
        )),
        Some(size) if size > MAX_ATTACHMENT_BYTES => Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            "attachment exceeds the 15 MiB limit",
        )),
        _ => Ok(()),
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn blob_url(base: &str, storage_path: &str, token: &str) -> String {
    format!(
        "{}/blobs/{}?grant={}",
        base.trim_end_matches('/'),
        storage_path,
        token
    )
}

pub(crate) fn grant_failed(err: GrantError) -> ApiError {
    ApiError::new(ErrorCode::Upstream, format!("grant signing failed: {err}"))
}
