//! Operation layer between the HTTP surface and storage. Every function
//! takes the acting user explicitly, authorizes against membership rows,
//! and returns either a response payload or an [`ApiError`]. Mutations
//! that other users should hear about also return [`Envelope`]s for the
//! transport to fan out.

use grants::GrantConfig;
use shared::{
    domain::{ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ServerEvent, UserSummary},
};
use storage::{Storage, StoredMembership, StoredUser};

pub mod account;
pub mod attachments;
pub mod directory;
pub mod messages;
pub mod presence;
pub mod threads;

pub use account::{
    create_quick_reply, delete_quick_reply, list_quick_replies, report_user, toggle_block,
    update_quick_reply, update_settings,
};
pub use attachments::{request_download, request_upload};
pub use directory::search_directory;
pub use messages::{
    delete_message, delete_message_for_me, edit_message, fetch_messages, mark_read,
    search_messages, send_message, toggle_message_pin,
};
pub use presence::{presence_snapshot, typing_recipients, update_presence};
pub use threads::{
    create_group_thread, leave_thread, list_threads, open_direct_thread, remove_member,
    set_member_role, set_thread_muted, thread_info, toggle_thread_pin,
};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub grants: GrantConfig,
    pub public_base_url: String,
}

/// A server event plus the users it is addressed to. The transport only
/// delivers it to connections belonging to those users.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub recipients: Vec<UserId>,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn to(recipients: Vec<UserId>, event: ServerEvent) -> Self {
        Self { recipients, event }
    }

    pub fn includes(&self, user_id: UserId) -> bool {
        self.recipients.contains(&user_id)
    }
}

/// Resolves the caller's membership row and rejects callers that never
/// joined or already left. A missing thread reads as NotFound so callers
/// can tell a bad id from a permission problem.
pub(crate) async fn ensure_active_membership(
    ctx: &ApiContext,
    thread_id: ThreadId,
    user_id: UserId,
) -> Result<StoredMembership, ApiError> {
    let membership = ctx
        .storage
        .membership(thread_id, user_id)
        .await
        .map_err(internal)?;
    if let Some(row) = membership {
        if row.left_at.is_none() {
            return Ok(row);
        }
    } else if ctx
        .storage
        .get_thread(thread_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(ErrorCode::NotFound, "thread not found"));
    }
    Err(ApiError::new(
        ErrorCode::Forbidden,
        "not an active member of this thread",
    ))
}

pub(crate) async fn display_name_of(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    Ok(ctx
        .storage
        .get_user(user_id)
        .await
        .map_err(internal)?
        .map(|user| user.display_name)
        .unwrap_or_else(|| format!("user {}", user_id.0)))
}

pub(crate) fn user_summary(user: StoredUser) -> UserSummary {
    UserSummary {
        user_id: user.user_id,
        display_name: user.display_name,
        kind: user.kind,
        avatar_url: user.avatar_url,
    }
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Upstream, err.to_string())
}
