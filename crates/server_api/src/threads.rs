use chrono::{DateTime, Utc};
use shared::{
    domain::{MemberRole, MessageKind, ThreadId, ThreadKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MemberSummary, MessagePayload, ServerEvent, ThreadInfoResponse, ThreadSummary},
};
use storage::{StoredMember, StoredMembership, StoredMessage, StoredThreadOverview};
use tracing::info;

use crate::{
    display_name_of, ensure_active_membership, internal,
    messages::{message_payload, payloads_for},
    user_summary, ApiContext, Envelope,
};

const MAX_TITLE_CHARS: usize = 80;
const PREVIEW_CHARS: usize = 120;
const RECENT_ATTACHMENTS_LIMIT: u32 = 30;
const PINNED_MESSAGES_LIMIT: u32 = 20;

/// Finds or creates the direct thread between the caller and a peer.
/// Blocks win over everything; a closed-to-new-chats peer still accepts
/// callers they already share a thread with.
pub async fn open_direct_thread(
    ctx: &ApiContext,
    caller: UserId,
    peer_id: UserId,
) -> Result<(ThreadId, bool, Vec<Envelope>), ApiError> {
    if peer_id == caller {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a conversation with yourself",
        ));
    }
    let peer = ctx
        .storage
        .get_user(peer_id)
        .await
        .map_err(internal)?
        .filter(|user| user.is_active)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;

    if ctx
        .storage
        .is_blocked_between(caller, peer_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::Blocked,
            "messaging is blocked between these accounts",
        ));
    }
    if !ctx
        .storage
        .accepts_new_chats(peer_id)
        .await
        .map_err(internal)?
        && !ctx
            .storage
            .shares_active_thread(caller, peer_id)
            .await
            .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::NotAccepting,
            "this user is not accepting new conversations",
        ));
    }

    let (thread_id, created) = ctx
        .storage
        .open_direct_thread(caller, peer_id)
        .await
        .map_err(internal)?;
    if created {
        info!(
            "opened direct thread {} between {} and {}",
            thread_id.0, caller.0, peer.user_id.0
        );
    }

    let envelopes = vec![Envelope::to(
        vec![caller, peer_id],
        ServerEvent::ThreadUpdated { thread_id },
    )];
    Ok((thread_id, created, envelopes))
}

pub async fn create_group_thread(
    ctx: &ApiContext,
    creator: UserId,
    title: &str,
    member_ids: &[UserId],
) -> Result<(ThreadId, Vec<Envelope>), ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "group title is required"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "group title is too long"));
    }

    let mut others: Vec<UserId> = Vec::new();
    for member in member_ids {
        if *member != creator && !others.contains(member) {
            others.push(*member);
        }
    }
    if others.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a group needs at least two members",
        ));
    }
    for member in &others {
        ctx.storage
            .get_user(*member)
            .await
            .map_err(internal)?
            .filter(|user| user.is_active)
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    }

    let thread_id = ctx
        .storage
        .create_group_thread(title, creator, &others)
        .await
        .map_err(internal)?;
    info!("created group thread {} with {} members", thread_id.0, others.len() + 1);

    let creator_name = display_name_of(ctx, creator).await?;
    let system = post_system_message(
        ctx,
        thread_id,
        creator,
        &format!("{creator_name} created the group"),
    )
    .await?;

    let recipients = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    let envelopes = vec![
        Envelope::to(recipients.clone(), ServerEvent::MessageReceived { message: system }),
        Envelope::to(recipients, ServerEvent::ThreadUpdated { thread_id }),
    ];
    Ok((thread_id, envelopes))
}

/// Marks the caller as left. Group threads get a system message and, when
/// the owner walks out, the longest-standing admin (or member) takes over
/// so the group stays manageable.
pub async fn leave_thread(
    ctx: &ApiContext,
    user_id: UserId,
    thread_id: ThreadId,
) -> Result<Vec<Envelope>, ApiError> {
    let membership = ensure_active_membership(ctx, thread_id, user_id).await?;
    let thread = ctx
        .storage
        .get_thread(thread_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "thread not found"))?;

    ctx.storage
        .mark_left(thread_id, user_id)
        .await
        .map_err(internal)?;

    if thread.kind != ThreadKind::Group {
        return Ok(vec![Envelope::to(
            vec![user_id],
            ServerEvent::ThreadUpdated { thread_id },
        )]);
    }

    let remaining = ctx.storage.list_members(thread_id).await.map_err(internal)?;
    if membership.role == MemberRole::Owner {
        if let Some(successor) = pick_successor(&remaining) {
            ctx.storage
                .set_member_role(thread_id, successor, MemberRole::Owner)
                .await
                .map_err(internal)?;
        }
    }

    let name = display_name_of(ctx, user_id).await?;
    let system =
        post_system_message(ctx, thread_id, user_id, &format!("{name} left the group")).await?;

    let remaining_ids: Vec<UserId> = remaining.iter().map(|m| m.user_id).collect();
    let mut updated_ids = remaining_ids.clone();
    updated_ids.push(user_id);
    Ok(vec![
        Envelope::to(remaining_ids, ServerEvent::MessageReceived { message: system }),
        Envelope::to(updated_ids, ServerEvent::ThreadUpdated { thread_id }),
    ])
}

/// Muting only affects what notification surfaces do with new messages;
/// delivery is untouched. An expiry in the past simply reads as unmuted.
pub async fn set_thread_muted(
    ctx: &ApiContext,
    user_id: UserId,
    thread_id: ThreadId,
    muted: bool,
    until: Option<DateTime<Utc>>,
) -> Result<Vec<Envelope>, ApiError> {
    ensure_active_membership(ctx, thread_id, user_id).await?;
    let until = if muted { until } else { None };
    ctx.storage
        .set_muted(thread_id, user_id, muted, until)
        .await
        .map_err(internal)?;
    Ok(vec![Envelope::to(
        vec![user_id],
        ServerEvent::ThreadUpdated { thread_id },
    )])
}

pub async fn toggle_thread_pin(
    ctx: &ApiContext,
    user_id: UserId,
    thread_id: ThreadId,
) -> Result<(bool, Vec<Envelope>), ApiError> {
    ensure_active_membership(ctx, thread_id, user_id).await?;
    let pinned = ctx
        .storage
        .toggle_thread_pinned(thread_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(ErrorCode::Forbidden, "not an active member of this thread")
        })?;
    Ok((
        pinned,
        vec![Envelope::to(
            vec![user_id],
            ServerEvent::ThreadUpdated { thread_id },
        )],
    ))
}

pub async fn set_member_role(
    ctx: &ApiContext,
    actor: UserId,
    thread_id: ThreadId,
    target: UserId,
    role: MemberRole,
) -> Result<Vec<Envelope>, ApiError> {
    if target == actor {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot change your own role",
        ));
    }
    let (actor_membership, target_membership) =
        managed_pair(ctx, thread_id, actor, target).await?;
    if role == MemberRole::Owner && actor_membership.role != MemberRole::Owner {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the owner can transfer ownership",
        ));
    }
    if target_membership.role == role {
        return Ok(Vec::new());
    }

    ctx.storage
        .set_member_role(thread_id, target, role)
        .await
        .map_err(internal)?;
    if role == MemberRole::Owner {
        ctx.storage
            .set_member_role(thread_id, actor, MemberRole::Admin)
            .await
            .map_err(internal)?;
    }

    let actor_name = display_name_of(ctx, actor).await?;
    let target_name = display_name_of(ctx, target).await?;
    let text = match role {
        MemberRole::Owner => format!("{actor_name} made {target_name} the owner"),
        MemberRole::Admin => format!("{actor_name} made {target_name} an admin"),
        MemberRole::Member => format!("{actor_name} made {target_name} a member"),
    };
    let system = post_system_message(ctx, thread_id, actor, &text).await?;

    let recipients = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    Ok(vec![
        Envelope::to(recipients.clone(), ServerEvent::MessageReceived { message: system }),
        Envelope::to(recipients, ServerEvent::ThreadUpdated { thread_id }),
    ])
}

pub async fn remove_member(
    ctx: &ApiContext,
    actor: UserId,
    thread_id: ThreadId,
    target: UserId,
) -> Result<Vec<Envelope>, ApiError> {
    if target == actor {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "leave the thread instead of removing yourself",
        ));
    }
    managed_pair(ctx, thread_id, actor, target).await?;

    ctx.storage
        .mark_left(thread_id, target)
        .await
        .map_err(internal)?;

    let actor_name = display_name_of(ctx, actor).await?;
    let target_name = display_name_of(ctx, target).await?;
    let system = post_system_message(
        ctx,
        thread_id,
        actor,
        &format!("{actor_name} removed {target_name}"),
    )
    .await?;

    let remaining = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    let mut updated = remaining.clone();
    updated.push(target);
    Ok(vec![
        Envelope::to(remaining, ServerEvent::MessageReceived { message: system }),
        Envelope::to(updated, ServerEvent::ThreadUpdated { thread_id }),
    ])
}

/// Every active thread for the caller, most recent activity first.
pub async fn list_threads(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ThreadSummary>, ApiError> {
    let overviews = ctx
        .storage
        .list_threads_for_user(user_id)
        .await
        .map_err(internal)?;
    let mut summaries = Vec::with_capacity(overviews.len());
    for overview in overviews {
        summaries.push(summarize_overview(ctx, overview).await?);
    }
    summaries.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    Ok(summaries)
}

pub async fn thread_info(
    ctx: &ApiContext,
    user_id: UserId,
    thread_id: ThreadId,
) -> Result<ThreadInfoResponse, ApiError> {
    ensure_active_membership(ctx, thread_id, user_id).await?;

    let overview = ctx
        .storage
        .list_threads_for_user(user_id)
        .await
        .map_err(internal)?
        .into_iter()
        .find(|o| o.thread_id == thread_id)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "thread not found"))?;
    let thread = summarize_overview(ctx, overview).await?;

    let members = ctx
        .storage
        .list_members(thread_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|member| member_summary(thread_id, member))
        .collect();

    let recent_attachments = ctx
        .storage
        .list_recent_attachments(thread_id, user_id, RECENT_ATTACHMENTS_LIMIT)
        .await
        .map_err(internal)?
        .into_iter()
        .map(crate::messages::attachment_payload)
        .collect();

    let pinned_rows = ctx
        .storage
        .list_pinned_messages(user_id, thread_id, PINNED_MESSAGES_LIMIT)
        .await
        .map_err(internal)?;
    let pinned_messages = payloads_for(ctx, pinned_rows).await?;

    Ok(ThreadInfoResponse {
        thread,
        members,
        recent_attachments,
        pinned_messages,
    })
}

async fn post_system_message(
    ctx: &ApiContext,
    thread_id: ThreadId,
    actor: UserId,
    text: &str,
) -> Result<MessagePayload, ApiError> {
    let message = ctx
        .storage
        .insert_message(thread_id, actor, MessageKind::System, Some(text), None)
        .await
        .map_err(internal)?;
    let sender_name = display_name_of(ctx, actor).await?;
    Ok(message_payload(message, Vec::new(), Some(sender_name)))
}

/// Loads both memberships for a management action and applies the role
/// gate: the actor must hold a managing role and strictly outrank the
/// target. Group threads only.
async fn managed_pair(
    ctx: &ApiContext,
    thread_id: ThreadId,
    actor: UserId,
    target: UserId,
) -> Result<(StoredMembership, StoredMembership), ApiError> {
    let thread = ctx
        .storage
        .get_thread(thread_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "thread not found"))?;
    if thread.kind != ThreadKind::Group {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "member management only applies to group threads",
        ));
    }
    let actor_membership = ensure_active_membership(ctx, thread_id, actor).await?;
    let target_membership = ctx
        .storage
        .membership(thread_id, target)
        .await
        .map_err(internal)?
        .filter(|m| m.left_at.is_none())
        .ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, "user is not a member of this thread")
        })?;
    if !actor_membership.role.can_manage_members() {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only owners and admins can manage members",
        ));
    }
    if !actor_membership.role.outranks(target_membership.role) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "cannot manage a member of equal or higher rank",
        ));
    }
    Ok((actor_membership, target_membership))
}

fn pick_successor(members: &[StoredMember]) -> Option<UserId> {
    members
        .iter()
        .filter(|m| m.role == MemberRole::Admin)
        .min_by_key(|m| (m.joined_at, m.user_id.0))
        .or_else(|| {
            members
                .iter()
                .filter(|m| m.role == MemberRole::Member)
                .min_by_key(|m| (m.joined_at, m.user_id.0))
        })
        .map(|m| m.user_id)
}

async fn summarize_overview(
    ctx: &ApiContext,
    overview: StoredThreadOverview,
) -> Result<ThreadSummary, ApiError> {
    let (last_message_preview, last_message_at) = match overview.last_message_id {
        Some(id) => match ctx.storage.get_message(id).await.map_err(internal)? {
            Some(message) => (Some(preview_of(&message)), Some(message.created_at)),
            None => (None, None),
        },
        None => (None, None),
    };

    let muted = overview.muted
        && overview
            .muted_until
            .map(|until| until > Utc::now())
            .unwrap_or(true);
    let peer = overview.peer.map(user_summary);
    let title = match overview.kind {
        ThreadKind::Group => overview
            .title
            .clone()
            .unwrap_or_else(|| "Group".to_string()),
        ThreadKind::Direct => peer
            .as_ref()
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| "Conversation".to_string()),
    };

    Ok(ThreadSummary {
        thread_id: overview.thread_id,
        kind: overview.kind,
        title,
        peer,
        last_message_preview,
        last_message_at,
        unread_count: overview.unread_count,
        muted,
        pinned: overview.pinned,
        updated_at: overview.updated_at,
    })
}

/// Deleted and media messages get a label instead of text, so the thread
/// list never shows wiped or binary content.
fn preview_of(message: &StoredMessage) -> String {
    if message.is_deleted {
        return "Message deleted".to_string();
    }
    match message.kind {
        MessageKind::Image => "Photo".to_string(),
        MessageKind::File => "File".to_string(),
        MessageKind::Text | MessageKind::System => {
            let text = message.content.as_deref().unwrap_or_default();
            if text.chars().count() <= PREVIEW_CHARS {
                text.to_string()
            } else {
                text.chars().take(PREVIEW_CHARS).collect()
            }
        }
    }
}

fn sort_key(summary: &ThreadSummary) -> (DateTime<Utc>, i64) {
    let activity = summary
        .last_message_at
        .map(|at| at.max(summary.updated_at))
        .unwrap_or(summary.updated_at);
    (activity, summary.thread_id.0)
}

fn member_summary(thread_id: ThreadId, member: StoredMember) -> MemberSummary {
    MemberSummary {
        thread_id,
        user_id: member.user_id,
        display_name: member.display_name,
        kind: member.kind,
        avatar_url: member.avatar_url,
        role: member.role,
        joined_at: member.joined_at,
    }
}
