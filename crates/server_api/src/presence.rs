use chrono::{Duration, Utc};
use shared::{
    domain::{PresenceStatus, ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{PresenceSnapshot, ServerEvent},
};

use crate::{ensure_active_membership, internal, ApiContext, Envelope};

/// A heartbeat older than this reads as offline no matter what the row
/// says. Clients that crash never report offline themselves.
const PRESENCE_STALE_AFTER_SECS: i64 = 300;

const MAX_STATUS_CHARS: usize = 140;

pub async fn update_presence(
    ctx: &ApiContext,
    user_id: UserId,
    status: PresenceStatus,
    status_message: Option<&str>,
) -> Result<(PresenceSnapshot, Vec<Envelope>), ApiError> {
    let status_message = status_message.map(str::trim).filter(|text| !text.is_empty());
    if let Some(text) = status_message {
        if text.chars().count() > MAX_STATUS_CHARS {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "status message is too long",
            ));
        }
    }

    ctx.storage
        .upsert_presence(user_id, status, status_message)
        .await
        .map_err(internal)?;

    let snapshot = PresenceSnapshot {
        user_id,
        status,
        status_message: status_message.map(str::to_string),
        last_seen_at: Some(Utc::now()),
    };
    let mut recipients = ctx
        .storage
        .shared_thread_user_ids(user_id)
        .await
        .map_err(internal)?;
    recipients.push(user_id);
    let envelopes = vec![Envelope::to(
        recipients,
        ServerEvent::PresenceChanged {
            presence: snapshot.clone(),
        },
    )];
    Ok((snapshot, envelopes))
}

/// What the caller may know about one user's presence. Strangers read as
/// offline rather than as an error, so the endpoint leaks nothing about
/// who exists or who is connected to whom.
pub async fn presence_snapshot(
    ctx: &ApiContext,
    caller: UserId,
    target: UserId,
) -> Result<PresenceSnapshot, ApiError> {
    if caller != target
        && !ctx
            .storage
            .shares_active_thread(caller, target)
            .await
            .map_err(internal)?
    {
        return Ok(offline_snapshot(target));
    }

    let Some(row) = ctx.storage.get_presence(target).await.map_err(internal)? else {
        return Ok(offline_snapshot(target));
    };

    let stale = Utc::now().signed_duration_since(row.last_seen_at)
        > Duration::seconds(PRESENCE_STALE_AFTER_SECS);
    let status = if stale && row.status != PresenceStatus::Offline {
        PresenceStatus::Offline
    } else {
        row.status
    };
    Ok(PresenceSnapshot {
        user_id: target,
        status,
        status_message: row.status_message,
        last_seen_at: Some(row.last_seen_at),
    })
}

/// Everyone who should see the caller's typing signal. Typing is a pure
/// relay; nothing is stored and receivers expire the flag on their own.
pub async fn typing_recipients(
    ctx: &ApiContext,
    typist: UserId,
    thread_id: ThreadId,
) -> Result<Vec<UserId>, ApiError> {
    ensure_active_membership(ctx, thread_id, typist).await?;
    let members = ctx
        .storage
        .active_member_ids(thread_id)
        .await
        .map_err(internal)?;
    Ok(members.into_iter().filter(|id| *id != typist).collect())
}

fn offline_snapshot(user_id: UserId) -> PresenceSnapshot {
    PresenceSnapshot {
        user_id,
        status: PresenceStatus::Offline,
        status_message: None,
        last_seen_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::open_direct_thread;
    use grants::GrantConfig;
    use shared::domain::UserKind;
    use storage::Storage;

    async fn setup() -> (ApiContext, UserId, UserId) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext {
            storage,
            grants: GrantConfig::default(),
            public_base_url: "http://127.0.0.1:8080".into(),
        };
        let alice = ctx
            .storage
            .create_user("alice", UserKind::Provider, None)
            .await
            .expect("user");
        let bob = ctx
            .storage
            .create_user("bob", UserKind::Patient, None)
            .await
            .expect("user");
        (ctx, alice, bob)
    }

    #[tokio::test]
    async fn updates_fan_out_to_thread_peers() {
        let (ctx, alice, bob) = setup().await;
        open_direct_thread(&ctx, alice, bob).await.expect("thread");

        let (snapshot, envelopes) = update_presence(&ctx, alice, PresenceStatus::Busy, Some("rounds"))
            .await
            .expect("update");
        assert_eq!(snapshot.status, PresenceStatus::Busy);
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].includes(alice));
        assert!(envelopes[0].includes(bob));
    }

    #[tokio::test]
    async fn strangers_read_as_offline_without_leaking() {
        let (ctx, alice, bob) = setup().await;
        update_presence(&ctx, bob, PresenceStatus::Online, None)
            .await
            .expect("update");

        let seen = presence_snapshot(&ctx, alice, bob).await.expect("snapshot");
        assert_eq!(seen.status, PresenceStatus::Offline);
        assert_eq!(seen.last_seen_at, None);

        let ghost = presence_snapshot(&ctx, alice, UserId(9999))
            .await
            .expect("snapshot");
        assert_eq!(ghost.status, PresenceStatus::Offline);
        assert_eq!(ghost.last_seen_at, None);
    }

    #[tokio::test]
    async fn peers_see_the_live_status() {
        let (ctx, alice, bob) = setup().await;
        open_direct_thread(&ctx, alice, bob).await.expect("thread");
        update_presence(&ctx, bob, PresenceStatus::Away, Some("lunch"))
            .await
            .expect("update");

        let seen = presence_snapshot(&ctx, alice, bob).await.expect("snapshot");
        assert_eq!(seen.status, PresenceStatus::Away);
        assert_eq!(seen.status_message.as_deref(), Some("lunch"));
        assert!(seen.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn own_presence_is_always_visible() {
        let (ctx, alice, _) = setup().await;
        update_presence(&ctx, alice, PresenceStatus::Online, None)
            .await
            .expect("update");
        let seen = presence_snapshot(&ctx, alice, alice).await.expect("snapshot");
        assert_eq!(seen.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn typing_reaches_everyone_but_the_typist() {
        let (ctx, alice, bob) = setup().await;
        let (thread_id, _, _) = open_direct_thread(&ctx, alice, bob).await.expect("thread");

        let recipients = typing_recipients(&ctx, alice, thread_id)
            .await
            .expect("recipients");
        assert_eq!(recipients, vec![bob]);

        let outsider = ctx
            .storage
            .create_user("outsider", UserKind::Provider, None)
            .await
            .expect("user");
        let err = typing_recipients(&ctx, outsider, thread_id)
            .await
            .expect_err("outsider typing");
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn overlong_status_messages_are_rejected() {
        let (ctx, alice, _) = setup().await;
        let long = "x".repeat(MAX_STATUS_CHARS + 1);
        let err = update_presence(&ctx, alice, PresenceStatus::Online, Some(&long))
            .await
            .expect_err("too long");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
