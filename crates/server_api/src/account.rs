use shared::{
    domain::{QuickReplyId, ReportId, UserId},
    error::{ApiError, ErrorCode},
    protocol::QuickReplySummary,
};
use storage::StoredQuickReply;
use tracing::info;

use crate::{internal, ApiContext};

const MAX_LABEL_CHARS: usize = 60;
const MAX_BODY_CHARS: usize = 500;
const MAX_REASON_CHARS: usize = 1000;

/// Flips the caller's block on a target. Returns the new state. Blocking
/// is one-directional in storage but symmetric in effect.
pub async fn toggle_block(
    ctx: &ApiContext,
    blocker: UserId,
    target: UserId,
) -> Result<bool, ApiError> {
    if target == blocker {
        return Err(ApiError::new(ErrorCode::Validation, "cannot block yourself"));
    }
    ctx.storage
        .get_user(target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    let blocked = ctx
        .storage
        .toggle_block(blocker, target)
        .await
        .map_err(internal)?;
    info!(
        "user {} {} user {}",
        blocker.0,
        if blocked { "blocked" } else { "unblocked" },
        target.0
    );
    Ok(blocked)
}

pub async fn report_user(
    ctx: &ApiContext,
    reporter: UserId,
    target: UserId,
    reason: &str,
) -> Result<ReportId, ApiError> {
    if target == reporter {
        return Err(ApiError::new(ErrorCode::Validation, "cannot report yourself"));
    }
    ctx.storage
        .get_user(target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "a reason is required"));
    }
    if reason.chars().count() > MAX_REASON_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "reason is too long"));
    }
    let report_id = ctx
        .storage
        .insert_report(reporter, target, reason)
        .await
        .map_err(internal)?;
    info!("user {} reported user {} ({})", reporter.0, target.0, report_id.0);
    Ok(report_id)
}

pub async fn update_settings(
    ctx: &ApiContext,
    user_id: UserId,
    accepts_new_chats: bool,
) -> Result<(), ApiError> {
    ctx.storage
        .set_accepts_new_chats(user_id, accepts_new_chats)
        .await
        .map_err(internal)
}

pub async fn create_quick_reply(
    ctx: &ApiContext,
    user_id: UserId,
    label: &str,
    body: &str,
) -> Result<QuickReplySummary, ApiError> {
    let (label, body) = validate_quick_reply(label, body)?;
    let row = ctx
        .storage
        .create_quick_reply(user_id, label, body)
        .await
        .map_err(internal)?;
    Ok(quick_reply_summary(row))
}

pub async fn update_quick_reply(
    ctx: &ApiContext,
    user_id: UserId,
    quick_reply_id: QuickReplyId,
    label: &str,
    body: &str,
) -> Result<(), ApiError> {
    let (label, body) = validate_quick_reply(label, body)?;
    let updated = ctx
        .storage
        .update_quick_reply(user_id, quick_reply_id, label, body)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "quick reply not found"));
    }
    Ok(())
}

pub async fn delete_quick_reply(
    ctx: &ApiContext,
    user_id: UserId,
    quick_reply_id: QuickReplyId,
) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_quick_reply(user_id, quick_reply_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::new(ErrorCode::NotFound, "quick reply not found"));
    }
    Ok(())
}

pub async fn list_quick_replies(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<QuickReplySummary>, ApiError> {
    let rows = ctx
        .storage
        .list_quick_replies(user_id)
        .await
        .map_err(internal)?;
    Ok(rows.into_iter().map(quick_reply_summary).collect())
}

fn validate_quick_reply<'a>(label: &'a str, body: &'a str) -> Result<(&'a str, &'a str), ApiError> {
    let label = label.trim();
    let body = body.trim();
    if label.is_empty() || body.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "quick replies need a label and a body",
        ));
    }
    if label.chars().count() > MAX_LABEL_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "label is too long"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "body is too long"));
    }
    Ok((label, body))
}

fn quick_reply_summary(row: StoredQuickReply) -> QuickReplySummary {
    QuickReplySummary {
        quick_reply_id: row.quick_reply_id,
        label: row.label,
        body: row.body,
        updated_at: row.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn block_toggle_flips_state_and_rejects_self() {
        let (ctx, alice, bob) = setup().await;
        assert!(toggle_block(&ctx, alice, bob).await.expect("block"));
        assert!(!toggle_block(&ctx, alice, bob).await.expect("unblock"));

        let err = toggle_block(&ctx, alice, alice).await.expect_err("self");
        assert_eq!(err.code, ErrorCode::Validation);
        let err = toggle_block(&ctx, alice, UserId(9999))
            .await
            .expect_err("missing");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn reports_need_a_real_target_and_reason() {
        let (ctx, alice, bob) = setup().await;
        let err = report_user(&ctx, alice, bob, "   ").await.expect_err("blank");
        assert_eq!(err.code, ErrorCode::Validation);

        let report_id = report_user(&ctx, alice, bob, "sent spam links")
            .await
            .expect("report");
        assert!(report_id.0 > 0);
    }

    #[tokio::test]
    async fn quick_replies_round_trip_with_validation() {
        let (ctx, alice, _) = setup().await;
        let created = create_quick_reply(&ctx, alice, " Intake ", "Please fill out the intake form.")
            .await
            .expect("create");
        assert_eq!(created.label, "Intake");

        update_quick_reply(&ctx, alice, created.quick_reply_id, "Intake", "Updated body.")
            .await
            .expect("update");
        let listed = list_quick_replies(&ctx, alice).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "Updated body.");

        delete_quick_reply(&ctx, alice, created.quick_reply_id)
            .await
            .expect("delete");
        let err = delete_quick_reply(&ctx, alice, created.quick_reply_id)
            .await
            .expect_err("already gone");
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = create_quick_reply(&ctx, alice, "", "body").await.expect_err("no label");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn quick_replies_are_scoped_to_their_owner() {
        let (ctx, alice, bob) = setup().await;
        let created = create_quick_reply(&ctx, alice, "Hours", "We are open 9 to 5.")
            .await
            .expect("create");

        let err = update_quick_reply(&ctx, bob, created.quick_reply_id, "Hours", "hijack")
            .await
            .expect_err("foreign update");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(list_quick_replies(&ctx, bob).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn closing_new_chats_persists() {
        let (ctx, alice, _) = setup().await;
        assert!(ctx.storage.accepts_new_chats(alice).await.expect("default"));
        update_settings(&ctx, alice, false).await.expect("update");
        assert!(!ctx.storage.accepts_new_chats(alice).await.expect("closed"));
    }
}
