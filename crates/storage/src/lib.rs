use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    AttachmentId, MemberRole, MessageId, MessageKind, PresenceStatus, QuickReplyId, ReportId,
    ThreadId, ThreadKind, UserId, UserKind,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub display_name: String,
    pub kind: UserKind,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredThread {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    pub title: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMembership {
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub last_read_message_id: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub display_name: String,
    pub kind: UserKind,
    pub avatar_url: Option<String>,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    /// None for attachment-only messages and for tombstones.
    pub content: Option<String>,
    pub reply_to_message_id: Option<MessageId>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub file_name: String,
    pub file_type: String,
    pub size_bytes: Option<i64>,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub status_message: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredQuickReply {
    pub quick_reply_id: QuickReplyId,
    pub user_id: UserId,
    pub label: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the caller's thread list. Preview resolution and sorting
/// happen above the storage layer; this carries the raw ingredients.
#[derive(Debug, Clone)]
pub struct StoredThreadOverview {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub last_read_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub unread_count: i64,
    pub peer: Option<StoredUser>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // --- users ---

    pub async fn create_user(
        &self,
        display_name: &str,
        kind: UserKind,
        avatar_url: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (display_name, kind, avatar_url) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(display_name)
        .bind(kind.as_str())
        .bind(avatar_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, display_name, kind, avatar_url, is_active, created_at
             FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| read_user_row(&r, 0)))
    }

    pub async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    pub async fn count_users(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Case-insensitive substring search over active accounts. The caller,
    /// admin accounts, and (unless asked for) patient accounts never match.
    pub async fn search_directory(
        &self,
        caller: UserId,
        query: &str,
        include_patients: bool,
        limit: u32,
    ) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(
            "SELECT id, display_name, kind, avatar_url, is_active, created_at
             FROM users
             WHERE is_active = 1
               AND id <> ?1
               AND kind <> 'admin'
               AND (kind <> 'patient' OR ?2)
               AND lower(display_name) LIKE '%' || lower(?3) || '%'
             ORDER BY lower(display_name) ASC
             LIMIT ?4",
        )
        .bind(caller.0)
        .bind(include_patients)
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| read_user_row(r, 0)).collect())
    }

    // --- threads and membership ---

    /// Finds or creates the single direct thread for a user pair. The pair
    /// key is UNIQUE, so two concurrent opens converge on one row; losing
    /// the insert race falls through to the select. Reopening also clears
    /// any left_at markers so the thread delivers again for both sides.
    pub async fn open_direct_thread(&self, a: UserId, b: UserId) -> Result<(ThreadId, bool)> {
        let pair_key = direct_pair_key(a, b);

        let inserted = sqlx::query(
            "INSERT INTO threads (kind, created_by, direct_pair_key)
             VALUES ('direct', ?, ?)
             ON CONFLICT(direct_pair_key) DO NOTHING
             RETURNING id",
        )
        .bind(a.0)
        .bind(&pair_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(rec) = inserted {
            let thread_id = ThreadId(rec.get::<i64, _>(0));
            for user in [a, b] {
                sqlx::query(
                    "INSERT INTO thread_members (thread_id, user_id, role) VALUES (?, ?, 'member')",
                )
                .bind(thread_id.0)
                .bind(user.0)
                .execute(&self.pool)
                .await?;
            }
            return Ok((thread_id, true));
        }

        let rec = sqlx::query("SELECT id FROM threads WHERE direct_pair_key = ?")
            .bind(&pair_key)
            .fetch_one(&self.pool)
            .await
            .context("direct thread vanished after conflict")?;
        let thread_id = ThreadId(rec.get::<i64, _>(0));

        sqlx::query(
            "UPDATE thread_members SET left_at = NULL
             WHERE thread_id = ? AND user_id IN (?, ?) AND left_at IS NOT NULL",
        )
        .bind(thread_id.0)
        .bind(a.0)
        .bind(b.0)
        .execute(&self.pool)
        .await?;

        Ok((thread_id, false))
    }

    pub async fn create_group_thread(
        &self,
        title: &str,
        creator: UserId,
        member_ids: &[UserId],
    ) -> Result<ThreadId> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query(
            "INSERT INTO threads (kind, title, created_by) VALUES ('group', ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(creator.0)
        .fetch_one(&mut *tx)
        .await?;
        let thread_id = ThreadId(rec.get::<i64, _>(0));

        sqlx::query("INSERT INTO thread_members (thread_id, user_id, role) VALUES (?, ?, 'owner')")
            .bind(thread_id.0)
            .bind(creator.0)
            .execute(&mut *tx)
            .await?;

        for member in member_ids {
            if *member == creator {
                continue;
            }
            sqlx::query(
                "INSERT INTO thread_members (thread_id, user_id, role) VALUES (?, ?, 'member')
                 ON CONFLICT(thread_id, user_id) DO NOTHING",
            )
            .bind(thread_id.0)
            .bind(member.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(thread_id)
    }

    pub async fn get_thread(&self, thread_id: ThreadId) -> Result<Option<StoredThread>> {
        let row = sqlx::query(
            "SELECT id, kind, title, created_by, created_at, updated_at
             FROM threads WHERE id = ?",
        )
        .bind(thread_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredThread {
            thread_id: ThreadId(r.get::<i64, _>(0)),
            kind: ThreadKind::parse(r.get::<String, _>(1).as_str()).unwrap_or(ThreadKind::Group),
            title: r.get::<Option<String>, _>(2),
            created_by: UserId(r.get::<i64, _>(3)),
            created_at: r.get::<DateTime<Utc>, _>(4),
            updated_at: r.get::<DateTime<Utc>, _>(5),
        }))
    }

    async fn touch_thread(&self, thread_id: ThreadId) -> Result<()> {
        sqlx::query("UPDATE threads SET updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(thread_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn membership(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
    ) -> Result<Option<StoredMembership>> {
        let row = sqlx::query(
            "SELECT thread_id, user_id, role, joined_at, left_at, muted, muted_until, pinned, last_read_message_id
             FROM thread_members
             WHERE thread_id = ? AND user_id = ?",
        )
        .bind(thread_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredMembership {
            thread_id: ThreadId(r.get::<i64, _>(0)),
            user_id: UserId(r.get::<i64, _>(1)),
            role: MemberRole::parse(r.get::<String, _>(2).as_str()).unwrap_or(MemberRole::Member),
            joined_at: r.get::<DateTime<Utc>, _>(3),
            left_at: r.get::<Option<DateTime<Utc>>, _>(4),
            muted: r.get::<bool, _>(5),
            muted_until: r.get::<Option<DateTime<Utc>>, _>(6),
            pinned: r.get::<bool, _>(7),
            last_read_message_id: r.get::<Option<i64>, _>(8).map(MessageId),
        }))
    }

    pub async fn list_members(&self, thread_id: ThreadId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.display_name, u.kind, u.avatar_url, m.role, m.joined_at
             FROM thread_members m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.thread_id = ? AND m.left_at IS NULL
             ORDER BY lower(u.display_name) ASC",
        )
        .bind(thread_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                display_name: r.get::<String, _>(1),
                kind: UserKind::parse(r.get::<String, _>(2).as_str())
                    .unwrap_or(UserKind::Provider),
                avatar_url: r.get::<Option<String>, _>(3),
                role: MemberRole::parse(r.get::<String, _>(4).as_str())
                    .unwrap_or(MemberRole::Member),
                joined_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    pub async fn active_member_ids(&self, thread_id: ThreadId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM thread_members WHERE thread_id = ? AND left_at IS NULL",
        )
        .bind(thread_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn mark_left(&self, thread_id: ThreadId, user_id: UserId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE thread_members SET left_at = CURRENT_TIMESTAMP
             WHERE thread_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(thread_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn set_muted(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
        muted: bool,
        muted_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE thread_members SET muted = ?, muted_until = ?
             WHERE thread_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(muted)
        .bind(muted_until)
        .bind(thread_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Flips the caller's pin flag for a thread and returns the new value.
    pub async fn toggle_thread_pinned(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
    ) -> Result<Option<bool>> {
        let row = sqlx::query(
            "UPDATE thread_members SET pinned = 1 - pinned
             WHERE thread_id = ? AND user_id = ? AND left_at IS NULL
             RETURNING pinned",
        )
        .bind(thread_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)))
    }

    pub async fn set_member_role(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE thread_members SET role = ?
             WHERE thread_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(role.as_str())
        .bind(thread_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn list_threads_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredThreadOverview>> {
        let rows = sqlx::query(
            "SELECT
                t.id, t.kind, t.title, t.updated_at,
                m.muted, m.muted_until, m.pinned, m.last_read_message_id,
                (SELECT ms.id FROM messages ms
                   WHERE ms.thread_id = t.id
                     AND ms.id NOT IN (SELECT md.message_id FROM message_deletes md WHERE md.user_id = ?1)
                   ORDER BY ms.id DESC LIMIT 1),
                (SELECT COUNT(*) FROM messages ms
                   WHERE ms.thread_id = t.id
                     AND ms.sender_id <> ?1
                     AND ms.is_deleted = 0
                     AND ms.id NOT IN (SELECT md.message_id FROM message_deletes md WHERE md.user_id = ?1)
                     AND (m.last_read_message_id IS NULL OR ms.id > m.last_read_message_id)),
                pu.id, pu.display_name, pu.kind, pu.avatar_url, pu.is_active, pu.created_at
             FROM threads t
             INNER JOIN thread_members m ON m.thread_id = t.id
             LEFT JOIN thread_members pm ON pm.thread_id = t.id AND t.kind = 'direct' AND pm.user_id <> ?1
             LEFT JOIN users pu ON pu.id = pm.user_id
             WHERE m.user_id = ?1 AND m.left_at IS NULL
             ORDER BY t.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredThreadOverview {
                thread_id: ThreadId(r.get::<i64, _>(0)),
                kind: ThreadKind::parse(r.get::<String, _>(1).as_str())
                    .unwrap_or(ThreadKind::Group),
                title: r.get::<Option<String>, _>(2),
                updated_at: r.get::<DateTime<Utc>, _>(3),
                muted: r.get::<bool, _>(4),
                muted_until: r.get::<Option<DateTime<Utc>>, _>(5),
                pinned: r.get::<bool, _>(6),
                last_read_message_id: r.get::<Option<i64>, _>(7).map(MessageId),
                last_message_id: r.get::<Option<i64>, _>(8).map(MessageId),
                unread_count: r.get::<i64, _>(9),
                peer: r.get::<Option<i64>, _>(10).map(|_| read_user_row(&r, 10)),
            })
            .collect())
    }

    // --- messages ---

    pub async fn insert_message(
        &self,
        thread_id: ThreadId,
        sender_id: UserId,
        kind: MessageKind,
        content: Option<&str>,
        reply_to_message_id: Option<MessageId>,
    ) -> Result<StoredMessage> {
        let rec = sqlx::query(
            "INSERT INTO messages (thread_id, sender_id, kind, content, reply_to_message_id)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(thread_id.0)
        .bind(sender_id.0)
        .bind(kind.as_str())
        .bind(content)
        .bind(reply_to_message_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;

        self.touch_thread(thread_id).await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            thread_id,
            sender_id,
            kind,
            content: content.map(str::to_string),
            reply_to_message_id,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: rec.get::<DateTime<Utc>, _>(1),
        })
    }

    pub async fn get_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, thread_id, sender_id, kind, content, reply_to_message_id, is_edited, edited_at, is_deleted, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| read_message_row(&r)))
    }

    /// Newest-first page of the visible log for one viewer, returned
    /// oldest-first. Tombstoned rows stay in; rows the viewer deleted for
    /// themselves drop out.
    pub async fn list_messages(
        &self,
        thread_id: ThreadId,
        viewer: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(
                "SELECT id, thread_id, sender_id, kind, content, reply_to_message_id, is_edited, edited_at, is_deleted, created_at
                 FROM messages
                 WHERE thread_id = ?1 AND id < ?2
                   AND id NOT IN (SELECT message_id FROM message_deletes WHERE user_id = ?3)
                 ORDER BY id DESC
                 LIMIT ?4",
            )
            .bind(thread_id.0)
            .bind(before_id.0)
            .bind(viewer.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, thread_id, sender_id, kind, content, reply_to_message_id, is_edited, edited_at, is_deleted, created_at
                 FROM messages
                 WHERE thread_id = ?1
                   AND id NOT IN (SELECT message_id FROM message_deletes WHERE user_id = ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )
            .bind(thread_id.0)
            .bind(viewer.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows.iter().map(read_message_row).collect())
    }

    pub async fn update_message_content(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages
             SET content = ?, is_edited = 1, edited_at = CURRENT_TIMESTAMP
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(content)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Tombstones a message in place. The row keeps its position in the
    /// log; the text is nulled. Returns false if it was already deleted.
    pub async fn tombstone_message(&self, message_id: MessageId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages
             SET is_deleted = 1, deleted_at = CURRENT_TIMESTAMP, content = NULL
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn hide_message_for_user(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_deletes (user_id, message_id) VALUES (?, ?)
             ON CONFLICT(user_id, message_id) DO NOTHING",
        )
        .bind(user_id.0)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Toggles a personal bookmark on a message. Returns the new state.
    pub async fn toggle_pinned_message(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        message_id: MessageId,
    ) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM pinned_messages WHERE user_id = ? AND message_id = ?")
            .bind(user_id.0)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO pinned_messages (user_id, thread_id, message_id) VALUES (?, ?, ?)")
            .bind(user_id.0)
            .bind(thread_id.0)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn list_pinned_messages(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT ms.id, ms.thread_id, ms.sender_id, ms.kind, ms.content, ms.reply_to_message_id, ms.is_edited, ms.edited_at, ms.is_deleted, ms.created_at
             FROM pinned_messages p
             INNER JOIN messages ms ON ms.id = p.message_id
             WHERE p.user_id = ?1 AND p.thread_id = ?2 AND ms.is_deleted = 0
               AND ms.id NOT IN (SELECT message_id FROM message_deletes WHERE user_id = ?1)
             ORDER BY p.created_at DESC, p.message_id DESC
             LIMIT ?3",
        )
        .bind(user_id.0)
        .bind(thread_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(read_message_row).collect())
    }

    /// Advances the member's read cursor, never backwards. Message ids are
    /// assigned in insert order, so id comparison is the log order.
    pub async fn advance_read_cursor(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE thread_members SET last_read_message_id = ?1
             WHERE thread_id = ?2 AND user_id = ?3 AND left_at IS NULL
               AND (last_read_message_id IS NULL OR last_read_message_id < ?1)",
        )
        .bind(message_id.0)
        .bind(thread_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn search_messages(
        &self,
        thread_id: ThreadId,
        viewer: UserId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, thread_id, sender_id, kind, content, reply_to_message_id, is_edited, edited_at, is_deleted, created_at
             FROM messages
             WHERE thread_id = ?1
               AND is_deleted = 0
               AND lower(content) LIKE '%' || lower(?2) || '%'
               AND id NOT IN (SELECT message_id FROM message_deletes WHERE user_id = ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )
        .bind(thread_id.0)
        .bind(query)
        .bind(viewer.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(read_message_row).collect())
    }

    // --- attachments ---

    pub async fn insert_attachment(
        &self,
        message_id: MessageId,
        file_name: &str,
        file_type: &str,
        size_bytes: Option<i64>,
        storage_path: &str,
    ) -> Result<StoredAttachment> {
        let rec = sqlx::query(
            "INSERT INTO attachments (message_id, file_name, file_type, size_bytes, storage_path)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(message_id.0)
        .bind(file_name)
        .bind(file_type)
        .bind(size_bytes)
        .bind(storage_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredAttachment {
            attachment_id: AttachmentId(rec.get::<i64, _>(0)),
            message_id,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            size_bytes,
            storage_path: storage_path.to_string(),
            created_at: rec.get::<DateTime<Utc>, _>(1),
        })
    }

    pub async fn get_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<Option<StoredAttachment>> {
        let row = sqlx::query(
            "SELECT id, message_id, file_name, file_type, size_bytes, storage_path, created_at
             FROM attachments WHERE id = ?",
        )
        .bind(attachment_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| read_attachment_row(&r)))
    }

    pub async fn attachments_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredAttachment>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, message_id, file_name, file_type, size_bytes, storage_path, created_at
             FROM attachments
             WHERE message_id IN ({placeholders})
             ORDER BY id ASC"
        );
        let mut query = sqlx::query(&sql);
        for id in message_ids {
            query = query.bind(id.0);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| read_attachment_row(r)).collect())
    }

    pub async fn list_recent_attachments(
        &self,
        thread_id: ThreadId,
        viewer: UserId,
        limit: u32,
    ) -> Result<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            "SELECT a.id, a.message_id, a.file_name, a.file_type, a.size_bytes, a.storage_path, a.created_at
             FROM attachments a
             INNER JOIN messages ms ON ms.id = a.message_id
             WHERE ms.thread_id = ?1 AND ms.is_deleted = 0
               AND ms.id NOT IN (SELECT message_id FROM message_deletes WHERE user_id = ?2)
             ORDER BY a.id DESC
             LIMIT ?3",
        )
        .bind(thread_id.0)
        .bind(viewer.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| read_attachment_row(r)).collect())
    }

    // --- presence ---

    pub async fn upsert_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        status_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (user_id, status, status_message, last_seen_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                status_message = excluded.status_message,
                last_seen_at = CURRENT_TIMESTAMP",
        )
        .bind(user_id.0)
        .bind(status.as_str())
        .bind(status_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_presence(&self, user_id: UserId) -> Result<Option<StoredPresence>> {
        let row = sqlx::query(
            "SELECT user_id, status, status_message, last_seen_at FROM presence WHERE user_id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredPresence {
            user_id: UserId(r.get::<i64, _>(0)),
            status: PresenceStatus::parse(r.get::<String, _>(1).as_str()).unwrap_or_default(),
            status_message: r.get::<Option<String>, _>(2),
            last_seen_at: r.get::<DateTime<Utc>, _>(3),
        }))
    }

    /// Everyone who currently shares at least one active thread with the
    /// user. Drives presence fan-out and the presence read permission.
    pub async fn shared_thread_user_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT other.user_id
             FROM thread_members own
             INNER JOIN thread_members other ON other.thread_id = own.thread_id
             WHERE own.user_id = ?1 AND own.left_at IS NULL
               AND other.user_id <> ?1 AND other.left_at IS NULL",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn shares_active_thread(&self, a: UserId, b: UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM thread_members own
             INNER JOIN thread_members other ON other.thread_id = own.thread_id
             WHERE own.user_id = ? AND own.left_at IS NULL
               AND other.user_id = ? AND other.left_at IS NULL",
        )
        .bind(a.0)
        .bind(b.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // --- blocks, settings, reports ---

    /// Flips the block edge from blocker to blocked. Returns true when the
    /// pair is now blocked.
    pub async fn toggle_block(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM user_blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker.0)
            .bind(blocked.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO user_blocks (blocker_id, blocked_id) VALUES (?, ?)")
            .bind(blocker.0)
            .bind(blocked.0)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// A block in either direction stops direct messaging between the two.
    pub async fn is_blocked_between(&self, a: UserId, b: UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_blocks
             WHERE (blocker_id = ?1 AND blocked_id = ?2)
                OR (blocker_id = ?2 AND blocked_id = ?1)",
        )
        .bind(a.0)
        .bind(b.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn set_accepts_new_chats(&self, user_id: UserId, accepts: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (user_id, accepts_new_chats) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET accepts_new_chats = excluded.accepts_new_chats",
        )
        .bind(user_id.0)
        .bind(accepts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Missing settings row means the default: open to new conversations.
    pub async fn accepts_new_chats(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT accepts_new_chats FROM user_settings WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)).unwrap_or(true))
    }

    pub async fn insert_report(
        &self,
        reporter: UserId,
        reported: UserId,
        reason: &str,
    ) -> Result<ReportId> {
        let rec = sqlx::query(
            "INSERT INTO user_reports (reporter_id, reported_id, reason) VALUES (?, ?, ?)
             RETURNING id",
        )
        .bind(reporter.0)
        .bind(reported.0)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(ReportId(rec.get::<i64, _>(0)))
    }

    // --- quick replies ---

    pub async fn create_quick_reply(
        &self,
        user_id: UserId,
        label: &str,
        body: &str,
    ) -> Result<StoredQuickReply> {
        let rec = sqlx::query(
            "INSERT INTO quick_replies (user_id, label, body) VALUES (?, ?, ?)
             RETURNING id, created_at, updated_at",
        )
        .bind(user_id.0)
        .bind(label)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredQuickReply {
            quick_reply_id: QuickReplyId(rec.get::<i64, _>(0)),
            user_id,
            label: label.to_string(),
            body: body.to_string(),
            created_at: rec.get::<DateTime<Utc>, _>(1),
            updated_at: rec.get::<DateTime<Utc>, _>(2),
        })
    }

    pub async fn update_quick_reply(
        &self,
        user_id: UserId,
        quick_reply_id: QuickReplyId,
        label: &str,
        body: &str,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE quick_replies SET label = ?, body = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND user_id = ?",
        )
        .bind(label)
        .bind(body)
        .bind(quick_reply_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn delete_quick_reply(
        &self,
        user_id: UserId,
        quick_reply_id: QuickReplyId,
    ) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM quick_replies WHERE id = ? AND user_id = ?")
            .bind(quick_reply_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn list_quick_replies(&self, user_id: UserId) -> Result<Vec<StoredQuickReply>> {
        let rows = sqlx::query(
            "SELECT id, user_id, label, body, created_at, updated_at
             FROM quick_replies
             WHERE user_id = ?
             ORDER BY lower(label) ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredQuickReply {
                quick_reply_id: QuickReplyId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<i64, _>(1)),
                label: r.get::<String, _>(2),
                body: r.get::<String, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
                updated_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }
}

pub fn direct_pair_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("{low}:{high}")
}

fn read_user_row(r: &SqliteRow, offset: usize) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(offset)),
        display_name: r.get::<String, _>(offset + 1),
        kind: UserKind::parse(r.get::<String, _>(offset + 2).as_str())
            .unwrap_or(UserKind::Provider),
        avatar_url: r.get::<Option<String>, _>(offset + 3),
        is_active: r.get::<bool, _>(offset + 4),
        created_at: r.get::<DateTime<Utc>, _>(offset + 5),
    }
}

fn read_message_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        thread_id: ThreadId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        kind: MessageKind::parse(r.get::<String, _>(3).as_str()).unwrap_or(MessageKind::Text),
        content: r.get::<Option<String>, _>(4),
        reply_to_message_id: r.get::<Option<i64>, _>(5).map(MessageId),
        is_edited: r.get::<bool, _>(6),
        edited_at: r.get::<Option<DateTime<Utc>>, _>(7),
        is_deleted: r.get::<bool, _>(8),
        created_at: r.get::<DateTime<Utc>, _>(9),
    }
}

fn read_attachment_row(r: &SqliteRow) -> StoredAttachment {
    StoredAttachment {
        attachment_id: AttachmentId(r.get::<i64, _>(0)),
        message_id: MessageId(r.get::<i64, _>(1)),
        file_name: r.get::<String, _>(2),
        file_type: r.get::<String, _>(3),
        size_bytes: r.get::<Option<i64>, _>(4),
        storage_path: r.get::<String, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
