use super::*;

async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

async fn provider(storage: &Storage, name: &str) -> UserId {
    storage
        .create_user(name, UserKind::Provider, None)
        .await
        .expect("user")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = memory_storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("messaging.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn open_direct_creates_once_per_pair() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;

    let (first, created) = storage.open_direct_thread(alice, bob).await.expect("open");
    assert!(created);

    let (second, created_again) = storage.open_direct_thread(bob, alice).await.expect("open");
    assert!(!created_again);
    assert_eq!(first, second);

    let members = storage.active_member_ids(first).await.expect("members");
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn concurrent_direct_opens_converge_on_one_thread() {
    // File-backed so both pool connections see the same database.
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("race.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let storage = Storage::new(&database_url).await.expect("db");
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;

    let storage_a = storage.clone();
    let storage_b = storage.clone();
    let (left, right) = tokio::join!(
        async move { storage_a.open_direct_thread(alice, bob).await.expect("left") },
        async move { storage_b.open_direct_thread(bob, alice).await.expect("right") }
    );

    assert_eq!(left.0, right.0, "both opens must land on the same thread");
}

#[tokio::test]
async fn reopening_direct_thread_reactivates_left_member() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;

    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");
    assert!(storage.mark_left(thread, bob).await.expect("leave"));
    assert_eq!(
        storage.active_member_ids(thread).await.expect("members").len(),
        1
    );

    let (reopened, created) = storage.open_direct_thread(bob, alice).await.expect("reopen");
    assert_eq!(reopened, thread);
    assert!(!created);
    assert_eq!(
        storage.active_member_ids(thread).await.expect("members").len(),
        2
    );
}

#[tokio::test]
async fn group_creator_becomes_owner() {
    let storage = memory_storage().await;
    let owner = provider(&storage, "dr-owner").await;
    let member = provider(&storage, "dr-member").await;

    let thread = storage
        .create_group_thread("care team", owner, &[member])
        .await
        .expect("group");

    let owner_row = storage
        .membership(thread, owner)
        .await
        .expect("membership")
        .expect("owner row");
    assert_eq!(owner_row.role, MemberRole::Owner);

    let member_row = storage
        .membership(thread, member)
        .await
        .expect("membership")
        .expect("member row");
    assert_eq!(member_row.role, MemberRole::Member);
}

#[tokio::test]
async fn paginates_messages_backwards_from_cursor() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let first = storage
        .insert_message(thread, alice, MessageKind::Text, Some("first"), None)
        .await
        .expect("first");
    let second = storage
        .insert_message(thread, alice, MessageKind::Text, Some("second"), None)
        .await
        .expect("second");
    let third = storage
        .insert_message(thread, alice, MessageKind::Text, Some("third"), None)
        .await
        .expect("third");

    let newest_two = storage
        .list_messages(thread, bob, 2, None)
        .await
        .expect("messages");
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].message_id, second.message_id);
    assert_eq!(newest_two[1].message_id, third.message_id);

    let older = storage
        .list_messages(thread, bob, 2, Some(second.message_id))
        .await
        .expect("messages");
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].message_id, first.message_id);
}

#[tokio::test]
async fn tombstoned_message_keeps_its_slot_without_content() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    storage
        .insert_message(thread, alice, MessageKind::Text, Some("before"), None)
        .await
        .expect("before");
    let target = storage
        .insert_message(thread, alice, MessageKind::Text, Some("secret"), None)
        .await
        .expect("target");
    storage
        .insert_message(thread, alice, MessageKind::Text, Some("after"), None)
        .await
        .expect("after");

    assert!(storage
        .tombstone_message(target.message_id)
        .await
        .expect("delete"));
    assert!(
        !storage
            .tombstone_message(target.message_id)
            .await
            .expect("second delete"),
        "second delete should be a no-op"
    );

    let page = storage
        .list_messages(thread, bob, 10, None)
        .await
        .expect("messages");
    assert_eq!(page.len(), 3);
    let tombstone = &page[1];
    assert_eq!(tombstone.message_id, target.message_id);
    assert!(tombstone.is_deleted);
    assert_eq!(tombstone.content, None);
}

#[tokio::test]
async fn hidden_messages_drop_out_for_one_viewer_only() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let message = storage
        .insert_message(thread, alice, MessageKind::Text, Some("awkward"), None)
        .await
        .expect("message");

    storage
        .hide_message_for_user(bob, message.message_id)
        .await
        .expect("hide");
    storage
        .hide_message_for_user(bob, message.message_id)
        .await
        .expect("hide again");

    let bob_view = storage
        .list_messages(thread, bob, 10, None)
        .await
        .expect("bob view");
    assert!(bob_view.is_empty());

    let alice_view = storage
        .list_messages(thread, alice, 10, None)
        .await
        .expect("alice view");
    assert_eq!(alice_view.len(), 1);
}

#[tokio::test]
async fn edit_marks_message_and_refuses_deleted_rows() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let message = storage
        .insert_message(thread, alice, MessageKind::Text, Some("typo"), None)
        .await
        .expect("message");

    assert!(storage
        .update_message_content(message.message_id, "fixed")
        .await
        .expect("edit"));
    let edited = storage
        .get_message(message.message_id)
        .await
        .expect("get")
        .expect("row");
    assert!(edited.is_edited);
    assert_eq!(edited.content.as_deref(), Some("fixed"));
    assert!(edited.edited_at.is_some());

    storage
        .tombstone_message(message.message_id)
        .await
        .expect("delete");
    assert!(
        !storage
            .update_message_content(message.message_id, "too late")
            .await
            .expect("edit deleted"),
        "deleted rows must not be editable"
    );
}

#[tokio::test]
async fn read_cursor_only_moves_forward() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let first = storage
        .insert_message(thread, alice, MessageKind::Text, Some("one"), None)
        .await
        .expect("one");
    let second = storage
        .insert_message(thread, alice, MessageKind::Text, Some("two"), None)
        .await
        .expect("two");

    assert!(storage
        .advance_read_cursor(thread, bob, second.message_id)
        .await
        .expect("advance"));
    assert!(
        !storage
            .advance_read_cursor(thread, bob, first.message_id)
            .await
            .expect("regress"),
        "older cursor must not move the row"
    );

    let membership = storage
        .membership(thread, bob)
        .await
        .expect("membership")
        .expect("row");
    assert_eq!(membership.last_read_message_id, Some(second.message_id));
}

#[tokio::test]
async fn unread_counts_ignore_own_and_hidden_messages() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    storage
        .insert_message(thread, bob, MessageKind::Text, Some("own"), None)
        .await
        .expect("own");
    let from_alice = storage
        .insert_message(thread, alice, MessageKind::Text, Some("one"), None)
        .await
        .expect("one");
    let hidden = storage
        .insert_message(thread, alice, MessageKind::Text, Some("two"), None)
        .await
        .expect("two");
    storage
        .hide_message_for_user(bob, hidden.message_id)
        .await
        .expect("hide");

    let overview = storage
        .list_threads_for_user(bob)
        .await
        .expect("threads")
        .into_iter()
        .find(|t| t.thread_id == thread)
        .expect("thread row");
    assert_eq!(overview.unread_count, 1);

    storage
        .advance_read_cursor(thread, bob, from_alice.message_id)
        .await
        .expect("advance");
    let after_read = storage
        .list_threads_for_user(bob)
        .await
        .expect("threads")
        .into_iter()
        .find(|t| t.thread_id == thread)
        .expect("thread row");
    assert_eq!(after_read.unread_count, 0);
}

#[tokio::test]
async fn thread_overview_resolves_direct_peer() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let overview = storage
        .list_threads_for_user(alice)
        .await
        .expect("threads")
        .into_iter()
        .find(|t| t.thread_id == thread)
        .expect("thread row");
    let peer = overview.peer.expect("peer");
    assert_eq!(peer.user_id, bob);
    assert_eq!(peer.display_name, "bob");
}

#[tokio::test]
async fn left_threads_disappear_from_the_list() {
    let storage = memory_storage().await;
    let owner = provider(&storage, "owner").await;
    let member = provider(&storage, "member").await;
    let thread = storage
        .create_group_thread("rounds", owner, &[member])
        .await
        .expect("group");

    assert_eq!(storage.list_threads_for_user(member).await.expect("threads").len(), 1);
    storage.mark_left(thread, member).await.expect("leave");
    assert!(storage.list_threads_for_user(member).await.expect("threads").is_empty());
}

#[tokio::test]
async fn stores_and_lists_attachment_rows() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let message = storage
        .insert_message(thread, alice, MessageKind::File, None, None)
        .await
        .expect("message");
    let stored = storage
        .insert_attachment(
            message.message_id,
            "labs.pdf",
            "application/pdf",
            Some(2048),
            "1/1/abc_labs.pdf",
        )
        .await
        .expect("attachment");
    assert_eq!(stored.file_name, "labs.pdf");

    let by_message = storage
        .attachments_for_messages(&[message.message_id])
        .await
        .expect("by message");
    assert_eq!(by_message.len(), 1);
    assert_eq!(by_message[0].attachment_id, stored.attachment_id);

    let recent = storage
        .list_recent_attachments(thread, bob, 30)
        .await
        .expect("recent");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].size_bytes, Some(2048));
}

#[tokio::test]
async fn attachments_of_deleted_messages_leave_recent_list() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let message = storage
        .insert_message(thread, alice, MessageKind::File, None, None)
        .await
        .expect("message");
    storage
        .insert_attachment(message.message_id, "scan.png", "image/png", Some(10), "p")
        .await
        .expect("attachment");
    storage
        .tombstone_message(message.message_id)
        .await
        .expect("delete");

    let recent = storage
        .list_recent_attachments(thread, bob, 30)
        .await
        .expect("recent");
    assert!(recent.is_empty());
}

#[tokio::test]
async fn pinned_messages_toggle_per_user() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    let message = storage
        .insert_message(thread, alice, MessageKind::Text, Some("keep this"), None)
        .await
        .expect("message");

    assert!(storage
        .toggle_pinned_message(bob, thread, message.message_id)
        .await
        .expect("pin"));
    assert_eq!(
        storage
            .list_pinned_messages(bob, thread, 20)
            .await
            .expect("pins")
            .len(),
        1
    );
    assert!(storage
        .list_pinned_messages(alice, thread, 20)
        .await
        .expect("alice pins")
        .is_empty());

    assert!(!storage
        .toggle_pinned_message(bob, thread, message.message_id)
        .await
        .expect("unpin"));
    assert!(storage
        .list_pinned_messages(bob, thread, 20)
        .await
        .expect("pins")
        .is_empty());
}

#[tokio::test]
async fn searches_visible_message_text() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;
    let (thread, _) = storage.open_direct_thread(alice, bob).await.expect("open");

    storage
        .insert_message(thread, alice, MessageKind::Text, Some("Dosage updated to 5mg"), None)
        .await
        .expect("one");
    let hidden = storage
        .insert_message(thread, alice, MessageKind::Text, Some("old dosage note"), None)
        .await
        .expect("two");
    storage
        .hide_message_for_user(bob, hidden.message_id)
        .await
        .expect("hide");
    let deleted = storage
        .insert_message(thread, alice, MessageKind::Text, Some("wrong dosage"), None)
        .await
        .expect("three");
    storage
        .tombstone_message(deleted.message_id)
        .await
        .expect("delete");

    let hits = storage
        .search_messages(thread, bob, "DOSAGE", 50)
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content.as_deref(), Some("Dosage updated to 5mg"));
}

#[tokio::test]
async fn presence_upserts_into_single_row() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;

    assert!(storage.get_presence(alice).await.expect("empty").is_none());

    storage
        .upsert_presence(alice, PresenceStatus::Online, Some("on rounds"))
        .await
        .expect("first upsert");
    storage
        .upsert_presence(alice, PresenceStatus::Away, None)
        .await
        .expect("second upsert");

    let presence = storage
        .get_presence(alice)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(presence.status, PresenceStatus::Away);
    assert_eq!(presence.status_message, None);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM presence")
        .fetch_one(storage.pool())
        .await
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn block_toggle_flips_and_checks_both_directions() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;

    assert!(storage.toggle_block(alice, bob).await.expect("block"));
    assert!(storage.is_blocked_between(bob, alice).await.expect("check"));
    assert!(!storage.toggle_block(alice, bob).await.expect("unblock"));
    assert!(!storage.is_blocked_between(alice, bob).await.expect("check"));
}

#[tokio::test]
async fn accepts_new_chats_defaults_to_open() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;

    assert!(storage.accepts_new_chats(alice).await.expect("default"));
    storage
        .set_accepts_new_chats(alice, false)
        .await
        .expect("close");
    assert!(!storage.accepts_new_chats(alice).await.expect("closed"));
}

#[tokio::test]
async fn directory_search_applies_exclusions() {
    let storage = memory_storage().await;
    let caller = provider(&storage, "Dr Searcher").await;
    provider(&storage, "Dr Match").await;
    let patient = storage
        .create_user("Patient Match", UserKind::Patient, None)
        .await
        .expect("patient");
    storage
        .create_user("Admin Match", UserKind::Admin, None)
        .await
        .expect("admin");
    let inactive = provider(&storage, "Dr Former Match").await;
    storage
        .set_user_active(inactive, false)
        .await
        .expect("deactivate");

    let without_patients = storage
        .search_directory(caller, "match", false, 25)
        .await
        .expect("search");
    assert_eq!(without_patients.len(), 1);
    assert_eq!(without_patients[0].display_name, "Dr Match");

    let with_patients = storage
        .search_directory(caller, "match", true, 25)
        .await
        .expect("search");
    assert_eq!(with_patients.len(), 2);
    assert!(with_patients.iter().any(|u| u.user_id == patient));

    let self_hit = storage
        .search_directory(caller, "searcher", true, 25)
        .await
        .expect("search");
    assert!(self_hit.is_empty(), "the caller never matches themselves");
}

#[tokio::test]
async fn quick_replies_crud_is_scoped_to_owner() {
    let storage = memory_storage().await;
    let alice = provider(&storage, "alice").await;
    let bob = provider(&storage, "bob").await;

    let reply = storage
        .create_quick_reply(alice, "greeting", "Hello, how can I help?")
        .await
        .expect("create");

    assert!(
        !storage
            .update_quick_reply(bob, reply.quick_reply_id, "x", "y")
            .await
            .expect("foreign update"),
        "another user's rows must be untouchable"
    );
    assert!(storage
        .update_quick_reply(alice, reply.quick_reply_id, "greeting", "Hi there")
        .await
        .expect("update"));

    let listed = storage.list_quick_replies(alice).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].body, "Hi there");

    assert!(!storage
        .delete_quick_reply(bob, reply.quick_reply_id)
        .await
        .expect("foreign delete"));
    assert!(storage
        .delete_quick_reply(alice, reply.quick_reply_id)
        .await
        .expect("delete"));
    assert!(storage.list_quick_replies(alice).await.expect("list").is_empty());
}

#[tokio::test]
async fn direct_pair_key_is_order_independent() {
    assert_eq!(direct_pair_key(UserId(7), UserId(3)), "3:7");
    assert_eq!(direct_pair_key(UserId(3), UserId(7)), "3:7");
}
