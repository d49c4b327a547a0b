//! Database tests

use super::*;
use crate::error::AppError;
use chrono::Utc;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn local_actor(username: &str, auto_follow_accept: bool) -> Actor {
    Actor {
        id: EntityId::new().0,
        username: username.to_string(),
        domain: String::new(),
        display_name: username.to_string(),
        bio: String::new(),
        uri: None,
        inbox: None,
        shared_inbox: None,
        outbox: None,
        followers_url: None,
        following_url: None,
        public_key_pem: Some("test_public_key".to_string()),
        private_key_pem: Some("test_private_key".to_string()),
        auto_follow_accept,
        is_bot: false,
        fetched_at: None,
        created_at: Utc::now(),
    }
}

fn remote_record(username: &str, shared_inbox: Option<&str>) -> RemoteActorRecord {
    let uri = format!("https://remote.example/users/{}", username);
    RemoteActorRecord {
        uri: uri.clone(),
        username: username.to_string(),
        domain: "remote.example".to_string(),
        display_name: String::new(),
        bio: String::new(),
        inbox: Some(format!("{}/inbox", uri)),
        shared_inbox: shared_inbox.map(ToString::to_string),
        outbox: None,
        followers_url: Some(format!("{}/followers", uri)),
        following_url: None,
        auto_follow_accept: false,
        is_bot: false,
        public_key: Some((format!("{}#main-key", uri), "remote_public_key".to_string())),
        fetched_at: Utc::now(),
    }
}

fn relation(follower: &Actor, followed: &Actor, pending: bool) -> FollowRelation {
    FollowRelation {
        id: EntityId::new().0,
        follower_id: follower.id.clone(),
        followed_id: followed.id.clone(),
        pending,
        activity_uri: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_local_actor_insert_and_lookup() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    db.insert_local_actor(&alice).await.unwrap();

    let by_id = db.get_actor(&alice.id).await.unwrap().unwrap();
    assert_eq!(by_id.username, "alice");
    assert!(by_id.is_local());

    let by_name = db.get_local_actor_by_username("ALICE").await.unwrap();
    assert_eq!(by_name.unwrap().id, alice.id);
}

#[tokio::test]
async fn test_local_actor_without_private_key_is_rejected() {
    let (db, _temp_dir) = create_test_db().await;
    let mut actor = local_actor("nokey", true);
    actor.private_key_pem = None;

    assert!(matches!(
        db.insert_local_actor(&actor).await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn test_remote_actor_upsert_is_keyed_by_uri() {
    let (db, _temp_dir) = create_test_db().await;

    let first = db.upsert_remote_actor(&remote_record("bob", None)).await.unwrap();

    let mut refreshed = remote_record("bob", Some("https://remote.example/inbox"));
    refreshed.display_name = "Bob".to_string();
    refreshed.public_key = Some((
        "https://remote.example/users/bob#rotated".to_string(),
        "rotated_key".to_string(),
    ));
    let second = db.upsert_remote_actor(&refreshed).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.display_name, "Bob");
    assert_eq!(
        second.shared_inbox.as_deref(),
        Some("https://remote.example/inbox")
    );

    // The old key record is replaced, not kept alongside the new one
    assert!(
        db.find_remote_key("https://remote.example/users/bob#main-key")
            .await
            .unwrap()
            .is_none()
    );
    let (key, owner) = db
        .find_remote_key("https://remote.example/users/bob#rotated")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key.public_key_pem, "rotated_key");
    assert_eq!(owner.id, first.id);
}

#[tokio::test]
async fn test_concurrent_upserts_collapse_to_one_row() {
    let (db, _temp_dir) = create_test_db().await;
    let db = std::sync::Arc::new(db);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.upsert_remote_actor(&remote_record("carol", None)).await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_follow_relation_insert_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    let bob = local_actor("bob", false);
    db.insert_local_actor(&alice).await.unwrap();
    db.insert_local_actor(&bob).await.unwrap();

    assert!(db.create_follow_relation(&relation(&alice, &bob, true)).await.unwrap());
    assert!(!db.create_follow_relation(&relation(&alice, &bob, true)).await.unwrap());

    let stored = db.get_follow_relation(&alice.id, &bob.id).await.unwrap();
    assert_eq!(FollowState::of(stored.as_ref()), FollowState::Pending);
}

#[tokio::test]
async fn test_dropped_transitions_leave_no_open_transaction() {
    let (db, _temp_dir) = create_test_db().await;
    let mut actors = Vec::new();
    for i in 0..21 {
        let actor = local_actor(&format!("user{}", i), false);
        db.insert_local_actor(&actor).await.unwrap();
        actors.push(actor);
    }
    let target = &actors[0];

    // Callers that give up while the transaction may be open
    for follower in &actors[1..] {
        let _ = tokio::time::timeout(
            std::time::Duration::from_micros(50),
            db.create_follow_relation(&relation(follower, target, true)),
        )
        .await;
    }

    for follower in &actors[1..] {
        db.create_follow_relation(&relation(follower, target, false))
            .await
            .unwrap();
        db.accept_follow_relation(&follower.id, &target.id)
            .await
            .unwrap();
    }

    let accepted = db.count_followers(&target.id).await.unwrap();
    assert_eq!(accepted, 20);
}

#[tokio::test]
async fn test_follow_relation_respects_blocks_in_both_directions() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    let bob = local_actor("bob", true);
    db.insert_local_actor(&alice).await.unwrap();
    db.insert_local_actor(&bob).await.unwrap();

    db.insert_block(&bob.id, &alice.id).await.unwrap();
    assert!(db.is_blocking_or_blocked(&alice.id, &bob.id).await.unwrap());

    assert!(matches!(
        db.create_follow_relation(&relation(&alice, &bob, false)).await,
        Err(AppError::CannotFollowBlock)
    ));
    assert!(
        db.get_follow_relation(&alice.id, &bob.id)
            .await
            .unwrap()
            .is_none()
    );

    assert!(db.delete_block(&bob.id, &alice.id).await.unwrap());
    assert!(!db.is_blocking_or_blocked(&alice.id, &bob.id).await.unwrap());
}

#[tokio::test]
async fn test_accept_only_flips_pending_rows() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    let bob = local_actor("bob", false);
    db.insert_local_actor(&alice).await.unwrap();
    db.insert_local_actor(&bob).await.unwrap();

    // Nothing to accept yet
    assert!(
        db.accept_follow_relation(&alice.id, &bob.id)
            .await
            .unwrap()
            .is_none()
    );

    db.create_follow_relation(&relation(&alice, &bob, true))
        .await
        .unwrap();
    let accepted = db.accept_follow_relation(&alice.id, &bob.id).await.unwrap();
    assert!(!accepted.unwrap().pending);

    // Second accept finds no pending row
    assert!(
        db.accept_follow_relation(&alice.id, &bob.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_delete_follow_relation_returns_removed_row() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    let bob = local_actor("bob", true);
    db.insert_local_actor(&alice).await.unwrap();
    db.insert_local_actor(&bob).await.unwrap();

    let edge = relation(&alice, &bob, false);
    db.create_follow_relation(&edge).await.unwrap();

    let removed = db.delete_follow_relation(&alice.id, &bob.id).await.unwrap();
    assert_eq!(removed.unwrap().id, edge.id);
    assert!(
        db.delete_follow_relation(&alice.id, &bob.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_follower_inboxes_prefer_shared_inbox_and_skip_pending() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", false);
    db.insert_local_actor(&alice).await.unwrap();

    let bob = db
        .upsert_remote_actor(&remote_record("bob", Some("https://remote.example/inbox")))
        .await
        .unwrap();
    let carol = db.upsert_remote_actor(&remote_record("carol", None)).await.unwrap();
    let dave = db.upsert_remote_actor(&remote_record("dave", None)).await.unwrap();

    db.create_follow_relation(&relation(&bob, &alice, false))
        .await
        .unwrap();
    db.create_follow_relation(&relation(&carol, &alice, false))
        .await
        .unwrap();
    db.create_follow_relation(&relation(&dave, &alice, true))
        .await
        .unwrap();

    let mut inboxes = db.follower_inboxes(&alice.id).await.unwrap();
    inboxes.sort();
    assert_eq!(
        inboxes,
        vec![
            "https://remote.example/inbox".to_string(),
            "https://remote.example/users/carol/inbox".to_string(),
        ]
    );
    assert_eq!(db.count_followers(&alice.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_note_insert_with_mentions() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    db.insert_local_actor(&alice).await.unwrap();
    let bob = db.upsert_remote_actor(&remote_record("bob", None)).await.unwrap();

    let note = Note {
        id: EntityId::new().0,
        uri: None,
        author_id: alice.id.clone(),
        content: "hello @bob".to_string(),
        visibility_raw: Visibility::Private.as_str().to_string(),
        reply_to_id: None,
        renote_of_id: None,
        sensitive: false,
        created_at: Utc::now(),
        updated_at: None,
    };
    db.insert_note(&note, std::slice::from_ref(&bob.id))
        .await
        .unwrap();

    let stored = db.get_note(&note.id).await.unwrap().unwrap();
    assert_eq!(stored.visibility(), Visibility::Private);

    let mentions = db.note_mentions(&note.id).await.unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].id, bob.id);
}

#[tokio::test]
async fn test_remote_note_duplicates_are_ignored_and_updates_need_author() {
    let (db, _temp_dir) = create_test_db().await;
    let bob = db.upsert_remote_actor(&remote_record("bob", None)).await.unwrap();
    let carol = db.upsert_remote_actor(&remote_record("carol", None)).await.unwrap();

    let mut note = Note {
        id: EntityId::new().0,
        uri: Some("https://remote.example/notes/1".to_string()),
        author_id: bob.id.clone(),
        content: "first".to_string(),
        visibility_raw: "public".to_string(),
        reply_to_id: None,
        renote_of_id: None,
        sensitive: false,
        created_at: Utc::now(),
        updated_at: None,
    };
    assert!(db.insert_remote_note(&note, &[]).await.unwrap());

    let mut duplicate = note.clone();
    duplicate.id = EntityId::new().0;
    assert!(!db.insert_remote_note(&duplicate, &[]).await.unwrap());

    note.content = "edited".to_string();
    note.updated_at = Some(Utc::now());
    assert!(db.update_remote_note(&note).await.unwrap());

    let mut forged = note.clone();
    forged.author_id = carol.id.clone();
    forged.content = "forged".to_string();
    assert!(!db.update_remote_note(&forged).await.unwrap());

    let stored = db
        .get_note_by_uri("https://remote.example/notes/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.content, "edited");
}

#[tokio::test]
async fn test_local_note_edit_stamps_updated_at() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = local_actor("alice", true);
    let eve = local_actor("eve", true);
    db.insert_local_actor(&alice).await.unwrap();
    db.insert_local_actor(&eve).await.unwrap();

    let note = Note {
        id: EntityId::new().0,
        uri: None,
        author_id: alice.id.clone(),
        content: "draft".to_string(),
        visibility_raw: "public".to_string(),
        reply_to_id: None,
        renote_of_id: None,
        sensitive: false,
        created_at: Utc::now(),
        updated_at: None,
    };
    db.insert_note(&note, &[]).await.unwrap();

    assert!(
        db.update_local_note(&note.id, &eve.id, "hijacked", false)
            .await
            .unwrap()
            .is_none()
    );

    let edited = db
        .update_local_note(&note.id, &alice.id, "final", true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edited.content, "final");
    assert!(edited.sensitive);
    assert!(edited.updated_at.is_some());
}

#[tokio::test]
async fn test_nodeinfo_counts_skip_instance_actor_and_remote_rows() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_local_actor(&local_actor("instance", false))
        .await
        .unwrap();
    let alice = local_actor("alice", true);
    db.insert_local_actor(&alice).await.unwrap();
    let bob = db.upsert_remote_actor(&remote_record("bob", None)).await.unwrap();

    assert_eq!(db.count_local_users("instance").await.unwrap(), 1);

    let note = |author_id: &str, uri: Option<&str>| Note {
        id: EntityId::new().0,
        uri: uri.map(ToString::to_string),
        author_id: author_id.to_string(),
        content: "hello".to_string(),
        visibility_raw: "public".to_string(),
        reply_to_id: None,
        renote_of_id: None,
        sensitive: false,
        created_at: Utc::now(),
        updated_at: None,
    };
    db.insert_note(&note(&alice.id, None), &[]).await.unwrap();
    db.insert_remote_note(&note(&bob.id, Some("https://remote.example/notes/9")), &[])
        .await
        .unwrap();

    assert_eq!(db.count_local_notes().await.unwrap(), 1);
}
