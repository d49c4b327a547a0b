//! E2E tests for the follow lifecycle across two servers

mod common;

use common::{RemoteInstance, TestServer};
use lightpub::data::FollowState;
use serde_json::json;

#[tokio::test]
async fn test_local_follow_of_remote_is_pending_until_accepted() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", true).await;
    let alice = server.create_actor("alice", false).await;
    let bob = server.resolve_remote(&remote).await;
    assert!(bob.is_remote());
    assert_eq!(bob.preferred_inbox(), Some(format!("{}/inbox", remote.base).as_str()));

    let state = server
        .state
        .follows
        .follow(&alice, &bob, None, &server.ctx())
        .await
        .unwrap();
    assert_eq!(state, FollowState::Pending);

    // The Follow reaches bob's shared inbox
    let received = remote.wait_for_activities(1).await;
    let follow = &received[0];
    assert_eq!(follow["type"], "Follow");
    assert_eq!(follow["actor"], server.actor_uri(&alice));
    assert_eq!(follow["object"], remote.actor_uri());
    let follow_id = follow["id"].as_str().unwrap().to_string();
    assert!(follow_id.starts_with(&server.url("/follows/")));

    // Bob accepts
    let accept = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/accepts/1", remote.actor_uri()),
        "type": "Accept",
        "actor": remote.actor_uri(),
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": server.actor_uri(&alice),
            "object": remote.actor_uri()
        }
    });
    let response = remote.deliver(&server, "/users/alice/inbox", &accept).await;
    assert_eq!(response.status(), 202);

    let state = server.state.follows.state(&alice, &bob).await.unwrap();
    assert_eq!(state, FollowState::Accepted);

    // Redelivery is a no-op
    let response = remote.deliver(&server, "/inbox", &accept).await;
    assert_eq!(response.status(), 202);
    let state = server.state.follows.state(&alice, &bob).await.unwrap();
    assert_eq!(state, FollowState::Accepted);

    // Alice unfollows, bob is told
    assert!(
        server
            .state
            .follows
            .undo(&alice, &bob, &server.ctx())
            .await
            .unwrap()
    );
    let state = server.state.follows.state(&alice, &bob).await.unwrap();
    assert_eq!(state, FollowState::None);

    let received = remote.wait_for_activities(2).await;
    let undo = &received[1];
    assert_eq!(undo["type"], "Undo");
    assert_eq!(undo["actor"], server.actor_uri(&alice));
    assert_eq!(undo["object"]["type"], "Follow");
    assert_eq!(undo["object"]["id"], follow_id.as_str());
}

#[tokio::test]
async fn test_remote_reject_removes_pending_follow() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", true).await;
    let alice = server.create_actor("alice", false).await;
    let bob = server.resolve_remote(&remote).await;

    server
        .state
        .follows
        .follow(&alice, &bob, None, &server.ctx())
        .await
        .unwrap();
    let received = remote.wait_for_activities(1).await;
    let follow_id = received[0]["id"].as_str().unwrap().to_string();

    let reject = json!({
        "id": format!("{}/rejects/1", remote.actor_uri()),
        "type": "Reject",
        "actor": remote.actor_uri(),
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": server.actor_uri(&alice),
            "object": remote.actor_uri()
        }
    });
    let response = remote.deliver(&server, "/inbox", &reject).await;
    assert_eq!(response.status(), 202);

    let state = server.state.follows.state(&alice, &bob).await.unwrap();
    assert_eq!(state, FollowState::None);
}

#[tokio::test]
async fn test_inbound_follow_is_auto_accepted_and_undone() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", true).await;

    let follow_id = format!("{}/follows/1", remote.actor_uri());
    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": follow_id,
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.actor_uri(&alice)
    });
    let response = remote.deliver(&server, "/inbox", &follow).await;
    assert_eq!(response.status(), 202);

    // Verifying the signature cached bob
    let bob = server
        .state
        .db
        .get_remote_actor_by_uri(&remote.actor_uri())
        .await
        .unwrap()
        .expect("signer should be cached");
    let state = server.state.follows.state(&bob, &alice).await.unwrap();
    assert_eq!(state, FollowState::Accepted);

    let received = remote.wait_for_activities(1).await;
    let accept = &received[0];
    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], server.actor_uri(&alice));
    assert_eq!(accept["object"]["id"], follow_id.as_str());
    assert_eq!(accept["object"]["actor"], remote.actor_uri());

    let undo = json!({
        "id": format!("{}/undo", follow_id),
        "type": "Undo",
        "actor": remote.actor_uri(),
        "object": follow
    });
    let response = remote.deliver(&server, "/users/alice/inbox", &undo).await;
    assert_eq!(response.status(), 202);

    let state = server.state.follows.state(&bob, &alice).await.unwrap();
    assert_eq!(state, FollowState::None);
    assert_eq!(server.state.db.count_followers(&alice.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_manual_approval_then_local_accept_and_reject() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", false).await;

    let follow = json!({
        "id": format!("{}/follows/7", remote.actor_uri()),
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.actor_uri(&alice)
    });
    let response = remote.deliver(&server, "/users/alice/inbox", &follow).await;
    assert_eq!(response.status(), 202);

    let bob = server.resolve_remote(&remote).await;
    let state = server.state.follows.state(&bob, &alice).await.unwrap();
    assert_eq!(state, FollowState::Pending);

    assert!(
        server
            .state
            .follows
            .accept(&alice, &bob, &server.ctx())
            .await
            .unwrap()
    );
    let received = remote.wait_for_activities(1).await;
    assert_eq!(received[0]["type"], "Accept");
    assert_eq!(server.state.db.count_followers(&alice.id).await.unwrap(), 1);

    // Accepting again finds nothing pending
    assert!(
        !server
            .state
            .follows
            .accept(&alice, &bob, &server.ctx())
            .await
            .unwrap()
    );

    assert!(
        server
            .state
            .follows
            .reject(&alice, &bob, &server.ctx())
            .await
            .unwrap()
    );
    let received = remote.wait_for_activities(2).await;
    assert_eq!(received[1]["type"], "Reject");
    assert_eq!(received[1]["object"]["actor"], remote.actor_uri());

    let state = server.state.follows.state(&bob, &alice).await.unwrap();
    assert_eq!(state, FollowState::None);
}
