//! E2E tests for actor documents and the inbox pipeline

mod common;

use common::{RemoteInstance, TestServer};
use serde_json::{Value, json};

const ACTIVITY_JSON: &str = "application/activity+json";

#[tokio::test]
async fn test_actor_document_requires_activity_accept() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice", false).await;

    let response = server
        .client
        .get(server.url("/users/alice"))
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with(ACTIVITY_JSON)
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["id"], server.actor_uri(&alice));
    assert_eq!(json["type"], "Person");
    assert_eq!(json["inbox"], server.url("/users/alice/inbox"));
    assert_eq!(json["endpoints"]["sharedInbox"], server.url("/inbox"));
    assert_eq!(json["manuallyApprovesFollowers"], true);
    assert_eq!(json["publicKey"]["owner"], server.actor_uri(&alice));
    assert!(
        json["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );

    let response = server
        .client
        .get(server.url("/users/alice"))
        .header("Accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 406);

    let response = server
        .client
        .get(server.url("/users/nobody"))
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_inbox_rejects_non_activity_content_type() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", "text/plain")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 415);
}

#[tokio::test]
async fn test_inbox_rejects_unsigned_and_tampered_requests() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", true).await;

    let follow = json!({
        "id": format!("{}/follows/1", remote.actor_uri()),
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.actor_uri(&alice)
    });
    let body = serde_json::to_vec(&follow).unwrap();

    // No signature at all
    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", ACTIVITY_JSON)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Body swapped after signing
    let url = server.url("/inbox");
    let signed = remote.sign(&url, &body);
    let tampered = serde_json::to_vec(&json!({
        "id": format!("{}/follows/2", remote.actor_uri()),
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.actor_uri(&alice)
    }))
    .unwrap();
    let response = signed
        .apply(server.client.post(&url))
        .body(tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Signed for another path
    let signed = remote.sign(&server.url("/users/alice/inbox"), &body);
    let response = signed
        .apply(server.client.post(&url))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Nothing was written
    let followers = server.state.db.count_followers(&alice.id).await.unwrap();
    assert_eq!(followers, 0);
}

#[tokio::test]
async fn test_inbox_rejects_unknown_activity_type() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    server.create_actor("alice", true).await;

    let bogus = json!({
        "id": format!("{}/bogus/1", remote.actor_uri()),
        "type": "Bogus",
        "actor": remote.actor_uri(),
        "object": server.url("/users/alice")
    });
    let response = remote.deliver(&server, "/inbox", &bogus).await;
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Bogus"));
}

#[tokio::test]
async fn test_inbox_rejects_activity_signed_by_someone_else() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", true).await;

    let forged = json!({
        "id": format!("{}/users/mallory/follows/1", remote.base),
        "type": "Follow",
        "actor": format!("{}/users/mallory", remote.base),
        "object": server.actor_uri(&alice)
    });
    let response = remote.deliver(&server, "/inbox", &forged).await;
    assert_eq!(response.status(), 401);
    assert_eq!(server.state.db.count_followers(&alice.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_inbox_rejects_accept_for_someone_elses_follow() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", false).await;

    let accept = json!({
        "id": format!("{}/accepts/1", remote.actor_uri()),
        "type": "Accept",
        "actor": remote.actor_uri(),
        "object": {
            "id": server.url("/follows/01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            "type": "Follow",
            "actor": server.actor_uri(&alice),
            "object": format!("{}/users/carol", remote.base)
        }
    });
    let response = remote.deliver(&server, "/inbox", &accept).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_personal_inbox_of_unknown_user_is_not_found() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;

    let follow = json!({
        "id": format!("{}/follows/1", remote.actor_uri()),
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.url("/users/nobody")
    });
    let response = remote.deliver(&server, "/users/nobody/inbox", &follow).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_followers_collection_counts_accepted_followers() {
    let server = TestServer::new().await;
    let remote = RemoteInstance::start("bob", false).await;
    let alice = server.create_actor("alice", true).await;

    let follow = json!({
        "id": format!("{}/follows/1", remote.actor_uri()),
        "type": "Follow",
        "actor": remote.actor_uri(),
        "object": server.actor_uri(&alice)
    });
    let response = remote.deliver(&server, "/inbox", &follow).await;
    assert_eq!(response.status(), 202);

    let response = server
        .client
        .get(server.url("/users/alice/followers"))
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "OrderedCollection");
    assert_eq!(json["id"], server.url("/users/alice/followers"));
    assert_eq!(json["totalItems"], 1);
}
