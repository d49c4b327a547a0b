//! Common test utilities for E2E tests
//!
//! `TestServer` runs the full router on a loopback port. `RemoteInstance` is
//! a minimal fake ActivityPub server on another port: it serves WebFinger and
//! one actor document, signs activities with its own key, and records every
//! inbox POST it receives. It counts actor document fetches and can rotate
//! its key, for cache expiry tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::HeaderMap;
use lightpub::context::OpContext;
use lightpub::data::{Actor, RemoteActorRecord};
use lightpub::federation::{
    ACTIVITY_JSON, ActorDocument, ActorEndpoints, PublicKey, SignOptions, SignatureHeaders,
    UserSpecifier, sign_request,
};
use lightpub::{AppState, config};
use serde::Deserialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first: the local domain includes the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let domain = format!("127.0.0.1:{}", addr.port());

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: domain.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                signature_expiry_seconds: 3600,
                clock_skew_seconds: 300,
                actor_ttl_seconds: 86_400,
                delivery_concurrency: 4,
                http_timeout_seconds: 5,
                inbound_deadline_seconds: 10,
                webfinger_scheme: "http".to_string(),
                allow_private_hosts: true,
                user_agent: "Lightpub/test".to_string(),
            },
            instance: config::InstanceConfig {
                actor_username: "instance".to_string(),
                display_name: "Test Instance".to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = lightpub::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            domain,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn ctx(&self) -> OpContext {
        OpContext::with_timeout(Duration::from_secs(10))
    }

    /// Create a local actor with a real key pair
    pub async fn create_actor(&self, username: &str, auto_follow_accept: bool) -> Actor {
        self.state
            .create_local_actor(username, username, auto_follow_accept)
            .await
            .unwrap()
    }

    pub fn actor_uri(&self, actor: &Actor) -> String {
        self.state.urls.actor_uri(actor)
    }

    /// Backdate the cached copy of the remote actor (and its key) by `hours`
    pub async fn age_cached_actor(&self, remote: &RemoteInstance, hours: i64) {
        let db = &self.state.db;
        let actor = db
            .get_remote_actor_by_uri(&remote.actor_uri())
            .await
            .unwrap()
            .expect("remote actor should be cached");
        let (key, _) = db.find_remote_key(&remote.key_id()).await.unwrap().unwrap();

        db.upsert_remote_actor(&RemoteActorRecord {
            uri: remote.actor_uri(),
            username: actor.username,
            domain: actor.domain,
            display_name: actor.display_name,
            bio: actor.bio,
            inbox: actor.inbox,
            shared_inbox: actor.shared_inbox,
            outbox: actor.outbox,
            followers_url: actor.followers_url,
            following_url: actor.following_url,
            auto_follow_accept: actor.auto_follow_accept,
            is_bot: actor.is_bot,
            public_key: Some((key.key_id, key.public_key_pem)),
            fetched_at: chrono::Utc::now() - chrono::Duration::hours(hours),
        })
        .await
        .unwrap();
    }

    /// Resolve the remote instance's actor through WebFinger
    pub async fn resolve_remote(&self, remote: &RemoteInstance) -> Actor {
        let spec = UserSpecifier::parse(&remote.acct(), &self.domain).unwrap();
        self.state.resolver.resolve(&spec, &self.ctx()).await.unwrap()
    }
}

/// Shared state of the fake remote server
#[derive(Clone)]
struct RemoteState {
    base: String,
    domain: String,
    username: String,
    public_key_pem: Arc<Mutex<String>>,
    manually_approves_followers: bool,
    received: Arc<Mutex<Vec<Value>>>,
    actor_fetches: Arc<AtomicUsize>,
}

/// Fake remote ActivityPub server with one actor
pub struct RemoteInstance {
    pub base: String,
    pub domain: String,
    pub username: String,
    private_key_pem: Mutex<String>,
    public_key_pem: Arc<Mutex<String>>,
    received: Arc<Mutex<Vec<Value>>>,
    actor_fetches: Arc<AtomicUsize>,
}

impl RemoteInstance {
    pub async fn start(username: &str, manually_approves_followers: bool) -> Self {
        let (private_key_pem, public_key_pem) = generate_keypair();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let domain = format!("127.0.0.1:{}", addr.port());
        let base = format!("http://{}", domain);
        let received = Arc::new(Mutex::new(Vec::new()));
        let public_key_pem = Arc::new(Mutex::new(public_key_pem));
        let actor_fetches = Arc::new(AtomicUsize::new(0));

        let state = RemoteState {
            base: base.clone(),
            domain: domain.clone(),
            username: username.to_string(),
            public_key_pem: public_key_pem.clone(),
            manually_approves_followers,
            received: received.clone(),
            actor_fetches: actor_fetches.clone(),
        };

        let app = Router::new()
            .route("/.well-known/webfinger", get(remote_webfinger))
            .route("/users/:name", get(remote_actor))
            .route("/users/:name/inbox", post(remote_inbox))
            .route("/inbox", post(remote_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            domain,
            username: username.to_string(),
            private_key_pem: Mutex::new(private_key_pem),
            public_key_pem,
            received,
            actor_fetches,
        }
    }

    /// Replace the actor's key pair; the actor document serves the new key
    pub fn rotate_key(&self) {
        let (private_key_pem, public_key_pem) = generate_keypair();
        *self.private_key_pem.lock().unwrap() = private_key_pem;
        *self.public_key_pem.lock().unwrap() = public_key_pem;
    }

    /// Number of times the actor document was fetched
    pub fn actor_fetches(&self) -> usize {
        self.actor_fetches.load(Ordering::SeqCst)
    }

    pub fn acct(&self) -> String {
        format!("@{}@{}", self.username, self.domain)
    }

    pub fn actor_uri(&self) -> String {
        format!("{}/users/{}", self.base, self.username)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_uri())
    }

    pub fn followers_uri(&self) -> String {
        format!("{}/followers", self.actor_uri())
    }

    /// Sign a POST of `body` to `url` with this actor's key
    pub fn sign(&self, url: &str, body: &[u8]) -> SignatureHeaders {
        let mut preset = HeaderMap::new();
        preset.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(ACTIVITY_JSON),
        );
        sign_request(
            "POST",
            url,
            &preset,
            Some(body),
            &self.private_key_pem.lock().unwrap(),
            &self.key_id(),
            &SignOptions::default(),
        )
        .unwrap()
    }

    /// POST a signed activity to `path` on `server`
    pub async fn deliver(&self, server: &TestServer, path: &str, activity: &Value) -> reqwest::Response {
        let url = server.url(path);
        let body = serde_json::to_vec(activity).unwrap();
        let signed = self.sign(&url, &body);

        signed
            .apply(server.client.post(&url))
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Activities received so far
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` activities arrived
    ///
    /// Outbound delivery runs in the background, so tests poll.
    pub async fn wait_for_activities(&self, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "expected {} activities, got {:?}",
            count,
            self.received()
        );
    }
}

#[derive(Deserialize)]
struct WebFingerQuery {
    resource: String,
}

async fn remote_webfinger(
    State(state): State<RemoteState>,
    Query(query): Query<WebFingerQuery>,
) -> Response {
    if query.resource != format!("acct:{}@{}", state.username, state.domain) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let actor = format!("{}/users/{}", state.base, state.username);
    let body = serde_json::json!({
        "subject": query.resource,
        "links": [
            { "rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": actor },
            { "rel": "self", "type": ACTIVITY_JSON, "href": actor }
        ]
    });
    (
        [(http::header::CONTENT_TYPE, "application/jrd+json")],
        body.to_string(),
    )
        .into_response()
}

async fn remote_actor(State(state): State<RemoteState>, Path(name): Path<String>) -> Response {
    if name != state.username {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.actor_fetches.fetch_add(1, Ordering::SeqCst);

    let id = format!("{}/users/{}", state.base, state.username);
    let document = ActorDocument {
        id: id.clone(),
        kind: "Person".to_string(),
        preferred_username: Some(state.username.clone()),
        name: Some(state.username.clone()),
        summary: None,
        inbox: Some(format!("{}/inbox", id)),
        outbox: None,
        followers: Some(format!("{}/followers", id)),
        following: None,
        endpoints: ActorEndpoints {
            shared_inbox: Some(format!("{}/inbox", state.base)),
        },
        url: None,
        manually_approves_followers: state.manually_approves_followers,
        public_key: Some(PublicKey {
            id: format!("{}#main-key", id),
            owner: id,
            public_key_pem: state.public_key_pem.lock().unwrap().clone(),
        }),
    };

    (
        [(http::header::CONTENT_TYPE, ACTIVITY_JSON)],
        document.to_json().unwrap().to_string(),
    )
        .into_response()
}

async fn remote_inbox(State(state): State<RemoteState>, body: axum::body::Bytes) -> StatusCode {
    match serde_json::from_slice::<Value>(&body) {
        Ok(activity) => {
            state.received.lock().unwrap().push(activity);
            StatusCode::ACCEPTED
        }
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

/// Generate an RSA key pair as (PKCS#8 private PEM, SPKI public PEM)
pub fn generate_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public_key = RsaPublicKey::from(&private_key);

    (
        private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    )
}
