//! Lightpub - an ActivityPub federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inboxes, notes)           │
//! │  - WebFinger / NodeInfo                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Follow state machine                                     │
//! │  - Note publication and ingestion                           │
//! │  - Inbox processing                                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Activity codec, HTTP signatures                          │
//! │  - Actor resolution (WebFinger), delivery                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `service`: Follow, note and inbox logic
//! - `federation`: ActivityPub protocol handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `context`: Cancellation and deadlines
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use federation::{
    ActorResolver, DeliveryDispatcher, LocalUrls, RemoteFetcher, SignOptions, VerifyOptions,
};
use service::{FollowService, InboxProcessor, NoteService};

/// Size of the RSA keys generated for local actors
const LOCAL_KEY_BITS: usize = 2048;

/// Inbound request bodies larger than this are rejected
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like database pool, services, and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Actor and key resolution (cache, WebFinger, remote fetch)
    pub resolver: Arc<ActorResolver>,

    /// Outbound activity delivery
    pub delivery: DeliveryDispatcher,

    /// Follow state machine
    pub follows: Arc<FollowService>,

    /// Note publication and ingestion
    pub notes: Arc<NoteService>,

    /// Inbound activity pipeline
    pub inbox: Arc<InboxProcessor>,

    /// URL scheme for local objects
    pub urls: LocalUrls,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Validate configuration
    /// 2. Connect to SQLite database
    /// 3. Build the HTTP client and federation components
    /// 4. Ensure the instance actor exists
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");
        config.validate()?;

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = federation::build_http_client(
            &config.federation.user_agent,
            config.federation.http_timeout(),
        )?;

        // 3. Federation components
        let sign_options = SignOptions {
            expiry: config.federation.signature_expiry(),
            ..SignOptions::default()
        };
        let fetcher = RemoteFetcher::new(
            http_client.clone(),
            config.federation.allow_private_hosts,
            sign_options,
        );
        let resolver = Arc::new(ActorResolver::new(db.clone(), fetcher.clone(), &config));
        let urls = LocalUrls::new(config.server.base_url());

        let delivery = DeliveryDispatcher::new(
            fetcher,
            sign_options,
            resolver.clone(),
            config.federation.delivery_concurrency,
        );

        // 4. Services
        let follows = Arc::new(FollowService::new(
            db.clone(),
            delivery.clone(),
            urls.clone(),
        ));
        let notes = Arc::new(NoteService::new(db.clone(), delivery.clone(), urls.clone()));
        let inbox = Arc::new(InboxProcessor::new(
            resolver.clone(),
            follows.clone(),
            notes.clone(),
            VerifyOptions {
                max_age: config.federation.signature_expiry(),
                clock_skew: config.federation.clock_skew(),
            },
        ));

        // 5. Instance actor
        Self::ensure_instance_actor(&db, &config).await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client: Arc::new(http_client),
            resolver,
            delivery,
            follows,
            notes,
            inbox,
            urls,
        })
    }

    /// Create a local actor with a fresh key pair
    pub async fn create_local_actor(
        &self,
        username: &str,
        display_name: &str,
        auto_follow_accept: bool,
    ) -> Result<data::Actor, error::AppError> {
        create_local_actor(&self.db, username, display_name, auto_follow_accept, false).await
    }

    /// Ensure the instance actor exists
    ///
    /// The instance actor signs server-originated fetches. It is created with
    /// a fresh key pair the first time the server starts.
    async fn ensure_instance_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<(), error::AppError> {
        let username = &config.instance.actor_username;

        if let Some(actor) = db.get_local_actor_by_username(username).await? {
            tracing::info!(username = %actor.username, "Instance actor exists");
            return Ok(());
        }

        tracing::info!("Creating instance actor...");
        let actor =
            create_local_actor(db, username, &config.instance.display_name, false, true).await?;
        tracing::info!(
            username = %actor.username,
            id = %actor.id,
            "Instance actor created"
        );

        Ok(())
    }
}

async fn create_local_actor(
    db: &data::Database,
    username: &str,
    display_name: &str,
    auto_follow_accept: bool,
    is_bot: bool,
) -> Result<data::Actor, error::AppError> {
    if username.is_empty()
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(error::AppError::Validation(format!(
            "invalid username: {:?}",
            username
        )));
    }

    let (private_key_pem, public_key_pem) = generate_key_pair().await?;

    let actor = data::Actor {
        id: data::EntityId::new().0,
        username: username.to_string(),
        domain: String::new(),
        display_name: display_name.to_string(),
        bio: String::new(),
        uri: None,
        inbox: None,
        shared_inbox: None,
        outbox: None,
        followers_url: None,
        following_url: None,
        public_key_pem: Some(public_key_pem),
        private_key_pem: Some(private_key_pem),
        auto_follow_accept,
        is_bot,
        fetched_at: None,
        created_at: chrono::Utc::now(),
    };

    db.insert_local_actor(&actor).await?;
    Ok(actor)
}

/// Generate an RSA key pair as (PKCS#8 private PEM, SPKI public PEM)
async fn generate_key_pair() -> Result<(String, String), error::AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    tokio::task::spawn_blocking(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, LOCAL_KEY_BITS)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        Ok::<_, error::AppError>((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| error::AppError::Internal(e.into()))?
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    metrics::init_metrics();

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(axum::middleware::from_fn(api::track_http_metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config::tests::valid_config();
        config.database.path = temp_dir.path().join("test.db");
        let state = AppState::new(config).await.unwrap();
        (state, temp_dir)
    }

    #[tokio::test]
    async fn bootstrap_creates_instance_actor_once() {
        let (state, _temp_dir) = test_state().await;

        let instance = state
            .db
            .get_local_actor_by_username("instance")
            .await
            .unwrap()
            .expect("instance actor should exist");
        assert!(instance.is_bot);
        assert!(
            instance
                .private_key_pem
                .as_deref()
                .unwrap()
                .contains("BEGIN PRIVATE KEY")
        );

        // A second start keeps the existing key
        let config = (*state.config).clone();
        let again = AppState::new(config).await.unwrap();
        let same = again
            .db
            .get_local_actor_by_username("instance")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(same.id, instance.id);
        assert_eq!(same.private_key_pem, instance.private_key_pem);
    }

    #[tokio::test]
    async fn invalid_usernames_are_rejected() {
        let (state, _temp_dir) = test_state().await;

        for username in ["", "has space", "a/b", "ünï"] {
            assert!(matches!(
                state.create_local_actor(username, "x", false).await,
                Err(error::AppError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn router_serves_instance_actor_as_service() {
        let (state, _temp_dir) = test_state().await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/users/instance")
                    .header("Accept", "application/activity+json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "Service");
        assert_eq!(json["id"], "https://local.example/users/instance");
    }
}
