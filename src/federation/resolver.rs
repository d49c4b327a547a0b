//! Actor resolution
//!
//! Turns a user specifier (local id, `user@domain`, or profile URI) into a
//! stored [`Actor`], fetching and caching remote actor documents as needed.
//! Also resolves signature key ids to their owning actors and hands out
//! local signing keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;

use super::actor::{ActorDocument, LocalUrls};
use super::delivery::SigningKeyResolver;
use super::fetch::{RemoteFetcher, RequestSigner};
use super::signature::{PublicKeyResolver, ResolvedKey};
use super::webfinger::{parse_acct, resolve_webfinger};
use crate::config::AppConfig;
use crate::context::OpContext;
use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;
use crate::metrics::ACTOR_FETCHES_TOTAL;

/// How a caller names an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSpecifier {
    /// Local row id
    LocalId(String),
    /// Local username
    Local(String),
    /// `username@domain` on another server
    Remote { username: String, domain: String },
    /// ActivityPub id
    Uri(String),
}

impl UserSpecifier {
    /// Parse user input
    ///
    /// Accepts `https://...` URIs, `user@domain` / `@user@domain` /
    /// `acct:user@domain` addresses, local ids and bare local usernames.
    /// An address on `local_domain` becomes [`UserSpecifier::Local`].
    pub fn parse(input: &str, local_domain: &str) -> Result<Self, AppError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AppError::Validation("empty user specifier".to_string()));
        }

        if input.starts_with("https://") || input.starts_with("http://") {
            return Ok(UserSpecifier::Uri(input.to_string()));
        }

        let bare = input.strip_prefix('@').unwrap_or(input);
        if input.starts_with("acct:") || bare.contains('@') {
            let (username, domain) = parse_acct(input)?;
            if domain.eq_ignore_ascii_case(local_domain) {
                return Ok(UserSpecifier::Local(username.to_string()));
            }
            return Ok(UserSpecifier::Remote {
                username: username.to_string(),
                domain: domain.to_ascii_lowercase(),
            });
        }

        if EntityId::is_valid(bare) {
            return Ok(UserSpecifier::LocalId(bare.to_string()));
        }

        Ok(UserSpecifier::Local(bare.to_string()))
    }
}

/// Actor resolver backed by the store and the federation client
pub struct ActorResolver {
    db: Arc<Database>,
    fetcher: RemoteFetcher,
    urls: LocalUrls,
    local_domain: String,
    webfinger_scheme: String,
    actor_ttl: Duration,
    instance_username: String,
}

impl ActorResolver {
    pub fn new(db: Arc<Database>, fetcher: RemoteFetcher, config: &AppConfig) -> Self {
        Self {
            db,
            fetcher,
            urls: LocalUrls::new(config.server.base_url()),
            local_domain: config.server.domain.clone(),
            webfinger_scheme: config.federation.webfinger_scheme.clone(),
            actor_ttl: config.federation.actor_ttl(),
            instance_username: config.instance.actor_username.clone(),
        }
    }

    pub fn urls(&self) -> &LocalUrls {
        &self.urls
    }

    /// Resolve a specifier to a stored actor
    pub async fn resolve(&self, spec: &UserSpecifier, ctx: &OpContext) -> Result<Actor, AppError> {
        match spec {
            UserSpecifier::LocalId(id) => self
                .db
                .get_actor(id)
                .await?
                .ok_or_else(|| AppError::ActorNotFound(id.clone())),
            UserSpecifier::Local(username) => self.local_actor(username).await,
            UserSpecifier::Remote { username, domain } => {
                if domain.eq_ignore_ascii_case(&self.local_domain) {
                    return self.local_actor(username).await;
                }

                if let Some(actor) = self.db.get_remote_actor_by_acct(username, domain).await? {
                    if !actor.is_stale(self.actor_ttl, Utc::now()) {
                        return Ok(actor);
                    }
                }

                let found = resolve_webfinger(
                    &self.fetcher,
                    &self.webfinger_scheme,
                    username,
                    domain,
                    &self.local_domain,
                    ctx,
                )
                .await?;
                self.resolve_uri(&found.actor_uri, ctx).await
            }
            UserSpecifier::Uri(uri) => self.resolve_uri(uri, ctx).await,
        }
    }

    /// Resolve an ActivityPub id, using the cached copy while it is fresh
    pub async fn resolve_uri(&self, uri: &str, ctx: &OpContext) -> Result<Actor, AppError> {
        if let Some(username) = self.urls.local_username(uri) {
            return self.local_actor(username).await;
        }

        if let Some(actor) = self.db.get_remote_actor_by_uri(uri).await? {
            if !actor.is_stale(self.actor_ttl, Utc::now()) {
                return Ok(actor);
            }
            tracing::debug!(%uri, "Cached actor is stale, refreshing");
        }

        self.refresh_actor(uri, ctx).await
    }

    /// Fetch a remote actor document and store it, regardless of cache age
    pub async fn refresh_actor(&self, uri: &str, ctx: &OpContext) -> Result<Actor, AppError> {
        if self.urls.local_username(uri).is_some() {
            return Err(AppError::Validation(format!("{} is a local actor", uri)));
        }

        let result: Result<Actor, AppError> = async {
            let signer = self.instance_signer().await?;
            let fetched = self
                .fetcher
                .get_activity_json::<ActorDocument>(uri, signer.as_ref(), ctx)
                .await?;
            self.store_document(fetched.document, &fetched.url, ctx).await
        }
        .await;

        match &result {
            Ok(actor) => {
                ACTOR_FETCHES_TOTAL.with_label_values(&["success"]).inc();
                tracing::info!(
                    %uri,
                    username = %actor.username,
                    domain = %actor.domain,
                    "Fetched remote actor"
                );
            }
            Err(error) => {
                ACTOR_FETCHES_TOTAL.with_label_values(&["failure"]).inc();
                tracing::warn!(%uri, %error, "Failed to fetch remote actor");
            }
        }

        result
    }

    /// Resolve a signature key id to its public key and owning actor
    ///
    /// Local key ids resolve against the store. Remote keys are served from
    /// the store while their owner is fresh; otherwise the key id URL is
    /// fetched, following `owner` when it yields a bare key document.
    pub async fn resolve_public_key(
        &self,
        key_id: &str,
        ctx: &OpContext,
    ) -> Result<ResolvedKey, AppError> {
        if let Some(username) = self.urls.local_username(key_id) {
            let actor = self.local_actor(username).await?;
            let public_key_pem = actor
                .public_key_pem
                .clone()
                .ok_or_else(|| AppError::ActorNotFound(key_id.to_string()))?;
            return Ok(ResolvedKey {
                actor_uri: self.urls.actor(&actor.username),
                actor_id: actor.id,
                public_key_pem,
            });
        }

        if let Some((key, owner)) = self.db.find_remote_key(key_id).await? {
            if !owner.is_stale(self.actor_ttl, Utc::now()) {
                return resolved_remote_key(key.public_key_pem, owner);
            }
        }

        let signer = self.instance_signer().await?;
        let fetched = self
            .fetcher
            .get_activity_json::<Value>(key_id, signer.as_ref(), ctx)
            .await?;

        if fetched.document.get("publicKey").is_some() {
            let document: ActorDocument = serde_json::from_value(fetched.document)
                .map_err(|e| AppError::Resolution(format!("Invalid actor at {}: {}", key_id, e)))?;
            self.store_document(document, &fetched.url, ctx).await?;
        } else {
            let owner = fetched
                .document
                .get("owner")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AppError::Resolution(format!("{} is neither an actor nor a key", key_id))
                })?;
            self.refresh_actor(owner, ctx).await?;
        }

        // The owner's document must itself advertise this key id
        let (key, owner) = self.db.find_remote_key(key_id).await?.ok_or_else(|| {
            AppError::Resolution(format!("key {} is not advertised by its owner", key_id))
        })?;
        resolved_remote_key(key.public_key_pem, owner)
    }

    async fn store_document(
        &self,
        document: ActorDocument,
        fetched_from: &url::Url,
        ctx: &OpContext,
    ) -> Result<Actor, AppError> {
        document.check_origin(fetched_from)?;
        if self.urls.local_username(&document.id).is_some() {
            return Err(AppError::Resolution(format!(
                "remote document claims local id {}",
                document.id
            )));
        }

        let record = document.into_record(Utc::now())?;
        ctx.check("store remote actor")?;
        self.db.upsert_remote_actor(&record).await
    }

    async fn local_actor(&self, username: &str) -> Result<Actor, AppError> {
        self.db
            .get_local_actor_by_username(username)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(username.to_string()))
    }

    /// Key of the instance actor, used to sign outbound fetches
    async fn instance_signer(&self) -> Result<Option<RequestSigner>, AppError> {
        let actor = self
            .db
            .get_local_actor_by_username(&self.instance_username)
            .await?;
        Ok(actor.and_then(|actor| {
            actor.private_key_pem.map(|private_key_pem| RequestSigner {
                key_id: self.urls.key_id(&actor.username),
                private_key_pem,
            })
        }))
    }

    /// Signing key of a local actor
    pub async fn local_signing_key(&self, actor_id: &str) -> Result<RequestSigner, AppError> {
        let actor = self
            .db
            .get_actor(actor_id)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(actor_id.to_string()))?;

        match (actor.is_local(), actor.private_key_pem) {
            (true, Some(private_key_pem)) => Ok(RequestSigner {
                key_id: self.urls.key_id(&actor.username),
                private_key_pem,
            }),
            _ => Err(AppError::Validation(format!(
                "actor {} has no local signing key",
                actor_id
            ))),
        }
    }
}

fn resolved_remote_key(public_key_pem: String, owner: Actor) -> Result<ResolvedKey, AppError> {
    let actor_uri = owner
        .uri
        .ok_or_else(|| AppError::Resolution(format!("actor {} has no uri", owner.id)))?;
    Ok(ResolvedKey {
        actor_id: owner.id,
        actor_uri,
        public_key_pem,
    })
}

impl PublicKeyResolver for ActorResolver {
    fn resolve_public_key<'a>(
        &'a self,
        key_id: &'a str,
        ctx: &'a OpContext,
    ) -> BoxFuture<'a, Result<ResolvedKey, AppError>> {
        Box::pin(ActorResolver::resolve_public_key(self, key_id, ctx))
    }
}

impl SigningKeyResolver for ActorResolver {
    fn signing_key<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, Result<RequestSigner, AppError>> {
        Box::pin(self.local_signing_key(actor_id))
    }
}
