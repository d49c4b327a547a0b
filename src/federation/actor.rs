//! Actor documents
//!
//! The `Person`/`Service` document served for local actors and decoded for
//! remote ones, plus the URL layout of local actors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::activity::ACTIVITYSTREAMS_CONTEXT;
use crate::data::{Actor, RemoteActorRecord};
use crate::error::AppError;

const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

impl ActorEndpoints {
    /// Shared inbox when advertised, else the actor's own inbox
    pub fn preferred_inbox<'a>(&'a self, inbox: &'a str) -> &'a str {
        match self.shared_inbox.as_deref() {
            Some(shared) if !shared.is_empty() => shared,
            _ => inbox,
        }
    }
}

/// Actor document
///
/// Everything except `id` and `type` is optional on the wire; absent fields
/// become empty values on ingest instead of failing the fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default)]
    pub endpoints: ActorEndpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub manually_approves_followers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
}

impl ActorDocument {
    /// Build the document served for a local actor
    pub fn local(actor: &Actor, urls: &LocalUrls) -> Self {
        let id = urls.actor(&actor.username);
        Self {
            kind: if actor.is_bot { "Service" } else { "Person" }.to_string(),
            preferred_username: Some(actor.username.clone()),
            name: Some(actor.display_name.clone()),
            summary: Some(actor.bio.clone()),
            inbox: Some(urls.inbox(&actor.username)),
            outbox: Some(urls.outbox(&actor.username)),
            followers: Some(urls.followers(&actor.username)),
            following: Some(urls.following(&actor.username)),
            endpoints: ActorEndpoints {
                shared_inbox: Some(urls.shared_inbox()),
            },
            url: Some(id.clone()),
            manually_approves_followers: !actor.auto_follow_accept,
            public_key: actor.public_key_pem.as_ref().map(|pem| PublicKey {
                id: urls.key_id(&actor.username),
                owner: id.clone(),
                public_key_pem: pem.clone(),
            }),
            id,
        }
    }

    /// Encode with the ActivityStreams and security contexts
    pub fn to_json(&self) -> Result<Value, AppError> {
        let mut value = serde_json::to_value(self).map_err(|e| AppError::Internal(e.into()))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "@context".to_string(),
                serde_json::json!([ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT]),
            );
        }
        Ok(value)
    }

    /// Inbox deliveries for this actor should go to
    pub fn preferred_inbox(&self) -> Option<&str> {
        let inbox = self.inbox.as_deref().filter(|inbox| !inbox.is_empty())?;
        Some(self.endpoints.preferred_inbox(inbox))
    }

    /// Check that the document speaks for the host it was fetched from
    ///
    /// The actor id and its key id must live on `fetched_from`'s host, and
    /// the key must be owned by the actor itself.
    pub fn check_origin(&self, fetched_from: &url::Url) -> Result<(), AppError> {
        let origin = authority(fetched_from)?;

        let id = parse_http_url("id", &self.id)?;
        if authority(&id)? != origin {
            return Err(AppError::Resolution(format!(
                "actor id {} does not belong to {}",
                self.id, origin
            )));
        }

        if let Some(key) = &self.public_key {
            let key_url = parse_http_url("publicKey.id", &key.id)?;
            if authority(&key_url)? != origin {
                return Err(AppError::Resolution(format!(
                    "key id {} does not belong to {}",
                    key.id, origin
                )));
            }
            if key.owner != self.id {
                return Err(AppError::Resolution(format!(
                    "key {} is owned by {}, not {}",
                    key.id, key.owner, self.id
                )));
            }
        }

        Ok(())
    }

    /// Translate into the fields stored for a remote actor
    pub fn into_record(self, fetched_at: DateTime<Utc>) -> Result<RemoteActorRecord, AppError> {
        let id = parse_http_url("id", &self.id)?;
        let domain = authority(&id)?;

        let username = self
            .preferred_username
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                id.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
                    .filter(|segment| !segment.is_empty())
            })
            .unwrap_or_else(|| self.id.clone());

        Ok(RemoteActorRecord {
            username,
            domain,
            display_name: self.name.unwrap_or_default(),
            bio: self.summary.unwrap_or_default(),
            inbox: self.inbox,
            shared_inbox: self.endpoints.shared_inbox,
            outbox: self.outbox,
            followers_url: self.followers,
            following_url: self.following,
            auto_follow_accept: !self.manually_approves_followers,
            is_bot: self.kind != "Person",
            public_key: self.public_key.map(|key| (key.id, key.public_key_pem)),
            fetched_at,
            uri: self.id,
        })
    }
}

fn parse_http_url(field: &str, value: &str) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::Resolution(format!("invalid {}: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(AppError::Resolution(format!(
            "unsupported {} scheme: {}",
            field, scheme
        ))),
    }
}

/// `host[:port]` of a URL, lowercased, port only when not the default
pub fn authority(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Resolution(format!("missing host in {}", url)))?
        .to_ascii_lowercase();
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Reject an object id that does not live on the same host as its actor
pub fn check_same_origin(object_id: &str, actor_uri: &str) -> Result<(), AppError> {
    let origin = |uri: &str| {
        url::Url::parse(uri)
            .ok()
            .and_then(|url| authority(&url).ok())
            .ok_or_else(|| AppError::Validation(format!("{} is not an absolute URL", uri)))
    };
    if origin(object_id)? != origin(actor_uri)? {
        return Err(AppError::Validation(format!(
            "{} is not on the origin of {}",
            object_id, actor_uri
        )));
    }
    Ok(())
}

/// URL layout of local actors and objects
#[derive(Debug, Clone)]
pub struct LocalUrls {
    base: String,
}

impl LocalUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn actor(&self, username: &str) -> String {
        format!("{}/users/{}", self.base, username)
    }

    pub fn inbox(&self, username: &str) -> String {
        format!("{}/inbox", self.actor(username))
    }

    pub fn outbox(&self, username: &str) -> String {
        format!("{}/outbox", self.actor(username))
    }

    pub fn followers(&self, username: &str) -> String {
        format!("{}/followers", self.actor(username))
    }

    pub fn following(&self, username: &str) -> String {
        format!("{}/following", self.actor(username))
    }

    /// ActivityPub id of any stored actor
    pub fn actor_uri(&self, actor: &Actor) -> String {
        if actor.is_local() {
            self.actor(&actor.username)
        } else {
            // Remote rows always carry a uri (schema CHECK)
            actor.uri.clone().unwrap_or_default()
        }
    }

    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.actor(username))
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/inbox", self.base)
    }

    pub fn note(&self, note_id: &str) -> String {
        format!("{}/notes/{}", self.base, note_id)
    }

    /// Id of a locally originated Follow, keyed by its relation
    pub fn follow(&self, relation_id: &str) -> String {
        format!("{}/follows/{}", self.base, relation_id)
    }

    /// Username of a local actor URI or key id, if `uri` is one
    pub fn local_username<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let uri = uri.split('#').next().unwrap_or(uri);
        let rest = uri.strip_prefix(self.base.as_str())?.strip_prefix("/users/")?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }

    /// Id of a local note URI, if `uri` is one
    pub fn local_note_id<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let rest = uri.strip_prefix(self.base.as_str())?.strip_prefix("/notes/")?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }
}
