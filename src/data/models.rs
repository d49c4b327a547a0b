//! Data models
//!
//! Rust structs representing database rows.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Whether `s` has the shape of an entity id
    pub fn is_valid(s: &str) -> bool {
        ulid::Ulid::from_string(s).is_ok()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A user, local or remote
///
/// Local actors have an empty `domain`, a key pair and no `uri` (their URLs
/// are derived from the server base URL). Remote actors have a non-empty
/// `domain`, a `uri`, no private key, and a `fetched_at` stamp.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    pub username: String,
    pub domain: String,
    pub display_name: String,
    pub bio: String,
    /// Canonical ActivityPub id (remote only)
    pub uri: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    /// RSA public key (PEM format), local only; remote keys live in `remote_public_keys`
    pub public_key_pem: Option<String>,
    /// RSA private key (PEM format), local only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub auto_follow_accept: bool,
    pub is_bot: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.domain.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    /// Shared inbox when advertised, else the personal inbox
    pub fn preferred_inbox(&self) -> Option<&str> {
        self.shared_inbox
            .as_deref()
            .filter(|inbox| !inbox.is_empty())
            .or_else(|| self.inbox.as_deref().filter(|inbox| !inbox.is_empty()))
    }

    /// Remote actor whose cached copy is older than `ttl` (or was never fetched)
    pub fn is_stale(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.is_local() {
            return false;
        }
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        match self.fetched_at {
            Some(fetched_at) => now - fetched_at >= ttl,
            None => true,
        }
    }
}

/// Remote actor's public key record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemotePublicKey {
    pub id: String,
    pub owner_id: String,
    pub key_id: String,
    pub public_key_pem: String,
    pub fetched_at: DateTime<Utc>,
}

/// Remote actor fields to insert or refresh, keyed by `uri`
#[derive(Debug, Clone)]
pub struct RemoteActorRecord {
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: String,
    pub bio: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub auto_follow_accept: bool,
    pub is_bot: bool,
    /// `(key_id, public_key_pem)` advertised by the actor document
    pub public_key: Option<(String, String)>,
    pub fetched_at: DateTime<Utc>,
}

// =============================================================================
// Follow relations and blocks
// =============================================================================

/// Directed follow edge, unique per (follower, followed)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelation {
    pub id: String,
    pub follower_id: String,
    pub followed_id: String,
    pub pending: bool,
    /// Id of the Follow activity that created this edge
    pub activity_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Follow state between an ordered pair of actors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    None,
    Pending,
    Accepted,
}

impl FollowState {
    pub fn of(relation: Option<&FollowRelation>) -> Self {
        match relation {
            None => FollowState::None,
            Some(r) if r.pending => FollowState::Pending,
            Some(_) => FollowState::Accepted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub blocker_id: String,
    pub blocked_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notes
// =============================================================================

/// Who can see a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Follower,
    Private,
}

impl Visibility {
    pub const ALL: [Visibility; 4] = [
        Visibility::Public,
        Visibility::Unlisted,
        Visibility::Follower,
        Visibility::Private,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Follower => "follower",
            Visibility::Private => "private",
        }
    }

    /// Whether the note may be served to anonymous fetchers
    pub fn is_listed_publicly(&self) -> bool {
        matches!(self, Visibility::Public | Visibility::Unlisted)
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "unlisted" => Ok(Visibility::Unlisted),
            "follower" => Ok(Visibility::Follower),
            "private" => Ok(Visibility::Private),
            other => Err(crate::error::AppError::Validation(format!(
                "unknown visibility: {other}"
            ))),
        }
    }
}

/// Authored content, local or ingested from a remote server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    /// ActivityPub id (remote only)
    pub uri: Option<String>,
    pub author_id: String,
    pub content: String,
    /// Stored as text; see [`Note::visibility`]
    #[sqlx(rename = "visibility")]
    pub visibility_raw: String,
    pub reply_to_id: Option<String>,
    pub renote_of_id: Option<String>,
    pub sensitive: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn visibility(&self) -> Visibility {
        // CHECK constraint keeps the column within the four known values
        self.visibility_raw.parse().unwrap_or(Visibility::Private)
    }
}

/// Input for a new local note
#[derive(Debug, Clone)]
pub struct NewNote {
    pub author_id: String,
    pub content: String,
    pub visibility: Visibility,
    pub reply_to_id: Option<String>,
    /// Explicitly mentioned actors (local ids)
    pub mentions: Vec<String>,
    pub sensitive: bool,
}
