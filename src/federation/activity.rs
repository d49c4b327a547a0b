//! Activity codec
//!
//! Wire model for the ActivityStreams subset this server speaks, with a
//! two-phase decoder: the payload is parsed into a generic JSON map, the
//! `type` discriminator is peeked, and only then is the payload decoded
//! strictly into the matching variant. `Accept`, `Reject` and `Undo` repeat
//! the same process for the activity they wrap.
//!
//! Encoding goes through serde's internally tagged representation, so the
//! wrapped activity is always embedded in full. [`with_context`] attaches the
//! JSON-LD context to documents leaving the server.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::AppError;

/// JSON-LD context attached to every document sent to another server
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Well-known Public collection
pub const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity kinds understood by this server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Follow,
    Accept,
    Reject,
    Undo,
    Create,
    Update,
    Announce,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Undo" => Some(Self::Undo),
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Announce" => Some(Self::Announce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Announce => "Announce",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// References and addressing
// =============================================================================

/// Reference to another object
///
/// Decodes from a bare URI or from an embedded object carrying an `id`;
/// always encodes as the bare URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(String),
            Embedded { id: String },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bare(id) | Repr::Embedded { id } => Ok(ObjectId(id)),
        }
    }
}

/// `to`/`cc` arrive as either a single URI or an array of URIs
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

// =============================================================================
// Activities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub id: String,
    pub actor: ObjectId,
    pub object: ObjectId,
}

/// Activity that can be wrapped by `Accept`, `Reject` and `Undo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum EmbeddedActivity {
    Follow(Follow),
}

impl EmbeddedActivity {
    pub fn kind(&self) -> ActivityType {
        match self {
            EmbeddedActivity::Follow(_) => ActivityType::Follow,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EmbeddedActivity::Follow(follow) => &follow.id,
        }
    }

    pub fn as_follow(&self) -> Option<&Follow> {
        match self {
            EmbeddedActivity::Follow(follow) => Some(follow),
        }
    }
}

/// `Accept`, `Reject` or `Undo` wrapping another activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaActivity {
    pub id: String,
    pub actor: ObjectId,
    pub object: EmbeddedActivity,
}

/// `Create` or `Update` carrying a note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteActivity {
    pub id: String,
    pub actor: ObjectId,
    pub object: NoteObject,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub id: String,
    pub actor: ObjectId,
    pub object: ObjectId,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

/// Activity exchanged with other servers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Activity {
    Follow(Follow),
    Accept(MetaActivity),
    Reject(MetaActivity),
    Undo(MetaActivity),
    Create(NoteActivity),
    Update(NoteActivity),
    Announce(Announce),
}

// =============================================================================
// Notes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteType {
    Note,
    Article,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSource {
    pub content: String,
    pub media_type: String,
}

/// Mention or hashtag attached to a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTag {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NoteType,
    pub attributed_to: ObjectId,
    #[serde(default)]
    pub content: String,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<NoteSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ObjectId>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<NoteTag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<NoteAttachment>,
}

// =============================================================================
// Construction
// =============================================================================

/// Default id for an activity wrapping `object_id`
///
/// `https://a/follows/1` + `Accept` gives `https://a/follows/1/Accept`;
/// an id already ending in `/` is suffixed directly.
pub fn activity_id_from_object(kind: ActivityType, object_id: &str) -> String {
    if object_id.ends_with('/') {
        format!("{}{}", object_id, kind)
    } else {
        format!("{}/{}", object_id, kind)
    }
}

impl Activity {
    pub fn follow(id: impl Into<String>, actor: &str, object: &str) -> Self {
        Activity::Follow(Follow {
            id: id.into(),
            actor: ObjectId::from(actor),
            object: ObjectId::from(object),
        })
    }

    /// `Accept(Follow)`, id derived from the follow when not given
    pub fn accept(id: Option<String>, actor: &str, follow: Follow) -> Self {
        Activity::Accept(MetaActivity::wrapping(ActivityType::Accept, id, actor, follow))
    }

    pub fn reject(id: Option<String>, actor: &str, follow: Follow) -> Self {
        Activity::Reject(MetaActivity::wrapping(ActivityType::Reject, id, actor, follow))
    }

    pub fn undo(id: Option<String>, actor: &str, follow: Follow) -> Self {
        Activity::Undo(MetaActivity::wrapping(ActivityType::Undo, id, actor, follow))
    }

    /// `Create` copying actor and addressing from the note
    pub fn create(note: NoteObject) -> Self {
        let id = activity_id_from_object(ActivityType::Create, &note.id);
        Activity::Create(NoteActivity::wrapping(id, note))
    }

    /// `Update` copying actor and addressing from the note
    ///
    /// Each edit gets its own id so receivers do not drop it as a duplicate.
    pub fn update(note: NoteObject) -> Self {
        let stamp = note.updated.unwrap_or(note.published).timestamp();
        let id = format!(
            "{}/{}",
            activity_id_from_object(ActivityType::Update, &note.id),
            stamp
        );
        Activity::Update(NoteActivity::wrapping(id, note))
    }

    pub fn announce(
        id: impl Into<String>,
        actor: &str,
        object: &str,
        to: Vec<String>,
        cc: Vec<String>,
        published: Option<DateTime<Utc>>,
    ) -> Self {
        Activity::Announce(Announce {
            id: id.into(),
            actor: ObjectId::from(actor),
            object: ObjectId::from(object),
            to,
            cc,
            published,
        })
    }

    pub fn kind(&self) -> ActivityType {
        match self {
            Activity::Follow(_) => ActivityType::Follow,
            Activity::Accept(_) => ActivityType::Accept,
            Activity::Reject(_) => ActivityType::Reject,
            Activity::Undo(_) => ActivityType::Undo,
            Activity::Create(_) => ActivityType::Create,
            Activity::Update(_) => ActivityType::Update,
            Activity::Announce(_) => ActivityType::Announce,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Activity::Follow(a) => &a.id,
            Activity::Accept(a) | Activity::Reject(a) | Activity::Undo(a) => &a.id,
            Activity::Create(a) | Activity::Update(a) => &a.id,
            Activity::Announce(a) => &a.id,
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Activity::Follow(a) => a.actor.as_str(),
            Activity::Accept(a) | Activity::Reject(a) | Activity::Undo(a) => a.actor.as_str(),
            Activity::Create(a) | Activity::Update(a) => a.actor.as_str(),
            Activity::Announce(a) => a.actor.as_str(),
        }
    }
}

impl MetaActivity {
    fn wrapping(kind: ActivityType, id: Option<String>, actor: &str, follow: Follow) -> Self {
        let id = id.unwrap_or_else(|| activity_id_from_object(kind, &follow.id));
        Self {
            id,
            actor: ObjectId::from(actor),
            object: EmbeddedActivity::Follow(follow),
        }
    }
}

impl NoteActivity {
    fn wrapping(id: String, note: NoteObject) -> Self {
        Self {
            id,
            actor: note.attributed_to.clone(),
            to: note.to.clone(),
            cc: note.cc.clone(),
            published: Some(note.updated.unwrap_or(note.published)),
            object: note,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Attach the JSON-LD context as a top-level sibling field
///
/// Only the outermost document carries the context; embedded objects are
/// left untouched.
pub fn with_context(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert(
                "@context".to_string(),
                Value::Array(vec![Value::String(ACTIVITYSTREAMS_CONTEXT.to_string())]),
            );
            Value::Object(map)
        }
        other => other,
    }
}

impl Activity {
    /// Encode without the JSON-LD context
    pub fn to_value(&self) -> Result<Value, AppError> {
        serde_json::to_value(self).map_err(|e| AppError::Internal(e.into()))
    }

    /// Encode as a document ready to send to another server
    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(&with_context(self.to_value()?)).map_err(|e| AppError::Internal(e.into()))
    }
}

// =============================================================================
// Decoding
// =============================================================================

impl Activity {
    /// Decode an activity from raw bytes
    ///
    /// # Errors
    /// - `Decode` for malformed JSON or a non-object payload
    /// - `UnsupportedActivityType` for an unknown outer or wrapped `type`
    /// - `Validation` for missing or ill-formed required fields
    pub fn decode(bytes: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| AppError::Decode(format!("Invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Decode an activity from an already parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, AppError> {
        let map = into_object(value, "activity")?;
        let type_name = peek_type(&map)?;
        let kind = ActivityType::parse(&type_name)
            .ok_or(AppError::UnsupportedActivityType(type_name))?;

        let activity = match kind {
            ActivityType::Follow => Activity::Follow(decode_follow(map)?),
            ActivityType::Accept => Activity::Accept(decode_meta(map)?),
            ActivityType::Reject => Activity::Reject(decode_meta(map)?),
            ActivityType::Undo => Activity::Undo(decode_meta(map)?),
            ActivityType::Create => Activity::Create(decode_note_activity(map)?),
            ActivityType::Update => Activity::Update(decode_note_activity(map)?),
            ActivityType::Announce => {
                let announce: Announce = strict(map, "Announce")?;
                require_http_uri("id", &announce.id)?;
                require_http_uri("actor", announce.actor.as_str())?;
                require_http_uri("object", announce.object.as_str())?;
                Activity::Announce(announce)
            }
        };

        Ok(activity)
    }
}

/// Decode the activity wrapped by a meta-activity
pub fn decode_embedded(value: Value) -> Result<EmbeddedActivity, AppError> {
    if !value.is_object() {
        return Err(AppError::Validation(
            "object must be an embedded activity".to_string(),
        ));
    }
    let map = into_object(value, "object")?;
    let type_name = peek_type(&map)?;

    match ActivityType::parse(&type_name) {
        Some(ActivityType::Follow) => Ok(EmbeddedActivity::Follow(decode_follow(map)?)),
        _ => Err(AppError::UnsupportedActivityType(type_name)),
    }
}

/// Decode a `Note`/`Article` object
pub fn decode_note(value: Value) -> Result<NoteObject, AppError> {
    if !value.is_object() {
        return Err(AppError::Validation(
            "object must be an embedded note".to_string(),
        ));
    }
    let map = into_object(value, "object")?;
    let type_name = peek_type(&map)?;
    if !matches!(type_name.as_str(), "Note" | "Article") {
        return Err(AppError::UnsupportedActivityType(type_name));
    }

    let note: NoteObject = strict(map, "Note")?;
    require_http_uri("object.id", &note.id)?;
    require_http_uri("object.attributedTo", note.attributed_to.as_str())?;
    Ok(note)
}

fn decode_follow(map: Map<String, Value>) -> Result<Follow, AppError> {
    let follow: Follow = strict(map, "Follow")?;
    require_http_uri("id", &follow.id)?;
    require_http_uri("actor", follow.actor.as_str())?;
    require_http_uri("object", follow.object.as_str())?;
    Ok(follow)
}

fn decode_meta(mut map: Map<String, Value>) -> Result<MetaActivity, AppError> {
    #[derive(Deserialize)]
    struct Envelope {
        id: String,
        actor: ObjectId,
    }

    let object = map
        .remove("object")
        .ok_or_else(|| AppError::Validation("missing field `object`".to_string()))?;
    let envelope: Envelope = strict(map, "activity")?;
    require_http_uri("id", &envelope.id)?;
    require_http_uri("actor", envelope.actor.as_str())?;

    Ok(MetaActivity {
        id: envelope.id,
        actor: envelope.actor,
        object: decode_embedded(object)?,
    })
}

fn decode_note_activity(mut map: Map<String, Value>) -> Result<NoteActivity, AppError> {
    // Peek the object type first so an unknown object kind is reported as such
    let object = map
        .get("object")
        .cloned()
        .ok_or_else(|| AppError::Validation("missing field `object`".to_string()))?;
    let note = decode_note(object)?;
    map.insert(
        "object".to_string(),
        serde_json::to_value(&note).map_err(|e| AppError::Internal(e.into()))?,
    );

    let activity: NoteActivity = strict(map, "activity")?;
    require_http_uri("id", &activity.id)?;
    require_http_uri("actor", activity.actor.as_str())?;
    Ok(activity)
}

fn into_object(value: Value, what: &str) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::Decode(format!("{} must be a JSON object", what))),
    }
}

fn peek_type(map: &Map<String, Value>) -> Result<String, AppError> {
    match map.get("type") {
        Some(Value::String(type_name)) => Ok(type_name.clone()),
        Some(_) => Err(AppError::Validation("`type` must be a string".to_string())),
        None => Err(AppError::Validation("missing field `type`".to_string())),
    }
}

fn strict<T: DeserializeOwned>(map: Map<String, Value>, what: &str) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| AppError::Validation(format!("Invalid {}: {}", what, e)))
}

/// Reject ids that are not absolute http(s) URIs
pub fn require_http_uri(field: &str, value: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::Validation(format!("`{}` is not a valid URI: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(AppError::Validation(format!(
            "`{}` must be an http(s) URI",
            field
        ))),
    }
}
