//! ActivityPub federation module
//!
//! Handles:
//! - Activity and actor document encoding/decoding
//! - HTTP Signatures
//! - WebFinger
//! - Actor fetching and key resolution
//! - Activity delivery (outbox)
//! - Note addressing and visibility inference

mod activity;
mod actor;
mod delivery;
mod fetch;
mod media_type;
mod resolver;
mod signature;
mod visibility;
mod webfinger;

pub use activity::{
    ACTIVITYSTREAMS_CONTEXT, Activity, ActivityType, Announce, EmbeddedActivity, Follow,
    MetaActivity, NoteActivity, NoteAttachment, NoteObject, NoteSource, NoteTag, NoteType,
    ObjectId, PUBLIC_ADDRESS, activity_id_from_object, decode_embedded, decode_note,
    require_http_uri, with_context,
};
pub use actor::{
    ActorDocument, ActorEndpoints, LocalUrls, PublicKey, authority, check_same_origin,
};
pub use delivery::{DeliveryDispatcher, DeliveryResult, SigningKeyResolver, unique_inbox_targets};
pub use fetch::{Fetched, RemoteFetcher, RequestSigner, build_http_client, parse_remote_url};
pub use media_type::{
    ACCEPT_ACTIVITY, ACTIVITY_JSON, LD_JSON_ACTIVITYSTREAMS, accepts_activity_json,
    is_activity_content_type, is_activity_media_type,
};
pub use resolver::{ActorResolver, UserSpecifier};
pub use signature::{
    ParsedSignature, PublicKeyResolver, ResolvedKey, SignOptions, SignatureAlgorithm,
    SignatureHeaders, VerifiedSigner, VerifyOptions, extract_signature, generate_digest,
    parse_signature_header, sign_request, verify_request, verify_signature,
};
pub use visibility::{addressees, infer_visibility, is_public_address};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, WebFingerResult, generate_webfinger_response, parse_acct,
    resolve_webfinger, select_self_link,
};
