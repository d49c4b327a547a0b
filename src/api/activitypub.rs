//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving), personal and shared
//! - Followers collection
//! - Notes

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::Value;

use crate::AppState;
use crate::context::OpContext;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, ActorDocument, accepts_activity_json, is_activity_content_type, with_context,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers - Followers collection
/// - GET /notes/:id - Public or unlisted local note
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/followers", get(followers))
        .route("/notes/:id", get(note))
}

/// JSON body served as `application/activity+json`
struct ActivityJson(Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        (
            [(http::header::CONTENT_TYPE, ACTIVITY_JSON)],
            self.0.to_string(),
        )
            .into_response()
    }
}

fn require_activity_accept(headers: &HeaderMap) -> Result<(), AppError> {
    if accepts_activity_json(headers) {
        Ok(())
    } else {
        Err(AppError::NotAcceptable)
    }
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    require_activity_accept(&headers)?;

    let actor = state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let document = ActorDocument::local(&actor, &state.urls);
    Ok(ActivityJson(document.to_json()?))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound);
    }

    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// Shared inbox pipeline
///
/// The processing context is cancelled if the client goes away and expires
/// after the configured inbound deadline.
async fn receive(
    state: &AppState,
    uri: &http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    if !is_activity_content_type(headers) {
        return Err(AppError::UnsupportedMediaType);
    }

    let ctx = OpContext::with_timeout(state.config.federation.inbound_deadline());
    let _guard = ctx.drop_guard();

    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    state
        .inbox
        .process("POST", target, headers, body, &ctx)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /users/:username/followers
///
/// Returns Followers collection (count only).
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    require_activity_accept(&headers)?;

    let actor = state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;
    let total = state.db.count_followers(&actor.id).await?;

    Ok(ActivityJson(with_context(serde_json::json!({
        "type": "OrderedCollection",
        "id": state.urls.followers(&actor.username),
        "totalItems": total,
    }))))
}

/// GET /notes/:id
///
/// Returns a local note when it is public or unlisted.
async fn note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, AppError> {
    require_activity_accept(&headers)?;

    let note = state
        .db
        .get_note(&id)
        .await?
        .filter(|note| note.uri.is_none() && note.renote_of_id.is_none())
        .filter(|note| note.visibility().is_listed_publicly())
        .ok_or(AppError::NotFound)?;

    let object = state.notes.note_object(&note).await?;
    let value = serde_json::to_value(&object).map_err(|e| AppError::Internal(e.into()))?;
    Ok(ActivityJson(with_context(value)))
}
