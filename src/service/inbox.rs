//! Inbox processing
//!
//! One inbound delivery runs verify -> decode -> identity checks -> apply.
//! Verification (and any key fetch it needs) completes before any store
//! write, and nothing is written when an earlier step fails.

use std::sync::Arc;

use http::HeaderMap;

use crate::context::OpContext;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::{
    Activity, ActivityType, ActorResolver, Follow, MetaActivity, UserSpecifier, VerifiedSigner,
    VerifyOptions, check_same_origin, verify_request,
};
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

use super::{FollowService, NoteService};

/// Inbound activity processor shared by the personal and shared inboxes
pub struct InboxProcessor {
    resolver: Arc<ActorResolver>,
    follows: Arc<FollowService>,
    notes: Arc<NoteService>,
    verify_options: VerifyOptions,
}

impl InboxProcessor {
    pub fn new(
        resolver: Arc<ActorResolver>,
        follows: Arc<FollowService>,
        notes: Arc<NoteService>,
        verify_options: VerifyOptions,
    ) -> Self {
        Self {
            resolver,
            follows,
            notes,
            verify_options,
        }
    }

    /// Verify, decode and apply one inbound activity
    ///
    /// `path` is the request target as received (path and query).
    pub async fn process(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
        ctx: &OpContext,
    ) -> Result<ActivityType, AppError> {
        let signer = verify_request(
            method,
            path,
            headers,
            Some(body),
            self.resolver.as_ref(),
            &self.verify_options,
            ctx,
        )
        .await?;

        let activity = Activity::decode(body)?;
        check_signer(&activity, &signer)?;
        check_identity(&activity)?;

        let kind = activity.kind();
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[kind.as_str()])
            .inc();
        tracing::info!(
            activity_id = %activity.id(),
            activity_type = %kind,
            actor = %signer.actor_uri,
            "Received activity"
        );

        let sender = self
            .resolver
            .resolve(&UserSpecifier::LocalId(signer.actor_id.clone()), ctx)
            .await?;

        self.apply(activity, &sender, ctx).await?;
        Ok(kind)
    }

    async fn apply(&self, activity: Activity, sender: &Actor, ctx: &OpContext) -> Result<(), AppError> {
        match activity {
            Activity::Follow(follow) => {
                let followed = self.local_party(follow.object.as_str(), ctx).await?;
                self.follows
                    .follow(sender, &followed, Some(&follow.id), ctx)
                    .await?;
            }
            Activity::Accept(meta) => {
                let follow = wrapped_follow(&meta)?;
                let acceptee = self.local_party(follow.actor.as_str(), ctx).await?;
                self.follows.accept(sender, &acceptee, ctx).await?;
            }
            Activity::Reject(meta) => {
                let follow = wrapped_follow(&meta)?;
                let rejected = self.local_party(follow.actor.as_str(), ctx).await?;
                self.follows.reject(sender, &rejected, ctx).await?;
            }
            Activity::Undo(meta) => {
                let follow = wrapped_follow(&meta)?;
                let object = self.local_party(follow.object.as_str(), ctx).await?;
                self.follows.undo(sender, &object, ctx).await?;
            }
            Activity::Create(create) => {
                self.notes.ingest_note(&create, false, sender, ctx).await?;
            }
            Activity::Update(update) => {
                self.notes.ingest_note(&update, true, sender, ctx).await?;
            }
            Activity::Announce(announce) => {
                self.notes.ingest_announce(&announce, sender, ctx).await?;
            }
        }
        Ok(())
    }

    /// The local actor on the receiving end of a follow activity
    async fn local_party(&self, uri: &str, ctx: &OpContext) -> Result<Actor, AppError> {
        if self.resolver.urls().local_username(uri).is_none() {
            return Err(AppError::Validation(format!(
                "{} is not an actor on this server",
                uri
            )));
        }
        self.resolver.resolve_uri(uri, ctx).await
    }
}

/// The verified signer must be the activity's actor
fn check_signer(activity: &Activity, signer: &VerifiedSigner) -> Result<(), AppError> {
    if activity.actor() != signer.actor_uri {
        return Err(AppError::Verification(format!(
            "activity actor {} was signed by {}",
            activity.actor(),
            signer.actor_uri
        )));
    }
    Ok(())
}

/// Consistency between an activity and what it wraps
fn check_identity(activity: &Activity) -> Result<(), AppError> {
    match activity {
        Activity::Accept(meta) | Activity::Reject(meta) => {
            let follow = wrapped_follow(meta)?;
            if follow.object != meta.actor {
                return Err(AppError::Validation(format!(
                    "{} cannot answer a follow of {}",
                    meta.actor, follow.object
                )));
            }
        }
        Activity::Undo(meta) => {
            let follow = wrapped_follow(meta)?;
            if follow.actor != meta.actor {
                return Err(AppError::Validation(format!(
                    "{} cannot undo a follow by {}",
                    meta.actor, follow.actor
                )));
            }
        }
        Activity::Create(note) | Activity::Update(note) => {
            if note.object.attributed_to != note.actor {
                return Err(AppError::Validation(format!(
                    "note attributed to {} sent by {}",
                    note.object.attributed_to, note.actor
                )));
            }
            check_same_origin(&note.object.id, note.actor.as_str())?;
        }
        Activity::Announce(announce) => {
            check_same_origin(&announce.id, announce.actor.as_str())?;
        }
        Activity::Follow(_) => {}
    }
    Ok(())
}

fn wrapped_follow(meta: &MetaActivity) -> Result<&Follow, AppError> {
    meta.object.as_follow().ok_or_else(|| {
        AppError::UnsupportedActivityType(meta.object.kind().as_str().to_string())
    })
}
