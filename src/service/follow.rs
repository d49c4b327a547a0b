//! Follow service
//!
//! The follow state machine: `None` -> `Pending` -> `Accepted`, and back to
//! `None` through Reject or Undo. Every transition runs as one store
//! transaction; the matching federation activity is sent only after that
//! transaction has committed, and only when the acting party is local and
//! the other party is remote.

use std::sync::Arc;

use chrono::Utc;

use crate::context::OpContext;
use crate::data::{Actor, Database, EntityId, FollowRelation, FollowState};
use crate::error::AppError;
use crate::federation::{Activity, DeliveryDispatcher, Follow, LocalUrls, ObjectId};
use crate::metrics::FOLLOW_TRANSITIONS_TOTAL;

/// Follow service
pub struct FollowService {
    db: Arc<Database>,
    delivery: DeliveryDispatcher,
    urls: LocalUrls,
}

impl FollowService {
    /// Create new follow service
    pub fn new(db: Arc<Database>, delivery: DeliveryDispatcher, urls: LocalUrls) -> Self {
        Self {
            db,
            delivery,
            urls,
        }
    }

    /// `follower` asks to follow `followed`
    ///
    /// `activity_id` is the id of a received Follow; locally originated
    /// follows get an id derived from the new relation. A repeated follow is
    /// a no-op returning the current state.
    ///
    /// # Side Effects
    /// - Local follower, remote followed: sends `Follow`
    /// - Remote follower, auto-accepting local followed: sends `Accept(Follow)`
    pub async fn follow(
        &self,
        follower: &Actor,
        followed: &Actor,
        activity_id: Option<&str>,
        ctx: &OpContext,
    ) -> Result<FollowState, AppError> {
        ensure_distinct(follower, followed)?;
        ctx.check("follow")?;

        let relation_id = EntityId::new().0;
        let relation = FollowRelation {
            activity_uri: Some(
                activity_id
                    .map(str::to_string)
                    .unwrap_or_else(|| self.urls.follow(&relation_id)),
            ),
            id: relation_id,
            follower_id: follower.id.clone(),
            followed_id: followed.id.clone(),
            pending: !followed.auto_follow_accept,
            created_at: Utc::now(),
        };

        if !self.db.create_follow_relation(&relation).await? {
            let existing = self
                .db
                .get_follow_relation(&follower.id, &followed.id)
                .await?;
            tracing::debug!(
                follower = %follower.id,
                followed = %followed.id,
                "Follow already exists"
            );
            return Ok(FollowState::of(existing.as_ref()));
        }

        let state = FollowState::of(Some(&relation));
        FOLLOW_TRANSITIONS_TOTAL
            .with_label_values(&[if relation.pending { "follow_pending" } else { "follow_accepted" }])
            .inc();
        tracing::info!(
            follower = %follower.id,
            followed = %followed.id,
            pending = relation.pending,
            "Follow relation created"
        );

        let follow = self.follow_activity(&relation, follower, followed);
        if follower.is_local() && followed.is_remote() {
            self.emit(Activity::Follow(follow), follower, followed);
        } else if follower.is_remote() && followed.is_local() && !relation.pending {
            let accept_id = format!("{}/accept", self.urls.follow(&relation.id));
            self.emit(
                Activity::accept(Some(accept_id), &self.urls.actor_uri(followed), follow),
                followed,
                follower,
            );
        }

        Ok(state)
    }

    /// `acceptor` accepts the pending follow from `acceptee`
    ///
    /// Returns `false` when there was no pending follow to accept.
    pub async fn accept(
        &self,
        acceptor: &Actor,
        acceptee: &Actor,
        ctx: &OpContext,
    ) -> Result<bool, AppError> {
        ensure_distinct(acceptor, acceptee)?;
        ctx.check("accept follow")?;

        let Some(relation) = self
            .db
            .accept_follow_relation(&acceptee.id, &acceptor.id)
            .await?
        else {
            tracing::debug!(
                follower = %acceptee.id,
                followed = %acceptor.id,
                "No pending follow to accept"
            );
            return Ok(false);
        };

        FOLLOW_TRANSITIONS_TOTAL.with_label_values(&["accept"]).inc();
        tracing::info!(follower = %acceptee.id, followed = %acceptor.id, "Follow accepted");

        if acceptor.is_local() && acceptee.is_remote() {
            let follow = self.follow_activity(&relation, acceptee, acceptor);
            let id = format!("{}/accept", self.urls.follow(&relation.id));
            self.emit(
                Activity::accept(Some(id), &self.urls.actor_uri(acceptor), follow),
                acceptor,
                acceptee,
            );
        }

        Ok(true)
    }

    /// `rejector` turns down (or revokes) the follow from `rejected`
    ///
    /// Returns `false` when there was no follow to remove.
    pub async fn reject(
        &self,
        rejector: &Actor,
        rejected: &Actor,
        ctx: &OpContext,
    ) -> Result<bool, AppError> {
        ensure_distinct(rejector, rejected)?;
        ctx.check("reject follow")?;

        let Some(relation) = self
            .db
            .delete_follow_relation(&rejected.id, &rejector.id)
            .await?
        else {
            return Ok(false);
        };

        FOLLOW_TRANSITIONS_TOTAL.with_label_values(&["reject"]).inc();
        tracing::info!(follower = %rejected.id, followed = %rejector.id, "Follow rejected");

        if rejector.is_local() && rejected.is_remote() {
            let follow = self.follow_activity(&relation, rejected, rejector);
            let id = format!("{}/reject", self.urls.follow(&relation.id));
            self.emit(
                Activity::reject(Some(id), &self.urls.actor_uri(rejector), follow),
                rejector,
                rejected,
            );
        }

        Ok(true)
    }

    /// `actor` withdraws its follow of `object`
    ///
    /// Returns `false` when there was no follow to remove.
    pub async fn undo(&self, actor: &Actor, object: &Actor, ctx: &OpContext) -> Result<bool, AppError> {
        ensure_distinct(actor, object)?;
        ctx.check("undo follow")?;

        let Some(relation) = self.db.delete_follow_relation(&actor.id, &object.id).await? else {
            return Ok(false);
        };

        FOLLOW_TRANSITIONS_TOTAL.with_label_values(&["undo"]).inc();
        tracing::info!(follower = %actor.id, followed = %object.id, "Follow undone");

        if actor.is_local() && object.is_remote() {
            let follow = self.follow_activity(&relation, actor, object);
            let id = format!("{}/undo", self.urls.follow(&relation.id));
            self.emit(
                Activity::undo(Some(id), &self.urls.actor_uri(actor), follow),
                actor,
                object,
            );
        }

        Ok(true)
    }

    /// Follow state of `a` towards `b`
    pub async fn state(&self, a: &Actor, b: &Actor) -> Result<FollowState, AppError> {
        ensure_distinct(a, b)?;
        let relation = self.db.get_follow_relation(&a.id, &b.id).await?;
        Ok(FollowState::of(relation.as_ref()))
    }

    /// The Follow activity that created `relation`
    fn follow_activity(&self, relation: &FollowRelation, follower: &Actor, followed: &Actor) -> Follow {
        Follow {
            id: relation
                .activity_uri
                .clone()
                .unwrap_or_else(|| self.urls.follow(&relation.id)),
            actor: ObjectId::new(self.urls.actor_uri(follower)),
            object: ObjectId::new(self.urls.actor_uri(followed)),
        }
    }

    /// Queue `activity` from local `sender` to remote `recipient`
    fn emit(&self, activity: Activity, sender: &Actor, recipient: &Actor) {
        let Some(inbox) = recipient.preferred_inbox() else {
            tracing::warn!(
                activity_id = %activity.id(),
                recipient = %recipient.id,
                "Recipient has no inbox, not delivering"
            );
            return;
        };

        self.delivery
            .spawn(activity, sender.id.clone(), vec![inbox.to_string()]);
    }
}

fn ensure_distinct(a: &Actor, b: &Actor) -> Result<(), AppError> {
    if a.id == b.id {
        return Err(AppError::CannotFollowSelf);
    }
    Ok(())
}
