//! Note service
//!
//! Publishes local notes as `Create`/`Update` activities addressed by their
//! visibility, and ingests notes and announces received from other servers.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::context::OpContext;
use crate::data::{Actor, Database, EntityId, NewNote, Note, Visibility};
use crate::error::AppError;
use crate::federation::{
    Activity, Announce, DeliveryDispatcher, DeliveryResult, LocalUrls, NoteActivity, NoteObject,
    NoteSource, NoteTag, NoteType, ObjectId, addressees, check_same_origin, infer_visibility,
};

const MAX_CONTENT_CHARS: usize = 5000;

/// Note service
pub struct NoteService {
    db: Arc<Database>,
    delivery: DeliveryDispatcher,
    urls: LocalUrls,
}

impl NoteService {
    /// Create new note service
    pub fn new(db: Arc<Database>, delivery: DeliveryDispatcher, urls: LocalUrls) -> Self {
        Self { db, delivery, urls }
    }

    // =========================================================================
    // Local notes
    // =========================================================================

    /// Create a local note and federate it
    ///
    /// # Returns
    /// The stored note and the handle of its background delivery
    ///
    /// # Side Effects
    /// - Inserts the note and its mentions
    /// - Sends `Create` to followers (unless private), mentioned remote
    ///   actors and the remote author of the note replied to
    pub async fn post(
        &self,
        new_note: NewNote,
        ctx: &OpContext,
    ) -> Result<(Note, JoinHandle<Vec<DeliveryResult>>), AppError> {
        let author = self.local_author(&new_note.author_id).await?;
        let content = sanitize_content(&new_note.content)?;

        if let Some(reply_to_id) = &new_note.reply_to_id {
            if self.db.get_note(reply_to_id).await?.is_none() {
                return Err(AppError::Validation(format!(
                    "reply target {} does not exist",
                    reply_to_id
                )));
            }
        }
        for mention in &new_note.mentions {
            if self.db.get_actor(mention).await?.is_none() {
                return Err(AppError::ActorNotFound(mention.clone()));
            }
        }

        let note = Note {
            id: EntityId::new().0,
            uri: None,
            author_id: author.id.clone(),
            content,
            visibility_raw: new_note.visibility.as_str().to_string(),
            reply_to_id: new_note.reply_to_id,
            renote_of_id: None,
            sensitive: new_note.sensitive,
            created_at: Utc::now(),
            updated_at: None,
        };

        ctx.check("insert note")?;
        self.db.insert_note(&note, &new_note.mentions).await?;
        tracing::info!(
            note_id = %note.id,
            author = %author.username,
            visibility = %note.visibility(),
            "Note created"
        );

        let delivery = self.publish(&note).await?;
        Ok((note, delivery))
    }

    /// Edit a local note and federate the edit as `Update`
    pub async fn edit(
        &self,
        author_id: &str,
        note_id: &str,
        content: &str,
        sensitive: bool,
        ctx: &OpContext,
    ) -> Result<(Note, JoinHandle<Vec<DeliveryResult>>), AppError> {
        let content = sanitize_content(content)?;
        ctx.check("edit note")?;

        let note = self
            .db
            .update_local_note(note_id, author_id, &content, sensitive)
            .await?
            .ok_or(AppError::NotFound)?;

        let delivery = self.publish(&note).await?;
        Ok((note, delivery))
    }

    /// Send a local note to its audience
    ///
    /// Emits `Update` when the note has been edited, `Create` otherwise.
    pub async fn publish(&self, note: &Note) -> Result<JoinHandle<Vec<DeliveryResult>>, AppError> {
        let object = self.note_object(note).await?;
        let activity = if object.updated.is_some() {
            Activity::update(object)
        } else {
            Activity::create(object)
        };

        let inboxes = self.audience_inboxes(note).await?;
        tracing::debug!(
            note_id = %note.id,
            activity_type = %activity.kind(),
            inboxes = inboxes.len(),
            "Publishing note"
        );

        Ok(self.delivery.spawn(activity, note.author_id.clone(), inboxes))
    }

    /// ActivityPub representation of a local note
    pub async fn note_object(&self, note: &Note) -> Result<NoteObject, AppError> {
        let author = self.local_author(&note.author_id).await?;
        let author_uri = self.urls.actor(&author.username);

        let mentioned = self.db.note_mentions(&note.id).await?;
        let mut tag: Vec<NoteTag> = mentioned
            .iter()
            .map(|actor| NoteTag {
                kind: "Mention".to_string(),
                name: Some(self.acct(actor)),
                href: Some(self.urls.actor_uri(actor)),
            })
            .collect();
        let mut explicit: Vec<String> = mentioned
            .iter()
            .map(|actor| self.urls.actor_uri(actor))
            .collect();

        let mut in_reply_to = None;
        if let Some(parent) = self.reply_parent(note).await? {
            in_reply_to = Some(ObjectId::new(self.note_uri(&parent)));
            if parent.author_id != note.author_id {
                if let Some(parent_author) = self.db.get_actor(&parent.author_id).await? {
                    let uri = self.urls.actor_uri(&parent_author);
                    if !explicit.contains(&uri) {
                        tag.push(NoteTag {
                            kind: "Mention".to_string(),
                            name: Some(self.acct(&parent_author)),
                            href: Some(uri.clone()),
                        });
                        explicit.push(uri);
                    }
                }
            }
        }

        let (to, cc) = addressees(
            note.visibility(),
            &self.urls.followers(&author.username),
            &explicit,
        );
        let id = self.urls.note(&note.id);

        Ok(NoteObject {
            url: Some(id.clone()),
            id,
            kind: NoteType::Note,
            attributed_to: ObjectId::new(author_uri),
            content: note.content.clone(),
            published: note.created_at,
            updated: note.updated_at,
            to,
            cc,
            source: Some(NoteSource {
                content: note.content.clone(),
                media_type: "text/html".to_string(),
            }),
            in_reply_to,
            sensitive: note.sensitive,
            tag,
            attachment: Vec::new(),
        })
    }

    /// Inboxes a local note is delivered to
    async fn audience_inboxes(&self, note: &Note) -> Result<Vec<String>, AppError> {
        let mut inboxes = Vec::new();
        if note.visibility() != Visibility::Private {
            inboxes.extend(self.db.follower_inboxes(&note.author_id).await?);
        }

        let mut recipients = self.db.note_mentions(&note.id).await?;
        if let Some(parent) = self.reply_parent(note).await? {
            if let Some(parent_author) = self.db.get_actor(&parent.author_id).await? {
                recipients.push(parent_author);
            }
        }

        inboxes.extend(
            recipients
                .iter()
                .filter(|actor| actor.is_remote())
                .filter_map(|actor| actor.preferred_inbox().map(str::to_string)),
        );
        Ok(inboxes)
    }

    // =========================================================================
    // Remote notes
    // =========================================================================

    /// Store a note received in a `Create` or `Update` from `sender`
    ///
    /// Visibility is inferred from the addressing and content is sanitized.
    /// A `Create` of an already known note is a no-op; an `Update` edits the
    /// note only when `sender` authored it. Returns the stored note, if any.
    pub async fn ingest_note(
        &self,
        activity: &NoteActivity,
        is_update: bool,
        sender: &Actor,
        ctx: &OpContext,
    ) -> Result<Option<Note>, AppError> {
        let object = &activity.object;
        check_same_origin(&object.id, &self.urls.actor_uri(sender))?;
        if self.urls.local_note_id(&object.id).is_some() {
            tracing::debug!(note = %object.id, "Ignoring remote copy of a local note");
            return Ok(None);
        }

        let visibility = if object.to.is_empty() && object.cc.is_empty() {
            infer_visibility(&activity.to, &activity.cc)
        } else {
            infer_visibility(&object.to, &object.cc)
        };

        let reply_to_id = match &object.in_reply_to {
            Some(parent) => self.find_note(parent.as_str()).await?.map(|n| n.id),
            None => None,
        };

        let note = Note {
            id: EntityId::new().0,
            uri: Some(object.id.clone()),
            author_id: sender.id.clone(),
            content: ammonia::clean(&object.content),
            visibility_raw: visibility.as_str().to_string(),
            reply_to_id,
            renote_of_id: None,
            sensitive: object.sensitive,
            created_at: object.published,
            updated_at: object.updated.or(is_update.then(Utc::now)),
        };

        ctx.check("store remote note")?;

        if is_update {
            if self.db.update_remote_note(&note).await? {
                tracing::info!(note = %object.id, author = %sender.id, "Remote note edited");
                return self.db.get_note_by_uri(&object.id).await;
            }
            tracing::debug!(note = %object.id, "Update for unknown note, storing as new");
        }

        let mentions = self.local_mentions(object).await?;
        if self.db.insert_remote_note(&note, &mentions).await? {
            tracing::info!(
                note = %object.id,
                author = %sender.id,
                visibility = %visibility,
                "Remote note stored"
            );
            Ok(Some(note))
        } else {
            tracing::debug!(note = %object.id, "Remote note already known");
            Ok(None)
        }
    }

    /// Record an `Announce` of a known note as a renote by `sender`
    ///
    /// Announces of notes this server has never seen are ignored.
    pub async fn ingest_announce(
        &self,
        announce: &Announce,
        sender: &Actor,
        ctx: &OpContext,
    ) -> Result<Option<Note>, AppError> {
        check_same_origin(&announce.id, &self.urls.actor_uri(sender))?;
        let Some(original) = self.find_note(announce.object.as_str()).await? else {
            tracing::debug!(object = %announce.object, "Announce of unknown object ignored");
            return Ok(None);
        };

        let renote = Note {
            id: EntityId::new().0,
            uri: Some(announce.id.clone()),
            author_id: sender.id.clone(),
            content: String::new(),
            visibility_raw: infer_visibility(&announce.to, &announce.cc).as_str().to_string(),
            reply_to_id: None,
            renote_of_id: Some(original.id),
            sensitive: false,
            created_at: announce.published.unwrap_or_else(Utc::now),
            updated_at: None,
        };

        ctx.check("store renote")?;
        if self.db.insert_remote_note(&renote, &[]).await? {
            tracing::info!(announce = %announce.id, author = %sender.id, "Renote stored");
            Ok(Some(renote))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn local_author(&self, author_id: &str) -> Result<Actor, AppError> {
        let author = self
            .db
            .get_actor(author_id)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(author_id.to_string()))?;
        if !author.is_local() {
            return Err(AppError::Validation(format!(
                "actor {} is not local",
                author_id
            )));
        }
        Ok(author)
    }

    async fn reply_parent(&self, note: &Note) -> Result<Option<Note>, AppError> {
        match &note.reply_to_id {
            Some(id) => self.db.get_note(id).await,
            None => Ok(None),
        }
    }

    /// Look a note up by its ActivityPub id, local or remote
    async fn find_note(&self, uri: &str) -> Result<Option<Note>, AppError> {
        match self.urls.local_note_id(uri) {
            Some(id) => self.db.get_note(id).await,
            None => self.db.get_note_by_uri(uri).await,
        }
    }

    /// Local actors tagged as mentioned in a remote note
    async fn local_mentions(&self, object: &NoteObject) -> Result<Vec<String>, AppError> {
        let mut ids = Vec::new();
        let hrefs = object
            .tag
            .iter()
            .filter(|tag| tag.kind == "Mention")
            .filter_map(|tag| tag.href.as_deref())
            .chain(object.to.iter().map(String::as_str))
            .chain(object.cc.iter().map(String::as_str));

        for href in hrefs {
            let Some(username) = self.urls.local_username(href) else {
                continue;
            };
            if let Some(actor) = self.db.get_local_actor_by_username(username).await? {
                if !ids.contains(&actor.id) {
                    ids.push(actor.id);
                }
            }
        }
        Ok(ids)
    }

    fn acct(&self, actor: &Actor) -> String {
        if actor.is_local() {
            let domain = self
                .urls
                .base()
                .split_once("://")
                .map(|(_, rest)| rest)
                .unwrap_or(self.urls.base());
            format!("@{}@{}", actor.username, domain)
        } else {
            format!("@{}@{}", actor.username, actor.domain)
        }
    }

    fn note_uri(&self, note: &Note) -> String {
        match &note.uri {
            Some(uri) => uri.clone(),
            None => self.urls.note(&note.id),
        }
    }
}

/// Sanitize user supplied HTML and enforce the length limit
fn sanitize_content(content: &str) -> Result<String, AppError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("note content is required".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation(format!(
            "note content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(ammonia::clean(content))
}
