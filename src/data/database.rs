//! SQLite database operations
//!
//! All database access goes through this module.
//! Follow transitions that must read and write atomically run inside
//! `BEGIN IMMEDIATE` transactions on a single pooled connection. Each one is
//! driven on its own task so it reaches `COMMIT` or `ROLLBACK` even when the
//! caller is dropped.

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file and parent directory if they don't exist,
    /// then runs the embedded migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AppError::Internal(e.into()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(path = %path.display(), "Database connected");
        Ok(Self { pool })
    }

    /// Run `op` inside a `BEGIN IMMEDIATE` transaction on a spawned task
    ///
    /// Dropping the returned future does not interrupt the transaction, so a
    /// connection never goes back to the pool with a transaction open.
    async fn immediate_tx<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
            let result = op(&mut *conn).await;
            finish_tx(&mut conn, result).await
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert a local actor (key pair required, no URI)
    pub async fn insert_local_actor(&self, actor: &Actor) -> Result<(), AppError> {
        if actor.is_remote() || actor.private_key_pem.is_none() {
            return Err(AppError::Validation(
                "local actors need an empty domain and a private key".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO actors (
                id, username, domain, display_name, bio, uri, inbox, shared_inbox,
                outbox, followers_url, following_url, public_key_pem, private_key_pem,
                auto_follow_accept, is_bot, fetched_at, created_at
            ) VALUES (?, ?, '', ?, ?, NULL, NULL, NULL, NULL, NULL, NULL, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.bio)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.auto_follow_accept)
        .bind(actor.is_bot)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get actor by local id
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE domain = '' AND username = ? COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    /// Number of local actors, the instance actor excluded
    pub async fn count_local_users(&self, instance_username: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM actors WHERE domain = '' AND username != ? COLLATE NOCASE",
        )
        .bind(instance_username)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn get_remote_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_remote_actor_by_acct(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE domain = ? COLLATE NOCASE AND username = ? COLLATE NOCASE",
        )
        .bind(domain)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    /// Insert or refresh a remote actor keyed by URI, replacing its key record
    ///
    /// Concurrent upserts of the same URI collapse onto one row.
    pub async fn upsert_remote_actor(&self, record: &RemoteActorRecord) -> Result<Actor, AppError> {
        if record.domain.is_empty() {
            return Err(AppError::Validation(
                "remote actor record needs a domain".to_string(),
            ));
        }

        let record = record.clone();
        self.immediate_tx(move |conn| Box::pin(upsert_remote_actor_tx(conn, record)))
            .await
    }

    /// Find a remote key record and the actor owning it
    pub async fn find_remote_key(
        &self,
        key_id: &str,
    ) -> Result<Option<(RemotePublicKey, Actor)>, AppError> {
        let key = sqlx::query_as::<_, RemotePublicKey>(
            "SELECT * FROM remote_public_keys WHERE key_id = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(key) = key else {
            return Ok(None);
        };

        let owner = self.get_actor(&key.owner_id).await?;
        Ok(owner.map(|owner| (key, owner)))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    pub async fn insert_block(&self, blocker_id: &str, blocked_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_block(&self, blocker_id: &str, blocked_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id)
            .bind(blocked_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether either actor blocks the other
    pub async fn is_blocking_or_blocked(&self, a: &str, b: &str) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        block_exists(&mut conn, a, b).await
    }

    // =========================================================================
    // Follow relations
    // =========================================================================

    pub async fn get_follow_relation(
        &self,
        follower_id: &str,
        followed_id: &str,
    ) -> Result<Option<FollowRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowRelation>(
            "SELECT * FROM follow_relations WHERE follower_id = ? AND followed_id = ?",
        )
        .bind(follower_id)
        .bind(followed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relation)
    }

    /// Create a follow edge unless one exists
    ///
    /// Fails with `CannotFollowBlock` when a block exists in either direction.
    /// Returns `false` when the edge already existed (no-op).
    pub async fn create_follow_relation(&self, relation: &FollowRelation) -> Result<bool, AppError> {
        let relation = relation.clone();
        self.immediate_tx(move |conn| Box::pin(create_follow_relation_tx(conn, relation)))
            .await
    }

    /// Flip a pending edge to accepted
    ///
    /// Returns the updated edge, or `None` when no pending edge matched.
    pub async fn accept_follow_relation(
        &self,
        follower_id: &str,
        followed_id: &str,
    ) -> Result<Option<FollowRelation>, AppError> {
        let (follower_id, followed_id) = (follower_id.to_string(), followed_id.to_string());
        self.immediate_tx(move |conn| {
            Box::pin(accept_follow_relation_tx(conn, follower_id, followed_id))
        })
        .await
    }

    /// Delete an edge, returning it when one existed
    pub async fn delete_follow_relation(
        &self,
        follower_id: &str,
        followed_id: &str,
    ) -> Result<Option<FollowRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowRelation>(
            "DELETE FROM follow_relations WHERE follower_id = ? AND followed_id = ? RETURNING *",
        )
        .bind(follower_id)
        .bind(followed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(relation)
    }

    /// Preferred inboxes of accepted remote followers
    pub async fn follower_inboxes(&self, followed_id: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT COALESCE(NULLIF(a.shared_inbox, ''), a.inbox)
            FROM follow_relations f
            JOIN actors a ON a.id = f.follower_id
            WHERE f.followed_id = ?
              AND f.pending = 0
              AND a.domain <> ''
              AND COALESCE(NULLIF(a.shared_inbox, ''), NULLIF(a.inbox, '')) IS NOT NULL
            "#,
        )
        .bind(followed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(inboxes)
    }

    pub async fn count_followers(&self, followed_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follow_relations WHERE followed_id = ? AND pending = 0",
        )
        .bind(followed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    pub async fn count_local_notes(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes WHERE uri IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert a note together with its mentions
    pub async fn insert_note(&self, note: &Note, mentions: &[String]) -> Result<(), AppError> {
        let (note, mentions) = (note.clone(), mentions.to_vec());
        self.immediate_tx(move |conn| Box::pin(insert_note_tx(conn, note, mentions, false)))
            .await
            .map(|_| ())
    }

    /// Insert a note ingested from a remote server, ignoring duplicates
    ///
    /// Mentions are only recorded when the note itself was new.
    pub async fn insert_remote_note(&self, note: &Note, mentions: &[String]) -> Result<bool, AppError> {
        let (note, mentions) = (note.clone(), mentions.to_vec());
        self.immediate_tx(move |conn| Box::pin(insert_note_tx(conn, note, mentions, true)))
            .await
    }

    /// Edit a local note's content, stamping `updated_at`
    pub async fn update_local_note(
        &self,
        id: &str,
        author_id: &str,
        content: &str,
        sensitive: bool,
    ) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>(
            r#"
            UPDATE notes SET content = ?, sensitive = ?, updated_at = ?
            WHERE id = ? AND author_id = ? AND uri IS NULL
            RETURNING *
            "#,
        )
        .bind(content)
        .bind(sensitive)
        .bind(Utc::now())
        .bind(id)
        .bind(author_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(note)
    }

    /// Apply an edit from the note's author
    ///
    /// Returns `false` when no note with that URI by that author exists.
    pub async fn update_remote_note(&self, note: &Note) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notes SET content = ?, visibility = ?, sensitive = ?, updated_at = ?
            WHERE uri = ? AND author_id = ?
            "#,
        )
        .bind(&note.content)
        .bind(&note.visibility_raw)
        .bind(note.sensitive)
        .bind(note.updated_at)
        .bind(&note.uri)
        .bind(&note.author_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(note)
    }

    pub async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(note)
    }

    /// Actors mentioned by a note
    pub async fn note_mentions(&self, note_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM note_mentions m
            JOIN actors a ON a.id = m.target_id
            WHERE m.note_id = ?
            ORDER BY a.id
            "#,
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }
}

/// Commit on success, roll back on error.
async fn finish_tx<T>(
    conn: &mut PoolConnection<Sqlite>,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut **conn).await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
                tracing::error!(%rollback_error, "Failed to roll back transaction");
            }
            Err(error)
        }
    }
}

async fn block_exists(
    conn: &mut SqliteConnection,
    a: &str,
    b: &str,
) -> Result<bool, AppError> {
    let exists = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM blocks
            WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)
        )
        "#,
    )
    .bind(a)
    .bind(b)
    .bind(b)
    .bind(a)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists != 0)
}

async fn insert_note_row(
    conn: &mut SqliteConnection,
    note: &Note,
    ignore_duplicates: bool,
) -> Result<bool, AppError> {
    let sql = if ignore_duplicates {
        r#"
        INSERT OR IGNORE INTO notes (
            id, uri, author_id, content, visibility, reply_to_id, renote_of_id,
            sensitive, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#
    } else {
        r#"
        INSERT INTO notes (
            id, uri, author_id, content, visibility, reply_to_id, renote_of_id,
            sensitive, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#
    };

    let result = sqlx::query(sql)
        .bind(&note.id)
        .bind(&note.uri)
        .bind(&note.author_id)
        .bind(&note.content)
        .bind(&note.visibility_raw)
        .bind(&note.reply_to_id)
        .bind(&note.renote_of_id)
        .bind(note.sensitive)
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

async fn upsert_remote_actor_tx(
    conn: &mut SqliteConnection,
    record: RemoteActorRecord,
) -> Result<Actor, AppError> {
    let actor = sqlx::query_as::<_, Actor>(
        r#"
        INSERT INTO actors (
            id, username, domain, display_name, bio, uri, inbox, shared_inbox,
            outbox, followers_url, following_url, public_key_pem, private_key_pem,
            auto_follow_accept, is_bot, fetched_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            username = excluded.username,
            domain = excluded.domain,
            display_name = excluded.display_name,
            bio = excluded.bio,
            inbox = excluded.inbox,
            shared_inbox = excluded.shared_inbox,
            outbox = excluded.outbox,
            followers_url = excluded.followers_url,
            following_url = excluded.following_url,
            auto_follow_accept = excluded.auto_follow_accept,
            is_bot = excluded.is_bot,
            fetched_at = excluded.fetched_at
        RETURNING *
        "#,
    )
    .bind(EntityId::new().0)
    .bind(&record.username)
    .bind(&record.domain)
    .bind(&record.display_name)
    .bind(&record.bio)
    .bind(&record.uri)
    .bind(&record.inbox)
    .bind(&record.shared_inbox)
    .bind(&record.outbox)
    .bind(&record.followers_url)
    .bind(&record.following_url)
    .bind(record.auto_follow_accept)
    .bind(record.is_bot)
    .bind(record.fetched_at)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM remote_public_keys WHERE owner_id = ?")
        .bind(&actor.id)
        .execute(&mut *conn)
        .await?;

    if let Some((key_id, public_key_pem)) = &record.public_key {
        sqlx::query(
            r#"
            INSERT INTO remote_public_keys (id, owner_id, key_id, public_key_pem, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                public_key_pem = excluded.public_key_pem,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(EntityId::new().0)
        .bind(&actor.id)
        .bind(key_id)
        .bind(public_key_pem)
        .bind(record.fetched_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(actor)
}

async fn create_follow_relation_tx(
    conn: &mut SqliteConnection,
    relation: FollowRelation,
) -> Result<bool, AppError> {
    if block_exists(conn, &relation.follower_id, &relation.followed_id).await? {
        return Err(AppError::CannotFollowBlock);
    }

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO follow_relations (
            id, follower_id, followed_id, pending, activity_uri, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&relation.id)
    .bind(&relation.follower_id)
    .bind(&relation.followed_id)
    .bind(relation.pending)
    .bind(&relation.activity_uri)
    .bind(relation.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(inserted.rows_affected() > 0)
}

async fn accept_follow_relation_tx(
    conn: &mut SqliteConnection,
    follower_id: String,
    followed_id: String,
) -> Result<Option<FollowRelation>, AppError> {
    if block_exists(conn, &follower_id, &followed_id).await? {
        return Err(AppError::CannotFollowBlock);
    }

    let relation = sqlx::query_as::<_, FollowRelation>(
        r#"
        UPDATE follow_relations SET pending = 0
        WHERE follower_id = ? AND followed_id = ? AND pending = 1
        RETURNING *
        "#,
    )
    .bind(&follower_id)
    .bind(&followed_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(relation)
}

/// Insert a note row and, when it was new, its mentions
async fn insert_note_tx(
    conn: &mut SqliteConnection,
    note: Note,
    mentions: Vec<String>,
    ignore_duplicates: bool,
) -> Result<bool, AppError> {
    let inserted = insert_note_row(conn, &note, ignore_duplicates).await?;
    if inserted {
        for target_id in &mentions {
            sqlx::query("INSERT OR IGNORE INTO note_mentions (note_id, target_id) VALUES (?, ?)")
                .bind(&note.id)
                .bind(target_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(inserted)
}
