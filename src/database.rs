// src/database.rs

use crate::config::DatabaseSettings;
use crate::models::{Chat, ChatId, Message, NewMessage, NewUser, User, UserId};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Errors surfaced by a [`ChatStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence needed by the fan-out path, plus the inserts used to populate it.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    async fn create_chat(&self, name: &str) -> Result<Chat, StoreError>;

    /// Adds `user_id` to the chat. Adding an existing member is a no-op.
    async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), StoreError>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Inserts a message. Fails with `NotFound` when the chat or the sender does not exist.
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Member ids of the chat other than `skip_user_id`, ascending.
    async fn chat_members_except(
        &self,
        chat_id: ChatId,
        skip_user_id: UserId,
    ) -> Result<Vec<UserId>, StoreError>;

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError>;
}

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL DEFAULT '',
        avatar_url TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS chats (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS chat_members (
        chat_id BIGINT NOT NULL REFERENCES chats (id),
        user_id BIGINT NOT NULL REFERENCES users (id),
        PRIMARY KEY (chat_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        chat_id BIGINT NOT NULL REFERENCES chats (id),
        from_id BIGINT NOT NULL REFERENCES users (id),
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )",
];

/// Connects to PostgreSQL and creates the schema if it doesn't exist.
pub async fn setup_database(settings: &DatabaseSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .connect(&settings.url)
        .await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    tracing::info!(max_connections = settings.max_connections, "PostgreSQL schema ready");
    Ok(pool)
}

/// [`ChatStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, sqlx::Error> {
        setup_database(settings).await.map(Self::new)
    }
}

/// Maps constraint violations onto store errors.
/// `refs` pairs a foreign-key column with its entity and id.
fn map_db_error(err: sqlx::Error, refs: &[(&str, &'static str, i64)]) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(db_err.message().to_string());
        }
        if db_err.is_foreign_key_violation() {
            let constraint = db_err.constraint().unwrap_or_default();
            let referenced = refs
                .iter()
                .find(|(column, _, _)| constraint.contains(column));
            if let Some((_, entity, id)) = referenced {
                return StoreError::NotFound {
                    entity: *entity,
                    id: *id,
                };
            }
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (name, email, password, avatar_url)
             VALUES ($1, $2, $3, $4)
             RETURNING id, name, email, password, avatar_url, created_at, updated_at, deleted_at",
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&user.avatar_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error(e, &[]))
    }

    async fn create_chat(&self, name: &str) -> Result<Chat, StoreError> {
        sqlx::query_as::<_, Chat>(
            "INSERT INTO chats (name) VALUES ($1)
             RETURNING id, name, created_at, updated_at, deleted_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error(e, &[]))
    }

    async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_db_error(e, &[("chat_id", "chat", chat_id), ("user_id", "user", user_id)])
        })?;
        Ok(())
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, password, avatar_url, created_at, updated_at, deleted_at
             FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        sqlx::query_as::<_, Message>(
            "INSERT INTO messages (chat_id, from_id, content) VALUES ($1, $2, $3)
             RETURNING id, chat_id, from_id, content, created_at, updated_at, deleted_at",
        )
        .bind(message.chat_id)
        .bind(message.from_id)
        .bind(&message.content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_db_error(
                e,
                &[("chat_id", "chat", message.chat_id), ("from_id", "user", message.from_id)],
            )
        })
    }

    async fn chat_members_except(
        &self,
        chat_id: ChatId,
        skip_user_id: UserId,
    ) -> Result<Vec<UserId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT users.id FROM users
             JOIN chat_members ON users.id = chat_members.user_id
             WHERE chat_members.chat_id = $1 AND users.id <> $2 AND users.deleted_at IS NULL
             ORDER BY users.id",
        )
        .bind(chat_id)
        .bind(skip_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
