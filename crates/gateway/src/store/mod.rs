// Persistence for users, chats, messages, and read positions.
//
// Every store is an enum over a PostgreSQL pool and an in-memory map so
// session and subsystem logic is testable without a database, mirroring the
// gateway's broadcast layer split.

pub mod migrations;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::GatewayError;

/// A registered account. `password_fingerprint` tracks the current password
/// hash; credentials minted before a password change carry a stale
/// fingerprint and are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub password_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Personal,
    Group,
}

impl ChatType {
    pub fn as_db_value(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Group => "group",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "personal" => Some(Self::Personal),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    pub chat_type: ChatType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub chat_id: i64,
    pub author_id: i64,
    pub message_text: String,
    pub created_at: DateTime<Utc>,
}

/// Result of resolving the personal chat for a user pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonalChatResolution {
    pub chat_id: i64,
    /// True when this call created the chat (first contact between the pair).
    pub created: bool,
}

/// Normalized personal-chat pair key: smaller id first.
fn pair_key(a: i64, b: i64) -> (i64, i64) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

// ── Users ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: HashMap<i64, User>,
    routing: HashMap<i64, String>,
}

#[derive(Clone)]
pub enum UserStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryUserStore>>),
}

impl UserStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryUserStore::default())))
    }

    /// Memory store pre-seeded with accounts. Test and demo harnesses.
    pub fn memory_with(users: impl IntoIterator<Item = User>) -> Self {
        let map = users.into_iter().map(|user| (user.id, user)).collect();
        Self::Memory(Arc::new(RwLock::new(MemoryUserStore {
            users: map,
            routing: HashMap::new(),
        })))
    }

    pub async fn get(&self, user_id: i64) -> anyhow::Result<Option<User>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (i64, String, bool, Option<String>)>(
                    r#"
                    SELECT id, username, is_active, password_fingerprint
                    FROM users
                    WHERE id = $1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to load user")?;

                Ok(row.map(|(id, username, is_active, password_fingerprint)| User {
                    id,
                    username,
                    is_active,
                    password_fingerprint,
                }))
            }
            Self::Memory(store) => Ok(store.read().await.users.get(&user_id).cloned()),
        }
    }

    /// Record the connection address a user's frames should be routed to.
    /// Last writer wins: a newer connection displaces an older one.
    pub async fn set_routing_address(&self, user_id: i64, address: &str) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO user_routing (user_id, address, updated_at)
                    VALUES ($1, $2, now())
                    ON CONFLICT (user_id)
                    DO UPDATE SET address = EXCLUDED.address, updated_at = now()
                    "#,
                )
                .bind(user_id)
                .bind(address)
                .execute(pool)
                .await
                .context("failed to record routing address")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.routing.insert(user_id, address.to_owned());
                Ok(())
            }
        }
    }

    pub async fn routing_address(&self, user_id: i64) -> anyhow::Result<Option<String>> {
        match self {
            Self::Postgres(pool) => {
                let address = sqlx::query_scalar::<_, String>(
                    "SELECT address FROM user_routing WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to load routing address")?;
                Ok(address)
            }
            Self::Memory(store) => Ok(store.read().await.routing.get(&user_id).cloned()),
        }
    }

    /// Remove the routing entry, but only if it still points at `address`.
    /// A stale disconnect must not erase a newer connection's entry.
    pub async fn clear_routing_address(&self, user_id: i64, address: &str) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM user_routing WHERE user_id = $1 AND address = $2")
                    .bind(user_id)
                    .bind(address)
                    .execute(pool)
                    .await
                    .context("failed to clear routing address")?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if guard.routing.get(&user_id).is_some_and(|current| current == address) {
                    guard.routing.remove(&user_id);
                }
                Ok(())
            }
        }
    }
}

// ── Chats and messages ─────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    next_chat_id: i64,
    next_message_id: i64,
    chats: HashMap<i64, Chat>,
    personal_pairs: HashMap<(i64, i64), Vec<i64>>,
    /// (chat_id, user_id) → read position.
    members: HashMap<(i64, i64), Option<DateTime<Utc>>>,
    messages: HashMap<i64, ChatMessage>,
}

#[derive(Clone)]
pub enum ChatStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryChatStore>>),
}

impl ChatStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryChatStore::default())))
    }

    /// Find the personal chat for a user pair. More than one match is a data
    /// integrity violation: the pair invariant guarantees at most one.
    pub async fn find_personal_chat(&self, a: i64, b: i64) -> Result<Option<i64>, GatewayError> {
        let (low, high) = pair_key(a, b);
        let matches: Vec<i64> = match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, i64>(
                r#"
                SELECT id FROM chats
                WHERE chat_type = 'personal' AND peer_low = $1 AND peer_high = $2
                ORDER BY id
                "#,
            )
            .bind(low)
            .bind(high)
            .fetch_all(pool)
            .await
            .map_err(|error| GatewayError::Store(error.into()))?,
            Self::Memory(store) => {
                store.read().await.personal_pairs.get(&(low, high)).cloned().unwrap_or_default()
            }
        };

        match matches.as_slice() {
            [] => Ok(None),
            [chat_id] => Ok(Some(*chat_id)),
            many => Err(GatewayError::DataIntegrity(format!(
                "pair ({low}, {high}) has {} personal chats",
                many.len()
            ))),
        }
    }

    /// Resolve-or-create the personal chat for a pair.
    ///
    /// Two connections can race to create the same chat; the loser's insert
    /// hits the pair uniqueness constraint and falls back to re-resolving the
    /// winner's row.
    pub async fn resolve_personal_chat(
        &self,
        a: i64,
        b: i64,
    ) -> Result<PersonalChatResolution, GatewayError> {
        if let Some(chat_id) = self.find_personal_chat(a, b).await? {
            return Ok(PersonalChatResolution { chat_id, created: false });
        }

        let (low, high) = pair_key(a, b);
        match self {
            Self::Postgres(pool) => {
                let mut tx =
                    pool.begin().await.map_err(|error| GatewayError::Store(error.into()))?;

                let inserted = sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO chats (chat_type, peer_low, peer_high)
                    VALUES ('personal', $1, $2)
                    ON CONFLICT (peer_low, peer_high) WHERE chat_type = 'personal'
                    DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(low)
                .bind(high)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| GatewayError::Store(error.into()))?;

                match inserted {
                    Some(chat_id) => {
                        sqlx::query(
                            r#"
                            INSERT INTO chat_members (chat_id, user_id)
                            VALUES ($1, $2), ($1, $3)
                            "#,
                        )
                        .bind(chat_id)
                        .bind(low)
                        .bind(high)
                        .execute(&mut *tx)
                        .await
                        .map_err(|error| GatewayError::Store(error.into()))?;
                        tx.commit().await.map_err(|error| GatewayError::Store(error.into()))?;
                        Ok(PersonalChatResolution { chat_id, created: true })
                    }
                    None => {
                        tx.rollback()
                            .await
                            .map_err(|error| GatewayError::Store(error.into()))?;
                        // Lost the race; the other side's row must exist now.
                        let chat_id = self.find_personal_chat(a, b).await?.ok_or_else(|| {
                            GatewayError::DataIntegrity(format!(
                                "pair ({low}, {high}) vanished after insert conflict"
                            ))
                        })?;
                        Ok(PersonalChatResolution { chat_id, created: false })
                    }
                }
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if let Some(existing) = guard.personal_pairs.get(&(low, high)) {
                    if let Some(chat_id) = existing.first() {
                        return Ok(PersonalChatResolution { chat_id: *chat_id, created: false });
                    }
                }
                guard.next_chat_id += 1;
                let chat_id = guard.next_chat_id;
                guard.chats.insert(chat_id, Chat { id: chat_id, chat_type: ChatType::Personal });
                guard.personal_pairs.insert((low, high), vec![chat_id]);
                guard.members.insert((chat_id, low), None);
                guard.members.insert((chat_id, high), None);
                Ok(PersonalChatResolution { chat_id, created: true })
            }
        }
    }

    /// Ids of every chat the user belongs to; drives group joins on connect.
    pub async fn chat_ids_for_user(&self, user_id: i64) -> anyhow::Result<Vec<i64>> {
        match self {
            Self::Postgres(pool) => {
                let ids = sqlx::query_scalar::<_, i64>(
                    "SELECT chat_id FROM chat_members WHERE user_id = $1 ORDER BY chat_id",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to list chats for user")?;
                Ok(ids)
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                let mut ids: Vec<i64> = guard
                    .members
                    .keys()
                    .filter(|(_, member)| *member == user_id)
                    .map(|(chat_id, _)| *chat_id)
                    .collect();
                ids.sort_unstable();
                Ok(ids)
            }
        }
    }

    pub async fn is_member(&self, chat_id: i64, user_id: i64) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let exists = sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2
                    )
                    "#,
                )
                .bind(chat_id)
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("failed to check chat membership")?;
                Ok(exists)
            }
            Self::Memory(store) => {
                Ok(store.read().await.members.contains_key(&(chat_id, user_id)))
            }
        }
    }

    /// Persist a message with a server-assigned id and timestamp.
    pub async fn insert_message(
        &self,
        chat_id: i64,
        author_id: i64,
        message_text: &str,
    ) -> anyhow::Result<ChatMessage> {
        match self {
            Self::Postgres(pool) => {
                let (id, created_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
                    r#"
                    INSERT INTO chat_messages (chat_id, author_id, message_text)
                    VALUES ($1, $2, $3)
                    RETURNING id, created_at
                    "#,
                )
                .bind(chat_id)
                .bind(author_id)
                .bind(message_text)
                .fetch_one(pool)
                .await
                .context("failed to insert chat message")?;

                Ok(ChatMessage {
                    id,
                    chat_id,
                    author_id,
                    message_text: message_text.to_owned(),
                    created_at,
                })
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                guard.next_message_id += 1;
                let message = ChatMessage {
                    id: guard.next_message_id,
                    chat_id,
                    author_id,
                    message_text: message_text.to_owned(),
                    created_at: Utc::now(),
                };
                guard.messages.insert(message.id, message.clone());
                Ok(message)
            }
        }
    }

    pub async fn message(&self, message_id: i64) -> anyhow::Result<Option<ChatMessage>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (i64, i64, i64, String, DateTime<Utc>)>(
                    r#"
                    SELECT id, chat_id, author_id, message_text, created_at
                    FROM chat_messages
                    WHERE id = $1
                    "#,
                )
                .bind(message_id)
                .fetch_optional(pool)
                .await
                .context("failed to load chat message")?;

                Ok(row.map(|(id, chat_id, author_id, message_text, created_at)| ChatMessage {
                    id,
                    chat_id,
                    author_id,
                    message_text,
                    created_at,
                }))
            }
            Self::Memory(store) => Ok(store.read().await.messages.get(&message_id).cloned()),
        }
    }

    /// Advance a member's read position to `up_to`, never backwards.
    pub async fn advance_read_before(
        &self,
        chat_id: i64,
        user_id: i64,
        up_to: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE chat_members
                    SET read_before = GREATEST(coalesce(read_before, $3), $3)
                    WHERE chat_id = $1 AND user_id = $2
                    "#,
                )
                .bind(chat_id)
                .bind(user_id)
                .bind(up_to)
                .execute(pool)
                .await
                .context("failed to advance read position")?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if let Some(read_before) = guard.members.get_mut(&(chat_id, user_id)) {
                    if read_before.is_none_or(|current| current < up_to) {
                        *read_before = Some(up_to);
                    }
                }
                Ok(())
            }
        }
    }

    /// Current read position for a member. Test observability.
    pub async fn read_before(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
                    "SELECT read_before FROM chat_members WHERE chat_id = $1 AND user_id = $2",
                )
                .bind(chat_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to load read position")?;
                Ok(row.flatten())
            }
            Self::Memory(store) => {
                Ok(store.read().await.members.get(&(chat_id, user_id)).copied().flatten())
            }
        }
    }
}
