// src/memory.rs

use crate::database::{ChatStore, StoreError};
use crate::models::{Chat, ChatId, Message, NewMessage, NewUser, User, UserId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    chats: HashMap<ChatId, Chat>,
    members: HashMap<ChatId, BTreeSet<UserId>>,
    messages: Vec<Message>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`ChatStore`] held entirely in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted messages of a chat, oldest first.
    pub async fn messages_in(&self, chat_id: ChatId) -> Vec<Message> {
        let tables = self.tables.lock().await;
        tables
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .users
            .values()
            .find(|u| u.email == user.email || u.name == user.name)
        {
            return Err(StoreError::Conflict(format!(
                "user '{}' <{}> already exists",
                existing.name, existing.email
            )));
        }

        let now = Utc::now();
        let id = tables.next_id();
        let created = User {
            id,
            name: user.name,
            email: user.email,
            password: user.password,
            avatar_url: user.avatar_url,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.users.insert(id, created.clone());
        Ok(created)
    }

    async fn create_chat(&self, name: &str) -> Result<Chat, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.chats.values().any(|c| c.name == name) {
            return Err(StoreError::Conflict(format!("chat '{name}' already exists")));
        }

        let now = Utc::now();
        let id = tables.next_id();
        let chat = Chat {
            id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.chats.insert(id, chat.clone());
        Ok(chat)
    }

    async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.chats.contains_key(&chat_id) {
            return Err(StoreError::NotFound {
                entity: "chat",
                id: chat_id,
            });
        }
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id,
            });
        }
        tables.members.entry(chat_id).or_default().insert(user_id);
        Ok(())
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.get(&id).filter(|u| u.deleted_at.is_none()).cloned())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.chats.contains_key(&message.chat_id) {
            return Err(StoreError::NotFound {
                entity: "chat",
                id: message.chat_id,
            });
        }
        if !tables.users.contains_key(&message.from_id) {
            return Err(StoreError::NotFound {
                entity: "user",
                id: message.from_id,
            });
        }

        let now = Utc::now();
        let id = tables.next_id();
        let stored = Message {
            id,
            chat_id: message.chat_id,
            from_id: message.from_id,
            content: message.content,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    async fn chat_members_except(
        &self,
        chat_id: ChatId,
        skip_user_id: UserId,
    ) -> Result<Vec<UserId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .members
            .get(&chat_id)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|id| *id != skip_user_id)
                    .filter(|id| tables.users.get(id).is_some_and(|u| u.deleted_at.is_none()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .members
            .get(&chat_id)
            .is_some_and(|members| members.contains(&user_id)))
    }
}
