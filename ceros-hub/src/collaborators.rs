//! Narrow interfaces to the rest of the application.
//!
//! The hub never calls these. The dispatch step consults them before it
//! touches the hub (authorization) or while building a broadcast
//! (persistence, sender metadata). The in-memory implementations back the
//! server binary and the tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::UserId;
use crate::error::{AuthError, CollaboratorError};
use crate::protocol::MessageType;
use crate::room::{is_direct_id, RoomId, RoomKind};

/// A chat message as stored and as broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    /// Classifier as sent by the client; unknown values pass through.
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_id: UserId,
    pub content: String,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub thread_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ChatMessage {
    pub fn new(kind: impl Into<String>, sender_id: UserId, room_id: RoomId, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            sender_id,
            content,
            room_id,
            timestamp: Utc::now(),
            parent_message_id: None,
            thread_count: 0,
        }
    }

    pub fn reply(sender_id: UserId, room_id: RoomId, content: String, parent: Uuid) -> Self {
        Self {
            parent_message_id: Some(parent),
            ..Self::new(MessageType::Reply.as_str(), sender_id, room_id, content)
        }
    }
}

/// Display metadata attached to broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Durable chat history and sender lookup.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), CollaboratorError>;

    async fn increment_thread_count(&self, parent: Uuid) -> Result<(), CollaboratorError>;

    async fn sender_profile(&self, user: &UserId) -> Result<SenderProfile, CollaboratorError>;
}

/// Decides whether a user may join a room.
#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    async fn can_join(&self, user: &UserId, room: &RoomId) -> Result<bool, CollaboratorError>;
}

/// Resolves the upgrade token to an identity. Runs inside the handshake.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// In-process message store. Keeps insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<ChatMessage>>,
    profiles: RwLock<HashMap<UserId, SenderProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: SenderProfile) {
        self.profiles.write().await.insert(profile.id.clone(), profile);
    }

    /// Messages of one room in timestamp order.
    pub async fn history(&self, room: &RoomId) -> Vec<ChatMessage> {
        let messages = self.messages.read().await;
        let mut history: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| &m.room_id == room)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.timestamp);
        history
    }

    pub async fn get(&self, id: Uuid) -> Option<ChatMessage> {
        self.messages.read().await.iter().find(|m| m.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), CollaboratorError> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn increment_thread_count(&self, parent: Uuid) -> Result<(), CollaboratorError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == parent)
            .ok_or_else(|| CollaboratorError::NotFound(format!("message {parent}")))?;
        message.thread_count += 1;
        Ok(())
    }

    async fn sender_profile(&self, user: &UserId) -> Result<SenderProfile, CollaboratorError> {
        self.profiles
            .read()
            .await
            .get(user)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("user {user}")))
    }
}

/// Lets everyone join everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl RoomAuthorizer for AllowAll {
    async fn can_join(&self, _user: &UserId, _room: &RoomId) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}

/// Room access by naming convention.
///
/// Direct rooms admit their two participants, committee rooms admit
/// registered committee members, every other room is open.
#[derive(Debug, Default)]
pub struct MembershipPolicy {
    committees: RwLock<HashMap<String, HashSet<UserId>>>,
}

impl MembershipPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_committee_member(&self, committee_id: &str, user: UserId) {
        self.committees
            .write()
            .await
            .entry(committee_id.to_string())
            .or_default()
            .insert(user);
    }

    pub async fn remove_committee_member(&self, committee_id: &str, user: &UserId) {
        let mut committees = self.committees.write().await;
        if let Some(members) = committees.get_mut(committee_id) {
            members.remove(user);
            if members.is_empty() {
                committees.remove(committee_id);
            }
        }
    }
}

#[async_trait]
impl RoomAuthorizer for MembershipPolicy {
    async fn can_join(&self, user: &UserId, room: &RoomId) -> Result<bool, CollaboratorError> {
        match room.kind() {
            RoomKind::Direct => Ok(room.is_direct_participant(user.as_str())),
            RoomKind::Committee => {
                let Some(committee_id) = room.committee_id() else {
                    return Ok(false);
                };
                Ok(self
                    .committees
                    .read()
                    .await
                    .get(committee_id)
                    .is_some_and(|members| members.contains(user)))
            }
            RoomKind::Group | RoomKind::Other => Ok(true),
        }
    }
}

/// Fixed token → user table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: impl Into<UserId>) {
        self.tokens.insert(token.into(), user.into());
    }

    /// Parse `token=user,token=user`.
    ///
    /// Malformed pairs are skipped, as are user ids containing `_`, which
    /// could not be told apart inside a direct room name.
    pub fn parse(entries: &str) -> Self {
        let mut tokens = Self::new();
        for pair in entries.split(',') {
            match pair.trim().split_once('=') {
                Some((token, user)) if !token.is_empty() && is_direct_id(user) => {
                    tokens.insert(token, user);
                }
                _ => {
                    if !pair.trim().is_empty() {
                        log::warn!("Skipping malformed token entry: {pair}");
                    }
                }
            }
        }
        tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}
