//! Inbound action handling.
//!
//! Sits between a connection's read pump and the hub. Authorization and
//! persistence happen here, before anything reaches the hub, so the hub
//! only ever sees membership changes and ready-to-send envelopes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use uuid::Uuid;

use crate::collaborators::{ChatMessage, MessageStore, RoomAuthorizer};
use crate::connection::ConnectionContext;
use crate::error::{CollaboratorError, HubError};
use crate::hub::HubHandle;
use crate::protocol::{Action, Envelope, Event, MessageType, ProtocolError};
use crate::room::RoomId;

/// `join_room` / `leave_room` accept a bare room id or `{ "roomId": ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoomTarget {
    Bare(RoomId),
    Object {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
}

impl RoomTarget {
    fn into_room(self) -> RoomId {
        match self {
            Self::Bare(room) | Self::Object { room_id: room } => room,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessage {
    room_id: RoomId,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyToMessage {
    room_id: RoomId,
    content: String,
    parent_message_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposeMotion {
    room_id: RoomId,
    title: String,
    description: String,
    committee_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecondMotion {
    room_id: RoomId,
    motion_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteMotion {
    room_id: RoomId,
    motion_id: String,
    vote: String,
}

/// Routes decoded envelopes to the hub, consulting collaborators first.
///
/// Every collaborator call is bounded by `collaborator_timeout`; a call that
/// overruns is treated like a failed one.
pub struct Dispatcher {
    hub: HubHandle,
    store: Arc<dyn MessageStore>,
    authorizer: Arc<dyn RoomAuthorizer>,
    collaborator_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        authorizer: Arc<dyn RoomAuthorizer>,
    ) -> Self {
        Self {
            hub,
            store,
            authorizer,
            collaborator_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_collaborator_timeout(mut self, limit: Duration) -> Self {
        self.collaborator_timeout = limit;
        self
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Handle one inbound envelope.
    ///
    /// Malformed payloads and unknown actions are logged and dropped. The
    /// only error is [`HubError::HubClosed`].
    pub async fn dispatch(&self, ctx: &ConnectionContext, envelope: Envelope) -> Result<(), HubError> {
        let Some(action) = envelope.parsed_action() else {
            log::debug!("Ignoring unknown action {:?} from {}", envelope.action, ctx.user_id);
            return Ok(());
        };

        let result = match action {
            Action::JoinRoom => self.join_room(ctx, &envelope).await,
            Action::LeaveRoom => self.leave_room(ctx, &envelope).await,
            Action::SendMessage => self.send_message(ctx, &envelope).await,
            Action::ReplyToMessage => self.reply_to_message(ctx, &envelope).await,
            Action::ProposeMotion => self.propose_motion(ctx, &envelope).await,
            Action::SecondMotion => self.second_motion(ctx, &envelope).await,
            Action::VoteMotion => self.vote_motion(ctx, &envelope).await,
        };

        match result {
            Err(HubError::Protocol(e)) => {
                log::warn!("Dropping {} from {}: {e}", action.as_str(), ctx.user_id);
                Ok(())
            }
            other => other,
        }
    }

    async fn join_room(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let room = envelope.payload_as::<RoomTarget>()?.into_room();

        let denial = match self.bounded("can_join", self.authorizer.can_join(&ctx.user_id, &room)).await {
            Ok(true) => None,
            Ok(false) => Some("not allowed to join room".to_string()),
            Err(e) => {
                log::error!("Authorization check for {} on {room} failed: {e}", ctx.user_id);
                Some("authorization unavailable".to_string())
            }
        };

        if let Some(reason) = denial {
            log::warn!("Join of {room} denied for {}", ctx.user_id);
            let notice = Envelope::error(reason, json!({ "action": "join_room", "roomId": room }));
            return self.hub.send_to(ctx.id, notice).await;
        }

        self.hub.join_room(ctx.id, room).await
    }

    async fn leave_room(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let room = envelope.payload_as::<RoomTarget>()?.into_room();
        self.hub.leave_room(ctx.id, room).await
    }

    async fn send_message(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let SendMessage { room_id, content } = envelope.payload_as()?;
        let kind = if envelope.kind.is_empty() {
            MessageType::Group.as_str().to_string()
        } else {
            envelope.kind.clone()
        };

        let message = ChatMessage::new(kind.clone(), ctx.user_id.clone(), room_id.clone(), content);
        if let Err(e) = self.bounded("save_message", self.store.save_message(&message)).await {
            log::error!("Failed to save message {} in {room_id}: {e}", message.id);
        }

        let payload = self.enrich(&message).await?;
        let event = Envelope {
            action: Event::NewMessage.as_str().to_string(),
            kind,
            payload,
        };
        self.hub.broadcast_to_room(room_id, event).await
    }

    async fn reply_to_message(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let ReplyToMessage {
            room_id,
            content,
            parent_message_id,
        } = envelope.payload_as()?;

        let reply = ChatMessage::reply(ctx.user_id.clone(), room_id.clone(), content, parent_message_id);
        if let Err(e) = self.bounded("save_message", self.store.save_message(&reply)).await {
            log::error!("Failed to save reply {} in {room_id}: {e}", reply.id);
        } else if let Err(e) = self
            .bounded("increment_thread_count", self.store.increment_thread_count(parent_message_id))
            .await
        {
            log::warn!("Failed to bump thread count of {parent_message_id}: {e}");
        }

        let payload = self.enrich(&reply).await?;
        self.hub
            .broadcast_to_room(room_id, Envelope::event(Event::NewReply, MessageType::Reply, payload))
            .await
    }

    async fn propose_motion(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let ProposeMotion {
            room_id,
            title,
            description,
            committee_id,
        } = envelope.payload_as()?;

        let payload = json!({
            "title": title,
            "description": description,
            "moverId": ctx.user_id,
            "committeeId": committee_id,
            "status": "proposed",
        });
        self.hub
            .broadcast_to_room(room_id, Envelope::event(Event::MotionProposed, MessageType::Motion, payload))
            .await
    }

    async fn second_motion(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let SecondMotion { room_id, motion_id } = envelope.payload_as()?;

        let payload = json!({ "motionId": motion_id, "seconderId": ctx.user_id });
        self.hub
            .broadcast_to_room(room_id, Envelope::event(Event::MotionSeconded, MessageType::Motion, payload))
            .await
    }

    async fn vote_motion(&self, ctx: &ConnectionContext, envelope: &Envelope) -> Result<(), HubError> {
        let VoteMotion {
            room_id,
            motion_id,
            vote,
        } = envelope.payload_as()?;

        let payload = json!({ "motionId": motion_id, "voterId": ctx.user_id, "vote": vote });
        self.hub
            .broadcast_to_room(room_id, Envelope::event(Event::VoteCast, MessageType::Motion, payload))
            .await
    }

    async fn bounded<T>(
        &self,
        call: &str,
        fut: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        timeout(self.collaborator_timeout, fut).await.unwrap_or_else(|_| {
            Err(CollaboratorError::Unavailable(format!(
                "{call} timed out after {:?}",
                self.collaborator_timeout
            )))
        })
    }

    /// `{message, sender}` when the profile resolves, the bare message otherwise.
    async fn enrich(&self, message: &ChatMessage) -> Result<Value, HubError> {
        let message_value = to_value(message)?;
        match self.bounded("sender_profile", self.store.sender_profile(&message.sender_id)).await {
            Ok(sender) => Ok(json!({ "message": message_value, "sender": to_value(&sender)? })),
            Err(e) => {
                log::warn!("Sender lookup for {} failed: {e}", message.sender_id);
                Ok(message_value)
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, HubError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()).into())
}
