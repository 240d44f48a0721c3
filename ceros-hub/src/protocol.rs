//! JSON envelope codec for the chat socket.
//!
//! Wire format (one UTF-8 text frame, several envelopes may be joined by `\n`):
//! ```text
//! { "action": "send_message", "type": "group", "payload": { ... } }
//! ```
//!
//! The codec is stateless. It knows nothing about rooms beyond what the
//! dispatch step pulls out of the payload, and it never rejects an envelope
//! because of an unknown `action` or `type`.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A serialized envelope, shared between every room member it is fanned out to.
pub type Frame = Arc<str>;

/// Inbound actions understood by the dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    JoinRoom,
    LeaveRoom,
    SendMessage,
    ReplyToMessage,
    ProposeMotion,
    SecondMotion,
    VoteMotion,
}

impl Action {
    /// Resolve a wire tag. Unknown tags yield `None` and are ignored upstream.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "join_room" => Some(Self::JoinRoom),
            "leave_room" => Some(Self::LeaveRoom),
            "send_message" => Some(Self::SendMessage),
            "reply_to_message" => Some(Self::ReplyToMessage),
            "propose_motion" => Some(Self::ProposeMotion),
            "second_motion" => Some(Self::SecondMotion),
            "vote_motion" => Some(Self::VoteMotion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinRoom => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::SendMessage => "send_message",
            Self::ReplyToMessage => "reply_to_message",
            Self::ProposeMotion => "propose_motion",
            Self::SecondMotion => "second_motion",
            Self::VoteMotion => "vote_motion",
        }
    }
}

/// Outbound event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    NewMessage,
    NewReply,
    MotionProposed,
    MotionSeconded,
    VoteCast,
    ReactionUpdate,
    Error,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::NewReply => "new_reply",
            Self::MotionProposed => "motion_proposed",
            Self::MotionSeconded => "motion_seconded",
            Self::VoteCast => "vote_cast",
            Self::ReactionUpdate => "reaction_update",
            Self::Error => "error",
        }
    }
}

/// Coarse message classifier carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Dm,
    Group,
    Motion,
    System,
    Reply,
}

impl MessageType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "dm" => Some(Self::Dm),
            "group" => Some(Self::Group),
            "motion" => Some(Self::Motion),
            "system" => Some(Self::System),
            "reply" => Some(Self::Reply),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Group => "group",
            Self::Motion => "motion",
            Self::System => "system",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged over a connection.
///
/// `kind` stays a plain string so classifiers this build does not know about
/// survive a decode/encode cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(action: impl Into<String>, kind: MessageType, payload: Value) -> Self {
        Self {
            action: action.into(),
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    /// Build an outbound event envelope.
    pub fn event(event: Event, kind: MessageType, payload: Value) -> Self {
        Self::new(event.as_str(), kind, payload)
    }

    /// Direct error notice for a single connection.
    pub fn error(message: impl Into<String>, detail: Value) -> Self {
        Self::event(
            Event::Error,
            MessageType::System,
            serde_json::json!({ "message": message.into(), "detail": detail }),
        )
    }

    /// Known inbound action, if any.
    pub fn parsed_action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Known classifier, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    /// Interpret the payload as an action-specific structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            action: self.action.clone(),
            reason: e.to_string(),
        })
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize once into a shareable frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Frame::from)
    }

    /// Deserialize a single inbound text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Joins queued frames into one newline-delimited text frame.
#[derive(Debug, Default)]
pub struct FrameBatch {
    buf: String,
    frames: usize,
}

impl FrameBatch {
    pub fn new(first: &str) -> Self {
        Self {
            buf: first.to_string(),
            frames: 1,
        }
    }

    pub fn push(&mut self, frame: &str) {
        if self.frames > 0 {
            self.buf.push('\n');
        }
        self.buf.push_str(frame);
        self.frames += 1;
    }

    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn into_text(self) -> String {
        self.buf
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },
}
