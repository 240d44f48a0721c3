//! # ceros-hub — Real-time chat fan-out over WebSocket
//!
//! Tracks live connections, groups them into named rooms and pushes JSON
//! envelopes to every member of a room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  upgrade + token   ┌─────────────┐
//! │ Browser     │ ─────────────────► │ HubServer   │
//! │ (per tab)   │                    └──────┬──────┘
//! └──────┬──────┘                           │ one Connection per socket
//!        │ JSON envelopes                   ▼
//!        │                    ┌──────────────────────────┐
//!        └──────────────────► │ read pump ─► Dispatcher  │──► collaborators
//!                             │ write pump ◄─ buffer     │    (auth, store)
//!                             └────────────┬─────────────┘
//!                                          │ HubCommand
//!                                          ▼
//!                                   ┌─────────────┐
//!                                   │ Hub (actor) │── RoomRegistry
//!                                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope codec and frame batching
//! - [`room`] — Room ids and the room → members registry
//! - [`hub`] — Single-owner hub actor and its handle
//! - [`connection`] — Read/write pumps, keepalive, lifecycle
//! - [`dispatch`] — Inbound action handling
//! - [`collaborators`] — Auth, authorization and persistence seams
//! - [`server`] — Handshake and accept loop
//!
//! State is in-process only; running several nodes needs an external
//! pub/sub layer in front of [`HubHandle::broadcast_to_room`].

pub mod protocol;
pub mod room;
pub mod hub;
pub mod connection;
pub mod dispatch;
pub mod collaborators;
pub mod server;
pub mod error;

// Re-exports for convenience
pub use protocol::{Action, Envelope, Event, Frame, FrameBatch, MessageType, ProtocolError};
pub use room::{is_direct_id, RoomId, RoomKind, RoomRegistry};
pub use hub::{BroadcastOutcome, Hub, HubCommand, HubHandle, HubStats, Registration};
pub use connection::{
    CloseReason, Connection, ConnectionConfig, ConnectionContext, ConnectionId,
    ConnectionState, UserId,
};
pub use dispatch::Dispatcher;
pub use collaborators::{
    AllowAll, Authenticator, ChatMessage, MembershipPolicy, MemoryStore, MessageStore,
    RoomAuthorizer, SenderProfile, StaticTokens,
};
pub use server::{authorize_handshake, upgrade, HubServer, ServerConfig, Services};
pub use error::{AuthError, CollaboratorError, HubError};
