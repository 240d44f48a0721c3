//! Error types shared across the hub crate.

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::protocol::ProtocolError;

/// Top-level error for the server and the hub's async front door.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Handshake rejected: {0}")]
    Auth(#[from] AuthError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Hub is no longer running")]
    HubClosed,
}

/// Reasons an upgrade request is refused before it reaches the hub.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Token required")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),
    #[error("Unknown path: {0}")]
    UnknownPath(String),
}

impl AuthError {
    /// HTTP status answered on the upgrade request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::UnknownPath(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Failures reported by persistence or authorization collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}
