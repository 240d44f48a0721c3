//! Upgrade entrypoint and TCP accept loop.
//!
//! ```text
//! TCP accept ─► handshake (path, Origin, ?token=) ─► Connection::register ─► run
//!                   │ reject
//!                   └─► 401 / 403 / 404, never reaches the hub
//! ```
//!
//! Authentication happens inside the WebSocket handshake callback, so a
//! rejected client gets a plain HTTP error response and no hub state is
//! touched.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;

use crate::collaborators::{Authenticator, MessageStore, RoomAuthorizer};
use crate::connection::{Connection, ConnectionConfig, UserId};
use crate::dispatch::Dispatcher;
use crate::error::{AuthError, HubError};
use crate::hub::HubHandle;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade path; any other path answers 404
    pub ws_path: String,
    /// Accepted `Origin` values; empty accepts any
    pub allowed_origins: Vec<String>,
    /// Capacity of the hub's command queue
    pub hub_queue_capacity: usize,
    /// Per-connection limits and timing
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws/chat".to_string(),
            allowed_origins: Vec::new(),
            hub_queue_capacity: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CEROS_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("CEROS_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("CEROS_WS_PATH") {
            config.ws_path = path;
        }
        if let Some(origins) = lookup("CEROS_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = parsed::<usize>(&lookup, "CEROS_SEND_BUFFER") {
            config.connection = config.connection.with_send_buffer(n);
        }
        if let Some(n) = parsed::<usize>(&lookup, "CEROS_MAX_MESSAGE_SIZE") {
            config.connection.max_message_size = n;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "CEROS_READ_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.connection = config.connection.with_read_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "CEROS_WRITE_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.connection = config.connection.with_write_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "CEROS_COLLABORATOR_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.connection = config.connection.with_collaborator_timeout(Duration::from_secs(secs));
        }
        config
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}

/// External collaborators wired into every connection.
#[derive(Clone)]
pub struct Services {
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn RoomAuthorizer>,
    pub store: Arc<dyn MessageStore>,
}

/// Accepts sockets and turns each into a running [`Connection`].
pub struct HubServer {
    config: Arc<ServerConfig>,
    hub: HubHandle,
    authenticator: Arc<dyn Authenticator>,
    dispatcher: Arc<Dispatcher>,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: HubHandle, services: Services) -> Self {
        let dispatcher = Arc::new(
            Dispatcher::new(hub.clone(), services.store, services.authorizer)
                .with_collaborator_timeout(config.connection.collaborator_timeout),
        );
        Self {
            config: Arc::new(config),
            hub,
            authenticator: services.authenticator,
            dispatcher,
        }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Chat hub listening on ws://{}{}",
            listener.local_addr()?,
            self.config.ws_path
        );
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HubError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let hub = self.hub.clone();
            let authenticator = self.authenticator.clone();
            let dispatcher = self.dispatcher.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_socket(stream, &config, hub, authenticator.as_ref(), dispatcher).await {
                    match e {
                        HubError::Auth(reason) => log::warn!("Rejected upgrade from {addr}: {reason}"),
                        other => log::debug!("Connection from {addr} failed: {other}"),
                    }
                }
            });
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    config: &ServerConfig,
    hub: HubHandle,
    authenticator: &dyn Authenticator,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), HubError> {
    let (ws, user_id) = upgrade(stream, config, authenticator).await?;
    let connection = Connection::register(ws, user_id, hub, dispatcher, config.connection.clone()).await?;
    connection.run().await;
    Ok(())
}

/// Perform the WebSocket handshake, authenticating inside the callback.
pub async fn upgrade<S>(
    stream: S,
    config: &ServerConfig,
    authenticator: &dyn Authenticator,
) -> Result<(WebSocketStream<S>, UserId), HubError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.connection.max_message_size))
        .max_frame_size(Some(config.connection.max_message_size));

    let mut outcome: Option<Result<UserId, AuthError>> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let result = authorize_handshake(request, config, authenticator);
        let reply = match &result {
            Ok(_) => Ok(response),
            Err(reason) => Err(rejection(reason)),
        };
        outcome = Some(result);
        reply
    };

    let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;
    match (handshake, outcome) {
        (Ok(ws), Some(Ok(user_id))) => Ok((ws, user_id)),
        (_, Some(Err(reason))) => Err(reason.into()),
        (Err(e), _) => Err(e.into()),
        // Callback never ran: tungstenite rejected the request itself.
        (Ok(_), None) => Err(AuthError::MissingToken.into()),
    }
}

/// Check the upgrade request: path, then `Origin`, then the `token` query parameter.
pub fn authorize_handshake(
    request: &Request,
    config: &ServerConfig,
    authenticator: &dyn Authenticator,
) -> Result<UserId, AuthError> {
    let uri = request.uri();
    if uri.path() != config.ws_path {
        return Err(AuthError::UnknownPath(uri.path().to_string()));
    }

    // Non-browser clients send no Origin.
    if let Some(origin) = request.headers().get("origin") {
        let origin = origin.to_str().unwrap_or_default();
        if !config.origin_allowed(origin) {
            return Err(AuthError::OriginNotAllowed(origin.to_string()));
        }
    }

    let token = uri.query().and_then(|q| query_param(q, "token")).unwrap_or_default();
    authenticator.authenticate(token)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| match pair.split_once('=') {
        Some((k, v)) if k == key => Some(v),
        None if pair == key => Some(""),
        _ => None,
    })
}

fn rejection(reason: &AuthError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = reason.status();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticTokens;
    use std::collections::HashMap;
    use tokio_tungstenite::tungstenite::http::StatusCode;

    fn request(uri: &str, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }
        builder.body(()).unwrap()
    }

    fn tokens() -> StaticTokens {
        StaticTokens::new().with_token("secret", "alice")
    }

    #[test]
    fn test_valid_token_resolves_user() {
        let config = ServerConfig::default();
        let user = authorize_handshake(&request("/ws/chat?token=secret", None), &config, &tokens());
        assert_eq!(user, Ok(UserId::from("alice")));
    }

    #[test]
    fn test_missing_and_bad_tokens() {
        let config = ServerConfig::default();
        assert_eq!(
            authorize_handshake(&request("/ws/chat", None), &config, &tokens()),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            authorize_handshake(&request("/ws/chat?token=", None), &config, &tokens()),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            authorize_handshake(&request("/ws/chat?other=1&token=nope", None), &config, &tokens()),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_wrong_path() {
        let config = ServerConfig::default();
        let err = authorize_handshake(&request("/other?token=secret", None), &config, &tokens()).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_origin_allow_list() {
        let config = ServerConfig {
            allowed_origins: vec!["https://ceros.app".into()],
            ..ServerConfig::default()
        };
        let ok = request("/ws/chat?token=secret", Some("https://ceros.app"));
        let bad = request("/ws/chat?token=secret", Some("https://evil.example"));

        assert!(authorize_handshake(&ok, &config, &tokens()).is_ok());
        assert_eq!(
            authorize_handshake(&bad, &config, &tokens()),
            Err(AuthError::OriginNotAllowed("https://evil.example".into()))
        );
        // No Origin header: not a browser, allowed
        assert!(authorize_handshake(&request("/ws/chat?token=secret", None), &config, &tokens()).is_ok());
    }

    #[test]
    fn test_rejection_response_status() {
        let response = rejection(&AuthError::OriginNotAllowed("x".into()));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_deref(), Some("Origin not allowed: x"));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("a=1&token=t&b=2", "token"), Some("t"));
        assert_eq!(query_param("token", "token"), Some(""));
        assert_eq!(query_param("tokens=t", "token"), None);
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("CEROS_BIND_ADDR", "0.0.0.0:9000"),
            ("CEROS_ALLOWED_ORIGINS", "https://a, https://b,"),
            ("CEROS_SEND_BUFFER", "32"),
            ("CEROS_READ_TIMEOUT_SECS", "10"),
            ("CEROS_WRITE_TIMEOUT_SECS", "oops"),
            ("CEROS_COLLABORATOR_TIMEOUT_SECS", "2"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.ws_path, "/ws/chat");
        assert_eq!(config.allowed_origins, vec!["https://a", "https://b"]);
        assert_eq!(config.connection.send_buffer, 32);
        assert_eq!(config.connection.read_timeout, Duration::from_secs(10));
        assert_eq!(config.connection.ping_interval, Duration::from_secs(9));
        assert_eq!(config.connection.write_timeout, Duration::from_secs(10));
        assert_eq!(config.connection.collaborator_timeout, Duration::from_secs(2));
    }
}
