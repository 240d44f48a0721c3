//! Ceros chat hub — standalone WebSocket server.
//!
//! Configuration comes from `CEROS_*` environment variables (see
//! [`ServerConfig::from_env`]); `CEROS_TOKENS` seeds the token table as
//! `token=user,token=user`. `RUST_LOG` controls verbosity.

use std::env;
use std::sync::Arc;

use log::{info, warn};

use ceros_hub::{Hub, HubError, HubServer, MembershipPolicy, MemoryStore, ServerConfig, Services, StaticTokens};

#[tokio::main]
async fn main() -> Result<(), HubError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Ceros chat hub...");

    let config = ServerConfig::from_env();
    let tokens = StaticTokens::parse(&env::var("CEROS_TOKENS").unwrap_or_default());
    if tokens.is_empty() {
        warn!("CEROS_TOKENS is empty; every upgrade will be rejected");
    } else {
        info!("Loaded {} access tokens", tokens.len());
    }

    let hub = Hub::new().spawn(config.hub_queue_capacity);
    let services = Services {
        authenticator: Arc::new(tokens),
        authorizer: Arc::new(MembershipPolicy::new()),
        store: Arc::new(MemoryStore::new()),
    };

    HubServer::new(config, hub, services).run().await
}
