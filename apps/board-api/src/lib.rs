pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod render;
pub mod routes;

use std::sync::Arc;

use auth::Authenticator;
use config::Config;
use db::boards::BoardStore;
use db::presence::PresenceStore;
use gateway::Hub;
use render::TaskRenderer;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub boards: Arc<dyn BoardStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub renderer: Arc<dyn TaskRenderer>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire up the collaborators and start a hub for them. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: Config,
        boards: Arc<dyn BoardStore>,
        presence: Arc<dyn PresenceStore>,
        renderer: Arc<dyn TaskRenderer>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let hub = Hub::spawn(config.hub.clone(), presence.clone());
        Self {
            hub,
            boards,
            presence,
            renderer,
            auth,
            config: Arc::new(config),
        }
    }
}
