//! Thin REST + WebSocket surface over the orchestrator and registry.

pub mod handlers;
pub mod jobs;
pub mod server;

use std::sync::Arc;

use crate::bus::LiveBus;
use crate::config::Config;
use crate::database::Database;
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::vault::CredentialVault;
use self::jobs::JobRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub orchestrator: Arc<Orchestrator>,
    pub notifier: Arc<Notifier>,
    pub bus: Arc<LiveBus>,
    pub jobs: Arc<JobRegistry>,
    pub vault: Arc<CredentialVault>,
}

pub use self::server::start_web_server;
