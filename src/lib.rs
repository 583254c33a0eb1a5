pub mod bus;
pub mod config;
pub mod constants;
pub mod database;
pub mod errors;
pub mod managers;
pub mod notify;
pub mod orchestrator;
pub mod sanitize;
pub mod scheduler;
pub mod ssh;
pub mod vault;
pub mod web;

// Re-export commonly used types
pub use bus::{BusMessage, LiveBus};
pub use config::Config;
pub use database::Database;
pub use errors::{CoreError, CoreResult};
pub use notify::Notifier;
pub use orchestrator::Orchestrator;
pub use scheduler::Scheduler;
pub use ssh::SshManager;
pub use vault::CredentialVault;
