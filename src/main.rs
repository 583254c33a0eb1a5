use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ludash::config::Config;
use ludash::constants::jobs as job_constants;
use ludash::database::Database;
use ludash::notify::Notifier;
use ludash::orchestrator::Orchestrator;
use ludash::scheduler::Scheduler;
use ludash::ssh::SshManager;
use ludash::vault::{CredentialVault, SaltOrigin};
use ludash::web::jobs::JobRegistry;
use ludash::web::{start_web_server, AppState};
use ludash::LiveBus;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with reduced verbosity for the noisy layers
    let env_filter = EnvFilter::from_default_env()
        .add_directive("ludash=info".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("russh=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting update control plane");

    let config = Arc::new(Config::from_env()?);
    info!(
        "Configuration loaded: listen {}:{}, cache horizon {}h, {} SSH slots",
        config.host, config.port, config.cache_horizon_hours, config.max_ssh_sessions
    );

    // Vault before database: the salt file lives next to the database and
    // its freshness decides whether legacy ciphertexts need migration.
    let (vault, salt_origin) =
        CredentialVault::open(&config.encryption_key, &config.database_path)?;
    let vault = Arc::new(vault);

    let database = Arc::new(Database::new(&config.database_path).await?);

    if salt_origin == SaltOrigin::Created && database.has_encrypted_data().await? {
        info!("New vault salt with existing ciphertexts; migrating from legacy salt");
        let legacy = CredentialVault::legacy(&config.encryption_key);
        match database.reencrypt_all(&legacy, &vault).await {
            Ok(count) => info!("Vault migration complete ({count} secrets)"),
            Err(e) => {
                warn!("Vault migration failed: {e:#}");
                warn!("Stored credentials may need to be re-entered");
            }
        }
    }

    let ssh = Arc::new(SshManager::new(
        config.max_ssh_sessions,
        Duration::from_secs(config.ssh_ready_timeout_seconds),
        vault.clone(),
    ));
    info!("SSH connection manager initialized");

    let bus = Arc::new(LiveBus::new());

    let orchestrator = Arc::new(Orchestrator::new(
        database.clone(),
        ssh.clone(),
        vault.clone(),
        bus.clone(),
        Duration::from_secs(config.command_timeout_seconds),
    ));
    info!("Orchestrator initialized");

    let notifier = Arc::new(Notifier::new(database.clone(), vault.clone()));

    let scheduler = Arc::new(Scheduler::new(
        database.clone(),
        orchestrator.clone(),
        notifier.clone(),
        config.cache_horizon_hours,
    ));
    scheduler.start();
    info!("Scheduler started");

    let jobs = Arc::new(JobRegistry::new());

    // Drop finished job records past their retention window.
    let jobs_cleanup = jobs.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            job_constants::CLEANUP_INTERVAL_SECONDS,
        ));
        loop {
            interval.tick().await;
            jobs_cleanup.cleanup_expired();
        }
    });

    let state = AppState {
        config,
        database,
        orchestrator,
        notifier,
        bus,
        jobs,
        vault,
    };

    start_web_server(state).await?;

    Ok(())
}
