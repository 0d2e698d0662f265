mod badges;
mod config;
mod conversation;
mod gateway;
mod http;
mod identity;
mod lifecycle;
mod membership;
#[cfg(feature = "metrics")]
mod metrics;
mod pipeline;
mod session;
mod socket;
mod store;
mod telemetry;
mod transport;

use std::{future::Future, net::SocketAddr, sync::Arc};

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use homeward_core::Role;
use homeward_storage::{connect, migrate};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CliOverrides, LogFormat, ServerConfig},
    gateway::Gateway,
    http::{AppState, Database},
    session::{SessionSigner, SessionVerifier},
    socket::SocketService,
    store::{GatewayStore, InMemoryStore, PostgresStore},
};

#[derive(Parser, Debug, Default)]
#[command(
    name = "homeward-server",
    version,
    about = "Homeward realtime messaging and presence gateway"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    /// Seed a demo agent, client, timeline and property into the in-memory store.
    #[arg(long)]
    seed_demo: bool,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    session_signing_key: Option<String>,
    #[arg(long = "session-fallback-verifying-key", action = ArgAction::Append)]
    session_fallback_verifying_key: Vec<String>,
    #[arg(long)]
    gateway_ready_delay_ms: Option<u64>,
    #[arg(long)]
    gateway_membership_ttl_secs: Option<u64>,
    #[arg(long)]
    gateway_permit_unverified_access: Option<bool>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        let fallback_keys = if self.session_fallback_verifying_key.is_empty() {
            None
        } else {
            Some(self.session_fallback_verifying_key)
        };
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            database_url: self.database_url,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            session_signing_key: self.session_signing_key,
            session_fallback_verifying_keys: fallback_keys,
            ready_delay_ms: self.gateway_ready_delay_ms,
            membership_ttl_secs: self.gateway_membership_ttl_secs,
            permit_unverified_access: self.gateway_permit_unverified_access,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Mint an agent session token with the configured signing key.
    IssueToken(IssueTokenCommand),
    /// Apply database migrations to the configured database.
    Migrate,
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    /// Agent id carried as the token subject.
    #[arg(long)]
    subject: Uuid,
    /// Token lifetime; defaults to session.token_ttl_secs.
    #[arg(long)]
    ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&cli.config.into_overrides())?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    run(Arc::new(config), cli.seed_demo, shutdown_signal()).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::IssueToken(cmd) => {
            let token = issue_token(config, &cmd)?;
            println!("{token}");
            Ok(())
        }
        CliCommand::Migrate => migrate_database(config).await,
    }
}

fn issue_token(config: &ServerConfig, cmd: &IssueTokenCommand) -> Result<String> {
    let mut session = config.session.clone();
    if session.signing_key.is_none() {
        bail!("session.signing_key must be configured to issue tokens the server will accept");
    }
    if let Some(ttl) = cmd.ttl_secs {
        if ttl == 0 {
            bail!("--ttl-secs must be non-zero");
        }
        session.token_ttl_secs = ttl;
    }
    let signer = SessionSigner::from_config(&session)?;
    signer.issue(&cmd.subject.to_string(), Role::Agent)
}

async fn migrate_database(config: &ServerConfig) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to run migrations"))?;

    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    println!("Database migrations applied");
    Ok(())
}

/// Serve the gateway until `shutdown` resolves.
async fn run<F>(config: Arc<ServerConfig>, seed_demo: bool, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    telemetry::init(config.log_format());
    log_configuration(&config);

    let database = open_database(&config).await;
    let signer = SessionSigner::from_config(&config.session)?;
    info!(
        verifying_key = %signer.verifying_key_base64(),
        ephemeral = config.session.signing_key.is_none(),
        fallback_keys = config.session.fallback_verifying_keys.len(),
        "session keys loaded"
    );
    let verifier = SessionVerifier::from_config(&signer, &config.session)?;

    let store: Arc<dyn GatewayStore> = match database.pool() {
        Some(pool) => {
            if seed_demo {
                warn!("--seed-demo ignored because a database is configured");
            }
            Arc::new(PostgresStore::new(pool))
        }
        None => {
            info!("gateway running on the in-memory store");
            let memory = Arc::new(InMemoryStore::new());
            if seed_demo {
                seed_demo_directory(&memory, &signer).await?;
            }
            memory
        }
    };

    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        store,
        Arc::new(verifier),
    ));
    let sweepers = gateway.spawn_sweepers();

    #[cfg(feature = "metrics")]
    let state = {
        let metrics = config
            .metrics
            .enabled
            .then(MetricsContext::init)
            .transpose()?;
        let sockets = Arc::new(SocketService::new(gateway).with_metrics(metrics.clone()));
        let state = AppState::new(config.clone(), database, sockets).with_metrics(metrics);
        spawn_metrics_listener(&config, state.clone())?;
        state
    };
    #[cfg(not(feature = "metrics"))]
    let state = AppState::new(config.clone(), database, Arc::new(SocketService::new(gateway)));

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    let served = axum::serve(listener, http::router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await;
    sweepers.abort();
    info!("gateway stopped");
    served?;
    Ok(())
}

fn log_configuration(config: &ServerConfig) {
    let env_override_keys = ServerConfig::environment_override_keys();
    if !env_override_keys.is_empty() {
        info!(keys = ?env_override_keys, "applied HOMEWARD_SERVER environment overrides");
    }
    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = config.log_format().as_str(),
        metrics_enabled = config.metrics.enabled,
        database_url_configured = config.database_url.is_some(),
        ready_delay_ms = config.gateway.ready_delay_ms,
        membership_ttl_secs = config.gateway.membership_ttl_secs,
        max_connections = config.gateway.max_connections,
        permit_unverified_access = config.gateway.permit_unverified_access,
        "resolved server configuration"
    );
}

async fn open_database(config: &ServerConfig) -> Database {
    let Some(url) = config.database_url.as_deref() else {
        return Database::InMemory;
    };
    match connect(url).await {
        Ok(pool) => {
            info!("database connection established");
            Database::Connected(pool)
        }
        Err(err) => {
            error!(?err, "failed to establish database connection");
            Database::Failed(err.to_string())
        }
    }
}

#[cfg(feature = "metrics")]
fn spawn_metrics_listener(config: &ServerConfig, state: AppState) -> Result<()> {
    let Some(bind_addr) = config.metrics.bind_addr.as_deref().filter(|_| config.metrics.enabled)
    else {
        return Ok(());
    };
    let addr: SocketAddr = bind_addr
        .parse()
        .context("failed to parse metrics bind addr")?;
    tokio::spawn(async move {
        if let Err(err) = http::serve_metrics(addr, state).await {
            error!(?err, "metrics server terminated unexpectedly");
        }
    });
    Ok(())
}

/// Populate the in-memory directory with one linked agent, client, timeline
/// and property, returning the property id.
async fn seed_demo_directory(store: &InMemoryStore, signer: &SessionSigner) -> Result<Uuid> {
    let agent = store.insert_agent(true).await;
    let client = store.insert_client(Some(agent)).await;
    let timeline = store.insert_timeline(Some(agent), Some(client)).await;
    let property = store.insert_property(Some(timeline)).await;
    let agent_token = signer.issue(&agent.to_string(), Role::Agent)?;

    info!(
        agent_id = %agent,
        client_id = %client,
        timeline_id = %timeline,
        property_id = %property,
        %agent_token,
        "seeded demo directory"
    );
    Ok(property)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(?err, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}
