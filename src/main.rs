//! cuo - Compose Upgrade Orchestrator.
//!
//! Performs staged major-version upgrades for docker-compose services:
//! published versions are listed from the image registry, an upgrade path is
//! planned one major boundary at a time, and each step rewrites the compose
//! file, recreates the container, waits for readiness, and runs the service's
//! maintenance commands.

mod compose;
mod config;
mod error;
mod executor;
mod inspect;
mod orchestrator;
mod planner;
mod registry;
mod runtime;
mod session;
mod version;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use compose::Descriptor;
use config::Config;
use orchestrator::{SessionBoard, UpgradeOrchestrator};
use registry::{DockerHub, VersionSource};
use runtime::DockerCompose;
use session::{ServiceDescriptor, SessionStatus, UpgradeSession};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cuo", version, about = "Staged major-version upgrades for docker-compose services")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "cuo.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List published versions for a configured service.
    Versions {
        /// Compose service name.
        service: String,
    },
    /// Show the staged upgrade path without executing it.
    Plan {
        /// Compose service name.
        service: String,

        /// Target version; defaults to the highest published version.
        #[arg(short, long)]
        target: Option<Version>,
    },
    /// Execute staged upgrades, one session per service.
    Upgrade {
        /// Services to upgrade; all configured services when omitted.
        services: Vec<String>,

        /// Target version; requires exactly one service.
        #[arg(short, long)]
        target: Option<Version>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    info!("Starting cuo v{VERSION}");

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Versions { service } => run_versions(&config, &service).await,
        Command::Plan { service, target } => run_plan(&config, &service, target.as_ref()).await,
        Command::Upgrade { services, target } => {
            run_upgrade(&config, &services, target).await
        }
    }
}

/// List published versions for one service, oldest first.
async fn run_versions(config: &Config, service: &str) -> Result<()> {
    let service_config = config.service(service)?;
    let source = VersionSource::new(DockerHub::new(&config.registry)?, config.registry.clone());

    let versions = source.list_versions(service_config).await?;
    if versions.is_empty() {
        println!("No published versions found for {}", service_config.repository);
        return Ok(());
    }

    for v in &versions {
        println!("{v}");
    }
    println!("{} versions ({} latest)", versions.len(), versions[versions.len() - 1]);
    Ok(())
}

/// Plan and print the upgrade path without executing it.
async fn run_plan(config: &Config, service: &str, target: Option<&Version>) -> Result<()> {
    let service_config = config.service(service)?;
    let descriptor = Descriptor::read(&config.compose_file)?;
    let service_descriptor = ServiceDescriptor::from_config(service, service_config, &descriptor)?;

    let control = DockerCompose::new(&config.compose_file);
    let current = inspect::current_version(&control, &service_descriptor).await?;

    let source = VersionSource::new(DockerHub::new(&config.registry)?, config.registry.clone());
    let available = source.list_versions(service_config).await?;

    let path = planner::plan(&service_descriptor, &current, &available, target)?;

    println!("Service: {service} (current: {current})");
    if path.is_empty() {
        println!("Already at target version. Nothing to upgrade.");
        return Ok(());
    }

    for step in path.steps() {
        println!(
            "  [{}/{}] {} -> {}",
            step.ordinal,
            path.len(),
            step.from_version,
            step.to_version
        );
    }
    if let Some(final_version) = path.final_version() {
        println!("{} steps to {final_version}", path.len());
    }
    Ok(())
}

/// Execute staged upgrades as one session per service, concurrently where
/// dependencies allow.
async fn run_upgrade(config: &Config, services: &[String], target: Option<Version>) -> Result<()> {
    let names: Vec<String> = if services.is_empty() {
        config.services.keys().cloned().collect()
    } else {
        services.to_vec()
    };

    if target.is_some() && names.len() != 1 {
        anyhow::bail!("--target requires exactly one service");
    }

    let descriptor = Descriptor::read(&config.compose_file)?;
    let control = DockerCompose::new(&config.compose_file);
    let source = VersionSource::new(DockerHub::new(&config.registry)?, config.registry.clone());

    // Plan every session up front so an unplannable service fails the whole
    // run before any container is touched.
    let mut sessions = Vec::with_capacity(names.len());
    let mut board = SessionBoard::default();
    for name in &names {
        let service_config = config.service(name)?;
        let service_descriptor = ServiceDescriptor::from_config(name, service_config, &descriptor)?;

        let current = inspect::current_version(&control, &service_descriptor).await?;
        let available = source.list_versions(service_config).await?;
        let path = planner::plan(&service_descriptor, &current, &available, target.as_ref())?;

        info!(
            service = name.as_str(),
            current = %current,
            steps = path.len(),
            "Planned upgrade session"
        );
        board.register(name);
        sessions.push(UpgradeSession::new(service_descriptor, path));
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, aborting between steps");
            signal_cancel.cancel();
        }
    });

    let orchestrator = UpgradeOrchestrator::new(
        &control,
        &config.execution,
        &config.compose_file,
        cancel,
    );

    let board = &board;
    let orchestrator = &orchestrator;
    let sessions = futures::future::join_all(
        sessions
            .into_iter()
            .map(|session| orchestrator.run(session, board)),
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&sessions)?);

    if sessions.iter().any(|s| s.status != SessionStatus::Completed) {
        anyhow::bail!("one or more upgrade sessions did not complete");
    }
    Ok(())
}
