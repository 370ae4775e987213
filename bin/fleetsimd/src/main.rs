//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "binary"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Binary entrypoint for the fleet simulator."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleetsim_common::config::AppConfig;
use fleetsim_common::logging::{init_tracing, LogFormat};
use fleetsim_core::{FleetOrchestrator, FleetReport};
use fleetsim_metrics::{new_registry, spawn_http_server, FleetMetrics};
use fleetsim_net::{GrpcLink, IngestBehaviour, LoopbackIngest, LoopbackServerBuilder};
use fleetsim_schemas::BookingStatus;
use tokio::signal;
use tracing::{info, warn};

mod console;

use console::ConsoleObserver;

const SERVICE_NAME: &str = "fleetsimd";
const DEFAULT_CONFIG: &str = "configs/fleetsim.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Virtual EV fleet streaming telemetry to an ingestion service",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "N", help = "Number of simulated vehicles")]
    fleet_size: Option<usize>,

    #[arg(long, global = true, value_name = "URI", help = "Ingestion service address")]
    endpoint: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "SECONDS",
        help = "Seconds between telemetry ticks (0 disables the sleep)"
    )]
    interval: Option<f64>,

    #[arg(
        long,
        global = true,
        env = "FLEETSIM_AUTH_TOKEN",
        hide_env_values = true,
        help = "Shared secret sent as x-api-token"
    )]
    token: Option<String>,

    #[arg(long, global = true, help = "Base seed for reproducible vehicles")]
    seed: Option<u64>,

    #[arg(long, global = true, value_name = "FORMAT", help = "pretty or structured-json")]
    log_format: Option<LogFormat>,

    #[arg(long, global = true, help = "Disable ANSI colours in tick lines")]
    no_colour: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Stream telemetry for the configured fleet (default)")]
    Run,
    #[command(about = "Serve a loopback ingestion endpoint for local runs")]
    Loopback {
        #[arg(long, default_value = "127.0.0.1:50051")]
        listen: SocketAddr,
        #[arg(long, value_enum, default_value_t = AckStatus::Unknown)]
        ack_status: AckStatus,
    },
    #[command(about = "Print the effective configuration and exit")]
    PrintConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AckStatus {
    Unknown,
    Pending,
    Confirmed,
    Rejected,
}

impl From<AckStatus> for BookingStatus {
    fn from(value: AckStatus) -> Self {
        match value {
            AckStatus::Unknown => BookingStatus::BookingUnknown,
            AckStatus::Pending => BookingStatus::BookingPending,
            AckStatus::Confirmed => BookingStatus::BookingConfirmed,
            AckStatus::Rejected => BookingStatus::BookingRejected,
        }
    }
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(size) = self.fleet_size {
            config.fleet.size = size;
        }
        if let Some(endpoint) = &self.endpoint {
            config.ingest.endpoint = endpoint.clone();
        }
        if let Some(seconds) = self.interval {
            config.fleet.update_interval = Duration::try_from_secs_f64(seconds)
                .map_err(|err| anyhow!("invalid --interval {seconds}: {err}"))?;
        }
        if let Some(token) = &self.token {
            config.ingest.auth_token = token.clone();
        }
        if let Some(seed) = self.seed {
            config.fleet.seed = Some(seed);
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = AppConfig::load_with_source(cli.config.as_deref(), &[DEFAULT_CONFIG])?;
    let mut config = loaded.config;
    cli.apply_overrides(&mut config)?;

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::PrintConfig = command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(SERVICE_NAME, &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using built-in defaults"),
    }

    let config = Arc::new(config);
    match command {
        Commands::Run => {
            let colour = !cli.no_colour && std::io::stdout().is_terminal();
            run_fleet(config, colour).await
        }
        Commands::Loopback { listen, ack_status } => {
            run_loopback(config, listen, ack_status.into()).await
        }
        Commands::PrintConfig => Ok(()),
    }
}

async fn run_fleet(config: Arc<AppConfig>, colour: bool) -> Result<()> {
    let link = GrpcLink::from_config(&config.ingest).context("invalid ingestion settings")?;

    let registry = new_registry();
    let metrics = FleetMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    info!(
        fleet_size = config.fleet.size,
        endpoint = %config.ingest.endpoint_uri(),
        update_interval_s = config.fleet.update_interval.as_secs_f64(),
        "starting fleet simulator"
    );

    let handle = FleetOrchestrator::new(
        config.fleet.clone(),
        Arc::new(link),
        Arc::new(ConsoleObserver::new(colour)),
    )
    .with_metrics(metrics)
    .start();

    let report = handle.run_until(shutdown_signal()).await;
    log_summary(&report);

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn run_loopback(config: Arc<AppConfig>, listen: SocketAddr, status: BookingStatus) -> Result<()> {
    let ingest = LoopbackIngest::new(IngestBehaviour::default().acknowledge_with(status));
    let server = LoopbackServerBuilder::new(listen, config.ingest.auth_token.clone(), ingest)
        .spawn()
        .await?;
    info!(
        endpoint = %server.endpoint(),
        ack_status = status.as_str_name(),
        "loopback ingest running; waiting for termination signal"
    );

    shutdown_signal().await;
    info!("termination signal received; shutting down");

    for vehicle in server.ingest().vehicles() {
        info!(
            vehicle_id = %vehicle,
            received = server.ingest().received_count(&vehicle),
            "telemetry received"
        );
    }
    server.shutdown().await
}

fn log_summary(report: &FleetReport) {
    for session in &report.sessions {
        if session.outcome.is_failure() {
            warn!(
                vehicle_id = %session.vehicle_id,
                outcome = %session.outcome,
                ticks_sent = session.ticks_sent,
                acknowledgements = session.acknowledgements,
                "session summary"
            );
        } else {
            info!(
                vehicle_id = %session.vehicle_id,
                outcome = %session.outcome,
                ticks_sent = session.ticks_sent,
                acknowledgements = session.acknowledgements,
                "session summary"
            );
        }
    }
    info!(
        sessions = report.sessions.len(),
        failed = report.failures().count(),
        ticks_sent = report.total_ticks(),
        "fleet simulator stopped"
    );
}

async fn shutdown_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
        _ = terminate() => {},
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
