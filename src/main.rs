use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pantry_pipeline::broker::connection::redact_url;
use pantry_pipeline::config::{self, PipelineConfig};
use pantry_pipeline::telemetry;
use pantry_pipeline::{BrokerBackend, BrokerClient, Collaborators, ServiceContext, ServiceKind};

#[derive(Parser, Debug)]
#[command(name = "pantry-pipeline", version, about = "Ingredient scan event pipeline")]
struct Cli {
    /// Service to run.
    #[arg(long, env = "PIPELINE_SERVICE", value_enum)]
    service: Option<ServiceKind>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and try one broker connection.
    Check,
    /// Write a default configuration file.
    InitConfig {
        #[arg(default_value = "config/pantry-pipeline.json")]
        path: PathBuf,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lapin=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(Command::InitConfig { path }) = &cli.command {
        config::write_default_config(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        return Ok(());
    }

    let config = PipelineConfig::load().context("Failed to load configuration")?;
    let backend = BrokerBackend::for_kind(config.broker_backend)
        .context("Unsupported broker backend")?;
    let broker = BrokerClient::from_config(&config, &backend);

    match (cli.command, cli.service) {
        (Some(Command::Check), _) => check(&config, &broker).await,
        (_, Some(kind)) => run(kind, &config, broker).await,
        (_, None) => bail!("nothing to do: pass --service <scanner|meal-planning|shopping-list> or a subcommand"),
    }
}

async fn check(config: &PipelineConfig, broker: &BrokerClient) -> Result<()> {
    info!(
        uri = %redact_url(&config.rabbitmq_uri),
        backend = ?config.broker_backend,
        "Configuration is valid"
    );
    let connected = broker.connect().await;
    broker.close().await;
    if !connected {
        bail!("broker at {} is unreachable", redact_url(&config.rabbitmq_uri));
    }
    info!("Successfully connected to the broker");
    Ok(())
}

async fn run(kind: ServiceKind, config: &PipelineConfig, broker: BrokerClient) -> Result<()> {
    if config.metrics_enabled {
        telemetry::install_exporter(&config.metrics_address)
            .context("Failed to start the metrics exporter")?;
    }
    let collaborators = Collaborators::from_config(config)
        .await
        .context("Failed to set up service collaborators")?;
    let context = ServiceContext::new(kind, config, broker, collaborators);

    if let Err(err) = context.start().await {
        error!(service = %kind, "Startup failed: {}", err);
        context.shutdown().await;
        return Err(err).context("Service startup failed");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!(service = %kind, "Shutdown signal received");
    context.shutdown().await;
    Ok(())
}
