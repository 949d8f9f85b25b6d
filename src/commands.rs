//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use conduit_bus::{identities_for, DeliverableExchange, JetStreamBus, MessageBus, StreamRegistry};
use conduit_core::ConductorConfig;
use conduit_orchestrator::Conductor;

use crate::cli::Commands;

/// Route a parsed command to its handler.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config } => cmd_run(load_config(config.config.as_deref())?).await,
        Commands::EnsureStreams { config } => {
            cmd_ensure_streams(load_config(config.config.as_deref())?).await
        }
        Commands::Fetch {
            agent,
            task_type,
            request_id,
            config,
        } => cmd_fetch(load_config(config.config.as_deref())?, &agent, &task_type, &request_id).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<ConductorConfig> {
    let config = ConductorConfig::load(path).with_context(|| match path {
        Some(p) => format!("Failed to load configuration from {}", p.display()),
        None => "Invalid configuration".to_string(),
    })?;
    info!(
        nats = %config.bus.url,
        store = %config.store.url,
        agents = config.workers.agents.len(),
        max_concurrent = config.dispatch.max_concurrent_workers,
        "Configuration loaded"
    );
    Ok(config)
}

async fn cmd_run(config: ConductorConfig) -> Result<()> {
    let conductor = Conductor::bootstrap(config)
        .await
        .context("Bootstrap failed. Check the NATS and SurrealDB settings")?;

    info!("Conduit is running. Press Ctrl+C to stop.");
    let report = conductor.run().await.context("Dispatcher failed")?;

    if report.drained {
        info!(
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Conduit stopped gracefully"
        );
    } else {
        info!(remaining = report.remaining, "Conduit stopped with work still in flight");
    }
    Ok(())
}

async fn connect_bus(config: &ConductorConfig) -> Result<Arc<dyn MessageBus>> {
    let bus = JetStreamBus::connect(&config.bus)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.bus.url))?;
    Ok(Arc::new(bus))
}

async fn cmd_ensure_streams(config: ConductorConfig) -> Result<()> {
    let bus = connect_bus(&config).await?;
    let registry = StreamRegistry::new(Arc::clone(&bus), config.retention.clone());
    let identities = identities_for(config.workers.agent_ids())?;

    let provisioned = registry.ensure_all(&identities).await?;
    for (identity, provision) in &provisioned {
        println!("{:<32} {:<24} {provision:?}", identity.stream_name(), identity.subject_pattern());
    }

    bus.close().await?;
    Ok(())
}

async fn cmd_fetch(config: ConductorConfig, agent: &str, task_type: &str, request_id: &str) -> Result<()> {
    let bus = connect_bus(&config).await?;
    let max_message_size = usize::try_from(config.retention.max_message_size).unwrap_or(usize::MAX);
    let exchange = DeliverableExchange::new(Arc::clone(&bus), max_message_size);

    let latest = exchange.fetch_latest(agent, task_type, request_id).await;
    bus.close().await?;

    match latest? {
        Some(deliverable) => {
            println!("{}", serde_json::to_string_pretty(&deliverable)?);
            Ok(())
        }
        None => bail!("No deliverable for {agent}/{task_type}/{request_id}"),
    }
}
