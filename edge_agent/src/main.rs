//! Main entry point for the edge agent.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use edge_agent::{
    cli::{self, Commands},
    client::HttpAgentClient,
    config_store::ConfigStore,
    join::{self, Joiner},
    plugin::PluginConfig,
    plugins,
    registry::PluginRegistry,
    server,
    service::{Service, ServiceHandle, ServiceState},
    settings::Settings,
    shutdown,
    stub::StubController,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load(&args.config)?;
    telemetry::init(&settings.logging)?;

    match args.command {
        Commands::Join { address, token, labels } => {
            join_controller(&args.config, settings, address, token, labels).await
        }
        Commands::Run => run(&args.config, settings).await,
        Commands::Plugins => list_plugins(),
        Commands::Stub { addr, asset_id } => stub(addr, asset_id).await,
    }
}

async fn join_controller(
    config_path: &Path,
    settings: Settings,
    address: Option<String>,
    token: String,
    labels: Vec<String>,
) -> Result<()> {
    let labels = labels
        .iter()
        .map(|label| join::parse_label(label))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(anyhow::Error::msg)?;
    let address = address.unwrap_or_else(|| settings.controller.address.clone());
    let joiner = Joiner::new(ConfigStore::open(config_path)?, address.clone(), token.clone()).with_labels(labels);
    joiner.validate()?;

    let client = HttpAgentClient::new(&address, &token, settings.controller.timeout())?;
    let joined = joiner.run(&client).await?;
    println!("joined as asset {}", joined.asset_id);
    Ok(())
}

async fn run(config_path: &Path, settings: Settings) -> Result<()> {
    let registry = PluginRegistry::global();
    plugins::register_builtin(&registry)?;

    let config = ConfigStore::open(config_path)?;
    let client = Arc::new(HttpAgentClient::new(
        &settings.controller.address,
        &settings.agent.token,
        settings.controller.timeout(),
    )?);

    let service = Service::new(settings, client, registry.clone(), config.clone());
    let handle = service.handle();

    registry.register(plugins::core::descriptor(handle.clone(), config))?;
    registry
        .start_plugin(plugins::core::NAME, &PluginConfig::new())
        .await?;

    let signalled = shutdown::install_shutdown_handler()?;
    let on_signal = handle.clone();
    tokio::spawn(async move {
        signalled.cancelled().await;
        on_signal.stop();
    });

    tokio::spawn(watchdog(handle));

    service.run().await?;
    Ok(())
}

/// Log whenever a running agent has missed its heartbeats.
async fn watchdog(handle: ServiceHandle) {
    let mut ticker = tokio::time::interval(handle.interval().max(Duration::from_secs(1)));
    // The first tick fires immediately, before any beat could have happened.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match handle.state() {
            ServiceState::Stopped => break,
            ServiceState::Running if !handle.alive() => {
                warn!("agent not alive: no successful heartbeat within two intervals");
            }
            _ => {}
        }
    }
}

fn list_plugins() -> Result<()> {
    let registry = PluginRegistry::new();
    plugins::register_builtin(&registry)?;

    for (name, entry) in registry.list_plugins() {
        println!("{:<12} {}", name, entry.descriptor.description);
        for command in entry.descriptor.commands.values() {
            println!("  {:<10} {}", command.name, command.description);
            for param in command.params.values() {
                let default = param
                    .default
                    .as_deref()
                    .map(|d| format!(" (default {})", d))
                    .unwrap_or_default();
                let required = if param.required { " [required]" } else { "" };
                println!("    {}{}{}: {}", param.name, required, default, param.description);
            }
        }
    }
    println!("{:<12} {}", plugins::core::NAME, plugins::core::DESCRIPTION);
    Ok(())
}

async fn stub(addr: SocketAddr, asset_id: String) -> Result<()> {
    let controller = Arc::new(StubController::new(asset_id));
    let signalled = shutdown::install_shutdown_handler()?;
    info!(asset_id = %controller.asset_id(), "starting controller stub");
    server::serve(addr, controller, signalled).await
}
