//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::settings::DEFAULT_CONFIG_FILE;

/// Edge agent
#[derive(Parser, Debug)]
#[command(name = "edge-agent")]
#[command(about = "Keeps an edge asset connected to its controller and runs remote operations")]
#[command(version)]
pub struct Cli {
    /// Agent configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enroll this agent with a controller and store its credentials
    Join {
        /// Controller address, overriding the configured one
        #[arg(long)]
        address: Option<String>,
        /// One-time join token issued by the controller
        #[arg(long)]
        token: String,
        /// Extra asset label as key=value, repeatable
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Run the agent until signalled or uninstalled
    Run,
    /// List available plugins
    Plugins,
    /// Serve an in-memory controller for local testing
    Stub {
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1:5588")]
        addr: SocketAddr,
        /// Asset id the stub hands out operations for
        #[arg(long, default_value = "test-asset")]
        asset_id: String,
    },
}
