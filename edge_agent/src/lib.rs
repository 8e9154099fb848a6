//! Edge Agent - Core Library
//!
//! Keeps an edge asset connected to its controller: periodic heartbeats
//! carrying plugin data, remote operations queued and run one at a time
//! through a plugin registry, and results reported back.

pub mod beater;
pub mod cli;
pub mod client;
pub mod config_store;
pub mod dispatcher;
pub mod error;
pub mod join;
pub mod plugin;
pub mod plugins;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod settings;
pub mod shutdown;
pub mod stub;
pub mod telemetry;
pub mod worker;

pub use error::{AgentError, Result};
pub use plugin::{Plugin, PluginDescriptor};
pub use registry::PluginRegistry;
pub use service::{Service, ServiceHandle, ServiceState};
