//! System metrics reported with every heartbeat.
//!
//! Each beat gathers cpu, mem, disk and net counters. CPU usage is measured
//! between two refreshes, so the first beat after start reports zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use sysinfo::{Disks, Networks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::plugin::{HeartbeatPayload, HeartbeatSource, Plugin, PluginConfig, PluginDescriptor};
use crate::protocol::PluginData;

pub const NAME: &str = "metrics";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, "System metrics collection plugin", new_metrics)
}

fn new_metrics(_config: &PluginConfig) -> Result<Arc<dyn Plugin>> {
    let mut system = System::new();
    system.refresh_cpu();
    Ok(Arc::new(Metrics {
        system: Arc::new(Mutex::new(system)),
    }))
}

struct Metrics {
    system: Arc<Mutex<System>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metric {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, u64>,
}

impl Metric {
    /// `None` when there are no fields to report.
    fn new(name: &str, tags: Vec<(&str, String)>, fields: Vec<(&str, u64)>) -> Option<Self> {
        let fields: BTreeMap<String, u64> = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            tags: tags.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            fields,
        })
    }
}

#[derive(Debug)]
pub struct MetricsData {
    pub timestamp: i64,
    pub metrics: Vec<Metric>,
}

impl HeartbeatPayload for MetricsData {
    fn to_wire(&self) -> PluginData {
        PluginData {
            plugin: NAME.to_string(),
            data: json!({
                "timestamp": self.timestamp,
                "metrics": self.metrics,
            }),
        }
    }
}

/// Round a gauge to a whole number; negative or non-finite values are skipped.
fn to_counter(value: f32) -> Option<u64> {
    if value.is_finite() && value >= 0.0 {
        Some(value.round() as u64)
    } else {
        None
    }
}

fn gather(system: &mut System) -> Vec<Metric> {
    system.refresh_cpu();
    system.refresh_memory();

    let mut metrics = Vec::new();

    for cpu in system.cpus() {
        let usage = match to_counter(cpu.cpu_usage()) {
            Some(usage) => usage,
            None => {
                warn!(cpu = cpu.name(), value = cpu.cpu_usage(), "cpu usage out of bounds");
                continue;
            }
        };
        metrics.extend(Metric::new(
            "cpu",
            vec![("cpu", cpu.name().to_string())],
            vec![("usage_percent", usage)],
        ));
    }

    metrics.extend(Metric::new("mem", vec![], vec![("used", system.used_memory())]));

    let disks = Disks::new_with_refreshed_list();
    for disk in disks.list() {
        let used = disk.total_space().saturating_sub(disk.available_space());
        metrics.extend(Metric::new(
            "disk",
            vec![("path", disk.mount_point().display().to_string())],
            vec![("used", used)],
        ));
    }

    let networks = Networks::new_with_refreshed_list();
    for (interface, data) in networks.iter() {
        metrics.extend(Metric::new(
            "net",
            vec![("interface", interface.clone())],
            vec![
                ("bytes_recv", data.total_received()),
                ("bytes_sent", data.total_transmitted()),
                ("packets_recv", data.total_packets_received()),
                ("packets_sent", data.total_packets_transmitted()),
            ],
        ));
    }

    metrics
}

#[async_trait]
impl Plugin for Metrics {
    fn heartbeat(&self) -> Option<&dyn HeartbeatSource> {
        Some(self)
    }
}

#[async_trait]
impl HeartbeatSource for Metrics {
    async fn beat(&self, cancel: CancellationToken) -> Result<Option<Box<dyn HeartbeatPayload>>> {
        let system = self.system.clone();
        // Blocking reads of system files.
        let gathering = tokio::task::spawn_blocking(move || gather(&mut system.lock()));

        let metrics = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AgentError::DeadlineExceeded("collecting metrics timed out".to_string()));
            }
            gathered = gathering => gathered
                .map_err(|e| AgentError::Internal(format!("metrics collection failed: {}", e)))?,
        };
        debug!(count = metrics.len(), "gathered metrics");

        Ok(Some(Box::new(MetricsData {
            timestamp: Utc::now().timestamp(),
            metrics,
        })))
    }
}
