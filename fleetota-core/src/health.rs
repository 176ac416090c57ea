//! Post-install health report

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot taken by a node after an install. `healthy` is the verdict, the
/// remaining fields explain it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(default)]
    pub cpu_usage: f32,
    #[serde(default)]
    pub memory_usage: f32,
    #[serde(default)]
    pub disk_usage: f32,
    #[serde(default)]
    pub load_average: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// service name → is-active
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
    /// Present when the node checks its network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkHealth>,
    /// Human readable reasons for an unhealthy verdict
    #[serde(default)]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub dns_resolution: bool,
    pub internet_connectivity: bool,
    /// Non-loopback interfaces holding an IPv4 address
    pub active_interfaces: usize,
}

impl NetworkHealth {
    pub fn healthy(&self) -> bool {
        self.dns_resolution && self.internet_connectivity && self.active_interfaces > 0
    }
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self { healthy: true, ..Default::default() }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self { healthy: false, failures: vec![reason.into()], ..Default::default() }
    }

    /// Failures joined for log lines and outcome messages
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            if self.healthy { "healthy".to_string() } else { "unhealthy".to_string() }
        } else {
            self.failures.join("; ")
        }
    }
}
