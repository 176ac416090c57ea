//! Post-install health gate
//!
//! Provides the verdict the pipeline commits or rolls back on:
//! - CPU usage and load average (sysinfo)
//! - Memory usage statistics
//! - Disk usage of the root filesystem
//! - Hottest temperature sensor, when the platform exposes one
//! - `systemctl is-active` for each configured service
//! - Optional network check (DNS, outbound ping, IPv4 interfaces)
//! - Optional operator script (healthy when it exits 0)

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Components, Disks, System};
use tracing::{debug, info, warn};

use fleetota_core::{HealthReport, NetworkHealth};

use crate::config::{HealthConfig, NetworkCheckConfig};
use crate::execution::CommandRunner;

#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn check(&self) -> HealthReport;
}

/// Limits above which the node is declared unhealthy
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub cpu_max_percent: f32,
    pub memory_max_percent: f32,
    pub disk_max_percent: f32,
    pub load_max: f64,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(cfg: &HealthConfig) -> Self {
        Self {
            cpu_max_percent: cfg.cpu_max_percent,
            memory_max_percent: cfg.memory_max_percent,
            disk_max_percent: cfg.disk_max_percent,
            load_max: cfg.load_max,
        }
    }
}

/// Raw resource readings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_usage: f32,
    pub load_average: f64,
    pub temperature: Option<f32>,
}

impl SystemSample {
    pub async fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        // Wait a moment for accurate CPU readings
        tokio::time::sleep(Duration::from_millis(200)).await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_usage = sys.global_cpu_info().cpu_usage();

        let total = sys.total_memory();
        let memory_usage = if total > 0 {
            (total.saturating_sub(sys.available_memory()) as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        let load_average = if cfg!(unix) { System::load_average().one } else { 0.0 };

        let disks = Disks::new_with_refreshed_list();
        let disk_usage = disks
            .list()
            .iter()
            .filter(|d| d.mount_point() == std::path::Path::new("/"))
            .map(|d| {
                let total = d.total_space();
                if total == 0 {
                    0.0
                } else {
                    (total.saturating_sub(d.available_space()) as f32 / total as f32) * 100.0
                }
            })
            .next()
            .unwrap_or(0.0);

        let components = Components::new_with_refreshed_list();
        let temperature = components
            .list()
            .iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .reduce(f32::max);

        SystemSample { cpu_usage, memory_usage, disk_usage, load_average, temperature }
    }
}

/// Builds the report from already collected readings
pub fn evaluate(
    sample: &SystemSample,
    thresholds: &HealthThresholds,
    services: BTreeMap<String, bool>,
    network: Option<NetworkHealth>,
    script: Option<Result<(), String>>,
) -> HealthReport {
    let mut failures = Vec::new();

    if sample.cpu_usage >= thresholds.cpu_max_percent {
        failures.push(format!("cpu usage {:.1}% >= {:.1}%", sample.cpu_usage, thresholds.cpu_max_percent));
    }
    if sample.memory_usage >= thresholds.memory_max_percent {
        failures.push(format!(
            "memory usage {:.1}% >= {:.1}%",
            sample.memory_usage, thresholds.memory_max_percent
        ));
    }
    if sample.disk_usage >= thresholds.disk_max_percent {
        failures.push(format!("disk usage {:.1}% >= {:.1}%", sample.disk_usage, thresholds.disk_max_percent));
    }
    if sample.load_average >= thresholds.load_max {
        failures.push(format!("load average {:.2} >= {:.2}", sample.load_average, thresholds.load_max));
    }
    for (name, active) in &services {
        if !active {
            failures.push(format!("service {name} is not active"));
        }
    }
    if let Some(net) = &network {
        if !net.dns_resolution {
            failures.push("dns resolution failed".to_string());
        }
        if !net.internet_connectivity {
            failures.push("no internet connectivity".to_string());
        }
        if net.active_interfaces == 0 {
            failures.push("no active network interface".to_string());
        }
    }
    if let Some(Err(reason)) = script {
        failures.push(format!("health script failed: {reason}"));
    }

    HealthReport {
        healthy: failures.is_empty(),
        cpu_usage: sample.cpu_usage,
        memory_usage: sample.memory_usage,
        disk_usage: sample.disk_usage,
        load_average: sample.load_average,
        temperature: sample.temperature,
        services,
        network,
        failures,
    }
}

/// `systemctl is-active` for each unit, also served on `/agent/services`
pub async fn check_services(runner: &dyn CommandRunner, services: &[String]) -> BTreeMap<String, bool> {
    let mut status = BTreeMap::new();
    for service in services {
        let args = vec!["is-active".to_string(), service.clone()];
        let active = match runner.run("systemctl", &args).await {
            Ok(out) => out.success && out.stdout.trim() == "active",
            Err(e) => {
                warn!("Service check failed for {}: {}", service, e);
                false
            }
        };
        status.insert(service.clone(), active);
    }
    status
}

/// Name lookup, one ping and a count of IPv4 interfaces
pub async fn check_network(runner: &dyn CommandRunner, cfg: &NetworkCheckConfig) -> NetworkHealth {
    let dns_resolution = match tokio::time::timeout(
        Duration::from_secs(5),
        tokio::net::lookup_host((cfg.dns_host.as_str(), 0)),
    )
    .await
    {
        Ok(Ok(mut addrs)) => addrs.next().is_some(),
        Ok(Err(e)) => {
            debug!("DNS lookup of {} failed: {}", cfg.dns_host, e);
            false
        }
        Err(_) => {
            debug!("DNS lookup of {} timed out", cfg.dns_host);
            false
        }
    };

    let args: Vec<String> = ["-c", "1", "-W", "5", cfg.ping_host.as_str()].iter().map(|a| a.to_string()).collect();
    let internet_connectivity = match runner.run("ping", &args).await {
        Ok(out) => out.success,
        Err(e) => {
            debug!("ping {} failed: {}", cfg.ping_host, e);
            false
        }
    };

    NetworkHealth { dns_resolution, internet_connectivity, active_interfaces: active_ipv4_interfaces() }
}

fn active_ipv4_interfaces() -> usize {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs.iter().filter(|i| !i.is_loopback() && i.ip().is_ipv4()).count(),
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            0
        }
    }
}

/// Host health checker used by the pipeline, `/health` and heartbeats
pub struct HealthChecker {
    runner: Arc<dyn CommandRunner>,
    services: Vec<String>,
    network: NetworkCheckConfig,
    script: Option<String>,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(runner: Arc<dyn CommandRunner>, cfg: &HealthConfig) -> Self {
        Self {
            runner,
            services: cfg.services.clone(),
            network: cfg.network.clone(),
            script: cfg.script.clone(),
            thresholds: HealthThresholds::from(cfg),
        }
    }

    async fn run_script(&self) -> Option<Result<(), String>> {
        let script = self.script.as_deref()?;
        let mut words = match shell_words::split(script) {
            Ok(words) if !words.is_empty() => words,
            Ok(_) => return Some(Err("empty health script".to_string())),
            Err(e) => return Some(Err(format!("cannot parse '{script}': {e}"))),
        };
        let program = words.remove(0);

        Some(match self.runner.run(&program, &words).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(out.failure_reason()),
            Err(e) => Err(e.to_string()),
        })
    }

    pub async fn check_with(&self, sample: SystemSample) -> HealthReport {
        let services = check_services(self.runner.as_ref(), &self.services).await;
        let network = if self.network.enabled {
            Some(check_network(self.runner.as_ref(), &self.network).await)
        } else {
            None
        };
        let script = self.run_script().await;
        let report = evaluate(&sample, &self.thresholds, services, network, script);

        if report.healthy {
            debug!("Health check passed");
        } else {
            info!("Health check failed: {}", report.summary());
        }
        report
    }
}

#[async_trait]
impl HealthGate for HealthChecker {
    async fn check(&self) -> HealthReport {
        let sample = SystemSample::collect().await;
        self.check_with(sample).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::RecordingRunner;

    fn thresholds() -> HealthThresholds {
        HealthThresholds::from(&HealthConfig::default())
    }

    fn calm() -> SystemSample {
        SystemSample { cpu_usage: 12.0, memory_usage: 40.0, disk_usage: 55.0, load_average: 0.5, temperature: None }
    }

    #[test]
    fn test_evaluate_thresholds() {
        let report = evaluate(&calm(), &thresholds(), BTreeMap::new(), None, None);
        assert!(report.healthy);
        assert!(report.failures.is_empty());

        let hot = SystemSample { cpu_usage: 95.0, load_average: 6.0, ..calm() };
        let report = evaluate(&hot, &thresholds(), BTreeMap::new(), None, None);
        assert!(!report.healthy);
        assert_eq!(report.failures.len(), 2);
        assert!(report.summary().contains("cpu usage"));
    }

    #[test]
    fn test_evaluate_services_and_script() {
        let mut services = BTreeMap::new();
        services.insert("ssh".to_string(), true);
        services.insert("app".to_string(), false);
        let report = evaluate(&calm(), &thresholds(), services, None, Some(Err("exit code 2".into())));
        assert!(!report.healthy);
        assert_eq!(report.failures, vec!["service app is not active", "health script failed: exit code 2"]);
    }

    #[tokio::test]
    async fn test_checker_queries_systemctl_and_script() {
        let runner = Arc::new(
            RecordingRunner::new()
                .with_stdout("systemctl is-active ssh", "active\n")
                .failing_on("systemctl is-active app")
                .failing_on("/opt/check.sh"),
        );
        let cfg = HealthConfig {
            services: vec!["ssh".into(), "app".into()],
            script: Some("/opt/check.sh --quick".into()),
            ..HealthConfig::default()
        };
        let checker = HealthChecker::new(runner.clone(), &cfg);

        let report = checker.check_with(calm()).await;
        assert!(!report.healthy);
        assert_eq!(report.services.get("ssh"), Some(&true));
        assert_eq!(report.services.get("app"), Some(&false));
        assert_eq!(
            runner.calls(),
            vec!["systemctl is-active ssh", "systemctl is-active app", "/opt/check.sh --quick"]
        );
    }

    #[test]
    fn test_evaluate_network() {
        let net = NetworkHealth { dns_resolution: true, internet_connectivity: false, active_interfaces: 0 };
        let report = evaluate(&calm(), &thresholds(), BTreeMap::new(), Some(net.clone()), None);
        assert!(!report.healthy);
        assert_eq!(report.failures, vec!["no internet connectivity", "no active network interface"]);
        assert_eq!(report.network, Some(net));

        let ok = NetworkHealth { dns_resolution: true, internet_connectivity: true, active_interfaces: 1 };
        assert!(evaluate(&calm(), &thresholds(), BTreeMap::new(), Some(ok), None).healthy);
    }

    #[tokio::test]
    async fn test_network_check_pings_configured_host() {
        let cfg = NetworkCheckConfig { enabled: true, dns_host: "localhost".into(), ping_host: "192.0.2.1".into() };

        let runner = RecordingRunner::new();
        let net = check_network(&runner, &cfg).await;
        assert!(net.dns_resolution);
        assert!(net.internet_connectivity);
        assert_eq!(runner.calls(), vec!["ping -c 1 -W 5 192.0.2.1"]);

        let unreachable = RecordingRunner::new().failing_on("ping");
        assert!(!check_network(&unreachable, &cfg).await.internet_connectivity);
    }

    #[tokio::test]
    async fn test_network_check_only_when_enabled() {
        let runner = Arc::new(RecordingRunner::new().failing_on("ping"));
        let checker = HealthChecker::new(runner.clone(), &HealthConfig::default());
        let report = checker.check_with(calm()).await;
        assert!(report.network.is_none());
        assert!(runner.calls().is_empty());

        let mut cfg = HealthConfig::default();
        cfg.network = NetworkCheckConfig { enabled: true, dns_host: "localhost".into(), ping_host: "192.0.2.1".into() };
        let checker = HealthChecker::new(runner, &cfg);
        let report = checker.check_with(calm()).await;
        assert!(!report.healthy);
        assert!(report.failures.contains(&"no internet connectivity".to_string()));
    }
}
