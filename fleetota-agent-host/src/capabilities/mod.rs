//! Update capabilities detection
//!
//! Detects which update types this host can apply, reported in the
//! registration system info:
//! - service: systemd (`systemctl`) and `tar` for service trees
//! - driver: kernel module tools (`modprobe`, `depmod`, `rmmod`)
//! - package: Debian package tools (`dpkg`, `apt-get`)

use fleetota_core::UpdateType;
use std::collections::HashSet;
use tracing::debug;

const ALL_TYPES: [UpdateType; 3] = [UpdateType::Service, UpdateType::Driver, UpdateType::Package];

/// Tools each update type needs on PATH
fn required_tools(update_type: UpdateType) -> &'static [&'static str] {
    match update_type {
        UpdateType::Service => &["systemctl", "tar"],
        UpdateType::Driver => &["modprobe", "depmod", "rmmod"],
        UpdateType::Package => &["dpkg", "apt-get"],
    }
}

pub struct CapabilityDetector;

impl CapabilityDetector {
    /// Update types whose tools are all available on this host
    pub async fn supported_update_types() -> Vec<UpdateType> {
        let mut found = HashSet::new();
        for update_type in ALL_TYPES {
            for tool in required_tools(update_type) {
                if Self::command_exists(tool).await {
                    found.insert(*tool);
                } else {
                    debug!("{} updates unavailable: {} not found", update_type, tool);
                }
            }
        }
        Self::supported_with(|tool| found.contains(tool))
    }

    pub fn supported_with(exists: impl Fn(&str) -> bool) -> Vec<UpdateType> {
        ALL_TYPES
            .into_iter()
            .filter(|t| required_tools(*t).iter().all(|tool| exists(tool)))
            .collect()
    }

    /// Check if a command exists in PATH
    async fn command_exists(command: &str) -> bool {
        match tokio::process::Command::new("which").arg(command).output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

/// Names of the kernel modules currently loaded, reported as the node's drivers
pub async fn loaded_modules() -> Vec<String> {
    match tokio::fs::read_to_string("/proc/modules").await {
        Ok(content) => parse_modules(&content),
        Err(_) => Vec::new(),
    }
}

fn parse_modules(content: &str) -> Vec<String> {
    let mut modules: Vec<String> = content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect();
    modules.sort();
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_with_lookup() {
        let all = CapabilityDetector::supported_with(|_| true);
        assert_eq!(all, vec![UpdateType::Service, UpdateType::Driver, UpdateType::Package]);

        let no_dpkg = CapabilityDetector::supported_with(|tool| tool != "dpkg");
        assert_eq!(no_dpkg, vec![UpdateType::Service, UpdateType::Driver]);

        assert!(CapabilityDetector::supported_with(|_| false).is_empty());
    }

    #[test]
    fn test_parse_proc_modules() {
        let content = "nf_tables 311296 0 - Live 0x0000000000000000\ncan 24576 1 can_raw, Live 0x0\n";
        assert_eq!(parse_modules(content), vec!["can", "nf_tables"]);
    }
}
