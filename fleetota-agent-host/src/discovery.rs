//! Network discovery and node identification
//!
//! This module handles:
//! - Primary interface selection with priority (Ethernet > WiFi > Other)
//! - Node ID generation from the primary MAC address
//! - Advertised address for the agent HTTP surface
//! - System identification (hostname, OS, architecture, kernel release)

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub primary_mac: String,
    pub primary_ip: String,
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub node_id: String,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub kernel_release: Option<String>,
    pub network: NetworkInfo,
}

impl SystemInfo {
    /// Discover complete system information
    pub async fn discover() -> Result<Self> {
        info!("Starting system discovery...");

        let network = NetworkInfo::discover().context("Failed to discover network information")?;

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let os = std::env::consts::OS.to_string();
        let architecture = normalize_architecture(std::env::consts::ARCH);
        let kernel_release = tokio::fs::read_to_string("/proc/sys/kernel/osrelease")
            .await
            .ok()
            .map(|s| s.trim().to_string());

        let node_id = network.primary_mac.replace(':', "");

        info!("Discovery complete - Node ID: {}, Hostname: {}, Arch: {}", node_id, hostname, architecture);

        Ok(SystemInfo { node_id, hostname, os, architecture, kernel_release, network })
    }
}

impl NetworkInfo {
    pub fn discover() -> Result<Self> {
        debug!("Enumerating network interfaces...");

        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut interfaces: Vec<NetworkInterface> = Vec::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }
            // IPv4 first: the kernel dials `ip:port` without brackets
            let ip = match if_addr.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(_) => continue,
            };

            match mac_address::mac_address_by_name(&if_addr.name) {
                Ok(Some(mac)) => {
                    let interface = NetworkInterface {
                        name: if_addr.name.clone(),
                        mac: mac.to_string().to_lowercase(),
                        ip,
                        interface_type: classify_interface(&if_addr.name),
                    };
                    debug!("Found interface: {} ({})", interface.name, interface.mac);
                    interfaces.push(interface);
                }
                Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
                Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
            }
        }

        let primary = select_primary(&interfaces)?;
        info!("Selected primary interface {} from {} candidates", primary.name, interfaces.len());

        Ok(NetworkInfo {
            primary_mac: primary.mac.clone(),
            primary_ip: primary.ip.clone(),
            interfaces,
        })
    }
}

/// Classify interface type based on name patterns
fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo:") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wlp", "wlo", "wifi"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Wireless;
    }
    if ["eth", "en"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

/// Ethernet first, then WiFi, then whatever is left
fn select_primary(interfaces: &[NetworkInterface]) -> Result<&NetworkInterface> {
    for wanted in [InterfaceType::Ethernet, InterfaceType::Wireless] {
        if let Some(interface) = interfaces.iter().find(|i| i.interface_type == wanted) {
            return Ok(interface);
        }
    }

    match interfaces.first() {
        Some(interface) => {
            warn!("No Ethernet/WiFi found, using first interface: {}", interface.name);
            Ok(interface)
        }
        None => Err(anyhow::anyhow!("No network interfaces found")),
    }
}

/// Debian-style names, the ones package artifacts are labelled with
pub fn normalize_architecture(arch: &str) -> String {
    match arch {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "arm" | "armv7" | "armv7l" => "armhf".to_string(),
        other => other.to_string(),
    }
}
