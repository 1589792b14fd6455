//! Local network discovery via arp-scan.

use crate::config::ScanConfig;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("arp-scan timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("arp-scan exited with {status}: {stderr}")]
    Command {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// One host discovered on the local segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkClient {
    #[serde(rename = "ipAddress")]
    pub ip_address: IpAddr,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    pub vendor: Option<String>,
}

/// Run one `arp-scan --localnet` pass and return the discovered hosts.
pub async fn discover_clients(config: &ScanConfig) -> Result<Vec<NetworkClient>, ScanError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let fut = Command::new(&config.arp_scan_path)
        .arg("--localnet")
        .output();

    let output = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ScanError::Io {
                command: config.arp_scan_path.clone(),
                source,
            });
        }
        Err(_) => return Err(ScanError::Timeout(timeout)),
    };

    if !output.status.success() {
        return Err(ScanError::Command {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let clients = parse_scan_output(&String::from_utf8_lossy(&output.stdout));
    info!(count = clients.len(), "network scan completed");
    Ok(clients)
}

/// Extract host entries from arp-scan stdout.
///
/// Host lines are tab-separated `ip<TAB>mac<TAB>vendor`; banner and summary
/// lines fail the address parse and are skipped. Duplicate addresses (hosts
/// answering twice) keep the first entry.
fn parse_scan_output(stdout: &str) -> Vec<NetworkClient> {
    let mut clients: Vec<NetworkClient> = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split('\t');
        let Some(ip) = parts.next().and_then(|s| s.trim().parse::<IpAddr>().ok()) else {
            debug!(line, "skipping non-host scan line");
            continue;
        };
        let Some(mac) = parts.next().map(str::trim).filter(|m| !m.is_empty()) else {
            continue;
        };
        if clients.iter().any(|c| c.ip_address == ip) {
            continue;
        }
        let vendor = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);
        clients.push(NetworkClient {
            ip_address: ip,
            mac_address: mac.to_string(),
            vendor,
        });
    }
    clients
}
