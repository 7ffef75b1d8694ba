//! Scraping structured data out of runtime CLI output.
//!
//! The runtime only offers free text, so address and snapshot parsing lives
//! here as pure functions over that text.

use crate::process::{CommandRunner, QUICK_TIMEOUT, display_command};
use fleet_proto::{ADDRESS_ERROR, NOT_ASSIGNED};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Addresses of a container's primary interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    pub ipv4: String,
    pub ipv6: String,
}

impl Addresses {
    pub fn unassigned() -> Self {
        Self { ipv4: NOT_ASSIGNED.to_string(), ipv6: NOT_ASSIGNED.to_string() }
    }

    /// Sentinel pair returned when the address query failed.
    pub fn error() -> Self {
        Self { ipv4: ADDRESS_ERROR.to_string(), ipv6: ADDRESS_ERROR.to_string() }
    }

    pub fn is_error(&self) -> bool {
        self.ipv4 == ADDRESS_ERROR && self.ipv6 == ADDRESS_ERROR
    }
}

/// Extract the first IPv4 and first IPv6 address from `ip addr show` output.
///
/// Interfaces can list several scopes (link-local before global); the first
/// match per family wins.
pub fn parse_addresses(output: &str) -> Addresses {
    let mut ipv4: Option<String> = None;
    let mut ipv6: Option<String> = None;

    for line in output.lines() {
        if ipv4.is_none() {
            ipv4 = address_after(line, "inet ");
        }
        if ipv6.is_none() {
            ipv6 = address_after(line, "inet6 ");
        }
        if ipv4.is_some() && ipv6.is_some() {
            break;
        }
    }

    Addresses {
        ipv4: ipv4.unwrap_or_else(|| NOT_ASSIGNED.to_string()),
        ipv6: ipv6.unwrap_or_else(|| NOT_ASSIGNED.to_string()),
    }
}

fn address_after(line: &str, marker: &str) -> Option<String> {
    let (_, rest) = line.split_once(marker)?;
    let token = rest.split_whitespace().next()?;
    let (addr, _prefix) = token.rsplit_once('/')?;
    (!addr.is_empty()).then(|| addr.to_string())
}

/// Query a container's addresses. Never fails: runner errors are logged and
/// reported as the [`Addresses::error`] sentinel pair.
pub async fn get_addresses<R: CommandRunner + ?Sized>(
    runner: &R,
    runtime_bin: &str,
    interface: &str,
    container_id: &str,
) -> Addresses {
    let argv = [runtime_bin, "exec", container_id, "--", "ip", "addr", "show", interface]
        .map(String::from);
    let command = display_command(&argv);

    match runner.run(&command, QUICK_TIMEOUT).await {
        Ok(output) => {
            let addrs = parse_addresses(output.text());
            debug!(container = %container_id, ipv4 = %addrs.ipv4, ipv6 = %addrs.ipv6, "addresses read");
            addrs
        }
        Err(e) => {
            error!(container = %container_id, error = %e, "failed to read container addresses");
            Addresses::error()
        }
    }
}

/// Snapshot names from `info <container>` output.
///
/// Understands both the table layout and the older indented list layout.
pub fn parse_snapshots(info_output: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_section = false;

    for line in info_output.lines() {
        if !in_section {
            in_section = line.trim_start().starts_with("Snapshots:");
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('+') {
            continue;
        }
        if let Some(row) = trimmed.strip_prefix('|') {
            let name = row.split('|').next().unwrap_or_default().trim();
            if !name.is_empty() && name != "NAME" {
                names.push(name.to_string());
            }
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some(name) = trimmed.split_whitespace().next() {
                names.push(name.to_string());
            }
            continue;
        }
        // next top-level section
        break;
    }

    names
}
