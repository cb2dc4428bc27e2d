//! Neighbor (ARP) table reading
//!
//! The table is read once per pass, after the liveness probe has populated
//! it. A failed read is not fatal: the pass simply records no observed MACs.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, warn};

/// Kernel ARP table exposed by procfs
const PROC_NET_ARP: &str = "/proc/net/arp";

/// ARP table entry
#[derive(Debug, Clone)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub interface: String,
    pub state: ArpState,
}

impl ArpEntry {
    /// Entry carries a usable hardware address
    pub fn is_live(&self) -> bool {
        !matches!(self.state, ArpState::Failed | ArpState::Incomplete)
            && !self.mac.is_empty()
            && self.mac != "00:00:00:00:00:00"
    }
}

/// ARP entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

/// Source of the local neighbor table
pub trait NeighborTable: Send + Sync {
    fn entries(&self) -> Result<Vec<ArpEntry>>;
}

/// Reads `ip neigh show`, falling back to `/proc/net/arp`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNeighborTable;

impl NeighborTable for SystemNeighborTable {
    fn entries(&self) -> Result<Vec<ArpEntry>> {
        match get_arp_table() {
            Ok(entries) => Ok(entries),
            Err(e) => {
                debug!(error = %e, "ip neigh unavailable, reading {}", PROC_NET_ARP);
                let content = std::fs::read_to_string(PROC_NET_ARP)?;
                Ok(parse_proc_net_arp(&content))
            }
        }
    }
}

/// Get current ARP table entries
pub fn get_arp_table() -> Result<Vec<ArpEntry>> {
    // Use `ip neigh` command on Linux
    let output = Command::new("ip")
        .args(["-4", "neigh", "show"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!("Failed to get ARP table: {}", String::from_utf8_lossy(&output.stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let entries: Vec<ArpEntry> = stdout.lines().filter_map(parse_ip_neigh_line).collect();

    debug!("Found {} ARP entries", entries.len());
    Ok(entries)
}

/// Parse a line from `ip neigh show` output
fn parse_ip_neigh_line(line: &str) -> Option<ArpEntry> {
    // Format: "192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() < 4 {
        return None;
    }

    let ip = Ipv4Addr::from_str(parts[0]).ok()?;

    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let lladdr_idx = parts.iter().position(|&p| p == "lladdr");

    if dev_idx + 1 >= parts.len() {
        return None;
    }

    let interface = parts[dev_idx + 1].to_string();

    // MAC might not be present for INCOMPLETE entries
    let mac = lladdr_idx
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    let state = parts.last().map(|s| parse_arp_state(s)).unwrap_or(ArpState::Unknown);

    Some(ArpEntry { ip, mac, interface, state })
}

/// Parse ARP state string
fn parse_arp_state(s: &str) -> ArpState {
    match s.to_uppercase().as_str() {
        "REACHABLE" => ArpState::Reachable,
        "STALE" => ArpState::Stale,
        "DELAY" => ArpState::Delay,
        "PROBE" => ArpState::Probe,
        "FAILED" => ArpState::Failed,
        "INCOMPLETE" => ArpState::Incomplete,
        "PERMANENT" => ArpState::Permanent,
        _ => ArpState::Unknown,
    }
}

/// Parse the procfs ARP table
fn parse_proc_net_arp(content: &str) -> Vec<ArpEntry> {
    // IP address  HW type  Flags  HW address  Mask  Device
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }
            let ip = Ipv4Addr::from_str(parts[0]).ok()?;
            // ATF_COM (0x2) marks a completed entry
            let flags = u32::from_str_radix(parts[2].trim_start_matches("0x"), 16).ok()?;
            let state = if flags & 0x2 != 0 {
                ArpState::Reachable
            } else {
                ArpState::Incomplete
            };
            Some(ArpEntry {
                ip,
                mac: parts[3].to_ascii_lowercase(),
                interface: parts[5].to_string(),
                state,
            })
        })
        .collect()
}

/// Map targets to observed MACs from a single table read
pub fn resolve_neighbors<N: NeighborTable + ?Sized>(
    table: &N,
    targets: &[Ipv4Addr],
) -> BTreeMap<Ipv4Addr, String> {
    let entries = match table.entries() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Neighbor table read failed, no MACs observed this pass");
            return BTreeMap::new();
        }
    };

    let wanted: HashSet<Ipv4Addr> = targets.iter().copied().collect();
    let neighbors: BTreeMap<Ipv4Addr, String> = entries
        .into_iter()
        .filter(|e| wanted.contains(&e.ip) && e.is_live())
        .map(|e| (e.ip, e.mac))
        .collect();

    debug!(resolved = neighbors.len(), "Resolved neighbor MACs");
    neighbors
}
