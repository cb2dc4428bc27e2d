//! ZTP Discovery - reconciliation passes over a switch fabric
//!
//! A pass walks an address range through these stages:
//! - ICMP liveness probing with bounded fan-out
//! - Neighbor-table (ARP) lookup of observed MAC addresses
//! - SSH classification of reachable devices
//! - Reconciliation against the binding and identity stores
//! - Marker-gated post-provision of bound, provisioned devices

pub mod arp;
pub mod classify;
pub mod probe;
pub mod provision;
pub mod range;
pub mod reconcile;
pub mod scanner;

pub use arp::{ArpEntry, ArpState, NeighborTable, SystemNeighborTable};
pub use classify::{Classification, CLASSIFY_CONCURRENCY};
pub use probe::{PingProber, Prober, PROBE_CONCURRENCY, PROBE_PACING, PROBE_TIMEOUT_MS};
pub use provision::{
    default_staged_files, plan_actions, present_staged_files, ActionPlan, ProvisionConfig,
    ProvisionToggles, StagedFile, PROVISION_CONCURRENCY,
};
pub use range::{expand_range, RangeError, MAX_TARGETS};
pub use scanner::{DiscoveryError, DiscoveryScanner, PassOutcome, ScannerConfig};
