//! ztp-core - Core types, binding stores, and discovery cache
//!
//! This crate provides the foundational types for ztpd:
//! - Bindings (intended device identities) and the stores they are read from
//! - Per-address discovery entries with derived classification and MAC verdict
//! - The persisted discovery cache and its staleness rules

pub mod binding;
pub mod cache;
pub mod discovery;
pub mod store;

pub use binding::{Binding, DeviceIdentity, InventoryStatus, MAC_PLACEHOLDER};
pub use cache::{CacheError, CacheSnapshot, CacheStore, DiscoveryCache, DEFAULT_STALE_AFTER};
pub use discovery::{DeviceClass, DiscoveryEntry, Intent, MacVerdict, Observation, PostProvision};
pub use store::{load_legacy_hosts, parse_legacy_hosts, BindingStore, IdentityStore, StoreError};
