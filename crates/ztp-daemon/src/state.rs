//! Application state management

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use ztp_core::{load_legacy_hosts, BindingStore};
use ztp_discovery::DiscoveryScanner;

use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Discovery scanner
    pub scanner: Arc<DiscoveryScanner>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config) -> Result<Arc<Self>> {
        if let Some(legacy) = &config.stores.legacy_hosts {
            import_legacy_hosts(legacy, &config.stores.bindings)?;
        }

        let local = local_addresses(config.daemon.server_address);
        info!(addresses = ?local, "Excluding local addresses from classification");

        let scanner = Arc::new(DiscoveryScanner::new(config.to_scanner_config(local)));
        Ok(Self::with_scanner(scanner, config))
    }

    pub fn with_scanner(scanner: Arc<DiscoveryScanner>, config: Config) -> Arc<Self> {
        Arc::new(Self { scanner, config })
    }
}

/// Merge a dnsmasq host file into the binding store; existing bindings win
pub fn import_legacy_hosts(legacy: &Path, bindings_path: &Path) -> Result<usize> {
    let hosts = load_legacy_hosts(legacy)
        .with_context(|| format!("reading legacy hosts {}", legacy.display()))?;
    let mut store = BindingStore::load(bindings_path)?;
    let imported = store.import_missing(hosts);
    if imported > 0 {
        store.save(bindings_path)?;
        info!(
            count = imported,
            from = %legacy.display(),
            "Imported legacy host bindings"
        );
    }
    Ok(imported)
}

/// This host's IPv4 addresses on the fabric
fn local_addresses(server_address: Option<Ipv4Addr>) -> Vec<Ipv4Addr> {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    if let Some(addr) = server_address {
        return vec![addr];
    }

    match NetworkInterface::show() {
        Ok(interfaces) => interfaces
            .iter()
            .flat_map(|iface| iface.addr.iter())
            .filter_map(|addr| match addr {
                network_interface::Addr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate interfaces");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use ztp_core::Binding;

    #[test]
    fn test_import_legacy_hosts() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("hosts.conf");
        let bindings = dir.path().join("bindings.json");
        std::fs::write(
            &legacy,
            "dhcp-host=AA:BB:CC:00:00:01,10.0.0.1,leaf01\n\
             dhcp-host=aa:bb:cc:00:00:02,10.0.0.2,leaf02\n",
        )
        .unwrap();

        let mut existing = Binding::planned("spine01", Ipv4Addr::new(10, 0, 0, 1));
        existing.mac = "aa:bb:cc:00:00:99".into();
        BindingStore::from_bindings([existing]).save(&bindings).unwrap();

        assert_eq!(import_legacy_hosts(&legacy, &bindings).unwrap(), 1);

        let store = BindingStore::load(&bindings).unwrap();
        assert_eq!(store.len(), 2);
        let kept = store.get(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(kept.hostname, "spine01");
        let added = store.get(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!(added.hostname, "leaf02");
        assert!(added.dhcp);

        // Second start imports nothing
        assert_eq!(import_legacy_hosts(&legacy, &bindings).unwrap(), 0);
    }

    #[test]
    fn test_missing_legacy_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let imported = import_legacy_hosts(
            &dir.path().join("absent.conf"),
            &dir.path().join("bindings.json"),
        )
        .unwrap();
        assert_eq!(imported, 0);
    }

    #[test]
    fn test_explicit_server_address() {
        let addr = Ipv4Addr::new(10, 0, 0, 250);
        assert_eq!(local_addresses(Some(addr)), vec![addr]);
    }
}
