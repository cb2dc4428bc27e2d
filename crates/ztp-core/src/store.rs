//! Read-only views of the binding store and the device-identity store
//!
//! The binding store is the canonical source of intent. It is a JSON array
//! of [`Binding`] records. The device-identity store is a JSON object keyed
//! by address and is only consulted for addresses that have no binding.
//! Legacy `dhcp-host` files can be folded into the binding store once, at
//! startup; the canonical store always wins on conflicts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::binding::{Binding, DeviceIdentity};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Bindings keyed by management address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingStore {
    bindings: BTreeMap<Ipv4Addr, Binding>,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a list of bindings; later entries win on duplicate addresses
    pub fn from_bindings(bindings: impl IntoIterator<Item = Binding>) -> Self {
        let mut store = Self::new();
        for binding in bindings {
            if let Some(previous) = store.bindings.insert(binding.ip, binding) {
                warn!(ip = %previous.ip, hostname = %previous.hostname, "Duplicate binding replaced");
            }
        }
        store
    }

    /// Load the store; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let Some(content) = read_optional(path)? else {
            debug!(path = %path.display(), "Binding store not found, using empty store");
            return Ok(Self::new());
        };
        let bindings: Vec<Binding> =
            serde_json::from_str(&content).map_err(|e| StoreError::Json {
                path: path.display().to_string(),
                source: e,
            })?;
        let store = Self::from_bindings(bindings);
        debug!(path = %path.display(), count = store.len(), "Loaded binding store");
        Ok(store)
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<&Binding> {
        self.bindings.get(&ip)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }

    /// Fold legacy bindings in, keeping existing entries untouched.
    /// Returns the number of bindings imported.
    pub fn import_missing(&mut self, legacy: impl IntoIterator<Item = Binding>) -> usize {
        let mut imported = 0;
        for binding in legacy {
            if self.bindings.contains_key(&binding.ip) {
                debug!(ip = %binding.ip, "Legacy binding shadowed by binding store");
                continue;
            }
            self.bindings.insert(binding.ip, binding);
            imported += 1;
        }
        imported
    }

    /// Write the store back as a JSON array
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bindings: Vec<&Binding> = self.bindings.values().collect();
        let content = serde_json::to_string_pretty(&bindings).map_err(|e| StoreError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        let io_err = |e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)?;
        info!(path = %path.display(), count = self.len(), "Saved binding store");
        Ok(())
    }
}

/// Fallback hostname/role lookup for addresses without a binding
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    devices: BTreeMap<Ipv4Addr, DeviceIdentity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: Ipv4Addr, identity: DeviceIdentity) {
        self.devices.insert(ip, identity);
    }

    /// Load the store; a missing file is an empty store, malformed keys are skipped
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let Some(content) = read_optional(path)? else {
            debug!(path = %path.display(), "Identity store not found, using empty store");
            return Ok(Self::new());
        };
        let raw: BTreeMap<String, DeviceIdentity> =
            serde_json::from_str(&content).map_err(|e| StoreError::Json {
                path: path.display().to_string(),
                source: e,
            })?;

        let mut store = Self::new();
        for (key, identity) in raw {
            match Ipv4Addr::from_str(key.trim()) {
                Ok(ip) => store.insert(ip, identity),
                Err(_) => warn!(key = %key, "Skipping identity entry with invalid address"),
            }
        }
        Ok(store)
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<&DeviceIdentity> {
        self.devices.get(&ip)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Parse `dhcp-host=<mac>,<ip>,<hostname>[,...]` lines from a legacy dnsmasq file.
///
/// Only the MAC, address, and hostname are read. Lines that do not carry all
/// three are ignored.
pub fn parse_legacy_hosts(content: &str) -> Vec<Binding> {
    content.lines().filter_map(parse_legacy_line).collect()
}

fn parse_legacy_line(line: &str) -> Option<Binding> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let value = line.strip_prefix("dhcp-host=")?;

    let mut mac = None;
    let mut ip = None;
    let mut hostname = None;
    for field in value.split(',').map(str::trim) {
        if mac.is_none() && is_mac(field) {
            mac = Some(field.to_ascii_lowercase());
        } else if let Ok(addr) = Ipv4Addr::from_str(field) {
            ip.get_or_insert(addr);
        } else if hostname.is_none() && is_hostname_field(field) {
            hostname = Some(field.to_string());
        }
    }

    Some(Binding {
        hostname: hostname?,
        ip: ip?,
        mac: mac?,
        role: None,
        dhcp: true,
    })
}

/// Anything but a lease time, a keyword, or a tagged option
fn is_hostname_field(field: &str) -> bool {
    !field.is_empty()
        && !field.contains(':')
        && !field.starts_with('[')
        && !matches!(field, "infinite" | "ignore")
        && !is_lease_time(field)
}

/// `3600`, `45m`, `12h`, `1d`, `2w`
fn is_lease_time(field: &str) -> bool {
    let digits = field.strip_suffix(['s', 'm', 'h', 'd', 'w']).unwrap_or(field);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Read a legacy hosts file; a missing file yields no bindings
pub fn load_legacy_hosts(path: &Path) -> Result<Vec<Binding>, StoreError> {
    Ok(read_optional(path)?
        .map(|content| parse_legacy_hosts(&content))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn leaf(n: u8) -> Binding {
        let mut b = Binding::planned(format!("leaf{:02}", n), Ipv4Addr::new(10, 0, 0, n));
        b.mac = format!("aa:bb:cc:00:00:{:02x}", n);
        b
    }

    #[test]
    fn test_load_missing_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = BindingStore::load(&temp_dir.path().join("bindings.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/bindings.json");
        let store = BindingStore::from_bindings(vec![leaf(11), leaf(12)]);
        store.save(&path).unwrap();

        let loaded = BindingStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(Ipv4Addr::new(10, 0, 0, 12)).unwrap().hostname,
            "leaf12"
        );
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bindings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            BindingStore::load(&path),
            Err(StoreError::Json { .. })
        ));
    }

    #[test]
    fn test_identity_store_skips_bad_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("devices.json");
        std::fs::write(
            &path,
            r#"{"10.0.0.20": {"hostname": "oob01", "role": "oob"}, "bogus": {"hostname": "x"}}"#,
        )
        .unwrap();

        let store = IdentityStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        let identity = store.get(Ipv4Addr::new(10, 0, 0, 20)).unwrap();
        assert_eq!(identity.hostname, "oob01");
        assert_eq!(identity.role.as_deref(), Some("oob"));
    }

    #[test]
    fn test_parse_legacy_hosts() {
        let content = "\
# managed by hand
dhcp-host=AA:BB:CC:00:00:21,10.0.0.21,leaf21
dhcp-host=aa:bb:cc:00:00:22,leaf22,10.0.0.22,12h
dhcp-host=aa:bb:cc:00:00:23,10.0.0.23
dhcp-range=10.0.0.100,10.0.0.200,12h
";
        let bindings = parse_legacy_hosts(content);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].hostname, "leaf21");
        assert_eq!(bindings[0].mac, "aa:bb:cc:00:00:21");
        assert!(bindings[0].dhcp);
        assert_eq!(bindings[1].ip, Ipv4Addr::new(10, 0, 0, 22));
        assert_eq!(bindings[1].hostname, "leaf22");
    }

    #[test]
    fn test_legacy_lease_times_are_not_hostnames() {
        let content = "\
dhcp-host=aa:bb:cc:00:00:23,10.0.0.23,12h
dhcp-host=aa:bb:cc:00:00:24,10.0.0.24,infinite
dhcp-host=aa:bb:cc:00:00:25,10.0.0.25,3600,leaf25
dhcp-host=aa:bb:cc:00:00:26,set:mgmt,10.0.0.26,leaf26,45m
dhcp-host=aa:bb:cc:00:00:27,id:client27,10.0.0.27,2w
";
        let bindings = parse_legacy_hosts(content);
        let names: Vec<_> = bindings.iter().map(|b| (b.ip, b.hostname.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (Ipv4Addr::new(10, 0, 0, 25), "leaf25"),
                (Ipv4Addr::new(10, 0, 0, 26), "leaf26"),
            ]
        );
    }

    #[test]
    fn test_lease_time_tokens() {
        for token in ["12h", "3600", "45m", "1d", "2w", "30s"] {
            assert!(is_lease_time(token), "{token}");
        }
        for token in ["leaf01", "h", "", "12x"] {
            assert!(!is_lease_time(token), "{token}");
        }
    }

    #[test]
    fn test_import_missing_keeps_canonical() {
        let mut store = BindingStore::from_bindings(vec![leaf(11)]);
        let mut conflicting = leaf(11);
        conflicting.hostname = "legacy-name".to_string();

        let imported = store.import_missing(vec![conflicting, leaf(12)]);
        assert_eq!(imported, 1);
        assert_eq!(store.get(Ipv4Addr::new(10, 0, 0, 11)).unwrap().hostname, "leaf11");
        assert!(store.get(Ipv4Addr::new(10, 0, 0, 12)).is_some());
    }
}
