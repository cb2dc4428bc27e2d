//! Binding types describing the intended identity of a switch slot

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// MAC address recorded for a binding whose hardware is not yet known
pub const MAC_PLACEHOLDER: &str = "00:00:00:00:00:00";

/// Inventory status of a binding, derived from its other fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryStatus {
    /// Slot is declared but the hardware MAC is unknown
    Planned,
    /// Hardware is known and the address is handed out by DHCP
    Active,
    /// Hardware is known but the address is not DHCP-managed
    Discovered,
}

/// An operator-declared intended identity for a device slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Hostname the device should carry
    pub hostname: String,
    /// Management address
    pub ip: Ipv4Addr,
    /// Expected MAC address, or [`MAC_PLACEHOLDER`]
    #[serde(default = "default_mac")]
    pub mac: String,
    /// Role tag (e.g. "leaf", "spine")
    #[serde(default)]
    pub role: Option<String>,
    /// Whether this address is assigned by DHCP
    #[serde(default)]
    pub dhcp: bool,
}

fn default_mac() -> String {
    MAC_PLACEHOLDER.to_string()
}

impl Binding {
    /// Create a binding with an unknown MAC
    pub fn planned(hostname: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
            mac: default_mac(),
            role: None,
            dhcp: false,
        }
    }

    /// Whether the MAC is still the placeholder
    pub fn has_placeholder_mac(&self) -> bool {
        let mac = self.mac.trim();
        mac.is_empty() || mac.eq_ignore_ascii_case(MAC_PLACEHOLDER)
    }

    /// The bound MAC, lower-cased for comparison
    pub fn normalized_mac(&self) -> String {
        self.mac.trim().to_ascii_lowercase()
    }

    pub fn status(&self) -> InventoryStatus {
        if self.has_placeholder_mac() {
            InventoryStatus::Planned
        } else if self.dhcp {
            InventoryStatus::Active
        } else {
            InventoryStatus::Discovered
        }
    }
}

/// Hostname/role pair from the device-identity store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub hostname: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        let mut binding = Binding::planned("leaf01", Ipv4Addr::new(10, 0, 0, 11));
        assert_eq!(binding.status(), InventoryStatus::Planned);

        binding.mac = "AA:BB:CC:00:11:22".to_string();
        assert_eq!(binding.status(), InventoryStatus::Discovered);

        binding.dhcp = true;
        assert_eq!(binding.status(), InventoryStatus::Active);
    }

    #[test]
    fn test_empty_mac_is_placeholder() {
        let mut binding = Binding::planned("leaf01", Ipv4Addr::new(10, 0, 0, 11));
        binding.mac = "  ".to_string();
        assert!(binding.has_placeholder_mac());
    }

    #[test]
    fn test_normalized_mac() {
        let mut binding = Binding::planned("leaf01", Ipv4Addr::new(10, 0, 0, 11));
        binding.mac = " AA:BB:CC:00:11:22 ".to_string();
        assert_eq!(binding.normalized_mac(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_deserialize_defaults() {
        let binding: Binding =
            serde_json::from_str(r#"{"hostname":"spine01","ip":"10.0.0.2"}"#).unwrap();
        assert_eq!(binding.mac, MAC_PLACEHOLDER);
        assert!(!binding.dhcp);
        assert_eq!(binding.role, None);
    }
}
