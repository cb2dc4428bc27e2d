//! Merge stage outputs and stored intent into one entry per target

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::debug;
use ztp_core::{BindingStore, DiscoveryCache, DiscoveryEntry, IdentityStore, Intent, Observation};

use crate::classify::Classification;

/// Everything one pass observed, keyed by address
#[derive(Debug, Clone, Default)]
pub struct PassObservations {
    pub reachability: BTreeMap<Ipv4Addr, bool>,
    pub neighbors: BTreeMap<Ipv4Addr, String>,
    pub classifications: BTreeMap<Ipv4Addr, Classification>,
}

/// Read-only intent sources for a pass
#[derive(Debug, Clone, Copy)]
pub struct IntentSources<'a> {
    pub bindings: &'a BindingStore,
    pub identities: &'a IdentityStore,
    /// Result of the previous pass, for carrying serials forward
    pub previous: Option<&'a DiscoveryCache>,
}

impl<'a> IntentSources<'a> {
    fn intent_for(&self, ip: Ipv4Addr) -> Intent<'a> {
        let binding = self.bindings.get(ip);
        let identity = if binding.is_none() {
            self.identities.get(ip)
        } else {
            None
        };
        Intent {
            binding,
            fallback_hostname: identity.map(|i| i.hostname.as_str()),
            fallback_role: identity.and_then(|i| i.role.as_deref()),
            previous_serial: self.previous.and_then(|p| p.serial_for(ip)),
        }
    }
}

/// Build exactly one entry per target, in target order
pub fn reconcile(
    targets: &[Ipv4Addr],
    observations: &PassObservations,
    sources: IntentSources<'_>,
) -> Vec<DiscoveryEntry> {
    let entries: Vec<DiscoveryEntry> = targets
        .iter()
        .map(|&ip| {
            let reachable = observations.reachability.get(&ip).copied().unwrap_or(false);
            let classification = observations.classifications.get(&ip);
            let observation = Observation {
                reachable,
                observed_mac: observations.neighbors.get(&ip).cloned(),
                channel: classification.map(|c| c.class),
                serial: classification.and_then(|c| c.serial.clone()),
            };
            DiscoveryEntry::new(ip, observation, sources.intent_for(ip))
        })
        .collect();

    debug!(entries = entries.len(), "Reconciled pass");
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztp_core::{Binding, DeviceClass, DeviceIdentity, MacVerdict, Observation};

    fn ip(d: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, d)
    }

    fn binding(d: u8, mac: &str) -> Binding {
        let mut b = Binding::planned(format!("leaf{:02}", d), ip(d));
        b.mac = mac.to_string();
        b.role = Some("leaf".to_string());
        b
    }

    fn provisioned(serial: Option<&str>) -> Classification {
        Classification {
            class: DeviceClass::Provisioned,
            serial: serial.map(str::to_string),
        }
    }

    fn fixture() -> (Vec<Ipv4Addr>, PassObservations, BindingStore, IdentityStore) {
        let targets = vec![ip(1), ip(2), ip(3), ip(4), ip(5)];
        let mut obs = PassObservations::default();
        for &t in &targets {
            obs.reachability.insert(t, t != ip(5));
        }
        obs.neighbors.insert(ip(1), "aa:bb:cc:00:00:01".into());
        obs.neighbors.insert(ip(2), "aa:bb:cc:00:00:99".into());
        obs.neighbors.insert(ip(5), "aa:bb:cc:00:00:05".into());
        obs.classifications.insert(ip(1), provisioned(Some("SN1")));
        obs.classifications.insert(ip(2), Classification { class: DeviceClass::NotProvisioned, serial: None });
        obs.classifications.insert(ip(3), provisioned(None));
        obs.classifications.insert(ip(4), Classification { class: DeviceClass::Other, serial: None });

        let bindings = BindingStore::from_bindings(vec![
            binding(1, "AA:BB:CC:00:00:01"),
            binding(2, "aa:bb:cc:00:00:02"),
            binding(5, "aa:bb:cc:00:00:05"),
        ]);
        let mut identities = IdentityStore::new();
        identities.insert(
            ip(3),
            DeviceIdentity {
                hostname: "oob03".into(),
                role: Some("oob".into()),
            },
        );
        identities.insert(
            ip(1),
            DeviceIdentity {
                hostname: "ignored".into(),
                role: None,
            },
        );
        (targets, obs, bindings, identities)
    }

    #[test]
    fn test_one_entry_per_target_in_order() {
        let (targets, obs, bindings, identities) = fixture();
        let sources = IntentSources { bindings: &bindings, identities: &identities, previous: None };
        let entries = reconcile(&targets, &obs, sources);
        let ips: Vec<_> = entries.iter().map(|e| e.ip()).collect();
        assert_eq!(ips, targets);
    }

    #[test]
    fn test_classification_and_verdicts() {
        let (targets, obs, bindings, identities) = fixture();
        let sources = IntentSources { bindings: &bindings, identities: &identities, previous: None };
        let entries = reconcile(&targets, &obs, sources);

        assert_eq!(entries[0].class(), DeviceClass::Provisioned);
        assert_eq!(entries[0].mac_verdict(), MacVerdict::Match);
        assert_eq!(entries[0].hostname(), Some("leaf01"));
        assert_eq!(entries[0].serial(), Some("SN1"));

        assert_eq!(entries[1].class(), DeviceClass::NotProvisioned);
        assert_eq!(entries[1].mac_verdict(), MacVerdict::Mismatch);

        // No binding: identity store supplies hostname and role
        assert_eq!(entries[2].mac_verdict(), MacVerdict::NoBinding);
        assert_eq!(entries[2].hostname(), Some("oob03"));
        assert_eq!(entries[2].role(), Some("oob"));
        assert!(!entries[2].is_provision_candidate());

        assert_eq!(entries[3].class(), DeviceClass::Other);
        assert_eq!(entries[3].hostname(), None);

        assert_eq!(entries[4].class(), DeviceClass::Unreachable);
        assert_eq!(entries[4].mac_verdict(), MacVerdict::Unreachable);
        assert_eq!(entries[4].post_provision(), None);
    }

    #[test]
    fn test_previous_serial_carried_forward() {
        let (targets, obs, bindings, identities) = fixture();
        let previous_entry = DiscoveryEntry::new(
            ip(3),
            Observation {
                reachable: true,
                observed_mac: None,
                channel: Some(DeviceClass::Provisioned),
                serial: Some("SN3".into()),
            },
            Intent::default(),
        );
        let previous = DiscoveryCache::new("10.0.0.3", vec![previous_entry]);
        let sources = IntentSources {
            bindings: &bindings,
            identities: &identities,
            previous: Some(&previous),
        };
        let entries = reconcile(&targets, &obs, sources);
        assert_eq!(entries[2].serial(), Some("SN3"));
        assert_eq!(entries[0].serial(), Some("SN1"));
    }

    #[test]
    fn test_deterministic() {
        let (targets, obs, bindings, identities) = fixture();
        let sources = IntentSources { bindings: &bindings, identities: &identities, previous: None };
        let first = serde_json::to_string(&reconcile(&targets, &obs, sources)).unwrap();
        let second = serde_json::to_string(&reconcile(&targets, &obs, sources)).unwrap();
        assert_eq!(first, second);
    }
}
