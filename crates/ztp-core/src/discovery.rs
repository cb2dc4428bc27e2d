//! Per-address discovery results
//!
//! A [`DiscoveryEntry`] is built in one step from the observations of a pass.
//! Its classification and MAC verdict are computed from those observations
//! at construction time and cannot be set independently afterwards. The only
//! mutable field is the post-provision outcome.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::binding::Binding;

/// Provisioning state of a device as seen over the management channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Did not answer the liveness probe
    Unreachable,
    /// Accepted the service account's key
    Provisioned,
    /// Alive but rejected the service account's key
    NotProvisioned,
    /// Alive but the management channel failed for another reason
    Other,
}

impl DeviceClass {
    /// Combine liveness with the management-channel result.
    ///
    /// A reachable target that was never classified counts as `Other`.
    pub fn resolve(reachable: bool, channel: Option<DeviceClass>) -> Self {
        if !reachable {
            return Self::Unreachable;
        }
        match channel {
            Some(Self::Unreachable) | None => Self::Other,
            Some(class) => class,
        }
    }
}

/// Comparison of the bound MAC against the observed one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacVerdict {
    Match,
    Mismatch,
    Unreachable,
    NoBinding,
}

impl MacVerdict {
    /// `bound_mac` is `None` when the address has no binding.
    pub fn resolve(reachable: bool, bound_mac: Option<&str>, observed_mac: Option<&str>) -> Self {
        let Some(bound) = bound_mac else {
            return Self::NoBinding;
        };
        if !reachable {
            return Self::Unreachable;
        }
        match observed_mac {
            // Reachable but no neighbor entry: tentatively accepted
            None => Self::Match,
            Some(observed) if observed.eq_ignore_ascii_case(bound) => Self::Match,
            Some(_) => Self::Mismatch,
        }
    }
}

/// Outcome of the post-provision actions for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProvision {
    /// Marker already present on the device
    Already,
    /// Actions ran and the marker was written
    Deployed,
    /// Actions ran and did not complete
    Failed,
}

/// Observations for one address, gathered by the pipeline stages
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub reachable: bool,
    pub observed_mac: Option<String>,
    pub channel: Option<DeviceClass>,
    pub serial: Option<String>,
}

/// Intent resolved for one address
#[derive(Debug, Clone, Default)]
pub struct Intent<'a> {
    /// Binding from the binding store
    pub binding: Option<&'a Binding>,
    /// Hostname from the identity store, used only without a binding
    pub fallback_hostname: Option<&'a str>,
    /// Role from the identity store, used only without a binding
    pub fallback_role: Option<&'a str>,
    /// Serial captured by the previous pass
    pub previous_serial: Option<&'a str>,
}

/// One reconciliation result per probed address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    ip: Ipv4Addr,
    hostname: Option<String>,
    bound_mac: Option<String>,
    observed_mac: Option<String>,
    class: DeviceClass,
    mac_verdict: MacVerdict,
    serial: Option<String>,
    role: Option<String>,
    post_provision: Option<PostProvision>,
}

impl DiscoveryEntry {
    pub fn new(ip: Ipv4Addr, observation: Observation, intent: Intent<'_>) -> Self {
        let bound_mac = intent.binding.map(Binding::normalized_mac);
        let observed_mac = observation
            .observed_mac
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty());

        let class = DeviceClass::resolve(observation.reachable, observation.channel);
        let mac_verdict = MacVerdict::resolve(
            observation.reachable,
            bound_mac.as_deref(),
            observed_mac.as_deref(),
        );

        let (hostname, role) = match intent.binding {
            Some(binding) => (Some(binding.hostname.clone()), binding.role.clone()),
            None => (
                intent.fallback_hostname.map(str::to_string),
                intent.fallback_role.map(str::to_string),
            ),
        };

        let serial = observation
            .serial
            .or_else(|| intent.previous_serial.map(str::to_string));

        Self {
            ip,
            hostname,
            bound_mac,
            observed_mac,
            class,
            mac_verdict,
            serial,
            role,
            post_provision: None,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn bound_mac(&self) -> Option<&str> {
        self.bound_mac.as_deref()
    }

    pub fn observed_mac(&self) -> Option<&str> {
        self.observed_mac.as_deref()
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn mac_verdict(&self) -> MacVerdict {
        self.mac_verdict
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn post_provision(&self) -> Option<PostProvision> {
        self.post_provision
    }

    pub fn has_binding(&self) -> bool {
        self.bound_mac.is_some()
    }

    /// Provisioned and bound to an intended identity
    pub fn is_provision_candidate(&self) -> bool {
        self.class == DeviceClass::Provisioned && self.has_binding()
    }

    /// Record the post-provision outcome. Ignored for targets that are not
    /// candidates so an unreachable or unbound entry always stays `null`.
    pub fn set_post_provision(&mut self, outcome: Option<PostProvision>) {
        if self.is_provision_candidate() {
            self.post_provision = outcome;
        }
    }
}
