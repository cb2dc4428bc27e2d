//! Post-provision actions for devices that came under management
//!
//! Each candidate is a device classified `provisioned` that also has a
//! binding. The remote marker file gates the whole sequence: if it exists the
//! device is reported `already`. Otherwise one remote script runs:
//!
//! ```text
//! [install staged files &&] { disable ztp || true; } && { set hostname || true; } && write marker
//! ```
//!
//! The marker is written only when every staged file was installed; the two
//! best-effort steps never break the chain.
//!
//! The marker check and the script are separate round trips. Two passes
//! running against the same device at once could both see no marker; the
//! scanner's pass lock prevents that within one process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use ztp_core::{DiscoveryEntry, PostProvision};
use ztp_ssh::{shell_quote, RemoteChannel};

/// Default number of devices provisioned at once
pub const PROVISION_CONCURRENCY: usize = 10;

/// Independent switches for the post-provision steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionToggles {
    /// Install base configuration files from the staging area
    pub push_config: bool,
    /// Disable the device's ZTP agent
    pub disable_ztp: bool,
    /// Set the hostname to the bound hostname
    pub set_hostname: bool,
}

impl Default for ProvisionToggles {
    fn default() -> Self {
        Self {
            push_config: true,
            disable_ztp: true,
            set_hostname: true,
        }
    }
}

/// A base configuration file and where it is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// File name inside the staging directory
    pub name: String,
    /// Absolute destination paths on the device
    pub destinations: Vec<String>,
    /// Octal permission mode
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "0644".to_string()
}

impl StagedFile {
    fn new(name: &str, destinations: &[&str], mode: &str) -> Self {
        Self {
            name: name.to_string(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            mode: mode.to_string(),
        }
    }
}

/// Base configuration set pushed to every new switch
pub fn default_staged_files() -> Vec<StagedFile> {
    vec![
        StagedFile::new("interfaces", &["/etc/network/interfaces"], "0644"),
        StagedFile::new("frr.conf", &["/etc/frr/frr.conf"], "0640"),
        StagedFile::new("daemons", &["/etc/frr/daemons"], "0640"),
        StagedFile::new("resolv.conf", &["/etc/resolv.conf"], "0644"),
        StagedFile::new("motd", &["/etc/motd", "/etc/issue.net"], "0644"),
    ]
}

/// Settings for the post-provision runner
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Local directory holding the base configuration files
    pub staging_dir: PathBuf,
    pub files: Vec<StagedFile>,
    /// Remote marker meaning "post-provision complete"
    pub marker_path: String,
    /// Remote directory files are copied into before installation
    pub remote_staging_dir: String,
    pub ztp_disable_command: String,
    /// Hostname command; `{hostname}` is replaced with the bound hostname
    pub hostname_command: String,
    pub concurrency: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/var/lib/ztpd/base"),
            files: default_staged_files(),
            marker_path: "/etc/ztpd/post-provision.done".to_string(),
            remote_staging_dir: "/tmp/ztpd-staging".to_string(),
            ztp_disable_command: "sudo ztp -d".to_string(),
            hostname_command: "sudo nv set system hostname {hostname} && sudo nv config apply -y"
                .to_string(),
            concurrency: PROVISION_CONCURRENCY,
        }
    }
}

/// What will be done to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    /// Local files to copy before the script runs
    pub files: Vec<PathBuf>,
    pub script: String,
}

/// Hostname made only of DNS labels, safe to splice into a command
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Staged files that exist in the local staging directory.
///
/// Touches the filesystem; call once per pass, off the async runtime.
pub fn present_staged_files(config: &ProvisionConfig) -> Vec<StagedFile> {
    config
        .files
        .iter()
        .filter(|staged| {
            let local = config.staging_dir.join(&staged.name);
            let present = local.is_file();
            if !present {
                debug!(file = %local.display(), "Staged file absent, skipping");
            }
            present
        })
        .cloned()
        .collect()
}

/// Build the action plan for a device, or `None` if nothing is eligible.
///
/// `present` is the output of [`present_staged_files`].
pub fn plan_actions(
    config: &ProvisionConfig,
    present: &[StagedFile],
    hostname: &str,
    toggles: ProvisionToggles,
) -> Option<ActionPlan> {
    let remote_dir = config.remote_staging_dir.trim_end_matches('/');

    let mut files = Vec::new();
    let mut installs = Vec::new();
    if toggles.push_config {
        for staged in present {
            let remote = format!("{}/{}", remote_dir, staged.name);
            for dest in &staged.destinations {
                installs.push(format!(
                    "sudo install -D -m {} {} {}",
                    shell_quote(&staged.mode),
                    shell_quote(&remote),
                    shell_quote(dest)
                ));
            }
            files.push(config.staging_dir.join(&staged.name));
        }
    }

    let mut best_effort = Vec::new();
    if toggles.disable_ztp && !config.ztp_disable_command.trim().is_empty() {
        best_effort.push(format!("{{ ( {} ) || true; }}", config.ztp_disable_command.trim()));
    }
    if toggles.set_hostname {
        if is_valid_hostname(hostname) {
            let cmd = config.hostname_command.replace("{hostname}", hostname);
            best_effort.push(format!("{{ ( {} ) || true; }}", cmd.trim()));
        } else {
            warn!(hostname = %hostname, "Bound hostname is not a valid DNS name, not setting it");
        }
    }

    if installs.is_empty() && best_effort.is_empty() {
        return None;
    }

    let mut chain = installs;
    chain.extend(best_effort);
    chain.push(format!(
        "sudo install -D -m 0644 /dev/null {}",
        shell_quote(&config.marker_path)
    ));
    let mut script = chain.join(" && ");

    if !files.is_empty() {
        script = format!(
            "{{ {}; }}; rc=$?; rm -rf {}; exit $rc",
            script,
            shell_quote(remote_dir)
        );
    }

    Some(ActionPlan { files, script })
}

/// Run the marker-gated sequence against one device.
///
/// The marker is checked first. A device without the marker and without
/// a plan is not attempted and yields `None`.
pub async fn provision_device<C: RemoteChannel + ?Sized>(
    channel: &C,
    ip: Ipv4Addr,
    plan: Option<&ActionPlan>,
    config: &ProvisionConfig,
) -> Option<PostProvision> {
    match channel.marker_present(ip, &config.marker_path).await {
        Ok(true) => {
            debug!(ip = %ip, "Post-provision marker present");
            return Some(PostProvision::Already);
        }
        Ok(false) => {}
        Err(e) => {
            warn!(ip = %ip, error = %e, "Marker check failed");
            return Some(PostProvision::Failed);
        }
    }

    let Some(plan) = plan else {
        debug!(ip = %ip, "No eligible post-provision actions");
        return None;
    };

    if !plan.files.is_empty() {
        if let Err(e) = channel
            .copy_files(ip, &plan.files, &config.remote_staging_dir)
            .await
        {
            warn!(ip = %ip, error = %e, "Copying base configuration failed");
            return Some(PostProvision::Failed);
        }
    }

    let outcome = match channel.run_script(ip, &plan.script).await {
        Ok(output) if output.success() => {
            info!(ip = %ip, "Post-provision deployed");
            PostProvision::Deployed
        }
        Ok(output) => {
            warn!(ip = %ip, status = ?output.status, stderr = %output.stderr.trim(), "Post-provision script failed");
            PostProvision::Failed
        }
        Err(e) => {
            warn!(ip = %ip, error = %e, "Post-provision session failed");
            PostProvision::Failed
        }
    };
    Some(outcome)
}

/// Run post-provision over every candidate entry and record the outcomes.
///
/// Only entries classified `provisioned` with a binding are touched.
pub async fn run_post_provision<C: RemoteChannel + ?Sized + 'static>(
    channel: Arc<C>,
    entries: &mut [DiscoveryEntry],
    config: Arc<ProvisionConfig>,
    toggles: ProvisionToggles,
) {
    let candidates: Vec<(Ipv4Addr, String)> = entries
        .iter()
        .filter(|e| e.is_provision_candidate())
        .map(|e| (e.ip(), e.hostname().unwrap_or_default().to_string()))
        .collect();
    if candidates.is_empty() {
        debug!("No post-provision candidates");
        return;
    }

    let present = if toggles.push_config {
        let config = config.clone();
        tokio::task::spawn_blocking(move || present_staged_files(&config))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Staging directory scan failed");
                Vec::new()
            })
    } else {
        Vec::new()
    };

    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut outcomes: BTreeMap<Ipv4Addr, Option<PostProvision>> = BTreeMap::new();

    for (ip, hostname) in candidates {
        let plan = plan_actions(&config, &present, &hostname, toggles);

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        // Overwritten when the task reports back
        outcomes.insert(ip, Some(PostProvision::Failed));
        let channel = channel.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let outcome = provision_device(channel.as_ref(), ip, plan.as_ref(), &config).await;
            drop(permit);
            (ip, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ip, outcome)) => {
                outcomes.insert(ip, outcome);
            }
            Err(e) => warn!(error = %e, "Post-provision task failed"),
        }
    }

    for entry in entries.iter_mut() {
        if let Some(outcome) = outcomes.get(&entry.ip()) {
            entry.set_post_provision(*outcome);
        }
    }

    let deployed = outcomes
        .values()
        .filter(|o| **o == Some(PostProvision::Deployed))
        .count();
    info!(candidates = outcomes.len(), deployed, "Post-provision complete");
}
