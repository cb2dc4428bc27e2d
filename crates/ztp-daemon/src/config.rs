//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ztp_discovery::{
    default_staged_files, ProvisionConfig, ProvisionToggles, ScannerConfig, StagedFile,
    CLASSIFY_CONCURRENCY, PROBE_CONCURRENCY, PROVISION_CONCURRENCY, PROBE_TIMEOUT_MS,
};
use ztp_ssh::SshConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub provision: ProvisionSection,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the HTTP surface
    #[serde(default = "default_bind")]
    pub bind: String,
    /// This host's address on the fabric; enumerated from interfaces when unset
    #[serde(default)]
    pub server_address: Option<Ipv4Addr>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            server_address: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Range scanned when a request names none
    #[serde(default = "default_range")]
    pub range: String,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_pacing")]
    pub probe_pacing_ms: u64,
    #[serde(default = "default_classify_concurrency")]
    pub classify_concurrency: usize,
    #[serde(default = "default_provision_concurrency")]
    pub provision_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            range: default_range(),
            probe_concurrency: default_probe_concurrency(),
            probe_timeout_ms: default_probe_timeout(),
            probe_pacing_ms: default_probe_pacing(),
            classify_concurrency: default_classify_concurrency(),
            provision_concurrency: default_provision_concurrency(),
        }
    }
}

fn default_range() -> String {
    "192.168.200.10-192.168.200.254".to_string()
}

fn default_probe_concurrency() -> usize {
    PROBE_CONCURRENCY
}

fn default_probe_timeout() -> u64 {
    PROBE_TIMEOUT_MS
}

fn default_probe_pacing() -> u64 {
    5
}

fn default_classify_concurrency() -> usize {
    CLASSIFY_CONCURRENCY
}

fn default_provision_concurrency() -> usize {
    PROVISION_CONCURRENCY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSection {
    /// Service account on the switches
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: default_key_path(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            provision_timeout_secs: default_provision_timeout(),
        }
    }
}

fn default_ssh_user() -> String {
    "ztp".to_string()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/ztpd/id_ed25519")
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_command_timeout() -> u64 {
    10
}

fn default_provision_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSection {
    /// Local directory holding the base configuration files
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_marker_path")]
    pub marker_path: String,
    #[serde(default = "default_remote_staging_dir")]
    pub remote_staging_dir: String,
    #[serde(default = "default_ztp_disable_command")]
    pub ztp_disable_command: String,
    /// `{hostname}` is replaced with the bound hostname
    #[serde(default = "default_hostname_command")]
    pub hostname_command: String,
    /// Toggles used when a request supplies none
    #[serde(default)]
    pub toggles: ProvisionToggles,
    #[serde(default = "default_staged_files")]
    pub files: Vec<StagedFile>,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        let base = ProvisionConfig::default();
        Self {
            staging_dir: base.staging_dir,
            marker_path: base.marker_path,
            remote_staging_dir: base.remote_staging_dir,
            ztp_disable_command: base.ztp_disable_command,
            hostname_command: base.hostname_command,
            toggles: ProvisionToggles::default(),
            files: base.files,
        }
    }
}

fn default_staging_dir() -> PathBuf {
    ProvisionConfig::default().staging_dir
}

fn default_marker_path() -> String {
    ProvisionConfig::default().marker_path
}

fn default_remote_staging_dir() -> String {
    ProvisionConfig::default().remote_staging_dir
}

fn default_ztp_disable_command() -> String {
    ProvisionConfig::default().ztp_disable_command
}

fn default_hostname_command() -> String {
    ProvisionConfig::default().hostname_command
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default = "default_bindings_path")]
    pub bindings: PathBuf,
    #[serde(default = "default_identities_path")]
    pub identities: PathBuf,
    /// dnsmasq `dhcp-host=` file merged into the binding store at startup
    #[serde(default)]
    pub legacy_hosts: Option<PathBuf>,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            bindings: default_bindings_path(),
            identities: default_identities_path(),
            legacy_hosts: None,
        }
    }
}

fn default_bindings_path() -> PathBuf {
    PathBuf::from("/var/lib/ztpd/bindings.json")
}

fn default_identities_path() -> PathBuf {
    PathBuf::from("/var/lib/ztpd/devices.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Retry failed writes through `sudo -n install`
    #[serde(default = "default_true")]
    pub elevated_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            stale_after_secs: default_stale_after(),
            elevated_writes: true,
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/lib/ztpd/discovery.json")
}

fn default_stale_after() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Convert to ScannerConfig
    pub fn to_scanner_config(&self, local_addresses: Vec<Ipv4Addr>) -> ScannerConfig {
        ScannerConfig {
            probe_concurrency: self.discovery.probe_concurrency,
            probe_timeout: Duration::from_millis(self.discovery.probe_timeout_ms),
            probe_pacing: Duration::from_millis(self.discovery.probe_pacing_ms),
            classify_concurrency: self.discovery.classify_concurrency,
            ssh: SshConfig {
                user: self.ssh.user.clone(),
                key_path: self.ssh.key_path.clone(),
                connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
                command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
                provision_timeout: Duration::from_secs(self.ssh.provision_timeout_secs),
            },
            provision: ProvisionConfig {
                staging_dir: self.provision.staging_dir.clone(),
                files: self.provision.files.clone(),
                marker_path: self.provision.marker_path.clone(),
                remote_staging_dir: self.provision.remote_staging_dir.clone(),
                ztp_disable_command: self.provision.ztp_disable_command.clone(),
                hostname_command: self.provision.hostname_command.clone(),
                concurrency: self.discovery.provision_concurrency,
            },
            bindings_path: self.stores.bindings.clone(),
            identities_path: self.stores.identities.clone(),
            cache_path: self.cache.path.clone(),
            stale_after: Duration::from_secs(self.cache.stale_after_secs),
            elevated_cache_writes: self.cache.elevated_writes,
            local_addresses,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
