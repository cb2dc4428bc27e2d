//! Discovery scanner that runs the staged reconciliation pass
//!
//! A pass is strictly staged, each stage finishing for the whole batch
//! before the next begins:
//! range expansion -> liveness probe -> neighbor table read ->
//! classification -> reconciliation -> post-provision -> cache write

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ztp_core::{
    BindingStore, CacheError, CacheSnapshot, CacheStore, DiscoveryCache, IdentityStore,
    StoreError, DEFAULT_STALE_AFTER,
};
use ztp_ssh::{RemoteChannel, SshChannel, SshConfig};

use crate::arp::{resolve_neighbors, NeighborTable, SystemNeighborTable};
use crate::classify::{classify_all, CLASSIFY_CONCURRENCY};
use crate::probe::{probe_all, PingProber, Prober, PROBE_CONCURRENCY, PROBE_PACING, PROBE_TIMEOUT_MS};
use crate::provision::{run_post_provision, ProvisionConfig, ProvisionToggles};
use crate::range::{expand_range, RangeError};
use crate::reconcile::{reconcile, IntentSources, PassObservations};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("Failed to load intent store: {0}")]
    Store(#[from] StoreError),
    #[error("A discovery pass is already running")]
    PassInProgress,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Liveness probes in flight
    pub probe_concurrency: usize,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// Delay between launching probes
    pub probe_pacing: Duration,
    /// Management sessions in flight during classification
    pub classify_concurrency: usize,
    /// Service account used for classification and post-provision
    pub ssh: SshConfig,
    pub provision: ProvisionConfig,
    /// Binding store (JSON array of bindings)
    pub bindings_path: PathBuf,
    /// Device-identity store (JSON object keyed by address)
    pub identities_path: PathBuf,
    pub cache_path: PathBuf,
    pub stale_after: Duration,
    /// Retry failed cache writes through sudo
    pub elevated_cache_writes: bool,
    /// This host's own addresses; never dialed over ssh
    pub local_addresses: Vec<Ipv4Addr>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_concurrency: PROBE_CONCURRENCY,
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            probe_pacing: PROBE_PACING,
            classify_concurrency: CLASSIFY_CONCURRENCY,
            ssh: SshConfig::default(),
            provision: ProvisionConfig::default(),
            bindings_path: PathBuf::from("/var/lib/ztpd/bindings.json"),
            identities_path: PathBuf::from("/var/lib/ztpd/devices.json"),
            cache_path: PathBuf::from("/var/lib/ztpd/discovery.json"),
            stale_after: DEFAULT_STALE_AFTER,
            elevated_cache_writes: true,
            local_addresses: Vec::new(),
        }
    }
}

/// Result of a completed pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub cache: DiscoveryCache,
    /// Set when the entries were computed but could not be persisted
    pub cache_error: Option<String>,
}

/// Discovery scanner service
pub struct DiscoveryScanner {
    config: ScannerConfig,
    prober: Arc<dyn Prober>,
    neighbors: Arc<dyn NeighborTable>,
    channel: Arc<dyn RemoteChannel>,
    provision: Arc<ProvisionConfig>,
    cache: CacheStore,
    pass_lock: Mutex<()>,
}

impl DiscoveryScanner {
    /// Create a scanner backed by ping, the kernel neighbor table, and ssh
    pub fn new(config: ScannerConfig) -> Self {
        let prober = Arc::new(PingProber::new(config.probe_timeout));
        let channel = Arc::new(SshChannel::new(config.ssh.clone()));
        Self::with_backends(config, prober, Arc::new(SystemNeighborTable), channel)
    }

    /// Create a scanner with explicit network backends
    pub fn with_backends(
        config: ScannerConfig,
        prober: Arc<dyn Prober>,
        neighbors: Arc<dyn NeighborTable>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        let mut cache = CacheStore::new(config.cache_path.clone(), config.stale_after);
        if !config.elevated_cache_writes {
            cache = cache.without_elevated_fallback();
        }
        Self {
            provision: Arc::new(config.provision.clone()),
            config,
            prober,
            neighbors,
            channel,
            cache,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Read the last pass with its staleness flag
    pub fn read_cache(&self) -> Result<CacheSnapshot, CacheError> {
        self.cache.read()
    }

    /// Run one full reconciliation pass over `range_spec`.
    ///
    /// Fails only on configuration problems (bad range, unreadable intent
    /// store) or when another pass is running. A cache write failure is
    /// reported in the outcome alongside the computed entries.
    pub async fn run_discovery(
        &self,
        range_spec: &str,
        toggles: ProvisionToggles,
    ) -> Result<PassOutcome, DiscoveryError> {
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| DiscoveryError::PassInProgress)?;

        let targets = expand_range(range_spec)?;
        let bindings = BindingStore::load(&self.config.bindings_path)?;
        let identities = IdentityStore::load(&self.config.identities_path)?;
        let previous = match self.cache.read() {
            Ok(snapshot) => Some(snapshot.cache),
            Err(e) => {
                warn!(error = %e, "Previous discovery cache unreadable, ignoring it");
                None
            }
        };

        info!(
            range = %range_spec,
            targets = targets.len(),
            bindings = bindings.len(),
            "Starting discovery pass"
        );

        // Stage 1: liveness
        let reachability = probe_all(
            self.prober.clone(),
            &targets,
            self.config.probe_concurrency,
            self.config.probe_pacing,
        )
        .await;

        // Stage 2: one neighbor-table read, after every probe has finished
        let neighbors = {
            let table = self.neighbors.clone();
            let targets = targets.clone();
            tokio::task::spawn_blocking(move || resolve_neighbors(table.as_ref(), &targets))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Neighbor table task failed");
                    Default::default()
                })
        };

        // Stage 3: management-channel classification of live targets
        let reachable: Vec<Ipv4Addr> = targets
            .iter()
            .copied()
            .filter(|ip| reachability.get(ip).copied().unwrap_or(false))
            .collect();
        let local: HashSet<Ipv4Addr> = self.config.local_addresses.iter().copied().collect();
        let classifications = classify_all(
            self.channel.clone(),
            &reachable,
            &local,
            self.config.classify_concurrency,
        )
        .await;

        // Stage 4: reconciliation
        let observations = PassObservations {
            reachability,
            neighbors,
            classifications,
        };
        let sources = IntentSources {
            bindings: &bindings,
            identities: &identities,
            previous: previous.as_ref(),
        };
        let mut entries = reconcile(&targets, &observations, sources);

        // Stage 5: post-provision
        run_post_provision(self.channel.clone(), &mut entries, self.provision.clone(), toggles)
            .await;

        // Stage 6: persist
        let cache = DiscoveryCache::new(range_spec, entries);
        let cache_error = match self.cache.write(&cache) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to persist discovery cache");
                Some(e.to_string())
            }
        };

        debug!(entries = cache.entries.len(), "Discovery pass finished");
        Ok(PassOutcome { cache, cache_error })
    }
}
