//! Liveness probing for expanded targets

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Probe timeout in milliseconds
pub const PROBE_TIMEOUT_MS: u64 = 1000;

/// Default number of probes in flight
pub const PROBE_CONCURRENCY: usize = 250;

/// Default delay between launching consecutive probes
pub const PROBE_PACING: Duration = Duration::from_millis(5);

/// A single-round-trip liveness check
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, ip: Ipv4Addr) -> bool;
}

/// ICMP echo via the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new(Duration::from_millis(PROBE_TIMEOUT_MS))
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, ip: Ipv4Addr) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let result = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", &wait, &ip.to_string()])
            .kill_on_drop(true)
            .output();

        // Backstop in case ping ignores -W
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), result).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Failed to run ping");
                false
            }
            Err(_) => false,
        }
    }
}

/// Probe every target with at most `concurrency` probes in flight.
///
/// Returns once every probe has finished or timed out. Every target is
/// present in the result; failures are `false`.
pub async fn probe_all<P: Prober + ?Sized>(
    prober: Arc<P>,
    targets: &[Ipv4Addr],
    concurrency: usize,
    pacing: Duration,
) -> BTreeMap<Ipv4Addr, bool> {
    let mut reachability: BTreeMap<Ipv4Addr, bool> =
        targets.iter().map(|&ip| (ip, false)).collect();

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for &ip in targets {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let prober = prober.clone();
        tasks.spawn(async move {
            let alive = prober.probe(ip).await;
            drop(permit);
            (ip, alive)
        });
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((ip, alive)) => {
                reachability.insert(ip, alive);
            }
            Err(e) => warn!(error = %e, "Probe task failed"),
        }
    }

    let alive = reachability.values().filter(|&&v| v).count();
    info!(probed = targets.len(), alive, "Liveness probe complete");
    reachability
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers for a fixed set of addresses and tracks peak concurrency
    pub(crate) struct FakeProber {
        pub alive: HashSet<Ipv4Addr>,
        /// Probes of these addresses panic
        pub panics: HashSet<Ipv4Addr>,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub delay: Duration,
    }

    impl FakeProber {
        pub(crate) fn new(alive: impl IntoIterator<Item = Ipv4Addr>) -> Self {
            Self {
                alive: alive.into_iter().collect(),
                panics: HashSet::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(2),
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, ip: Ipv4Addr) -> bool {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panics.contains(&ip) {
                panic!("probe blew up");
            }
            self.alive.contains(&ip)
        }
    }

    fn targets(n: u8) -> Vec<Ipv4Addr> {
        (1..=n).map(|d| Ipv4Addr::new(10, 0, 0, d)).collect()
    }

    #[tokio::test]
    async fn test_every_target_reported() {
        let prober = Arc::new(FakeProber::new([Ipv4Addr::new(10, 0, 0, 2)]));
        let result = probe_all(prober, &targets(5), 10, Duration::ZERO).await;
        assert_eq!(result.len(), 5);
        assert!(result[&Ipv4Addr::new(10, 0, 0, 2)]);
        assert!(!result[&Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let prober = Arc::new(FakeProber::new(Vec::new()));
        probe_all(prober.clone(), &targets(40), 4, Duration::ZERO).await;
        assert!(prober.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_panic_counts_as_unreachable() {
        let mut prober = FakeProber::new([Ipv4Addr::new(10, 0, 0, 66)]);
        prober.panics.insert(Ipv4Addr::new(10, 0, 0, 66));
        let prober = Arc::new(prober);
        let result = probe_all(prober, &targets(70), 8, Duration::ZERO).await;
        assert_eq!(result.len(), 70);
        assert!(!result[&Ipv4Addr::new(10, 0, 0, 66)]);
    }

    #[tokio::test]
    async fn test_only_listed_addresses_panic() {
        let prober = Arc::new(FakeProber::new([Ipv4Addr::new(10, 0, 0, 66)]));
        let result = probe_all(prober, &targets(70), 8, Duration::ZERO).await;
        assert!(result[&Ipv4Addr::new(10, 0, 0, 66)]);
    }
}
