//! Management-channel classification of reachable targets

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use ztp_core::DeviceClass;
use ztp_ssh::{RemoteChannel, SshError};

/// Default number of classification sessions in flight
pub const CLASSIFY_CONCURRENCY: usize = 20;

/// Classifier result for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: DeviceClass,
    pub serial: Option<String>,
}

impl Classification {
    fn other() -> Self {
        Self {
            class: DeviceClass::Other,
            serial: None,
        }
    }
}

/// Map a session attempt to a device class
pub fn class_for_session(result: &Result<(), SshError>) -> DeviceClass {
    match result {
        Ok(()) => DeviceClass::Provisioned,
        Err(SshError::AuthRejected(_)) => DeviceClass::NotProvisioned,
        Err(_) => DeviceClass::Other,
    }
}

async fn classify_one<C: RemoteChannel + ?Sized>(channel: &C, ip: Ipv4Addr) -> Classification {
    let session = channel.open_session(ip).await;
    let class = class_for_session(&session);
    if let Err(e) = &session {
        debug!(ip = %ip, error = %e, class = ?class, "Session not established");
    }

    let serial = if class == DeviceClass::Provisioned {
        channel.read_serial(ip).await
    } else {
        None
    };

    Classification { class, serial }
}

/// Classify every reachable target with at most `concurrency` sessions open.
///
/// Addresses in `local` belong to this host and are never dialed; they
/// classify as `other`.
pub async fn classify_all<C: RemoteChannel + ?Sized + 'static>(
    channel: Arc<C>,
    reachable: &[Ipv4Addr],
    local: &HashSet<Ipv4Addr>,
    concurrency: usize,
) -> BTreeMap<Ipv4Addr, Classification> {
    let mut results: BTreeMap<Ipv4Addr, Classification> = reachable
        .iter()
        .map(|&ip| (ip, Classification::other()))
        .collect();

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for &ip in reachable {
        if local.contains(&ip) {
            debug!(ip = %ip, "Skipping classification of local address");
            continue;
        }
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let channel = channel.clone();
        tasks.spawn(async move {
            let result = classify_one(channel.as_ref(), ip).await;
            drop(permit);
            (ip, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ip, classification)) => {
                results.insert(ip, classification);
            }
            Err(e) => warn!(error = %e, "Classification task failed"),
        }
    }

    let provisioned = results
        .values()
        .filter(|c| c.class == DeviceClass::Provisioned)
        .count();
    info!(classified = results.len(), provisioned, "Classification complete");
    results
}
