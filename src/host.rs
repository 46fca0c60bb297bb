//! Process-wide host reachability bookkeeping.
//!
//! Every connection that ever talked to a broker shares one verdict per
//! `(host, port)` pair. Entries are created on first contact and never
//! removed. A background task probes unreachable hosts and flips them back
//! once they answer again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::Endpoint;
use crate::wire::Connector;

pub(crate) const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Availability {
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, Copy, Default)]
struct HostStatus {
    unreachable: bool,
    last_failure: Option<Instant>,
    last_failback: Option<Instant>,
}

pub(crate) struct HostRegistry {
    table: Mutex<HashMap<Endpoint, HostStatus>>,
    health_checker_started: AtomicBool,
}

static REGISTRY: OnceLock<HostRegistry> = OnceLock::new();

pub(crate) fn registry() -> &'static HostRegistry {
    REGISTRY.get_or_init(|| HostRegistry {
        table: Mutex::new(HashMap::new()),
        health_checker_started: AtomicBool::new(false),
    })
}

impl HostRegistry {
    /// A host is reachable unless it was marked unreachable and the
    /// failback cooldown has not yet elapsed.
    pub(crate) fn is_reachable(&self, endpoint: &Endpoint, rc_time: Duration) -> bool {
        let table = self.table.lock().unwrap();
        match table.get(endpoint) {
            Some(status) if status.unreachable => match status.last_failure {
                Some(at) => at.elapsed() >= rc_time,
                None => true,
            },
            _ => true,
        }
    }

    pub(crate) fn set_status(&self, endpoint: &Endpoint, availability: Availability) {
        let mut table = self.table.lock().unwrap();
        let status = table.entry(endpoint.clone()).or_default();
        match availability {
            Availability::Reachable => {
                if status.unreachable {
                    info!("host {endpoint} is reachable again");
                }
                status.unreachable = false;
            }
            Availability::Unreachable => {
                status.unreachable = true;
                status.last_failure = Some(Instant::now());
            }
        }
    }

    pub(crate) fn last_failure_age(&self, endpoint: &Endpoint) -> Option<Duration> {
        let table = self.table.lock().unwrap();
        table
            .get(endpoint)
            .and_then(|status| status.last_failure)
            .map(|at| at.elapsed())
    }

    /// Whether a connection sitting on an alternate host should force a
    /// failback attempt towards `primary`. Arms at most once per cooldown
    /// window; the caller turns a `true` into a one-shot flag on its
    /// session.
    pub(crate) fn should_failback(&self, primary: &Endpoint, rc_time: Duration) -> bool {
        let mut table = self.table.lock().unwrap();
        let Some(status) = table.get_mut(primary) else {
            return false;
        };
        let Some(last_failure) = status.last_failure else {
            return false;
        };
        let now = Instant::now();
        if now.duration_since(last_failure) < rc_time {
            return false;
        }
        match status.last_failback {
            Some(at) if now.duration_since(at) < rc_time => false,
            _ => {
                status.last_failback = Some(now);
                true
            }
        }
    }

    fn unreachable_hosts(&self) -> Vec<Endpoint> {
        let table = self.table.lock().unwrap();
        table
            .iter()
            .filter(|(_, status)| status.unreachable)
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    /// Starts the background health checker the first time a connection is
    /// opened. Subsequent calls are no-ops.
    pub(crate) fn ensure_health_checker(&'static self, connector: Arc<dyn Connector>) {
        if self
            .health_checker_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("starting broker health checker");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                for endpoint in self.unreachable_hosts() {
                    if connector
                        .check_alive(&endpoint, HEALTH_CHECK_PROBE_TIMEOUT)
                        .await
                    {
                        self.set_status(&endpoint, Availability::Reachable);
                    } else {
                        warn!("host {endpoint} is still unreachable");
                    }
                }
            }
        });
    }
}

/// Reports whether `endpoint` is currently considered reachable, given a
/// failback cooldown. Diagnostic companion to the failover driver.
pub fn is_reachable(endpoint: &Endpoint, rc_time: Duration) -> bool {
    registry().is_reachable(endpoint, rc_time)
}

/// Time since `endpoint` last failed to answer, if it ever failed.
pub fn last_failure_age(endpoint: &Endpoint) -> Option<Duration> {
    registry().last_failure_age(endpoint)
}
