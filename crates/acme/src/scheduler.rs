//! Background certificate renewal scheduler
//!
//! Periodically re-checks every domain and renews certificates that entered
//! their renewal window. Used by [`Supervisor::watch`](crate::Supervisor::watch).

use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{IssuanceReport, Orchestrator};
use crate::supervisor::cleanup_storage;

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Background certificate renewal scheduler
///
/// The first check runs immediately; later checks run every
/// `check_interval`. Failed domains are retried on the next check.
pub struct RenewalScheduler {
    orchestrator: Orchestrator,
    domains: Vec<String>,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Orchestrator, domains: Vec<String>) -> Self {
        Self {
            orchestrator,
            domains,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour to avoid
    /// excessive polling.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run checks until `shutdown` is cancelled
    pub async fn run(&self, shutdown: &CancellationToken) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            domain_count = self.domains.len(),
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stopping certificate renewal scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate renewal check");
                    let report = self.check_renewals(shutdown).await;
                    for record in report.failed() {
                        warn!(
                            domain = %record.domain,
                            error = ?record.last_error.as_ref().map(ToString::to_string),
                            "Certificate renewal failed, retrying on next check"
                        );
                    }
                }
            }
        }
    }

    /// One pass: storage cleanup, then orchestration of every domain
    pub async fn check_renewals(&self, shutdown: &CancellationToken) -> IssuanceReport {
        let start = Instant::now();

        cleanup_storage(
            self.orchestrator.store(),
            self.orchestrator.observer().as_ref(),
        );
        let report = self.orchestrator.run(&self.domains, shutdown).await;

        info!(
            elapsed_secs = start.elapsed().as_secs(),
            failed = report.failed().count(),
            "Certificate renewal check completed"
        );
        report
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("domains", &self.domains)
            .finish()
    }
}
