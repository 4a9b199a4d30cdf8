//! Top-level certificate lifecycle
//!
//! The supervisor owns the challenge listener for the duration of a run:
//! storage cleanup, bind, issuance for every domain, then listener shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sentinel_acme_config::Config;
use serde_json::json;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeRegistry;
use crate::client::AcmeProtocol;
use crate::error::{ResponderError, SupervisorError};
use crate::events::{self, EventObserver, TracingObserver};
use crate::orchestrator::{IssuanceReport, Orchestrator};
use crate::responder::ChallengeResponder;
use crate::scheduler::RenewalScheduler;
use crate::storage::CertificateStore;

type ResponderTask = JoinHandle<Result<(), ResponderError>>;

/// Runs certificate issuance for every configured domain
pub struct Supervisor {
    config: Config,
    store: Arc<CertificateStore>,
    acme: Arc<dyn AcmeProtocol>,
    observer: Arc<dyn EventObserver>,
    challenges: ChallengeRegistry,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<CertificateStore>, acme: Arc<dyn AcmeProtocol>) -> Self {
        Self {
            config,
            store,
            acme,
            observer: Arc::new(TracingObserver),
            challenges: ChallengeRegistry::new(),
        }
    }

    /// Open the certificate store described by `config`
    pub fn open_store(config: &Config) -> Result<Arc<CertificateStore>, SupervisorError> {
        CertificateStore::open(&config.storage_root, &config.ca)
            .map(Arc::new)
            .map_err(|source| SupervisorError::Storage {
                path: config.storage_root.clone(),
                source,
            })
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Bring every configured domain to a terminal state once
    ///
    /// Per-domain failures are reported in the returned [`IssuanceReport`];
    /// only run-wide problems (listener bind, listener crash, shutdown) are
    /// errors. A bind failure happens before any order is created.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<IssuanceReport, SupervisorError> {
        if shutdown.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        cleanup_storage(&self.store, self.observer.as_ref());

        let listener_shutdown = shutdown.child_token();
        let mut listener = self.start_responder(&listener_shutdown).await?;

        let orchestrator = self.orchestrator();
        let outcome = tokio::select! {
            report = orchestrator.run(&self.config.domains, shutdown) => {
                stop_responder(&listener_shutdown, listener).await;
                Ok(report)
            }
            joined = &mut listener => Err(self.responder_exited(joined, shutdown)),
        };
        self.challenges.clear();

        if shutdown.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        outcome
    }

    /// Keep the listener up and re-check every `interval` until shutdown
    ///
    /// The interval is clamped to at least one hour.
    pub async fn watch(&self, shutdown: &CancellationToken, interval: Duration) -> Result<(), SupervisorError> {
        let listener_shutdown = shutdown.child_token();
        let mut listener = self.start_responder(&listener_shutdown).await?;

        let scheduler = RenewalScheduler::new(self.orchestrator(), self.config.domains.clone())
            .with_interval(interval);

        let outcome = tokio::select! {
            _ = scheduler.run(shutdown) => {
                stop_responder(&listener_shutdown, listener).await;
                Ok(())
            }
            joined = &mut listener => Err(self.responder_exited(joined, shutdown)),
        };
        self.challenges.clear();

        match outcome {
            Err(SupervisorError::Cancelled) => Ok(()),
            other => other,
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            &self.config,
            self.acme.clone(),
            self.store.clone(),
            self.challenges.clone(),
        )
        .with_observer(self.observer.clone())
    }

    async fn start_responder(&self, shutdown: &CancellationToken) -> Result<ResponderTask, SupervisorError> {
        let responder = ChallengeResponder::bind(self.config.challenge_address, self.challenges.clone()).await?;
        info!(addr = %responder.local_addr()?, "Challenge listener ready");
        Ok(tokio::spawn(responder.serve(shutdown.clone())))
    }

    fn responder_exited(
        &self,
        joined: Result<Result<(), ResponderError>, JoinError>,
        shutdown: &CancellationToken,
    ) -> SupervisorError {
        if shutdown.is_cancelled() {
            return SupervisorError::Cancelled;
        }
        let reason = match joined {
            Ok(Ok(())) => "listener exited".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        error!(reason = %reason, "Challenge listener stopped during issuance");
        SupervisorError::ResponderFailed(reason)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("domains", &self.config.domains)
            .field("challenge_address", &self.config.challenge_address)
            .field("ca", &self.config.ca)
            .finish()
    }
}

async fn stop_responder(shutdown: &CancellationToken, listener: ResponderTask) {
    shutdown.cancel();
    match listener.await {
        Ok(Ok(())) => debug!("Challenge listener stopped"),
        Ok(Err(e)) => warn!(error = %e, "Challenge listener stopped with error"),
        Err(e) => warn!(error = %e, "Challenge listener task failed"),
    }
}

/// Remove expired certificates and finish interrupted saves; failures are logged and never fatal
pub(crate) fn cleanup_storage(store: &CertificateStore, observer: &dyn EventObserver) {
    match store.cleanup_expired(Utc::now()) {
        Ok(summary) => {
            for (name, reason) in &summary.failed {
                warn!(entry = %name, reason = %reason, "Could not clean up stored certificate");
            }
            if !summary.removed.is_empty() || !summary.recovered.is_empty() || summary.stale_removed > 0 {
                observer.on_event(
                    events::STORAGE_CLEANED,
                    &json!({
                        "removed": summary.removed,
                        "recovered": summary.recovered,
                        "stale_removed": summary.stale_removed,
                    }),
                );
            }
        }
        Err(e) => warn!(error = %e, "Storage cleanup failed"),
    }
}
