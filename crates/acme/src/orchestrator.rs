//! Per-domain certificate issuance
//!
//! Every configured domain goes through the same state machine:
//!
//! ```text
//! Unstarted ─┬─> HasValidCertificate
//!            └─> NeedsIssuance ─> Renewing ─┬─> Issued
//!                                           └─> Failed
//! ```
//!
//! Domains are processed concurrently and independently. A failure is
//! recorded on the domain's [`DomainRecord`] and never affects other
//! domains; [`Orchestrator::run`] returns only once every domain is in a
//! terminal state.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_acme_config::{Config, KeyAlgorithm, DEFAULT_RENEWAL_RATIO};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeRegistry;
use crate::client::{AcmeProtocol, AuthorizationStatus};
use crate::error::{AcmeError, IssuanceError, StorageError};
use crate::events::{self, EventObserver, TracingObserver};
use crate::keys::{self, PrivateKey};
use crate::storage::{CertificateStore, FileKind, StoredCertificate};

/// Lifecycle state of one domain within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Unstarted,
    NeedsIssuance,
    HasValidCertificate,
    Renewing,
    Issued,
    Failed,
}

impl DomainState {
    /// Whether the domain is done for this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DomainState::HasValidCertificate | DomainState::Issued | DomainState::Failed
        )
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainState::Unstarted => "unstarted",
            DomainState::NeedsIssuance => "needs-issuance",
            DomainState::HasValidCertificate => "valid",
            DomainState::Renewing => "renewing",
            DomainState::Issued => "issued",
            DomainState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the orchestrator knows about one configured domain
#[derive(Debug)]
pub struct DomainRecord {
    pub domain: String,
    pub key_algorithm: KeyAlgorithm,
    pub state: DomainState,
    pub last_error: Option<IssuanceError>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Certificate chain location
    pub storage_path: PathBuf,
    /// Every state entered during this run, starting with `Unstarted`
    pub transitions: Vec<DomainState>,
}

impl DomainRecord {
    fn new(domain: &str, key_algorithm: KeyAlgorithm, storage_path: PathBuf) -> Self {
        Self {
            domain: domain.to_string(),
            key_algorithm,
            state: DomainState::Unstarted,
            last_error: None,
            not_before: None,
            not_after: None,
            storage_path,
            transitions: vec![DomainState::Unstarted],
        }
    }

    fn transition(&mut self, to: DomainState) {
        debug!(domain = %self.domain, from = %self.state, to = %to, "Domain state change");
        self.state = to;
        self.transitions.push(to);
    }

    fn set_validity(&mut self, cert: &StoredCertificate) {
        self.not_before = Some(cert.not_before);
        self.not_after = Some(cert.expires_at);
    }

    fn fail(&mut self, err: IssuanceError) {
        self.last_error = Some(err);
        self.transition(DomainState::Failed);
    }
}

/// Decides when a stored certificate is due for renewal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalWindow {
    ratio: f64,
}

impl RenewalWindow {
    /// Renew once less than `ratio` of the validity period remains
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Expired certificates always need renewal
    pub fn needs_renewal(&self, cert: &StoredCertificate, now: DateTime<Utc>) -> bool {
        if cert.is_expired(now) {
            return true;
        }
        let lifetime = cert.lifetime().num_seconds().max(0) as f64;
        let remaining = (cert.expires_at - now).num_seconds() as f64;
        remaining < lifetime * self.ratio
    }
}

impl Default for RenewalWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RENEWAL_RATIO)
    }
}

/// Outcome of checking the store for one domain
#[derive(Debug)]
pub enum Classification {
    /// Stored certificate is outside the renewal window
    Valid(StoredCertificate),
    /// Nothing usable is stored; carries the stored certificate if one exists
    NeedsIssuance(Option<StoredCertificate>),
}

/// Final state of every domain after a run
#[derive(Debug, Default)]
pub struct IssuanceReport {
    /// One record per domain, in configuration order
    pub records: Vec<DomainRecord>,
}

impl IssuanceReport {
    pub fn record(&self, domain: &str) -> Option<&DomainRecord> {
        self.records.iter().find(|r| r.domain == domain)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DomainRecord> {
        self.records
            .iter()
            .filter(|r| r.state == DomainState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// `Err` listing every failed domain and its cause
    pub fn into_result(self) -> Result<Self, IssuanceFailure> {
        if self.is_success() {
            return Ok(self);
        }
        let failures = self
            .failed()
            .map(|r| {
                let cause = r
                    .last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown error".to_string());
                (r.domain.clone(), cause)
            })
            .collect();
        Err(IssuanceFailure {
            failures,
            report: self,
        })
    }
}

/// Some domains failed; the others were issued or already valid
#[derive(Debug)]
pub struct IssuanceFailure {
    /// `(domain, cause)` pairs
    pub failures: Vec<(String, String)>,
    pub report: IssuanceReport,
}

impl fmt::Display for IssuanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "certificate issuance failed for {} domain(s)",
            self.failures.len()
        )?;
        for (domain, cause) in &self.failures {
            write!(f, "\n  {}: {}", domain, cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for IssuanceFailure {}

/// Drives issuance for a set of domains
///
/// Cheap to clone; clones share the ACME client, store and challenge registry.
#[derive(Clone)]
pub struct Orchestrator {
    acme: Arc<dyn AcmeProtocol>,
    store: Arc<CertificateStore>,
    challenges: ChallengeRegistry,
    observer: Arc<dyn EventObserver>,
    key_algorithm: KeyAlgorithm,
    renewal: RenewalWindow,
    reuse_private_keys: bool,
    issuance_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        acme: Arc<dyn AcmeProtocol>,
        store: Arc<CertificateStore>,
        challenges: ChallengeRegistry,
    ) -> Self {
        Self {
            acme,
            store,
            challenges,
            observer: Arc::new(TracingObserver),
            key_algorithm: config.key_algorithm,
            renewal: RenewalWindow::new(config.renewal_ratio),
            reuse_private_keys: config.reuse_private_keys,
            issuance_timeout: config.issuance_timeout,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    pub fn observer(&self) -> &Arc<dyn EventObserver> {
        &self.observer
    }

    /// Decide whether `domain` needs a new certificate at `now`
    ///
    /// A corrupt or mismatched stored pair is treated as absent, since
    /// issuance replaces it. I/O and metadata errors are returned: the files
    /// may be intact, and reissuing would spend CA rate limit.
    pub fn classify(&self, domain: &str, now: DateTime<Utc>) -> Result<Classification, StorageError> {
        match self.store.load(domain) {
            Ok(None) => Ok(Classification::NeedsIssuance(None)),
            Ok(Some(cert)) if self.renewal.needs_renewal(&cert, now) => {
                debug!(
                    domain = %domain,
                    expires = %cert.expires_at,
                    "Certificate inside renewal window"
                );
                Ok(Classification::NeedsIssuance(Some(cert)))
            }
            Ok(Some(cert)) => Ok(Classification::Valid(cert)),
            Err(e @ (StorageError::Inconsistent { .. } | StorageError::CertificateParse(_))) => {
                warn!(domain = %domain, error = %e, "Stored certificate unusable, reissuing");
                Ok(Classification::NeedsIssuance(None))
            }
            Err(e) => Err(e),
        }
    }

    /// Bring every domain to a terminal state
    ///
    /// Returns once all domains are `HasValidCertificate`, `Issued` or
    /// `Failed`. Cancelling `shutdown` aborts in-flight exchanges; their
    /// domains end as `Failed` with [`IssuanceError::Cancelled`].
    pub async fn run(&self, domains: &[String], shutdown: &CancellationToken) -> IssuanceReport {
        info!(domain_count = domains.len(), "Checking certificates");

        let mut tasks = JoinSet::new();
        for (index, domain) in domains.iter().enumerate() {
            let this = self.clone();
            let domain = domain.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { (index, this.process_domain(&domain, &shutdown).await) });
        }

        let mut slots: Vec<Option<DomainRecord>> = domains.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, record)) => slots[index] = Some(record),
                Err(e) => error!(error = %e, "Issuance task aborted"),
            }
        }

        let records = slots
            .into_iter()
            .zip(domains)
            .map(|(slot, domain)| {
                slot.unwrap_or_else(|| {
                    let mut record = self.new_record(domain);
                    record.fail(IssuanceError::Task("issuance task panicked".to_string()));
                    record
                })
            })
            .collect();

        let report = IssuanceReport { records };
        info!(
            domain_count = report.records.len(),
            failed = report.failed().count(),
            "Certificate check finished"
        );
        report
    }

    fn new_record(&self, domain: &str) -> DomainRecord {
        DomainRecord::new(
            domain,
            self.key_algorithm,
            self.store.path_for(domain, FileKind::Certificate),
        )
    }

    async fn process_domain(&self, domain: &str, shutdown: &CancellationToken) -> DomainRecord {
        let mut record = self.new_record(domain);

        let existing = match self.classify(domain, Utc::now()) {
            Ok(Classification::Valid(cert)) => {
                record.set_validity(&cert);
                record.transition(DomainState::HasValidCertificate);
                info!(domain = %domain, expires = %cert.expires_at, "Certificate is still valid");
                self.emit(
                    events::CERTIFICATE_VALID,
                    json!({ "domain": domain, "expires": cert.expires_at }),
                );
                return record;
            }
            Ok(Classification::NeedsIssuance(existing)) => existing,
            Err(e) => {
                error!(domain = %domain, error = %e, "Failed to read stored certificate");
                let e = IssuanceError::Storage(e);
                self.emit(
                    events::ISSUANCE_FAILED,
                    json!({ "domain": domain, "error": e.to_string() }),
                );
                record.fail(e);
                return record;
            }
        };

        record.transition(DomainState::NeedsIssuance);
        if let Some(ref cert) = existing {
            record.set_validity(cert);
        }

        record.transition(DomainState::Renewing);
        info!(
            domain = %domain,
            renewal = existing.is_some(),
            "Obtaining certificate"
        );
        self.emit(
            events::ISSUANCE_STARTED,
            json!({ "domain": domain, "renewal": existing.is_some() }),
        );

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(IssuanceError::Cancelled),
            result = tokio::time::timeout(self.issuance_timeout, self.issue(domain, existing.as_ref())) => {
                result.unwrap_or(Err(IssuanceError::Timeout(self.issuance_timeout)))
            }
        };

        match outcome {
            Ok(cert) => {
                record.set_validity(&cert);
                record.transition(DomainState::Issued);
                info!(domain = %domain, expires = %cert.expires_at, "Certificate obtained");
                self.emit(
                    events::CERTIFICATE_OBTAINED,
                    json!({ "domain": domain, "expires": cert.expires_at }),
                );
            }
            Err(e) => {
                error!(domain = %domain, error = %e, "Certificate issuance failed");
                self.emit(
                    events::ISSUANCE_FAILED,
                    json!({ "domain": domain, "error": e.to_string() }),
                );
                record.fail(e);
            }
        }

        record
    }

    /// One complete ACME exchange for `domain`
    ///
    /// Challenge guards live until after the certificate is saved; any early
    /// return or cancellation drops them and deregisters the tokens.
    async fn issue(
        &self,
        domain: &str,
        existing: Option<&StoredCertificate>,
    ) -> Result<StoredCertificate, IssuanceError> {
        let key = self.private_key_for(domain, existing).await?;

        let mut order = self.acme.new_order(&[domain.to_string()]).await?;
        let authorizations = order.authorizations().await?;

        let mut guards = Vec::with_capacity(authorizations.len());
        for authorization in &authorizations {
            match &authorization.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Invalid(reason) => {
                    return Err(AcmeError::ChallengeValidation {
                        domain: authorization.domain.clone(),
                        reason: reason.clone(),
                    }
                    .into());
                }
                AuthorizationStatus::Pending => {}
            }

            let challenge = order.get_challenge(authorization)?;
            guards.push(self.challenges.register(challenge.token.clone()));
            self.emit(
                events::CHALLENGE_REGISTERED,
                json!({ "domain": authorization.domain, "token": challenge.token.token }),
            );

            order.submit_challenge_response(&challenge).await?;

            match order.poll_authorization(authorization).await? {
                AuthorizationStatus::Valid => {
                    debug!(domain = %authorization.domain, "Authorization valid");
                }
                AuthorizationStatus::Invalid(reason) => {
                    return Err(AcmeError::ChallengeValidation {
                        domain: authorization.domain.clone(),
                        reason,
                    }
                    .into());
                }
                AuthorizationStatus::Pending => {
                    return Err(AcmeError::Authorization(format!(
                        "authorization for {} still pending after polling",
                        authorization.domain
                    ))
                    .into());
                }
            }
        }

        let csr = key.certificate_signing_request(domain)?;
        let chain = order.finalize(&csr).await?;

        let cert = StoredCertificate::from_pem(domain, key.pem().to_string(), chain, Utc::now())?;
        self.store.save(domain, &cert)?;

        drop(guards);
        Ok(cert)
    }

    async fn private_key_for(
        &self,
        domain: &str,
        existing: Option<&StoredCertificate>,
    ) -> Result<PrivateKey, IssuanceError> {
        if self.reuse_private_keys {
            if let Some(cert) = existing.filter(|c| !c.is_expired(Utc::now())) {
                match PrivateKey::from_pem(self.key_algorithm, &cert.private_key_pem) {
                    Ok(key) => {
                        debug!(domain = %domain, "Reusing stored private key");
                        return Ok(key);
                    }
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "Stored private key unusable, generating a new one");
                    }
                }
            }
        }

        let algorithm = self.key_algorithm;
        let key = tokio::task::spawn_blocking(move || keys::generate(algorithm))
            .await
            .map_err(|e| IssuanceError::Task(e.to_string()))??;
        Ok(key)
    }

    fn emit(&self, name: &str, data: serde_json::Value) {
        self.observer.on_event(name, &data);
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("key_algorithm", &self.key_algorithm)
            .field("renewal", &self.renewal)
            .field("reuse_private_keys", &self.reuse_private_keys)
            .field("issuance_timeout", &self.issuance_timeout)
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Behaviour, MockAcme, RecordingObserver};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        config: Config,
        store: Arc<CertificateStore>,
        registry: ChallengeRegistry,
        acme: Arc<MockAcme>,
        observer: Arc<RecordingObserver>,
    }

    impl Fixture {
        fn new(domains: &[&str]) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = testing::config(temp_dir.path(), domains);
            let store = Arc::new(CertificateStore::open(temp_dir.path(), &config.ca).unwrap());
            let registry = ChallengeRegistry::new();
            let acme = Arc::new(MockAcme::validating_registry(registry.clone()));
            Self {
                _temp_dir: temp_dir,
                config,
                store,
                registry,
                acme,
                observer: Arc::new(RecordingObserver::default()),
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                &self.config,
                self.acme.clone(),
                self.store.clone(),
                self.registry.clone(),
            )
            .with_observer(self.observer.clone())
        }

        fn store_certificate(&self, domain: &str, from_days: i64, until_days: i64) -> StoredCertificate {
            let (key, chain) = testing::self_signed(domain, from_days, until_days);
            let cert = StoredCertificate::from_pem(domain, key, chain, Utc::now()).unwrap();
            self.store.save(domain, &cert).unwrap();
            cert
        }

        async fn run(&self, orchestrator: &Orchestrator) -> IssuanceReport {
            orchestrator
                .run(&self.config.domains, &CancellationToken::new())
                .await
        }
    }

    #[tokio::test]
    async fn test_fresh_issuance() {
        let fixture = Fixture::new(&["example.com"]);

        let report = fixture.run(&fixture.orchestrator()).await;

        let record = report.record("example.com").unwrap();
        assert_eq!(
            record.transitions,
            vec![
                DomainState::Unstarted,
                DomainState::NeedsIssuance,
                DomainState::Renewing,
                DomainState::Issued,
            ]
        );
        assert!(record.last_error.is_none());

        let stored = fixture.store.load("example.com").unwrap().unwrap();
        assert!(stored.expires_at > Utc::now());
        assert_eq!(record.not_after, Some(stored.expires_at));
        assert_eq!(fixture.registry.pending_count(), 0);
        assert!(report.is_success());

        let events = fixture.observer.names();
        assert!(events.contains(&events::ISSUANCE_STARTED.to_string()));
        assert!(events.contains(&events::CHALLENGE_REGISTERED.to_string()));
        assert!(events.contains(&events::CERTIFICATE_OBTAINED.to_string()));
    }

    #[tokio::test]
    async fn test_valid_certificate_is_not_renewed() {
        let fixture = Fixture::new(&["example.com"]);
        // 89 days remaining of 90
        let cert = fixture.store_certificate("example.com", -1, 89);

        let report = fixture.run(&fixture.orchestrator()).await;

        let record = report.record("example.com").unwrap();
        assert_eq!(
            record.transitions,
            vec![DomainState::Unstarted, DomainState::HasValidCertificate]
        );
        assert_eq!(fixture.acme.orders_created(), 0);
        assert_eq!(fixture.store.load("example.com").unwrap().unwrap(), cert);
    }

    #[tokio::test]
    async fn test_certificate_inside_window_is_renewed() {
        let fixture = Fixture::new(&["example.com"]);
        // 20 days remaining of 90
        let old = fixture.store_certificate("example.com", -70, 20);

        let orchestrator = fixture.orchestrator();
        assert!(matches!(
            orchestrator.classify("example.com", Utc::now()).unwrap(),
            Classification::NeedsIssuance(Some(_))
        ));

        let report = fixture.run(&orchestrator).await;

        assert_eq!(report.record("example.com").unwrap().state, DomainState::Issued);
        let renewed = fixture.store.load("example.com").unwrap().unwrap();
        assert!(renewed.expires_at > old.expires_at);
        assert_ne!(renewed.private_key_pem, old.private_key_pem);
    }

    #[tokio::test]
    async fn test_expired_certificate_is_never_valid() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.store_certificate("example.com", -100, -10);

        assert!(matches!(
            fixture.orchestrator().classify("example.com", Utc::now()).unwrap(),
            Classification::NeedsIssuance(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_store_fails_without_ordering() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.store_certificate("example.com", -1, 89);

        // Reading the key now fails with an I/O error rather than finding it absent
        let key_path = fixture.store.path_for("example.com", FileKind::Key);
        std::fs::remove_file(&key_path).unwrap();
        std::fs::create_dir(&key_path).unwrap();

        let report = fixture.run(&fixture.orchestrator()).await;

        let record = report.record("example.com").unwrap();
        assert_eq!(record.state, DomainState::Failed);
        assert_eq!(record.transitions, vec![DomainState::Unstarted, DomainState::Failed]);
        assert!(matches!(
            record.last_error,
            Some(IssuanceError::Storage(StorageError::Io(_)))
        ));
        assert_eq!(fixture.acme.orders_created(), 0);
        assert!(fixture
            .observer
            .names()
            .contains(&events::ISSUANCE_FAILED.to_string()));
    }

    #[tokio::test]
    async fn test_mismatched_store_is_reissued() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.store_certificate("example.com", -1, 89);
        std::fs::write(fixture.store.path_for("example.com", FileKind::Key), "other key").unwrap();

        let report = fixture.run(&fixture.orchestrator()).await;

        assert_eq!(report.record("example.com").unwrap().state, DomainState::Issued);
        assert_eq!(fixture.acme.orders_created(), 1);
        assert!(fixture.store.load("example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reuse_private_key_on_renewal() {
        let mut fixture = Fixture::new(&["example.com"]);
        fixture.config.reuse_private_keys = true;
        let old = fixture.store_certificate("example.com", -70, 20);

        let report = fixture.run(&fixture.orchestrator()).await;

        assert!(report.is_success());
        let renewed = fixture.store.load("example.com").unwrap().unwrap();
        assert_eq!(renewed.private_key_pem, old.private_key_pem);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_domain() {
        let fixture = Fixture::new(&["a.example.com", "b.example.com"]);
        fixture.acme.set_behaviour("a.example.com", Behaviour::RejectOrder);

        let report = fixture.run(&fixture.orchestrator()).await;

        let a = report.record("a.example.com").unwrap();
        assert_eq!(a.state, DomainState::Failed);
        assert!(matches!(
            a.last_error,
            Some(IssuanceError::Protocol(AcmeError::OrderCreation(_)))
        ));

        let b = report.record("b.example.com").unwrap();
        assert_eq!(b.state, DomainState::Issued);
        assert!(fixture.store.load("b.example.com").unwrap().is_some());
        assert!(fixture.store.load("a.example.com").unwrap().is_none());

        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].0, "a.example.com");
        assert!(failure.to_string().contains("a.example.com"));
        // Successful domains are not rolled back
        assert!(fixture.store.load("b.example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_records_keep_configuration_order() {
        let fixture = Fixture::new(&["c.example.com", "a.example.com", "b.example.com"]);

        let report = fixture.run(&fixture.orchestrator()).await;

        let order: Vec<&str> = report.records.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(order, vec!["c.example.com", "a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn test_invalid_authorization_deregisters_token() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.acme.set_behaviour("example.com", Behaviour::InvalidAuthorization);

        let report = fixture.run(&fixture.orchestrator()).await;

        let record = report.record("example.com").unwrap();
        assert_eq!(record.state, DomainState::Failed);
        assert!(matches!(
            record.last_error,
            Some(IssuanceError::Protocol(AcmeError::ChallengeValidation { .. }))
        ));
        assert_eq!(fixture.registry.pending_count(), 0);
        assert!(fixture
            .observer
            .names()
            .contains(&events::ISSUANCE_FAILED.to_string()));
    }

    #[tokio::test]
    async fn test_rate_limit_is_recorded() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.acme.set_behaviour("example.com", Behaviour::RateLimited);

        let report = fixture.run(&fixture.orchestrator()).await;

        assert!(matches!(
            report.record("example.com").unwrap().last_error,
            Some(IssuanceError::Protocol(AcmeError::RateLimited(_)))
        ));
    }

    #[tokio::test]
    async fn test_timeout_fails_domain_and_cleans_up() {
        let mut fixture = Fixture::new(&["slow.example.com", "fast.example.com"]);
        fixture.config.issuance_timeout = Duration::from_millis(300);
        fixture.acme.set_behaviour("slow.example.com", Behaviour::Hang);

        let report = fixture.run(&fixture.orchestrator()).await;

        let slow = report.record("slow.example.com").unwrap();
        assert_eq!(slow.state, DomainState::Failed);
        assert!(matches!(slow.last_error, Some(IssuanceError::Timeout(_))));
        assert_eq!(
            report.record("fast.example.com").unwrap().state,
            DomainState::Issued
        );
        assert_eq!(fixture.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_exchange() {
        let fixture = Fixture::new(&["example.com"]);
        fixture.acme.set_behaviour("example.com", Behaviour::Hang);

        let shutdown = CancellationToken::new();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                shutdown.cancel();
            })
        };

        let report = fixture
            .orchestrator()
            .run(&fixture.config.domains, &shutdown)
            .await;
        canceller.await.unwrap();

        let record = report.record("example.com").unwrap();
        assert!(matches!(record.last_error, Some(IssuanceError::Cancelled)));
        assert_eq!(fixture.registry.pending_count(), 0);
        assert!(fixture.store.load("example.com").unwrap().is_none());
    }

    #[test]
    fn test_renewal_window() {
        let window = RenewalWindow::default();
        let now = Utc::now();
        let cert = |from_days: i64, until_days: i64| StoredCertificate {
            domain: "example.com".to_string(),
            private_key_pem: String::new(),
            certificate_chain_pem: String::new(),
            issued_at: now,
            not_before: now + chrono::Duration::days(from_days),
            expires_at: now + chrono::Duration::days(until_days),
        };

        assert!(!window.needs_renewal(&cert(-1, 89), now));
        assert!(!window.needs_renewal(&cert(-59, 31), now));
        assert!(window.needs_renewal(&cert(-61, 29), now));
        assert!(window.needs_renewal(&cert(-90, 0), now));
        assert!(window.needs_renewal(&cert(-100, -10), now));
    }

    #[test]
    fn test_domain_state_terminality() {
        assert!(DomainState::Issued.is_terminal());
        assert!(DomainState::Failed.is_terminal());
        assert!(DomainState::HasValidCertificate.is_terminal());
        assert!(!DomainState::Renewing.is_terminal());
        assert!(!DomainState::Unstarted.is_terminal());
    }
}
