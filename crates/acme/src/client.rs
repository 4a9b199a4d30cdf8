//! ACME protocol client
//!
//! [`AcmeProtocol`] and [`AcmeOrder`] are the seam between the orchestrator
//! and the ACME wire protocol. [`InstantAcmeClient`] implements them on top of
//! `instant-acme`; tests substitute their own implementation.
//!
//! Polling is the client's job: [`AcmeOrder::poll_authorization`] and
//! [`AcmeOrder::finalize`] return once the CA reaches a final state or the
//! [`PollPolicy`] deadline passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus as AcmeAuthorizationStatus, ChallengeType,
    Identifier, NewAccount, NewOrder, OrderStatus,
};
use sentinel_acme_config::{CaEndpoint, Config};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::challenge::ChallengeToken;
use crate::error::AcmeError;
use crate::storage::CertificateStore;

/// Backoff used while waiting on the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    /// Delay before poll number `attempt` (0-based), doubling up to the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// State of a domain authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid(String),
}

/// Challenge offered by the CA for an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedChallenge {
    pub kind: String,
    pub url: String,
    pub token: String,
}

/// An authorization within an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<OfferedChallenge>,
}

/// An HTTP-01 challenge ready to be served and submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: ChallengeToken,
    /// Challenge URL used to notify the CA
    pub url: String,
}

/// Creates orders against an ACME CA
#[async_trait]
pub trait AcmeProtocol: Send + Sync {
    /// Start a new order for `domains`
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError>;
}

/// One in-flight ACME order
#[async_trait]
pub trait AcmeOrder: Send {
    /// Authorizations the CA requires for this order
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, AcmeError>;

    /// Pick the HTTP-01 challenge of `authorization` and compute its response
    fn get_challenge(&self, authorization: &Authorization) -> Result<Http01Challenge, AcmeError>;

    /// Tell the CA the challenge response is being served
    async fn submit_challenge_response(&mut self, challenge: &Http01Challenge) -> Result<(), AcmeError>;

    /// Wait until `authorization` is no longer pending
    async fn poll_authorization(
        &mut self,
        authorization: &Authorization,
    ) -> Result<AuthorizationStatus, AcmeError>;

    /// Submit the CSR and download the PEM certificate chain
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError>;
}

/// `instant-acme` backed client
///
/// The ACME account is created (or restored from storage) on the first
/// order, so constructing the client performs no network activity.
pub struct InstantAcmeClient {
    ca: CaEndpoint,
    contact_email: Option<String>,
    agreed_to_terms: bool,
    store: Arc<CertificateStore>,
    account: OnceCell<Account>,
    poll: PollPolicy,
}

impl InstantAcmeClient {
    pub fn new(config: &Config, store: Arc<CertificateStore>) -> Self {
        Self {
            ca: config.ca.clone(),
            contact_email: config.contact_email.clone(),
            agreed_to_terms: config.agreed_to_terms,
            store,
            account: OnceCell::new(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        let email = self.contact_email.as_deref();

        if let Some(json) = self.store.load_account_credentials(email)? {
            debug!("Restoring ACME account from saved credentials");
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| AcmeError::Account(format!("corrupt stored credentials: {}", e)))?;
            return Account::from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::Account(e.to_string()));
        }

        info!(
            contact = ?email,
            directory = %self.ca.directory_url(),
            "Creating new ACME account"
        );

        let contact = email.map(|e| format!("mailto:{}", e));
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: self.agreed_to_terms,
            only_return_existing: false,
        };

        let (account, credentials) = Account::create(&new_account, self.ca.directory_url(), None)
            .await
            .map_err(|e| classify(e, AcmeError::Account))?;

        let json = serde_json::to_string(&credentials)
            .map_err(|e| AcmeError::Account(format!("failed to serialize credentials: {}", e)))?;
        self.store.save_account_credentials(email, &json)?;

        info!(account_url = %account.id(), "Created ACME account");
        Ok(account)
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("ca", &self.ca)
            .field("contact_email", &self.contact_email)
            .field("account_ready", &self.account.initialized())
            .field("poll", &self.poll)
            .finish()
    }
}

#[async_trait]
impl AcmeProtocol for InstantAcmeClient {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let primary = domains
            .first()
            .ok_or_else(|| AcmeError::OrderCreation("no domains given".to_string()))?
            .clone();

        let account = self.account().await?;
        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| classify(e, AcmeError::OrderCreation))?;

        debug!(domain = %primary, "Created ACME order");

        Ok(Box::new(InstantAcmeOrder {
            domain: primary,
            order,
            offered: Vec::new(),
            poll: self.poll,
        }))
    }
}

struct InstantAcmeOrder {
    domain: String,
    order: instant_acme::Order,
    offered: Vec<instant_acme::Challenge>,
    poll: PollPolicy,
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, AcmeError> {
        let authorizations = self
            .order
            .authorizations()
            .await
            .map_err(|e| classify(e, AcmeError::Authorization))?;

        let mut result = Vec::with_capacity(authorizations.len());
        for authz in authorizations {
            let status = match authz.status {
                AcmeAuthorizationStatus::Pending => AuthorizationStatus::Pending,
                AcmeAuthorizationStatus::Valid => AuthorizationStatus::Valid,
                other => AuthorizationStatus::Invalid(format!("{:?}", other)),
            };
            let challenges = authz
                .challenges
                .iter()
                .map(|c| OfferedChallenge {
                    kind: format!("{:?}", c.r#type),
                    url: c.url.clone(),
                    token: c.token.clone(),
                })
                .collect();
            self.offered.extend(authz.challenges);

            result.push(Authorization {
                domain: self.domain.clone(),
                status,
                challenges,
            });
        }

        Ok(result)
    }

    fn get_challenge(&self, authorization: &Authorization) -> Result<Http01Challenge, AcmeError> {
        let urls: Vec<&str> = authorization.challenges.iter().map(|c| c.url.as_str()).collect();
        let challenge = self
            .offered
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01 && urls.contains(&c.url.as_str()))
            .ok_or_else(|| AcmeError::NoHttp01Challenge {
                domain: authorization.domain.clone(),
                offered: authorization
                    .challenges
                    .iter()
                    .map(|c| c.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        let key_authorization = self.order.key_authorization(challenge);

        Ok(Http01Challenge {
            token: ChallengeToken {
                domain: authorization.domain.clone(),
                token: challenge.token.clone(),
                key_authorization: key_authorization.as_str().to_string(),
            },
            url: challenge.url.clone(),
        })
    }

    async fn submit_challenge_response(&mut self, challenge: &Http01Challenge) -> Result<(), AcmeError> {
        self.order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| classify(e, AcmeError::Authorization))
    }

    async fn poll_authorization(
        &mut self,
        authorization: &Authorization,
    ) -> Result<AuthorizationStatus, AcmeError> {
        let deadline = Instant::now() + self.poll.timeout;
        let mut attempt = 0;

        loop {
            let state = self
                .order
                .refresh()
                .await
                .map_err(|e| classify(e, AcmeError::Authorization))?;

            trace!(domain = %authorization.domain, status = ?state.status, "Order status");

            match state.status {
                OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => {
                    return Ok(AuthorizationStatus::Valid);
                }
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|e| format!("{:?}", e))
                        .unwrap_or_else(|| "authorization invalid".to_string());
                    return Ok(AuthorizationStatus::Invalid(reason));
                }
                OrderStatus::Pending => {}
            }

            if Instant::now() >= deadline {
                return Err(AcmeError::Timeout(self.poll.timeout));
            }
            tokio::time::sleep(self.poll.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError> {
        if self.order.state().status != OrderStatus::Valid {
            self.order
                .finalize(csr_der)
                .await
                .map_err(|e| classify(e, AcmeError::Finalization))?;
            debug!(domain = %self.domain, "Order finalized, waiting for certificate");
        }

        let deadline = Instant::now() + self.poll.timeout;
        let mut attempt = 0;

        loop {
            match self.order.certificate().await {
                Ok(Some(chain)) => return Ok(chain),
                Ok(None) => {
                    trace!(domain = %self.domain, "Certificate not yet available");
                }
                Err(e) => return Err(classify(e, AcmeError::CertificateDownload)),
            }

            if Instant::now() >= deadline {
                return Err(AcmeError::Timeout(self.poll.timeout));
            }
            tokio::time::sleep(self.poll.delay(attempt)).await;
            attempt += 1;
        }
    }
}

/// RFC 8555 problem type sent when the CA refuses for rate limiting
const RATE_LIMITED_PROBLEM: &str = "urn:ietf:params:acme:error:rateLimited";

/// Map an `instant-acme` error, singling out CA rate limiting
fn classify(err: instant_acme::Error, wrap: fn(String) -> AcmeError) -> AcmeError {
    match &err {
        instant_acme::Error::Api(problem) if problem.r#type.as_deref() == Some(RATE_LIMITED_PROBLEM) => {
            AcmeError::RateLimited(err.to_string())
        }
        _ => wrap(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_delay_backs_off_to_cap() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(100), Duration::from_secs(10));
    }

    fn api_error(problem_type: &str, detail: &str) -> instant_acme::Error {
        let problem: instant_acme::Problem = serde_json::from_value(serde_json::json!({
            "type": problem_type,
            "detail": detail,
            "status": 429,
        }))
        .unwrap();
        instant_acme::Error::Api(problem)
    }

    #[test]
    fn test_rate_limit_is_detected_by_problem_type() {
        let err = classify(
            api_error(RATE_LIMITED_PROBLEM, "too many certificates already issued"),
            AcmeError::OrderCreation,
        );
        assert!(matches!(err, AcmeError::RateLimited(ref m) if m.contains("too many certificates")));
    }

    #[test]
    fn test_rate_limit_wording_in_detail_is_not_a_rate_limit() {
        let err = classify(
            api_error("urn:ietf:params:acme:error:malformed", "see rateLimited docs"),
            AcmeError::OrderCreation,
        );
        assert!(matches!(err, AcmeError::OrderCreation(_)));

        let err = classify(
            instant_acme::Error::Str("rateLimited"),
            AcmeError::Finalization,
        );
        assert!(matches!(err, AcmeError::Finalization(_)));
    }

    #[tokio::test]
    async fn test_client_construction_is_offline() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = crate::testing::config(temp_dir.path(), &["example.com"]);
        let store = Arc::new(CertificateStore::open(temp_dir.path(), &config.ca).unwrap());

        let client = InstantAcmeClient::new(&config, store);
        assert!(!client.account.initialized());
        assert!(format!("{:?}", client).contains("account_ready: false"));
    }
}
