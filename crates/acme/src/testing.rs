//! Shared test fixtures: throwaway certificates, a scripted ACME CA and a
//! minimal HTTP client for exercising the challenge listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use sentinel_acme_config::{Config, RawConfig};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::challenge::{ChallengeRegistry, ChallengeToken, ACME_CHALLENGE_PREFIX};
use crate::client::{
    AcmeOrder, AcmeProtocol, Authorization, AuthorizationStatus, Http01Challenge, OfferedChallenge,
};
use crate::error::AcmeError;
use crate::events::EventObserver;

/// Self-signed P-256 certificate valid from `from_days` to `until_days`
/// relative to today (midnight UTC). Returns `(key_pem, chain_pem)`.
pub fn self_signed(domain: &str, from_days: i64, until_days: i64) -> (String, String) {
    let key = KeyPair::generate().unwrap();

    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, domain);
    let day = |offset: i64| {
        let date = (Utc::now() + chrono::Duration::days(offset)).date_naive();
        rcgen::date_time_ymd(date.year(), date.month() as u8, date.day() as u8)
    };
    params.not_before = day(from_days);
    params.not_after = day(until_days);

    let cert = params.self_signed(&key).unwrap();
    (key.serialize_pem(), cert.pem())
}

/// Resolved configuration against the staging CA with an ephemeral
/// challenge port
pub fn config(storage: &Path, domains: &[&str]) -> Config {
    Config::resolve(RawConfig {
        storage: storage.to_path_buf(),
        key_type: "p256".to_string(),
        email: Some("admin@example.com".to_string()),
        agreed: true,
        staging: true,
        domains: domains.iter().map(|d| d.to_string()).collect(),
        challenge_address: Some("127.0.0.1:0".to_string()),
        ..Default::default()
    })
    .unwrap()
}

/// An address on localhost that nothing is listening on right now
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Plain HTTP/1.1 GET; returns status code and body
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    (status, body.to_string())
}

/// How the scripted CA treats a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Validate the challenge and issue a 90-day certificate
    Issue,
    /// Refuse to create the order
    RejectOrder,
    /// Mark the authorization invalid after the response is submitted
    InvalidAuthorization,
    /// Answer the order request with a rate-limit error
    RateLimited,
    /// Never finish validating
    Hang,
}

/// Where the scripted CA looks for challenge responses
#[derive(Debug, Clone)]
pub enum Validator {
    /// Read the registry directly
    Registry(ChallengeRegistry),
    /// Fetch the response over HTTP from the challenge listener
    Http(SocketAddr),
}

/// Scripted ACME CA
#[derive(Debug)]
pub struct MockAcme {
    validator: Validator,
    behaviours: Mutex<HashMap<String, Behaviour>>,
    orders: AtomicUsize,
}

impl MockAcme {
    pub fn new(validator: Validator) -> Self {
        Self {
            validator,
            behaviours: Mutex::new(HashMap::new()),
            orders: AtomicUsize::new(0),
        }
    }

    pub fn validating_registry(registry: ChallengeRegistry) -> Self {
        Self::new(Validator::Registry(registry))
    }

    pub fn validating_http(addr: SocketAddr) -> Self {
        Self::new(Validator::Http(addr))
    }

    pub fn set_behaviour(&self, domain: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(domain.to_string(), behaviour);
    }

    pub fn orders_created(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcmeProtocol for MockAcme {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        self.orders.fetch_add(1, Ordering::SeqCst);

        let domain = domains[0].clone();
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&domain)
            .copied()
            .unwrap_or(Behaviour::Issue);

        match behaviour {
            Behaviour::RejectOrder => Err(AcmeError::OrderCreation(format!(
                "urn:ietf:params:acme:error:rejectedIdentifier: {}",
                domain
            ))),
            Behaviour::RateLimited => Err(AcmeError::RateLimited(
                "urn:ietf:params:acme:error:rateLimited".to_string(),
            )),
            _ => Ok(Box::new(MockOrder {
                token: format!("token-{}", uuid::Uuid::new_v4().simple()),
                domain,
                behaviour,
                validator: self.validator.clone(),
            })),
        }
    }
}

struct MockOrder {
    domain: String,
    token: String,
    behaviour: Behaviour,
    validator: Validator,
}

impl MockOrder {
    fn key_authorization(&self) -> String {
        format!("{}.mock-thumbprint", self.token)
    }

    async fn validate(&self) -> bool {
        let expected = self.key_authorization();
        match &self.validator {
            Validator::Registry(registry) => {
                registry.response_for(&self.domain, &self.token) == Some(expected)
            }
            Validator::Http(addr) => {
                let path = format!("{}{}", ACME_CHALLENGE_PREFIX, self.token);
                let (status, body) = http_get(*addr, &self.domain, &path).await;
                status == 200 && body == expected
            }
        }
    }
}

#[async_trait]
impl AcmeOrder for MockOrder {
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, AcmeError> {
        Ok(vec![Authorization {
            domain: self.domain.clone(),
            status: AuthorizationStatus::Pending,
            challenges: vec![OfferedChallenge {
                kind: "Http01".to_string(),
                url: format!("https://ca.test/chall/{}", self.token),
                token: self.token.clone(),
            }],
        }])
    }

    fn get_challenge(&self, authorization: &Authorization) -> Result<Http01Challenge, AcmeError> {
        let offered = &authorization.challenges[0];
        Ok(Http01Challenge {
            token: ChallengeToken {
                domain: authorization.domain.clone(),
                token: offered.token.clone(),
                key_authorization: self.key_authorization(),
            },
            url: offered.url.clone(),
        })
    }

    async fn submit_challenge_response(&mut self, _challenge: &Http01Challenge) -> Result<(), AcmeError> {
        Ok(())
    }

    async fn poll_authorization(
        &mut self,
        _authorization: &Authorization,
    ) -> Result<AuthorizationStatus, AcmeError> {
        match self.behaviour {
            Behaviour::Hang => std::future::pending().await,
            Behaviour::InvalidAuthorization => {
                Ok(AuthorizationStatus::Invalid("mock CA rejected the response".to_string()))
            }
            _ if self.validate().await => Ok(AuthorizationStatus::Valid),
            _ => Ok(AuthorizationStatus::Invalid(
                "challenge response did not match".to_string(),
            )),
        }
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError> {
        if csr_der.is_empty() {
            return Err(AcmeError::Finalization("empty CSR".to_string()));
        }
        let (_, chain) = self_signed(&self.domain, -1, 89);
        Ok(chain)
    }
}

/// Records every event name it receives
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingObserver {
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, name: &str, data: &Value) {
        self.events
            .lock()
            .unwrap()
            .push((name.to_string(), data.clone()));
    }
}
