//! Error types for certificate management
//!
//! Errors are split by blast radius:
//!
//! - [`SupervisorError`] stops the whole run (challenge port, storage root)
//! - [`IssuanceError`] is scoped to one domain and ends up on its record
//! - [`AcmeError`], [`KeyError`], [`StorageError`] are the underlying causes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use sentinel_acme_config::ConfigError;
use thiserror::Error;

/// ACME protocol errors, scoped to a single domain's exchange
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("account registration failed: {0}")]
    Account(String),

    #[error("order creation failed: {0}")]
    OrderCreation(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("no HTTP-01 challenge offered for {domain} (offered: {offered})")]
    NoHttp01Challenge { domain: String, offered: String },

    #[error("challenge validation failed for {domain}: {reason}")]
    ChallengeValidation { domain: String, reason: String },

    #[error("order finalization failed: {0}")]
    Finalization(String),

    #[error("certificate download failed: {0}")]
    CertificateDownload(String),

    #[error("rate limited by CA: {0}")]
    RateLimited(String),

    #[error("timed out after {0:?} waiting for the CA")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Key material errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),
}

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid certificate: {0}")]
    CertificateParse(String),

    #[error("stored key and certificate for {domain} do not match their metadata")]
    Inconsistent { domain: String },
}

/// Challenge listener errors
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("failed to bind challenge listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("challenge listener failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single domain ended in `Failed`
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Protocol(#[from] AcmeError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("certificate storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("issuance did not complete within {0:?}")]
    Timeout(Duration),

    #[error("issuance cancelled")]
    Cancelled,

    #[error("issuance task failed: {0}")]
    Task(String),
}

/// Failures that stop the whole run before or during orchestration
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("failed to bind challenge listener on {addr}: {source}")]
    ChallengeBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate storage unavailable at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("challenge listener stopped unexpectedly: {0}")]
    ResponderFailed(String),

    #[error("shutdown requested")]
    Cancelled,
}

impl From<ResponderError> for SupervisorError {
    fn from(err: ResponderError) -> Self {
        match err {
            ResponderError::Bind { addr, source } => SupervisorError::ChallengeBind { addr, source },
            other => SupervisorError::ResponderFailed(other.to_string()),
        }
    }
}
