//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or resolving configuration.
///
/// Every variant is fatal: nothing that talks to the network may run
/// with a configuration that failed to resolve.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported key_type: {0}")]
    UnsupportedKeyAlgorithm(String),

    #[error("invalid CA directory URL '{url}': {reason}")]
    InvalidCaUrl { url: String, reason: String },

    #[error("the CA terms of service must be agreed to (set `agreed: true`)")]
    TermsNotAgreed,

    #[error("no domains configured")]
    NoDomains,

    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("domain '{0}' is configured more than once")]
    DuplicateDomain(String),

    #[error("invalid challenge_address '{0}'")]
    InvalidChallengeAddress(String),

    #[error("renewal_ratio must be between 0 and 1 (exclusive), got {0}")]
    InvalidRenewalRatio(f64),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
