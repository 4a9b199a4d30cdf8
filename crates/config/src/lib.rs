//! Configuration for the Sentinel ACME certificate manager.
//!
//! The configuration file (`acme.yml`) is parsed into a [`RawConfig`] and then
//! resolved into an immutable [`Config`] value object. Resolution performs
//! every check that must fail before any network activity: key algorithm,
//! CA endpoint, terms agreement, and domain names.
//!
//! # Example
//!
//! ```yaml
//! storage: /var/lib/sentinel-acme
//! key_type: p256
//! email: admin@example.com
//! agreed: true
//! staging: true
//! domains:
//!   - example.com
//!   - www.example.com
//! ```

mod ca;
mod error;
mod key_algorithm;
mod validate;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};
use validator::Validate;

pub use ca::{CaEndpoint, CaEnvironment, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use error::ConfigError;
pub use key_algorithm::KeyAlgorithm;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "acme.yml";

/// Default HTTP-01 challenge listener address
pub const DEFAULT_CHALLENGE_ADDRESS: &str = "0.0.0.0:80";

/// Renew once less than this fraction of the validity period remains
pub const DEFAULT_RENEWAL_RATIO: f64 = 1.0 / 3.0;

/// Upper bound for one domain's complete issuance exchange
pub const DEFAULT_ISSUANCE_TIMEOUT_SECS: u64 = 300;

/// Configuration exactly as written in the file.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Storage root directory
    pub storage: PathBuf,

    /// Key algorithm name (`ed25519`, `p256`, `p384`, `rsa2048`, `rsa4096`, `rsa8192`)
    pub key_type: String,

    /// ACME account contact
    #[serde(default)]
    #[validate(email)]
    pub email: Option<String>,

    /// Agreement to the CA's terms of service
    #[serde(default)]
    pub agreed: bool,

    /// Use the staging CA instead of production
    #[serde(default)]
    pub staging: bool,

    /// Domains to manage, one certificate each
    #[serde(default)]
    #[validate(length(min = 1))]
    pub domains: Vec<String>,

    /// Address for the HTTP-01 challenge listener
    #[serde(default)]
    pub challenge_address: Option<String>,

    /// Fraction of validity below which a certificate is renewed
    #[serde(default)]
    pub renewal_ratio: Option<f64>,

    /// Reuse the stored private key when renewing an unexpired certificate
    #[serde(default)]
    pub reuse_private_keys: bool,

    /// Per-domain issuance deadline in seconds
    #[serde(default)]
    pub issuance_timeout_secs: Option<u64>,
}

/// Resolved configuration passed into the certificate manager.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_root: PathBuf,
    pub key_algorithm: KeyAlgorithm,
    pub contact_email: Option<String>,
    pub agreed_to_terms: bool,
    pub ca: CaEndpoint,
    pub domains: Vec<String>,
    pub challenge_address: SocketAddr,
    pub renewal_ratio: f64,
    pub reuse_private_keys: bool,
    pub issuance_timeout: Duration,
}

impl Config {
    /// Load and resolve a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::resolve(raw)
    }

    /// Validate a raw configuration and turn it into a `Config`
    pub fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let key_algorithm: KeyAlgorithm = raw.key_type.parse()?;

        raw.validate().map_err(|e| {
            if raw.domains.is_empty() {
                ConfigError::NoDomains
            } else {
                ConfigError::Validation(e.to_string())
            }
        })?;

        if !raw.agreed {
            return Err(ConfigError::TermsNotAgreed);
        }

        let ca = CaEndpoint::select(raw.staging)?;
        if raw.staging {
            info!("Using staging endpoint");
        }

        let mut seen = HashSet::new();
        let mut domains = Vec::with_capacity(raw.domains.len());
        for domain in &raw.domains {
            let domain = validate::normalize_domain(domain)?;
            if !seen.insert(domain.clone()) {
                return Err(ConfigError::DuplicateDomain(domain));
            }
            domains.push(domain);
        }

        let address = raw
            .challenge_address
            .as_deref()
            .unwrap_or(DEFAULT_CHALLENGE_ADDRESS);
        let challenge_address: SocketAddr = address
            .parse()
            .map_err(|_| ConfigError::InvalidChallengeAddress(address.to_string()))?;

        let renewal_ratio = raw.renewal_ratio.unwrap_or(DEFAULT_RENEWAL_RATIO);
        if !(renewal_ratio > 0.0 && renewal_ratio < 1.0) {
            return Err(ConfigError::InvalidRenewalRatio(renewal_ratio));
        }

        let issuance_timeout = Duration::from_secs(
            raw.issuance_timeout_secs
                .unwrap_or(DEFAULT_ISSUANCE_TIMEOUT_SECS)
                .max(1),
        );

        let config = Self {
            storage_root: raw.storage,
            key_algorithm,
            contact_email: raw.email.filter(|e| !e.is_empty()),
            agreed_to_terms: raw.agreed,
            ca,
            domains,
            challenge_address,
            renewal_ratio,
            reuse_private_keys: raw.reuse_private_keys,
            issuance_timeout,
        };

        debug!(
            storage = %config.storage_root.display(),
            key_algorithm = %config.key_algorithm,
            ca = %config.ca,
            domain_count = config.domains.len(),
            "Resolved configuration"
        );

        Ok(config)
    }

    /// Directory holding certificates for the active CA
    pub fn certificates_dir(&self) -> PathBuf {
        self.storage_root
            .join("certificates")
            .join(self.ca.namespace())
    }
}
