//! Private key algorithm selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Key algorithm used for every certificate managed by one process.
///
/// The set is closed: a value that does not parse into one of these
/// variants is rejected when the configuration is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyAlgorithm {
    Ed25519,
    #[default]
    P256,
    P384,
    Rsa2048,
    Rsa4096,
    Rsa8192,
}

impl KeyAlgorithm {
    /// All supported algorithms
    pub const ALL: [KeyAlgorithm; 6] = [
        KeyAlgorithm::Ed25519,
        KeyAlgorithm::P256,
        KeyAlgorithm::P384,
        KeyAlgorithm::Rsa2048,
        KeyAlgorithm::Rsa4096,
        KeyAlgorithm::Rsa8192,
    ];

    /// Canonical configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::P256 => "p256",
            KeyAlgorithm::P384 => "p384",
            KeyAlgorithm::Rsa2048 => "rsa2048",
            KeyAlgorithm::Rsa4096 => "rsa4096",
            KeyAlgorithm::Rsa8192 => "rsa8192",
        }
    }

    /// RSA modulus size in bits, `None` for non-RSA algorithms
    pub fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyAlgorithm::Rsa2048 => Some(2048),
            KeyAlgorithm::Rsa4096 => Some(4096),
            KeyAlgorithm::Rsa8192 => Some(8192),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ConfigError;

    /// Accepts the canonical names case-insensitively, with or without a
    /// hyphen (`P-256`, `rsa-4096`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        KeyAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnsupportedKeyAlgorithm(s.to_string()))
    }
}

impl TryFrom<String> for KeyAlgorithm {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyAlgorithm> for String {
    fn from(value: KeyAlgorithm) -> Self {
        value.as_str().to_string()
    }
}
