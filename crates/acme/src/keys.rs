//! Private key generation and CSR construction
//!
//! Elliptic curve and Ed25519 keys come from `rcgen`. RSA keys are generated
//! with the `rsa` crate because the ring backend of `rcgen` can only load RSA
//! keys, not create them. Every key is kept as PKCS#8 PEM.

use std::fmt;

use rcgen::{CertificateParams, DnType, KeyPair, SignatureAlgorithm};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use sentinel_acme_config::KeyAlgorithm;
use tracing::debug;

use crate::error::KeyError;

/// A PKCS#8 PEM private key tagged with its algorithm
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    pem: String,
}

impl PrivateKey {
    /// Wrap an existing PEM key, checking that it matches `algorithm`
    pub fn from_pem(algorithm: KeyAlgorithm, pem: &str) -> Result<Self, KeyError> {
        let key = Self {
            algorithm,
            pem: pem.to_string(),
        };
        key.signing_key()?;
        Ok(key)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Load the key for signing
    pub fn signing_key(&self) -> Result<KeyPair, KeyError> {
        KeyPair::from_pem_and_sign_algo(&self.pem, signature_algorithm(self.algorithm))
            .map_err(|e| KeyError::InvalidKey(e.to_string()))
    }

    /// Build a DER-encoded certificate signing request for `domain`
    pub fn certificate_signing_request(&self, domain: &str) -> Result<Vec<u8>, KeyError> {
        let key_pair = self.signing_key()?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| KeyError::Csr(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, domain);

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| KeyError::Csr(e.to_string()))?;

        Ok(csr.der().to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .field("pem", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh private key from the OS random source
///
/// RSA generation can take seconds; call this from a blocking context.
pub fn generate(algorithm: KeyAlgorithm) -> Result<PrivateKey, KeyError> {
    let pem = match algorithm.rsa_bits() {
        Some(bits) => generate_rsa(bits)?,
        None => KeyPair::generate_for(signature_algorithm(algorithm))
            .map_err(|e| KeyError::Generation(e.to_string()))?
            .serialize_pem(),
    };

    debug!(algorithm = %algorithm, "Generated private key");

    Ok(PrivateKey { algorithm, pem })
}

fn generate_rsa(bits: usize) -> Result<String, KeyError> {
    let key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    Ok(pem.as_str().to_owned())
}

fn signature_algorithm(algorithm: KeyAlgorithm) -> &'static SignatureAlgorithm {
    match algorithm {
        KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        KeyAlgorithm::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 | KeyAlgorithm::Rsa8192 => {
            &rcgen::PKCS_RSA_SHA256
        }
    }
}
