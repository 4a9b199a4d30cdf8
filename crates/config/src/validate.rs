//! Domain name validation
//!
//! Domain names become directory and file names in certificate storage, so
//! anything that is not a plain DNS hostname is rejected here.

use crate::ConfigError;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Lower-case and validate a configured domain name
pub(crate) fn normalize_domain(domain: &str) -> Result<String, ConfigError> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    let invalid = |reason: &str| ConfigError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    if normalized.is_empty() {
        return Err(invalid("empty name"));
    }
    if normalized.len() > MAX_DOMAIN_LEN {
        return Err(invalid("name longer than 253 characters"));
    }
    if normalized.starts_with('*') {
        return Err(invalid("wildcard names require DNS-01, only HTTP-01 is supported"));
    }

    for label in normalized.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid("only letters, digits and '-' are allowed"));
        }
    }

    Ok(normalized)
}
