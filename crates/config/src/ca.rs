//! ACME certificate authority endpoints.

use std::fmt;

use url::Url;

use crate::ConfigError;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Which CA environment is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaEnvironment {
    Production,
    Staging,
}

impl fmt::Display for CaEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaEnvironment::Production => f.write_str("production"),
            CaEnvironment::Staging => f.write_str("staging"),
        }
    }
}

/// The single CA directory used for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaEndpoint {
    directory_url: Url,
    environment: CaEnvironment,
}

impl CaEndpoint {
    /// Build an endpoint from a directory URL.
    ///
    /// The URL must be absolute and carry a host, since the host names the
    /// on-disk storage namespace.
    pub fn new(directory_url: &str, environment: CaEnvironment) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCaUrl {
            url: directory_url.to_string(),
            reason,
        };

        let url = Url::parse(directory_url).map_err(|e| invalid(e.to_string()))?;
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("URL has no host".to_string())),
        }

        Ok(Self {
            directory_url: url,
            environment,
        })
    }

    /// Production unless staging is explicitly requested
    pub fn select(use_staging: bool) -> Result<Self, ConfigError> {
        if use_staging {
            Self::new(LETS_ENCRYPT_STAGING, CaEnvironment::Staging)
        } else {
            Self::new(LETS_ENCRYPT_PRODUCTION, CaEnvironment::Production)
        }
    }

    pub fn directory_url(&self) -> &str {
        self.directory_url.as_str()
    }

    pub fn environment(&self) -> CaEnvironment {
        self.environment
    }

    /// Hostname of the directory URL
    pub fn host(&self) -> &str {
        // Checked in `new`
        self.directory_url.host_str().unwrap_or_default()
    }

    /// Storage namespace directory name, `<host>-directory`
    pub fn namespace(&self) -> String {
        format!("{}-directory", self.host())
    }
}

impl fmt::Display for CaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.directory_url, self.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_is_default_selection() {
        let ca = CaEndpoint::select(false).unwrap();
        assert_eq!(ca.environment(), CaEnvironment::Production);
        assert_eq!(ca.host(), "acme-v02.api.letsencrypt.org");
        assert_eq!(ca.namespace(), "acme-v02.api.letsencrypt.org-directory");
    }

    #[test]
    fn test_staging_selection() {
        let ca = CaEndpoint::select(true).unwrap();
        assert_eq!(ca.environment(), CaEnvironment::Staging);
        assert_eq!(ca.namespace(), "acme-staging-v02.api.letsencrypt.org-directory");
    }

    #[test]
    fn test_malformed_url_rejected() {
        assert!(matches!(
            CaEndpoint::new("not a url", CaEnvironment::Production),
            Err(ConfigError::InvalidCaUrl { .. })
        ));
        assert!(matches!(
            CaEndpoint::new("file:///tmp/directory", CaEnvironment::Staging),
            Err(ConfigError::InvalidCaUrl { .. })
        ));
    }
}
