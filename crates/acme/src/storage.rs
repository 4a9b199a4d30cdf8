//! Certificate and account storage for ACME
//!
//! Provides persistent storage for issued certificates and ACME account
//! credentials, namespaced by CA so staging and production never mix.
//!
//! # Directory Structure
//!
//! ```text
//! <storage>/
//! ├── accounts/
//! │   └── acme-v02.api.letsencrypt.org-directory/
//! │       └── admin@example.com/
//! │           └── account.json      # instant-acme credentials (opaque)
//! └── certificates/
//!     └── acme-v02.api.letsencrypt.org-directory/
//!         └── example.com/
//!             ├── example.com.crt   # Certificate chain
//!             ├── example.com.key   # Private key
//!             └── example.com.json  # Metadata (validity, fingerprints)
//! ```
//!
//! The `.crt`/`.key` naming is relied on by external tooling and must not
//! change.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_acme_config::CaEndpoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::StorageError;

/// Attempts made by `load` before reporting a torn read
const LOAD_ATTEMPTS: usize = 5;

/// Pause between torn-read retries
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(5);

const STAGING_MARKER: &str = ".staging-";
const RETIRED_MARKER: &str = ".retired-";

/// Files kept per domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Key,
    Certificate,
    Metadata,
}

impl FileKind {
    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Key => "key",
            FileKind::Certificate => "crt",
            FileKind::Metadata => "json",
        }
    }
}

/// A certificate chain and its private key, as persisted for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub domain: String,
    /// PEM-encoded private key
    pub private_key_pem: String,
    /// PEM-encoded certificate chain, leaf first
    pub certificate_chain_pem: String,
    pub issued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredCertificate {
    /// Build a record from freshly issued PEM data, reading validity from
    /// the leaf certificate
    pub fn from_pem(
        domain: &str,
        private_key_pem: String,
        certificate_chain_pem: String,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let (not_before, expires_at) = parse_validity(&certificate_chain_pem)?;
        Ok(Self {
            domain: domain.to_string(),
            private_key_pem,
            certificate_chain_pem,
            issued_at,
            not_before,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Total validity period
    pub fn lifetime(&self) -> chrono::Duration {
        self.expires_at - self.not_before
    }
}

/// Certificate metadata stored alongside the certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateMeta {
    domain: String,
    issued_at: DateTime<Utc>,
    not_before: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    key_sha256: String,
    crt_sha256: String,
}

/// Result of an expiry cleanup pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Domains whose expired certificate was removed
    pub removed: Vec<String>,
    /// Certificates still valid
    pub kept: usize,
    /// Domains restored from a retired directory after an interrupted save
    pub recovered: Vec<String>,
    /// Leftover staging or retired directories removed
    pub stale_removed: usize,
    /// Entries that could not be inspected or removed, with the reason
    pub failed: Vec<(String, String)>,
}

enum ReadOutcome {
    Missing,
    Torn,
    Complete(StoredCertificate),
}

/// Certificate storage manager
///
/// Filesystem-based storage rooted at the configured storage directory and
/// scoped to one CA endpoint. Distinct domains live in distinct directories,
/// so concurrent operations on different domains need no locking.
#[derive(Debug)]
pub struct CertificateStore {
    storage_root: PathBuf,
    certificates_dir: PathBuf,
    accounts_dir: PathBuf,
}

impl CertificateStore {
    /// Open (and create if needed) the store for `ca` under `storage_root`
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or their
    /// permissions cannot be restricted.
    pub fn open(storage_root: &Path, ca: &CaEndpoint) -> Result<Self, StorageError> {
        let certificates_dir = storage_root.join("certificates").join(ca.namespace());
        let accounts_dir = storage_root.join("accounts").join(ca.namespace());

        fs::create_dir_all(&certificates_dir)?;
        fs::create_dir_all(&accounts_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(&certificates_dir, perms.clone())?;
            fs::set_permissions(&accounts_dir, perms)?;
        }

        info!(
            storage_path = %storage_root.display(),
            namespace = %ca.namespace(),
            "Initialized ACME certificate storage"
        );

        Ok(Self {
            storage_root: storage_root.to_path_buf(),
            certificates_dir,
            accounts_dir,
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Directory holding every domain for the active CA
    pub fn certificates_dir(&self) -> &Path {
        &self.certificates_dir
    }

    /// `<storage>/certificates/<ca-host>-directory/<domain>/<domain>.<ext>`
    pub fn path_for(&self, domain: &str, kind: FileKind) -> PathBuf {
        Self::file_path(&self.certificates_dir, domain, kind)
    }

    /// Same layout as [`Self::path_for`] without opening the store
    ///
    /// Nothing is created on disk.
    pub fn file_path(certificates_dir: &Path, domain: &str, kind: FileKind) -> PathBuf {
        certificates_dir
            .join(domain)
            .join(format!("{}.{}", domain, kind.extension()))
    }

    fn domain_dir(&self, domain: &str) -> PathBuf {
        self.certificates_dir.join(domain)
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Load the stored certificate for a domain
    ///
    /// `Ok(None)` means no certificate is stored, which is the normal state
    /// before first issuance.
    pub fn load(&self, domain: &str) -> Result<Option<StoredCertificate>, StorageError> {
        for attempt in 1..=LOAD_ATTEMPTS {
            match self.read_once(domain)? {
                ReadOutcome::Missing => {
                    trace!(domain = %domain, "No stored certificate found");
                    return Ok(None);
                }
                ReadOutcome::Complete(cert) => {
                    debug!(
                        domain = %domain,
                        expires = %cert.expires_at,
                        "Loaded stored certificate"
                    );
                    return Ok(Some(cert));
                }
                ReadOutcome::Torn => {
                    trace!(domain = %domain, attempt, "Certificate changed while reading, retrying");
                    std::thread::sleep(LOAD_RETRY_DELAY);
                }
            }
        }

        Err(StorageError::Inconsistent {
            domain: domain.to_string(),
        })
    }

    fn read_once(&self, domain: &str) -> Result<ReadOutcome, StorageError> {
        let Some(certificate_chain_pem) =
            read_optional(&self.path_for(domain, FileKind::Certificate))?
        else {
            return Ok(ReadOutcome::Missing);
        };
        let Some(private_key_pem) = read_optional(&self.path_for(domain, FileKind::Key))? else {
            return Ok(ReadOutcome::Torn);
        };

        let cert = match read_optional(&self.path_for(domain, FileKind::Metadata))? {
            Some(content) => {
                let meta: CertificateMeta = serde_json::from_str(&content)?;
                if meta.key_sha256 != fingerprint(&private_key_pem)
                    || meta.crt_sha256 != fingerprint(&certificate_chain_pem)
                {
                    return Ok(ReadOutcome::Torn);
                }
                StoredCertificate {
                    domain: domain.to_string(),
                    private_key_pem,
                    certificate_chain_pem,
                    issued_at: meta.issued_at,
                    not_before: meta.not_before,
                    expires_at: meta.expires_at,
                }
            }
            // Placed by hand, without metadata
            None => {
                let (not_before, expires_at) = parse_validity(&certificate_chain_pem)?;
                StoredCertificate {
                    domain: domain.to_string(),
                    private_key_pem,
                    certificate_chain_pem,
                    issued_at: not_before,
                    not_before,
                    expires_at,
                }
            }
        };

        Ok(ReadOutcome::Complete(cert))
    }

    /// Save a certificate for a domain
    ///
    /// Key, chain and metadata are written into a hidden staging directory
    /// which then replaces the live directory by rename. Readers observe the
    /// previous pair, the new pair, or nothing; never a mix.
    pub fn save(&self, domain: &str, cert: &StoredCertificate) -> Result<(), StorageError> {
        fs::create_dir_all(&self.certificates_dir)?;

        let live = self.domain_dir(domain);
        let staging = self.certificates_dir.join(format!(
            ".{}{}{}",
            domain,
            STAGING_MARKER,
            Uuid::new_v4().simple()
        ));

        if let Err(e) = self.write_staging(&staging, domain, cert) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let retired = if live.exists() {
            let retired = self.certificates_dir.join(format!(
                ".{}{}{}",
                domain,
                RETIRED_MARKER,
                Uuid::new_v4().simple()
            ));
            if let Err(e) = fs::rename(&live, &retired) {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
            Some(retired)
        } else {
            None
        };

        if let Err(e) = fs::rename(&staging, &live) {
            if let Some(ref retired) = retired {
                let _ = fs::rename(retired, &live);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        if let Some(retired) = retired {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!(
                    domain = %domain,
                    path = %retired.display(),
                    error = %e,
                    "Failed to remove replaced certificate directory"
                );
            }
        }

        sync_dir(&self.certificates_dir);

        info!(
            domain = %domain,
            expires = %cert.expires_at,
            "Saved certificate to storage"
        );

        Ok(())
    }

    fn write_staging(
        &self,
        staging: &Path,
        domain: &str,
        cert: &StoredCertificate,
    ) -> Result<(), StorageError> {
        fs::create_dir(staging)?;

        let meta = CertificateMeta {
            domain: domain.to_string(),
            issued_at: cert.issued_at,
            not_before: cert.not_before,
            expires_at: cert.expires_at,
            key_sha256: fingerprint(&cert.private_key_pem),
            crt_sha256: fingerprint(&cert.certificate_chain_pem),
        };

        let file = |kind: FileKind| staging.join(format!("{}.{}", domain, kind.extension()));

        write_synced(&file(FileKind::Key), cert.private_key_pem.as_bytes(), true)?;
        write_synced(
            &file(FileKind::Certificate),
            cert.certificate_chain_pem.as_bytes(),
            false,
        )?;
        write_synced(
            &file(FileKind::Metadata),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
            false,
        )?;

        Ok(())
    }

    /// List all stored domains for the active CA
    pub fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        if !self.certificates_dir.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.certificates_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        domains.push(name.to_string());
                    }
                }
            }
        }

        domains.sort();
        Ok(domains)
    }

    /// Remove certificates that expired before `now`
    ///
    /// Only the active CA's namespace is scanned. Directories left behind by
    /// an interrupted `save` are swept first, see [`Self::recover_interrupted_saves`].
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<CleanupSummary, StorageError> {
        let mut summary = CleanupSummary::default();

        if !self.certificates_dir.exists() {
            return Ok(summary);
        }

        self.recover_interrupted_saves(&mut summary)?;

        for entry in fs::read_dir(&self.certificates_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();

            match self.expiry_of(&name) {
                Ok(Some(expires)) if expires < now => match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(domain = %name, expired = %expires, "Removed expired certificate");
                        summary.removed.push(name);
                    }
                    Err(e) => {
                        warn!(domain = %name, error = %e, "Failed to remove expired certificate");
                        summary.failed.push((name, e.to_string()));
                    }
                },
                Ok(Some(_)) => summary.kept += 1,
                Ok(None) => trace!(domain = %name, "No certificate in domain directory"),
                Err(e) => {
                    warn!(domain = %name, error = %e, "Failed to inspect stored certificate");
                    summary.failed.push((name, e.to_string()));
                }
            }
        }

        debug!(
            removed = summary.removed.len(),
            kept = summary.kept,
            recovered = summary.recovered.len(),
            stale_removed = summary.stale_removed,
            failed = summary.failed.len(),
            "Storage cleanup finished"
        );

        Ok(summary)
    }

    /// Sweep staging and retired directories left by an interrupted `save`
    ///
    /// A retired directory whose domain has no live directory holds the only
    /// copy of the previous certificate (the process stopped between the two
    /// renames), so it is renamed back into place. All other leftovers are
    /// removed.
    fn recover_interrupted_saves(&self, summary: &mut CleanupSummary) -> Result<(), StorageError> {
        let mut retired = Vec::new();
        let mut staging = Vec::new();

        for entry in fs::read_dir(&self.certificates_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(domain) = leftover_domain(&name, RETIRED_MARKER) {
                retired.push((domain.to_string(), entry.path()));
            } else if leftover_domain(&name, STAGING_MARKER).is_some() {
                staging.push(entry.path());
            }
        }

        for (domain, path) in retired {
            let live = self.domain_dir(&domain);
            if !live.exists() {
                match fs::rename(&path, &live) {
                    Ok(()) => {
                        warn!(domain = %domain, "Recovered certificate from interrupted save");
                        summary.recovered.push(domain);
                    }
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "Failed to recover certificate from interrupted save");
                        summary.failed.push((domain, e.to_string()));
                    }
                }
                continue;
            }
            remove_leftover(&path, summary);
        }

        for path in staging {
            remove_leftover(&path, summary);
        }

        if !summary.recovered.is_empty() {
            sync_dir(&self.certificates_dir);
        }
        Ok(())
    }

    fn expiry_of(&self, domain: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        if let Some(content) = read_optional(&self.path_for(domain, FileKind::Metadata))? {
            let meta: CertificateMeta = serde_json::from_str(&content)?;
            return Ok(Some(meta.expires_at));
        }
        match read_optional(&self.path_for(domain, FileKind::Certificate))? {
            Some(chain) => Ok(Some(parse_validity(&chain)?.1)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    fn account_path(&self, email: Option<&str>) -> PathBuf {
        let owner: String = email
            .unwrap_or("default")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_' | '+') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let owner = if owner.starts_with('.') {
            format!("_{}", owner)
        } else {
            owner
        };
        self.accounts_dir.join(owner).join("account.json")
    }

    /// Load raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn load_account_credentials(&self, email: Option<&str>) -> Result<Option<String>, StorageError> {
        let path = self.account_path(email);
        let content = read_optional(&path)?;
        if content.is_some() {
            debug!(contact = ?email, "Loaded ACME credentials JSON");
        } else {
            trace!(contact = ?email, "No stored ACME credentials found");
        }
        Ok(content)
    }

    /// Save raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn save_account_credentials(&self, email: Option<&str>, json: &str) -> Result<(), StorageError> {
        let path = self.account_path(email);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.accounts_dir.clone());
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!(".account.json{}{}", STAGING_MARKER, Uuid::new_v4().simple()));
        if let Err(e) = write_synced(&tmp, json.as_bytes(), true).and_then(|()| {
            fs::rename(&tmp, &path).map_err(StorageError::from)
        }) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        info!(contact = ?email, "Saved ACME credentials JSON");
        Ok(())
    }
}

/// Read the validity window of the first certificate in a PEM chain
pub fn parse_validity(chain_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), StorageError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| StorageError::CertificateParse(format!("invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| StorageError::CertificateParse(format!("invalid X509 certificate: {}", e)))?;

    let validity = cert.validity();
    let to_utc = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| StorageError::CertificateParse(format!("timestamp out of range: {}", ts)))
    };

    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}

/// Domain of a hidden `.<domain><marker><uuid>` directory
fn leftover_domain<'a>(name: &'a str, marker: &str) -> Option<&'a str> {
    let (domain, _) = name.strip_prefix('.')?.rsplit_once(marker)?;
    (!domain.is_empty()).then_some(domain)
}

fn remove_leftover(path: &Path, summary: &mut CleanupSummary) {
    match fs::remove_dir_all(path) {
        Ok(()) => summary.stale_removed += 1,
        Err(e) => summary
            .failed
            .push((path.display().to_string(), e.to_string())),
    }
}

fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_synced(path: &Path, content: &[u8], private: bool) -> Result<(), StorageError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

/// Persist directory entries after renames
#[cfg(unix)]
fn sync_dir(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) {}
