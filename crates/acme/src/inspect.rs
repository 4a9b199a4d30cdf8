//! Read-only views of stored certificates for the command line

use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use x509_parser::pem::Pem;

use crate::error::StorageError;
use crate::storage::{CertificateStore, FileKind};

/// Print the key and certificate chain of each domain
///
/// Each file is introduced by `=> <file name>` and a blank line. A domain
/// without a stored certificate is an error.
pub fn display_certificates(
    store: &CertificateStore,
    domains: &[String],
    out: &mut impl Write,
) -> Result<(), StorageError> {
    for domain in domains {
        let cert = store.load(domain)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no certificate stored for {}", domain),
            )
        })?;

        display_file(out, &store.path_for(domain, FileKind::Key), &cert.private_key_pem)?;
        display_file(
            out,
            &store.path_for(domain, FileKind::Certificate),
            &cert.certificate_chain_pem,
        )?;
    }
    Ok(())
}

fn display_file(out: &mut impl Write, path: &Path, content: &str) -> io::Result<()> {
    let name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();
    writeln!(out, "=> {}\n", name)?;
    writeln!(out, "{}", content)
}

/// One `CN->notBefore->notAfter` line per certificate in a PEM chain
///
/// Timestamps are RFC 3339 in UTC. A certificate without a common name
/// shows an empty CN.
pub fn certificate_details(chain_pem: &str) -> Result<Vec<String>, StorageError> {
    let mut lines = Vec::new();

    for pem in Pem::iter_from_buffer(chain_pem.as_bytes()) {
        let pem = pem.map_err(|e| StorageError::CertificateParse(format!("invalid PEM: {}", e)))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| StorageError::CertificateParse(format!("invalid X509 certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default();
        let validity = cert.validity();

        lines.push(format!(
            "{}->{}->{}",
            common_name,
            rfc3339(validity.not_before.timestamp())?,
            rfc3339(validity.not_after.timestamp())?,
        ));
    }

    if lines.is_empty() {
        return Err(StorageError::CertificateParse(
            "no certificate found in PEM input".to_string(),
        ));
    }
    Ok(lines)
}

fn rfc3339(timestamp: i64) -> Result<String, StorageError> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| StorageError::CertificateParse(format!("timestamp out of range: {}", timestamp)))
}
