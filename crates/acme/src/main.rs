//! Sentinel ACME - Main entry point
//!
//! Obtains and renews TLS certificates for the configured domains.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_acme::{inspect, CertificateStore, FileKind, InstantAcmeClient, Supervisor};
use sentinel_acme_config::{Config, DEFAULT_CONFIG_FILE};

/// Sentinel ACME - automatic TLS certificates over HTTP-01
#[derive(Parser, Debug)]
#[command(name = "sentinel-acme")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "SENTINEL_ACME_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Obtain or renew certificates (default)
    Run {
        /// Print key and certificate of every domain afterwards
        #[arg(long = "display-certificates")]
        display_certificates: bool,

        /// Keep running and re-check periodically
        #[arg(long = "watch")]
        watch: bool,

        /// Hours between checks in watch mode (minimum 1)
        #[arg(long = "interval-hours", default_value_t = 12)]
        interval_hours: u64,
    },
    /// Print where the key and certificate of a domain are stored
    Path {
        domain: String,

        /// Only print the private key path
        #[arg(long = "key")]
        key: bool,

        /// Only print the certificate path
        #[arg(long = "crt")]
        crt: bool,
    },
    /// Print subject and validity of each certificate in a PEM file
    Details {
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        None => run(&cli.config, false, false, 12),
        Some(Commands::Run {
            display_certificates,
            watch,
            interval_hours,
        }) => run(&cli.config, display_certificates, watch, interval_hours),
        Some(Commands::Path { domain, key, crt }) => print_paths(&cli.config, &domain, key, crt),
        Some(Commands::Details { file }) => print_details(&file),
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    info!("Loading configuration from: {}", path.display());
    Config::from_file(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Obtain or renew certificates, optionally staying up in watch mode
fn run(config_path: &Path, display_certificates: bool, watch: bool, interval_hours: u64) -> Result<()> {
    let config = load_config(config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                wait_for_signal().await;
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });

        let store = Supervisor::open_store(&config)?;
        let acme = Arc::new(InstantAcmeClient::new(&config, store.clone()));
        let domains = config.domains.clone();
        let supervisor = Supervisor::new(config, store.clone(), acme);

        if watch {
            let interval = Duration::from_secs(interval_hours.max(1) * 3600);
            supervisor.watch(&shutdown, interval).await?;
        } else {
            let report = supervisor.run(&shutdown).await?;
            for record in &report.records {
                info!(
                    domain = %record.domain,
                    state = %record.state,
                    expires = ?record.not_after,
                    "Certificate status"
                );
            }
            report.into_result()?;
        }

        if display_certificates {
            let stdout = std::io::stdout();
            inspect::display_certificates(&store, &domains, &mut stdout.lock())
                .context("Failed to display certificates")?;
        }

        Ok::<(), anyhow::Error>(())
    })
}

/// Print the storage paths of a domain's key and certificate
///
/// Read-only: the storage directories are not created.
fn print_paths(config_path: &Path, domain: &str, key: bool, crt: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let certificates_dir = config.certificates_dir();
    let domain = domain.trim().to_ascii_lowercase();

    let both = !key && !crt;
    if key || both {
        let path = CertificateStore::file_path(&certificates_dir, &domain, FileKind::Key);
        println!("KEY: {}", path.display());
    }
    if crt || both {
        let path = CertificateStore::file_path(&certificates_dir, &domain, FileKind::Certificate);
        println!("CRT: {}", path.display());
    }
    Ok(())
}

/// Print `CN->notBefore->notAfter` for each certificate in a PEM file
fn print_details(file: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let lines = inspect::certificate_details(&pem)
        .with_context(|| format!("Failed to parse certificates in {}", file.display()))?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
