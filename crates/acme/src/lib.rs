//! Sentinel ACME Library
//!
//! Automatic TLS certificate issuance and renewal against an ACME CA
//! (Let's Encrypt by default) using HTTP-01 challenges.
//!
//! This library provides:
//!
//! - **Key Material**: Ed25519, ECDSA and RSA private keys plus CSRs
//! - **Certificate Store**: Atomic per-domain key/chain persistence
//! - **Challenge Responder**: Embedded HTTP-01 listener
//! - **Issuance Orchestrator**: Concurrent per-domain state machine
//! - **Lifecycle Supervisor**: Cleanup, listener ownership, watch mode
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sentinel_acme::{InstantAcmeClient, Supervisor};
//! use sentinel_acme_config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_file("acme.yml")?;
//! let store = Supervisor::open_store(&config)?;
//! let acme = Arc::new(InstantAcmeClient::new(&config, store.clone()));
//!
//! let report = Supervisor::new(config, store, acme)
//!     .run(&CancellationToken::new())
//!     .await?;
//! report.into_result()?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod challenge;
pub mod client;
pub mod error;
pub mod events;
pub mod inspect;
pub mod keys;
pub mod orchestrator;
pub mod responder;
pub mod scheduler;
pub mod storage;
pub mod supervisor;

#[cfg(test)]
mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{AcmeError, IssuanceError, KeyError, ResponderError, StorageError, SupervisorError};

// Key material
pub use keys::PrivateKey;

// Storage
pub use storage::{CertificateStore, CleanupSummary, FileKind, StoredCertificate};

// Challenges
pub use challenge::{ChallengeGuard, ChallengeRegistry, ChallengeToken};
pub use responder::ChallengeResponder;

// ACME protocol
pub use client::{AcmeOrder, AcmeProtocol, InstantAcmeClient, PollPolicy};

// Orchestration
pub use orchestrator::{
    DomainRecord, DomainState, IssuanceFailure, IssuanceReport, Orchestrator, RenewalWindow,
};

// Lifecycle
pub use scheduler::RenewalScheduler;
pub use supervisor::Supervisor;

// Events
pub use events::{EventObserver, NoopObserver, TracingObserver};
