//! HTTP-01 ACME challenge registry
//!
//! Tracks the challenge token that is currently being validated for each
//! domain so the challenge listener can answer
//! `/.well-known/acme-challenge/<token>`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A token being validated for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub domain: String,
    pub token: String,
    /// The response to serve (token + account key thumbprint)
    pub key_authorization: String,
}

/// Registry of in-flight HTTP-01 challenges, keyed by domain
///
/// Cloning shares the same underlying map, so the orchestrator registers
/// tokens on one handle while the listener reads through another.
///
/// # Thread Safety
///
/// Uses `DashMap` for lock-free concurrent access from issuance tasks and
/// request handling tasks.
#[derive(Debug, Clone, Default)]
pub struct ChallengeRegistry {
    challenges: Arc<DashMap<String, ChallengeToken>>,
}

impl ChallengeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge
    ///
    /// Replaces any token previously registered for the same domain. The
    /// returned guard deregisters the token when dropped, so completion,
    /// failure and cancellation all clean up.
    #[must_use = "dropping the guard immediately deregisters the token"]
    pub fn register(&self, challenge: ChallengeToken) -> ChallengeGuard {
        debug!(
            domain = %challenge.domain,
            token = %challenge.token,
            "Registering ACME HTTP-01 challenge"
        );
        let guard = ChallengeGuard {
            registry: self.clone(),
            domain: challenge.domain.clone(),
            token: challenge.token.clone(),
        };
        self.challenges.insert(challenge.domain.clone(), challenge);
        guard
    }

    /// Remove a completed or expired challenge
    ///
    /// Only removes the entry if it still holds `token`, so a late guard
    /// never removes a newer registration for the same domain.
    pub fn deregister(&self, domain: &str, token: &str) {
        if self
            .challenges
            .remove_if(domain, |_, current| current.token == token)
            .is_some()
        {
            debug!(domain = %domain, token = %token, "Removed ACME challenge");
        }
    }

    /// Key authorization for `token` if it is the one registered for `domain`
    pub fn response_for(&self, domain: &str, token: &str) -> Option<String> {
        let result = self
            .challenges
            .get(domain)
            .filter(|c| c.token == token)
            .map(|c| c.key_authorization.clone());
        if result.is_some() {
            trace!(domain = %domain, token = %token, "ACME challenge token found");
        } else {
            trace!(domain = %domain, token = %token, "ACME challenge token not found");
        }
        result
    }

    /// Check if this is an ACME challenge request path
    ///
    /// Returns `Some(token)` if the path matches the challenge prefix,
    /// `None` otherwise.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Whether a challenge is registered for `domain`
    pub fn is_registered(&self, domain: &str) -> bool {
        self.challenges.contains_key(domain)
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Clear all pending challenges
    ///
    /// Called during shutdown.
    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

/// Deregisters its challenge token when dropped
#[derive(Debug)]
pub struct ChallengeGuard {
    registry: ChallengeRegistry,
    domain: String,
    token: String,
}

impl ChallengeGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.domain, &self.token);
    }
}
