//! Authorization-flow state
//!
//! `StateManager` holds short-lived `{nonce -> (server, PKCE verifier)}`
//! entries created when an authorization URL is built and consumed exactly
//! once during the code exchange. Stale entries are swept on insert.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Entries older than this are dropped unconsumed.
const PENDING_TTL: Duration = Duration::from_secs(600);

/// A PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// One pending authorization.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub server: String,
    pub verifier: String,
    created_at: Instant,
}

/// Process-wide pending-authorization registry.
#[derive(Default)]
pub struct StateManager {
    pending: DashMap<String, PendingAuth>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending authorization; returns the nonce to embed as
    /// the OAuth `state` parameter.
    pub fn begin(&self, server: &str, verifier: &str) -> String {
        self.sweep();
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);
        self.pending.insert(
            nonce.clone(),
            PendingAuth {
                server: server.to_string(),
                verifier: verifier.to_string(),
                created_at: Instant::now(),
            },
        );
        nonce
    }

    /// Consume a nonce. Each nonce resolves at most once; a second call
    /// returns `None`.
    pub fn consume(&self, nonce: &str) -> Option<PendingAuth> {
        self.pending
            .remove(nonce)
            .map(|(_, entry)| entry)
            .filter(|entry| entry.created_at.elapsed() < PENDING_TTL)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn sweep(&self) {
        self.pending
            .retain(|_, entry| entry.created_at.elapsed() < PENDING_TTL);
    }
}
