//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a signed-kind datagram from an address with no known key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPeerPolicy {
    /// Process it unverified and log that it was not authenticated.
    #[default]
    AcceptUnverified,
    /// Process unverified `Hello`/`HelloReply` only; drop other signed kinds.
    HandshakeOnly,
    /// Drop it.
    Reject,
}

/// Configuration for the send engine and session tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name announced in Hello and HelloReply.
    pub local_name: String,
    /// Transmissions of a reply-expecting datagram before giving up.
    pub max_attempts: u32,
    /// Wait after the first transmission.
    pub initial_backoff: Duration,
    /// Multiplier applied to the wait after each further transmission.
    pub backoff_factor: u32,
    /// How long a handshake stays valid, in either direction.
    pub session_validity: Duration,
    /// Receive buffer size; longer datagrams are truncated.
    pub recv_buffer_size: usize,
    pub unknown_peer_policy: UnknownPeerPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_name: "meshtree".into(),
            max_attempts: 4,
            initial_backoff: Duration::from_secs(2),
            backoff_factor: 2,
            session_validity: Duration::from_secs(55 * 60),
            recv_buffer_size: 65_536,
            unknown_peer_policy: UnknownPeerPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = name.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, factor: u32) -> Self {
        self.initial_backoff = initial;
        self.backoff_factor = factor;
        self
    }

    pub fn with_session_validity(mut self, validity: Duration) -> Self {
        self.session_validity = validity;
        self
    }

    pub fn with_unknown_peer_policy(mut self, policy: UnknownPeerPolicy) -> Self {
        self.unknown_peer_policy = policy;
        self
    }

    /// Wait after the transmission with 0-based index `attempt`:
    /// `initial_backoff * backoff_factor^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor)
    }

    /// Sum of all waits when no reply ever arrives.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_attempts).map(|i| self.backoff(i)).sum()
    }
}
