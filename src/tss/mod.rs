// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # TSS Module
//!
//! The distributed MPC session coordinator and the ceremonies it drives:
//! threshold key generation, key refresh and signing.

/// The ceremony seam: the `TssProcess` trait driven by the coordinator and
/// the `ThresholdScheme` trait hiding the cryptographic rounds.
pub mod ceremony;
/// The session coordinator.
pub mod coordinator;
/// FROST-backed threshold scheme.
pub mod frost;
/// The key generation ceremony.
pub mod keygen;
/// The key refresh ceremony.
pub mod refresh;
/// The signing ceremony.
pub mod signing;

pub use coordinator::{Coordinator, SessionResult};

use serde::{Deserialize, Serialize};

/// A string uniquely identifying one ceremony across the committee.
///
/// Format: `<kind>-<discriminator>` where the discriminator is a content
/// hash: the proposal hash for signing sessions, the emitting block hash and
/// event index for keygen and refresh sessions. Retried sessions append
/// `-retry-<attempt>` so all peers derive the same id without extra
/// messaging.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SessionId(String);

impl SessionId {
    /// The id of the signing session for a proposal hash.
    pub fn signing(proposal_hash: &[u8; 32]) -> Self {
        Self(format!("signing-{}", hex::encode(proposal_hash)))
    }

    /// The id of the keygen session started by the event at `log_index` of
    /// the block with `block_hash`.
    pub fn keygen(block_hash: &[u8; 32], log_index: u64) -> Self {
        Self(format!("keygen-{}-{}", hex::encode(block_hash), log_index))
    }

    /// The id of the refresh session started by the event at `log_index` of
    /// the block with `block_hash`.
    pub fn refresh(block_hash: &[u8; 32], log_index: u64) -> Self {
        Self(format!("refresh-{}-{}", hex::encode(block_hash), log_index))
    }

    /// The derived id of the `attempt`-th retry of this session. Attempts
    /// start at 1.
    pub fn retried(&self, attempt: u32) -> Self {
        Self(format!("{}-retry-{}", self.0, attempt))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as bytes, used in the session hash of the elector ordering.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kind of ceremony a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Threshold key generation.
    Keygen,
    /// Key refresh on a (possibly changed) committee.
    Refresh,
    /// Threshold signing of a proposal hash.
    Signing,
}

/// The lifecycle state of a session.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; a session with the
/// same id may only be re-started after the prior instance reached one of
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not yet running a ceremony attempt.
    Pending,
    /// A ceremony attempt is in flight.
    Running,
    /// The ceremony produced its output.
    Completed,
    /// The ceremony failed beyond retry.
    Failed,
    /// The session was cancelled from the outside.
    Cancelled,
}

impl SessionState {
    /// Whether this state ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_canonical() {
        let hash = [0xabu8; 32];
        let id = SessionId::signing(&hash);
        assert_eq!(
            id.as_str(),
            format!("signing-{}", hex::encode([0xabu8; 32]))
        );
        assert_eq!(
            id.retried(1).as_str(),
            format!("signing-{}-retry-1", hex::encode([0xabu8; 32]))
        );
        // retry derivation is pure, every peer lands on the same id
        assert_eq!(id.retried(2), id.retried(2));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }
}
