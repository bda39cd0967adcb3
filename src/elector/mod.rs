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

//! # Coordinator Elector Module
//!
//! Elects the session leader from the current candidate set. Two variants
//! share one interface: the static elector (pure, deterministic, no
//! messaging) used when no prior state distinguishes peers, and the bully
//! elector used when the liveness of a prior leader may change mid-session.
//!
//! Both variants rank candidates by `keccak256(peer_id ‖ session_id)`, so
//! the ranking is unpredictable before the session id exists but identical
//! on every correct node.

/// Bully leader election.
pub mod bully;

pub use bully::BullyCoordinatorElector;

use std::sync::Arc;

use async_trait::async_trait;
use libp2p_identity::PeerId;

use crate::comm::Comm;
use crate::config::BullyConfig;
use crate::error::{Error, Result};
use crate::tss::SessionId;

/// Picks the session leader out of `candidates`.
#[async_trait]
pub trait CoordinatorElector: Send + Sync {
    /// Returns the elected leader. Fails with [`Error::NoCandidates`] on an
    /// empty candidate set.
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId>;
}

/// Which election variant to run for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorKind {
    /// Deterministic session-hash ordering, no messaging.
    Static,
    /// Bully election over the committee channel.
    Bully,
}

/// Sorts `peers` by `keccak256(peer_id ‖ session_id)`, ascending. The first
/// entry is the best ranked peer for the session.
pub fn sort_peers_for_session(
    peers: &[PeerId],
    session_id: &SessionId,
) -> Vec<PeerId> {
    let mut ranked: Vec<([u8; 32], PeerId)> = peers
        .iter()
        .map(|peer| {
            let mut input = peer.to_bytes();
            input.extend_from_slice(session_id.as_bytes());
            (ethers::utils::keccak256(&input), *peer)
        })
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, peer)| peer).collect()
}

/// The static elector: the best ranked candidate under the session hash is
/// the leader.
pub struct StaticCoordinatorElector {
    session_id: SessionId,
}

impl StaticCoordinatorElector {
    /// Creates a static elector for `session_id`.
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }
}

#[async_trait]
impl CoordinatorElector for StaticCoordinatorElector {
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId> {
        sort_peers_for_session(candidates, &self.session_id)
            .first()
            .copied()
            .ok_or(Error::NoCandidates)
    }
}

/// Constructs the elector matching a session and kind, sharing the
/// communication handle and bully timeouts.
pub struct CoordinatorElectorFactory {
    comm: Arc<dyn Comm>,
    config: BullyConfig,
}

impl CoordinatorElectorFactory {
    /// Creates a new factory.
    pub fn new(comm: Arc<dyn Comm>, config: BullyConfig) -> Self {
        Self { comm, config }
    }

    /// The elector for `session_id` of the given kind.
    pub fn coordinator_elector(
        &self,
        session_id: &SessionId,
        kind: ElectorKind,
    ) -> Box<dyn CoordinatorElector> {
        match kind {
            ElectorKind::Static => Box::new(StaticCoordinatorElector::new(
                session_id.clone(),
            )),
            ElectorKind::Bully => Box::new(BullyCoordinatorElector::new(
                session_id.clone(),
                self.comm.clone(),
                self.config,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_elector_is_deterministic_across_nodes() {
        let peers: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        let session: SessionId = "signing-determinism".into();

        // every node computes the same leader regardless of input order
        let elector = StaticCoordinatorElector::new(session.clone());
        let leader = elector.coordinator(&peers).await.unwrap();
        let mut shuffled = peers.clone();
        shuffled.reverse();
        let elector2 = StaticCoordinatorElector::new(session);
        assert_eq!(elector2.coordinator(&shuffled).await.unwrap(), leader);
        assert!(peers.contains(&leader));
    }

    #[tokio::test]
    async fn different_sessions_spread_the_leadership() {
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        // with enough sessions at least two distinct leaders must show up,
        // otherwise the ranking would not depend on the session id
        let mut leaders = std::collections::HashSet::new();
        for i in 0..64 {
            let session: SessionId =
                format!("signing-spread-{i}").as_str().into();
            let elector = StaticCoordinatorElector::new(session);
            leaders.insert(elector.coordinator(&peers).await.unwrap());
        }
        assert!(leaders.len() > 1);
    }

    #[tokio::test]
    async fn empty_candidate_set_fails() {
        let elector =
            StaticCoordinatorElector::new("signing-empty".into());
        assert!(matches!(
            elector.coordinator(&[]).await,
            Err(Error::NoCandidates)
        ));
    }

    #[test]
    fn ranking_is_a_permutation() {
        let peers: Vec<PeerId> = (0..8).map(|_| PeerId::random()).collect();
        let ranked =
            sort_peers_for_session(&peers, &"keygen-rank".into());
        assert_eq!(ranked.len(), peers.len());
        for peer in &peers {
            assert!(ranked.contains(peer));
        }
    }
}
