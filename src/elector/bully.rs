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

//! Bully leader election over the committee channel.
//!
//! Rank is the index in the session-hash ordering; rank 0 is the best.
//! A peer announces `ELECT` to all better ranked peers, and whoever hears no
//! `OK` within `election_wait` declares itself with `COORD`. Peers answering
//! an `ELECT` from a worse ranked sender reply `OK`. With a stable,
//! non-partitioned candidate set this terminates in O(n) messages with a
//! unique winner.

use std::sync::Arc;

use async_trait::async_trait;
use libp2p_identity::PeerId;

use super::{sort_peers_for_session, CoordinatorElector};
use crate::comm::{Comm, Protocol, Subscription};
use crate::config::BullyConfig;
use crate::error::{Error, Result};
use crate::probe;
use crate::tss::SessionId;

const ELECT: u8 = 0x01;
const OK: u8 = 0x02;
const COORD: u8 = 0x03;

/// The bully elector for one session.
pub struct BullyCoordinatorElector {
    session_id: SessionId,
    comm: Arc<dyn Comm>,
    config: BullyConfig,
}

impl BullyCoordinatorElector {
    /// Creates a bully elector for `session_id`.
    pub fn new(
        session_id: SessionId,
        comm: Arc<dyn Comm>,
        config: BullyConfig,
    ) -> Self {
        Self {
            session_id,
            comm,
            config,
        }
    }

    fn rank_of(ranked: &[PeerId], peer: &PeerId) -> Option<usize> {
        ranked.iter().position(|p| p == peer)
    }

    /// Answers an inbound election message. Returns the winner when the
    /// message decides the election.
    fn on_message(
        &self,
        ranked: &[PeerId],
        my_rank: usize,
        from: PeerId,
        opcode: u8,
        got_ok: &mut bool,
    ) -> Option<PeerId> {
        let Some(sender_rank) = Self::rank_of(ranked, &from) else {
            // not a candidate of this election round
            return None;
        };
        match opcode {
            ELECT if sender_rank > my_rank => {
                self.comm.broadcast(
                    &self.session_id,
                    Protocol::Bully,
                    vec![OK],
                    &[from],
                );
                None
            }
            OK if sender_rank < my_rank => {
                *got_ok = true;
                None
            }
            COORD => Some(from),
            _ => None,
        }
    }

    async fn run_election(
        &self,
        ranked: &[PeerId],
        my_rank: usize,
        sub: &mut Subscription,
    ) -> Result<Option<PeerId>> {
        let local = self.comm.local_peer();
        let others: Vec<PeerId> = ranked
            .iter()
            .copied()
            .filter(|p| p != &local)
            .collect();
        let better: Vec<PeerId> = ranked[..my_rank].to_vec();

        let mut got_ok = false;
        if better.is_empty() {
            // nobody outranks us; claim the session right away
            self.comm.broadcast(
                &self.session_id,
                Protocol::Bully,
                vec![COORD],
                &others,
            );
            return Ok(Some(local));
        }
        self.comm.broadcast(
            &self.session_id,
            Protocol::Bully,
            vec![ELECT],
            &better,
        );

        let election_deadline =
            tokio::time::sleep(self.config.election_wait());
        tokio::pin!(election_deadline);
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else {
                        return Err(Error::ChannelClosed);
                    };
                    let Some(&opcode) = msg.payload.first() else {
                        continue;
                    };
                    if let Some(winner) = self.on_message(
                        ranked, my_rank, msg.from, opcode, &mut got_ok,
                    ) {
                        return Ok(Some(winner));
                    }
                }
                _ = &mut election_deadline => break,
            }
        }

        if !got_ok {
            // no better ranked peer is alive
            self.comm.broadcast(
                &self.session_id,
                Protocol::Bully,
                vec![COORD],
                &others,
            );
            return Ok(Some(local));
        }

        // someone better ranked took over; wait for its announcement
        let leader_deadline = tokio::time::sleep(self.config.leader_wait());
        tokio::pin!(leader_deadline);
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else {
                        return Err(Error::ChannelClosed);
                    };
                    let Some(&opcode) = msg.payload.first() else {
                        continue;
                    };
                    if let Some(winner) = self.on_message(
                        ranked, my_rank, msg.from, opcode, &mut got_ok,
                    ) {
                        return Ok(Some(winner));
                    }
                }
                // the presumed leader went silent, restart the election
                _ = &mut leader_deadline => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl CoordinatorElector for BullyCoordinatorElector {
    async fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId> {
        if candidates.is_empty() {
            return Err(Error::NoCandidates);
        }
        let local = self.comm.local_peer();
        let ranked = sort_peers_for_session(candidates, &self.session_id);
        if ranked.len() == 1 {
            // single candidate: leader with zero messages exchanged
            return Ok(ranked[0]);
        }
        let Some(my_rank) = Self::rank_of(&ranked, &local) else {
            return Err(Error::Generic(
                "local peer is not an election candidate",
            ));
        };

        let mut sub =
            self.comm.subscribe(&self.session_id, Protocol::Bully);
        // bound the restarts; a stable candidate set settles well within
        // one restart per candidate
        for attempt in 0..=ranked.len() {
            if attempt > 0 {
                tokio::time::sleep(self.config.ping_wait()).await;
            }
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::TRACE,
                kind = %probe::Kind::Election,
                session_id = %self.session_id,
                attempt,
            );
            if let Some(winner) =
                self.run_election(&ranked, my_rank, &mut sub).await?
            {
                tracing::debug!(
                    session_id = %self.session_id,
                    leader = %winner,
                    "bully election settled",
                );
                return Ok(winner);
            }
        }
        Err(Error::Generic("bully election did not terminate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemComm;

    fn config() -> BullyConfig {
        BullyConfig {
            election_wait: 200,
            ping_wait: 50,
            leader_wait: 400,
        }
    }

    #[tokio::test]
    async fn single_candidate_wins_without_messages() {
        let peers: Vec<PeerId> = vec![PeerId::random()];
        let network = MemComm::network(&peers);
        let elector = BullyCoordinatorElector::new(
            "signing-solo".into(),
            network[0].clone(),
            config(),
        );
        let winner = elector.coordinator(&peers).await.unwrap();
        assert_eq!(winner, peers[0]);
    }

    #[tokio::test]
    async fn all_live_candidates_agree_on_one_leader() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let session: SessionId = "signing-agree".into();

        let mut handles = Vec::new();
        for comm in &network {
            let elector = BullyCoordinatorElector::new(
                session.clone(),
                comm.clone(),
                config(),
            );
            let candidates = peers.clone();
            handles.push(tokio::spawn(async move {
                elector.coordinator(&candidates).await.unwrap()
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            winners.push(handle.await.unwrap());
        }
        assert!(winners.windows(2).all(|w| w[0] == w[1]));
        assert!(peers.contains(&winners[0]));
    }

    #[tokio::test]
    async fn survivors_elect_a_new_leader_without_the_dead_peer() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let session: SessionId = "signing-survivors".into();

        let ranked = sort_peers_for_session(&peers, &session);
        let dead = ranked[0];
        let survivors: Vec<PeerId> =
            peers.iter().copied().filter(|p| p != &dead).collect();

        let mut handles = Vec::new();
        for (peer, comm) in peers.iter().zip(&network) {
            if peer == &dead {
                continue;
            }
            let elector = BullyCoordinatorElector::new(
                session.clone(),
                comm.clone(),
                config(),
            );
            let candidates = survivors.clone();
            handles.push(tokio::spawn(async move {
                elector.coordinator(&candidates).await.unwrap()
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            winners.push(handle.await.unwrap());
        }
        assert!(winners.iter().all(|w| w == &winners[0]));
        assert_ne!(winners[0], dead);
    }
}
