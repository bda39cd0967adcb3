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

//! The ceremony seam between the session coordinator and the concrete
//! ceremonies.
//!
//! A [`TssProcess`] is one runnable ceremony; the coordinator owns its
//! lifecycle (election, start exchange, retries, cancellation) and hands the
//! process a [`RoundContext`] to exchange round payloads with the other
//! participants. The cryptographic content of the rounds is hidden behind
//! [`ThresholdScheme`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio_util::sync::CancellationToken;

use super::{SessionId, SessionKind};
use crate::comm::{Comm, Protocol, Subscription};
use crate::error::{Error, Result};
use crate::store::Keyshare;

/// What a completed ceremony produced.
#[derive(Debug, Clone)]
pub enum CeremonyOutput {
    /// A keygen or refresh ceremony produced a new keyshare.
    Keyshare(Keyshare),
    /// A signing ceremony produced a signature.
    Signature(Vec<u8>),
    /// A refresh ceremony retired this relayer from the committee.
    Retired,
}

/// One runnable ceremony, driven to completion by the coordinator.
#[async_trait]
pub trait TssProcess: Send + Sync {
    /// The ceremony kind.
    fn kind(&self) -> SessionKind;

    /// The base session id (before any retry derivation).
    fn session_id(&self) -> &SessionId;

    /// The peers taking part in the ceremony.
    fn participants(&self) -> &[PeerId];

    /// The signing threshold `t` the ceremony runs under.
    fn threshold(&self) -> u32;

    /// Whether a failed attempt may be restarted on a backup coordinator.
    fn retryable(&self) -> bool;

    /// The deadline of one ceremony attempt.
    fn timeout(&self) -> Duration;

    /// Runs the ceremony rounds.
    async fn run(&self, ctx: &mut RoundContext) -> Result<CeremonyOutput>;
}

/// The abstract cryptography of the ceremonies. Implementations drive their
/// protocol rounds through the [`RoundContext`] and must be deterministic in
/// their round structure so all participants stay in lockstep.
#[async_trait]
pub trait ThresholdScheme: Send + Sync {
    /// Runs distributed key generation and returns this node's share.
    async fn keygen(&self, ctx: &mut RoundContext) -> Result<Keyshare>;

    /// Refreshes `previous` for the committee `next`. The group public key
    /// must persist. Returns `None` when this relayer is not part of `next`
    /// and its share is to be retired.
    async fn refresh(
        &self,
        ctx: &mut RoundContext,
        previous: Option<&Keyshare>,
        next: &[PeerId],
    ) -> Result<Option<Keyshare>>;

    /// Produces a threshold signature over `digest`.
    async fn sign(
        &self,
        ctx: &mut RoundContext,
        share: &Keyshare,
        digest: [u8; 32],
    ) -> Result<Vec<u8>>;
}

/// The per-attempt exchange surface handed to a running ceremony.
///
/// Round payloads are framed as `round:u8 ‖ data` on the Tss protocol.
/// Messages of future rounds arriving early are buffered; within one
/// `(sender, session)` pair the transport guarantees FIFO, so a ceremony
/// only ever sees its rounds in order.
pub struct RoundContext {
    comm: Arc<dyn Comm>,
    session_id: SessionId,
    participants: Vec<PeerId>,
    threshold: u32,
    leader: PeerId,
    local: PeerId,
    sub: Subscription,
    buffered: HashMap<u8, HashMap<PeerId, Vec<u8>>>,
    round_timeout: Duration,
    token: CancellationToken,
}

impl RoundContext {
    /// Subscribes the ceremony inbox and builds the context for one
    /// attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<dyn Comm>,
        session_id: SessionId,
        participants: Vec<PeerId>,
        threshold: u32,
        leader: PeerId,
        round_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        let sub = comm.subscribe(&session_id, Protocol::Tss);
        let local = comm.local_peer();
        Self {
            comm,
            session_id,
            participants,
            threshold,
            leader,
            local,
            sub,
            buffered: HashMap::new(),
            round_timeout,
            token,
        }
    }

    /// The (possibly retried) id of this attempt.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// All ceremony participants, including self.
    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    /// The signing threshold `t`.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// The elected leader of this attempt.
    pub fn leader(&self) -> PeerId {
        self.leader
    }

    /// This node's identity.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Whether this node leads the attempt.
    pub fn is_leader(&self) -> bool {
        self.local == self.leader
    }

    fn frame(round: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(round);
        payload.extend_from_slice(data);
        payload
    }

    /// Sends `data` for `round` to every other participant.
    pub fn broadcast_round(&self, round: u8, data: &[u8]) {
        let others: Vec<PeerId> = self
            .participants
            .iter()
            .copied()
            .filter(|p| p != &self.local)
            .collect();
        self.comm.broadcast(
            &self.session_id,
            Protocol::Tss,
            Self::frame(round, data),
            &others,
        );
    }

    /// Sends `data` for `round` to a single participant.
    pub fn send_round(&self, round: u8, to: &PeerId, data: &[u8]) {
        self.comm.broadcast(
            &self.session_id,
            Protocol::Tss,
            Self::frame(round, data),
            &[*to],
        );
    }

    /// Collects the `round` payload of every peer in `from` (self is
    /// skipped), respecting the cancellation token and the round timeout.
    pub async fn gather_round(
        &mut self,
        round: u8,
        from: &[PeerId],
    ) -> Result<HashMap<PeerId, Vec<u8>>> {
        let expected: HashSet<PeerId> = from
            .iter()
            .copied()
            .filter(|p| p != &self.local)
            .collect();
        let mut got = self.buffered.remove(&round).unwrap_or_default();
        let deadline = tokio::time::sleep(self.round_timeout);
        tokio::pin!(deadline);
        while !expected.iter().all(|p| got.contains_key(p)) {
            tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(Error::SessionCancelled(
                        self.session_id.as_str().to_string(),
                    ));
                }
                _ = &mut deadline => {
                    return Err(Error::RoundTimeout {
                        session: self.session_id.as_str().to_string(),
                        round,
                    });
                }
                msg = self.sub.recv() => {
                    let Some(msg) = msg else {
                        return Err(Error::ChannelClosed);
                    };
                    if !self.participants.contains(&msg.from) {
                        continue;
                    }
                    let Some((&r, data)) = msg.payload.split_first() else {
                        continue;
                    };
                    if r == round {
                        got.insert(msg.from, data.to_vec());
                    } else if r > round {
                        self.buffered
                            .entry(r)
                            .or_default()
                            .insert(msg.from, data.to_vec());
                    }
                    // payloads of earlier rounds are stale duplicates
                }
            }
        }
        Ok(got)
    }
}

/// A scheme stub for exercising the ceremony plumbing without cryptography.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct StubScheme {
        pub keyshare: Keyshare,
        pub signature: Vec<u8>,
    }

    #[async_trait]
    impl ThresholdScheme for StubScheme {
        async fn keygen(&self, _ctx: &mut RoundContext) -> Result<Keyshare> {
            Ok(self.keyshare.clone())
        }

        async fn refresh(
            &self,
            ctx: &mut RoundContext,
            previous: Option<&Keyshare>,
            next: &[PeerId],
        ) -> Result<Option<Keyshare>> {
            let previous = previous.ok_or(Error::KeyshareNotFound)?;
            if !next.contains(&ctx.local_peer()) {
                return Ok(None);
            }
            let mut refreshed = previous.clone();
            refreshed.participants = next.to_vec();
            refreshed.threshold = ctx.threshold();
            Ok(Some(refreshed))
        }

        async fn sign(
            &self,
            _ctx: &mut RoundContext,
            _share: &Keyshare,
            _digest: [u8; 32],
        ) -> Result<Vec<u8>> {
            Ok(self.signature.clone())
        }
    }
}
