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

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p_identity::PeerId;

use super::ceremony::{
    CeremonyOutput, RoundContext, ThresholdScheme, TssProcess,
};
use super::{SessionId, SessionKind};
use crate::error::{Error, Result};
use crate::store::KeyshareStore;
use crate::topology::NetworkTopology;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// The keyshare refresh ceremony.
///
/// Participants are the union of the outgoing and incoming committees, so a
/// leaving member can hand over before its share is retired. The new share
/// is durably written before the old one is erased; the group public key
/// persists.
pub struct Refresh {
    session_id: SessionId,
    new_topology: Arc<NetworkTopology>,
    participants: Vec<PeerId>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
}

impl Refresh {
    /// Creates a refresh ceremony over `old ∪ new_topology`.
    pub fn new(
        session_id: SessionId,
        old: &[PeerId],
        new_topology: Arc<NetworkTopology>,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
    ) -> Self {
        let union: BTreeSet<PeerId> = old
            .iter()
            .copied()
            .chain(new_topology.peer_ids())
            .collect();
        Self {
            session_id,
            participants: union.into_iter().collect(),
            new_topology,
            scheme,
            keyshare_store,
        }
    }
}

#[async_trait]
impl TssProcess for Refresh {
    fn kind(&self) -> SessionKind {
        SessionKind::Refresh
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    fn threshold(&self) -> u32 {
        self.new_topology.threshold
    }

    fn retryable(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        REFRESH_TIMEOUT
    }

    async fn run(&self, ctx: &mut RoundContext) -> Result<CeremonyOutput> {
        let previous = match self.keyshare_store.load() {
            Ok(share) => Some(share),
            Err(Error::KeyshareNotFound) => None,
            Err(e) => return Err(e),
        };
        let next = self.new_topology.peer_ids();
        match self
            .scheme
            .refresh(ctx, previous.as_ref(), &next)
            .await?
        {
            Some(keyshare) => {
                // the write replaces the old file atomically, so the prior
                // share stays intact until the new one is durable
                self.keyshare_store.store(&keyshare)?;
                tracing::info!(
                    session_id = %self.session_id,
                    epoch = self.new_topology.epoch,
                    "refreshed threshold keyshare",
                );
                Ok(CeremonyOutput::Keyshare(keyshare))
            }
            None => {
                self.keyshare_store.erase()?;
                tracing::info!(
                    session_id = %self.session_id,
                    epoch = self.new_topology.epoch,
                    "retired from the committee, erased keyshare",
                );
                Ok(CeremonyOutput::Retired)
            }
        }
    }
}
