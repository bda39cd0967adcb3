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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p_identity::PeerId;

use super::ceremony::{
    CeremonyOutput, RoundContext, ThresholdScheme, TssProcess,
};
use super::{SessionId, SessionKind};
use crate::error::Result;
use crate::store::KeyshareStore;
use crate::topology::NetworkTopology;

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// The distributed key generation ceremony. Every participant persists its
/// share of the fresh key; the leader additionally submits `endKeygen` on
/// chain once the coordinator reports completion.
pub struct Keygen {
    session_id: SessionId,
    threshold: u32,
    participants: Vec<PeerId>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
}

impl Keygen {
    /// Creates a keygen ceremony over the full committee of `topology`.
    pub fn new(
        session_id: SessionId,
        topology: &NetworkTopology,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
    ) -> Self {
        Self {
            session_id,
            threshold: topology.threshold,
            participants: topology.peer_ids(),
            scheme,
            keyshare_store,
        }
    }
}

#[async_trait]
impl TssProcess for Keygen {
    fn kind(&self) -> SessionKind {
        SessionKind::Keygen
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    fn threshold(&self) -> u32 {
        self.threshold
    }

    fn retryable(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        KEYGEN_TIMEOUT
    }

    async fn run(&self, ctx: &mut RoundContext) -> Result<CeremonyOutput> {
        let keyshare = self.scheme.keygen(ctx).await?;
        self.keyshare_store.store(&keyshare)?;
        tracing::info!(
            session_id = %self.session_id,
            public_key = %hex::encode(&keyshare.public_key),
            "generated threshold keyshare",
        );
        Ok(CeremonyOutput::Keyshare(keyshare))
    }
}
