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

const SIGNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The threshold signing ceremony over one proposal hash. The session id is
/// derived from the digest, so every committee member that sees the same
/// deposit joins the same session.
pub struct Signing {
    session_id: SessionId,
    digest: [u8; 32],
    threshold: u32,
    participants: Vec<PeerId>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
}

impl Signing {
    /// Creates a signing ceremony for `digest` over the committee of
    /// `topology`.
    pub fn new(
        digest: [u8; 32],
        topology: &NetworkTopology,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
    ) -> Self {
        Self {
            session_id: SessionId::signing(&digest),
            digest,
            threshold: topology.threshold,
            participants: topology.peer_ids(),
            scheme,
            keyshare_store,
        }
    }

    /// The digest this ceremony signs.
    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }
}

#[async_trait]
impl TssProcess for Signing {
    fn kind(&self) -> SessionKind {
        SessionKind::Signing
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
        SIGNING_TIMEOUT
    }

    async fn run(&self, ctx: &mut RoundContext) -> Result<CeremonyOutput> {
        let keyshare = self.keyshare_store.load()?;
        let signature =
            self.scheme.sign(ctx, &keyshare, self.digest).await?;
        Ok(CeremonyOutput::Signature(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemComm;
    use crate::error::Error;
    use crate::store::Keyshare;
    use crate::topology::PeerInfo;
    use crate::tss::ceremony::testing::StubScheme;
    use tokio_util::sync::CancellationToken;

    fn topology_of(peers: &[PeerId]) -> NetworkTopology {
        NetworkTopology {
            peers: peers
                .iter()
                .enumerate()
                .map(|(i, id)| PeerInfo {
                    id: *id,
                    address: format!("127.0.0.1:{}", 9200 + i)
                        .parse()
                        .unwrap(),
                })
                .collect(),
            threshold: 1,
            epoch: 1,
        }
    }

    #[tokio::test]
    async fn session_id_is_derived_from_the_digest() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let digest = ethers::utils::keccak256(b"deposit");
        let dir = tempfile::tempdir().unwrap();
        let signing = Signing::new(
            digest,
            &topology_of(&peers),
            Arc::new(StubScheme {
                keyshare: Keyshare {
                    share: vec![],
                    public_key: vec![],
                    threshold: 1,
                    participants: vec![],
                },
                signature: vec![],
            }),
            Arc::new(KeyshareStore::new(dir.path().join("keyshare"))),
        );
        assert_eq!(
            signing.session_id().as_str(),
            format!("signing-{}", hex::encode(digest))
        );
    }

    #[tokio::test]
    async fn signing_without_a_keyshare_fails() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let digest = [9u8; 32];
        let dir = tempfile::tempdir().unwrap();
        let signing = Signing::new(
            digest,
            &topology_of(&peers),
            Arc::new(StubScheme {
                keyshare: Keyshare {
                    share: vec![],
                    public_key: vec![],
                    threshold: 1,
                    participants: vec![],
                },
                signature: vec![0xaa],
            }),
            Arc::new(KeyshareStore::new(dir.path().join("missing"))),
        );
        let mut ctx = RoundContext::new(
            network[0].clone(),
            signing.session_id().clone(),
            peers.clone(),
            1,
            peers[0],
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let err = signing.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::KeyshareNotFound));
    }
}
