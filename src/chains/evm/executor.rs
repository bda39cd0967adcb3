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

//! The message executor: turns an agreed message into a proposal, runs the
//! signing session for its hash and, on the session leader, submits
//! `executeProposal` on the destination chain. Idempotent against
//! re-submission through the `isProposalExecuted` short-circuit.

use std::sync::Arc;

use ethers::types::Address;
use tokio_util::sync::CancellationToken;

use super::contracts::{BridgeOps, ExecutionStatus, TransactOptions};
use super::deposit::deposit_data_of;
use super::Proposal;
use crate::chains::{DepositPayload, Message};
use crate::error::{Error, Result};
use crate::metric::Metrics;
use crate::probe;
use crate::store::KeyshareStore;
use crate::topology::NetworkTopologyProvider;
use crate::tss::ceremony::{CeremonyOutput, ThresholdScheme};
use crate::tss::signing::Signing;
use crate::tss::Coordinator;

/// The handler contract addresses per resource type, from the chain
/// config.
#[derive(Debug, Clone, Copy)]
pub struct HandlerAddresses {
    /// The ERC-20 handler.
    pub erc20: Address,
    /// The ERC-721 handler.
    pub erc721: Address,
    /// The generic handler.
    pub generic: Address,
}

impl HandlerAddresses {
    fn for_payload(&self, payload: &DepositPayload) -> Address {
        match payload {
            DepositPayload::Erc20 { .. } => self.erc20,
            DepositPayload::Erc721 { .. } => self.erc721,
            DepositPayload::Generic { .. } => self.generic,
        }
    }
}

/// The executor of one destination chain.
pub struct EvmExecutor {
    bridge: Arc<dyn BridgeOps>,
    coordinator: Arc<Coordinator>,
    topology_provider: Arc<dyn NetworkTopologyProvider>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
    handlers: HandlerAddresses,
    revert_on_fail: bool,
    token: CancellationToken,
    metrics: Arc<Metrics>,
}

impl EvmExecutor {
    /// Creates the executor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<dyn BridgeOps>,
        coordinator: Arc<Coordinator>,
        topology_provider: Arc<dyn NetworkTopologyProvider>,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
        handlers: HandlerAddresses,
        revert_on_fail: bool,
        token: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bridge,
            coordinator,
            topology_provider,
            scheme,
            keyshare_store,
            handlers,
            revert_on_fail,
            token,
            metrics,
        }
    }

    /// The proposal a message executes as.
    pub fn proposal_of(&self, message: &Message) -> Proposal {
        Proposal {
            source: message.source,
            destination: message.destination,
            deposit_nonce: message.deposit_nonce,
            resource_id: message.resource_id,
            data: deposit_data_of(&message.payload),
            handler_address: self.handlers.for_payload(&message.payload),
        }
    }

    /// Executes one message end to end.
    pub async fn execute(&self, message: Message) -> Result<()> {
        let proposal = self.proposal_of(&message);
        if self.bridge.is_proposal_executed(&proposal).await? {
            tracing::debug!(
                message_id = %message.message_id,
                "proposal already executed, dropping",
            );
            self.metrics.proposals_skipped.inc();
            return Ok(());
        }

        let digest = proposal.hash();
        let topology = self.topology_provider.network_topology()?;
        let signing = Arc::new(Signing::new(
            digest,
            &topology,
            self.scheme.clone(),
            self.keyshare_store.clone(),
        ));
        let result =
            match self.coordinator.execute(&self.token, signing).await {
                Ok(result) => result,
                // a re-delivery of the same proposal is already driving
                // the session on this node
                Err(Error::SessionAlreadyRunning(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

        if result.leader != self.coordinator.local_peer() {
            // submission is the leader's side effect alone
            return Ok(());
        }
        let CeremonyOutput::Signature(signature) = result.output else {
            return Err(Error::Generic(
                "signing session produced no signature",
            ));
        };

        let status = self
            .bridge
            .execute_proposal(
                &proposal,
                &signature,
                TransactOptions::default(),
            )
            .await?;
        self.metrics.total_transaction_made.inc();
        match status {
            ExecutionStatus::Executed(tx_hash) => {
                self.metrics.proposals_executed.inc();
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Execution,
                    message_id = %message.message_id,
                    tx_hash = %tx_hash,
                );
                Ok(())
            }
            ExecutionStatus::Reverted(tx_hash) => {
                if self.revert_on_fail {
                    return Err(Error::ExecutionReverted(
                        proposal.deposit_nonce,
                    ));
                }
                // a concurrent relayer may have won the race; verify
                // before treating the revert as a failure
                if self.bridge.is_proposal_executed(&proposal).await? {
                    tracing::warn!(
                        message_id = %message.message_id,
                        %tx_hash,
                        "execution reverted but proposal is executed",
                    );
                    self.metrics.proposals_skipped.inc();
                    Ok(())
                } else {
                    Err(Error::ExecutionReverted(proposal.deposit_nonce))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemComm;
    use crate::config::{BullyConfig, SessionConfig};
    use crate::elector::CoordinatorElectorFactory;
    use crate::store::Keyshare;
    use crate::topology::{NetworkTopology, PeerInfo};
    use crate::tss::ceremony::testing::StubScheme;
    use async_trait::async_trait;
    use ethers::types::H256;
    use libp2p_identity::PeerId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockBridge {
        executed: Mutex<HashSet<(u8, u64)>>,
        execute_calls: AtomicUsize,
        revert: bool,
    }

    impl MockBridge {
        fn new(revert: bool) -> Self {
            Self {
                executed: Mutex::new(HashSet::new()),
                execute_calls: AtomicUsize::new(0),
                revert,
            }
        }
    }

    #[async_trait]
    impl BridgeOps for MockBridge {
        async fn is_proposal_executed(
            &self,
            proposal: &Proposal,
        ) -> Result<bool> {
            Ok(self
                .executed
                .lock()
                .unwrap()
                .contains(&(proposal.source, proposal.deposit_nonce)))
        }

        async fn execute_proposal(
            &self,
            proposal: &Proposal,
            _signature: &[u8],
            _opts: TransactOptions,
        ) -> Result<ExecutionStatus> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            if self.revert {
                return Ok(ExecutionStatus::Reverted(H256::zero()));
            }
            self.executed
                .lock()
                .unwrap()
                .insert((proposal.source, proposal.deposit_nonce));
            Ok(ExecutionStatus::Executed(H256::zero()))
        }

        async fn end_keygen(
            &self,
            _mpc_address: Address,
            _opts: TransactOptions,
        ) -> Result<H256> {
            Ok(H256::zero())
        }
    }

    struct FixedTopology {
        topology: Arc<NetworkTopology>,
    }

    impl NetworkTopologyProvider for FixedTopology {
        fn network_topology(&self) -> Result<Arc<NetworkTopology>> {
            Ok(self.topology.clone())
        }
        fn reload(&self) -> Result<Arc<NetworkTopology>> {
            Ok(self.topology.clone())
        }
        fn invalidate(&self) {}
    }

    fn executor_with(
        bridge: Arc<MockBridge>,
        revert_on_fail: bool,
    ) -> EvmExecutor {
        let peer = PeerId::random();
        let network = MemComm::network(&[peer]);
        let comm = network[0].clone();
        let factory = CoordinatorElectorFactory::new(
            comm.clone(),
            BullyConfig::default(),
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let coordinator = Arc::new(Coordinator::new(
            comm,
            factory,
            SessionConfig::default(),
            metrics.clone(),
        ));
        let topology = Arc::new(NetworkTopology {
            peers: vec![PeerInfo {
                id: peer,
                address: "127.0.0.1:9999".parse().unwrap(),
            }],
            threshold: 0,
            epoch: 1,
        });
        let keyshare = Keyshare {
            share: vec![1],
            public_key: vec![2u8; 33],
            threshold: 0,
            participants: vec![peer],
        };
        let dir = tempfile::tempdir().unwrap();
        let keyshare_store =
            Arc::new(KeyshareStore::new(dir.path().join("keyshare")));
        keyshare_store.store(&keyshare).unwrap();
        // keep the tempdir alive for the duration of the test
        std::mem::forget(dir);
        EvmExecutor::new(
            bridge,
            coordinator,
            Arc::new(FixedTopology { topology }),
            Arc::new(StubScheme {
                keyshare,
                signature: vec![9u8; 65],
            }),
            keyshare_store,
            HandlerAddresses {
                erc20: Address::repeat_byte(1),
                erc721: Address::repeat_byte(2),
                generic: Address::repeat_byte(3),
            },
            revert_on_fail,
            CancellationToken::new(),
            metrics,
        )
    }

    fn message(nonce: u64) -> Message {
        Message::new(
            1,
            2,
            nonce,
            [7u8; 32],
            DepositPayload::Generic {
                metadata: vec![1, 2, 3],
            },
        )
    }

    #[tokio::test]
    async fn executes_once_and_skips_redelivery() {
        let bridge = Arc::new(MockBridge::new(false));
        let executor = executor_with(bridge.clone(), false);

        executor.execute(message(42)).await.unwrap();
        assert_eq!(bridge.execute_calls.load(Ordering::SeqCst), 1);
        assert!(bridge
            .executed
            .lock()
            .unwrap()
            .contains(&(1, 42)));

        // re-delivering the executed deposit is a no-op
        executor.execute(message(42)).await.unwrap();
        assert_eq!(bridge.execute_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reverts_surface_when_configured() {
        let bridge = Arc::new(MockBridge::new(true));
        let executor = executor_with(bridge.clone(), true);
        let err = executor.execute(message(7)).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionReverted(7)));
    }

    #[tokio::test]
    async fn unverified_reverts_fail_even_without_revert_on_fail() {
        let bridge = Arc::new(MockBridge::new(true));
        let executor = executor_with(bridge.clone(), false);
        let err = executor.execute(message(8)).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionReverted(8)));
    }

    #[test]
    fn proposals_route_to_the_matching_handler() {
        let bridge = Arc::new(MockBridge::new(false));
        let executor = executor_with(bridge, false);
        let proposal = executor.proposal_of(&message(1));
        assert_eq!(proposal.handler_address, Address::repeat_byte(3));
        let erc20 = Message::new(
            1,
            2,
            1,
            [0u8; 32],
            DepositPayload::Erc20 {
                amount: 5u64.into(),
                recipient: vec![0u8; 20],
                priority: None,
            },
        );
        assert_eq!(
            executor.proposal_of(&erc20).handler_address,
            Address::repeat_byte(1)
        );
    }
}
