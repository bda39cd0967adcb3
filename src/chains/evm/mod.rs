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

//! # EVM Chain Adapter
//!
//! Everything the relayer needs to serve one EVM chain: the bridge
//! contract wrappers, static event decoders, the deposit payload codecs,
//! the polling listener with its event handlers, and the proposal executor.

/// Bridge contract call wrappers.
pub mod contracts;
/// Deposit payload construction and parsing.
pub mod deposit;
/// Static decoders for bridge events.
pub mod events;
/// EIP-1559 gas pricing.
pub mod gas;
/// Bridge event handlers.
pub mod handlers;
/// The block-range polling listener.
pub mod listener;

/// The message executor.
pub mod executor;

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::Address;
use ethers::utils::keccak256;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::executor::EvmExecutor;
use self::listener::EvmListener;
use crate::chains::{Message, RelayedChain};
use crate::error::{Error, Result};

/// An actionable cross-chain transfer awaiting execution on the
/// destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// The emitting domain.
    pub source: u8,
    /// The destination domain.
    pub destination: u8,
    /// The nonce the source bridge assigned to the deposit.
    pub deposit_nonce: u64,
    /// The resource being transferred.
    pub resource_id: [u8; 32],
    /// The handler calldata.
    pub data: Vec<u8>,
    /// The handler contract executing the proposal.
    pub handler_address: Address,
}

impl Proposal {
    /// The canonical proposal hash:
    /// `keccak256(source ‖ destination ‖ be64(nonce) ‖ data ‖ resource_id)`.
    /// Proposals with equal hashes are semantically identical, and the
    /// signing session id is derived from it.
    pub fn hash(&self) -> [u8; 32] {
        let mut input = Vec::with_capacity(42 + self.data.len());
        input.push(self.source);
        input.push(self.destination);
        input.extend_from_slice(&self.deposit_nonce.to_be_bytes());
        input.extend_from_slice(&self.data);
        input.extend_from_slice(&self.resource_id);
        keccak256(input)
    }
}

/// One EVM chain served by this relayer.
pub struct EvmChain {
    domain_id: u8,
    listener: EvmListener<Provider<Http>>,
    executor: EvmExecutor,
}

impl EvmChain {
    /// Assembles a chain from its listener and executor.
    pub fn new(
        domain_id: u8,
        listener: EvmListener<Provider<Http>>,
        executor: EvmExecutor,
    ) -> Self {
        Self {
            domain_id,
            listener,
            executor,
        }
    }
}

#[async_trait]
impl RelayedChain for EvmChain {
    fn domain_id(&self) -> u8 {
        self.domain_id
    }

    async fn poll_events(
        &self,
        token: CancellationToken,
        msg_tx: mpsc::Sender<Message>,
        fatal_tx: mpsc::Sender<Error>,
    ) {
        if let Err(e) = self.listener.listen(token, msg_tx).await {
            let _ = fatal_tx.send(e).await;
        }
    }

    async fn write(&self, message: Message) -> Result<()> {
        self.executor.execute(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(nonce: u64) -> Proposal {
        let mut resource_id = [0u8; 32];
        resource_id[31] = 0x01;
        Proposal {
            source: 1,
            destination: 2,
            deposit_nonce: nonce,
            resource_id,
            data: vec![0xca, 0xfe],
            handler_address: Address::zero(),
        }
    }

    #[test]
    fn proposal_hash_is_the_canonical_keccak() {
        let p = proposal(42);
        let mut expected = Vec::new();
        expected.push(1u8);
        expected.push(2u8);
        expected.extend_from_slice(&42u64.to_be_bytes());
        expected.extend_from_slice(&[0xca, 0xfe]);
        expected.extend_from_slice(&p.resource_id);
        assert_eq!(p.hash(), keccak256(expected));
    }

    #[test]
    fn equal_proposals_hash_equal() {
        assert_eq!(proposal(42).hash(), proposal(42).hash());
        assert_ne!(proposal(42).hash(), proposal(43).hash());
    }
}
