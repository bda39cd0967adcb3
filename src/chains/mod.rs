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

//! # Chains Module
//!
//! Chain adapters and the relayer loop that routes messages between them.
//! A chain adapter is a [`RelayedChain`]: it polls its own events and
//! executes proposals addressed to it. Chain kinds are a closed enum; a new
//! kind is added by extending [`ChainKind`], not by a runtime type string.

/// The EVM chain adapter.
pub mod evm;

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metric::Metrics;

/// The supported chain adapter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// An EVM chain behind a JSON-RPC endpoint.
    Evm,
}

/// The typed payload of a deposit, decoded by the per-resource-type deposit
/// handler and re-encoded into proposal data by the matching message
/// handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositPayload {
    /// A fungible token transfer.
    Erc20 {
        /// Amount of tokens, big-endian 32 bytes on the wire.
        amount: U256,
        /// Recipient address bytes on the destination chain.
        recipient: Vec<u8>,
        /// Optional execution priority.
        priority: Option<u8>,
    },
    /// A non-fungible token transfer.
    Erc721 {
        /// The token id.
        token_id: U256,
        /// Recipient address bytes on the destination chain.
        recipient: Vec<u8>,
        /// The token metadata.
        metadata: Vec<u8>,
        /// Optional execution priority.
        priority: Option<u8>,
    },
    /// An arbitrary cross-chain call.
    Generic {
        /// The opaque call metadata.
        metadata: Vec<u8>,
    },
}

/// The post-decode form of a deposit, routed from the emitting chain to the
/// destination chain's executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The emitting domain.
    pub source: u8,
    /// The destination domain.
    pub destination: u8,
    /// The deposit nonce assigned by the source bridge.
    pub deposit_nonce: u64,
    /// The resource the deposit moves.
    pub resource_id: [u8; 32],
    /// The decoded deposit payload.
    pub payload: DepositPayload,
    /// Stable identifier used in logs and probes.
    pub message_id: String,
}

impl Message {
    /// Builds a message; the id is derived from the routing triple.
    pub fn new(
        source: u8,
        destination: u8,
        deposit_nonce: u64,
        resource_id: [u8; 32],
        payload: DepositPayload,
    ) -> Self {
        Self {
            source,
            destination,
            deposit_nonce,
            resource_id,
            payload,
            message_id: format!("{source}-{destination}-{deposit_nonce}"),
        }
    }
}

/// The capability interface of one relayed chain.
#[async_trait]
pub trait RelayedChain: Send + Sync {
    /// The bridge domain id this chain serves.
    fn domain_id(&self) -> u8;

    /// Polls the chain for events until cancelled, pushing decoded messages
    /// into `msg_tx` and unrecoverable errors into `fatal_tx`.
    async fn poll_events(
        &self,
        token: CancellationToken,
        msg_tx: mpsc::Sender<Message>,
        fatal_tx: mpsc::Sender<Error>,
    );

    /// Executes a message addressed to this chain.
    async fn write(&self, message: Message) -> Result<()>;
}

/// Routes messages from emitting chains to their destination chain.
pub struct Relayer {
    chains: Vec<Arc<dyn RelayedChain>>,
    metrics: Arc<Metrics>,
}

impl Relayer {
    /// Creates a relayer over the configured chains.
    pub fn new(
        chains: Vec<Arc<dyn RelayedChain>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { chains, metrics }
    }

    fn destination_of(&self, domain: u8) -> Option<Arc<dyn RelayedChain>> {
        self.chains
            .iter()
            .find(|c| c.domain_id() == domain)
            .cloned()
    }

    /// Starts every chain's polling task and routes messages until the
    /// token is cancelled.
    pub async fn start(
        &self,
        token: CancellationToken,
        fatal_tx: mpsc::Sender<Error>,
    ) {
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
        for chain in &self.chains {
            let chain = chain.clone();
            let chain_token = token.child_token();
            let msg_tx = msg_tx.clone();
            let fatal_tx = fatal_tx.clone();
            tokio::spawn(async move {
                chain.poll_events(chain_token, msg_tx, fatal_tx).await;
            });
        }
        drop(msg_tx);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { return };
                    self.route(msg);
                }
            }
        }
    }

    fn route(&self, msg: Message) {
        let Some(destination) = self.destination_of(msg.destination) else {
            tracing::warn!(
                message_id = %msg.message_id,
                destination = msg.destination,
                "no chain serves the destination domain, dropping message",
            );
            return;
        };
        self.metrics.deposits_handled.inc();
        tokio::spawn(async move {
            let message_id = msg.message_id.clone();
            if let Err(e) = destination.write(msg).await {
                tracing::error!(
                    %message_id,
                    error = %e,
                    "failed to execute message",
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockChain {
        domain: u8,
        emit: Option<Message>,
        written: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl RelayedChain for MockChain {
        fn domain_id(&self) -> u8 {
            self.domain
        }

        async fn poll_events(
            &self,
            token: CancellationToken,
            msg_tx: mpsc::Sender<Message>,
            _fatal_tx: mpsc::Sender<Error>,
        ) {
            if let Some(msg) = &self.emit {
                let _ = msg_tx.send(msg.clone()).await;
            }
            token.cancelled().await;
        }

        async fn write(&self, message: Message) -> Result<()> {
            self.written.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn messages_are_routed_to_the_destination_chain() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let msg = Message::new(
            1,
            2,
            42,
            [1u8; 32],
            DepositPayload::Generic { metadata: vec![] },
        );
        let source = Arc::new(MockChain {
            domain: 1,
            emit: Some(msg.clone()),
            written: Arc::new(Mutex::new(Vec::new())),
        });
        let destination = Arc::new(MockChain {
            domain: 2,
            emit: None,
            written: written.clone(),
        });
        let relayer = Relayer::new(
            vec![source, destination],
            Arc::new(Metrics::new().unwrap()),
        );
        let token = CancellationToken::new();
        let run_token = token.clone();
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let run = tokio::spawn(async move {
            relayer.start(run_token, fatal_tx).await;
        });

        // wait for the routing to happen, then stop the relayer
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        token.cancel();
        run.await.unwrap();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].message_id, "1-2-42");
    }

    #[test]
    fn message_ids_follow_the_routing_triple() {
        let msg = Message::new(
            3,
            7,
            9,
            [0u8; 32],
            DepositPayload::Generic { metadata: vec![] },
        );
        assert_eq!(msg.message_id, "3-7-9");
    }
}
