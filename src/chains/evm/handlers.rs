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

//! The bridge event handlers: Deposit, StartKeygen, KeyRefresh and Retry.
//! Every handler is idempotent on replay; events may be re-seen after a
//! crash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::deposit::{parse_deposit, ResourceType};
use super::events;
use super::listener::EventHandler;
use crate::chains::Message;
use crate::error::{Error, Result};
use crate::store::KeyshareStore;
use crate::topology::NetworkTopologyProvider;
use crate::tss::ceremony::{CeremonyOutput, ThresholdScheme};
use crate::tss::keygen::Keygen;
use crate::tss::refresh::Refresh;
use crate::tss::{Coordinator, SessionId};

use super::contracts::{BridgeOps, TransactOptions};

/// A log query against one chain, seamed out so handlers can be tested
/// without an RPC endpoint.
#[async_trait]
pub trait LogQuery: Send + Sync {
    /// All logs matching `filter`.
    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>>;
}

#[async_trait]
impl LogQuery for Provider<Http> {
    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        Ok(self.get_logs(filter).await?)
    }
}

/// Resolves the handler contract serving a resource id.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    /// The handler registered for `resource_id` on the bridge.
    async fn handler_of(&self, resource_id: [u8; 32]) -> Result<Address>;
}

#[async_trait]
impl ResourceResolver for super::contracts::BridgeContract {
    async fn handler_of(&self, resource_id: [u8; 32]) -> Result<Address> {
        self.handler_address_for_resource_id(resource_id).await
    }
}

async fn fetch_sorted<C: LogQuery>(
    client: &C,
    filter: Filter,
) -> Result<Vec<Log>> {
    let mut logs = client.logs(&filter).await?;
    logs.sort_by_key(events::log_order_key);
    Ok(logs)
}

fn block_hash_of(log: &Log) -> [u8; 32] {
    log.block_hash.unwrap_or_default().to_fixed_bytes()
}

fn log_index_of(log: &Log) -> u64 {
    log.log_index.map(|i| i.as_u64()).unwrap_or_default()
}

/// Derives the EVM address of the MPC group key.
pub fn mpc_address_of(public_key: &[u8]) -> Result<Address> {
    use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
    let key = ethers::core::k256::PublicKey::from_sec1_bytes(public_key)
        .map_err(|_| Error::Generic("invalid group public key"))?;
    let uncompressed = key.to_encoded_point(false);
    let digest = ethers::utils::keccak256(&uncompressed.as_bytes()[1..]);
    Ok(Address::from_slice(&digest[12..]))
}

/// Decodes Deposit logs into [`Message`]s and forwards them towards the
/// destination chain's executor.
pub struct DepositEventHandler<C> {
    client: Arc<C>,
    resolver: Arc<dyn ResourceResolver>,
    bridge_address: Address,
    domain_id: u8,
    resources: HashMap<Address, ResourceType>,
}

impl<C: LogQuery> DepositEventHandler<C> {
    /// Creates a deposit handler with no registered resources.
    pub fn new(
        client: Arc<C>,
        resolver: Arc<dyn ResourceResolver>,
        bridge_address: Address,
        domain_id: u8,
    ) -> Self {
        Self {
            client,
            resolver,
            bridge_address,
            domain_id,
            resources: HashMap::new(),
        }
    }

    /// Registers the payload decoder for a handler contract.
    pub fn register_handler(
        &mut self,
        handler: Address,
        resource: ResourceType,
    ) {
        self.resources.insert(handler, resource);
    }

    async fn message_of(&self, log: &Log) -> Result<Message> {
        let deposit = events::decode_deposit(log)?;
        let handler =
            self.resolver.handler_of(deposit.resource_id).await?;
        let resource = self
            .resources
            .get(&handler)
            .copied()
            .ok_or(Error::InvalidDepositData("unregistered handler"))?;
        let payload = parse_deposit(resource, &deposit.data)?;
        Ok(Message::new(
            self.domain_id,
            deposit.destination_domain_id,
            deposit.deposit_nonce,
            deposit.resource_id,
            payload,
        ))
    }
}

#[async_trait]
impl<C: LogQuery> EventHandler for DepositEventHandler<C> {
    fn name(&self) -> &'static str {
        "deposit"
    }

    async fn handle(
        &self,
        start_block: u64,
        end_block: u64,
        msg_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(events::deposit_signature())
            .from_block(start_block)
            .to_block(end_block);
        for log in fetch_sorted(self.client.as_ref(), filter).await? {
            let message = self.message_of(&log).await?;
            tracing::debug!(
                message_id = %message.message_id,
                "decoded deposit",
            );
            msg_tx
                .send(message)
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }
}

/// Starts a keygen session on the first observation of a `StartKeygen`
/// event. Duplicate observations resolve to the in-flight session or are
/// skipped outright once a keyshare exists.
pub struct KeygenEventHandler<C> {
    client: Arc<C>,
    bridge_address: Address,
    topology_provider: Arc<dyn NetworkTopologyProvider>,
    coordinator: Arc<Coordinator>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
    bridge: Arc<dyn BridgeOps>,
    token: CancellationToken,
}

impl<C: LogQuery> KeygenEventHandler<C> {
    /// Creates the keygen handler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<C>,
        bridge_address: Address,
        topology_provider: Arc<dyn NetworkTopologyProvider>,
        coordinator: Arc<Coordinator>,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
        bridge: Arc<dyn BridgeOps>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            bridge_address,
            topology_provider,
            coordinator,
            scheme,
            keyshare_store,
            bridge,
            token,
        }
    }
}

#[async_trait]
impl<C: LogQuery> EventHandler for KeygenEventHandler<C> {
    fn name(&self) -> &'static str {
        "keygen"
    }

    async fn handle(
        &self,
        start_block: u64,
        end_block: u64,
        _msg_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(events::start_keygen_signature())
            .from_block(start_block)
            .to_block(end_block);
        for log in fetch_sorted(self.client.as_ref(), filter).await? {
            if self.keyshare_store.exists() {
                tracing::debug!(
                    "keyshare already present, ignoring keygen event",
                );
                continue;
            }
            let session_id = SessionId::keygen(
                &block_hash_of(&log),
                log_index_of(&log),
            );
            let topology = self.topology_provider.network_topology()?;
            let process = Arc::new(Keygen::new(
                session_id,
                &topology,
                self.scheme.clone(),
                self.keyshare_store.clone(),
            ));
            let result =
                match self.coordinator.execute(&self.token, process).await
                {
                    Ok(result) => result,
                    // someone else on this node is already driving it
                    Err(Error::SessionAlreadyRunning(_)) => continue,
                    Err(e) => return Err(e),
                };
            if result.leader == self.coordinator.local_peer() {
                let CeremonyOutput::Keyshare(keyshare) = result.output
                else {
                    return Err(Error::Generic(
                        "keygen session produced no keyshare",
                    ));
                };
                let mpc_address = mpc_address_of(&keyshare.public_key)?;
                self.bridge
                    .end_keygen(mpc_address, TransactOptions::default())
                    .await?;
                tracing::info!(%mpc_address, "submitted endKeygen");
            }
        }
        Ok(())
    }
}

/// Reloads the topology and runs a refresh session over the union of the
/// outgoing and incoming committees.
pub struct RefreshEventHandler<C> {
    client: Arc<C>,
    bridge_address: Address,
    topology_provider: Arc<dyn NetworkTopologyProvider>,
    host: Arc<crate::comm::Host>,
    coordinator: Arc<Coordinator>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
    token: CancellationToken,
}

impl<C: LogQuery> RefreshEventHandler<C> {
    /// Creates the refresh handler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<C>,
        bridge_address: Address,
        topology_provider: Arc<dyn NetworkTopologyProvider>,
        host: Arc<crate::comm::Host>,
        coordinator: Arc<Coordinator>,
        scheme: Arc<dyn ThresholdScheme>,
        keyshare_store: Arc<KeyshareStore>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            bridge_address,
            topology_provider,
            host,
            coordinator,
            scheme,
            keyshare_store,
            token,
        }
    }
}

#[async_trait]
impl<C: LogQuery> EventHandler for RefreshEventHandler<C> {
    fn name(&self) -> &'static str {
        "refresh"
    }

    async fn handle(
        &self,
        start_block: u64,
        end_block: u64,
        _msg_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(events::key_refresh_signature())
            .from_block(start_block)
            .to_block(end_block);
        for log in fetch_sorted(self.client.as_ref(), filter).await? {
            let topology_hash = events::decode_key_refresh(&log)?;
            tracing::info!(%topology_hash, "refresh event observed");

            // the outgoing committee is whoever holds a share today
            let old_participants = match self.keyshare_store.load() {
                Ok(share) => share.participants,
                Err(Error::KeyshareNotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            self.topology_provider.invalidate();
            let new_topology = self.topology_provider.reload()?;
            // admit the incoming committee before the ceremony starts
            self.host.set_topology(&new_topology);

            let session_id = SessionId::refresh(
                &block_hash_of(&log),
                log_index_of(&log),
            );
            let process = Arc::new(Refresh::new(
                session_id,
                &old_participants,
                new_topology.clone(),
                self.scheme.clone(),
                self.keyshare_store.clone(),
            ));
            match self.coordinator.execute(&self.token, process).await {
                Ok(_) => {
                    tracing::info!(
                        epoch = new_topology.epoch,
                        "keyshare refreshed, topology epoch published",
                    );
                }
                Err(Error::SessionAlreadyRunning(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Re-scans a previously processed block range named by a `Retry` event and
/// re-enqueues its deposits; already executed proposals are dropped by the
/// destination executor.
pub struct RetryEventHandler<C> {
    client: Arc<C>,
    bridge_address: Address,
    deposits: Arc<DepositEventHandler<C>>,
}

impl<C: LogQuery> RetryEventHandler<C> {
    /// Creates the retry handler, re-using the deposit pipeline.
    pub fn new(
        client: Arc<C>,
        bridge_address: Address,
        deposits: Arc<DepositEventHandler<C>>,
    ) -> Self {
        Self {
            client,
            bridge_address,
            deposits,
        }
    }
}

#[async_trait]
impl<C: LogQuery> EventHandler for RetryEventHandler<C> {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(
        &self,
        start_block: u64,
        end_block: u64,
        msg_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(events::retry_signature())
            .from_block(start_block)
            .to_block(end_block);
        for log in fetch_sorted(self.client.as_ref(), filter).await? {
            let (low, high) = events::decode_retry(&log)?;
            if low > high {
                tracing::warn!(low, high, "ignoring inverted retry range");
                continue;
            }
            tracing::info!(low, high, "re-scanning range for deposits");
            self.deposits.handle(low, high, msg_tx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::evm::deposit::construct_erc20_deposit_data;
    use crate::chains::DepositPayload;
    use ethers::abi::{encode, Token};
    use ethers::types::{Bytes, H256, U256, U64};
    use std::sync::Mutex;

    struct MockLogs {
        logs: Mutex<Vec<Log>>,
    }

    #[async_trait]
    impl LogQuery for MockLogs {
        async fn logs(&self, filter: &Filter) -> Result<Vec<Log>> {
            let topic = match &filter.topics[0] {
                Some(ethers::types::ValueOrArray::Value(Some(topic))) => {
                    *topic
                }
                _ => return Ok(vec![]),
            };
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| log.topics.first() == Some(&topic))
                .cloned()
                .collect())
        }
    }

    struct FixedResolver {
        handler: Address,
    }

    #[async_trait]
    impl ResourceResolver for FixedResolver {
        async fn handler_of(&self, _resource_id: [u8; 32]) -> Result<Address> {
            Ok(self.handler)
        }
    }

    fn deposit_log(nonce: u64, block: u64, log_index: u64) -> Log {
        let sender: Address =
            "0x1111111111111111111111111111111111111111".parse().unwrap();
        let mut resource_id = [0u8; 32];
        resource_id[31] = 0x01;
        let data = construct_erc20_deposit_data(
            sender.as_bytes(),
            U256::from(1_000_000u64),
        );
        let encoded = encode(&[
            Token::Uint(U256::from(2u8)),
            Token::FixedBytes(resource_id.to_vec()),
            Token::Uint(U256::from(nonce)),
            Token::Bytes(data),
            Token::Bytes(vec![]),
        ]);
        let mut sender_topic = [0u8; 32];
        sender_topic[12..].copy_from_slice(sender.as_bytes());
        Log {
            topics: vec![
                events::deposit_signature(),
                H256::from(sender_topic),
            ],
            data: Bytes::from(encoded),
            block_number: Some(U64::from(block)),
            transaction_index: Some(U64::from(0u64)),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        }
    }

    fn erc20_handler() -> Address {
        "0x2222222222222222222222222222222222222222".parse().unwrap()
    }

    fn deposit_handler(
        client: Arc<MockLogs>,
    ) -> DepositEventHandler<MockLogs> {
        let mut handler = DepositEventHandler::new(
            client,
            Arc::new(FixedResolver {
                handler: erc20_handler(),
            }),
            Address::zero(),
            1,
        );
        handler.register_handler(erc20_handler(), ResourceType::Erc20);
        handler
    }

    #[tokio::test]
    async fn deposits_become_messages_in_log_order() {
        let client = Arc::new(MockLogs {
            logs: Mutex::new(vec![
                // inserted out of order on purpose
                deposit_log(43, 1000, 7),
                deposit_log(42, 1000, 3),
            ]),
        });
        let handler = deposit_handler(client);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        handler.handle(1000, 1000, &msg_tx).await.unwrap();

        let first = msg_rx.recv().await.unwrap();
        let second = msg_rx.recv().await.unwrap();
        assert_eq!(first.deposit_nonce, 42);
        assert_eq!(second.deposit_nonce, 43);
        assert_eq!(first.message_id, "1-2-42");
        assert_eq!(first.source, 1);
        assert_eq!(first.destination, 2);
        match &first.payload {
            DepositPayload::Erc20 {
                amount, priority, ..
            } => {
                assert_eq!(*amount, U256::from(1_000_000u64));
                assert_eq!(*priority, None);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_events_replay_the_named_range() {
        let retry_data = encode(&[
            Token::Uint(U256::from(900u64)),
            Token::Uint(U256::from(950u64)),
        ]);
        let retry_log = Log {
            topics: vec![events::retry_signature()],
            data: Bytes::from(retry_data),
            block_number: Some(U64::from(1200u64)),
            ..Default::default()
        };
        let client = Arc::new(MockLogs {
            logs: Mutex::new(vec![retry_log, deposit_log(17, 920, 0)]),
        });
        let deposits = Arc::new(deposit_handler(client.clone()));
        let retry = RetryEventHandler::new(
            client,
            Address::zero(),
            deposits,
        );
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        retry.handle(1200, 1200, &msg_tx).await.unwrap();

        let replayed = msg_rx.recv().await.unwrap();
        assert_eq!(replayed.deposit_nonce, 17);
    }

    #[test]
    fn mpc_address_is_derived_from_the_group_key() {
        // the generator point of secp256k1, compressed
        let generator = hex::decode(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let address = mpc_address_of(&generator).unwrap();
        // well-known address of the generator public key
        assert_eq!(
            address,
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
                .parse::<Address>()
                .unwrap()
        );
        assert!(mpc_address_of(&[0u8; 33]).is_err());
    }
}
