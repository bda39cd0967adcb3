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

//! # Relayer Service Module
//!
//! Builds the full relayer object graph from the configuration and fires
//! the background services: topology provider, p2p host, communication,
//! elector factory, session coordinator, keyshare store, and one chain
//! adapter per configured chain, all wired into the relayer routing loop.

use std::sync::Arc;

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use libp2p_identity::Keypair;
use tokio::sync::mpsc;

use crate::chains::evm::contracts::BridgeContract;
use crate::chains::evm::deposit::ResourceType;
use crate::chains::evm::executor::{EvmExecutor, HandlerAddresses};
use crate::chains::evm::gas::GasPricer;
use crate::chains::evm::handlers::{
    DepositEventHandler, KeygenEventHandler, RefreshEventHandler,
    RetryEventHandler,
};
use crate::chains::evm::listener::{
    EventHandler, EvmListener, ListenerConfig,
};
use crate::chains::evm::EvmChain;
use crate::chains::{ChainKind, RelayedChain, Relayer};
use crate::comm::{Comm, Communication, Host};
use crate::config::ChainConfig;
use crate::context::RelayerContext;
use crate::elector::CoordinatorElectorFactory;
use crate::error::{Error, Result};
use crate::probe;
use crate::store::{KeyshareStore, SledBlockStore};
use crate::topology::{FileTopologyProvider, NetworkTopologyProvider};
use crate::tss::ceremony::ThresholdScheme;
use crate::tss::frost::FrostScheme;
use crate::tss::Coordinator;

/// Everything a chain builder needs from the shared MPC plumbing.
struct MpcStack {
    host: Arc<Host>,
    coordinator: Arc<Coordinator>,
    topology_provider: Arc<dyn NetworkTopologyProvider>,
    scheme: Arc<dyn ThresholdScheme>,
    keyshare_store: Arc<KeyshareStore>,
    blockstore: Arc<SledBlockStore>,
}

/// Starts all background services of the relayer. Returns once everything
/// is spawned; fatal errors of the running services arrive on `fatal_tx`.
pub async fn ignite(
    ctx: &RelayerContext,
    fatal_tx: mpsc::Sender<Error>,
) -> Result<()> {
    let config = ctx.config.clone();
    let metrics = ctx.metrics.clone();

    let topology_provider: Arc<dyn NetworkTopologyProvider> = Arc::new(
        FileTopologyProvider::new(&config.mpc.topology.path),
    );
    let topology = topology_provider.network_topology()?;

    let key_bytes = std::fs::read(&config.mpc.keystore_path)?;
    let keypair = Keypair::from_protobuf_encoding(&key_bytes)?;

    let comm_token = ctx.shutdown_token();
    let (host, inbound_rx) = Host::new(
        keypair,
        &topology,
        config.mpc.port,
        metrics.clone(),
        comm_token.clone(),
    );
    host.start().await?;
    let comm: Arc<dyn Comm> = Communication::new(
        host.clone(),
        inbound_rx,
        metrics.clone(),
        comm_token,
    );

    let elector_factory =
        CoordinatorElectorFactory::new(comm.clone(), config.bully);
    let coordinator = Arc::new(Coordinator::new(
        comm,
        elector_factory,
        config.session,
        metrics.clone(),
    ));
    let keyshare_store =
        Arc::new(KeyshareStore::new(&config.mpc.keyshare_path));
    let scheme: Arc<dyn ThresholdScheme> = Arc::new(FrostScheme);

    let stack = MpcStack {
        host,
        coordinator,
        topology_provider,
        scheme,
        keyshare_store,
        blockstore: ctx.store(),
    };

    let mut chains: Vec<Arc<dyn RelayedChain>> = Vec::new();
    for chain_config in &config.chains {
        match chain_config.kind {
            ChainKind::Evm => {
                let chain = build_evm_chain(
                    ctx,
                    chain_config,
                    &stack,
                )
                .await?;
                tracing::info!(
                    domain_id = chain_config.id,
                    chain = %chain_config.name,
                    "initialized evm chain",
                );
                chains.push(chain);
            }
        }
    }

    let relayer = Relayer::new(chains, metrics);
    let relayer_token = ctx.shutdown_token();
    ctx.spawn(async move {
        relayer.start(relayer_token, fatal_tx).await;
    });
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        services_started = true,
    );
    Ok(())
}

fn parse_address(
    value: &str,
    what: &'static str,
) -> Result<Address> {
    value.parse().map_err(|_| Error::Generic(what))
}

async fn build_evm_chain(
    ctx: &RelayerContext,
    config: &ChainConfig,
    stack: &MpcStack,
) -> Result<Arc<dyn RelayedChain>> {
    let provider =
        Arc::new(Provider::<Http>::try_from(config.endpoint.as_str())?);
    let private_key = config
        .private_key
        .as_ref()
        .ok_or(Error::MissingSecrets)?;
    let wallet: LocalWallet = private_key.parse()?;
    let chain_id = provider.get_chainid().await?;
    let wallet = wallet.with_chain_id(chain_id.as_u64());
    let client =
        Arc::new(SignerMiddleware::new((*provider).clone(), wallet));

    let bridge_address =
        parse_address(&config.bridge, "invalid bridge address")?;
    let erc20_handler = parse_address(
        &config.erc20_handler,
        "invalid erc20 handler address",
    )?;
    let erc721_handler = parse_address(
        &config.erc721_handler,
        "invalid erc721 handler address",
    )?;
    let generic_handler = parse_address(
        &config.generic_handler,
        "invalid generic handler address",
    )?;

    let gas_pricer = GasPricer::new(
        provider.clone(),
        config.max_gas_price,
        config.gas_multiplier,
    );
    let bridge = Arc::new(BridgeContract::new(
        client,
        bridge_address,
        gas_pricer,
    ));

    let chain_token = ctx.shutdown_token();
    let mut deposit_handler = DepositEventHandler::new(
        provider.clone(),
        bridge.clone(),
        bridge_address,
        config.id,
    );
    deposit_handler.register_handler(erc20_handler, ResourceType::Erc20);
    deposit_handler
        .register_handler(erc721_handler, ResourceType::Erc721);
    deposit_handler
        .register_handler(generic_handler, ResourceType::Generic);
    let deposit_handler = Arc::new(deposit_handler);

    let keygen_handler = Arc::new(KeygenEventHandler::new(
        provider.clone(),
        bridge_address,
        stack.topology_provider.clone(),
        stack.coordinator.clone(),
        stack.scheme.clone(),
        stack.keyshare_store.clone(),
        bridge.clone(),
        chain_token.clone(),
    ));
    let refresh_handler = Arc::new(RefreshEventHandler::new(
        provider.clone(),
        bridge_address,
        stack.topology_provider.clone(),
        stack.host.clone(),
        stack.coordinator.clone(),
        stack.scheme.clone(),
        stack.keyshare_store.clone(),
        chain_token.clone(),
    ));
    let retry_handler = Arc::new(RetryEventHandler::new(
        provider.clone(),
        bridge_address,
        deposit_handler.clone(),
    ));
    let handlers: Vec<Arc<dyn EventHandler>> = vec![
        deposit_handler,
        keygen_handler,
        refresh_handler,
        retry_handler,
    ];

    let listener = EvmListener::new(
        provider,
        handlers,
        stack.blockstore.clone(),
        config.id,
        ListenerConfig {
            block_confirmations: config.block_confirmations,
            block_retry_interval: config.block_retry_interval(),
            max_block_range: config.max_block_range,
            start_block: config.start_block,
            fresh_start: config.fresh_start,
        },
        ctx.metrics.clone(),
    );
    let executor = EvmExecutor::new(
        bridge,
        stack.coordinator.clone(),
        stack.topology_provider.clone(),
        stack.scheme.clone(),
        stack.keyshare_store.clone(),
        HandlerAddresses {
            erc20: erc20_handler,
            erc721: erc721_handler,
            generic: generic_handler,
        },
        config.revert_on_fail,
        chain_token,
        ctx.metrics.clone(),
    );

    Ok(Arc::new(EvmChain::new(config.id, listener, executor)))
}

/// The idle loop of the daemon: waits for a fatal service error or an
/// external shutdown request (driven by `main`), then winds everything
/// down within the configured grace period.
pub async fn wind_down(ctx: &RelayerContext) -> bool {
    ctx.shutdown();
    let clean = ctx
        .wait_for_shutdown(ctx.config.shutdown_grace())
        .await;
    if clean {
        tracing::info!("clean exit");
    } else {
        tracing::error!(
            "shutdown grace period expired, aborting remaining tasks",
        );
    }
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        shutdown = true,
    );
    clean
}
