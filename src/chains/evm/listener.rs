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

//! The EVM chain listener: polls finalized blocks in bounded ranges,
//! dispatches them to the registered event handlers and advances the
//! persistent cursor only once every handler succeeded for the range.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use futures::TryFutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chains::Message;
use crate::error::Result;
use crate::metric::Metrics;
use crate::probe;
use crate::retry::BoundedExponential;
use crate::store::BlockStore;

/// How often one handler is retried within a tick before the whole range
/// is abandoned until the next tick.
const MAX_HANDLER_RETRY_COUNT: usize = 5;
/// How often a failing head fetch is retried before the listener degrades
/// to its regular polling cadence.
const MAX_RPC_RETRY_COUNT: usize = 5;

/// One registered event handler, invoked per fetched block range. Handlers
/// MUST be idempotent: a crash before the cursor advance re-delivers the
/// whole range.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A short tag identifying the handler in logs.
    fn name(&self) -> &'static str;

    /// Handles all matching logs in `[start_block, end_block]`.
    async fn handle(
        &self,
        start_block: u64,
        end_block: u64,
        msg_tx: &mpsc::Sender<Message>,
    ) -> Result<()>;
}

/// The source of the chain head height.
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// The latest block number of the chain.
    async fn head_block(&self) -> Result<u64>;
}

#[async_trait]
impl HeadSource for Provider<Http> {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.get_block_number().await?.as_u64())
    }
}

/// Polling configuration of one listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How many blocks behind the head the listener stays.
    pub block_confirmations: u64,
    /// Polling cadence.
    pub block_retry_interval: Duration,
    /// Maximum number of blocks fetched per step.
    pub max_block_range: u64,
    /// Where to start when the blockstore has no cursor.
    pub start_block: u64,
    /// Ignore the persisted cursor and start from `start_block`.
    pub fresh_start: bool,
}

/// The EVM chain listener.
pub struct EvmListener<H> {
    head: Arc<H>,
    handlers: Vec<Arc<dyn EventHandler>>,
    blockstore: Arc<dyn BlockStore>,
    domain_id: u8,
    config: ListenerConfig,
    metrics: Arc<Metrics>,
}

impl<H: HeadSource> EvmListener<H> {
    /// Creates a listener over the registered handlers.
    pub fn new(
        head: Arc<H>,
        handlers: Vec<Arc<dyn EventHandler>>,
        blockstore: Arc<dyn BlockStore>,
        domain_id: u8,
        config: ListenerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            head,
            handlers,
            blockstore,
            domain_id,
            config,
            metrics,
        }
    }

    async fn idle(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.config.block_retry_interval) => false,
        }
    }

    /// Polls until cancelled. Cursor advance is all-or-nothing per fetched
    /// range; a failing handler or blockstore write leaves the cursor
    /// untouched so the range is re-delivered on the next tick.
    pub async fn listen(
        &self,
        token: CancellationToken,
        msg_tx: mpsc::Sender<Message>,
    ) -> Result<()> {
        let mut cursor = if self.config.fresh_start {
            self.config.start_block
        } else {
            self.blockstore
                .latest_block(self.domain_id)?
                .unwrap_or(self.config.start_block)
        };
        tracing::info!(
            domain_id = self.domain_id,
            cursor,
            "starting chain listener",
        );
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            // transient RPC failures back off exponentially; once the
            // budget is spent the listener falls back to its polling
            // cadence and tries again next tick
            let head_backoff = BoundedExponential::new(
                Duration::from_millis(250),
                MAX_RPC_RETRY_COUNT,
            );
            let fetch_head = || {
                self.head.head_block().map_err(backoff::Error::transient)
            };
            let head = match backoff::future::retry(head_backoff, fetch_head)
                .await
            {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!(
                        domain_id = self.domain_id,
                        error = %e,
                        "chain head unavailable after retries",
                    );
                    if self.idle(&token).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            let finalized = head.saturating_sub(self.config.block_confirmations);
            let from = cursor + 1;
            let to = finalized.min(cursor + self.config.max_block_range);
            if from > to {
                // nothing new below the confirmation depth
                if self.idle(&token).await {
                    return Ok(());
                }
                continue;
            }

            let mut all_ok = true;
            for handler in &self.handlers {
                // transient failures are retried in place with growing
                // waits before the whole range is abandoned until the
                // next tick
                let backoff = BoundedExponential::new(
                    Duration::from_millis(100),
                    MAX_HANDLER_RETRY_COUNT,
                );
                let attempt = || {
                    handler
                        .handle(from, to, &msg_tx)
                        .map_err(backoff::Error::transient)
                };
                if let Err(e) = backoff::future::retry(backoff, attempt).await
                {
                    tracing::error!(
                        domain_id = self.domain_id,
                        handler = handler.name(),
                        from,
                        to,
                        error = %e,
                        "event handler failed, range will be re-delivered",
                    );
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::TRACE,
                        kind = %probe::Kind::Retry,
                        domain_id = self.domain_id,
                        handler = handler.name(),
                    );
                    all_ok = false;
                    break;
                }
            }
            if !all_ok {
                if self.idle(&token).await {
                    return Ok(());
                }
                continue;
            }

            if let Err(e) = self.blockstore.store_block(self.domain_id, to)
            {
                tracing::error!(
                    domain_id = self.domain_id,
                    error = %e,
                    "failed to persist block cursor",
                );
                if self.idle(&token).await {
                    return Ok(());
                }
                continue;
            }
            self.metrics.blocks_processed.inc_by(to - from + 1);
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::TRACE,
                kind = %probe::Kind::Sync,
                domain_id = self.domain_id,
                from,
                to,
                head,
            );
            cursor = to;
        }
    }
}
