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

//! # Relayer Context Module
//!
//! A module for managing the context of the relayer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RelayerConfig;
use crate::error::Result;
use crate::metric::Metrics;
use crate::store::sled::SledBlockStore;

/// RelayerContext contains the relayer's configuration, the root cancellation
/// token and the handles every long-lived subsystem receives at construction.
///
/// Cancellation is hierarchical: the root token is owned here, every chain
/// task gets a child of it, and every session gets a child of its chain's
/// token. Cancelling the root cancels everything underneath.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: RelayerConfig,
    /// Represents the metrics for the relayer.
    pub metrics: Arc<Metrics>,
    root: CancellationToken,
    tracker: TaskTracker,
    store: Arc<SledBlockStore>,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(
        config: RelayerConfig,
        store: Arc<SledBlockStore>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        Ok(Self {
            config,
            metrics,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            store,
        })
    }

    /// Returns a child of the root cancellation token. Subsystems derive
    /// their own children from it; they never hold the root.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Initiates the graceful shutdown by cancelling the root token.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Spawns a tracked background task. Tracked tasks are awaited during
    /// the graceful shutdown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Waits for all tracked tasks to finish, up to `grace`. Returns `true`
    /// when everything wound down in time, `false` when the grace period
    /// expired and tasks are still running.
    pub async fn wait_for_shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok()
    }

    /// Returns the persistent block cursor store.
    pub fn store(&self) -> Arc<SledBlockStore> {
        self.store.clone()
    }
}
