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

//! Configuration of the relayer.
//!
//! The configuration is loaded from a single file (TOML or JSON, anything the
//! [`config`](https://docs.rs/config) crate understands) plus environment
//! variables prefixed with `RELAYER_`. Keys are kebab-case.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chains::ChainKind;
use crate::error::{Error, Result};

const fn default_port() -> u16 {
    9000
}
const fn default_election_wait() -> u64 {
    2_000
}
const fn default_ping_wait() -> u64 {
    1_000
}
const fn default_leader_wait() -> u64 {
    5_000
}
const fn default_start_timeout() -> u64 {
    15_000
}
const fn default_round_timeout() -> u64 {
    60_000
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_shutdown_grace() -> u64 {
    10_000
}
const fn default_gas_multiplier() -> f64 {
    1.0
}
const fn default_block_confirmations() -> u64 {
    10
}
const fn default_block_retry_interval() -> u64 {
    5_000
}
const fn default_max_block_range() -> u64 {
    100
}

/// RelayerConfig is the top level configuration of the relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerConfig {
    /// Directory for the persistent block cursor store.
    pub blockstore_path: PathBuf,
    /// MPC committee configuration.
    pub mpc: MpcConfig,
    /// Bully election timeouts.
    #[serde(default)]
    pub bully: BullyConfig,
    /// Session coordinator timeouts and retry bounds.
    #[serde(default)]
    pub session: SessionConfig,
    /// Grace period for the graceful shutdown, in milliseconds. Tasks still
    /// running after this period are aborted.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    /// The chains this relayer serves.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl RelayerConfig {
    /// Makes sure that the config is valid, by going through the whole config
    /// and doing some basic checks. Configuration errors are fatal for the
    /// process at startup.
    pub fn verify(&self) -> Result<()> {
        if self.mpc.threshold < 1 {
            return Err(Error::Generic("mpc threshold must be at least 1"));
        }
        if self.chains.is_empty() {
            return Err(Error::Generic("no chains configured"));
        }
        for chain in &self.chains {
            if chain.private_key.is_none() {
                return Err(Error::MissingSecrets);
            }
        }
        Ok(())
    }

    /// The graceful shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace)
    }
}

/// MPC committee configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MpcConfig {
    /// TCP port for the p2p listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// The signing threshold `t`. A signature requires `t + 1` online
    /// participants.
    pub threshold: u32,
    /// Path to this node's long-term p2p private key (protobuf encoded).
    pub keystore_path: PathBuf,
    /// Path to the current threshold keyshare.
    pub keyshare_path: PathBuf,
    /// Sub-config for the topology provider.
    pub topology: TopologyConfig,
}

/// Topology provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyConfig {
    /// Path to the JSON topology document.
    pub path: PathBuf,
}

/// Timeouts of the bully coordinator election, in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BullyConfig {
    /// How long to wait for an `OK` from a better ranked peer.
    #[serde(default = "default_election_wait")]
    pub election_wait: u64,
    /// Spacing between repeated election attempts.
    #[serde(default = "default_ping_wait")]
    pub ping_wait: u64,
    /// How long to wait for the `COORD` announcement of the winner.
    #[serde(default = "default_leader_wait")]
    pub leader_wait: u64,
}

impl Default for BullyConfig {
    fn default() -> Self {
        Self {
            election_wait: default_election_wait(),
            ping_wait: default_ping_wait(),
            leader_wait: default_leader_wait(),
        }
    }
}

impl BullyConfig {
    /// How long to wait for an `OK` from a better ranked peer.
    pub fn election_wait(&self) -> Duration {
        Duration::from_millis(self.election_wait)
    }
    /// Spacing between repeated election attempts.
    pub fn ping_wait(&self) -> Duration {
        Duration::from_millis(self.ping_wait)
    }
    /// How long to wait for the `COORD` announcement of the winner.
    pub fn leader_wait(&self) -> Duration {
        Duration::from_millis(self.leader_wait)
    }
}

/// Session coordinator timeouts and retry bounds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    /// How long a follower waits for the leader's start message before
    /// treating the leader as failed, in milliseconds.
    #[serde(default = "default_start_timeout")]
    pub start_timeout: u64,
    /// How long one ceremony round may wait for peer messages, in
    /// milliseconds.
    #[serde(default = "default_round_timeout")]
    pub round_timeout: u64,
    /// How many times a session is restarted on a backup coordinator before
    /// giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout: default_start_timeout(),
            round_timeout: default_round_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl SessionConfig {
    /// The follower-side start timeout.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout)
    }
    /// The per-round gather timeout.
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout)
    }
}

/// Configuration of a single relayed chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// Chain adapter kind.
    #[serde(rename = "type")]
    pub kind: ChainKind,
    /// The bridge domain id of this chain.
    pub id: u8,
    /// Human readable chain name, used in logs.
    pub name: String,
    /// HTTP RPC endpoint.
    pub endpoint: url::Url,
    /// Bridge contract address.
    pub bridge: String,
    /// ERC-20 handler contract address.
    pub erc20_handler: String,
    /// ERC-721 handler contract address.
    pub erc721_handler: String,
    /// Generic handler contract address.
    pub generic_handler: String,
    /// Upper bound for the max fee per gas, in wei.
    pub max_gas_price: u64,
    /// Multiplier applied to the estimated gas price.
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    /// How many blocks behind the head the listener stays.
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    /// Polling cadence of the listener, in milliseconds.
    #[serde(default = "default_block_retry_interval")]
    pub block_retry_interval: u64,
    /// Maximum number of blocks fetched per polling step.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// The block to start indexing from when the blockstore has no cursor.
    #[serde(default)]
    pub start_block: u64,
    /// Ignore the persisted cursor and start from `start_block`.
    #[serde(default)]
    pub fresh_start: bool,
    /// The relayer account private key, hex encoded.
    ///
    /// Can also be supplied through the environment.
    pub private_key: Option<String>,
    /// Whether a reverting `executeProposal` should surface as a failure
    /// instead of being logged and verified.
    #[serde(default)]
    pub revert_on_fail: bool,
}

impl ChainConfig {
    /// Polling cadence of the listener.
    pub fn block_retry_interval(&self) -> Duration {
        Duration::from_millis(self.block_retry_interval)
    }
}

/// Loads and verifies the configuration from the given file path.
pub fn load<P: AsRef<Path>>(path: P) -> Result<RelayerConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            config::Environment::with_prefix("RELAYER").separator("__"),
        )
        .build()?;
    let cfg: RelayerConfig = cfg.try_deserialize()?;
    cfg.verify()?;
    Ok(cfg)
}
