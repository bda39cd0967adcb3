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

//! # Relayer Store Module
//!
//! Persistent state of the relayer: the per-chain block cursor and the local
//! threshold keyshare. Both stores are single-writer; readers observe a
//! consistent snapshot through the store's atomic read.

/// A module for setting up and managing the [Sled](https://sled.rs)-based
/// block cursor store.
pub mod sled;

/// The threshold keyshare store.
pub mod keyshare;

pub use keyshare::{Keyshare, KeyshareStore};
pub use sled::SledBlockStore;

use crate::error::Result;

/// BlockStore is a simple trait for persisting the last fully processed
/// block per chain.
pub trait BlockStore: Send + Sync {
    /// Durably records `block` as the last processed block of `chain_id`.
    fn store_block(&self, chain_id: u8, block: u64) -> Result<()>;

    /// The last processed block of `chain_id`, or `None` when the chain has
    /// never been indexed.
    fn latest_block(&self, chain_id: u8) -> Result<Option<u64>>;
}
