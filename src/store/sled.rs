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

use std::path::Path;

use super::BlockStore;
use crate::error::Result;

const BLOCKS_TREE: &str = "last_processed_blocks";

/// SledBlockStore persists the per-chain block cursor in a
/// [Sled](https://sled.rs)-based database.
///
/// Layout: key = the chain's domain id, value = 8-byte big-endian block
/// number.
#[derive(Clone)]
pub struct SledBlockStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBlockStore").finish()
    }
}

impl SledBlockStore {
    /// Create a new SledBlockStore.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// Creates a temporary SledBlockStore.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::open(dir.path())
    }
}

impl BlockStore for SledBlockStore {
    #[tracing::instrument(skip(self))]
    fn store_block(&self, chain_id: u8, block: u64) -> Result<()> {
        let tree = self.db.open_tree(BLOCKS_TREE)?;
        tree.insert([chain_id], &block.to_be_bytes())?;
        tree.flush()?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn latest_block(&self, chain_id: u8) -> Result<Option<u64>> {
        let tree = self.db.open_tree(BLOCKS_TREE)?;
        let val = tree.get([chain_id])?;
        match val {
            Some(v) => {
                let mut output = [0u8; 8];
                output.copy_from_slice(&v);
                Ok(Some(u64::from_be_bytes(output)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_chain_has_no_cursor() {
        let store = SledBlockStore::temporary().unwrap();
        assert_eq!(store.latest_block(1).unwrap(), None);
    }

    #[test]
    fn stores_and_reads_back_the_cursor() {
        let store = SledBlockStore::temporary().unwrap();
        store.store_block(1, 999).unwrap();
        assert_eq!(store.latest_block(1).unwrap(), Some(999));
        store.store_block(1, 1_000).unwrap();
        assert_eq!(store.latest_block(1).unwrap(), Some(1_000));
        // other chains are unaffected
        assert_eq!(store.latest_block(2).unwrap(), None);
    }

    #[test]
    fn cursor_is_big_endian_on_disk() {
        let store = SledBlockStore::temporary().unwrap();
        store.store_block(3, 0x0102030405060708).unwrap();
        let tree = store.db.open_tree(BLOCKS_TREE).unwrap();
        let raw = tree.get([3u8]).unwrap().unwrap();
        assert_eq!(raw.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
