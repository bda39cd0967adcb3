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

//! The network topology: the current MPC committee, its addresses and the
//! signing threshold.
//!
//! A topology snapshot is immutable; consumers hold it behind an [`Arc`] and
//! a new snapshot supersedes it only through a refresh event.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use libp2p_identity::PeerId;
use serde::Deserialize;

use crate::error::{Error, Result};

/// A committee member: its identity and the address its p2p listener is
/// reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer identity, derived from its long-term public key.
    pub id: PeerId,
    /// The peer's p2p listen address.
    pub address: SocketAddr,
}

/// An immutable snapshot of the MPC committee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    /// The committee members.
    pub peers: Vec<PeerInfo>,
    /// The signing threshold `t`; `t + 1` participants must be online.
    pub threshold: u32,
    /// Monotonically increasing epoch, bumped on every reload.
    pub epoch: u64,
}

impl NetworkTopology {
    /// The identities of all committee members.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// Whether `peer` is a committee member under this snapshot.
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.id == peer)
    }

    /// The address of `peer`, if it is a committee member.
    pub fn address_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peers.iter().find(|p| &p.id == peer).map(|p| p.address)
    }

    fn verify(&self) -> Result<()> {
        if self.threshold < 1 {
            return Err(Error::Generic("topology threshold must be >= 1"));
        }
        if self.peers.len() < self.threshold as usize + 1 {
            return Err(Error::InsufficientParticipants {
                have: self.peers.len(),
                need: self.threshold as usize + 1,
            });
        }
        Ok(())
    }
}

/// A provider of the current network topology. Polled, never push.
pub trait NetworkTopologyProvider: Send + Sync {
    /// The current topology snapshot.
    ///
    /// Fails with [`Error::TopologyUnavailable`] when no snapshot exists and
    /// none can be loaded, or [`Error::TopologyStale`] when the cached
    /// snapshot was invalidated by a refresh event and has not been reloaded
    /// yet.
    fn network_topology(&self) -> Result<Arc<NetworkTopology>>;

    /// Discards the cache and loads a fresh snapshot with a bumped epoch.
    fn reload(&self) -> Result<Arc<NetworkTopology>>;

    /// Marks the cached snapshot as superseded. Subsequent
    /// [`Self::network_topology`] calls fail with `TopologyStale` until a
    /// reload succeeds.
    fn invalidate(&self);
}

#[derive(Deserialize)]
struct RawTopology {
    peers: Vec<RawPeer>,
    threshold: u32,
}

#[derive(Deserialize)]
struct RawPeer {
    id: String,
    address: String,
}

#[derive(Default)]
struct Cached {
    snapshot: Option<Arc<NetworkTopology>>,
    stale: bool,
    epoch: u64,
}

/// A topology provider backed by a JSON document on disk:
/// `{ "threshold": t, "peers": [{ "id": "<base58>", "address": "ip:port" }] }`.
pub struct FileTopologyProvider {
    path: PathBuf,
    cached: Mutex<Cached>,
}

impl FileTopologyProvider {
    /// Creates a provider reading from `path`. The document is loaded
    /// lazily on the first [`NetworkTopologyProvider::network_topology`]
    /// call.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: Mutex::new(Cached::default()),
        }
    }

    fn parse(&self, epoch: u64) -> Result<Arc<NetworkTopology>> {
        let data = std::fs::read(&self.path)
            .map_err(|_| Error::TopologyUnavailable)?;
        let raw: RawTopology = serde_json::from_slice(&data)?;
        let mut peers = Vec::with_capacity(raw.peers.len());
        for peer in raw.peers {
            let id = PeerId::from_str(&peer.id)
                .map_err(|_| Error::Generic("invalid peer id in topology"))?;
            let address: SocketAddr = peer.address.parse()?;
            peers.push(PeerInfo { id, address });
        }
        let topology = NetworkTopology {
            peers,
            threshold: raw.threshold,
            epoch,
        };
        topology.verify()?;
        Ok(Arc::new(topology))
    }
}

impl NetworkTopologyProvider for FileTopologyProvider {
    fn network_topology(&self) -> Result<Arc<NetworkTopology>> {
        let mut cached = self.cached.lock().expect("topology cache poisoned");
        if cached.stale {
            return Err(Error::TopologyStale);
        }
        if let Some(snapshot) = &cached.snapshot {
            return Ok(snapshot.clone());
        }
        let snapshot = self.parse(cached.epoch + 1)?;
        cached.epoch += 1;
        cached.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn reload(&self) -> Result<Arc<NetworkTopology>> {
        let mut cached = self.cached.lock().expect("topology cache poisoned");
        let snapshot = self.parse(cached.epoch + 1)?;
        cached.epoch += 1;
        cached.snapshot = Some(snapshot.clone());
        cached.stale = false;
        tracing::info!(
            epoch = snapshot.epoch,
            peers = snapshot.peers.len(),
            threshold = snapshot.threshold,
            "loaded network topology",
        );
        Ok(snapshot)
    }

    fn invalidate(&self) {
        let mut cached = self.cached.lock().expect("topology cache poisoned");
        cached.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn topology_file(peers: &[(PeerId, &str)], threshold: u32) -> tempfile::NamedTempFile {
        let peers: Vec<serde_json::Value> = peers
            .iter()
            .map(|(id, addr)| {
                serde_json::json!({ "id": id.to_string(), "address": addr })
            })
            .collect();
        let doc = serde_json::json!({ "threshold": threshold, "peers": peers });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(doc.to_string().as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_caches_a_snapshot() {
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        let file = topology_file(
            &[
                (a, "127.0.0.1:9001"),
                (b, "127.0.0.1:9002"),
                (c, "127.0.0.1:9003"),
            ],
            2,
        );
        let provider = FileTopologyProvider::new(file.path());
        let topology = provider.network_topology().unwrap();
        assert_eq!(topology.epoch, 1);
        assert_eq!(topology.threshold, 2);
        assert!(topology.is_member(&a));
        assert_eq!(
            topology.address_of(&b),
            Some("127.0.0.1:9002".parse().unwrap())
        );
        // cached snapshot is reused, epoch unchanged
        let again = provider.network_topology().unwrap();
        assert_eq!(again.epoch, 1);
    }

    #[test]
    fn reload_bumps_the_epoch() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let file = topology_file(
            &[
                (peers[0], "127.0.0.1:9001"),
                (peers[1], "127.0.0.1:9002"),
                (peers[2], "127.0.0.1:9003"),
            ],
            1,
        );
        let provider = FileTopologyProvider::new(file.path());
        assert_eq!(provider.network_topology().unwrap().epoch, 1);
        assert_eq!(provider.reload().unwrap().epoch, 2);
        assert_eq!(provider.network_topology().unwrap().epoch, 2);
    }

    #[test]
    fn invalidated_cache_is_stale_until_reload() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let file = topology_file(
            &[
                (peers[0], "127.0.0.1:9001"),
                (peers[1], "127.0.0.1:9002"),
            ],
            1,
        );
        let provider = FileTopologyProvider::new(file.path());
        provider.network_topology().unwrap();
        provider.invalidate();
        assert!(matches!(
            provider.network_topology(),
            Err(Error::TopologyStale)
        ));
        provider.reload().unwrap();
        provider.network_topology().unwrap();
    }

    #[test]
    fn missing_file_is_unavailable() {
        let provider = FileTopologyProvider::new("/definitely/not/here.json");
        assert!(matches!(
            provider.network_topology(),
            Err(Error::TopologyUnavailable)
        ));
    }

    #[test]
    fn too_few_peers_violate_the_threshold_invariant() {
        let a = PeerId::random();
        let b = PeerId::random();
        let file = topology_file(
            &[(a, "127.0.0.1:9001"), (b, "127.0.0.1:9002")],
            2,
        );
        let provider = FileTopologyProvider::new(file.path());
        assert!(matches!(
            provider.network_topology(),
            Err(Error::InsufficientParticipants { have: 2, need: 3 })
        ));
    }
}
