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

//! The TCP transport host of the committee network.
//!
//! The host is a pure transport: it owns the listener, one outbound link per
//! committee peer, and the identity handshake. It never inspects payloads;
//! demultiplexing happens one layer up in [`super::channel`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use libp2p_identity::{Keypair, PeerId, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::wire::{WireCodec, WireMessage};
use crate::error::{Error, Result};
use crate::metric::Metrics;
use crate::topology::NetworkTopology;

/// Bounded number of frames parked per peer while its link is down or slow.
/// Overflow drops the oldest undelivered frame.
const OUTBOUND_BUFFER: usize = 512;
/// Upper bound of the handshake key message.
const MAX_HANDSHAKE_KEY: usize = 1024;
/// Capacity of the channel between the host and the demultiplexer.
const INBOUND_BUFFER: usize = 1024;

/// The committee transport host.
pub struct Host {
    keypair: Keypair,
    local_peer: PeerId,
    port: u16,
    allowed: RwLock<HashSet<PeerId>>,
    addrs: RwLock<HashMap<PeerId, SocketAddr>>,
    links: Mutex<HashMap<PeerId, Arc<Outbound>>>,
    inbound_tx: mpsc::Sender<(PeerId, WireMessage)>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
}

impl Host {
    /// Creates a new host for the given identity and committee snapshot.
    /// Returns the host and the channel all inbound frames arrive on.
    pub fn new(
        keypair: Keypair,
        topology: &NetworkTopology,
        port: u16,
        metrics: Arc<Metrics>,
        token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<(PeerId, WireMessage)>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let local_peer = keypair.public().to_peer_id();
        let host = Arc::new(Self {
            keypair,
            local_peer,
            port,
            allowed: RwLock::new(HashSet::new()),
            addrs: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            inbound_tx,
            metrics,
            token,
        });
        host.set_topology(topology);
        (host, inbound_rx)
    }

    /// This node's own identity.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Replaces the admission set and peer addresses with a new committee
    /// snapshot. Links to peers that left the committee die on their next
    /// reconnect attempt.
    pub fn set_topology(&self, topology: &NetworkTopology) {
        let mut allowed =
            self.allowed.write().expect("allowed set poisoned");
        let mut addrs = self.addrs.write().expect("address map poisoned");
        allowed.clear();
        addrs.clear();
        for peer in &topology.peers {
            allowed.insert(peer.id);
            if peer.id != self.local_peer {
                addrs.insert(peer.id, peer.address);
            }
        }
    }

    /// Whether `peer` is currently admitted.
    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        self.allowed
            .read()
            .expect("allowed set poisoned")
            .contains(peer)
    }

    fn address_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.addrs
            .read()
            .expect("address map poisoned")
            .get(peer)
            .copied()
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((
            std::net::Ipv4Addr::UNSPECIFIED,
            self.port,
        ))
        .await?;
        tracing::info!(
            port = self.port,
            peer = %self.local_peer,
            "p2p host listening",
        );
        let host = self.clone();
        tokio::spawn(async move { host.accept_loop(listener).await });
        Ok(())
    }

    /// Enqueues `msg` for `peer`. Never blocks: the per-peer buffer is
    /// bounded and overflow drops the oldest undelivered frame.
    pub fn send(self: &Arc<Self>, peer: &PeerId, msg: WireMessage) {
        if !self.is_allowed(peer) {
            tracing::warn!(%peer, "dropping frame for peer outside committee");
            self.metrics.rejected_peers.inc();
            return;
        }
        let link = {
            let mut links = self.links.lock().expect("link map poisoned");
            links
                .entry(*peer)
                .or_insert_with(|| {
                    let link = Arc::new(Outbound::new(*peer));
                    let host = self.clone();
                    let spawned = link.clone();
                    tokio::spawn(async move {
                        host.run_outbound(spawned).await
                    });
                    link
                })
                .clone()
        };
        link.push(msg, &self.metrics);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let host = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = host.handle_inbound(stream).await {
                                tracing::debug!(
                                    %remote,
                                    error = %e,
                                    "inbound connection closed",
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_inbound(
        self: Arc<Self>,
        mut stream: TcpStream,
    ) -> Result<()> {
        let peer = handshake(&mut stream, &self.keypair).await?;
        if !self.is_allowed(&peer) {
            self.metrics.rejected_peers.inc();
            return Err(Error::PeerNotAllowed(peer));
        }
        let mut framed = Framed::new(stream, WireCodec);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    Some(Ok(msg)) => {
                        // a refresh may have evicted the peer mid-connection
                        if !self.is_allowed(&peer) {
                            self.metrics.rejected_peers.inc();
                            return Ok(());
                        }
                        if self.inbound_tx.send((peer, msg)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn run_outbound(self: Arc<Self>, link: Arc<Outbound>) {
        let mut reconnect = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        loop {
            // park until there is traffic
            while link.is_empty() {
                tokio::select! {
                    _ = link.notify.notified() => {}
                    _ = self.token.cancelled() => return,
                }
            }
            let Some(addr) = self.address_of(&link.peer) else {
                // the peer left the committee; retire the link
                link.clear();
                self.links
                    .lock()
                    .expect("link map poisoned")
                    .remove(&link.peer);
                return;
            };
            match self.connect(addr, &link.peer).await {
                Ok(framed) => {
                    reconnect.reset();
                    self.metrics.connected_peers.inc();
                    let closed = self.pump(&link, framed).await;
                    self.metrics.connected_peers.dec();
                    if closed {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        peer = %link.peer,
                        error = %e,
                        "failed to dial peer",
                    );
                    let wait = reconnect
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(10));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.token.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Drains the link queue into a live connection. Returns `true` when the
    /// host is shutting down.
    async fn pump(
        &self,
        link: &Outbound,
        mut framed: Framed<TcpStream, WireCodec>,
    ) -> bool {
        loop {
            while let Some(msg) = link.pop() {
                if let Err(e) = framed.send(msg.clone()).await {
                    tracing::debug!(
                        peer = %link.peer,
                        error = %e,
                        "peer connection lost, reconnecting",
                    );
                    link.push_front(msg);
                    return false;
                }
            }
            tokio::select! {
                _ = link.notify.notified() => {}
                _ = self.token.cancelled() => return true,
            }
        }
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        expected: &PeerId,
    ) -> Result<Framed<TcpStream, WireCodec>> {
        let mut stream = TcpStream::connect(addr).await?;
        let peer = handshake(&mut stream, &self.keypair).await?;
        if &peer != expected {
            return Err(Error::PeerNotAllowed(peer));
        }
        Ok(Framed::new(stream, WireCodec))
    }
}

/// Exchanges protobuf-encoded public keys and returns the remote identity.
//
// TODO: upgrade to a noise handshake so the advertised key is proven with a
// signature instead of being taken at face value.
async fn handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
) -> Result<PeerId> {
    let local = keypair.public().encode_protobuf();
    stream.write_u32(local.len() as u32).await?;
    stream.write_all(&local).await?;
    stream.flush().await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_HANDSHAKE_KEY {
        return Err(Error::Generic("handshake key too large"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let key = PublicKey::try_decode_protobuf(&buf)?;
    Ok(key.to_peer_id())
}

struct Outbound {
    peer: PeerId,
    queue: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
}

impl Outbound {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, msg: WireMessage, metrics: &Metrics) {
        let mut queue = self.queue.lock().expect("outbound queue poisoned");
        if queue.len() == OUTBOUND_BUFFER {
            queue.pop_front();
            metrics.dropped_messages.inc();
            tracing::warn!(
                peer = %self.peer,
                "outbound buffer overflow, dropped oldest frame",
            );
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
    }

    fn push_front(&self, msg: WireMessage) {
        self.queue
            .lock()
            .expect("outbound queue poisoned")
            .push_front(msg);
    }

    fn pop(&self) -> Option<WireMessage> {
        self.queue
            .lock()
            .expect("outbound queue poisoned")
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("outbound queue poisoned")
            .is_empty()
    }

    fn clear(&self) {
        self.queue
            .lock()
            .expect("outbound queue poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PeerInfo;

    fn topology_of(keys: &[Keypair], base_port: u16) -> NetworkTopology {
        NetworkTopology {
            peers: keys
                .iter()
                .enumerate()
                .map(|(i, k)| PeerInfo {
                    id: k.public().to_peer_id(),
                    address: format!("127.0.0.1:{}", base_port + i as u16)
                        .parse()
                        .unwrap(),
                })
                .collect(),
            threshold: 1,
            epoch: 1,
        }
    }

    #[tokio::test]
    async fn frames_flow_between_two_hosts() {
        let keys =
            vec![Keypair::generate_ed25519(), Keypair::generate_ed25519()];
        let topology = topology_of(&keys, 19701);
        let metrics = Arc::new(Metrics::new().unwrap());
        let token = CancellationToken::new();

        let (host_a, _rx_a) = Host::new(
            keys[0].clone(),
            &topology,
            19701,
            metrics.clone(),
            token.child_token(),
        );
        let (host_b, mut rx_b) = Host::new(
            keys[1].clone(),
            &topology,
            19702,
            metrics.clone(),
            token.child_token(),
        );
        host_a.start().await.unwrap();
        host_b.start().await.unwrap();

        let msg = WireMessage {
            session_id: "signing-xyz".to_string(),
            protocol: super::super::Protocol::Tss,
            payload: vec![42],
        };
        host_a.send(&host_b.local_peer(), msg.clone());

        let (from, got) =
            tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("host channel closed");
        assert_eq!(from, host_a.local_peer());
        assert_eq!(got, msg);
        token.cancel();
    }

    #[tokio::test]
    async fn uninvited_peers_are_rejected() {
        let committee =
            vec![Keypair::generate_ed25519(), Keypair::generate_ed25519()];
        let outsider = Keypair::generate_ed25519();
        let topology = topology_of(&committee, 19711);
        let metrics = Arc::new(Metrics::new().unwrap());
        let token = CancellationToken::new();

        let (host_a, mut rx_a) = Host::new(
            committee[0].clone(),
            &topology,
            19711,
            metrics.clone(),
            token.child_token(),
        );
        host_a.start().await.unwrap();

        // the outsider dials directly and completes the handshake
        let mut stream =
            TcpStream::connect(("127.0.0.1", 19711)).await.unwrap();
        handshake(&mut stream, &outsider).await.unwrap();
        let mut framed = Framed::new(stream, WireCodec);
        let _ = framed
            .send(WireMessage {
                session_id: "signing-xyz".to_string(),
                protocol: super::super::Protocol::Tss,
                payload: vec![1],
            })
            .await;

        // nothing must be delivered
        let delivered = tokio::time::timeout(
            Duration::from_millis(500),
            rx_a.recv(),
        )
        .await;
        assert!(delivered.is_err(), "frame from outsider was delivered");
        token.cancel();
    }
}
