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

//! # Committee Communication Module
//!
//! Authenticated peer-to-peer messaging restricted to the current MPC
//! committee. The [`host`] owns the raw transport, the [`channel`] layer
//! demultiplexes inbound frames into typed per-`(session, protocol)`
//! subscriptions, and [`mem`] provides an in-process network with the same
//! interface for multi-peer tests.
//!
//! Ordering guarantees: FIFO per `(sender, session)`, no order across
//! senders. Delivery is best-effort; outbound buffers are bounded and
//! overflow drops the oldest undelivered frame for that peer.

/// Typed message channels demultiplexed by `(session, protocol)`.
pub mod channel;
/// The TCP transport host.
pub mod host;
/// An in-process committee network for tests.
pub mod mem;
/// The p2p wire frame and its codec.
pub mod wire;

pub use channel::Communication;
pub use host::Host;
pub use wire::WireMessage;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use libp2p_identity::PeerId;
use tokio::sync::mpsc;

use crate::tss::SessionId;

/// Capacity of one subscriber channel.
const SUBSCRIBER_BUFFER: usize = 256;
/// How many early frames are parked per `(session, protocol)` before the
/// first subscriber shows up.
const BACKLOG_LIMIT: usize = 64;

/// The protocols multiplexed over one committee connection. The discriminant
/// is the `u8` that goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    /// Session start announcements from the elected leader.
    SessionStart = 1,
    /// Bully coordinator election messages.
    Bully = 2,
    /// Ceremony round payloads.
    Tss = 3,
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(Protocol::SessionStart),
            2 => Ok(Protocol::Bully),
            3 => Ok(Protocol::Tss),
            other => Err(other),
        }
    }
}

/// A message delivered to a subscriber: the sending committee member and the
/// opaque protocol payload.
#[derive(Debug, Clone)]
pub struct CommMessage {
    /// The authenticated sender.
    pub from: PeerId,
    /// The protocol payload.
    pub payload: Vec<u8>,
}

/// The committee communication interface shared by the network-backed
/// [`Communication`] layer and the in-process test network.
pub trait Comm: Send + Sync {
    /// This node's own identity.
    fn local_peer(&self) -> PeerId;

    /// Opens a typed channel of all messages for `(session, protocol)`.
    /// Dropping the subscription releases it.
    fn subscribe(
        &self,
        session: &SessionId,
        protocol: Protocol,
    ) -> Subscription;

    /// Sends `payload` to every recipient, best-effort. Sending to self
    /// loops the message back locally. Never blocks beyond the bounded
    /// outbound buffer of each peer.
    fn broadcast(
        &self,
        session: &SessionId,
        protocol: Protocol,
        payload: Vec<u8>,
        recipients: &[PeerId],
    );
}

impl<T: Comm + ?Sized> Comm for Arc<T> {
    fn local_peer(&self) -> PeerId {
        (**self).local_peer()
    }

    fn subscribe(
        &self,
        session: &SessionId,
        protocol: Protocol,
    ) -> Subscription {
        (**self).subscribe(session, protocol)
    }

    fn broadcast(
        &self,
        session: &SessionId,
        protocol: Protocol,
        payload: Vec<u8>,
        recipients: &[PeerId],
    ) {
        (**self).broadcast(session, protocol, payload, recipients)
    }
}

/// A live subscription to one `(session, protocol)` channel.
pub struct Subscription {
    rx: mpsc::Receiver<CommMessage>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Receives the next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<CommMessage> {
        self.rx.recv().await
    }
}

struct SubscriptionGuard {
    table: Weak<SubscriptionTable>,
    key: (SessionId, Protocol),
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.unsubscribe(&self.key, self.id);
        }
    }
}

#[derive(Default)]
struct TableInner {
    subs: HashMap<(SessionId, Protocol), HashMap<u64, mpsc::Sender<CommMessage>>>,
    backlog: HashMap<(SessionId, Protocol), VecDeque<CommMessage>>,
}

/// The demultiplexing table behind every [`Comm`] implementation.
///
/// Frames that arrive before any subscriber exists are parked in a bounded
/// backlog and flushed on subscribe; the leader's start announcement would
/// otherwise race the followers' subscriptions.
pub(crate) struct SubscriptionTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        session: &SessionId,
        protocol: Protocol,
    ) -> Subscription {
        let key = (session.clone(), protocol);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("subscription table poisoned");
        if let Some(parked) = inner.backlog.remove(&key) {
            for msg in parked {
                let _ = tx.try_send(msg);
            }
        }
        inner.subs.entry(key.clone()).or_default().insert(id, tx);
        Subscription {
            rx,
            _guard: SubscriptionGuard {
                table: Arc::downgrade(self),
                key,
                id,
            },
        }
    }

    /// Delivers a frame to all subscribers of its `(session, protocol)`
    /// channel, parking it when nobody subscribed yet. Returns `false` when
    /// the frame was dropped on a full subscriber buffer.
    pub(crate) fn deliver(
        &self,
        session: &SessionId,
        protocol: Protocol,
        msg: CommMessage,
    ) -> bool {
        let key = (session.clone(), protocol);
        let mut inner = self.inner.lock().expect("subscription table poisoned");
        let senders: Vec<_> = match inner.subs.get(&key) {
            Some(subs) if !subs.is_empty() => {
                subs.values().cloned().collect()
            }
            _ => {
                let parked = inner.backlog.entry(key).or_default();
                if parked.len() == BACKLOG_LIMIT {
                    parked.pop_front();
                }
                parked.push_back(msg);
                return true;
            }
        };
        drop(inner);
        let mut delivered = true;
        for tx in senders {
            if tx.try_send(msg.clone()).is_err() {
                delivered = false;
            }
        }
        delivered
    }

    fn unsubscribe(&self, key: &(SessionId, Protocol), id: u64) {
        let mut inner = self.inner.lock().expect("subscription table poisoned");
        if let Some(subs) = inner.subs.get_mut(key) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.subs.remove(key);
                // frames arriving after the session ended are garbage
                inner.backlog.remove(key);
            }
        }
    }
}
