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

//! The communication layer on top of the transport host: typed message
//! channels keyed by `(session, protocol)`.
//!
//! The layer is referenced one-way from both the coordinator and the host
//! side; it owns the subscription table and a single dispatch task that
//! drains the host's inbound channel, which preserves per-sender FIFO
//! ordering.

use std::sync::Arc;

use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::host::Host;
use super::wire::WireMessage;
use super::{Comm, CommMessage, Protocol, Subscription, SubscriptionTable};
use crate::metric::Metrics;
use crate::tss::SessionId;

/// The network-backed [`Comm`] implementation.
pub struct Communication {
    host: Arc<Host>,
    table: Arc<SubscriptionTable>,
    metrics: Arc<Metrics>,
}

impl Communication {
    /// Creates the communication layer and spawns its dispatch task over the
    /// host's inbound channel.
    pub fn new(
        host: Arc<Host>,
        mut inbound: mpsc::Receiver<(PeerId, WireMessage)>,
        metrics: Arc<Metrics>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let comm = Arc::new(Self {
            host,
            table: SubscriptionTable::new(),
            metrics,
        });
        let dispatch = comm.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    frame = inbound.recv() => match frame {
                        Some((from, msg)) => dispatch.dispatch(from, msg),
                        None => return,
                    },
                }
            }
        });
        comm
    }

    fn dispatch(&self, from: PeerId, msg: WireMessage) {
        if !self.host.is_allowed(&from) {
            self.metrics.rejected_peers.inc();
            return;
        }
        let session: SessionId = msg.session_id.as_str().into();
        let delivered = self.table.deliver(
            &session,
            msg.protocol,
            CommMessage {
                from,
                payload: msg.payload,
            },
        );
        if !delivered {
            self.metrics.dropped_messages.inc();
            tracing::warn!(
                %from,
                session = %session,
                "subscriber buffer full, dropped inbound frame",
            );
        }
    }
}

impl Comm for Communication {
    fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    fn subscribe(
        &self,
        session: &SessionId,
        protocol: Protocol,
    ) -> Subscription {
        self.table.subscribe(session, protocol)
    }

    fn broadcast(
        &self,
        session: &SessionId,
        protocol: Protocol,
        payload: Vec<u8>,
        recipients: &[PeerId],
    ) {
        let local = self.host.local_peer();
        for recipient in recipients {
            if *recipient == local {
                self.table.deliver(
                    session,
                    protocol,
                    CommMessage {
                        from: local,
                        payload: payload.clone(),
                    },
                );
                continue;
            }
            self.host.send(
                recipient,
                WireMessage {
                    session_id: session.as_str().to_string(),
                    protocol,
                    payload: payload.clone(),
                },
            );
        }
    }
}
