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

//! An in-process committee network for tests: every peer gets a [`Comm`]
//! endpoint and broadcasts are routed straight into the recipients'
//! subscription tables, with the same ordering guarantees as the real
//! transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use libp2p_identity::PeerId;

use super::{Comm, CommMessage, Protocol, Subscription, SubscriptionTable};
use crate::tss::SessionId;

#[derive(Default)]
struct Router {
    tables: Mutex<HashMap<PeerId, Arc<SubscriptionTable>>>,
}

/// One peer's endpoint in an in-process committee network.
pub struct MemComm {
    local: PeerId,
    table: Arc<SubscriptionTable>,
    router: Arc<Router>,
}

impl MemComm {
    /// Builds a fully connected in-process network for `peers` and returns
    /// one endpoint per peer, in the same order.
    pub fn network(peers: &[PeerId]) -> Vec<Arc<MemComm>> {
        let router = Arc::new(Router::default());
        peers
            .iter()
            .map(|peer| {
                let table = SubscriptionTable::new();
                router
                    .tables
                    .lock()
                    .expect("router poisoned")
                    .insert(*peer, table.clone());
                Arc::new(MemComm {
                    local: *peer,
                    table,
                    router: router.clone(),
                })
            })
            .collect()
    }

    /// Disconnects this peer: frames addressed to it vanish, like they would
    /// on a dead TCP link.
    pub fn partition(&self) {
        self.router
            .tables
            .lock()
            .expect("router poisoned")
            .remove(&self.local);
    }
}

impl Comm for MemComm {
    fn local_peer(&self) -> PeerId {
        self.local
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
        for recipient in recipients {
            let table = {
                let tables =
                    self.router.tables.lock().expect("router poisoned");
                tables.get(recipient).cloned()
            };
            let Some(table) = table else { continue };
            table.deliver(
                session,
                protocol,
                CommMessage {
                    from: self.local,
                    payload: payload.clone(),
                },
            );
        }
    }
}
