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

//! Metrics of the relayer, exported through a process-wide prometheus
//! registry handle.

use prometheus::{IntCounter, IntGauge, Registry};

use crate::error::Result;

/// A struct definition for collecting metrics in the relayer.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Blocks fully processed by the chain listeners.
    pub blocks_processed: IntCounter,
    /// Deposit events decoded and handed off to the executor pipeline.
    pub deposits_handled: IntCounter,
    /// MPC sessions started on this relayer.
    pub sessions_started: IntCounter,
    /// MPC sessions that reached the Completed state.
    pub sessions_completed: IntCounter,
    /// MPC sessions that reached the Failed state.
    pub sessions_failed: IntCounter,
    /// MPC sessions that were cancelled from the outside.
    pub sessions_cancelled: IntCounter,
    /// Session retries on a backup coordinator.
    pub session_retries: IntCounter,
    /// Inbound messages dropped because the sender is not in the committee.
    pub rejected_peers: IntCounter,
    /// Outbound messages dropped because a peer's send buffer overflowed.
    pub dropped_messages: IntCounter,
    /// Proposals successfully executed on a destination chain.
    pub proposals_executed: IntCounter,
    /// Proposals skipped because the destination already executed them.
    pub proposals_skipped: IntCounter,
    /// The total number of transactions made.
    pub total_transaction_made: IntCounter,
    /// Currently connected committee peers.
    pub connected_peers: IntGauge,
}

impl Metrics {
    /// Instantiates the various metrics and their counters, also creates a
    /// registry for the counters and registers the counters.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let blocks_processed = IntCounter::new(
            "blocks_processed",
            "Blocks fully processed by the chain listeners",
        )?;
        let deposits_handled = IntCounter::new(
            "deposits_handled",
            "Deposit events decoded and handed to the executor pipeline",
        )?;
        let sessions_started =
            IntCounter::new("sessions_started", "MPC sessions started")?;
        let sessions_completed = IntCounter::new(
            "sessions_completed",
            "MPC sessions that completed successfully",
        )?;
        let sessions_failed =
            IntCounter::new("sessions_failed", "MPC sessions that failed")?;
        let sessions_cancelled = IntCounter::new(
            "sessions_cancelled",
            "MPC sessions cancelled from the outside",
        )?;
        let session_retries = IntCounter::new(
            "session_retries",
            "Session retries on a backup coordinator",
        )?;
        let rejected_peers = IntCounter::new(
            "rejected_peers",
            "Messages dropped because the sender is not in the committee",
        )?;
        let dropped_messages = IntCounter::new(
            "dropped_messages",
            "Outbound messages dropped due to a full peer send buffer",
        )?;
        let proposals_executed = IntCounter::new(
            "proposals_executed",
            "Proposals executed on a destination chain",
        )?;
        let proposals_skipped = IntCounter::new(
            "proposals_skipped",
            "Proposals skipped because they were already executed",
        )?;
        let total_transaction_made = IntCounter::new(
            "total_transaction_made",
            "The total number of transactions made",
        )?;
        let connected_peers = IntGauge::new(
            "connected_peers",
            "Currently connected committee peers",
        )?;

        registry.register(Box::new(blocks_processed.clone()))?;
        registry.register(Box::new(deposits_handled.clone()))?;
        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_completed.clone()))?;
        registry.register(Box::new(sessions_failed.clone()))?;
        registry.register(Box::new(sessions_cancelled.clone()))?;
        registry.register(Box::new(session_retries.clone()))?;
        registry.register(Box::new(rejected_peers.clone()))?;
        registry.register(Box::new(dropped_messages.clone()))?;
        registry.register(Box::new(proposals_executed.clone()))?;
        registry.register(Box::new(proposals_skipped.clone()))?;
        registry.register(Box::new(total_transaction_made.clone()))?;
        registry.register(Box::new(connected_peers.clone()))?;

        Ok(Self {
            registry,
            blocks_processed,
            deposits_handled,
            sessions_started,
            sessions_completed,
            sessions_failed,
            sessions_cancelled,
            session_retries,
            rejected_peers,
            dropped_messages,
            proposals_executed,
            proposals_skipped,
            total_transaction_made,
            connected_peers,
        })
    }

    /// Gathers the current metrics in the prometheus text format.
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.blocks_processed.inc();
        metrics.sessions_started.inc();
        let report = metrics.gather().unwrap();
        assert!(report.contains("blocks_processed 1"));
        assert!(report.contains("sessions_started 1"));
    }
}
