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
//
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # Bridge Relayer Crate
//!
//! A long-running daemon that relays cross-chain transfers through a
//! threshold-signing committee. The relayer observes deposit events on a
//! source chain, reaches threshold-signed agreement with its peer relayers
//! over an authenticated p2p network, and executes the corresponding
//! proposal on the destination chain.
//!
//! ## Overview
//!
//! The pipeline, end to end:
//!
//! 1. The **chain listener** polls each configured chain for finalized
//!    blocks and dispatches matching logs to the registered event handlers,
//!    advancing a crash-safe per-chain cursor only once every handler
//!    succeeded.
//! 2. The **event handlers** translate bridge events into local actions: a
//!    `Deposit` becomes a routed message, `StartKeygen` and `KeyRefresh`
//!    start MPC ceremonies, and `Retry` re-scans a past block range.
//! 3. The **session coordinator** drives each ceremony (key generation,
//!    key refresh, signing) to completion: it elects a session leader,
//!    exchanges the start announcement, and retries on a backup
//!    coordinator when the leader fails. Sessions are addressed by
//!    content-derived ids so every committee member independently joins
//!    the same session.
//! 4. The **executor** submits the threshold-signed proposal on the
//!    destination chain. Submission is the session leader's job alone and
//!    short-circuits when the destination already executed the proposal,
//!    so redelivered events are harmless.
//!
//! The committee itself is described by a [`topology`] snapshot: the peer
//! identities, their addresses and the signing threshold. A refresh event
//! supersedes the snapshot and rotates the keyshares without changing the
//! group public key.

/// Chain adapters and the message routing loop.
pub mod chains;
/// Committee p2p transport and typed channels.
pub mod comm;
/// Relayer configuration.
pub mod config;
/// The relayer context: configuration, cancellation, metrics.
pub mod context;
/// The coordinator elector.
pub mod elector;
/// The error type of the relayer.
pub mod error;
/// Relayer metrics.
pub mod metric;
/// Machine-readable probe events for debugging the relayer lifecycle.
pub mod probe;
/// Retry policies.
pub mod retry;
/// Service wiring and startup.
pub mod service;
/// Persistent state: block cursors and the keyshare.
pub mod store;
/// The network topology provider.
pub mod topology;
/// The MPC session coordinator and its ceremonies.
pub mod tss;

pub use error::{Error, Result};
