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

//! Hand-written call wrappers for the bridge contracts. The ABI of every
//! entry point is declared statically next to its wrapper.

/// The bridge contract.
pub mod bridge;

pub use bridge::{BridgeContract, BridgeOps, ExecutionStatus, TransactOptions};
