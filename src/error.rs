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

//! Error type of the relayer and all of its subsystems.

use libp2p_identity::PeerId;

/// An enum of all possible errors that could be encountered during the
/// execution of the relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error while parsing a network address.
    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWalletError(#[from] ethers::signers::WalletError),
    /// Failed to decode a p2p identity key.
    #[error(transparent)]
    IdentityDecoding(#[from] libp2p_identity::DecodingError),
    /// Threshold-signature ceremony error.
    #[error(transparent)]
    Frost(#[from] frost_secp256k1::Error),
    /// Keyshare (de)serialization error.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    /// Prometheus error.
    #[error(transparent)]
    PrometheusError(#[from] prometheus::Error),
    /// Error while submitting a transaction through the signing middleware.
    #[error("EVM middleware error: {0}")]
    EvmMiddleware(String),
    /// Error while decoding ABI-encoded bytes.
    #[error("ABI decode error: {0}")]
    AbiDecode(String),
    /// No topology snapshot has been loaded yet.
    #[error("Network topology is not available")]
    TopologyUnavailable,
    /// The cached topology snapshot predates the last refresh event.
    #[error("Network topology snapshot is stale")]
    TopologyStale,
    /// The elector was given an empty candidate set.
    #[error("No candidates to elect a coordinator from")]
    NoCandidates,
    /// The session cannot meet the signing threshold.
    #[error("Insufficient participants: have {have}, need {need}")]
    InsufficientParticipants {
        /// Number of participants available for the session.
        have: usize,
        /// Minimum number of participants the threshold requires.
        need: usize,
    },
    /// A session with the same id is already in flight.
    #[error("Session {0} is already running")]
    SessionAlreadyRunning(String),
    /// The session ran past its deadline.
    #[error("Session {0} timed out")]
    SessionTimeout(String),
    /// The session exhausted its retries without completing.
    #[error("Session {0} made no progress after exhausting retries")]
    NoProgress(String),
    /// The session was cancelled from the outside.
    #[error("Session {0} was cancelled")]
    SessionCancelled(String),
    /// The session leader never sent the start message.
    #[error("Timed out waiting for the session leader to start {0}")]
    StartTimeout(String),
    /// A ceremony round did not gather the expected messages in time.
    #[error("Ceremony round {round} timed out in session {session}")]
    RoundTimeout {
        /// The session the round belongs to.
        session: String,
        /// The ceremony round number.
        round: u8,
    },
    /// A peer outside of the current committee tried to talk to us.
    #[error("Peer {0} is not in the allowed set")]
    PeerNotAllowed(PeerId),
    /// An internal channel was closed while sending.
    #[error("Internal channel closed")]
    ChannelClosed,
    /// A message arrived for a destination domain we do not serve.
    #[error("Chain not found for domain {0}")]
    ChainNotFound(u8),
    /// Missing required private key in the config.
    #[error("Missing required private-key in the config")]
    MissingSecrets,
    /// Deposit priority does not fit the wire encoding.
    #[error("Invalid deposit priority: {0}")]
    InvalidPriority(u64),
    /// Deposit calldata could not be parsed.
    #[error("Invalid deposit data: {0}")]
    InvalidDepositData(&'static str),
    /// There is no keyshare on disk.
    #[error("No keyshare found on disk")]
    KeyshareNotFound,
    /// The keyshare file is malformed.
    #[error("Malformed keyshare file: {0}")]
    MalformedKeyshare(&'static str),
    /// Proposal execution reverted on the destination chain.
    #[error("executeProposal reverted for nonce {0}")]
    ExecutionReverted(u64),
    /// The submitted transaction never made it into a block.
    #[error("Transaction dropped from the mempool")]
    TransactionDropped,
    /// The refresh ceremony cannot serve the requested membership change.
    #[error("Keyshare refresh cannot add new members: {0}")]
    UnsupportedMembershipChange(PeerId),
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

/// A type alias for the result used across the relayer.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a session-level failure should trigger a retry on a backup
    /// coordinator instead of failing the session outright.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::StartTimeout(_)
                | Error::RoundTimeout { .. }
                | Error::ChannelClosed
                | Error::Io(_)
        )
    }
}
