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

//! Static decoders for the bridge contract events. Each event has a
//! declared field list with typed decoders; nothing is resolved at runtime
//! from ABI metadata.

use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Log, H256};
use ethers::utils::keccak256;

use crate::error::{Error, Result};

/// A decoded `Deposit` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    /// The destination domain of the transfer.
    pub destination_domain_id: u8,
    /// The resource being transferred.
    pub resource_id: [u8; 32],
    /// The nonce the source bridge assigned to the deposit.
    pub deposit_nonce: u64,
    /// The depositing account.
    pub sender: Address,
    /// The handler calldata of the deposit.
    pub data: Vec<u8>,
    /// The handler response bytes.
    pub handler_response: Vec<u8>,
}

/// Topic0 of `Deposit(uint8,bytes32,uint64,address,bytes,bytes)`.
pub fn deposit_signature() -> H256 {
    H256::from(keccak256(
        "Deposit(uint8,bytes32,uint64,address,bytes,bytes)",
    ))
}

/// Topic0 of `StartKeygen()`.
pub fn start_keygen_signature() -> H256 {
    H256::from(keccak256("StartKeygen()"))
}

/// Topic0 of `KeyRefresh(string)`.
pub fn key_refresh_signature() -> H256 {
    H256::from(keccak256("KeyRefresh(string)"))
}

/// Topic0 of `Retry(uint256,uint256)`.
pub fn retry_signature() -> H256 {
    H256::from(keccak256("Retry(uint256,uint256)"))
}

fn abi_decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>> {
    ethers::abi::decode(types, data)
        .map_err(|e| Error::AbiDecode(e.to_string()))
}

/// The strict `(block, tx_index, log_index)` dispatch order of a log.
pub fn log_order_key(log: &Log) -> (u64, u64, u64) {
    (
        log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        log.transaction_index
            .map(|i| i.as_u64())
            .unwrap_or_default(),
        log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
    )
}

/// Decodes a `Deposit` log.
pub fn decode_deposit(log: &Log) -> Result<Deposit> {
    let sender_topic = log
        .topics
        .get(1)
        .ok_or(Error::AbiDecode("missing deposit sender topic".into()))?;
    let tokens = abi_decode(
        &[
            ParamType::Uint(8),
            ParamType::FixedBytes(32),
            ParamType::Uint(64),
            ParamType::Bytes,
            ParamType::Bytes,
        ],
        &log.data,
    )?;
    let mut tokens = tokens.into_iter();
    let destination_domain_id = match tokens.next() {
        Some(Token::Uint(v)) => v.as_u64() as u8,
        _ => return Err(Error::AbiDecode("bad destination domain".into())),
    };
    let resource_id = match tokens.next() {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
            let mut id = [0u8; 32];
            id.copy_from_slice(&bytes);
            id
        }
        _ => return Err(Error::AbiDecode("bad resource id".into())),
    };
    let deposit_nonce = match tokens.next() {
        Some(Token::Uint(v)) => v.as_u64(),
        _ => return Err(Error::AbiDecode("bad deposit nonce".into())),
    };
    let data = match tokens.next() {
        Some(Token::Bytes(bytes)) => bytes,
        _ => return Err(Error::AbiDecode("bad deposit data".into())),
    };
    let handler_response = match tokens.next() {
        Some(Token::Bytes(bytes)) => bytes,
        _ => return Err(Error::AbiDecode("bad handler response".into())),
    };
    Ok(Deposit {
        destination_domain_id,
        resource_id,
        deposit_nonce,
        sender: Address::from_slice(&sender_topic.as_bytes()[12..]),
        data,
        handler_response,
    })
}

/// Decodes a `KeyRefresh` log into the announced topology hash.
pub fn decode_key_refresh(log: &Log) -> Result<String> {
    let tokens = abi_decode(&[ParamType::String], &log.data)?;
    match tokens.into_iter().next() {
        Some(Token::String(hash)) => Ok(hash),
        _ => Err(Error::AbiDecode("bad refresh hash".into())),
    }
}

/// Decodes a `Retry` log into the block range to re-scan.
pub fn decode_retry(log: &Log) -> Result<(u64, u64)> {
    let tokens = abi_decode(
        &[ParamType::Uint(256), ParamType::Uint(256)],
        &log.data,
    )?;
    let mut tokens = tokens.into_iter();
    let low = match tokens.next() {
        Some(Token::Uint(v)) => v.as_u64(),
        _ => return Err(Error::AbiDecode("bad retry range".into())),
    };
    let high = match tokens.next() {
        Some(Token::Uint(v)) => v.as_u64(),
        _ => return Err(Error::AbiDecode("bad retry range".into())),
    };
    Ok((low, high))
}
