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

//! Deposit calldata construction and parsing per resource type.
//!
//! Every dynamic field is preceded by a 32-byte big-endian length word, like
//! the bridge handler contracts expect. The with-priority variants append a
//! single trailing priority byte, so the parser can tell the variants apart
//! by exact length.

use ethers::types::U256;

use crate::chains::DepositPayload;
use crate::error::{Error, Result};

/// The resource types a handler contract can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Fungible token deposits.
    Erc20,
    /// Non-fungible token deposits.
    Erc721,
    /// Arbitrary cross-chain calls.
    Generic,
}

fn word(value: U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    buf
}

fn len_word(len: usize) -> [u8; 32] {
    word(U256::from(len))
}

/// Validates a configured priority against the single-byte wire encoding.
pub fn validate_priority(priority: u64) -> Result<u8> {
    u8::try_from(priority).map_err(|_| Error::InvalidPriority(priority))
}

/// `amount ‖ len(recipient) ‖ recipient`
pub fn construct_erc20_deposit_data(
    recipient: &[u8],
    amount: U256,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(64 + recipient.len());
    data.extend_from_slice(&word(amount));
    data.extend_from_slice(&len_word(recipient.len()));
    data.extend_from_slice(recipient);
    data
}

/// The erc20 layout with the trailing priority byte.
pub fn construct_erc20_deposit_data_with_priority(
    recipient: &[u8],
    amount: U256,
    priority: u8,
) -> Vec<u8> {
    let mut data = construct_erc20_deposit_data(recipient, amount);
    data.push(priority);
    data
}

/// `token_id ‖ len(recipient) ‖ recipient ‖ len(metadata) ‖ metadata`
pub fn construct_erc721_deposit_data(
    recipient: &[u8],
    token_id: U256,
    metadata: &[u8],
) -> Vec<u8> {
    let mut data =
        Vec::with_capacity(96 + recipient.len() + metadata.len());
    data.extend_from_slice(&word(token_id));
    data.extend_from_slice(&len_word(recipient.len()));
    data.extend_from_slice(recipient);
    data.extend_from_slice(&len_word(metadata.len()));
    data.extend_from_slice(metadata);
    data
}

/// The erc721 layout with the trailing priority byte.
pub fn construct_erc721_deposit_data_with_priority(
    recipient: &[u8],
    token_id: U256,
    metadata: &[u8],
    priority: u8,
) -> Vec<u8> {
    let mut data =
        construct_erc721_deposit_data(recipient, token_id, metadata);
    data.push(priority);
    data
}

/// `len(metadata) ‖ metadata`
pub fn construct_generic_deposit_data(metadata: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + metadata.len());
    data.extend_from_slice(&len_word(metadata.len()));
    data.extend_from_slice(metadata);
    data
}

/// Re-encodes a typed payload into the calldata the destination handler
/// expects. Inverse of [`parse_deposit`].
pub fn deposit_data_of(payload: &DepositPayload) -> Vec<u8> {
    match payload {
        DepositPayload::Erc20 {
            amount,
            recipient,
            priority: None,
        } => construct_erc20_deposit_data(recipient, *amount),
        DepositPayload::Erc20 {
            amount,
            recipient,
            priority: Some(priority),
        } => construct_erc20_deposit_data_with_priority(
            recipient, *amount, *priority,
        ),
        DepositPayload::Erc721 {
            token_id,
            recipient,
            metadata,
            priority: None,
        } => construct_erc721_deposit_data(recipient, *token_id, metadata),
        DepositPayload::Erc721 {
            token_id,
            recipient,
            metadata,
            priority: Some(priority),
        } => construct_erc721_deposit_data_with_priority(
            recipient, *token_id, metadata, *priority,
        ),
        DepositPayload::Generic { metadata } => {
            construct_generic_deposit_data(metadata)
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_word(&mut self) -> Result<U256> {
        let end = self.offset + 32;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(Error::InvalidDepositData("truncated length word"))?;
        self.offset = end;
        Ok(U256::from_big_endian(bytes))
    }

    fn read_bytes(&mut self, len: U256) -> Result<&'a [u8]> {
        if len > U256::from(u32::MAX) {
            return Err(Error::InvalidDepositData("oversized field"));
        }
        let len = len.as_u64() as usize;
        let end = self
            .offset
            .checked_add(len)
            .ok_or(Error::InvalidDepositData("oversized field"))?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(Error::InvalidDepositData("truncated field"))?;
        self.offset = end;
        Ok(bytes)
    }

    /// Consumes the optional trailing priority byte; anything else left
    /// over is a parse error.
    fn finish(self) -> Result<Option<u8>> {
        match self.data.len() - self.offset {
            0 => Ok(None),
            1 => {
                let priority = self.data[self.offset];
                if priority == 0 {
                    // zero means "no priority" and never uses this variant
                    return Err(Error::InvalidDepositData(
                        "zero priority in with-priority encoding",
                    ));
                }
                Ok(Some(priority))
            }
            _ => Err(Error::InvalidDepositData("trailing bytes")),
        }
    }
}

/// Parses erc20 deposit calldata.
pub fn parse_erc20_deposit(data: &[u8]) -> Result<DepositPayload> {
    let mut reader = Reader::new(data);
    let amount = reader.read_word()?;
    let recipient_len = reader.read_word()?;
    let recipient = reader.read_bytes(recipient_len)?.to_vec();
    let priority = reader.finish()?;
    Ok(DepositPayload::Erc20 {
        amount,
        recipient,
        priority,
    })
}

/// Parses erc721 deposit calldata.
pub fn parse_erc721_deposit(data: &[u8]) -> Result<DepositPayload> {
    let mut reader = Reader::new(data);
    let token_id = reader.read_word()?;
    let recipient_len = reader.read_word()?;
    let recipient = reader.read_bytes(recipient_len)?.to_vec();
    let metadata_len = reader.read_word()?;
    let metadata = reader.read_bytes(metadata_len)?.to_vec();
    let priority = reader.finish()?;
    Ok(DepositPayload::Erc721 {
        token_id,
        recipient,
        metadata,
        priority,
    })
}

/// Parses generic deposit calldata.
pub fn parse_generic_deposit(data: &[u8]) -> Result<DepositPayload> {
    let mut reader = Reader::new(data);
    let metadata_len = reader.read_word()?;
    let metadata = reader.read_bytes(metadata_len)?.to_vec();
    match reader.finish()? {
        // generic deposits carry no priority
        None => Ok(DepositPayload::Generic { metadata }),
        Some(_) => {
            Err(Error::InvalidDepositData("priority on generic deposit"))
        }
    }
}

/// Parses deposit calldata according to the resource type of the emitting
/// handler.
pub fn parse_deposit(
    resource: ResourceType,
    data: &[u8],
) -> Result<DepositPayload> {
    match resource {
        ResourceType::Erc20 => parse_erc20_deposit(data),
        ResourceType::Erc721 => parse_erc721_deposit(data),
        ResourceType::Generic => parse_generic_deposit(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erc20_round_trip() {
        let recipient = hex::decode("abcdefabcdefabcdefabcdefabcdefabcdefabcd")
            .unwrap();
        let data = construct_erc20_deposit_data(
            &recipient,
            U256::from(1_000_000u64),
        );
        let payload = parse_erc20_deposit(&data).unwrap();
        assert_eq!(
            payload,
            DepositPayload::Erc20 {
                amount: U256::from(1_000_000u64),
                recipient: recipient.clone(),
                priority: None,
            }
        );
        assert_eq!(deposit_data_of(&payload), data);
    }

    #[test]
    fn erc20_with_priority_round_trip() {
        let recipient = vec![0x11u8; 20];
        let data = construct_erc20_deposit_data_with_priority(
            &recipient,
            U256::from(5u64),
            3,
        );
        let payload = parse_erc20_deposit(&data).unwrap();
        assert_eq!(
            payload,
            DepositPayload::Erc20 {
                amount: U256::from(5u64),
                recipient,
                priority: Some(3),
            }
        );
        assert_eq!(deposit_data_of(&payload), data);
    }

    #[test]
    fn erc721_round_trip_with_and_without_priority() {
        let recipient = vec![0x22u8; 20];
        let metadata = b"ipfs://QmToken".to_vec();
        let plain = construct_erc721_deposit_data(
            &recipient,
            U256::from(77u64),
            &metadata,
        );
        let parsed = parse_erc721_deposit(&plain).unwrap();
        assert_eq!(deposit_data_of(&parsed), plain);

        let prioritized = construct_erc721_deposit_data_with_priority(
            &recipient,
            U256::from(77u64),
            &metadata,
            1,
        );
        let parsed = parse_erc721_deposit(&prioritized).unwrap();
        let DepositPayload::Erc721 { priority, .. } = &parsed else {
            panic!("wrong payload type");
        };
        assert_eq!(*priority, Some(1));
        assert_eq!(deposit_data_of(&parsed), prioritized);
    }

    #[test]
    fn generic_round_trip() {
        let metadata = vec![0xde, 0xad, 0xbe, 0xef];
        let data = construct_generic_deposit_data(&metadata);
        let payload = parse_generic_deposit(&data).unwrap();
        assert_eq!(payload, DepositPayload::Generic { metadata });
        assert_eq!(deposit_data_of(&payload), data);
    }

    #[test]
    fn truncated_data_is_rejected() {
        let data = construct_erc20_deposit_data(
            &[0x33u8; 20],
            U256::from(10u64),
        );
        assert!(parse_erc20_deposit(&data[..40]).is_err());
        assert!(parse_erc20_deposit(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn zero_priority_never_uses_the_priority_variant() {
        let mut data = construct_erc20_deposit_data(
            &[0x44u8; 20],
            U256::from(10u64),
        );
        data.push(0);
        assert!(matches!(
            parse_erc20_deposit(&data),
            Err(Error::InvalidDepositData(_))
        ));
    }

    #[test]
    fn oversized_priorities_fail_validation() {
        assert_eq!(validate_priority(0).unwrap(), 0);
        assert_eq!(validate_priority(255).unwrap(), 255);
        assert!(matches!(
            validate_priority(256),
            Err(Error::InvalidPriority(256))
        ));
    }
}
