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

//! The bridge contract wrapper: every entry point the relayer invokes,
//! encoded against a static ABI.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{encode, ParamType, Token};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, H256,
    U256,
};
use ethers::utils::id;

use super::super::deposit::{
    construct_erc20_deposit_data,
    construct_erc20_deposit_data_with_priority,
    construct_erc721_deposit_data,
    construct_erc721_deposit_data_with_priority,
    construct_generic_deposit_data, validate_priority,
};
use super::super::gas::GasPricer;
use super::super::Proposal;
use crate::error::{Error, Result};

/// The signing EVM client bridge transactions go through.
pub type EvmClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Options for one contract transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactOptions {
    /// Explicit gas limit; estimated by the node when absent.
    pub gas_limit: Option<u64>,
    /// Ether value sent along with the call.
    pub value: U256,
    /// Execution priority of a deposit; `0` means none.
    pub priority: u64,
}

/// How an `executeProposal` transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The transaction was mined successfully.
    Executed(H256),
    /// The transaction was mined but reverted.
    Reverted(H256),
}

/// The bridge operations the MPC pipeline depends on. Split from the full
/// wrapper so the executor and the keygen handler can be exercised against
/// a mock in tests.
#[async_trait]
pub trait BridgeOps: Send + Sync {
    /// Whether the destination bridge already executed `proposal`.
    async fn is_proposal_executed(&self, proposal: &Proposal)
        -> Result<bool>;

    /// Submits `executeProposal` with the committee signature.
    async fn execute_proposal(
        &self,
        proposal: &Proposal,
        signature: &[u8],
        opts: TransactOptions,
    ) -> Result<ExecutionStatus>;

    /// Submits `endKeygen`, announcing the fresh MPC address.
    async fn end_keygen(
        &self,
        mpc_address: Address,
        opts: TransactOptions,
    ) -> Result<H256>;
}

pub(crate) fn encode_call(signature: &str, tokens: &[Token]) -> Bytes {
    let selector = id(signature);
    let mut data = selector.to_vec();
    data.extend(encode(tokens));
    data.into()
}

fn left_pad(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    out
}

/// The bridge contract on one chain.
pub struct BridgeContract {
    address: Address,
    client: Arc<EvmClient>,
    gas_pricer: GasPricer,
}

impl BridgeContract {
    /// Creates a wrapper around the bridge at `address`.
    pub fn new(
        client: Arc<EvmClient>,
        address: Address,
        gas_pricer: GasPricer,
    ) -> Self {
        Self {
            address,
            client,
            gas_pricer,
        }
    }

    /// The bridge contract address.
    pub fn address(&self) -> Address {
        self.address
    }

    async fn call(&self, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(data)
            .into();
        self.client
            .call(&tx, None)
            .await
            .map_err(|e| Error::EvmMiddleware(e.to_string()))
    }

    async fn transact(
        &self,
        data: Bytes,
        opts: &TransactOptions,
    ) -> Result<TransactionReceipt> {
        let (max_fee, max_priority_fee) =
            self.gas_pricer.estimate().await?;
        let mut tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(data)
            .value(opts.value)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(max_priority_fee);
        if let Some(gas_limit) = opts.gas_limit {
            tx = tx.gas(gas_limit);
        }
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| Error::EvmMiddleware(e.to_string()))?;
        pending.await?.ok_or(Error::TransactionDropped)
    }

    async fn deposit(
        &self,
        resource_id: [u8; 32],
        dest_domain_id: u8,
        data: Vec<u8>,
        fee_data: Vec<u8>,
        opts: &TransactOptions,
    ) -> Result<H256> {
        let calldata = encode_call(
            "deposit(uint8,bytes32,bytes,bytes)",
            &[
                Token::Uint(U256::from(dest_domain_id)),
                Token::FixedBytes(resource_id.to_vec()),
                Token::Bytes(data),
                Token::Bytes(fee_data),
            ],
        );
        let receipt = self.transact(calldata, opts).await?;
        Ok(receipt.transaction_hash)
    }

    /// Deposits `amount` of the erc20 resource for `recipient` on the
    /// destination domain.
    pub async fn erc20_deposit(
        &self,
        recipient: Address,
        amount: U256,
        resource_id: [u8; 32],
        dest_domain_id: u8,
        fee_data: Vec<u8>,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(
            %recipient,
            %amount,
            resource_id = %hex::encode(resource_id),
            dest_domain_id,
            "ERC20 deposit",
        );
        let data = match validate_priority(opts.priority)? {
            0 => construct_erc20_deposit_data(
                recipient.as_bytes(),
                amount,
            ),
            priority => construct_erc20_deposit_data_with_priority(
                recipient.as_bytes(),
                amount,
                priority,
            ),
        };
        self.deposit(resource_id, dest_domain_id, data, fee_data, &opts)
            .await
    }

    /// Deposits the erc721 token for `recipient` on the destination domain.
    #[allow(clippy::too_many_arguments)]
    pub async fn erc721_deposit(
        &self,
        token_id: U256,
        metadata: &str,
        recipient: Address,
        resource_id: [u8; 32],
        dest_domain_id: u8,
        fee_data: Vec<u8>,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(
            %recipient,
            %token_id,
            resource_id = %hex::encode(resource_id),
            dest_domain_id,
            "ERC721 deposit",
        );
        let data = match validate_priority(opts.priority)? {
            0 => construct_erc721_deposit_data(
                recipient.as_bytes(),
                token_id,
                metadata.as_bytes(),
            ),
            priority => construct_erc721_deposit_data_with_priority(
                recipient.as_bytes(),
                token_id,
                metadata.as_bytes(),
                priority,
            ),
        };
        self.deposit(resource_id, dest_domain_id, data, fee_data, &opts)
            .await
    }

    /// Deposits an arbitrary generic payload on the destination domain.
    pub async fn generic_deposit(
        &self,
        metadata: &[u8],
        resource_id: [u8; 32],
        dest_domain_id: u8,
        fee_data: Vec<u8>,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(
            resource_id = %hex::encode(resource_id),
            dest_domain_id,
            "generic deposit",
        );
        let data = construct_generic_deposit_data(metadata);
        self.deposit(resource_id, dest_domain_id, data, fee_data, &opts)
            .await
    }

    /// Registers `handler` for the resource, pointing at the target token
    /// contract.
    pub async fn admin_set_resource(
        &self,
        handler: Address,
        resource_id: [u8; 32],
        target: Address,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(
            resource_id = %hex::encode(resource_id),
            "setting resource",
        );
        let data = encode_call(
            "adminSetResource(address,bytes32,address)",
            &[
                Token::Address(handler),
                Token::FixedBytes(resource_id.to_vec()),
                Token::Address(target),
            ],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Registers the generic handler with its call signatures.
    #[allow(clippy::too_many_arguments)]
    pub async fn admin_set_generic_resource(
        &self,
        handler: Address,
        resource_id: [u8; 32],
        target: Address,
        deposit_function_sig: [u8; 4],
        depositer_offset: U256,
        execute_function_sig: [u8; 4],
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(
            resource_id = %hex::encode(resource_id),
            "setting generic resource",
        );
        let data = encode_call(
            "adminSetGenericResource(address,bytes32,address,bytes4,uint256,bytes4)",
            &[
                Token::Address(handler),
                Token::FixedBytes(resource_id.to_vec()),
                Token::Address(target),
                Token::FixedBytes(deposit_function_sig.to_vec()),
                Token::Uint(depositer_offset),
                Token::FixedBytes(execute_function_sig.to_vec()),
            ],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Marks the token burnable for its handler.
    pub async fn admin_set_burnable(
        &self,
        handler: Address,
        token: Address,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(%token, "setting burnable input");
        let data = encode_call(
            "adminSetBurnable(address,address)",
            &[Token::Address(handler), Token::Address(token)],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Overrides the deposit nonce of a domain.
    pub async fn admin_set_deposit_nonce(
        &self,
        domain_id: u8,
        nonce: u64,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(domain_id, nonce, "setting deposit nonce");
        let data = encode_call(
            "adminSetDepositNonce(uint8,uint64)",
            &[
                Token::Uint(U256::from(domain_id)),
                Token::Uint(U256::from(nonce)),
            ],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Swaps the fee handler contract.
    pub async fn admin_change_fee_handler(
        &self,
        fee_handler: Address,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(%fee_handler, "setting fee handler");
        let data = encode_call(
            "adminChangeFeeHandler(address)",
            &[Token::Address(fee_handler)],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Withdraws funds a handler holds. The withdrawal data packs the token
    /// address, the recipient and the amount or token id, each left-padded
    /// to 32 bytes.
    pub async fn admin_withdraw(
        &self,
        handler: Address,
        token: Address,
        recipient: Address,
        amount_or_token_id: U256,
        opts: TransactOptions,
    ) -> Result<H256> {
        let mut withdrawal = Vec::with_capacity(96);
        withdrawal.extend_from_slice(&left_pad(token.as_bytes()));
        withdrawal.extend_from_slice(&left_pad(recipient.as_bytes()));
        let mut amount = [0u8; 32];
        amount_or_token_id.to_big_endian(&mut amount);
        withdrawal.extend_from_slice(&amount);
        let data = encode_call(
            "adminWithdraw(address,bytes)",
            &[Token::Address(handler), Token::Bytes(withdrawal)],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Pauses deposits and proposal execution.
    pub async fn admin_pause_transfers(
        &self,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!("pause transfers");
        let data = encode_call("adminPauseTransfers()", &[]);
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// Resumes deposits and proposal execution.
    pub async fn admin_unpause_transfers(
        &self,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!("unpause transfers");
        let data = encode_call("adminUnpauseTransfers()", &[]);
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }

    /// The handler registered for a resource id.
    pub async fn handler_address_for_resource_id(
        &self,
        resource_id: [u8; 32],
    ) -> Result<Address> {
        let data = encode_call(
            "_resourceIDToHandlerAddress(bytes32)",
            &[Token::FixedBytes(resource_id.to_vec())],
        );
        let out = self.call(data).await?;
        let tokens =
            ethers::abi::decode(&[ParamType::Address], &out)
                .map_err(|e| Error::AbiDecode(e.to_string()))?;
        match tokens.into_iter().next() {
            Some(Token::Address(address)) => Ok(address),
            _ => Err(Error::AbiDecode("bad handler address".into())),
        }
    }
}

#[async_trait]
impl BridgeOps for BridgeContract {
    async fn is_proposal_executed(
        &self,
        proposal: &Proposal,
    ) -> Result<bool> {
        tracing::debug!(
            deposit_nonce = proposal.deposit_nonce,
            resource_id = %hex::encode(proposal.resource_id),
            "querying proposal execution state",
        );
        let data = encode_call(
            "isProposalExecuted(uint8,uint256)",
            &[
                Token::Uint(U256::from(proposal.source)),
                Token::Uint(U256::from(proposal.deposit_nonce)),
            ],
        );
        let out = self.call(data).await?;
        let tokens = ethers::abi::decode(&[ParamType::Bool], &out)
            .map_err(|e| Error::AbiDecode(e.to_string()))?;
        match tokens.into_iter().next() {
            Some(Token::Bool(executed)) => Ok(executed),
            _ => Err(Error::AbiDecode("bad isProposalExecuted".into())),
        }
    }

    async fn execute_proposal(
        &self,
        proposal: &Proposal,
        signature: &[u8],
        opts: TransactOptions,
    ) -> Result<ExecutionStatus> {
        tracing::debug!(
            deposit_nonce = proposal.deposit_nonce,
            resource_id = %hex::encode(proposal.resource_id),
            handler = %proposal.handler_address,
            "execute proposal",
        );
        let data = encode_call(
            "executeProposal(uint8,uint64,bytes,bytes32,bytes)",
            &[
                Token::Uint(U256::from(proposal.source)),
                Token::Uint(U256::from(proposal.deposit_nonce)),
                Token::Bytes(proposal.data.clone()),
                Token::FixedBytes(proposal.resource_id.to_vec()),
                Token::Bytes(signature.to_vec()),
            ],
        );
        let receipt = self.transact(data, &opts).await?;
        if receipt.status == Some(1u64.into()) {
            Ok(ExecutionStatus::Executed(receipt.transaction_hash))
        } else {
            Ok(ExecutionStatus::Reverted(receipt.transaction_hash))
        }
    }

    async fn end_keygen(
        &self,
        mpc_address: Address,
        opts: TransactOptions,
    ) -> Result<H256> {
        tracing::debug!(%mpc_address, "ending keygen process");
        let data = encode_call(
            "endKeygen(address)",
            &[Token::Address(mpc_address)],
        );
        Ok(self.transact(data, &opts).await?.transaction_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calldata_carries_the_right_selector() {
        let data = encode_call(
            "executeProposal(uint8,uint64,bytes,bytes32,bytes)",
            &[
                Token::Uint(U256::from(1u8)),
                Token::Uint(U256::from(42u64)),
                Token::Bytes(vec![1, 2, 3]),
                Token::FixedBytes(vec![0u8; 32]),
                Token::Bytes(vec![9u8; 65]),
            ],
        );
        let selector =
            id("executeProposal(uint8,uint64,bytes,bytes32,bytes)");
        assert_eq!(&data[..4], selector.as_slice());

        let pause = encode_call("adminPauseTransfers()", &[]);
        assert_eq!(pause.len(), 4);
        assert_eq!(&pause[..4], id("adminPauseTransfers()").as_slice());
    }

    #[test]
    fn left_pad_fills_to_a_word() {
        let padded = left_pad(&[0xaa, 0xbb]);
        assert_eq!(padded[30..], [0xaa, 0xbb]);
        assert!(padded[..30].iter().all(|b| *b == 0));
    }
}
