//! Ledger reads and writes used by reconciliation and the lifecycle controller

use super::contracts::{Erc20, Recorder, Router, Sig, SwapTx, Vault};
use super::ChainProvider;
use crate::error::{WatcherError, WatcherResult};
use crate::state::{OperatorSignature, SwapPayload};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Receipt of an executed batch transaction
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReceipt {
    /// Execution status, false when the batch reverted
    pub status: bool,
    pub block_number: u64,
    pub logs: Vec<Log>,
}

impl From<TransactionReceipt> for LedgerReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            status: receipt.status.map_or(true, |s| s.as_u64() == 1),
            block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or(0),
            logs: receipt.logs,
        }
    }
}

/// Arguments of a reimbursement claim
#[derive(Debug, Clone, PartialEq)]
pub struct ReimbursementClaim {
    pub round: u64,
    pub order: u64,
    pub tx: SwapPayload,
    pub proof_hash: H256,
    pub operator_signature: OperatorSignature,
}

/// Ledger access
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Receipt of a transaction, `None` while it is not mined
    async fn receipt(&self, tx_hash: H256) -> WatcherResult<Option<LedgerReceipt>>;

    /// Unix timestamp of a block
    async fn block_timestamp(&self, block_number: u64) -> WatcherResult<u64>;

    /// ERC-20 decimals and symbol
    async fn decimals_and_symbol(&self, token: Address) -> WatcherResult<(u8, String)>;

    /// Withdraw a submitted transaction from the sequencer's queue
    async fn cancel(&self, tx_hash: H256) -> WatcherResult<H256>;

    /// Claim compensation for a transaction whose committed order was broken
    async fn claim_reimbursement(&self, claim: ReimbursementClaim) -> WatcherResult<H256>;

    /// Address the operator signs receipts with
    async fn operator(&self) -> WatcherResult<Address>;

    /// Amount paid out per reimbursement claim
    async fn reimbursement_amount(&self) -> WatcherResult<U256>;
}

/// Contract addresses the ledger talks to
#[derive(Debug, Clone, Copy)]
pub struct LedgerAddresses {
    pub router: Address,
    pub recorder: Address,
    pub vault: Address,
}

/// EVM ledger over a failover provider
pub struct EvmLedger {
    provider: Arc<ChainProvider>,
    /// Absent when no wallet is configured; writes then fail
    sender: Option<Arc<TransactionSender>>,
    addresses: LedgerAddresses,
}

impl EvmLedger {
    pub fn new(
        provider: Arc<ChainProvider>,
        sender: Option<Arc<TransactionSender>>,
        addresses: LedgerAddresses,
    ) -> Self {
        Self {
            provider,
            sender,
            addresses,
        }
    }

    fn sender(&self) -> WatcherResult<&TransactionSender> {
        self.sender
            .as_deref()
            .ok_or_else(|| WatcherError::Wallet("ledger writes need a wallet".to_string()))
    }

    /// Reverts and undecodable results will not change on retry; only
    /// transport failures count against the endpoint
    fn read_error<M: Middleware>(&self, call: &str, e: ContractError<M>) -> WatcherError {
        if is_permanent(&e) {
            WatcherError::Contract(format!("{}: {}", call, e))
        } else {
            self.provider.connection_error(format!("{}: {}", call, e))
        }
    }
}

fn is_permanent<M: Middleware>(e: &ContractError<M>) -> bool {
    matches!(
        e,
        ContractError::Revert(_)
            | ContractError::DecodingError(_)
            | ContractError::AbiError(_)
            | ContractError::DetokenizationError(_)
    )
}

fn swap_tx(payload: &SwapPayload) -> SwapTx {
    SwapTx {
        tx_owner: payload.tx_owner,
        function_selector: payload.function_selector,
        amount_in: payload.amount_in,
        amount_out: payload.amount_out,
        path: payload.path.clone(),
        to: payload.to,
        nonce: payload.nonce,
        available_from: U256::from(payload.available_from),
        deadline: U256::from(payload.deadline),
    }
}

fn sig(signature: &OperatorSignature) -> Sig {
    Sig {
        v: signature.v,
        r: signature.r.to_fixed_bytes(),
        s: signature.s.to_fixed_bytes(),
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    async fn receipt(&self, tx_hash: H256) -> WatcherResult<Option<LedgerReceipt>> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        Ok(receipt.map(LedgerReceipt::from))
    }

    async fn block_timestamp(&self, block_number: u64) -> WatcherResult<u64> {
        let block = self.provider.get_block(block_number).await?.ok_or_else(|| {
            WatcherError::ChainConnection {
                chain_id: self.provider.chain_id(),
                message: format!("block {} not available", block_number),
            }
        })?;
        Ok(block.timestamp.as_u64())
    }

    async fn decimals_and_symbol(&self, token: Address) -> WatcherResult<(u8, String)> {
        let contract = Erc20::new(token, self.provider.http());
        let decimals = contract
            .decimals()
            .call()
            .await
            .map_err(|e| self.read_error("decimals", e))?;
        let symbol = contract
            .symbol()
            .call()
            .await
            .map_err(|e| self.read_error("symbol", e))?;

        debug!("Token {:?} is {} with {} decimals", token, symbol, decimals);
        Ok((decimals, symbol))
    }

    async fn cancel(&self, tx_hash: H256) -> WatcherResult<H256> {
        let recorder = Recorder::new(self.addresses.recorder, self.provider.http());
        let data = recorder
            .disable_tx_hash(tx_hash.to_fixed_bytes())
            .calldata()
            .ok_or_else(|| WatcherError::Internal("disableTxHash calldata".to_string()))?;

        let sent = self.sender()?.send_call(self.addresses.recorder, data).await?;
        info!("Cancel of {:?} sent as {:?}", tx_hash, sent);
        Ok(sent)
    }

    async fn claim_reimbursement(&self, claim: ReimbursementClaim) -> WatcherResult<H256> {
        let router = Router::new(self.addresses.router, self.provider.http());
        let data = router
            .reimbursement(
                U256::from(claim.round),
                U256::from(claim.order),
                swap_tx(&claim.tx),
                claim.proof_hash.to_fixed_bytes(),
                sig(&claim.operator_signature),
            )
            .calldata()
            .ok_or_else(|| WatcherError::Internal("reimbursement calldata".to_string()))?;

        let sent = self.sender()?.send_call(self.addresses.router, data).await?;
        info!(
            "Reimbursement claim for round {} order {} sent as {:?}",
            claim.round, claim.order, sent
        );
        Ok(sent)
    }

    async fn operator(&self) -> WatcherResult<Address> {
        Router::new(self.addresses.router, self.provider.http())
            .operator()
            .call()
            .await
            .map_err(|e| self.read_error("operator", e))
    }

    async fn reimbursement_amount(&self) -> WatcherResult<U256> {
        Vault::new(self.addresses.vault, self.provider.http())
            .reimbursement_amount()
            .call()
            .await
            .map_err(|e| self.read_error("reimbursementAmount", e))
    }
}
