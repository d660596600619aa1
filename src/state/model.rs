//! Records persisted by the state manager

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order value of a cycle whose position in its round is not known yet
pub const UNASSIGNED_ORDER: i64 = -1;

/// Token amount with arbitrary precision, kept as decimal strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    /// Token symbol
    pub token: String,
    /// Integer amount in base units
    pub amount: String,
    /// Scaling factor, a power of ten (`"1000000"` for 6 decimals)
    pub decimal: String,
}

impl TokenAmount {
    /// Build from a raw on-chain amount and the token's decimals
    pub fn from_units(token: impl Into<String>, amount: U256, decimals: u8) -> Self {
        Self {
            token: token.into(),
            amount: amount.to_string(),
            decimal: format!("1{}", "0".repeat(decimals as usize)),
        }
    }

    /// Render `integer.fraction` with at most `precision` fractional digits
    pub fn format(&self, precision: usize) -> Option<String> {
        let amount = U256::from_dec_str(&self.amount).ok()?;
        let scale = U256::from_dec_str(&self.decimal).ok()?;
        if scale.is_zero() {
            return None;
        }

        let whole = amount / scale;
        let fraction_digits = self.decimal.len().saturating_sub(1);
        if fraction_digits == 0 || precision == 0 {
            return Some(whole.to_string());
        }

        let remainder = (amount % scale).to_string();
        let padded = format!("{:0>width$}", remainder, width = fraction_digits);
        let shown = &padded[..precision.min(fraction_digits)];
        Some(format!("{}.{}", whole, shown))
    }
}

/// The signed swap a ready transaction carries, as needed by the reimbursement claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapPayload {
    pub tx_owner: Address,
    pub function_selector: [u8; 4],
    pub amount_in: U256,
    pub amount_out: U256,
    pub path: Vec<Address>,
    pub to: Address,
    pub nonce: U256,
    pub available_from: u64,
    pub deadline: u64,
}

/// Operator signature over a submission receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSignature {
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

impl OperatorSignature {
    /// Convert into the ethers signature type for address recovery
    pub fn to_signature(&self) -> ethers::types::Signature {
        ethers::types::Signature {
            r: U256::from_big_endian(self.r.as_bytes()),
            s: U256::from_big_endian(self.s.as_bytes()),
            v: self.v as u64,
        }
    }
}

/// A signed swap payload prepared for submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyTx {
    pub id: i64,
    pub from: TokenAmount,
    pub to: TokenAmount,
    pub tx_hash: H256,
    pub tx: SwapPayload,
    /// Unix seconds after which cancellation is no longer offered
    pub available_from: u64,
    pub send_date: i64,
    pub progress_here: bool,
}

#[derive(Debug, Clone)]
pub struct NewReadyTx {
    pub from: TokenAmount,
    pub to: TokenAmount,
    pub tx_hash: H256,
    pub tx: SwapPayload,
    pub available_from: u64,
    pub send_date: i64,
}

/// One tracking cycle of a ready transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTx {
    pub id: i64,
    pub ready_tx_id: i64,
    pub round: u64,
    /// Position in the round's hash list, [`UNASSIGNED_ORDER`] until resolved
    pub order: i64,
    pub proof_hash: H256,
    pub operator_signature: Option<OperatorSignature>,
    pub progress_here: bool,
}

impl PendingTx {
    pub fn is_unassigned(&self) -> bool {
        self.order == UNASSIGNED_ORDER
    }

    /// Notification key of this cycle
    pub fn notification_key(&self) -> String {
        format!("{}-{}", self.round, self.order)
    }
}

#[derive(Debug, Clone)]
pub struct NewPendingTx {
    pub ready_tx_id: i64,
    pub round: u64,
    pub order: i64,
    pub proof_hash: H256,
    pub operator_signature: Option<OperatorSignature>,
}

/// Observed outcome of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Completed,
    Rejected,
    ReimburseAvailable,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Rejected => "REJECTED",
            TxStatus::ReimburseAvailable => "REIMBURSE_AVAILABLE",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TxStatus::Pending),
            "COMPLETED" => Ok(TxStatus::Completed),
            "REJECTED" => Ok(TxStatus::Rejected),
            "REIMBURSE_AVAILABLE" => Ok(TxStatus::ReimburseAvailable),
            other => Err(format!("unknown tx status: {}", other)),
        }
    }
}

/// Append-only history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxHistory {
    pub id: i64,
    pub pending_tx_id: i64,
    pub tx_id: H256,
    /// Unix seconds of the executing block, 0 when unknown
    pub tx_date: u64,
    pub from: TokenAmount,
    pub to: TokenAmount,
    pub status: TxStatus,
}

#[derive(Debug, Clone)]
pub struct NewTxHistory {
    pub pending_tx_id: i64,
    pub tx_id: H256,
    pub tx_date: u64,
    pub from: TokenAmount,
    pub to: TokenAmount,
    pub status: TxStatus,
}

/// History row joined with its cycle and ready transaction
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub history: TxHistory,
    pub pending: PendingTx,
    pub ready: ReadyTx,
}
