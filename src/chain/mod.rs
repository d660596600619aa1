//! Chain module - ledger access for the tracked account
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Contract bindings for the recorder, router, vault and ERC-20 tokens
//! - The `Ledger` seam used by reconciliation and the lifecycle controller

pub mod contracts;
pub mod ledger;
pub mod provider;

pub use ledger::{EvmLedger, Ledger, LedgerAddresses, ReimbursementClaim};
pub use provider::ChainProvider;

#[cfg(test)]
pub use ledger::{LedgerReceipt, MockLedger};
