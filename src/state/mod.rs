//! State management with SQLite persistence
//!
//! Handles:
//! - Ready transactions and their tracking cycles
//! - The append-only outcome history
//! - Guarded cycle closing and re-filing

pub mod manager;
pub mod model;

pub use manager::StateManager;
pub use model::{
    HistoryRecord, NewPendingTx, NewReadyTx, NewTxHistory, OperatorSignature, PendingTx,
    ReadyTx, SwapPayload, TokenAmount, TxHistory, TxStatus, UNASSIGNED_ORDER,
};
