//! Reconciliation of open tracking cycles
//!
//! The engine:
//! 1. Resolves the round position of cycles submitted without one
//! 2. Matches open cycles against the sequencer's assigned batch and its receipt
//! 3. Verifies the committed order against the round's hash chain
//! 4. Appends exactly one outcome row per cycle and notifies

pub mod engine;

pub use engine::{ReconcileConfig, ReconciliationEngine, TickReport};
