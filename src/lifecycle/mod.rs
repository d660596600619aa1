//! User-initiated transitions of tracked swaps

pub mod controller;

pub use controller::{
    CycleRestart, LifecycleController, ReimbursementDetails, SubmittedSwap, SwapSubmission,
};
