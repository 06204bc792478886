//! Swap engine - atomic swap coordination for non-custodial cross-chain trading
//!
//! Two parties exchange coins on different chains through hash-time-locked
//! payments. Each swap is driven by its own orchestrator task through a
//! persisted state machine, shared chain watchers report confirmations and
//! reorgs, and a refund supervisor reclaims locked funds when the
//! counterparty does not finish in time.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod htlc;
pub mod metrics;
pub mod negotiation;
pub mod orchestrator;
pub mod refund;
pub mod store;
pub mod swap;
pub mod tx;

pub use coordination::SwapEngine;
pub use error::{SwapError, SwapResult};
