//! Coordination of orders and swaps
//!
//! The engine:
//! 1. Keeps this node's maker orders
//! 2. Starts an orchestrator when an order is matched or taken
//! 3. Resumes unfinished swaps on startup
//! 4. Answers cancel, recover and status requests

pub mod engine;
pub mod orders;

pub use engine::{EngineStats, Recovery, SwapEngine};
pub use orders::{Order, OrderRequest, OrderStatus, Price, TakeRequest};
