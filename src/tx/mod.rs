//! Transaction submission with bounded exponential backoff

mod retry;

pub use retry::{broadcast_with_retry, with_backoff, BackoffPolicy, Deadline};
