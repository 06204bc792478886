//! Broadcast with bounded exponential backoff

use crate::chain::{ChainWatcher, CoinAdapter};
use crate::config::BackoffConfig;
use crate::error::{SwapError, SwapResult};
use crate::htlc::HtlcTx;

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exponential backoff schedule
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), capped at the maximum
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.max_attempts,
        )
    }
}

/// Chain time after which a broadcast must not be attempted
#[derive(Clone, Copy)]
pub struct Deadline<'a> {
    pub watcher: &'a ChainWatcher,
    pub time: u64,
}

impl Deadline<'_> {
    /// Error if the deadline has passed; an unreachable chain counts as not passed
    pub async fn check(&self) -> SwapResult<()> {
        match self.watcher.latest_tip().await {
            Ok(tip) if tip.timestamp >= self.time => Err(SwapError::DeadlinePassed {
                coin: self.watcher.ticker().to_string(),
                deadline: self.time,
                chain_time: tip.timestamp,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Cannot check deadline on {}: {}", self.watcher.ticker(), e);
                Ok(())
            }
        }
    }
}

/// Broadcast `tx`, retrying transient failures.
///
/// With a deadline the retries continue until chain time reaches it;
/// without one they stop after the policy's attempt budget. Permanent
/// errors are returned at once.
pub async fn broadcast_with_retry(
    adapter: &dyn CoinAdapter,
    tx: &HtlcTx,
    policy: &BackoffPolicy,
    deadline: Option<Deadline<'_>>,
) -> SwapResult<String> {
    let coin = adapter.ticker();
    let mut attempts = 0;

    loop {
        attempts += 1;

        if let Some(deadline) = &deadline {
            deadline.check().await?;
        }

        match adapter.broadcast(tx).await {
            Ok(txid) => {
                info!(
                    "{:?} {} broadcast on {} (attempt {})",
                    tx.kind, txid, coin, attempts
                );
                return Ok(txid);
            }
            Err(e) if e.is_retryable() => {
                crate::metrics::record_broadcast_retry(&coin);
                if deadline.is_none() && attempts >= policy.max_attempts() {
                    warn!("Giving up broadcast on {} after {} attempts", coin, attempts);
                    return Err(e);
                }
                let delay = policy.delay(attempts);
                warn!(
                    "Broadcast on {} failed (attempt {}): {}, retrying in {:?}",
                    coin, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry a fallible operation on transient errors within the attempt budget
pub async fn with_backoff<T, F, Fut>(policy: &BackoffPolicy, operation: &str, mut f: F) -> SwapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SwapResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts < policy.max_attempts() => {
                let delay = policy.delay(attempts);
                debug!("{} failed (attempt {}): {}, retrying in {:?}", operation, attempts, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainTip, MockCoinAdapter};
    use crate::config::CoinFamily;
    use crate::htlc::{build_payment, HtlcParams, SecretHashAlgo};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 2.0, max_attempts)
    }

    fn payment() -> HtlcTx {
        build_payment(HtlcParams {
            coin: "BTC".into(),
            family: CoinFamily::Utxo,
            secret_hash: [1; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
            recipient_pubkey: [vec![0x02], vec![1; 32]].concat(),
            refund_pubkey: [vec![0x03], vec![2; 32]].concat(),
            locktime: 5_000,
            amount: 10_000,
        })
        .unwrap()
    }

    fn unreachable() -> SwapError {
        SwapError::Broadcast {
            coin: "BTC".into(),
            message: "connection refused".into(),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(4), 2.0, 8);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("BTC".to_string());
        {
            let calls = calls.clone();
            mock.expect_broadcast().returning(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unreachable())
                } else {
                    Ok("txid".to_string())
                }
            });
        }

        let txid = broadcast_with_retry(&mock, &payment(), &fast_policy(5), None)
            .await
            .unwrap();
        assert_eq!(txid, "txid");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_and_permanent_errors() {
        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("BTC".to_string());
        mock.expect_broadcast().times(3).returning(|_| Err(unreachable()));
        let err = assert_err!(broadcast_with_retry(&mock, &payment(), &fast_policy(3), None).await);
        assert!(err.is_retryable());

        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("BTC".to_string());
        mock.expect_broadcast()
            .times(1)
            .returning(|_| Err(SwapError::Validation("bad script".into())));
        assert!(matches!(
            broadcast_with_retry(&mock, &payment(), &fast_policy(3), None).await,
            Err(SwapError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_deadline_stops_retries() {
        let mut chain = MockCoinAdapter::new();
        chain.expect_ticker().return_const("REL".to_string());
        chain.expect_current_tip().returning(|| {
            Ok(ChainTip {
                height: 10,
                timestamp: 9_000,
                hash: String::new(),
            })
        });
        let watcher = ChainWatcher::new(Arc::new(chain), Duration::from_millis(5));

        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("BTC".to_string());
        mock.expect_broadcast().never();

        let deadline = Deadline {
            watcher: &watcher,
            time: 8_000,
        };
        assert!(matches!(
            broadcast_with_retry(&mock, &payment(), &fast_policy(3), Some(deadline)).await,
            Err(SwapError::DeadlinePassed { deadline: 8_000, chain_time: 9_000, .. })
        ));
    }

    #[tokio::test]
    async fn test_with_backoff_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(4), "store append", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(unreachable())
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
