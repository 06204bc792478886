//! Per-coin chain watcher: one polling loop, many subscribers

use super::finality::{ConfirmationEvent, ConfirmationTracker};
use super::{ChainTip, CoinAdapter};
use crate::error::SwapResult;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Whether a locktime has passed by chain time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocktimeStatus {
    Expired,
    NotYet,
}

struct Subscription {
    id: u64,
    txid: String,
    tracker: ConfirmationTracker,
    events: mpsc::UnboundedSender<ConfirmationEvent>,
}

/// Stream of confirmation events for one transaction; ends after `Confirmed`
pub struct ConfirmationStream {
    txid: String,
    events: mpsc::UnboundedReceiver<ConfirmationEvent>,
}

impl ConfirmationStream {
    pub fn txid(&self) -> &str {
        &self.txid
    }

    pub async fn next(&mut self) -> Option<ConfirmationEvent> {
        self.events.recv().await
    }
}

/// Polls one coin and fans out tips and confirmation events
pub struct ChainWatcher {
    coin: Arc<dyn CoinAdapter>,
    ticker: String,
    poll_interval: Duration,
    ticks: broadcast::Sender<ChainTip>,
    latest: RwLock<Option<ChainTip>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl ChainWatcher {
    pub fn new(coin: Arc<dyn CoinAdapter>, poll_interval: Duration) -> Self {
        let (ticks, _) = broadcast::channel(1024);
        Self {
            ticker: coin.ticker(),
            coin,
            poll_interval,
            ticks,
            latest: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn coin(&self) -> Arc<dyn CoinAdapter> {
        self.coin.clone()
    }

    /// Watch `txid` until it has `required` confirmations
    pub async fn observe(&self, txid: &str, required: u64) -> ConfirmationStream {
        let (events, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscriptions.lock().await.push(Subscription {
            id,
            txid: txid.to_string(),
            tracker: ConfirmationTracker::new(required),
            events,
        });

        debug!(
            "Watching {} on {} for {} confirmations (subscription {})",
            txid, self.ticker, required, id
        );

        ConfirmationStream {
            txid: txid.to_string(),
            events: rx,
        }
    }

    /// Compare a locktime against the latest block time
    pub async fn observe_locktime(&self, locktime: u64) -> SwapResult<LocktimeStatus> {
        let tip = self.latest_tip().await?;
        Ok(if tip.timestamp >= locktime {
            LocktimeStatus::Expired
        } else {
            LocktimeStatus::NotYet
        })
    }

    /// Receive every new tip seen by the polling loop
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<ChainTip> {
        self.ticks.subscribe()
    }

    /// Latest tip, querying the backend if the loop has not produced one yet
    pub async fn latest_tip(&self) -> SwapResult<ChainTip> {
        if let Some(tip) = self.latest.read().await.clone() {
            return Ok(tip);
        }
        let tip = self.coin.current_tip().await?;
        *self.latest.write().await = Some(tip.clone());
        Ok(tip)
    }

    /// Main polling loop
    pub async fn run(&self, shutdown: Arc<RwLock<bool>>) {
        info!("Chain watcher started for {}", self.ticker);

        loop {
            if *shutdown.read().await {
                break;
            }

            if let Err(e) = self.poll_once().await {
                // Keep subscribers waiting, retry on the next interval
                warn!("Chain watcher poll failed for {}: {}", self.ticker, e);
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!("Chain watcher stopped for {}", self.ticker);
    }

    /// One polling round: refresh the tip, then every subscription
    pub async fn poll_once(&self) -> SwapResult<()> {
        let tip = self.coin.current_tip().await?;

        let changed = self.latest.read().await.as_ref() != Some(&tip);
        if changed {
            *self.latest.write().await = Some(tip.clone());
            crate::metrics::record_chain_height(&self.ticker, tip.height);
            // No receivers is fine
            let _ = self.ticks.send(tip.clone());
        }

        let mut subscriptions = self.subscriptions.lock().await;
        let mut finished = Vec::new();

        for sub in subscriptions.iter_mut() {
            if sub.events.is_closed() {
                finished.push(sub.id);
                continue;
            }

            let status = match self.coin.tx_status(&sub.txid).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Failed to query {} on {}: {}", sub.txid, self.ticker, e);
                    continue;
                }
            };

            if let Some(event) = sub.tracker.update(tip.height, status) {
                if let ConfirmationEvent::Regressed {
                    previous,
                    confirmations,
                } = event
                {
                    warn!(
                        "Reorg on {}: {} fell from {} to {} confirmations",
                        self.ticker, sub.txid, previous, confirmations
                    );
                    crate::metrics::record_confirmation_regression(&self.ticker);
                }
                if sub.events.send(event).is_err() || sub.tracker.is_confirmed() {
                    finished.push(sub.id);
                }
            }
        }

        subscriptions.retain(|s| !finished.contains(&s.id));
        Ok(())
    }

    /// Current depth of `txid`, read from the backend rather than the cached tip
    pub async fn confirmations(&self, txid: &str) -> SwapResult<u64> {
        let tip = self.coin.current_tip().await?;
        let status = self.coin.tx_status(txid).await?;
        Ok(status.confirmations(tip.height))
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockCoinAdapter, TxStatus};
    use crate::error::SwapError;
    use std::sync::Mutex as StdMutex;

    fn tip(height: u64) -> ChainTip {
        ChainTip {
            height,
            timestamp: 1_000 + height * 600,
            hash: format!("{:064x}", height),
        }
    }

    /// Adapter replaying a scripted sequence of (tip, status) observations
    fn scripted(observations: Vec<(u64, TxStatus)>) -> MockCoinAdapter {
        let script = Arc::new(StdMutex::new(observations.into_iter()));
        let current = Arc::new(StdMutex::new((0u64, TxStatus::Unknown)));

        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("BTC".to_string());
        {
            let current = current.clone();
            mock.expect_current_tip().returning(move || {
                let next = script.lock().unwrap().next();
                let mut current = current.lock().unwrap();
                if let Some(next) = next {
                    *current = next;
                }
                Ok(tip(current.0))
            });
        }
        mock.expect_tx_status()
            .returning(move |_| Ok(current.lock().unwrap().1));
        mock
    }

    #[tokio::test]
    async fn test_confirmations_then_stream_completes() {
        let mock = scripted(vec![
            (100, TxStatus::Mempool),
            (101, TxStatus::Included { height: 101 }),
            (102, TxStatus::Included { height: 101 }),
        ]);
        let watcher = ChainWatcher::new(Arc::new(mock), Duration::from_millis(10));
        let mut stream = watcher.observe("aa", 2).await;
        let mut ticks = watcher.subscribe_ticks();

        for _ in 0..3 {
            watcher.poll_once().await.unwrap();
        }

        assert!(matches!(
            stream.next().await,
            Some(ConfirmationEvent::Progress { confirmations: 0, .. })
        ));
        assert!(matches!(
            stream.next().await,
            Some(ConfirmationEvent::Progress { confirmations: 1, .. })
        ));
        assert_eq!(
            stream.next().await,
            Some(ConfirmationEvent::Confirmed {
                confirmations: 2,
                height: Some(101)
            })
        );
        // Subscription removed, sender dropped
        assert_eq!(stream.next().await, None);
        assert_eq!(watcher.subscription_count().await, 0);

        assert_eq!(ticks.recv().await.unwrap().height, 100);
        assert_eq!(ticks.recv().await.unwrap().height, 101);
    }

    #[tokio::test]
    async fn test_reorg_regression_reaches_subscriber() {
        let mock = scripted(vec![
            (50, TxStatus::Included { height: 50 }),
            (51, TxStatus::Unknown),
            (52, TxStatus::Included { height: 52 }),
        ]);
        let watcher = ChainWatcher::new(Arc::new(mock), Duration::from_millis(10));
        let mut stream = watcher.observe("bb", 3).await;

        for _ in 0..3 {
            watcher.poll_once().await.unwrap();
        }

        assert!(matches!(
            stream.next().await,
            Some(ConfirmationEvent::Progress { confirmations: 1, .. })
        ));
        assert_eq!(
            stream.next().await,
            Some(ConfirmationEvent::Regressed {
                previous: 1,
                confirmations: 0
            })
        );
        assert!(matches!(
            stream.next().await,
            Some(ConfirmationEvent::Progress { confirmations: 1, .. })
        ));
        assert_eq!(watcher.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_locktime_uses_block_time() {
        let mock = scripted(vec![(10, TxStatus::Unknown)]);
        let watcher = ChainWatcher::new(Arc::new(mock), Duration::from_millis(10));
        watcher.poll_once().await.unwrap();

        // tip 10 has timestamp 7_000
        assert_eq!(watcher.observe_locktime(7_000).await.unwrap(), LocktimeStatus::Expired);
        assert_eq!(watcher.observe_locktime(7_001).await.unwrap(), LocktimeStatus::NotYet);
    }

    #[tokio::test]
    async fn test_depth_is_read_from_backend_after_reorg() {
        let mock = scripted(vec![
            (60, TxStatus::Included { height: 58 }),
            (60, TxStatus::Included { height: 58 }),
            (61, TxStatus::Mempool),
        ]);
        let watcher = ChainWatcher::new(Arc::new(mock), Duration::from_millis(10));
        watcher.poll_once().await.unwrap();

        assert_eq!(watcher.confirmations("cc").await.unwrap(), 3);
        // Cached tip is stale, the backend already lost the block
        assert_eq!(watcher.confirmations("cc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_error_is_reported() {
        let mut mock = MockCoinAdapter::new();
        mock.expect_ticker().return_const("ETH".to_string());
        mock.expect_current_tip().returning(|| {
            Err(SwapError::ChainConnection {
                coin: "ETH".into(),
                message: "All providers failed".into(),
            })
        });
        let watcher = ChainWatcher::new(Arc::new(mock), Duration::from_millis(10));
        assert!(watcher.poll_once().await.is_err());
        assert!(watcher.latest_tip().await.is_err());
    }
}
