//! Chain module - coin backends and shared chain watchers
//!
//! This module provides:
//! - The `CoinAdapter` seam every coin backend implements
//! - One polling `ChainWatcher` per coin, fanning out confirmation events
//! - Confirmation tracking with reorg detection
//! - An EVM backend with multi-RPC failover and an in-memory simulated ledger

pub mod finality;
pub mod provider;
pub mod simulated;
pub mod watcher;

pub use crate::config::CoinFamily;
pub use finality::{recommended_confirmations, ConfirmationEvent, ConfirmationTracker, TxStatus};
pub use provider::EvmCoin;
pub use watcher::{ChainWatcher, ConfirmationStream, LocktimeStatus};

use crate::config::{CoinBackend, CoinConfig, Settings};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{HtlcTx, Secret};
use crate::swap::{ConfirmationSettings, Payment};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Latest block of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    /// Block time, the authoritative clock for locktimes
    pub timestamp: u64,
    pub hash: String,
}

/// How a payment output was consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendKind {
    /// Recipient claim revealing the secret
    Claim { secret: Secret },
    /// Sender refund after the locktime
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendInfo {
    pub txid: String,
    pub kind: SpendKind,
    pub height: Option<u64>,
}

/// A payment as the chain itself carries it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainPayment {
    pub txid: String,
    /// Locking script or contract calldata
    #[serde(with = "hex")]
    pub script: Vec<u8>,
    pub amount: u64,
    #[serde(with = "hex")]
    pub sender: Vec<u8>,
}

/// Backend for one coin: chain queries plus the wallet signing our HTLC transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoinAdapter: Send + Sync {
    fn ticker(&self) -> String;

    fn family(&self) -> CoinFamily;

    /// Key used for our side of HTLCs on this coin
    fn htlc_pubkey(&self) -> Vec<u8>;

    async fn current_tip(&self) -> SwapResult<ChainTip>;

    async fn tx_status(&self, txid: &str) -> SwapResult<TxStatus>;

    /// Sign a transaction, filling `signer`, `signed` and a deterministic `txid`
    async fn sign(&self, tx: HtlcTx) -> SwapResult<HtlcTx>;

    /// Broadcast a signed transaction; rebroadcasting a known transaction succeeds
    async fn broadcast(&self, tx: &HtlcTx) -> SwapResult<String>;

    /// Read a transaction back from the chain, `None` while it is unknown
    async fn fetch_payment(&self, txid: &str) -> SwapResult<Option<OnChainPayment>>;

    /// Look for a transaction consuming `payment`
    async fn find_spend(&self, payment: &Payment) -> SwapResult<Option<SpendInfo>>;

    async fn health_check(&self) -> bool {
        self.current_tip().await.is_ok()
    }
}

/// Registry of coin adapters and their watchers
pub struct ChainManager {
    /// Adapters indexed by ticker
    coins: DashMap<String, Arc<dyn CoinAdapter>>,
    /// Watchers indexed by ticker
    watchers: DashMap<String, Arc<ChainWatcher>>,
    /// Default confirmation settings indexed by ticker
    confirmations: DashMap<String, ConfirmationSettings>,
    poll_interval: Duration,
    handles: RwLock<Vec<JoinHandle<()>>>,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            coins: DashMap::new(),
            watchers: DashMap::new(),
            confirmations: DashMap::new(),
            poll_interval,
            handles: RwLock::new(Vec::new()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Create adapters for every enabled coin
    pub async fn from_settings(
        settings: &Settings,
        simulated: &simulated::SimulatedNetwork,
    ) -> SwapResult<Self> {
        let manager = Self::new(settings.engine.poll_interval());

        for (ticker, coin) in settings.enabled_coins() {
            info!("Initializing coin {} ({:?}, {:?})", ticker, coin.family, coin.backend);

            let adapter: Arc<dyn CoinAdapter> = match coin.backend {
                CoinBackend::Evm => {
                    let key = load_private_key(settings)?;
                    Arc::new(EvmCoin::new(ticker.clone(), coin.clone(), &key).await?)
                }
                CoinBackend::Simulated => {
                    let seed = settings
                        .wallet
                        .seed_env
                        .as_ref()
                        .and_then(|var| std::env::var(var).ok())
                        .unwrap_or_else(|| settings.engine.instance_id.clone());
                    let chain = simulated.chain(ticker, coin);
                    Arc::new(simulated::SimulatedWallet::new(chain, &seed))
                }
            };

            manager.register(adapter, default_confirmations(coin));
            info!("Coin {} initialized successfully", ticker);
        }

        Ok(manager)
    }

    /// Register a coin and create its watcher
    pub fn register(&self, adapter: Arc<dyn CoinAdapter>, confirmations: ConfirmationSettings) {
        let ticker = adapter.ticker();
        let watcher = Arc::new(ChainWatcher::new(adapter.clone(), self.poll_interval));
        self.watchers.insert(ticker.clone(), watcher);
        self.confirmations.insert(ticker.clone(), confirmations);
        self.coins.insert(ticker, adapter);
    }

    /// Spawn one polling loop per coin
    pub async fn start_watchers(&self) {
        let mut handles = self.handles.write().await;

        for entry in self.watchers.iter() {
            let watcher = entry.value().clone();
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                watcher.run(shutdown).await;
            }));
        }
    }

    /// Get adapter for a specific coin
    pub fn coin(&self, ticker: &str) -> SwapResult<Arc<dyn CoinAdapter>> {
        self.coins
            .get(ticker)
            .map(|c| c.clone())
            .ok_or_else(|| SwapError::CoinNotFound(ticker.to_string()))
    }

    /// Get watcher for a specific coin
    pub fn watcher(&self, ticker: &str) -> SwapResult<Arc<ChainWatcher>> {
        self.watchers
            .get(ticker)
            .map(|w| w.clone())
            .ok_or_else(|| SwapError::CoinNotFound(ticker.to_string()))
    }

    pub fn confirmations(&self, ticker: &str) -> SwapResult<ConfirmationSettings> {
        self.confirmations
            .get(ticker)
            .map(|c| *c)
            .ok_or_else(|| SwapError::CoinNotFound(ticker.to_string()))
    }

    /// Health check for all coins
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let coins: Vec<_> = self
            .coins
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (ticker, coin) in coins {
            let healthy = coin.health_check().await;
            if !healthy {
                warn!("Coin {} health check failed", ticker);
            }
            crate::metrics::record_chain_health(&ticker, healthy);
            results.push((ticker, healthy));
        }

        results
    }

    /// Get all registered tickers
    pub fn connected_coins(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.coins.iter().map(|e| e.key().clone()).collect();
        tickers.sort();
        tickers
    }

    /// Stop all watchers
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        for handle in self.handles.write().await.drain(..) {
            handle.abort();
        }
        info!("Chain manager stopped");
    }
}

fn default_confirmations(coin: &CoinConfig) -> ConfirmationSettings {
    ConfirmationSettings {
        confirmations: coin.confirmations(),
        protected: coin.requires_protection,
        protected_confirmations: coin.protected(),
    }
}

fn load_private_key(settings: &Settings) -> SwapResult<String> {
    let var = settings
        .wallet
        .private_key_env
        .clone()
        .unwrap_or_else(|| "SWAP_ENGINE_PRIVATE_KEY".to_string());

    std::env::var(&var).map_err(|_| {
        error!("No wallet key found in {}", var);
        SwapError::Config(format!("No wallet configured. Set {}", var))
    })
}
