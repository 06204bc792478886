//! In-memory ledger for development networks and tests
//!
//! Each `SimulatedChain` keeps blocks, a mempool and a spend index, and
//! enforces the HTLC rules a real chain would: claims need the secret and
//! the recipient key, refunds need the sender key and an expired locktime,
//! and an output can only be spent once.

use super::{ChainTip, CoinAdapter, OnChainPayment, SpendInfo, SpendKind, TxStatus};
use crate::config::{CoinConfig, CoinFamily};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{script, HtlcTx, HtlcTxKind};
use crate::swap::Payment;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct SimTx {
    tx: HtlcTx,
    height: Option<u64>,
}

struct Ledger {
    height: u64,
    timestamp: u64,
    txs: HashMap<String, SimTx>,
    mempool: Vec<String>,
    /// Funding txid -> spending txid
    spends: HashMap<String, String>,
}

/// One simulated blockchain
pub struct SimulatedChain {
    ticker: String,
    family: CoinFamily,
    block_time: u64,
    ledger: RwLock<Ledger>,
}

impl SimulatedChain {
    pub fn new(ticker: &str, family: CoinFamily, block_time: u64) -> Self {
        let genesis = chrono::Utc::now().timestamp().max(0) as u64;
        Self::with_genesis(ticker, family, block_time, genesis)
    }

    pub fn with_genesis(ticker: &str, family: CoinFamily, block_time: u64, genesis: u64) -> Self {
        Self {
            ticker: ticker.to_string(),
            family,
            block_time,
            ledger: RwLock::new(Ledger {
                height: 0,
                timestamp: genesis,
                txs: HashMap::new(),
                mempool: Vec::new(),
                spends: HashMap::new(),
            }),
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn family(&self) -> CoinFamily {
        self.family
    }

    pub async fn tip(&self) -> ChainTip {
        let ledger = self.ledger.read().await;
        tip_of(&ledger)
    }

    /// Mine `blocks` blocks, including the whole mempool in the first one
    pub async fn mine(&self, blocks: u64) -> ChainTip {
        let mut ledger = self.ledger.write().await;
        for _ in 0..blocks {
            ledger.height += 1;
            ledger.timestamp += self.block_time;
            let height = ledger.height;
            let pending: Vec<String> = ledger.mempool.drain(..).collect();
            for txid in pending {
                if let Some(sim) = ledger.txs.get_mut(&txid) {
                    sim.height = Some(height);
                }
            }
        }
        debug!("{} mined to height {}", self.ticker, ledger.height);
        tip_of(&ledger)
    }

    /// Mine until block time reaches `timestamp`
    pub async fn mine_until(&self, timestamp: u64) -> ChainTip {
        let current = self.tip().await.timestamp;
        if current >= timestamp {
            return self.tip().await;
        }
        let blocks = (timestamp - current).div_ceil(self.block_time.max(1));
        self.mine(blocks).await
    }

    /// Reorganise a transaction out of the chain entirely
    pub async fn drop_tx(&self, txid: &str) {
        let mut ledger = self.ledger.write().await;
        ledger.txs.remove(txid);
        ledger.mempool.retain(|t| t != txid);
        ledger.spends.retain(|_, spender| spender != txid);
        info!("{}: dropped {} from the chain", self.ticker, txid);
    }

    /// Reorganise a transaction back into the mempool
    pub async fn unconfirm(&self, txid: &str) {
        let mut guard = self.ledger.write().await;
        let ledger = &mut *guard;
        if let Some(sim) = ledger.txs.get_mut(txid) {
            sim.height = None;
            ledger.mempool.push(txid.to_string());
        }
    }

    /// Spawn a background miner producing one block per `interval`
    pub fn spawn_miner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                chain.mine(1).await;
            }
        })
    }

    pub async fn tx(&self, txid: &str) -> Option<HtlcTx> {
        self.ledger.read().await.txs.get(txid).map(|s| s.tx.clone())
    }

    pub async fn tx_status(&self, txid: &str) -> TxStatus {
        match self.ledger.read().await.txs.get(txid) {
            Some(SimTx {
                height: Some(height),
                ..
            }) => TxStatus::Included { height: *height },
            Some(_) => TxStatus::Mempool,
            None => TxStatus::Unknown,
        }
    }

    pub async fn find_spend(&self, funding_txid: &str) -> Option<SpendInfo> {
        let ledger = self.ledger.read().await;
        let spender = ledger.spends.get(funding_txid)?;
        let sim = ledger.txs.get(spender)?;
        let kind = match (&sim.tx.kind, &sim.tx.secret) {
            (HtlcTxKind::Spend, Some(secret)) => SpendKind::Claim {
                secret: secret.clone(),
            },
            _ => SpendKind::Refund,
        };
        Some(SpendInfo {
            txid: spender.clone(),
            kind,
            height: sim.height,
        })
    }

    /// Accept a signed transaction into the mempool
    pub async fn submit(&self, tx: &HtlcTx) -> SwapResult<String> {
        if !tx.is_signed() || tx.signed != signature(&tx.signer, tx) || tx.txid != txid_of(tx) {
            return Err(self.reject("bad signature"));
        }

        let mut ledger = self.ledger.write().await;
        if ledger.txs.contains_key(&tx.txid) {
            return Ok(tx.txid.clone());
        }

        match tx.kind {
            HtlcTxKind::Payment => {
                if tx.script != script::payment_script(&tx.params)? {
                    return Err(self.reject("script does not match parameters"));
                }
                if tx.signer != tx.params.refund_pubkey {
                    return Err(self.reject("payment not signed by sender"));
                }
            }
            HtlcTxKind::Spend | HtlcTxKind::Refund => {
                let funding = tx.spends.clone().unwrap_or_default();
                let funded = ledger
                    .txs
                    .get(&funding)
                    .ok_or_else(|| SwapError::TransactionNotFound {
                        coin: self.ticker.clone(),
                        txid: funding.clone(),
                    })?;
                if funded.tx.params != tx.params {
                    return Err(self.reject("spend parameters differ from funding output"));
                }
                if let Some(spender) = ledger.spends.get(&funding) {
                    return Err(SwapError::AlreadySpent {
                        coin: self.ticker.clone(),
                        txid: funding,
                        spent_by: spender.clone(),
                    });
                }
                if tx.kind == HtlcTxKind::Spend {
                    let secret_ok = tx.secret.as_ref().is_some_and(|s| {
                        s.matches(tx.params.secret_hash_algo, &tx.params.secret_hash)
                    });
                    if !secret_ok {
                        return Err(SwapError::SecretHashMismatch);
                    }
                    if tx.signer != tx.params.recipient_pubkey {
                        return Err(self.reject("claim not signed by recipient"));
                    }
                } else {
                    if ledger.timestamp < tx.params.locktime {
                        return Err(SwapError::LocktimeNotReached {
                            locktime: tx.params.locktime,
                            chain_time: ledger.timestamp,
                        });
                    }
                    if tx.signer != tx.params.refund_pubkey {
                        return Err(self.reject("refund not signed by sender"));
                    }
                }
                ledger.spends.insert(funding, tx.txid.clone());
            }
        }

        ledger.txs.insert(
            tx.txid.clone(),
            SimTx {
                tx: tx.clone(),
                height: None,
            },
        );
        ledger.mempool.push(tx.txid.clone());
        debug!("{}: accepted {:?} {}", self.ticker, tx.kind, tx.txid);
        Ok(tx.txid.clone())
    }

    fn reject(&self, reason: &str) -> SwapError {
        SwapError::Validation(format!("{} rejected transaction: {}", self.ticker, reason))
    }
}

fn tip_of(ledger: &Ledger) -> ChainTip {
    let mut hasher = Sha256::new();
    hasher.update(ledger.height.to_be_bytes());
    hasher.update(ledger.timestamp.to_be_bytes());
    ChainTip {
        height: ledger.height,
        timestamp: ledger.timestamp,
        hash: hex::encode(hasher.finalize()),
    }
}

fn signature(signer: &[u8], tx: &HtlcTx) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(signer);
    hasher.update(tx.sighash());
    hasher.finalize().to_vec()
}

fn txid_of(tx: &HtlcTx) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tx.sighash());
    hasher.update(&tx.signed);
    hex::encode(hasher.finalize())
}

/// Wallet of one party on a simulated chain
pub struct SimulatedWallet {
    chain: Arc<SimulatedChain>,
    pubkey: Vec<u8>,
    fail_broadcasts: AtomicBool,
}

impl SimulatedWallet {
    pub fn new(chain: Arc<SimulatedChain>, seed: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let pubkey = match chain.family() {
            CoinFamily::Utxo => {
                let mut key = vec![0x02 | (digest[0] & 1)];
                key.extend_from_slice(&digest);
                key
            }
            CoinFamily::Account => {
                let hash: [u8; 32] = Keccak256::digest(digest).into();
                hash[12..].to_vec()
            }
        };
        Self {
            chain,
            pubkey,
            fail_broadcasts: AtomicBool::new(false),
        }
    }

    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.chain
    }

    /// Make every broadcast fail with a transient error
    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoinAdapter for SimulatedWallet {
    fn ticker(&self) -> String {
        self.chain.ticker().to_string()
    }

    fn family(&self) -> CoinFamily {
        self.chain.family()
    }

    fn htlc_pubkey(&self) -> Vec<u8> {
        self.pubkey.clone()
    }

    async fn current_tip(&self) -> SwapResult<ChainTip> {
        Ok(self.chain.tip().await)
    }

    async fn tx_status(&self, txid: &str) -> SwapResult<TxStatus> {
        Ok(self.chain.tx_status(txid).await)
    }

    async fn sign(&self, mut tx: HtlcTx) -> SwapResult<HtlcTx> {
        tx.signer = self.pubkey.clone();
        tx.signed = signature(&self.pubkey, &tx);
        tx.txid = txid_of(&tx);
        Ok(tx)
    }

    async fn broadcast(&self, tx: &HtlcTx) -> SwapResult<String> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(SwapError::Broadcast {
                coin: self.ticker(),
                message: "node unreachable".to_string(),
            });
        }
        self.chain.submit(tx).await
    }

    async fn fetch_payment(&self, txid: &str) -> SwapResult<Option<OnChainPayment>> {
        Ok(self.chain.tx(txid).await.map(|tx| OnChainPayment {
            txid: tx.txid,
            script: tx.script,
            amount: tx.params.amount,
            sender: tx.signer,
        }))
    }

    async fn find_spend(&self, payment: &Payment) -> SwapResult<Option<SpendInfo>> {
        Ok(self.chain.find_spend(&payment.txid).await)
    }
}

/// Simulated chains of one process, shared by every wallet on them
#[derive(Default)]
pub struct SimulatedNetwork {
    chains: DashMap<String, Arc<SimulatedChain>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(&self, ticker: &str, config: &CoinConfig) -> Arc<SimulatedChain> {
        self.chains
            .entry(ticker.to_string())
            .or_insert_with(|| {
                Arc::new(SimulatedChain::new(
                    ticker,
                    config.family,
                    config.block_time_secs,
                ))
            })
            .clone()
    }

    /// Start one miner per chain at its configured block time
    pub fn spawn_miners(&self) -> Vec<JoinHandle<()>> {
        self.chains
            .iter()
            .map(|entry| {
                let chain = entry.value().clone();
                let interval = Duration::from_secs(chain.block_time.max(1));
                chain.spawn_miner(interval)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::{build_payment, build_refund, build_spend, HtlcParams, Secret, SecretHashAlgo};
    use crate::swap::PaymentRole;

    async fn setup() -> (Arc<SimulatedChain>, SimulatedWallet, SimulatedWallet, Payment, Secret) {
        let chain = Arc::new(SimulatedChain::with_genesis("BASE", CoinFamily::Utxo, 60, 10_000));
        let alice = SimulatedWallet::new(chain.clone(), "alice");
        let bob = SimulatedWallet::new(chain.clone(), "bob");
        let secret = Secret::from_bytes([3; 32]);
        let params = HtlcParams {
            coin: "BASE".into(),
            family: CoinFamily::Utxo,
            secret_hash: secret.hash(SecretHashAlgo::Sha256),
            secret_hash_algo: SecretHashAlgo::Sha256,
            recipient_pubkey: bob.htlc_pubkey(),
            refund_pubkey: alice.htlc_pubkey(),
            locktime: 10_600,
            amount: 1_000,
        };
        let tx = alice.sign(build_payment(params).unwrap()).await.unwrap();
        alice.broadcast(&tx).await.unwrap();
        let mut payment = Payment::new(PaymentRole::MakerPayment, tx, 1);
        payment.broadcast = true;
        (chain, alice, bob, payment, secret)
    }

    #[tokio::test]
    async fn test_payment_mined_and_rebroadcast_is_idempotent() {
        let (chain, alice, _bob, payment, _) = setup().await;
        assert_eq!(chain.tx_status(&payment.txid).await, TxStatus::Mempool);

        chain.mine(1).await;
        assert_eq!(
            chain.tx_status(&payment.txid).await,
            TxStatus::Included { height: 1 }
        );
        assert_eq!(alice.broadcast(&payment.tx).await.unwrap(), payment.txid);
    }

    #[tokio::test]
    async fn test_claim_reveals_secret_and_blocks_refund() {
        let (chain, alice, bob, payment, secret) = setup().await;
        chain.mine(1).await;

        let claim = build_spend(&payment, &secret, &bob).await.unwrap();
        bob.broadcast(&claim).await.unwrap();

        let spend = chain.find_spend(&payment.txid).await.unwrap();
        assert_eq!(spend.txid, claim.txid);
        assert_eq!(spend.kind, SpendKind::Claim { secret });

        chain.mine_until(10_600).await;
        let refund = build_refund(&payment, 10_600, &alice).await.unwrap();
        assert!(matches!(
            alice.broadcast(&refund).await,
            Err(SwapError::AlreadySpent { .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_enforces_refund_locktime() {
        let (chain, alice, _bob, payment, _) = setup().await;
        chain.mine(1).await;

        // Built with a forged clock, the chain still refuses it
        let early = build_refund(&payment, 10_600, &alice).await.unwrap();
        assert!(matches!(
            alice.broadcast(&early).await,
            Err(SwapError::LocktimeNotReached { .. })
        ));

        chain.mine_until(10_600).await;
        alice.broadcast(&early).await.unwrap();
        assert_eq!(
            chain.find_spend(&payment.txid).await.unwrap().kind,
            SpendKind::Refund
        );
    }

    #[tokio::test]
    async fn test_failing_wallet_and_reorg() {
        let (chain, alice, _bob, payment, _) = setup().await;
        alice.set_fail_broadcasts(true);
        let err = alice.broadcast(&payment.tx).await.unwrap_err();
        assert!(err.is_retryable());

        chain.mine(2).await;
        chain.drop_tx(&payment.txid).await;
        assert_eq!(chain.tx_status(&payment.txid).await, TxStatus::Unknown);
    }
}
