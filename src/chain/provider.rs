//! EVM coin backend with multi-RPC support and automatic failover
//!
//! HTLC payments live in a swap contract; the script bytes built by the
//! payment script builder are the contract calldata, and spends are found
//! through the contract's `ReceiverSpent` / `SenderRefunded` logs.

use super::{ChainTip, CoinAdapter, OnChainPayment, SpendInfo, SpendKind, TxStatus};
use crate::config::{CoinConfig, CoinFamily};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{script, HtlcTx, HtlcTxKind, Secret};
use crate::swap::Payment;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const RECEIVER_SPENT_EVENT: &str = "ReceiverSpent(bytes32,bytes32)";
const SENDER_REFUNDED_EVENT: &str = "SenderRefunded(bytes32)";

/// Account-style coin backed by JSON-RPC endpoints
pub struct EvmCoin {
    ticker: String,
    /// Coin configuration
    config: CoinConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Swap contract address
    contract: Address,
    /// Wallet for signing
    wallet: LocalWallet,
}

impl EvmCoin {
    /// Create a new EVM backend
    pub async fn new(ticker: String, config: CoinConfig, private_key: &str) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", ticker, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::ChainConnection {
                coin: ticker,
                message: "No valid RPC providers".to_string(),
            });
        }

        let contract: Address = config
            .swap_contract_address
            .parse()
            .map_err(|e| SwapError::Config(format!("Invalid swap contract address: {}", e)))?;

        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| SwapError::Config(format!("Invalid private key: {}", e)))?
            .with_chain_id(config.chain_id);

        info!(
            "EVM backend for {} (chain {}) using wallet {:?}",
            ticker,
            config.chain_id,
            wallet.address()
        );

        Ok(Self {
            ticker,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            contract,
            wallet,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("{} failover to provider {}", self.ticker, next);
    }

    fn connection_error(&self, message: impl ToString) -> SwapError {
        SwapError::ChainConnection {
            coin: self.ticker.clone(),
            message: message.to_string(),
        }
    }

    /// Get logs for a filter with failover
    async fn get_logs(&self, filter: &Filter) -> SwapResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from {}: {}", self.ticker, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }
}

fn parse_txid(txid: &str) -> SwapResult<H256> {
    let bytes = hex::decode(txid.trim_start_matches("0x"))
        .map_err(|e| SwapError::Validation(format!("Invalid txid {}: {}", txid, e)))?;
    if bytes.len() != 32 {
        return Err(SwapError::Validation(format!("Invalid txid length: {}", txid)));
    }
    Ok(H256::from_slice(&bytes))
}

fn format_txid(hash: H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

#[async_trait]
impl CoinAdapter for EvmCoin {
    fn ticker(&self) -> String {
        self.ticker.clone()
    }

    fn family(&self) -> CoinFamily {
        CoinFamily::Account
    }

    fn htlc_pubkey(&self) -> Vec<u8> {
        self.wallet.address().as_bytes().to_vec()
    }

    async fn current_tip(&self) -> SwapResult<ChainTip> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => {
                    return Ok(ChainTip {
                        height: block.number.map(|n| n.as_u64()).unwrap_or_default(),
                        timestamp: block.timestamp.as_u64(),
                        hash: block.hash.map(format_txid).unwrap_or_default(),
                    });
                }
                Ok(None) => warn!("{}: provider returned no latest block", self.ticker),
                Err(e) => {
                    warn!("Failed to get latest block from {}: {}", self.ticker, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    async fn tx_status(&self, txid: &str) -> SwapResult<TxStatus> {
        let hash = parse_txid(txid)?;

        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        if let Some(receipt) = receipt {
            if receipt.status != Some(1u64.into()) {
                warn!("{}: transaction {} reverted", self.ticker, txid);
                return Ok(TxStatus::Unknown);
            }
            if let Some(block) = receipt.block_number {
                return Ok(TxStatus::Included {
                    height: block.as_u64(),
                });
            }
        }

        let pending = self
            .http()
            .get_transaction(hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        Ok(if pending.is_some() {
            TxStatus::Mempool
        } else {
            TxStatus::Unknown
        })
    }

    async fn sign(&self, mut tx: HtlcTx) -> SwapResult<HtlcTx> {
        let value = match tx.kind {
            HtlcTxKind::Payment => U256::from(tx.params.amount),
            HtlcTxKind::Spend | HtlcTxKind::Refund => U256::zero(),
        };

        let nonce = self
            .http()
            .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.connection_error(e))?;
        let gas_price = self
            .http()
            .get_gas_price()
            .await
            .map_err(|e| self.connection_error(e))?;

        let request = TransactionRequest::new()
            .to(self.contract)
            .data(tx.script.clone())
            .value(value)
            .nonce(nonce)
            .gas(self.config.gas_limit)
            .gas_price(gas_price)
            .chain_id(self.config.chain_id);
        let typed: TypedTransaction = request.into();

        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| SwapError::Internal(format!("Failed to sign transaction: {}", e)))?;
        let raw = typed.rlp_signed(&signature);

        tx.signer = self.htlc_pubkey();
        tx.txid = format!("0x{}", hex::encode(keccak256(&raw)));
        tx.signed = raw.to_vec();
        Ok(tx)
    }

    async fn broadcast(&self, tx: &HtlcTx) -> SwapResult<String> {
        let send_timeout = Duration::from_secs(30);
        let result = timeout(
            send_timeout,
            self.http()
                .send_raw_transaction(Bytes::from(tx.signed.clone())),
        )
        .await;

        match result {
            Ok(Ok(pending)) => {
                let hash = format_txid(pending.tx_hash());
                info!("{}: transaction sent {}", self.ticker, hash);
                Ok(hash)
            }
            Ok(Err(e)) => {
                let error_msg = e.to_string();

                if error_msg.contains("already known") || error_msg.contains("known transaction") {
                    debug!("{}: {} already in mempool", self.ticker, tx.txid);
                    return Ok(tx.txid.clone());
                }
                if error_msg.contains("nonce too low")
                    && self.tx_status(&tx.txid).await? != TxStatus::Unknown
                {
                    // Our own earlier broadcast of the same transaction was mined
                    return Ok(tx.txid.clone());
                }

                self.failover();
                Err(SwapError::Broadcast {
                    coin: self.ticker.clone(),
                    message: error_msg,
                })
            }
            Err(_) => Err(SwapError::Timeout {
                operation: format!("{} send transaction", self.ticker),
            }),
        }
    }

    async fn fetch_payment(&self, txid: &str) -> SwapResult<Option<OnChainPayment>> {
        let hash = parse_txid(txid)?;
        let Some(tx) = self
            .http()
            .get_transaction(hash)
            .await
            .map_err(|e| self.connection_error(e))?
        else {
            return Ok(None);
        };

        if tx.to != Some(self.contract) {
            return Err(SwapError::Validation(format!(
                "{} does not call the swap contract",
                txid
            )));
        }
        if tx.value > U256::from(u64::MAX) {
            return Err(SwapError::Validation(format!("{} value overflows", txid)));
        }

        Ok(Some(OnChainPayment {
            txid: format_txid(tx.hash),
            script: tx.input.to_vec(),
            amount: tx.value.as_u64(),
            sender: tx.from.as_bytes().to_vec(),
        }))
    }

    async fn find_spend(&self, payment: &Payment) -> SwapResult<Option<SpendInfo>> {
        let id = script::payment_id(payment.params());
        let from_block = payment.broadcast_height.unwrap_or_default();

        for (event, is_claim) in [(RECEIVER_SPENT_EVENT, true), (SENDER_REFUNDED_EVENT, false)] {
            let filter = Filter::new()
                .address(self.contract)
                .event(event)
                .from_block(from_block);

            for log in self.get_logs(&filter).await? {
                if log.data.len() < 32 || log.data[..32] != id[..] {
                    continue;
                }

                let kind = if is_claim {
                    let secret = log
                        .data
                        .get(32..64)
                        .and_then(Secret::from_slice)
                        .ok_or_else(|| {
                            SwapError::Validation("ReceiverSpent log without secret".to_string())
                        })?;
                    SpendKind::Claim { secret }
                } else {
                    SpendKind::Refund
                };

                return Ok(Some(SpendInfo {
                    txid: log.transaction_hash.map(format_txid).unwrap_or_default(),
                    kind,
                    height: log.block_number.map(|n| n.as_u64()),
                }));
            }
        }

        Ok(None)
    }
}
