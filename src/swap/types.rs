//! Swap entity and its payments

use super::state::{FailedStep, SwapState};
use crate::error::{ErrorKind, SwapError};
use crate::htlc::{HtlcParams, HtlcTx, Secret, SecretHashAlgo};
use crate::negotiation::NegotiationRecord;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapRole {
    Maker,
    Taker,
}

impl SwapRole {
    pub fn counterparty(&self) -> SwapRole {
        match self {
            SwapRole::Maker => SwapRole::Taker,
            SwapRole::Taker => SwapRole::Maker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRole {
    TakerFee,
    MakerPayment,
    TakerPayment,
    /// Maker claiming the taker payment
    MakerSpend,
    /// Taker claiming the maker payment
    TakerSpend,
    /// Maker claiming the taker fee
    TakerFeeSpend,
    MakerRefund,
    TakerRefund,
    TakerFeeRefund,
}

impl PaymentRole {
    /// Party that broadcasts this transaction
    pub fn owner(&self) -> SwapRole {
        match self {
            PaymentRole::MakerPayment
            | PaymentRole::MakerSpend
            | PaymentRole::TakerFeeSpend
            | PaymentRole::MakerRefund => SwapRole::Maker,
            PaymentRole::TakerFee
            | PaymentRole::TakerPayment
            | PaymentRole::TakerSpend
            | PaymentRole::TakerRefund
            | PaymentRole::TakerFeeRefund => SwapRole::Taker,
        }
    }

    /// Whether this transaction locks funds in a hash-time-locked output
    pub fn is_htlc(&self) -> bool {
        matches!(
            self,
            PaymentRole::TakerFee | PaymentRole::MakerPayment | PaymentRole::TakerPayment
        )
    }

    /// Role of the refund reclaiming this payment
    pub fn refund_role(&self) -> Option<PaymentRole> {
        match self {
            PaymentRole::TakerFee => Some(PaymentRole::TakerFeeRefund),
            PaymentRole::MakerPayment => Some(PaymentRole::MakerRefund),
            PaymentRole::TakerPayment => Some(PaymentRole::TakerRefund),
            _ => None,
        }
    }
}

/// One on-chain transaction of a swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub role: PaymentRole,
    pub coin: String,
    pub txid: String,
    pub tx: HtlcTx,
    pub broadcast: bool,
    pub broadcast_height: Option<u64>,
    pub required_confirmations: u64,
    pub confirmations: u64,
    pub spent: bool,
    pub spent_by: Option<String>,
}

impl Payment {
    pub fn new(role: PaymentRole, tx: HtlcTx, required_confirmations: u64) -> Self {
        Self {
            role,
            coin: tx.params.coin.clone(),
            txid: tx.txid.clone(),
            tx,
            broadcast: false,
            broadcast_height: None,
            required_confirmations,
            confirmations: 0,
            spent: false,
            spent_by: None,
        }
    }

    /// A payment the counterparty already broadcast
    pub fn observed(role: PaymentRole, tx: HtlcTx, required_confirmations: u64) -> Self {
        Self {
            broadcast: true,
            ..Self::new(role, tx, required_confirmations)
        }
    }

    pub fn params(&self) -> &HtlcParams {
        &self.tx.params
    }

    pub fn is_confirmed(&self) -> bool {
        self.broadcast && self.confirmations >= self.required_confirmations
    }

    pub fn mark_spent(&mut self, by: &str) {
        self.spent = true;
        self.spent_by = Some(by.to_string());
    }
}

/// Confirmation requirement for one coin of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationSettings {
    pub confirmations: u64,
    /// Protected profile: wait for the larger count
    pub protected: bool,
    pub protected_confirmations: u64,
}

impl ConfirmationSettings {
    pub fn threshold(&self) -> u64 {
        if self.protected {
            self.confirmations.max(self.protected_confirmations)
        } else {
            self.confirmations
        }
    }
}

/// Structured cause of a failure, surfaced with every failed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub step: Option<FailedStep>,
    pub detail: String,
    pub coin: Option<String>,
    pub txid: Option<String>,
    pub height: Option<u64>,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(step: Option<FailedStep>, error: &SwapError) -> Self {
        let (coin, txid) = match error {
            SwapError::ConfirmationTimeout { coin, txid, .. }
            | SwapError::AlreadySpent { coin, txid, .. }
            | SwapError::TransactionNotFound { coin, txid }
            | SwapError::ReorgDetected { coin, txid, .. } => {
                (Some(coin.clone()), Some(txid.clone()))
            }
            SwapError::Broadcast { coin, .. }
            | SwapError::ChainConnection { coin, .. }
            | SwapError::DeadlinePassed { coin, .. } => (Some(coin.clone()), None),
            _ => (None, None),
        };
        Self {
            kind: error.kind(),
            step,
            detail: error.to_string(),
            coin,
            txid,
            height: None,
            at: Utc::now(),
        }
    }

    pub fn with_height(mut self, height: Option<u64>) -> Self {
        self.height = height;
        self
    }
}

/// The central swap entity, mutated only by its orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swap {
    pub uuid: Uuid,
    pub order_id: Uuid,
    pub role: SwapRole,
    /// Coin the maker pays
    pub base_coin: String,
    /// Coin the taker pays
    pub rel_coin: String,
    pub amount_sent: u64,
    pub amount_received: u64,
    /// Known to the maker from the start and to the taker after the reveal
    pub secret: Option<Secret>,
    #[serde(with = "hex")]
    pub secret_hash: [u8; 32],
    pub secret_hash_algo: SecretHashAlgo,
    pub started_at: u64,
    pub lock_duration: u64,
    pub maker_locktime: u64,
    pub taker_locktime: u64,
    /// Our HTLC keys on the base and rel coins
    #[serde(with = "hex")]
    pub my_base_pubkey: Vec<u8>,
    #[serde(with = "hex")]
    pub my_rel_pubkey: Vec<u8>,
    #[serde(with = "hex")]
    pub counterparty_base_pubkey: Vec<u8>,
    #[serde(with = "hex")]
    pub counterparty_rel_pubkey: Vec<u8>,
    pub base_confirmations: ConfirmationSettings,
    pub rel_confirmations: ConfirmationSettings,
    pub dex_fee: u64,
    pub state: SwapState,
    pub payments: Vec<Payment>,
    pub error: Option<ErrorRecord>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a freshly matched swap
#[derive(Debug, Clone)]
pub struct NewSwap {
    pub uuid: Uuid,
    pub order_id: Uuid,
    pub role: SwapRole,
    pub base_coin: String,
    pub rel_coin: String,
    pub base_amount: u64,
    pub rel_amount: u64,
    pub my_base_pubkey: Vec<u8>,
    pub my_rel_pubkey: Vec<u8>,
    pub base_confirmations: ConfirmationSettings,
    pub rel_confirmations: ConfirmationSettings,
    pub secret_hash_algo: SecretHashAlgo,
    pub lock_duration: u64,
    pub dex_fee_divisor: u64,
}

impl Swap {
    pub fn new(new: NewSwap) -> Self {
        let now = Utc::now();
        let (amount_sent, amount_received) = match new.role {
            SwapRole::Maker => (new.base_amount, new.rel_amount),
            SwapRole::Taker => (new.rel_amount, new.base_amount),
        };
        let (secret, secret_hash) = match new.role {
            SwapRole::Maker => {
                let secret = Secret::generate();
                let hash = secret.hash(new.secret_hash_algo);
                (Some(secret), hash)
            }
            SwapRole::Taker => (None, [0u8; 32]),
        };

        Self {
            uuid: new.uuid,
            order_id: new.order_id,
            role: new.role,
            base_coin: new.base_coin,
            rel_coin: new.rel_coin,
            amount_sent,
            amount_received,
            secret,
            secret_hash,
            secret_hash_algo: new.secret_hash_algo,
            started_at: now.timestamp().max(0) as u64,
            lock_duration: new.lock_duration,
            maker_locktime: 0,
            taker_locktime: 0,
            my_base_pubkey: new.my_base_pubkey,
            my_rel_pubkey: new.my_rel_pubkey,
            counterparty_base_pubkey: Vec::new(),
            counterparty_rel_pubkey: Vec::new(),
            base_confirmations: new.base_confirmations,
            rel_confirmations: new.rel_confirmations,
            dex_fee: dex_fee(new.rel_amount, new.dex_fee_divisor),
            state: SwapState::Started,
            payments: Vec::new(),
            error: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy the agreed terms into the swap
    pub fn apply_negotiation(&mut self, record: NegotiationRecord) {
        self.secret_hash = record.secret_hash;
        self.secret_hash_algo = record.secret_hash_algo;
        self.started_at = record.started_at;
        self.lock_duration = record.lock_duration;
        self.maker_locktime = record.maker_locktime;
        self.taker_locktime = record.taker_locktime;
        self.counterparty_base_pubkey = record.counterparty_base_pubkey;
        self.counterparty_rel_pubkey = record.counterparty_rel_pubkey;
    }

    pub fn maker_amount(&self) -> u64 {
        match self.role {
            SwapRole::Maker => self.amount_sent,
            SwapRole::Taker => self.amount_received,
        }
    }

    pub fn taker_amount(&self) -> u64 {
        match self.role {
            SwapRole::Maker => self.amount_received,
            SwapRole::Taker => self.amount_sent,
        }
    }

    /// Chain time at which a stalled swap must enter the refund path
    pub fn stall_deadline(&self) -> u64 {
        self.taker_locktime
    }

    /// Latest chain time at which a new payment may be broadcast
    pub fn funding_deadline(&self) -> u64 {
        self.taker_locktime.saturating_sub(self.lock_duration / 2)
    }

    pub fn payment(&self, role: PaymentRole) -> Option<&Payment> {
        self.payments.iter().find(|p| p.role == role)
    }

    pub fn payment_mut(&mut self, role: PaymentRole) -> Option<&mut Payment> {
        self.payments.iter_mut().find(|p| p.role == role)
    }

    /// Insert or replace the payment with the same role
    pub fn upsert_payment(&mut self, payment: Payment) {
        match self.payment_mut(payment.role) {
            Some(existing) => *existing = payment,
            None => self.payments.push(payment),
        }
    }

    /// Our own HTLC payments that are on chain and not yet spent
    pub fn own_locked_payments(&self) -> Vec<&Payment> {
        self.payments
            .iter()
            .filter(|p| p.role.is_htlc() && p.role.owner() == self.role && p.broadcast && !p.spent)
            .collect()
    }

    /// HTLC parameters for a payment of this swap
    pub fn htlc_params(&self, role: PaymentRole, family: crate::config::CoinFamily) -> HtlcParams {
        let (coin, sender, recipient, locktime, amount) = match role {
            PaymentRole::MakerPayment => (
                &self.base_coin,
                self.key_of(SwapRole::Maker, true),
                self.key_of(SwapRole::Taker, true),
                self.maker_locktime,
                self.maker_amount(),
            ),
            PaymentRole::TakerFee => (
                &self.rel_coin,
                self.key_of(SwapRole::Taker, false),
                self.key_of(SwapRole::Maker, false),
                self.taker_locktime,
                self.dex_fee,
            ),
            _ => (
                &self.rel_coin,
                self.key_of(SwapRole::Taker, false),
                self.key_of(SwapRole::Maker, false),
                self.taker_locktime,
                self.taker_amount(),
            ),
        };
        HtlcParams {
            coin: coin.clone(),
            family,
            secret_hash: self.secret_hash,
            secret_hash_algo: self.secret_hash_algo,
            recipient_pubkey: recipient,
            refund_pubkey: sender,
            locktime,
            amount,
        }
    }

    fn key_of(&self, party: SwapRole, base: bool) -> Vec<u8> {
        match (party == self.role, base) {
            (true, true) => self.my_base_pubkey.clone(),
            (true, false) => self.my_rel_pubkey.clone(),
            (false, true) => self.counterparty_base_pubkey.clone(),
            (false, false) => self.counterparty_rel_pubkey.clone(),
        }
    }

    pub fn snapshot(&self) -> SwapSnapshot {
        SwapSnapshot {
            uuid: self.uuid,
            order_id: self.order_id,
            role: self.role,
            base_coin: self.base_coin.clone(),
            rel_coin: self.rel_coin.clone(),
            amount_sent: self.amount_sent,
            amount_received: self.amount_received,
            secret_hash: hex::encode(self.secret_hash),
            maker_locktime: self.maker_locktime,
            taker_locktime: self.taker_locktime,
            state: self.state,
            state_name: self.state.name(),
            is_terminal: self.state.is_terminal(),
            payments: self
                .payments
                .iter()
                .map(|p| PaymentSummary {
                    role: p.role,
                    coin: p.coin.clone(),
                    txid: p.txid.clone(),
                    confirmations: p.confirmations,
                    required_confirmations: p.required_confirmations,
                    spent: p.spent,
                })
                .collect(),
            error: self.error.clone(),
            sequence: self.sequence,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Dex fee charged to the taker, never zero
pub fn dex_fee(taker_amount: u64, divisor: u64) -> u64 {
    (taker_amount / divisor.max(1)).max(1)
}

/// Read-only view of a swap, without the secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapSnapshot {
    pub uuid: Uuid,
    pub order_id: Uuid,
    pub role: SwapRole,
    pub base_coin: String,
    pub rel_coin: String,
    pub amount_sent: u64,
    pub amount_received: u64,
    pub secret_hash: String,
    pub maker_locktime: u64,
    pub taker_locktime: u64,
    pub state: SwapState,
    pub state_name: String,
    pub is_terminal: bool,
    pub payments: Vec<PaymentSummary>,
    pub error: Option<ErrorRecord>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub role: PaymentRole,
    pub coin: String,
    pub txid: String,
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub spent: bool,
}
