//! Payment script builder
//!
//! Builds the three transactions of a hash-time-locked payment:
//! - the payment locking funds under a secret hash and a locktime
//! - the spend releasing them to the recipient with the secret
//! - the refund returning them to the sender once the locktime has passed
//!
//! Both coin families share the same parameters; only the byte encoding in
//! [`script`] differs.

pub mod script;
pub mod secret;

pub use secret::{Secret, SecretHashAlgo};

use crate::chain::{CoinAdapter, OnChainPayment};
use crate::config::CoinFamily;
use crate::error::{SwapError, SwapResult};
use crate::swap::Payment;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;

/// Semantic parameters of one hash-time-locked payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcParams {
    pub coin: String,
    pub family: CoinFamily,
    #[serde(with = "hex")]
    pub secret_hash: [u8; 32],
    pub secret_hash_algo: SecretHashAlgo,
    /// Key that may claim with the secret
    #[serde(with = "hex")]
    pub recipient_pubkey: Vec<u8>,
    /// Key that may refund after the locktime
    #[serde(with = "hex")]
    pub refund_pubkey: Vec<u8>,
    /// Unix time after which the refund branch opens
    pub locktime: u64,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcTxKind {
    Payment,
    Spend,
    Refund,
}

/// A payment, spend or refund transaction, unsigned until `signed` is filled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcTx {
    pub kind: HtlcTxKind,
    pub params: HtlcParams,
    /// Redeem script or contract calldata
    #[serde(with = "hex")]
    pub script: Vec<u8>,
    /// Funding transaction consumed by a spend or refund
    pub spends: Option<String>,
    pub secret: Option<Secret>,
    /// Earliest chain time at which the transaction is final
    pub lock_time: u64,
    #[serde(with = "hex")]
    pub signer: Vec<u8>,
    #[serde(with = "hex")]
    pub signed: Vec<u8>,
    pub txid: String,
}

impl HtlcTx {
    fn unsigned(kind: HtlcTxKind, params: HtlcParams, script: Vec<u8>) -> Self {
        Self {
            kind,
            params,
            script,
            spends: None,
            secret: None,
            lock_time: 0,
            signer: Vec::new(),
            signed: Vec::new(),
            txid: String::new(),
        }
    }

    pub fn coin(&self) -> &str {
        &self.params.coin
    }

    pub fn is_signed(&self) -> bool {
        !self.signed.is_empty() && !self.txid.is_empty()
    }

    /// Digest committed to by the signature
    pub fn sighash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update([self.kind as u8]);
        hasher.update(self.params.coin.as_bytes());
        hasher.update(&self.script);
        hasher.update(self.spends.as_deref().unwrap_or_default().as_bytes());
        if let Some(secret) = &self.secret {
            hasher.update(secret.as_bytes());
        }
        hasher.update(self.lock_time.to_be_bytes());
        hasher.update(self.params.amount.to_be_bytes());
        hasher.finalize().into()
    }
}

/// Check that a pubkey has the shape its coin family expects
pub fn check_pubkey(family: CoinFamily, pubkey: &[u8]) -> SwapResult<()> {
    let well_formed = match family {
        CoinFamily::Utxo => pubkey.len() == 33 && matches!(pubkey[0], 0x02 | 0x03),
        CoinFamily::Account => pubkey.len() == 20 && pubkey.iter().any(|b| *b != 0),
    };
    if well_formed {
        Ok(())
    } else {
        Err(SwapError::Validation(format!(
            "malformed {:?} pubkey {}",
            family,
            hex::encode(pubkey)
        )))
    }
}

fn check_params(params: &HtlcParams) -> SwapResult<()> {
    check_pubkey(params.family, &params.recipient_pubkey)?;
    check_pubkey(params.family, &params.refund_pubkey)?;
    if params.amount == 0 {
        return Err(SwapError::Validation("payment amount is zero".to_string()));
    }
    if params.family == CoinFamily::Utxo && params.secret_hash_algo != SecretHashAlgo::Sha256 {
        return Err(SwapError::Validation(
            "utxo scripts only support sha256 secret hashes".to_string(),
        ));
    }
    if params.family == CoinFamily::Utxo && params.locktime > u32::MAX as u64 {
        return Err(SwapError::Validation(format!(
            "locktime {} does not fit a utxo script",
            params.locktime
        )));
    }
    Ok(())
}

/// Build the unsigned payment locking `params.amount`
pub fn build_payment(params: HtlcParams) -> SwapResult<HtlcTx> {
    check_params(&params)?;
    let script = script::payment_script(&params)?;
    Ok(HtlcTx::unsigned(HtlcTxKind::Payment, params, script))
}

/// Build and sign the spend of `payment` revealing `secret`
pub async fn build_spend(
    payment: &Payment,
    secret: &Secret,
    signer: &dyn CoinAdapter,
) -> SwapResult<HtlcTx> {
    let params = payment.params().clone();
    if !secret.matches(params.secret_hash_algo, &params.secret_hash) {
        return Err(SwapError::SecretHashMismatch);
    }
    if signer.htlc_pubkey() != params.recipient_pubkey {
        return Err(SwapError::Validation(format!(
            "wallet is not the recipient of payment {}",
            payment.txid
        )));
    }

    let script = match params.family {
        CoinFamily::Utxo => script::utxo_claim_script(secret),
        CoinFamily::Account => script::account_spend_calldata(&params, secret)?,
    };
    let mut tx = HtlcTx::unsigned(HtlcTxKind::Spend, params, script);
    tx.spends = Some(payment.txid.clone());
    tx.secret = Some(secret.clone());

    signer.sign(tx).await
}

/// Build and sign the refund of `payment`; rejected before its locktime
pub async fn build_refund(
    payment: &Payment,
    chain_time: u64,
    signer: &dyn CoinAdapter,
) -> SwapResult<HtlcTx> {
    let params = payment.params().clone();
    if chain_time < params.locktime {
        return Err(SwapError::LocktimeNotReached {
            locktime: params.locktime,
            chain_time,
        });
    }
    if signer.htlc_pubkey() != params.refund_pubkey {
        return Err(SwapError::Validation(format!(
            "wallet is not the sender of payment {}",
            payment.txid
        )));
    }

    let script = match params.family {
        CoinFamily::Utxo => script::utxo_refund_script(),
        CoinFamily::Account => script::account_refund_calldata(&params)?,
    };
    let lock_time = params.locktime;
    let mut tx = HtlcTx::unsigned(HtlcTxKind::Refund, params, script);
    tx.spends = Some(payment.txid.clone());
    tx.lock_time = lock_time;

    signer.sign(tx).await
}

/// Validate a counterparty payment against the negotiated parameters
pub fn validate_payment(tx: &HtlcTx, expected: &HtlcParams) -> SwapResult<()> {
    let mismatch = |what: &str| {
        error!(
            "Counterparty payment {} on {} failed validation: {} mismatch",
            tx.txid, expected.coin, what
        );
        Err(SwapError::Validation(format!("{} mismatch", what)))
    };

    if tx.kind != HtlcTxKind::Payment {
        return mismatch("transaction kind");
    }
    if tx.params.coin != expected.coin || tx.params.family != expected.family {
        return mismatch("coin");
    }
    if tx.params.amount != expected.amount {
        return mismatch("amount");
    }
    if tx.params.secret_hash != expected.secret_hash
        || tx.params.secret_hash_algo != expected.secret_hash_algo
    {
        return Err(SwapError::SecretHashMismatch);
    }
    if tx.params.locktime != expected.locktime {
        return mismatch("locktime");
    }
    if tx.params.recipient_pubkey != expected.recipient_pubkey {
        return mismatch("recipient pubkey");
    }
    if tx.params.refund_pubkey != expected.refund_pubkey || tx.signer != expected.refund_pubkey {
        return mismatch("sender pubkey");
    }
    if tx.script != script::payment_script(expected)? {
        return mismatch("script");
    }
    if !tx.is_signed() {
        return mismatch("signature");
    }
    Ok(())
}

/// Validate the payment the chain carries under the announced txid.
///
/// The message copy of a payment is only a pointer; this is the check
/// that decides whether the funds are really locked as negotiated.
pub fn validate_on_chain(found: &OnChainPayment, expected: &HtlcParams) -> SwapResult<()> {
    let mismatch = |what: &str| {
        error!(
            "On-chain payment {} on {} failed validation: {} mismatch",
            found.txid, expected.coin, what
        );
        Err(SwapError::Validation(format!("on-chain {} mismatch", what)))
    };

    if found.amount != expected.amount {
        return mismatch("amount");
    }
    if found.sender != expected.refund_pubkey {
        return mismatch("sender");
    }
    if found.script != script::payment_script(expected)? {
        return mismatch("script");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::{SimulatedChain, SimulatedWallet};
    use crate::swap::{Payment, PaymentRole};
    use std::sync::Arc;

    fn params(chain: &SimulatedChain, from: &SimulatedWallet, to: &SimulatedWallet) -> HtlcParams {
        let secret = Secret::from_bytes([9; 32]);
        HtlcParams {
            coin: chain.ticker().to_string(),
            family: CoinFamily::Utxo,
            secret_hash: secret.hash(SecretHashAlgo::Sha256),
            secret_hash_algo: SecretHashAlgo::Sha256,
            recipient_pubkey: to.htlc_pubkey(),
            refund_pubkey: from.htlc_pubkey(),
            locktime: 1_000,
            amount: 50_000,
        }
    }

    async fn funded_payment(
        from: &SimulatedWallet,
        params: HtlcParams,
    ) -> Payment {
        let tx = from.sign(build_payment(params).unwrap()).await.unwrap();
        Payment::new(PaymentRole::MakerPayment, tx, 1)
    }

    #[tokio::test]
    async fn test_spend_requires_matching_secret_and_recipient() {
        let chain = Arc::new(SimulatedChain::new("BTC", CoinFamily::Utxo, 600));
        let alice = SimulatedWallet::new(chain.clone(), "alice");
        let bob = SimulatedWallet::new(chain.clone(), "bob");
        let payment = funded_payment(&alice, params(&chain, &alice, &bob)).await;

        let wrong = Secret::from_bytes([1; 32]);
        assert!(matches!(
            build_spend(&payment, &wrong, &bob).await,
            Err(SwapError::SecretHashMismatch)
        ));

        let secret = Secret::from_bytes([9; 32]);
        assert!(matches!(
            build_spend(&payment, &secret, &alice).await,
            Err(SwapError::Validation(_))
        ));

        let spend = build_spend(&payment, &secret, &bob).await.unwrap();
        assert_eq!(spend.kind, HtlcTxKind::Spend);
        assert_eq!(spend.spends.as_deref(), Some(payment.txid.as_str()));
        assert!(spend.is_signed());
    }

    #[tokio::test]
    async fn test_refund_only_after_locktime() {
        let chain = Arc::new(SimulatedChain::new("BTC", CoinFamily::Utxo, 600));
        let alice = SimulatedWallet::new(chain.clone(), "alice");
        let bob = SimulatedWallet::new(chain.clone(), "bob");
        let payment = funded_payment(&alice, params(&chain, &alice, &bob)).await;

        assert!(matches!(
            build_refund(&payment, 999, &alice).await,
            Err(SwapError::LocktimeNotReached { locktime: 1_000, .. })
        ));

        let refund = build_refund(&payment, 1_000, &alice).await.unwrap();
        assert_eq!(refund.kind, HtlcTxKind::Refund);
        assert_eq!(refund.lock_time, 1_000);
    }

    #[tokio::test]
    async fn test_validate_payment_detects_tampering() {
        let chain = Arc::new(SimulatedChain::new("BTC", CoinFamily::Utxo, 600));
        let alice = SimulatedWallet::new(chain.clone(), "alice");
        let bob = SimulatedWallet::new(chain.clone(), "bob");
        let expected = params(&chain, &alice, &bob);
        let tx = alice.sign(build_payment(expected.clone()).unwrap()).await.unwrap();

        assert!(validate_payment(&tx, &expected).is_ok());

        let mut short = expected.clone();
        short.amount += 1;
        assert!(matches!(
            validate_payment(&tx, &short),
            Err(SwapError::Validation(_))
        ));

        let mut other_hash = expected.clone();
        other_hash.secret_hash = [0; 32];
        assert!(matches!(
            validate_payment(&tx, &other_hash),
            Err(SwapError::SecretHashMismatch)
        ));

        let mut forged = tx.clone();
        forged.script[1] ^= 0xff;
        assert!(validate_payment(&forged, &expected).is_err());
    }

    #[tokio::test]
    async fn test_forged_message_copy_fails_against_chain() {
        let chain = Arc::new(SimulatedChain::new("BTC", CoinFamily::Utxo, 600));
        let alice = SimulatedWallet::new(chain.clone(), "alice");
        let bob = SimulatedWallet::new(chain.clone(), "bob");
        let mut cheap = params(&chain, &alice, &bob);
        cheap.amount = 10;
        let real = alice.sign(build_payment(cheap).unwrap()).await.unwrap();
        alice.broadcast(&real).await.unwrap();

        // Same txid, the amount and script the taker expects
        let expected = params(&chain, &alice, &bob);
        let mut forged = alice.sign(build_payment(expected.clone()).unwrap()).await.unwrap();
        forged.txid = real.txid.clone();
        assert!(validate_payment(&forged, &expected).is_ok());

        let found = alice.fetch_payment(&forged.txid).await.unwrap().unwrap();
        assert!(matches!(
            validate_on_chain(&found, &expected),
            Err(SwapError::Validation(_))
        ));

        let honest = alice.sign(build_payment(expected.clone()).unwrap()).await.unwrap();
        alice.broadcast(&honest).await.unwrap();
        let found = bob.fetch_payment(&honest.txid).await.unwrap().unwrap();
        assert!(validate_on_chain(&found, &expected).is_ok());
        assert!(bob.fetch_payment("00").await.unwrap().is_none());
    }

    #[test]
    fn test_check_pubkey_shapes() {
        let compressed = [vec![0x02], vec![7; 32]].concat();
        assert!(check_pubkey(CoinFamily::Utxo, &compressed).is_ok());
        assert!(check_pubkey(CoinFamily::Utxo, &[0x04; 33]).is_err());
        assert!(check_pubkey(CoinFamily::Account, &[0x11; 20]).is_ok());
        assert!(check_pubkey(CoinFamily::Account, &[0; 20]).is_err());
        assert!(check_pubkey(CoinFamily::Account, &compressed).is_err());
    }
}
