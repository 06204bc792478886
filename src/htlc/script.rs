//! Coin-family specific encodings of the hash-time-locked payment
//!
//! UTXO coins lock funds in a P2SH-style redeem script:
//!
//! ```text
//! OP_IF
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <refund pubkey> OP_CHECKSIG
//! OP_ELSE
//!     OP_SIZE 32 OP_EQUALVERIFY OP_SHA256 <secret hash> OP_EQUALVERIFY
//!     <recipient pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Account-style coins call a swap contract; the script bytes are the ABI
//! encoded calldata of `ethPayment`, `receiverSpend` and `senderRefund`.

use super::HtlcParams;
use crate::config::CoinFamily;
use crate::error::{SwapError, SwapResult};
use crate::htlc::Secret;

use ethers::abi::{self, Token};
use ethers::types::{Address, U256};
use ethers::utils::keccak256;

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_IF: u8 = 0x63;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_DROP: u8 = 0x75;
const OP_SIZE: u8 = 0x82;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_SHA256: u8 = 0xa8;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

pub const ETH_PAYMENT_SIG: &str = "ethPayment(bytes32,address,bytes32,uint64)";
pub const RECEIVER_SPEND_SIG: &str = "receiverSpend(bytes32,uint256,bytes32,address)";
pub const SENDER_REFUND_SIG: &str = "senderRefund(bytes32,uint256,bytes32,address)";

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    // Direct pushes only; every element here is at most 33 bytes.
    script.push(data.len() as u8);
    script.extend_from_slice(data);
}

/// Redeem script locking a UTXO payment
pub fn utxo_redeem_script(params: &HtlcParams) -> Vec<u8> {
    let mut script = Vec::with_capacity(120);
    script.push(OP_IF);
    push_data(&mut script, &(params.locktime as u32).to_le_bytes());
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    push_data(&mut script, &params.refund_pubkey);
    script.push(OP_CHECKSIG);
    script.push(OP_ELSE);
    script.push(OP_SIZE);
    push_data(&mut script, &[32]);
    script.push(OP_EQUALVERIFY);
    script.push(OP_SHA256);
    push_data(&mut script, &params.secret_hash);
    script.push(OP_EQUALVERIFY);
    push_data(&mut script, &params.recipient_pubkey);
    script.push(OP_CHECKSIG);
    script.push(OP_ENDIF);
    script
}

/// Unlocking script selecting the claim branch; the signature is added by the wallet
pub fn utxo_claim_script(secret: &Secret) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    push_data(&mut script, secret.as_bytes());
    script.push(OP_0);
    script
}

/// Unlocking script selecting the timeout branch
pub fn utxo_refund_script() -> Vec<u8> {
    vec![OP_1]
}

/// Identifier under which the swap contract stores a payment
pub fn payment_id(params: &HtlcParams) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(80);
    preimage.extend_from_slice(&params.recipient_pubkey);
    preimage.extend_from_slice(&params.refund_pubkey);
    preimage.extend_from_slice(&params.secret_hash);
    preimage.extend_from_slice(&params.locktime.to_be_bytes());
    keccak256(preimage)
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn address(bytes: &[u8]) -> SwapResult<Address> {
    if bytes.len() != 20 {
        return Err(SwapError::Validation(format!(
            "expected 20-byte address, got {} bytes",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

fn calldata(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(tokens));
    data
}

/// `ethPayment` calldata; the amount travels as the transaction value
pub fn account_payment_calldata(params: &HtlcParams) -> SwapResult<Vec<u8>> {
    Ok(calldata(
        ETH_PAYMENT_SIG,
        &[
            Token::FixedBytes(payment_id(params).to_vec()),
            Token::Address(address(&params.recipient_pubkey)?),
            Token::FixedBytes(params.secret_hash.to_vec()),
            Token::Uint(U256::from(params.locktime)),
        ],
    ))
}

/// `receiverSpend` calldata revealing the secret
pub fn account_spend_calldata(params: &HtlcParams, secret: &Secret) -> SwapResult<Vec<u8>> {
    Ok(calldata(
        RECEIVER_SPEND_SIG,
        &[
            Token::FixedBytes(payment_id(params).to_vec()),
            Token::Uint(U256::from(params.amount)),
            Token::FixedBytes(secret.as_bytes().to_vec()),
            Token::Address(address(&params.refund_pubkey)?),
        ],
    ))
}

/// `senderRefund` calldata
pub fn account_refund_calldata(params: &HtlcParams) -> SwapResult<Vec<u8>> {
    Ok(calldata(
        SENDER_REFUND_SIG,
        &[
            Token::FixedBytes(payment_id(params).to_vec()),
            Token::Uint(U256::from(params.amount)),
            Token::FixedBytes(params.secret_hash.to_vec()),
            Token::Address(address(&params.recipient_pubkey)?),
        ],
    ))
}

/// Locking bytes for a payment in the coin family's encoding
pub fn payment_script(params: &HtlcParams) -> SwapResult<Vec<u8>> {
    match params.family {
        CoinFamily::Utxo => Ok(utxo_redeem_script(params)),
        CoinFamily::Account => account_payment_calldata(params),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::SecretHashAlgo;

    fn utxo_params() -> HtlcParams {
        HtlcParams {
            coin: "BTC".into(),
            family: CoinFamily::Utxo,
            secret_hash: [0xaa; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
            recipient_pubkey: [vec![0x02], vec![0x11; 32]].concat(),
            refund_pubkey: [vec![0x03], vec![0x22; 32]].concat(),
            locktime: 1_700_000_000,
            amount: 100_000_000,
        }
    }

    #[test]
    fn test_utxo_script_layout() {
        let params = utxo_params();
        let script = utxo_redeem_script(&params);

        assert_eq!(script[0], OP_IF);
        assert_eq!(script[1], 4);
        assert_eq!(&script[2..6], &1_700_000_000u32.to_le_bytes());
        assert_eq!(script[6], OP_CHECKLOCKTIMEVERIFY);
        assert_eq!(*script.last().unwrap(), OP_ENDIF);
        assert_eq!(script.len(), 119);
        assert!(script
            .windows(32)
            .any(|w| w == params.secret_hash.as_slice()));
    }

    #[test]
    fn test_account_calldata_selectors_and_length() {
        let params = HtlcParams {
            coin: "ETH".into(),
            family: CoinFamily::Account,
            recipient_pubkey: vec![0x11; 20],
            refund_pubkey: vec![0x22; 20],
            ..utxo_params()
        };

        let payment = account_payment_calldata(&params).unwrap();
        assert_eq!(&payment[..4], &selector(ETH_PAYMENT_SIG));
        assert_eq!(payment.len(), 4 + 4 * 32);

        let secret = Secret::from_bytes([5; 32]);
        let spend = account_spend_calldata(&params, &secret).unwrap();
        assert_eq!(&spend[..4], &selector(RECEIVER_SPEND_SIG));
        assert_eq!(&spend[4 + 64..4 + 96], secret.as_bytes());

        let refund = account_refund_calldata(&params).unwrap();
        assert_eq!(&refund[4..36], &payment_id(&params));
    }

    #[test]
    fn test_account_calldata_rejects_utxo_keys() {
        let params = HtlcParams {
            family: CoinFamily::Account,
            ..utxo_params()
        };
        assert!(matches!(
            account_payment_calldata(&params),
            Err(SwapError::Validation(_))
        ));
    }

    #[test]
    fn test_payment_id_binds_locktime() {
        let a = utxo_params();
        let b = HtlcParams {
            locktime: a.locktime + 1,
            ..a.clone()
        };
        assert_ne!(payment_id(&a), payment_id(&b));
    }
}
