//! Negotiation manager - agrees swap terms before any funds move
//!
//! The taker proposes locktimes anchored at the taker coin's latest block
//! time together with its own keys; the maker checks the proposal against
//! the order it posted and answers with the secret hash and its keys.

pub mod messenger;

pub use messenger::{
    channel_pair, LocalMessenger, LocalTransport, SwapMessage, SwapMessenger, SwapTransport,
};

use crate::chain::ChainWatcher;
use crate::config::{CoinFamily, EngineConfig};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{check_pubkey, SecretHashAlgo};
use crate::swap::Swap;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terms proposed by the taker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapProposal {
    pub swap_id: Uuid,
    pub order_id: Uuid,
    pub base_coin: String,
    pub rel_coin: String,
    pub base_amount: u64,
    pub rel_amount: u64,
    pub started_at: u64,
    pub lock_duration: u64,
    pub taker_locktime: u64,
    pub maker_locktime: u64,
    /// Taker key receiving the maker payment
    #[serde(with = "hex")]
    pub taker_base_pubkey: Vec<u8>,
    /// Taker key refunding the taker payment
    #[serde(with = "hex")]
    pub taker_rel_pubkey: Vec<u8>,
}

/// Maker's answer to an acceptable proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapAcceptance {
    pub swap_id: Uuid,
    #[serde(with = "hex")]
    pub secret_hash: [u8; 32],
    pub secret_hash_algo: SecretHashAlgo,
    pub taker_locktime: u64,
    pub maker_locktime: u64,
    #[serde(with = "hex")]
    pub maker_base_pubkey: Vec<u8>,
    #[serde(with = "hex")]
    pub maker_rel_pubkey: Vec<u8>,
}

/// Agreed values, copied into the swap once negotiation succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRecord {
    pub counterparty_base_pubkey: Vec<u8>,
    pub counterparty_rel_pubkey: Vec<u8>,
    pub secret_hash: [u8; 32],
    pub secret_hash_algo: SecretHashAlgo,
    pub started_at: u64,
    pub lock_duration: u64,
    pub maker_locktime: u64,
    pub taker_locktime: u64,
}

/// What one side expects from the swap it is negotiating
#[derive(Debug, Clone)]
pub struct SwapTerms {
    pub swap_id: Uuid,
    pub order_id: Uuid,
    pub base_coin: String,
    pub rel_coin: String,
    pub base_family: CoinFamily,
    pub rel_family: CoinFamily,
    pub base_amount: u64,
    pub rel_amount: u64,
    pub my_base_pubkey: Vec<u8>,
    pub my_rel_pubkey: Vec<u8>,
    /// Meaningful on the maker side only
    pub secret_hash: [u8; 32],
    pub secret_hash_algo: SecretHashAlgo,
}

impl SwapTerms {
    pub fn from_swap(swap: &Swap, base_family: CoinFamily, rel_family: CoinFamily) -> Self {
        Self {
            swap_id: swap.uuid,
            order_id: swap.order_id,
            base_coin: swap.base_coin.clone(),
            rel_coin: swap.rel_coin.clone(),
            base_family,
            rel_family,
            base_amount: swap.maker_amount(),
            rel_amount: swap.taker_amount(),
            my_base_pubkey: swap.my_base_pubkey.clone(),
            my_rel_pubkey: swap.my_rel_pubkey.clone(),
            secret_hash: swap.secret_hash,
            secret_hash_algo: swap.secret_hash_algo,
        }
    }
}

fn rejected(reason: impl Into<String>) -> SwapError {
    SwapError::Negotiation(reason.into())
}

fn check_key(family: CoinFamily, key: &[u8], whose: &str) -> SwapResult<()> {
    check_pubkey(family, key).map_err(|e| rejected(format!("{}: {}", whose, e)))
}

fn check_hash_algo(terms: &SwapTerms, algo: SecretHashAlgo) -> SwapResult<()> {
    let utxo_leg = terms.base_family == CoinFamily::Utxo || terms.rel_family == CoinFamily::Utxo;
    if utxo_leg && algo != SecretHashAlgo::Sha256 {
        return Err(rejected(format!(
            "{:?} secret hash is not spendable on a utxo coin",
            algo
        )));
    }
    Ok(())
}

/// Maker-side validation of a proposal
pub fn check_proposal(
    proposal: &SwapProposal,
    terms: &SwapTerms,
    safety_margin: u64,
    chain_time: u64,
) -> SwapResult<()> {
    if proposal.swap_id != terms.swap_id || proposal.order_id != terms.order_id {
        return Err(rejected("proposal is for another swap"));
    }
    if proposal.base_coin != terms.base_coin || proposal.rel_coin != terms.rel_coin {
        return Err(rejected(format!(
            "pair {}/{} does not match order {}/{}",
            proposal.base_coin, proposal.rel_coin, terms.base_coin, terms.rel_coin
        )));
    }
    if proposal.base_amount != terms.base_amount || proposal.rel_amount != terms.rel_amount {
        return Err(rejected(format!(
            "amounts {}/{} do not match order {}/{}",
            proposal.base_amount, proposal.rel_amount, terms.base_amount, terms.rel_amount
        )));
    }

    check_key(terms.base_family, &proposal.taker_base_pubkey, "taker base key")?;
    check_key(terms.rel_family, &proposal.taker_rel_pubkey, "taker rel key")?;

    if proposal.lock_duration == 0 || proposal.lock_duration < safety_margin {
        return Err(rejected(format!(
            "lock duration {} below safety margin {}",
            proposal.lock_duration, safety_margin
        )));
    }
    let expected_taker = proposal.started_at.saturating_add(proposal.lock_duration);
    let expected_maker = expected_taker.saturating_add(proposal.lock_duration);
    if proposal.taker_locktime != expected_taker || proposal.maker_locktime != expected_maker {
        return Err(rejected("locktimes do not follow the swap start"));
    }
    if proposal.maker_locktime <= proposal.taker_locktime {
        return Err(rejected("maker locktime must come after taker locktime"));
    }
    if proposal.maker_locktime - proposal.taker_locktime < safety_margin {
        return Err(rejected("maker locktime too close to taker locktime"));
    }

    // No time left to fund both legs
    let funding_deadline = proposal.taker_locktime - proposal.lock_duration / 2;
    if chain_time >= funding_deadline {
        return Err(rejected(format!(
            "proposal expired: chain time {} past funding deadline {}",
            chain_time, funding_deadline
        )));
    }
    if proposal.started_at > chain_time + proposal.lock_duration / 2 {
        return Err(rejected("proposal starts in the future"));
    }

    Ok(())
}

/// Taker-side validation of the maker's answer
pub fn check_acceptance(
    proposal: &SwapProposal,
    acceptance: &SwapAcceptance,
    terms: &SwapTerms,
) -> SwapResult<()> {
    if acceptance.swap_id != proposal.swap_id {
        return Err(rejected("acceptance is for another swap"));
    }
    if acceptance.taker_locktime != proposal.taker_locktime
        || acceptance.maker_locktime != proposal.maker_locktime
    {
        return Err(rejected("maker changed the proposed locktimes"));
    }
    if acceptance.maker_locktime <= acceptance.taker_locktime {
        return Err(rejected("maker locktime must come after taker locktime"));
    }
    if acceptance.secret_hash == [0u8; 32] {
        return Err(rejected("empty secret hash"));
    }
    check_hash_algo(terms, acceptance.secret_hash_algo)?;
    check_key(terms.base_family, &acceptance.maker_base_pubkey, "maker base key")?;
    check_key(terms.rel_family, &acceptance.maker_rel_pubkey, "maker rel key")?;
    Ok(())
}

/// Runs the pre-funding handshake for either role
pub struct NegotiationManager {
    timeout: Duration,
    lock_duration: u64,
    safety_margin: u64,
}

impl NegotiationManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.negotiation_timeout(),
            lock_duration: config.lock_duration_secs,
            safety_margin: config.locktime_safety_margin_secs,
        }
    }

    /// Taker side: send a proposal and wait for the maker's answer
    pub async fn propose(
        &self,
        terms: &SwapTerms,
        rel: &ChainWatcher,
        messenger: &dyn SwapMessenger,
    ) -> SwapResult<NegotiationRecord> {
        let started_at = rel.latest_tip().await?.timestamp;
        let taker_locktime = started_at + self.lock_duration;
        let proposal = SwapProposal {
            swap_id: terms.swap_id,
            order_id: terms.order_id,
            base_coin: terms.base_coin.clone(),
            rel_coin: terms.rel_coin.clone(),
            base_amount: terms.base_amount,
            rel_amount: terms.rel_amount,
            started_at,
            lock_duration: self.lock_duration,
            taker_locktime,
            maker_locktime: taker_locktime + self.lock_duration,
            taker_base_pubkey: terms.my_base_pubkey.clone(),
            taker_rel_pubkey: terms.my_rel_pubkey.clone(),
        };

        info!(
            "Proposing swap {}: taker locktime {}, maker locktime {}",
            terms.swap_id, proposal.taker_locktime, proposal.maker_locktime
        );
        messenger.send(SwapMessage::Proposal(proposal.clone())).await?;

        let answer = async {
            loop {
                match messenger.recv().await? {
                    SwapMessage::Accept(acceptance) => return Ok::<_, SwapError>(acceptance),
                    SwapMessage::Reject { reason } => {
                        return Err(rejected(format!("maker rejected proposal: {}", reason)))
                    }
                    other => debug!("Swap {}: ignoring {} while negotiating", terms.swap_id, other.name()),
                }
            }
        };
        let acceptance = timeout(self.timeout, answer)
            .await
            .map_err(|_| rejected(format!("no answer within {:?}", self.timeout)))??;

        check_acceptance(&proposal, &acceptance, terms)?;

        Ok(NegotiationRecord {
            counterparty_base_pubkey: acceptance.maker_base_pubkey,
            counterparty_rel_pubkey: acceptance.maker_rel_pubkey,
            secret_hash: acceptance.secret_hash,
            secret_hash_algo: acceptance.secret_hash_algo,
            started_at,
            lock_duration: proposal.lock_duration,
            maker_locktime: proposal.maker_locktime,
            taker_locktime: proposal.taker_locktime,
        })
    }

    /// Maker side: wait for a proposal, validate it and answer
    pub async fn respond(
        &self,
        terms: &SwapTerms,
        rel: &ChainWatcher,
        messenger: &dyn SwapMessenger,
    ) -> SwapResult<NegotiationRecord> {
        let incoming = async {
            loop {
                match messenger.recv().await? {
                    SwapMessage::Proposal(proposal) => return Ok::<_, SwapError>(proposal),
                    other => debug!("Swap {}: ignoring {} while negotiating", terms.swap_id, other.name()),
                }
            }
        };
        let proposal = timeout(self.timeout, incoming)
            .await
            .map_err(|_| rejected(format!("no proposal within {:?}", self.timeout)))??;

        let chain_time = rel.latest_tip().await?.timestamp;
        let verdict = check_proposal(&proposal, terms, self.safety_margin, chain_time)
            .and_then(|_| check_hash_algo(terms, terms.secret_hash_algo));
        if let Err(e) = verdict {
            warn!("Swap {}: rejecting proposal: {}", terms.swap_id, e);
            messenger
                .send(SwapMessage::Reject {
                    reason: e.to_string(),
                })
                .await?;
            return Err(e);
        }

        let acceptance = SwapAcceptance {
            swap_id: terms.swap_id,
            secret_hash: terms.secret_hash,
            secret_hash_algo: terms.secret_hash_algo,
            taker_locktime: proposal.taker_locktime,
            maker_locktime: proposal.maker_locktime,
            maker_base_pubkey: terms.my_base_pubkey.clone(),
            maker_rel_pubkey: terms.my_rel_pubkey.clone(),
        };
        messenger.send(SwapMessage::Accept(acceptance)).await?;
        info!("Accepted proposal for swap {}", terms.swap_id);

        Ok(NegotiationRecord {
            counterparty_base_pubkey: proposal.taker_base_pubkey,
            counterparty_rel_pubkey: proposal.taker_rel_pubkey,
            secret_hash: terms.secret_hash,
            secret_hash_algo: terms.secret_hash_algo,
            started_at: proposal.started_at,
            lock_duration: proposal.lock_duration,
            maker_locktime: proposal.maker_locktime,
            taker_locktime: proposal.taker_locktime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::{SimulatedChain, SimulatedWallet};
    use crate::chain::CoinAdapter;
    use std::sync::Arc;

    fn terms(swap_id: Uuid, order_id: Uuid) -> SwapTerms {
        SwapTerms {
            swap_id,
            order_id,
            base_coin: "BASE".into(),
            rel_coin: "REL".into(),
            base_family: CoinFamily::Utxo,
            rel_family: CoinFamily::Account,
            base_amount: 100_000_000,
            rel_amount: 500_000_000,
            my_base_pubkey: [vec![0x02], vec![1; 32]].concat(),
            my_rel_pubkey: vec![7; 20],
            secret_hash: [9; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
        }
    }

    fn proposal(terms: &SwapTerms, started_at: u64) -> SwapProposal {
        SwapProposal {
            swap_id: terms.swap_id,
            order_id: terms.order_id,
            base_coin: terms.base_coin.clone(),
            rel_coin: terms.rel_coin.clone(),
            base_amount: terms.base_amount,
            rel_amount: terms.rel_amount,
            started_at,
            lock_duration: 3_600,
            taker_locktime: started_at + 3_600,
            maker_locktime: started_at + 7_200,
            taker_base_pubkey: [vec![0x03], vec![2; 32]].concat(),
            taker_rel_pubkey: vec![8; 20],
        }
    }

    fn manager() -> NegotiationManager {
        let config = EngineConfig {
            negotiation_timeout_secs: 2,
            ..EngineConfig::default()
        };
        NegotiationManager::new(&config)
    }

    #[test]
    fn test_proposal_checks() {
        let terms = terms(Uuid::new_v4(), Uuid::new_v4());
        let good = proposal(&terms, 10_000);
        assert!(check_proposal(&good, &terms, 900, 10_000).is_ok());

        let mut wrong_amount = good.clone();
        wrong_amount.rel_amount += 1;
        assert!(matches!(
            check_proposal(&wrong_amount, &terms, 900, 10_000),
            Err(SwapError::Negotiation(_))
        ));

        let mut bad_key = good.clone();
        bad_key.taker_base_pubkey = vec![0x05; 33];
        assert!(check_proposal(&bad_key, &terms, 900, 10_000).is_err());

        let mut inverted = good.clone();
        inverted.maker_locktime = inverted.taker_locktime - 1;
        assert!(check_proposal(&inverted, &terms, 900, 10_000).is_err());

        // Half the lock duration already gone
        assert!(check_proposal(&good, &terms, 900, 11_800).is_err());
        // Margin larger than the gap between the legs
        assert!(check_proposal(&good, &terms, 4_000, 10_000).is_err());
    }

    #[test]
    fn test_equal_locktimes_rejected_without_margin() {
        let terms = terms(Uuid::new_v4(), Uuid::new_v4());
        let mut flat = proposal(&terms, 10_000);
        flat.lock_duration = 0;
        flat.taker_locktime = 10_000;
        flat.maker_locktime = 10_000;
        assert!(matches!(
            check_proposal(&flat, &terms, 0, 9_000),
            Err(SwapError::Negotiation(_))
        ));

        let acceptance = SwapAcceptance {
            swap_id: terms.swap_id,
            secret_hash: [4; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
            taker_locktime: flat.taker_locktime,
            maker_locktime: flat.maker_locktime,
            maker_base_pubkey: [vec![0x02], vec![5; 32]].concat(),
            maker_rel_pubkey: vec![6; 20],
        };
        assert!(check_acceptance(&flat, &acceptance, &terms).is_err());
    }

    #[test]
    fn test_acceptance_checks() {
        let terms = terms(Uuid::new_v4(), Uuid::new_v4());
        let proposal = proposal(&terms, 10_000);
        let acceptance = SwapAcceptance {
            swap_id: terms.swap_id,
            secret_hash: [4; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
            taker_locktime: proposal.taker_locktime,
            maker_locktime: proposal.maker_locktime,
            maker_base_pubkey: [vec![0x02], vec![5; 32]].concat(),
            maker_rel_pubkey: vec![6; 20],
        };
        assert!(check_acceptance(&proposal, &acceptance, &terms).is_ok());

        let keccak = SwapAcceptance {
            secret_hash_algo: SecretHashAlgo::Keccak256,
            ..acceptance.clone()
        };
        assert!(check_acceptance(&proposal, &keccak, &terms).is_err());

        let moved = SwapAcceptance {
            maker_locktime: proposal.maker_locktime + 60,
            ..acceptance
        };
        assert!(check_acceptance(&proposal, &moved, &terms).is_err());
    }

    #[tokio::test]
    async fn test_handshake_agrees_on_terms() {
        let chain = Arc::new(SimulatedChain::with_genesis("REL", CoinFamily::Account, 10, 50_000));
        let wallet: Arc<dyn CoinAdapter> = Arc::new(SimulatedWallet::new(chain, "n"));
        let rel = ChainWatcher::new(wallet, Duration::from_millis(10));

        let swap_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let maker_terms = terms(swap_id, order_id);
        let mut taker_terms = terms(swap_id, order_id);
        taker_terms.my_base_pubkey = [vec![0x03], vec![2; 32]].concat();
        taker_terms.my_rel_pubkey = vec![8; 20];

        let (maker_end, taker_end) = channel_pair();
        let manager = manager();

        let (maker, taker) = tokio::join!(
            manager.respond(&maker_terms, &rel, &maker_end),
            manager.propose(&taker_terms, &rel, &taker_end)
        );
        let maker = maker.unwrap();
        let taker = taker.unwrap();

        assert_eq!(taker.secret_hash, [9; 32]);
        assert_eq!(maker.taker_locktime, 50_000 + 3_600);
        assert_eq!(maker.maker_locktime, taker.maker_locktime);
        assert_eq!(maker.counterparty_rel_pubkey, vec![8; 20]);
        assert_eq!(taker.counterparty_rel_pubkey, vec![7; 20]);
    }

    #[tokio::test]
    async fn test_rejected_proposal_fails_both_sides() {
        let chain = Arc::new(SimulatedChain::with_genesis("REL", CoinFamily::Account, 10, 50_000));
        let wallet: Arc<dyn CoinAdapter> = Arc::new(SimulatedWallet::new(chain, "n"));
        let rel = ChainWatcher::new(wallet, Duration::from_millis(10));

        let swap_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let maker_terms = terms(swap_id, order_id);
        let mut taker_terms = terms(swap_id, order_id);
        taker_terms.base_amount /= 2;

        let (maker_end, taker_end) = channel_pair();
        let manager = manager();
        let (maker, taker) = tokio::join!(
            manager.respond(&maker_terms, &rel, &maker_end),
            manager.propose(&taker_terms, &rel, &taker_end)
        );

        assert!(matches!(maker, Err(SwapError::Negotiation(_))));
        let err = taker.unwrap_err().to_string();
        assert!(err.contains("rejected"), "{}", err);
    }
}
