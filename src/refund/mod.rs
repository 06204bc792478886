//! Refund supervisor
//!
//! Reclaims a swap's own hash-time-locked payments once their locktime has
//! passed on chain. A counterparty that claims one of those payments instead
//! has revealed the secret; the supervisor then uses it on the counterparty
//! payment addressed to us, which settles the swap rather than refunding it.

use crate::chain::{
    ChainManager, ChainWatcher, CoinAdapter, ConfirmationEvent, LocktimeStatus, SpendInfo, SpendKind,
};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{build_refund, build_spend, HtlcTx, Secret};
use crate::swap::{Payment, PaymentRole, Swap, SwapRole};
use crate::tx::BackoffPolicy;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of a refund run
#[derive(Debug)]
pub enum RefundOutcome {
    Refunded,
    /// The counterparty claimed our payment and we claimed theirs with the secret
    Redeemed,
    RefundFailed(SwapError),
}

/// What happened to one of our payments
enum Reclaim {
    /// Refunded by us; `tx` is unknown when an earlier run broadcast it
    Refunded { txid: String, tx: Option<HtlcTx> },
    Claimed(SpendInfo),
}

pub struct RefundSupervisor {
    chains: Arc<ChainManager>,
    policy: BackoffPolicy,
    /// Wall-clock wait for a refund to confirm before rebroadcasting it
    max_wait: Duration,
    invocations: DashMap<Uuid, u32>,
    /// Present while a refund runs; notified by `nudge`
    active: DashMap<Uuid, Arc<Notify>>,
}

/// Removes the active marker however the refund future ends
struct ActiveRefund<'a> {
    active: &'a DashMap<Uuid, Arc<Notify>>,
    uuid: Uuid,
}

impl Drop for ActiveRefund<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.uuid);
    }
}

/// Counterparty payment we may claim once the secret is known, and the role of that claim
fn redeemable(role: SwapRole) -> (PaymentRole, PaymentRole) {
    match role {
        SwapRole::Taker => (PaymentRole::MakerPayment, PaymentRole::TakerSpend),
        SwapRole::Maker => (PaymentRole::TakerPayment, PaymentRole::MakerSpend),
    }
}

impl RefundSupervisor {
    pub fn new(chains: Arc<ChainManager>, policy: BackoffPolicy, max_wait: Duration) -> Self {
        Self {
            chains,
            policy,
            max_wait,
            invocations: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Refund every own unspent HTLC payment of `swap`.
    ///
    /// Only one refund per swap may run at a time. Spent payments and the
    /// refund or claim transactions are recorded on `swap`.
    pub async fn refund(&self, swap: &mut Swap) -> SwapResult<RefundOutcome> {
        let uuid = swap.uuid;
        *self.invocations.entry(uuid).or_insert(0) += 1;

        let nudge = match self.active.entry(uuid) {
            Entry::Occupied(_) => {
                return Err(SwapError::Refund(format!(
                    "refund of swap {} is already running",
                    uuid
                )))
            }
            Entry::Vacant(slot) => slot.insert(Arc::new(Notify::new())).clone(),
        };
        let _active = ActiveRefund {
            active: &self.active,
            uuid,
        };

        let locked: Vec<Payment> = swap.own_locked_payments().into_iter().cloned().collect();
        let roles: Vec<PaymentRole> = locked.iter().map(|p| p.role).collect();
        info!("Swap {}: refunding {:?}", uuid, roles);

        let mut failure = None;
        for payment in &locked {
            match self.refund_payment(swap, payment, &locked, &nudge).await {
                Ok(Reclaim::Refunded { txid, tx }) => {
                    self.record_refund(swap, payment, txid, tx, &nudge).await?;
                }
                Ok(Reclaim::Claimed(spend)) => {
                    return Ok(self.redeem_after_claim(swap, payment, spend, &nudge).await);
                }
                Err(e) => {
                    error!("Swap {}: refund of {:?} failed: {}", uuid, payment.role, e);
                    failure.get_or_insert(e);
                }
            }
        }

        Ok(match failure {
            Some(e) => RefundOutcome::RefundFailed(e),
            None => {
                info!("Swap {}: all payments refunded", uuid);
                RefundOutcome::Refunded
            }
        })
    }

    /// Cut the current wait of a running refund short
    pub fn nudge(&self, uuid: Uuid) -> bool {
        match self.active.get(&uuid) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, uuid: Uuid) -> bool {
        self.active.contains_key(&uuid)
    }

    pub fn invocation_count(&self, uuid: Uuid) -> u32 {
        self.invocations.get(&uuid).map_or(0, |c| *c)
    }

    /// Wait for the locktime of `payment`, then reclaim it. A claim of any
    /// of `locked` seen on the way ends the wait early.
    async fn refund_payment(
        &self,
        swap: &Swap,
        payment: &Payment,
        locked: &[Payment],
        nudge: &Notify,
    ) -> SwapResult<Reclaim> {
        let coin = self.chains.coin(&payment.coin)?;
        let watcher = self.chains.watcher(&payment.coin)?;

        if let Some((role, spend)) = self.wait_locktime(&watcher, payment.params().locktime, locked, nudge).await? {
            info!("Swap {}: {:?} claimed by {} before its locktime", swap.uuid, role, spend.txid);
            return Ok(Reclaim::Claimed(spend));
        }

        self.reclaim(coin.as_ref(), &watcher, payment, nudge).await
    }

    async fn record_refund(
        &self,
        swap: &mut Swap,
        payment: &Payment,
        txid: String,
        tx: Option<HtlcTx>,
        nudge: &Notify,
    ) -> SwapResult<()> {
        let refund_role = payment
            .role
            .refund_role()
            .ok_or_else(|| SwapError::Internal(format!("{:?} is not refundable", payment.role)))?;

        if let Some(tx) = tx {
            let coin = self.chains.coin(&payment.coin)?;
            let watcher = self.chains.watcher(&payment.coin)?;
            let confirmations = self.wait_confirmed(coin.as_ref(), &watcher, &tx, payment, nudge).await?;
            let mut refund = Payment::new(refund_role, tx, payment.required_confirmations);
            refund.broadcast = true;
            refund.confirmations = confirmations;
            swap.upsert_payment(refund);
        }

        if let Some(p) = swap.payment_mut(payment.role) {
            p.mark_spent(&txid);
        }
        info!("Swap {}: {:?} {} refunded by {}", swap.uuid, payment.role, payment.txid, txid);
        Ok(())
    }

    /// Wait until chain time passes `locktime`, or until the counterparty
    /// claims one of `locked`
    async fn wait_locktime(
        &self,
        watcher: &ChainWatcher,
        locktime: u64,
        locked: &[Payment],
        nudge: &Notify,
    ) -> SwapResult<Option<(PaymentRole, SpendInfo)>> {
        let mut ticks = watcher.subscribe_ticks();
        loop {
            if let Some(claimed) = self.find_claim(locked).await {
                return Ok(Some(claimed));
            }
            match watcher.observe_locktime(locktime).await {
                Ok(LocktimeStatus::Expired) => return Ok(None),
                Ok(LocktimeStatus::NotYet) => {}
                Err(e) => warn!("Cannot read {} chain time: {}", watcher.ticker(), e),
            }

            tokio::select! {
                tick = ticks.recv() => {
                    if let Err(RecvError::Closed) = tick {
                        return Err(SwapError::Internal(format!(
                            "{} watcher stopped",
                            watcher.ticker()
                        )));
                    }
                }
                _ = nudge.notified() => {}
            }
        }
    }

    async fn find_claim(&self, locked: &[Payment]) -> Option<(PaymentRole, SpendInfo)> {
        for payment in locked {
            let Ok(coin) = self.chains.coin(&payment.coin) else {
                continue;
            };
            match coin.find_spend(payment).await {
                Ok(Some(spend)) if matches!(spend.kind, SpendKind::Claim { .. }) => {
                    return Some((payment.role, spend));
                }
                Ok(_) => {}
                Err(e) => warn!("Spend lookup for {} failed: {}", payment.txid, e),
            }
        }
        None
    }

    /// Broadcast the refund, or find that the output is already spent
    async fn reclaim(
        &self,
        coin: &dyn CoinAdapter,
        watcher: &ChainWatcher,
        payment: &Payment,
        nudge: &Notify,
    ) -> SwapResult<Reclaim> {
        let mut attempts = 0;
        loop {
            match coin.find_spend(payment).await {
                Ok(Some(spend)) => match spend.kind {
                    SpendKind::Claim { .. } => return Ok(Reclaim::Claimed(spend)),
                    SpendKind::Refund => {
                        info!("{} already refunded by {}", payment.txid, spend.txid);
                        return Ok(Reclaim::Refunded {
                            txid: spend.txid,
                            tx: None,
                        });
                    }
                },
                Ok(None) => {}
                Err(e) => warn!("Spend lookup for {} failed: {}", payment.txid, e),
            }

            let chain_time = match watcher.latest_tip().await {
                Ok(tip) => tip.timestamp,
                Err(e) => {
                    attempts += 1;
                    warn!("Cannot read {} chain time: {}", payment.coin, e);
                    self.pause(attempts, nudge).await;
                    continue;
                }
            };

            let attempt = async {
                let tx = build_refund(payment, chain_time, coin).await?;
                let txid = coin.broadcast(&tx).await?;
                Ok::<_, SwapError>((tx, txid))
            };

            match attempt.await {
                Ok((tx, txid)) => {
                    info!("Refund {} of {} broadcast on {}", txid, payment.txid, payment.coin);
                    return Ok(Reclaim::Refunded { txid, tx: Some(tx) });
                }
                // Look up who spent it on the next round
                Err(SwapError::AlreadySpent { spent_by, .. }) => {
                    warn!("{} spent by {} while refunding", payment.txid, spent_by);
                    attempts += 1;
                }
                Err(e @ SwapError::LocktimeNotReached { .. }) => {
                    attempts += 1;
                    warn!("Refund of {} early: {}", payment.txid, e);
                    self.pause(attempts, nudge).await;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    crate::metrics::record_broadcast_retry(&payment.coin);
                    warn!("Refund broadcast of {} failed (attempt {}): {}", payment.txid, attempts, e);
                    self.pause(attempts, nudge).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The counterparty claimed `claimed`; take the secret from its claim
    /// and spend the counterparty payment addressed to us
    async fn redeem_after_claim(
        &self,
        swap: &mut Swap,
        claimed: &Payment,
        spend: SpendInfo,
        nudge: &Notify,
    ) -> RefundOutcome {
        let already_spent = || SwapError::AlreadySpent {
            coin: claimed.coin.clone(),
            txid: claimed.txid.clone(),
            spent_by: spend.txid.clone(),
        };
        let SpendKind::Claim { secret } = &spend.kind else {
            return RefundOutcome::RefundFailed(already_spent());
        };
        if !secret.matches(swap.secret_hash_algo, &swap.secret_hash) {
            error!("Swap {}: claim {} carries a secret of another hash", swap.uuid, spend.txid);
            return RefundOutcome::RefundFailed(SwapError::SecretHashMismatch);
        }
        if swap.secret.is_none() {
            info!("Swap {}: learned the secret from claim {}", swap.uuid, spend.txid);
            swap.secret = Some(secret.clone());
        }

        let (target, _) = redeemable(swap.role);
        let Some(payment) = swap.payment(target).filter(|p| p.broadcast && !p.spent).cloned() else {
            warn!("Swap {}: {:?} claimed with nothing left to redeem", swap.uuid, claimed.role);
            return RefundOutcome::RefundFailed(already_spent());
        };

        match self.redeem(swap, &payment, secret, nudge).await {
            Ok(()) => {
                if let Some(p) = swap.payment_mut(claimed.role) {
                    p.mark_spent(&spend.txid);
                }
                info!("Swap {}: redeemed {:?} {} with the revealed secret", swap.uuid, target, payment.txid);
                RefundOutcome::Redeemed
            }
            Err(e) => {
                error!("Swap {}: redeeming {:?} failed: {}", swap.uuid, target, e);
                RefundOutcome::RefundFailed(e)
            }
        }
    }

    /// Claim `payment` with `secret`; a claim an earlier run broadcast is reused
    async fn redeem(&self, swap: &mut Swap, payment: &Payment, secret: &Secret, nudge: &Notify) -> SwapResult<()> {
        let (_, spend_role) = redeemable(swap.role);
        let coin = self.chains.coin(&payment.coin)?;
        let watcher = self.chains.watcher(&payment.coin)?;

        let tx = match swap.payment(spend_role) {
            Some(signed) => signed.tx.clone(),
            None => build_spend(payment, secret, coin.as_ref()).await?,
        };

        let mut attempts = 0;
        let txid = loop {
            match coin.find_spend(payment).await {
                Ok(Some(SpendInfo {
                    txid,
                    kind: SpendKind::Claim { .. },
                    ..
                })) => break txid,
                Ok(Some(refund)) => {
                    return Err(SwapError::AlreadySpent {
                        coin: payment.coin.clone(),
                        txid: payment.txid.clone(),
                        spent_by: refund.txid,
                    })
                }
                Ok(None) => {}
                Err(e) => warn!("Spend lookup for {} failed: {}", payment.txid, e),
            }

            match coin.broadcast(&tx).await {
                Ok(txid) => break txid,
                Err(SwapError::AlreadySpent { spent_by, .. }) => {
                    warn!("{} spent by {} while redeeming", payment.txid, spent_by);
                    attempts += 1;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    crate::metrics::record_broadcast_retry(&payment.coin);
                    warn!("Claim broadcast of {} failed (attempt {}): {}", payment.txid, attempts, e);
                    self.pause(attempts, nudge).await;
                }
                Err(e) => return Err(e),
            }
        };

        let mut claim = Payment::new(spend_role, tx, payment.required_confirmations);
        if txid == claim.txid {
            claim.confirmations = self.wait_confirmed(coin.as_ref(), &watcher, &claim.tx, payment, nudge).await?;
        }
        claim.broadcast = true;
        swap.upsert_payment(claim);
        if let Some(p) = swap.payment_mut(payment.role) {
            p.mark_spent(&txid);
        }
        Ok(())
    }

    async fn wait_confirmed(
        &self,
        coin: &dyn CoinAdapter,
        watcher: &ChainWatcher,
        tx: &HtlcTx,
        payment: &Payment,
        nudge: &Notify,
    ) -> SwapResult<u64> {
        loop {
            let mut stream = watcher.observe(&tx.txid, payment.required_confirmations).await;
            let outcome = tokio::time::timeout(self.max_wait, async {
                while let Some(event) = stream.next().await {
                    match event {
                        ConfirmationEvent::Confirmed { confirmations, .. } => return Some(confirmations),
                        ConfirmationEvent::Regressed { .. } => return None,
                        _ => {}
                    }
                }
                None
            })
            .await;

            if let Ok(Some(confirmations)) = outcome {
                return Ok(confirmations);
            }

            warn!("{:?} {} not confirmed, rebroadcasting", tx.kind, tx.txid);
            let mut attempts = 0;
            loop {
                match coin.broadcast(tx).await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => {
                        attempts += 1;
                        self.pause(attempts, nudge).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn pause(&self, attempt: u32, nudge: &Notify) {
        let delay = self.policy.delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = nudge.notified() => info!("Refund retry nudged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::{SimulatedChain, SimulatedWallet};
    use crate::config::CoinFamily;
    use crate::htlc::{build_payment, build_spend, Secret};
    use crate::swap::{test_swap, ConfirmationSettings, SwapRole};

    struct Fixture {
        chain: Arc<SimulatedChain>,
        maker: Arc<SimulatedWallet>,
        taker: Arc<SimulatedWallet>,
        supervisor: RefundSupervisor,
        swap: Swap,
    }

    async fn fixture() -> Fixture {
        let chain = Arc::new(SimulatedChain::with_genesis("BASE", CoinFamily::Utxo, 60, 100_000));
        let maker = Arc::new(SimulatedWallet::new(chain.clone(), "maker"));
        let taker = Arc::new(SimulatedWallet::new(chain.clone(), "taker"));

        let chains = Arc::new(ChainManager::new(Duration::from_millis(10)));
        chains.register(
            maker.clone(),
            ConfirmationSettings {
                confirmations: 1,
                protected: false,
                protected_confirmations: 1,
            },
        );
        chains.start_watchers().await;

        let mut swap = test_swap(SwapRole::Maker);
        swap.base_coin = "BASE".into();
        swap.my_base_pubkey = maker.htlc_pubkey();
        swap.counterparty_base_pubkey = taker.htlc_pubkey();
        swap.taker_locktime = 100_300;
        swap.maker_locktime = 100_600;

        let tx = build_payment(swap.htlc_params(PaymentRole::MakerPayment, CoinFamily::Utxo)).unwrap();
        let tx = maker.sign(tx).await.unwrap();
        maker.broadcast(&tx).await.unwrap();
        chain.mine(1).await;
        let mut payment = Payment::new(PaymentRole::MakerPayment, tx, 1);
        payment.broadcast = true;
        swap.upsert_payment(payment);

        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 2.0, 3);
        Fixture {
            chain,
            maker,
            taker,
            supervisor: RefundSupervisor::new(chains, policy, Duration::from_secs(5)),
            swap,
        }
    }

    #[tokio::test]
    async fn test_refund_after_locktime() {
        let Fixture {
            chain,
            maker,
            supervisor,
            mut swap,
            ..
        } = fixture().await;
        let miner = chain.spawn_miner(Duration::from_millis(10));
        maker.set_fail_broadcasts(true);
        let flaky = {
            let maker = maker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                maker.set_fail_broadcasts(false);
            })
        };

        let outcome = supervisor.refund(&mut swap).await.unwrap();
        miner.abort();
        flaky.await.unwrap();

        assert!(matches!(outcome, RefundOutcome::Refunded));
        let payment = swap.payment(PaymentRole::MakerPayment).unwrap();
        assert!(payment.spent);
        let refund = swap.payment(PaymentRole::MakerRefund).unwrap();
        assert_eq!(payment.spent_by.as_deref(), Some(refund.txid.as_str()));
        assert!(chain.tip().await.timestamp >= 100_600);
        assert_eq!(supervisor.invocation_count(swap.uuid), 1);
        assert!(!supervisor.is_running(swap.uuid));
    }

    #[tokio::test]
    async fn test_counterparty_claim_is_not_retried() {
        let Fixture {
            chain,
            taker,
            supervisor,
            mut swap,
            ..
        } = fixture().await;
        let secret: Secret = swap.secret.clone().unwrap();
        let claim = build_spend(swap.payment(PaymentRole::MakerPayment).unwrap(), &secret, taker.as_ref())
            .await
            .unwrap();
        taker.broadcast(&claim).await.unwrap();
        chain.mine_until(100_600).await;

        let outcome = supervisor.refund(&mut swap).await.unwrap();
        match outcome {
            RefundOutcome::RefundFailed(SwapError::AlreadySpent { spent_by, .. }) => {
                assert_eq!(spent_by, claim.txid)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!swap.payment(PaymentRole::MakerPayment).unwrap().spent);
    }

    #[tokio::test]
    async fn test_claimed_taker_payment_is_redeemed_with_revealed_secret() {
        let base = Arc::new(SimulatedChain::with_genesis("BASE", CoinFamily::Utxo, 60, 100_000));
        let rel = Arc::new(SimulatedChain::with_genesis("REL", CoinFamily::Utxo, 60, 100_000));
        let maker_base = SimulatedWallet::new(base.clone(), "maker");
        let maker_rel = SimulatedWallet::new(rel.clone(), "maker");
        let taker_base = Arc::new(SimulatedWallet::new(base.clone(), "taker"));
        let taker_rel = Arc::new(SimulatedWallet::new(rel.clone(), "taker"));

        let confirmations = ConfirmationSettings {
            confirmations: 1,
            protected: false,
            protected_confirmations: 1,
        };
        let chains = Arc::new(ChainManager::new(Duration::from_millis(10)));
        chains.register(taker_base.clone(), confirmations);
        chains.register(taker_rel.clone(), confirmations);
        chains.start_watchers().await;

        let secret = Secret::from_bytes([7; 32]);
        let mut swap = test_swap(SwapRole::Taker);
        swap.secret_hash = secret.hash(swap.secret_hash_algo);
        swap.my_base_pubkey = taker_base.htlc_pubkey();
        swap.my_rel_pubkey = taker_rel.htlc_pubkey();
        swap.counterparty_base_pubkey = maker_base.htlc_pubkey();
        swap.counterparty_rel_pubkey = maker_rel.htlc_pubkey();
        swap.taker_locktime = 100_300;
        swap.maker_locktime = 100_600;

        let maker_payment = maker_base
            .sign(build_payment(swap.htlc_params(PaymentRole::MakerPayment, CoinFamily::Utxo)).unwrap())
            .await
            .unwrap();
        maker_base.broadcast(&maker_payment).await.unwrap();
        swap.upsert_payment(Payment::observed(PaymentRole::MakerPayment, maker_payment, 1));

        let taker_payment = taker_rel
            .sign(build_payment(swap.htlc_params(PaymentRole::TakerPayment, CoinFamily::Utxo)).unwrap())
            .await
            .unwrap();
        taker_rel.broadcast(&taker_payment).await.unwrap();
        let mut own = Payment::new(PaymentRole::TakerPayment, taker_payment, 1);
        own.broadcast = true;
        swap.upsert_payment(own);
        base.mine(1).await;
        rel.mine(1).await;

        // Maker claims after the taker gave up waiting, secret now public
        let claim = build_spend(swap.payment(PaymentRole::TakerPayment).unwrap(), &secret, &maker_rel)
            .await
            .unwrap();
        maker_rel.broadcast(&claim).await.unwrap();

        let miners = [
            base.spawn_miner(Duration::from_millis(10)),
            rel.spawn_miner(Duration::from_millis(10)),
        ];
        let supervisor = RefundSupervisor::new(
            chains,
            BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 2.0, 3),
            Duration::from_secs(5),
        );
        let outcome = supervisor.refund(&mut swap).await.unwrap();
        for miner in miners {
            miner.abort();
        }

        assert!(matches!(outcome, RefundOutcome::Redeemed));
        assert_eq!(swap.secret, Some(secret));
        let redeemed = swap.payment(PaymentRole::TakerSpend).unwrap();
        assert!(redeemed.broadcast);
        let maker_payment = swap.payment(PaymentRole::MakerPayment).unwrap();
        assert_eq!(maker_payment.spent_by.as_deref(), Some(redeemed.txid.as_str()));
        assert_eq!(
            swap.payment(PaymentRole::TakerPayment).unwrap().spent_by.as_deref(),
            Some(claim.txid.as_str())
        );
        assert!(matches!(
            base.find_spend(&maker_payment.txid).await.unwrap().kind,
            SpendKind::Claim { .. }
        ));
        assert!(swap.payment(PaymentRole::TakerRefund).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refund_is_rejected() {
        let Fixture {
            chain,
            supervisor,
            mut swap,
            ..
        } = fixture().await;
        let mut copy = swap.clone();
        let supervisor = Arc::new(supervisor);

        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.refund(&mut swap).await.map(|_| swap) })
        };
        while !supervisor.is_running(copy.uuid) {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            supervisor.refund(&mut copy).await,
            Err(SwapError::Refund(_))
        ));
        assert!(supervisor.nudge(copy.uuid));

        let miner = chain.spawn_miner(Duration::from_millis(10));
        let swap = first.await.unwrap().unwrap();
        miner.abort();
        assert!(swap.payment(PaymentRole::MakerPayment).unwrap().spent);
        assert_eq!(supervisor.invocation_count(swap.uuid), 2);
    }
}
