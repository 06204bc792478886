//! Waits shared by both roles
//!
//! Every wait is woken by chain ticks or counterparty messages, never by a
//! fixed timer, and re-checks its chain-time deadline on each wake-up.

use super::{AtStep, StepError, StepResult, SwapOrchestrator};
use crate::chain::{ChainTip, ChainWatcher, ConfirmationEvent, SpendInfo};
use crate::error::{SwapError, SwapResult};
use crate::htlc::{build_payment, validate_on_chain, validate_payment, HtlcTx};
use crate::negotiation::SwapMessage;
use crate::swap::{FailedStep, Payment, PaymentRole};
use crate::tx::{broadcast_with_retry, with_backoff, Deadline};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Chain time on one coin after which a wait gives up
pub(super) struct ChainDeadline {
    watcher: Arc<ChainWatcher>,
    time: u64,
}

impl ChainDeadline {
    fn as_deadline(&self) -> Deadline<'_> {
        Deadline {
            watcher: self.watcher.as_ref(),
            time: self.time,
        }
    }

    async fn check(&self) -> SwapResult<()> {
        self.as_deadline().check().await
    }
}

/// Payment carried by a message, if it is the one `role` expects
fn payment_in(role: PaymentRole, message: SwapMessage) -> Option<HtlcTx> {
    match (role, message) {
        (PaymentRole::TakerFee, SwapMessage::TakerFee { tx })
        | (PaymentRole::MakerPayment, SwapMessage::MakerPayment { tx })
        | (PaymentRole::TakerPayment, SwapMessage::TakerPayment { tx }) => Some(tx),
        _ => None,
    }
}

impl SwapOrchestrator {
    /// Latest chain time at which a new payment may go out
    pub(super) fn funding_deadline(&self) -> ChainDeadline {
        ChainDeadline {
            watcher: self.rel.clone(),
            time: self.swap.funding_deadline(),
        }
    }

    /// Taker locktime: past it the taker may refund its payment
    pub(super) fn stall_deadline(&self) -> ChainDeadline {
        ChainDeadline {
            watcher: self.rel.clone(),
            time: self.swap.stall_deadline(),
        }
    }

    /// Maker locktime on the maker coin
    pub(super) fn maker_deadline(&self) -> ChainDeadline {
        ChainDeadline {
            watcher: self.base.clone(),
            time: self.swap.maker_locktime,
        }
    }

    /// Coin a transaction of this role is made on
    pub(super) fn payment_coin(&self, role: PaymentRole) -> String {
        match role {
            PaymentRole::MakerPayment | PaymentRole::TakerSpend | PaymentRole::MakerRefund => {
                self.swap.base_coin.clone()
            }
            _ => self.swap.rel_coin.clone(),
        }
    }

    pub(super) fn missing(&self, role: PaymentRole) -> SwapError {
        SwapError::Internal(format!("swap {} has no {:?}", self.swap.uuid, role))
    }

    /// Build, sign and broadcast one of our HTLC payments before the funding deadline
    pub(super) async fn send_own_payment(&mut self, role: PaymentRole, step: FailedStep) -> StepResult {
        if self.swap.payment(role).is_none() {
            let coin = self.coin_for(&self.payment_coin(role)).clone();
            let tx = build_payment(self.swap.htlc_params(role, coin.family())).at(step)?;
            let tx = coin.sign(tx).await.at(step)?;
            self.record_signed(role, tx).await?;
        }
        self.broadcast_own(role, step, self.funding_deadline()).await
    }

    /// Keep a signed transaction so a resumed swap broadcasts the same one
    pub(super) async fn record_signed(&mut self, role: PaymentRole, tx: HtlcTx) -> StepResult {
        let required = self.threshold(&tx.params.coin);
        debug!("Swap {}: signed {:?} {}", self.swap.uuid, role, tx.txid);
        self.swap.upsert_payment(Payment::new(role, tx, required));
        self.checkpoint().await
    }

    /// Broadcast a recorded transaction of ours, retrying until `deadline`
    pub(super) async fn broadcast_own(
        &mut self,
        role: PaymentRole,
        step: FailedStep,
        deadline: ChainDeadline,
    ) -> StepResult {
        let payment = self.swap.payment(role).cloned().ok_or_else(|| self.missing(role)).at(step)?;
        if payment.broadcast {
            return Ok(());
        }

        let coin = self.coin_for(&payment.coin).clone();
        let height = self
            .watcher_for(&payment.coin)
            .latest_tip()
            .await
            .ok()
            .map(|tip| tip.height);
        let txid = broadcast_with_retry(
            coin.as_ref(),
            &payment.tx,
            &self.ctx.backoff,
            Some(deadline.as_deadline()),
        )
        .await
        .at(step)?;

        if let Some(p) = self.swap.payment_mut(role) {
            p.broadcast = true;
            p.txid = txid;
            p.broadcast_height = height;
        }
        Ok(())
    }

    /// Wait for the counterparty's payment message, then for the chain to
    /// carry that txid; both the message copy and the on-chain transaction
    /// must match the negotiated parameters
    pub(super) async fn wait_payment_message(
        &mut self,
        role: PaymentRole,
        timeout_step: FailedStep,
        validate_step: FailedStep,
    ) -> StepResult {
        if self.swap.payment(role).is_some_and(|p| p.broadcast) {
            return Ok(());
        }

        let coin_name = self.payment_coin(role);
        let coin = self.coin_for(&coin_name).clone();
        let expected = self.swap.htlc_params(role, coin.family());
        let required = self.threshold(&coin_name);
        let deadline = self.funding_deadline();
        let mut ticks = self.rel.subscribe_ticks();
        let mut received: Option<HtlcTx> = None;

        loop {
            deadline.check().await.at(timeout_step)?;

            if let Some(tx) = &received {
                match coin.fetch_payment(&tx.txid).await {
                    Ok(None) => debug!("{:?} {} not on {} yet", role, tx.txid, coin_name),
                    Ok(Some(found)) => {
                        validate_on_chain(&found, &expected).at(validate_step)?;
                        info!("Swap {}: received {:?} {}", self.swap.uuid, role, tx.txid);
                        self.swap.upsert_payment(Payment::observed(role, tx.clone(), required));
                        return Ok(());
                    }
                    Err(e @ SwapError::Validation(_)) => return Err(e).at(validate_step),
                    Err(e) => warn!("Cannot look up {} on {}: {}", tx.txid, coin_name, e),
                }
            }

            tokio::select! {
                message = self.messenger.recv() => match message {
                    Ok(message) => {
                        let name = message.name();
                        match payment_in(role, message) {
                            Some(tx) if received.as_ref().is_some_and(|r| r.txid == tx.txid) => {}
                            Some(tx) => {
                                validate_payment(&tx, &expected).at(validate_step)?;
                                received = Some(tx);
                            }
                            None => debug!("Swap {}: ignoring {} while waiting for {:?}", self.swap.uuid, name, role),
                        }
                    }
                    Err(e) => {
                        warn!("Swap {}: messenger error: {}", self.swap.uuid, e);
                        tokio::time::sleep(self.ctx.config.poll_interval()).await;
                    }
                },
                tick = ticks.recv() => self.on_tick(tick).await,
            }
        }
    }

    /// Wait until a payment reaches its confirmation threshold.
    ///
    /// Fails once `deadline` passes on chain or the wall-clock confirmation
    /// budget runs out. Our own payments are rebroadcast after a reorg.
    pub(super) async fn wait_confirmed(
        &mut self,
        role: PaymentRole,
        step: FailedStep,
        deadline: Option<ChainDeadline>,
    ) -> StepResult {
        let payment = self.swap.payment(role).cloned().ok_or_else(|| self.missing(role)).at(step)?;
        if payment.is_confirmed() {
            return Ok(());
        }

        let watcher = self.watcher_for(&payment.coin).clone();
        let coin = self.coin_for(&payment.coin).clone();
        let own = role.owner() == self.swap.role;
        let max_wait = self.ctx.config.max_confirmation_wait();
        let started = Instant::now();
        let mut stream = watcher.observe(&payment.txid, payment.required_confirmations).await;
        let mut ticks = self.rel.subscribe_ticks();

        loop {
            if let Some(deadline) = &deadline {
                deadline.check().await.at(step)?;
            }
            let Some(remaining) = max_wait.checked_sub(started.elapsed()) else {
                return Err(SwapError::ConfirmationTimeout {
                    coin: payment.coin.clone(),
                    txid: payment.txid.clone(),
                    waited_secs: max_wait.as_secs(),
                })
                .at(step);
            };

            tokio::select! {
                event = stream.next() => match event {
                    Some(ConfirmationEvent::Confirmed { confirmations, height }) => {
                        self.update_confirmations(role, confirmations, height);
                        info!(
                            "Swap {}: {:?} {} confirmed ({} confirmations)",
                            self.swap.uuid, role, payment.txid, confirmations
                        );
                        return Ok(());
                    }
                    Some(ConfirmationEvent::Progress { confirmations, height, .. }) => {
                        self.update_confirmations(role, confirmations, height);
                    }
                    Some(ConfirmationEvent::Regressed { previous, confirmations }) => {
                        warn!(
                            "Swap {}: {:?} {} fell from {} to {} confirmations",
                            self.swap.uuid, role, payment.txid, previous, confirmations
                        );
                        self.update_confirmations(role, confirmations, None);
                        if own {
                            if let Err(e) = coin.broadcast(&payment.tx).await {
                                warn!("Rebroadcast of {} failed: {}", payment.txid, e);
                            }
                        }
                    }
                    Some(ConfirmationEvent::Pending) => {
                        debug!("Swap {}: {:?} {} pending", self.swap.uuid, role, payment.txid);
                    }
                    None => {
                        stream = watcher.observe(&payment.txid, payment.required_confirmations).await;
                    }
                },
                tick = ticks.recv() => self.on_tick(tick).await,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Re-read the depth of a counterparty payment right before acting on it.
    ///
    /// A payment that lost confirmations since it was counted as confirmed
    /// has to reach its threshold again before `deadline`, otherwise the
    /// step fails with a reorg error.
    pub(super) async fn recheck_confirmed(
        &mut self,
        role: PaymentRole,
        step: FailedStep,
        deadline: ChainDeadline,
    ) -> StepResult {
        let payment = self.swap.payment(role).cloned().ok_or_else(|| self.missing(role)).at(step)?;
        let watcher = self.watcher_for(&payment.coin).clone();
        let depth = with_backoff(&self.ctx.backoff, "confirmation recheck", || {
            watcher.confirmations(&payment.txid)
        })
        .await
        .at(step)?;
        if depth >= payment.required_confirmations {
            return Ok(());
        }

        warn!(
            "Swap {}: {:?} {} fell from {} to {} confirmations before use",
            self.swap.uuid, role, payment.txid, payment.confirmations, depth
        );
        crate::metrics::record_confirmation_regression(&payment.coin);
        self.update_confirmations(role, depth, None);

        match self.wait_confirmed(role, step, Some(deadline)).await {
            Err(StepError::Failed { step, error }) => {
                warn!("Swap {}: {:?} did not recover: {}", self.swap.uuid, role, error);
                Err(StepError::Failed {
                    step,
                    error: SwapError::ReorgDetected {
                        coin: payment.coin.clone(),
                        txid: payment.txid.clone(),
                        confirmations: depth,
                    },
                })
            }
            other => other,
        }
    }

    fn update_confirmations(&mut self, role: PaymentRole, confirmations: u64, height: Option<u64>) {
        if let Some(p) = self.swap.payment_mut(role) {
            p.confirmations = confirmations;
            if p.broadcast_height.is_none() {
                p.broadcast_height = height;
            }
        }
    }

    /// Wait until a payment's output is spent, up to `deadline`
    pub(super) async fn wait_spend(
        &self,
        role: PaymentRole,
        step: FailedStep,
        deadline: ChainDeadline,
    ) -> StepResult<SpendInfo> {
        let payment = self.swap.payment(role).cloned().ok_or_else(|| self.missing(role)).at(step)?;
        let coin = self.coin_for(&payment.coin).clone();
        let mut ticks = self.watcher_for(&payment.coin).subscribe_ticks();

        loop {
            match coin.find_spend(&payment).await {
                Ok(Some(spend)) => return Ok(spend),
                Ok(None) => {}
                Err(e) => warn!("Spend lookup for {} failed: {}", payment.txid, e),
            }
            if let Err(e) = deadline.check().await {
                // The block that crossed the deadline may carry the spend
                if let Ok(Some(spend)) = coin.find_spend(&payment).await {
                    return Ok(spend);
                }
                return Err(e).at(step);
            }
            self.next_tick(&mut ticks).await;
        }
    }

    async fn next_tick(&self, ticks: &mut broadcast::Receiver<ChainTip>) {
        if let Err(RecvError::Closed) = ticks.recv().await {
            tokio::time::sleep(self.ctx.config.poll_interval()).await;
        }
    }

    /// Re-send our latest payment message on every rel tick
    async fn on_tick(&self, tick: Result<ChainTip, RecvError>) {
        match tick {
            Err(RecvError::Closed) => tokio::time::sleep(self.ctx.config.poll_interval()).await,
            _ => self.resend().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoinFamily;
    use crate::htlc::{HtlcParams, SecretHashAlgo};

    fn tx() -> HtlcTx {
        build_payment(HtlcParams {
            coin: "REL".into(),
            family: CoinFamily::Account,
            secret_hash: [4; 32],
            secret_hash_algo: SecretHashAlgo::Sha256,
            recipient_pubkey: vec![1; 20],
            refund_pubkey: vec![2; 20],
            locktime: 1_000,
            amount: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_payment_in_matches_expected_role_only() {
        assert!(payment_in(PaymentRole::TakerFee, SwapMessage::TakerFee { tx: tx() }).is_some());
        assert!(payment_in(PaymentRole::TakerPayment, SwapMessage::TakerFee { tx: tx() }).is_none());
        assert!(payment_in(
            PaymentRole::MakerPayment,
            SwapMessage::Reject {
                reason: "busy".into()
            }
        )
        .is_none());
    }
}
