//! Payment orchestrator - drives one swap from `Started` to a terminal state
//!
//! Every swap runs in its own task. A step performs the side effects of the
//! current state and commits the next one; a commit is durable in the swap
//! store before it is treated as done, so a restarted engine resumes from
//! the last committed state without replaying anything.
//!
//! Maker and taker share the state names but not their meaning, see
//! `maker.rs` and `taker.rs`. The waits both roles use live in `wait.rs`.

mod maker;
mod taker;
mod wait;

use crate::chain::{ChainManager, ChainWatcher, CoinAdapter, TxStatus};
use crate::config::EngineConfig;
use crate::error::{SwapError, SwapResult};
use crate::events::SwapStatusEvent;
use crate::negotiation::{NegotiationManager, SwapMessage, SwapMessenger, SwapTransport};
use crate::refund::{RefundOutcome, RefundSupervisor};
use crate::store::{SwapStore, TransitionRecord};
use crate::swap::{
    ErrorRecord, FailedStep, PaymentRole, Swap, SwapRole, SwapSnapshot, SwapState,
};
use crate::tx::{with_backoff, BackoffPolicy};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared services every orchestrator uses
pub struct SwapContext {
    pub chains: Arc<ChainManager>,
    pub store: Arc<dyn SwapStore>,
    pub transport: Arc<dyn SwapTransport>,
    pub refunds: Arc<RefundSupervisor>,
    pub negotiation: Arc<NegotiationManager>,
    pub events: broadcast::Sender<SwapStatusEvent>,
    /// Latest committed view of every swap this process has run
    pub snapshots: Arc<DashMap<Uuid, SwapSnapshot>>,
    pub config: EngineConfig,
    pub backoff: BackoffPolicy,
}

/// Requests from the engine to a running swap
#[derive(Debug)]
pub enum SwapControl {
    Cancel {
        reply: oneshot::Sender<SwapResult<()>>,
    },
}

/// Engine-side handle of a running swap task
pub struct SwapHandle {
    uuid: Uuid,
    control: mpsc::Sender<SwapControl>,
    join: JoinHandle<()>,
}

impl SwapHandle {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Ask the swap to cancel; refused once it may have broadcast anything
    pub async fn cancel(&self) -> SwapResult<()> {
        let (reply, answer) = oneshot::channel();
        self.control
            .send(SwapControl::Cancel { reply })
            .await
            .map_err(|_| SwapError::Internal(format!("swap {} task has stopped", self.uuid)))?;
        answer
            .await
            .map_err(|_| SwapError::Internal(format!("swap {} dropped the cancel request", self.uuid)))?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                error!("Swap {} task panicked: {}", self.uuid, e);
            }
        }
    }
}

/// Why a step did not complete
#[derive(Debug)]
pub(crate) enum StepError {
    /// The step failed; the swap moves to its failure or refund state
    Failed { step: FailedStep, error: SwapError },
    /// A transition could not be persisted; stop and resume later
    Halt(SwapError),
}

pub(crate) type StepResult<T = ()> = Result<T, StepError>;

trait AtStep<T> {
    fn at(self, step: FailedStep) -> StepResult<T>;
}

impl<T> AtStep<T> for SwapResult<T> {
    fn at(self, step: FailedStep) -> StepResult<T> {
        self.map_err(|error| StepError::Failed { step, error })
    }
}

/// Runs one swap
pub struct SwapOrchestrator {
    swap: Swap,
    ctx: Arc<SwapContext>,
    messenger: Arc<dyn SwapMessenger>,
    base: Arc<ChainWatcher>,
    rel: Arc<ChainWatcher>,
    base_coin: Arc<dyn CoinAdapter>,
    rel_coin: Arc<dyn CoinAdapter>,
}

impl SwapOrchestrator {
    fn new(swap: Swap, ctx: Arc<SwapContext>) -> SwapResult<Self> {
        let base = ctx.chains.watcher(&swap.base_coin)?;
        let rel = ctx.chains.watcher(&swap.rel_coin)?;
        let messenger = ctx.transport.connect(swap.uuid, swap.role);
        Ok(Self {
            base_coin: base.coin(),
            rel_coin: rel.coin(),
            base,
            rel,
            messenger,
            swap,
            ctx,
        })
    }

    /// Persist a new swap and start running it
    pub async fn create(swap: Swap, ctx: Arc<SwapContext>) -> SwapResult<SwapHandle> {
        if swap.sequence != 0 || swap.state != SwapState::Started {
            return Err(SwapError::Internal(format!(
                "swap {} is not new ({} at sequence {})",
                swap.uuid, swap.state, swap.sequence
            )));
        }
        let orchestrator = Self::new(swap, ctx)?;
        orchestrator.persist(&orchestrator.swap).await?;
        crate::metrics::record_swap_started(&format!("{:?}", orchestrator.swap.role).to_lowercase());
        info!(
            "Swap {} created as {:?}: {} {} for {} {}",
            orchestrator.swap.uuid,
            orchestrator.swap.role,
            orchestrator.swap.maker_amount(),
            orchestrator.swap.base_coin,
            orchestrator.swap.taker_amount(),
            orchestrator.swap.rel_coin
        );
        Ok(orchestrator.spawn())
    }

    /// Continue a swap loaded from the store
    pub fn resume(swap: Swap, ctx: Arc<SwapContext>) -> SwapResult<SwapHandle> {
        if swap.state.is_terminal() {
            return Err(SwapError::InvalidStateTransition {
                from: swap.state.name(),
                to: "resumed".to_string(),
            });
        }
        info!(
            "Resuming swap {} in {} (sequence {})",
            swap.uuid, swap.state, swap.sequence
        );
        Ok(Self::new(swap, ctx)?.spawn())
    }

    fn spawn(self) -> SwapHandle {
        let uuid = self.swap.uuid;
        let (control, requests) = mpsc::channel(8);
        self.publish();
        let join = tokio::spawn(self.run(requests));
        SwapHandle { uuid, control, join }
    }

    async fn run(mut self, mut control: mpsc::Receiver<SwapControl>) {
        let uuid = self.swap.uuid;

        while !self.swap.state.is_terminal() {
            while let Ok(request) = control.try_recv() {
                if let Err(e) = self.handle_control(request).await {
                    return self.halt(e);
                }
            }
            if self.swap.state.is_terminal() {
                break;
            }

            // The taker's fee broadcast must finish once started
            let cancelable = self.swap.state.is_cancelable()
                && !(self.swap.role == SwapRole::Taker && self.swap.state == SwapState::Negotiated);

            let outcome = if cancelable {
                tokio::select! {
                    outcome = self.step() => outcome,
                    Some(request) = control.recv() => self.handle_control(request).await,
                }
            } else {
                self.step().await
            };

            let outcome = match outcome {
                Err(StepError::Failed { step, error }) => self.fail(step, error).await,
                other => other,
            };
            if let Err(e) = outcome {
                return self.halt(e);
            }
        }

        info!("Swap {} finished in {}", uuid, self.swap.state);
        self.ctx.transport.release(uuid, self.swap.role);
    }

    fn halt(&self, error: StepError) {
        let error = match error {
            StepError::Halt(e) => e,
            StepError::Failed { error, .. } => error,
        };
        error!(
            "Swap {} stopped in {} (sequence {}): {}",
            self.swap.uuid, self.swap.state, self.swap.sequence, error
        );
    }

    async fn handle_control(&mut self, request: SwapControl) -> StepResult {
        match request {
            SwapControl::Cancel { reply } => {
                // A signed payment may already be on its way to the chain
                let signed_any = self.swap.payments.iter().any(|p| p.role.owner() == self.swap.role);
                let step = match self.swap.state {
                    _ if signed_any => None,
                    SwapState::Started => Some(FailedStep::Start),
                    SwapState::Negotiated => Some(FailedStep::Negotiate),
                    _ => None,
                };
                let Some(step) = step else {
                    let _ = reply.send(Err(SwapError::NotCancelable {
                        uuid: self.swap.uuid,
                        state: self.swap.state.name(),
                    }));
                    return Ok(());
                };

                info!("Swap {} cancelled in {}", self.swap.uuid, self.swap.state);
                self.swap.error = Some(ErrorRecord::new(Some(step), &SwapError::Cancelled));
                let committed = self.commit(SwapState::Failed(step)).await;
                let _ = reply.send(match &committed {
                    Ok(()) => Ok(()),
                    Err(_) => Err(SwapError::Internal("cancel could not be persisted".into())),
                });
                committed
            }
        }
    }

    /// Run the side effects of the current state and commit the next one
    async fn step(&mut self) -> StepResult {
        match self.swap.state {
            SwapState::MakerPaymentWaitRefund => self.refund().await,
            SwapState::MakerPaymentSpent => self.commit(SwapState::Finished).await,
            _ => match self.swap.role {
                SwapRole::Maker => self.maker_step().await,
                SwapRole::Taker => self.taker_step().await,
            },
        }
    }

    async fn refund(&mut self) -> StepResult {
        let refunds = self.ctx.refunds.clone();
        let outcome = refunds.refund(&mut self.swap).await;
        let cause = self.swap.error.as_ref().and_then(|e| e.step);

        match outcome {
            Ok(RefundOutcome::Refunded) => self.commit(SwapState::MakerPaymentRefunded).await,
            Ok(RefundOutcome::Redeemed) => {
                info!("Swap {}: settled with the revealed secret instead of refunding", self.swap.uuid);
                self.commit(SwapState::MakerPaymentSpent).await
            }
            Ok(RefundOutcome::RefundFailed(e)) | Err(e) => {
                error!("Swap {}: refund failed: {}", self.swap.uuid, e);
                self.swap.error = Some(ErrorRecord::new(cause, &e));
                self.commit(SwapState::MakerPaymentRefundFailed).await
            }
        }
    }

    /// Route a failed step to its failure state, or to the refund path
    /// when our own funds are locked
    async fn fail(&mut self, step: FailedStep, error: SwapError) -> StepResult {
        self.reconcile_broadcasts().await;

        if error.should_alert() {
            error!("Swap {}: {} failed: {}", self.swap.uuid, step.name(), error);
        } else {
            warn!("Swap {}: {} failed: {}", self.swap.uuid, step.name(), error);
        }

        let mut record = ErrorRecord::new(Some(step), &error);
        if let Some(coin) = record.coin.clone() {
            if let Ok(watcher) = self.ctx.chains.watcher(&coin) {
                record = record.with_height(watcher.latest_tip().await.ok().map(|t| t.height));
            }
        }
        self.swap.error = Some(record);

        // The taker's payment is already claimed once it spends the maker payment
        let nothing_to_refund =
            self.swap.role == SwapRole::Taker && step == FailedStep::MakerPaymentSpend;
        let next = if !nothing_to_refund
            && !self.swap.own_locked_payments().is_empty()
            && self.swap.state.can_transition_to(SwapState::MakerPaymentWaitRefund)
        {
            SwapState::MakerPaymentWaitRefund
        } else {
            SwapState::Failed(step)
        };
        self.commit(next).await
    }

    /// Own payments signed but not known to be broadcast may still have
    /// reached the chain; find out before deciding whether to refund
    async fn reconcile_broadcasts(&mut self) {
        let role = self.swap.role;
        for payment in self.swap.payments.iter_mut() {
            if payment.broadcast || !payment.role.is_htlc() || payment.role.owner() != role {
                continue;
            }
            let coin = if payment.coin == self.swap.base_coin {
                &self.base_coin
            } else {
                &self.rel_coin
            };
            match coin.tx_status(&payment.txid).await {
                Ok(TxStatus::Unknown) => {}
                Ok(_) => {
                    warn!("{:?} {} reached {} after all", payment.role, payment.txid, payment.coin);
                    payment.broadcast = true;
                }
                Err(e) => warn!("Cannot check {:?} {}: {}", payment.role, payment.txid, e),
            }
        }
    }

    /// Persist the next state, then make it current
    async fn commit(&mut self, next: SwapState) -> StepResult {
        let from = self.swap.state;
        if !from.can_transition_to(next) {
            return Err(StepError::Halt(SwapError::InvalidStateTransition {
                from: from.name(),
                to: next.name(),
            }));
        }

        let mut updated = self.swap.clone();
        updated.state = next;
        updated.sequence += 1;
        updated.updated_at = Utc::now();
        self.persist(&updated).await.map_err(StepError::Halt)?;
        self.swap = updated;

        info!(
            "Swap {} ({:?}): {} -> {} (sequence {})",
            self.swap.uuid, self.swap.role, from, next, self.swap.sequence
        );
        crate::metrics::record_transition(&next.name());
        self.publish();
        if next.is_terminal() {
            self.record_outcome();
        }
        Ok(())
    }

    /// Persist the current state with new payment data
    async fn checkpoint(&mut self) -> StepResult {
        let mut updated = self.swap.clone();
        updated.sequence += 1;
        updated.updated_at = Utc::now();
        self.persist(&updated).await.map_err(StepError::Halt)?;
        self.swap = updated;
        debug!(
            "Swap {}: checkpoint in {} (sequence {})",
            self.swap.uuid, self.swap.state, self.swap.sequence
        );
        Ok(())
    }

    async fn persist(&self, swap: &Swap) -> SwapResult<()> {
        let record = TransitionRecord::of(swap);
        let store = &self.ctx.store;
        with_backoff(&self.ctx.backoff, "swap store append", || {
            store.append(swap.uuid, &record)
        })
        .await
    }

    fn publish(&self) {
        self.ctx.snapshots.insert(self.swap.uuid, self.swap.snapshot());
        // No subscribers is fine
        let _ = self.ctx.events.send(SwapStatusEvent::of(&self.swap));
    }

    fn record_outcome(&self) {
        let secs = (Utc::now() - self.swap.created_at).num_seconds().max(0) as f64;
        let outcome = match self.swap.state {
            SwapState::Finished => {
                crate::metrics::record_swap_finished();
                "finished"
            }
            SwapState::Failed(step) => {
                crate::metrics::record_swap_failed(step);
                "failed"
            }
            SwapState::MakerPaymentRefunded => {
                crate::metrics::record_swap_refunded();
                "refunded"
            }
            _ => {
                crate::metrics::record_swap_refund_failed();
                "refund_failed"
            }
        };
        crate::metrics::record_swap_duration(outcome, secs);
    }

    fn watcher_for(&self, coin: &str) -> &Arc<ChainWatcher> {
        if coin == self.swap.base_coin {
            &self.base
        } else {
            &self.rel
        }
    }

    fn coin_for(&self, coin: &str) -> &Arc<dyn CoinAdapter> {
        if coin == self.swap.base_coin {
            &self.base_coin
        } else {
            &self.rel_coin
        }
    }

    /// Confirmation threshold for a transaction on `coin`
    fn threshold(&self, coin: &str) -> u64 {
        if coin == self.swap.base_coin {
            self.swap.base_confirmations.threshold()
        } else {
            self.swap.rel_confirmations.threshold()
        }
    }

    /// Payment message the counterparty may still be waiting for
    fn outgoing(&self) -> Option<SwapMessage> {
        let sent = |role: PaymentRole| self.swap.payment(role).filter(|p| p.broadcast).map(|p| p.tx.clone());
        match self.swap.role {
            SwapRole::Maker => sent(PaymentRole::MakerPayment).map(|tx| SwapMessage::MakerPayment { tx }),
            SwapRole::Taker => sent(PaymentRole::TakerPayment)
                .map(|tx| SwapMessage::TakerPayment { tx })
                .or_else(|| sent(PaymentRole::TakerFee).map(|tx| SwapMessage::TakerFee { tx })),
        }
    }

    async fn resend(&self) {
        if let Some(message) = self.outgoing() {
            if let Err(e) = self.messenger.send(message).await {
                debug!("Swap {}: resend failed: {}", self.swap.uuid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_tags_errors_with_step() {
        let result: SwapResult<()> = Err(SwapError::Validation("amount mismatch".into()));
        match result.at(FailedStep::TakerFeeValidate) {
            Err(StepError::Failed { step, error }) => {
                assert_eq!(step, FailedStep::TakerFeeValidate);
                assert!(matches!(error, SwapError::Validation(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
