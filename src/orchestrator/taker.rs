//! Taker side of a swap
//!
//! The taker proposes the locktimes, pays the fee, and funds its payment
//! only once the maker payment is confirmed. It learns the secret from the
//! maker's claim and uses it on the maker payment before the maker locktime.

use super::{AtStep, StepError, StepResult, SwapOrchestrator};
use crate::chain::SpendKind;
use crate::error::SwapError;
use crate::htlc::build_spend;
use crate::negotiation::SwapTerms;
use crate::swap::{FailedStep, PaymentRole, SwapState};

use tracing::{info, warn};

impl SwapOrchestrator {
    pub(super) async fn taker_step(&mut self) -> StepResult {
        match self.swap.state {
            SwapState::Started => {
                let terms = SwapTerms::from_swap(
                    &self.swap,
                    self.base_coin.family(),
                    self.rel_coin.family(),
                );
                let record = self
                    .ctx
                    .negotiation
                    .propose(&terms, &self.rel, self.messenger.as_ref())
                    .await
                    .at(FailedStep::Negotiate)?;
                self.swap.apply_negotiation(record);
                self.commit(SwapState::Negotiated).await
            }
            SwapState::Negotiated => {
                self.send_own_payment(PaymentRole::TakerFee, FailedStep::TakerFeeSend)
                    .await?;
                self.announce().await;
                self.commit(SwapState::TakerFeeSent).await
            }
            SwapState::TakerFeeSent => {
                self.wait_payment_message(
                    PaymentRole::MakerPayment,
                    FailedStep::MakerPaymentTransaction,
                    FailedStep::MakerPaymentValidate,
                )
                .await?;
                self.commit(SwapState::MakerPaymentReceived).await
            }
            SwapState::MakerPaymentReceived => self.commit(SwapState::MakerPaymentWaitConfirm).await,
            SwapState::MakerPaymentWaitConfirm => {
                self.wait_confirmed(
                    PaymentRole::MakerPayment,
                    FailedStep::MakerPaymentWaitConfirm,
                    Some(self.funding_deadline()),
                )
                .await?;
                self.commit(SwapState::MakerPaymentConfirmed).await
            }
            SwapState::MakerPaymentConfirmed => {
                if !self.swap.payment(PaymentRole::TakerPayment).is_some_and(|p| p.broadcast) {
                    self.recheck_confirmed(
                        PaymentRole::MakerPayment,
                        FailedStep::MakerPaymentWaitConfirm,
                        self.funding_deadline(),
                    )
                    .await?;
                }
                self.send_own_payment(PaymentRole::TakerPayment, FailedStep::TakerPaymentTransaction)
                    .await?;
                self.announce().await;
                self.commit(SwapState::TakerPaymentSent).await
            }
            SwapState::TakerPaymentSent => {
                let step = FailedStep::TakerPaymentSpend;
                self.wait_confirmed(
                    PaymentRole::TakerPayment,
                    FailedStep::TakerPaymentWaitConfirm,
                    Some(self.stall_deadline()),
                )
                .await?;
                let spend = self
                    .wait_spend(PaymentRole::TakerPayment, step, self.stall_deadline())
                    .await?;
                if let Some(p) = self.swap.payment_mut(PaymentRole::TakerPayment) {
                    p.mark_spent(&spend.txid);
                }

                match spend.kind {
                    SpendKind::Claim { secret } => {
                        if !secret.matches(self.swap.secret_hash_algo, &self.swap.secret_hash) {
                            return Err(SwapError::SecretHashMismatch).at(step);
                        }
                        info!("Swap {}: maker revealed the secret in {}", self.swap.uuid, spend.txid);
                        self.swap.secret = Some(secret);
                        self.commit(SwapState::TakerPaymentSpent).await
                    }
                    SpendKind::Refund => Err(StepError::Failed {
                        step,
                        error: SwapError::Internal(format!(
                            "taker payment was refunded by {} before the maker claimed it",
                            spend.txid
                        )),
                    }),
                }
            }
            SwapState::TakerPaymentSpent => {
                self.claim_maker_payment().await?;
                self.commit(SwapState::MakerPaymentSpent).await
            }
            state => Err(StepError::Halt(SwapError::Internal(format!(
                "taker has no step for {}",
                state
            )))),
        }
    }

    /// Send the payment message right away instead of waiting for the next tick
    async fn announce(&self) {
        if let Some(message) = self.outgoing() {
            let name = message.name();
            if let Err(e) = self.messenger.send(message).await {
                warn!("Swap {}: {} not delivered yet: {}", self.swap.uuid, name, e);
            }
        }
    }

    /// Spend the maker payment with the learned secret before the maker locktime
    async fn claim_maker_payment(&mut self) -> StepResult {
        let step = FailedStep::MakerPaymentSpend;
        if self.swap.payment(PaymentRole::TakerSpend).is_none() {
            let secret = self
                .swap
                .secret
                .clone()
                .ok_or_else(|| SwapError::Internal("secret not learned".to_string()))
                .at(step)?;
            let payment = self
                .swap
                .payment(PaymentRole::MakerPayment)
                .cloned()
                .ok_or_else(|| self.missing(PaymentRole::MakerPayment))
                .at(step)?;
            let tx = build_spend(&payment, &secret, self.base_coin.as_ref())
                .await
                .at(step)?;
            self.record_signed(PaymentRole::TakerSpend, tx).await?;
        }

        self.broadcast_own(PaymentRole::TakerSpend, step, self.maker_deadline())
            .await?;
        self.wait_confirmed(PaymentRole::TakerSpend, step, None).await?;

        let spent_by = self
            .swap
            .payment(PaymentRole::TakerSpend)
            .map(|p| p.txid.clone())
            .unwrap_or_default();
        info!("Swap {}: claimed maker payment in {}", self.swap.uuid, spent_by);
        if let Some(p) = self.swap.payment_mut(PaymentRole::MakerPayment) {
            p.mark_spent(&spent_by);
        }
        Ok(())
    }
}
