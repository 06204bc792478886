//! Maker side of a swap
//!
//! The maker holds the secret. It locks the base coin only after the taker
//! fee is on chain, claims the taker payment with the secret and then waits
//! for the taker to use the revealed secret on the maker payment.

use super::{AtStep, StepError, StepResult, SwapOrchestrator};
use crate::chain::SpendKind;
use crate::error::SwapError;
use crate::htlc::build_spend;
use crate::negotiation::SwapTerms;
use crate::swap::{FailedStep, Payment, PaymentRole, SwapState};
use crate::tx::broadcast_with_retry;

use tracing::{info, warn};

impl SwapOrchestrator {
    pub(super) async fn maker_step(&mut self) -> StepResult {
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
                    .respond(&terms, &self.rel, self.messenger.as_ref())
                    .await
                    .at(FailedStep::Negotiate)?;
                self.swap.apply_negotiation(record);
                self.commit(SwapState::Negotiated).await
            }
            SwapState::Negotiated => {
                self.wait_payment_message(
                    PaymentRole::TakerFee,
                    FailedStep::TakerFeeSend,
                    FailedStep::TakerFeeValidate,
                )
                .await?;
                self.commit(SwapState::TakerFeeSent).await
            }
            SwapState::TakerFeeSent => {
                self.send_own_payment(PaymentRole::MakerPayment, FailedStep::MakerPaymentTransaction)
                    .await?;
                self.commit(SwapState::MakerPaymentReceived).await
            }
            SwapState::MakerPaymentReceived => {
                let message = self
                    .outgoing()
                    .ok_or_else(|| self.missing(PaymentRole::MakerPayment))
                    .at(FailedStep::MakerPaymentDataSend)?;
                self.messenger
                    .send(message)
                    .await
                    .at(FailedStep::MakerPaymentDataSend)?;
                self.commit(SwapState::MakerPaymentWaitConfirm).await
            }
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
                self.wait_payment_message(
                    PaymentRole::TakerPayment,
                    FailedStep::TakerPaymentTransaction,
                    FailedStep::TakerPaymentValidate,
                )
                .await?;
                self.commit(SwapState::TakerPaymentSent).await
            }
            SwapState::TakerPaymentSent => {
                self.wait_confirmed(
                    PaymentRole::TakerPayment,
                    FailedStep::TakerPaymentWaitConfirm,
                    Some(self.stall_deadline()),
                )
                .await?;
                if !self.swap.payment(PaymentRole::MakerSpend).is_some_and(|p| p.broadcast) {
                    self.recheck_confirmed(
                        PaymentRole::TakerPayment,
                        FailedStep::TakerPaymentWaitConfirm,
                        self.stall_deadline(),
                    )
                    .await?;
                }
                self.claim_taker_payment().await?;
                self.claim_taker_fee().await;
                self.commit(SwapState::TakerPaymentSpent).await
            }
            SwapState::TakerPaymentSpent => {
                let step = FailedStep::MakerPaymentSpend;
                let spend = self
                    .wait_spend(PaymentRole::MakerPayment, step, self.maker_deadline())
                    .await?;
                if let Some(p) = self.swap.payment_mut(PaymentRole::MakerPayment) {
                    p.mark_spent(&spend.txid);
                }
                match spend.kind {
                    SpendKind::Claim { .. } => {
                        info!("Swap {}: taker claimed the maker payment in {}", self.swap.uuid, spend.txid);
                        self.commit(SwapState::MakerPaymentSpent).await
                    }
                    SpendKind::Refund => Err(StepError::Failed {
                        step,
                        error: SwapError::Internal(format!(
                            "maker payment was refunded by {} while waiting for the taker",
                            spend.txid
                        )),
                    }),
                }
            }
            state => Err(StepError::Halt(SwapError::Internal(format!(
                "maker has no step for {}",
                state
            )))),
        }
    }

    /// Reveal the secret by spending the taker payment before the taker locktime
    async fn claim_taker_payment(&mut self) -> StepResult {
        let step = FailedStep::TakerPaymentSpend;
        if self.swap.payment(PaymentRole::MakerSpend).is_none() {
            let secret = self
                .swap
                .secret
                .clone()
                .ok_or_else(|| SwapError::Internal("maker swap without a secret".to_string()))
                .at(step)?;
            let payment = self
                .swap
                .payment(PaymentRole::TakerPayment)
                .cloned()
                .ok_or_else(|| self.missing(PaymentRole::TakerPayment))
                .at(step)?;
            let tx = build_spend(&payment, &secret, self.rel_coin.as_ref())
                .await
                .at(step)?;
            self.record_signed(PaymentRole::MakerSpend, tx).await?;
        }

        self.broadcast_own(PaymentRole::MakerSpend, step, self.stall_deadline())
            .await?;

        let spent_by = self
            .swap
            .payment(PaymentRole::MakerSpend)
            .map(|p| p.txid.clone())
            .unwrap_or_default();
        info!("Swap {}: claimed taker payment in {}", self.swap.uuid, spent_by);
        if let Some(p) = self.swap.payment_mut(PaymentRole::TakerPayment) {
            p.mark_spent(&spent_by);
        }
        Ok(())
    }

    /// Claim the taker fee once the secret is public; failure only costs the fee
    async fn claim_taker_fee(&mut self) {
        if self.swap.payment(PaymentRole::TakerFeeSpend).is_some() {
            return;
        }
        let (Some(fee), Some(secret)) = (
            self.swap.payment(PaymentRole::TakerFee).cloned(),
            self.swap.secret.clone(),
        ) else {
            return;
        };

        let claimed = async {
            let tx = build_spend(&fee, &secret, self.rel_coin.as_ref()).await?;
            let txid =
                broadcast_with_retry(self.rel_coin.as_ref(), &tx, &self.ctx.backoff, None).await?;
            Ok::<_, SwapError>((tx, txid))
        }
        .await;

        match claimed {
            Ok((tx, txid)) => {
                info!("Swap {}: claimed taker fee in {}", self.swap.uuid, txid);
                let mut spend = Payment::new(PaymentRole::TakerFeeSpend, tx, self.threshold(&fee.coin));
                spend.broadcast = true;
                spend.txid = txid.clone();
                self.swap.upsert_payment(spend);
                if let Some(p) = self.swap.payment_mut(PaymentRole::TakerFee) {
                    p.mark_spent(&txid);
                }
            }
            Err(e) => warn!("Swap {}: taker fee not claimed: {}", self.swap.uuid, e),
        }
    }
}
