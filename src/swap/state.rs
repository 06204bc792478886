//! Swap state graph
//!
//! The happy path is a straight line from `Started` to `Finished`. Every
//! non-terminal state also has failure edges into `Failed(step)`, tagged with
//! the step that failed, and once the swap has funds of its own locked it
//! can enter the refund path instead. A refund that finds the secret
//! revealed settles the swap through `MakerPaymentSpent`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Step of origin of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailedStep {
    Start,
    Negotiate,
    TakerFeeSend,
    TakerFeeValidate,
    MakerPaymentTransaction,
    MakerPaymentValidate,
    MakerPaymentDataSend,
    MakerPaymentWaitConfirm,
    TakerPaymentTransaction,
    TakerPaymentValidate,
    TakerPaymentWaitConfirm,
    TakerPaymentSpend,
    MakerPaymentSpend,
}

impl FailedStep {
    pub fn name(&self) -> &'static str {
        match self {
            FailedStep::Start => "Start",
            FailedStep::Negotiate => "Negotiate",
            FailedStep::TakerFeeSend => "TakerFeeSend",
            FailedStep::TakerFeeValidate => "TakerFeeValidate",
            FailedStep::MakerPaymentTransaction => "MakerPaymentTransaction",
            FailedStep::MakerPaymentValidate => "MakerPaymentValidate",
            FailedStep::MakerPaymentDataSend => "MakerPaymentDataSend",
            FailedStep::MakerPaymentWaitConfirm => "MakerPaymentWaitConfirm",
            FailedStep::TakerPaymentTransaction => "TakerPaymentTransaction",
            FailedStep::TakerPaymentValidate => "TakerPaymentValidate",
            FailedStep::TakerPaymentWaitConfirm => "TakerPaymentWaitConfirm",
            FailedStep::TakerPaymentSpend => "TakerPaymentSpend",
            FailedStep::MakerPaymentSpend => "MakerPaymentSpend",
        }
    }
}

/// Per-swap state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "step")]
pub enum SwapState {
    Started,
    Negotiated,
    TakerFeeSent,
    MakerPaymentReceived,
    MakerPaymentWaitConfirm,
    MakerPaymentConfirmed,
    TakerPaymentSent,
    TakerPaymentSpent,
    MakerPaymentSpent,
    Finished,
    Failed(FailedStep),
    MakerPaymentWaitRefund,
    MakerPaymentRefunded,
    MakerPaymentRefundFailed,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Finished
                | SwapState::Failed(_)
                | SwapState::MakerPaymentRefunded
                | SwapState::MakerPaymentRefundFailed
        )
    }

    /// Only swaps that have not broadcast anything may be cancelled
    pub fn is_cancelable(&self) -> bool {
        matches!(self, SwapState::Started | SwapState::Negotiated)
    }

    /// Next state on the happy path
    pub fn next(&self) -> Option<SwapState> {
        use SwapState::*;
        let next = match self {
            Started => Negotiated,
            Negotiated => TakerFeeSent,
            TakerFeeSent => MakerPaymentReceived,
            MakerPaymentReceived => MakerPaymentWaitConfirm,
            MakerPaymentWaitConfirm => MakerPaymentConfirmed,
            MakerPaymentConfirmed => TakerPaymentSent,
            TakerPaymentSent => TakerPaymentSpent,
            TakerPaymentSpent => MakerPaymentSpent,
            MakerPaymentSpent => Finished,
            _ => return None,
        };
        Some(next)
    }

    /// Failure steps that may end a swap sitting in this state
    pub fn failure_steps(&self) -> &'static [FailedStep] {
        use FailedStep::*;
        match self {
            SwapState::Started => &[Start, Negotiate],
            SwapState::Negotiated => &[Negotiate, TakerFeeSend, TakerFeeValidate],
            SwapState::TakerFeeSent => &[MakerPaymentTransaction, MakerPaymentValidate],
            SwapState::MakerPaymentReceived => &[MakerPaymentDataSend],
            SwapState::MakerPaymentWaitConfirm => &[MakerPaymentWaitConfirm],
            SwapState::MakerPaymentConfirmed => {
                &[MakerPaymentWaitConfirm, TakerPaymentTransaction, TakerPaymentValidate]
            }
            SwapState::TakerPaymentSent => &[TakerPaymentWaitConfirm, TakerPaymentSpend],
            SwapState::TakerPaymentSpent => &[TakerPaymentSpend, MakerPaymentSpend],
            SwapState::MakerPaymentSpent => &[MakerPaymentSpend],
            _ => &[],
        }
    }

    /// Whether the refund path is reachable from this state
    pub fn can_enter_refund(&self) -> bool {
        !self.is_terminal() && !matches!(self, SwapState::Started | SwapState::MakerPaymentWaitRefund)
    }

    pub fn can_transition_to(&self, next: SwapState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (SwapState::MakerPaymentWaitRefund, SwapState::MakerPaymentRefunded)
            | (SwapState::MakerPaymentWaitRefund, SwapState::MakerPaymentRefundFailed)
            | (SwapState::MakerPaymentWaitRefund, SwapState::MakerPaymentSpent) => true,
            (SwapState::MakerPaymentWaitRefund, _) => false,
            (_, SwapState::MakerPaymentWaitRefund) => self.can_enter_refund(),
            (_, SwapState::Failed(step)) => self.failure_steps().contains(&step),
            (current, next) => current.next() == Some(next),
        }
    }

    pub fn name(&self) -> String {
        match self {
            SwapState::Failed(step) => format!("{}Failed", step.name()),
            other => format!("{:?}", other),
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_linear() {
        let mut state = SwapState::Started;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
        }
        assert_eq!(state, SwapState::Finished);
        assert_eq!(visited.len(), 10);
        assert!(!SwapState::Negotiated.can_transition_to(SwapState::Started));
        assert!(!SwapState::Started.can_transition_to(SwapState::TakerFeeSent));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let terminals = [
            SwapState::Finished,
            SwapState::Failed(FailedStep::Negotiate),
            SwapState::MakerPaymentRefunded,
            SwapState::MakerPaymentRefundFailed,
        ];
        for terminal in terminals {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(SwapState::MakerPaymentWaitRefund));
            assert!(!terminal.can_transition_to(SwapState::Finished));
        }
    }

    #[test]
    fn test_failure_edges_are_state_specific() {
        assert!(SwapState::TakerFeeSent
            .can_transition_to(SwapState::Failed(FailedStep::MakerPaymentTransaction)));
        assert!(!SwapState::Started
            .can_transition_to(SwapState::Failed(FailedStep::MakerPaymentTransaction)));
        assert!(SwapState::MakerPaymentConfirmed
            .can_transition_to(SwapState::Failed(FailedStep::TakerPaymentValidate)));
        // Counterparty payment reorganised out before the taker funds
        assert!(SwapState::MakerPaymentConfirmed
            .can_transition_to(SwapState::Failed(FailedStep::MakerPaymentWaitConfirm)));
    }

    #[test]
    fn test_refund_path() {
        assert!(!SwapState::Started.can_transition_to(SwapState::MakerPaymentWaitRefund));
        assert!(SwapState::MakerPaymentWaitConfirm.can_transition_to(SwapState::MakerPaymentWaitRefund));
        assert!(SwapState::MakerPaymentWaitRefund.can_transition_to(SwapState::MakerPaymentRefunded));
        assert!(!SwapState::MakerPaymentWaitRefund.can_transition_to(SwapState::Finished));
        assert!(SwapState::MakerPaymentWaitRefund.can_transition_to(SwapState::MakerPaymentSpent));
        assert!(SwapState::MakerPaymentSpent.can_transition_to(SwapState::Finished));
        assert!(!SwapState::MakerPaymentWaitRefund.is_cancelable());
    }

    #[test]
    fn test_failed_state_names() {
        assert_eq!(
            SwapState::Failed(FailedStep::MakerPaymentTransaction).to_string(),
            "MakerPaymentTransactionFailed"
        );
        assert_eq!(SwapState::MakerPaymentWaitRefund.to_string(), "MakerPaymentWaitRefund");
    }

    #[test]
    fn test_state_serialization_is_tagged() {
        let json = serde_json::to_string(&SwapState::Failed(FailedStep::Start)).unwrap();
        assert_eq!(json, r#"{"state":"Failed","step":"Start"}"#);
        let back: SwapState = serde_json::from_str(r#"{"state":"Finished"}"#).unwrap();
        assert_eq!(back, SwapState::Finished);
    }
}
