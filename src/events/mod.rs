//! Outbound swap status events
//!
//! Published after every committed transition for display; subscribers
//! get a copy and have no way back into the swap.

use crate::swap::{ErrorRecord, PaymentRole, Swap, SwapRole, SwapState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transaction attached to a status event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTx {
    pub role: PaymentRole,
    pub coin: String,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapStatusEvent {
    pub uuid: Uuid,
    pub role: SwapRole,
    pub state: SwapState,
    pub state_name: String,
    pub is_terminal: bool,
    pub sequence: u64,
    pub txs: Vec<EventTx>,
    pub error: Option<ErrorRecord>,
    pub timestamp: DateTime<Utc>,
}

impl SwapStatusEvent {
    pub fn of(swap: &Swap) -> Self {
        Self {
            uuid: swap.uuid,
            role: swap.role,
            state: swap.state,
            state_name: swap.state.name(),
            is_terminal: swap.state.is_terminal(),
            sequence: swap.sequence,
            txs: swap
                .payments
                .iter()
                .filter(|p| p.broadcast)
                .map(|p| EventTx {
                    role: p.role,
                    coin: p.coin.clone(),
                    txid: p.txid.clone(),
                })
                .collect(),
            error: swap.error.clone(),
            timestamp: swap.updated_at,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.state,
            SwapState::Failed(_) | SwapState::MakerPaymentRefundFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{test_swap, FailedStep};

    #[test]
    fn test_event_carries_state_and_error() {
        let mut swap = test_swap(SwapRole::Taker);
        swap.state = SwapState::Failed(FailedStep::Negotiate);
        swap.error = Some(ErrorRecord::new(
            Some(FailedStep::Negotiate),
            &crate::error::SwapError::Negotiation("no answer".into()),
        ));

        let event = SwapStatusEvent::of(&swap);
        assert_eq!(event.state_name, "NegotiateFailed");
        assert!(event.is_terminal);
        assert!(event.is_failure());
        assert!(event.txs.is_empty());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error"]["kind"], "negotiation");
    }
}
