//! Confirmation tracking for watched transactions
//!
//! Chains differ in how many blocks make a payment final:
//! - Bitcoin-style chains: probabilistic, a handful of blocks
//! - Ethereum: probabilistic in practice, tens of blocks
//! - Instant-finality chains: a single block
//!
//! A tracker turns successive (tip, status) observations into confirmation
//! events and reports a regression whenever a transaction loses
//! confirmations, which is what a reorganisation looks like from outside.

use crate::config::CoinFamily;

use serde::{Deserialize, Serialize};

/// Inclusion state of a transaction as reported by a coin backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Unknown,
    Mempool,
    Included { height: u64 },
}

impl TxStatus {
    /// Depth of the transaction when the chain tip is at `tip_height`
    pub fn confirmations(&self, tip_height: u64) -> u64 {
        match self {
            TxStatus::Included { height } => tip_height.saturating_sub(*height) + 1,
            TxStatus::Unknown | TxStatus::Mempool => 0,
        }
    }
}

/// Update on a watched transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationEvent {
    /// Not yet seen by the backend
    Pending,
    Progress {
        confirmations: u64,
        required: u64,
        height: Option<u64>,
    },
    /// Fewer confirmations than previously observed
    Regressed { previous: u64, confirmations: u64 },
    Confirmed { confirmations: u64, height: Option<u64> },
}

/// Per-transaction confirmation state
#[derive(Debug, Clone)]
pub struct ConfirmationTracker {
    required: u64,
    confirmations: u64,
    height: Option<u64>,
    seen: bool,
    announced_pending: bool,
    confirmed: bool,
}

impl ConfirmationTracker {
    pub fn new(required: u64) -> Self {
        Self {
            required,
            confirmations: 0,
            height: None,
            seen: false,
            announced_pending: false,
            confirmed: false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Feed one observation, returning the event it produces if any
    pub fn update(&mut self, tip_height: u64, status: TxStatus) -> Option<ConfirmationEvent> {
        if self.confirmed {
            return None;
        }

        let confirmations = status.confirmations(tip_height);
        let (height, visible) = match status {
            TxStatus::Unknown => (None, false),
            TxStatus::Mempool => (None, true),
            TxStatus::Included { height } => (Some(height), true),
        };

        if confirmations < self.confirmations || (self.seen && !visible) {
            let previous = self.confirmations;
            self.confirmations = confirmations;
            self.height = height;
            self.seen = visible;
            return Some(ConfirmationEvent::Regressed {
                previous,
                confirmations,
            });
        }

        if !visible {
            if self.announced_pending {
                return None;
            }
            self.announced_pending = true;
            return Some(ConfirmationEvent::Pending);
        }

        let first_sight = !self.seen;
        let changed = confirmations != self.confirmations || height != self.height;
        self.seen = true;
        self.confirmations = confirmations;
        self.height = height;

        if confirmations >= self.required {
            self.confirmed = true;
            return Some(ConfirmationEvent::Confirmed {
                confirmations,
                height,
            });
        }

        if first_sight || changed {
            Some(ConfirmationEvent::Progress {
                confirmations,
                required: self.required,
                height,
            })
        } else {
            None
        }
    }
}

/// Fallback confirmation count when a coin does not configure one
pub fn recommended_confirmations(family: CoinFamily, chain_id: u64) -> u64 {
    match family {
        CoinFamily::Utxo => 2,
        CoinFamily::Account => match chain_id {
            // Ethereum mainnet
            1 => 12,
            // Ethereum testnets
            11155111 | 5 => 6,
            // Polygon mainnet
            137 => 128,
            // BNB smart chain
            56 => 15,
            // Avalanche (instant finality)
            43114 | 43113 => 1,
            // Default conservative
            _ => 20,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_until_confirmed() {
        let mut tracker = ConfirmationTracker::new(3);

        assert_eq!(tracker.update(100, TxStatus::Unknown), Some(ConfirmationEvent::Pending));
        assert_eq!(tracker.update(100, TxStatus::Unknown), None);
        assert_eq!(
            tracker.update(100, TxStatus::Mempool),
            Some(ConfirmationEvent::Progress {
                confirmations: 0,
                required: 3,
                height: None
            })
        );
        assert!(matches!(
            tracker.update(101, TxStatus::Included { height: 101 }),
            Some(ConfirmationEvent::Progress { confirmations: 1, .. })
        ));
        assert_eq!(tracker.update(101, TxStatus::Included { height: 101 }), None);
        assert_eq!(
            tracker.update(103, TxStatus::Included { height: 101 }),
            Some(ConfirmationEvent::Confirmed {
                confirmations: 3,
                height: Some(101)
            })
        );
        assert!(tracker.is_confirmed());
        assert_eq!(tracker.update(104, TxStatus::Included { height: 101 }), None);
    }

    #[test]
    fn test_reorg_emits_regression() {
        let mut tracker = ConfirmationTracker::new(6);
        tracker.update(10, TxStatus::Included { height: 9 });
        assert_eq!(tracker.confirmations(), 2);

        // Dropped back to the mempool by a reorg
        assert_eq!(
            tracker.update(10, TxStatus::Mempool),
            Some(ConfirmationEvent::Regressed {
                previous: 2,
                confirmations: 0
            })
        );

        // Re-mined in a later block
        assert!(matches!(
            tracker.update(12, TxStatus::Included { height: 12 }),
            Some(ConfirmationEvent::Progress { confirmations: 1, .. })
        ));

        // Vanished entirely
        assert!(matches!(
            tracker.update(12, TxStatus::Unknown),
            Some(ConfirmationEvent::Regressed { previous: 1, confirmations: 0 })
        ));
    }

    #[test]
    fn test_zero_required_confirms_on_sight() {
        let mut tracker = ConfirmationTracker::new(0);
        assert_eq!(
            tracker.update(5, TxStatus::Mempool),
            Some(ConfirmationEvent::Confirmed {
                confirmations: 0,
                height: None
            })
        );
    }
}
