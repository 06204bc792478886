//! Swap data model: the swap entity, its payments and the state graph

pub mod state;
pub mod types;

pub use state::{FailedStep, SwapState};
pub use types::{
    dex_fee, ConfirmationSettings, ErrorRecord, NewSwap, Payment, PaymentRole, PaymentSummary,
    Swap, SwapRole, SwapSnapshot,
};

/// Freshly created swap between `BASE` and `REL`, for unit tests
#[cfg(test)]
pub(crate) fn test_swap(role: SwapRole) -> Swap {
    let confirmations = ConfirmationSettings {
        confirmations: 1,
        protected: false,
        protected_confirmations: 2,
    };
    Swap::new(NewSwap {
        uuid: uuid::Uuid::new_v4(),
        order_id: uuid::Uuid::new_v4(),
        role,
        base_coin: "BASE".into(),
        rel_coin: "REL".into(),
        base_amount: 100_000_000,
        rel_amount: 500_000_000,
        my_base_pubkey: vec![2; 33],
        my_rel_pubkey: vec![3; 33],
        base_confirmations: confirmations,
        rel_confirmations: confirmations,
        secret_hash_algo: crate::htlc::SecretHashAlgo::Sha256,
        lock_duration: 3_600,
        dex_fee_divisor: 777,
    })
}
