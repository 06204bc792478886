//! Maker orders
//!
//! An order is our offer to sell `base` for `rel` at a fixed price. Matching
//! happens outside this process; once matched an order is bound to exactly
//! one swap.

use crate::error::{SwapError, SwapResult};
use crate::swap::ConfirmationSettings;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Price of one base unit in rel units, as a fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub numer: u64,
    pub denom: u64,
}

impl Price {
    /// Rel amount for `base_amount`, rounded down
    pub fn rel_amount(&self, base_amount: u64) -> SwapResult<u64> {
        if self.denom == 0 {
            return Err(SwapError::Validation("price denominator is zero".to_string()));
        }
        let rel = base_amount as u128 * self.numer as u128 / self.denom as u128;
        u64::try_from(rel)
            .map_err(|_| SwapError::Validation(format!("rel amount {} overflows", rel)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "swap")]
pub enum OrderStatus {
    Open,
    Matched(Uuid),
    Cancelled,
}

/// Request to place an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub base: String,
    pub rel: String,
    /// Amount of base offered
    pub volume: u64,
    pub price: Price,
    /// Overrides the configured confirmation settings of a coin
    #[serde(default)]
    pub base_confirmations: Option<ConfirmationSettings>,
    #[serde(default)]
    pub rel_confirmations: Option<ConfirmationSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub base: String,
    pub rel: String,
    pub base_amount: u64,
    pub rel_amount: u64,
    pub price: Price,
    pub base_confirmations: Option<ConfirmationSettings>,
    pub rel_confirmations: Option<ConfirmationSettings>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(request: OrderRequest) -> SwapResult<Self> {
        if request.base == request.rel {
            return Err(SwapError::Validation(format!(
                "cannot trade {} for itself",
                request.base
            )));
        }
        if request.volume == 0 {
            return Err(SwapError::Validation("order volume is zero".to_string()));
        }
        let rel_amount = request.price.rel_amount(request.volume)?;
        if rel_amount == 0 {
            return Err(SwapError::Validation(format!(
                "{} {} is worth nothing at {}/{}",
                request.volume, request.base, request.price.numer, request.price.denom
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            base: request.base,
            rel: request.rel,
            base_amount: request.volume,
            rel_amount,
            price: request.price,
            base_confirmations: request.base_confirmations,
            rel_confirmations: request.rel_confirmations,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        })
    }

    pub fn involves(&self, ticker: &str) -> bool {
        self.base == ticker || self.rel == ticker
    }
}

/// Taker side: accept a remote order under a swap id agreed with the matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeRequest {
    pub swap_uuid: Uuid,
    pub order_id: Uuid,
    pub base: String,
    pub rel: String,
    pub base_amount: u64,
    pub rel_amount: u64,
    #[serde(default)]
    pub base_confirmations: Option<ConfirmationSettings>,
    #[serde(default)]
    pub rel_confirmations: Option<ConfirmationSettings>,
}
