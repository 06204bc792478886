//! Swap engine: the inbound interface of the process
//!
//! Owns the order book of this node and one orchestrator task per running
//! swap. Callers only ever get snapshots and events back; swap state is
//! changed by orchestrators alone.

use super::orders::{Order, OrderRequest, OrderStatus, TakeRequest};
use crate::chain::ChainManager;
use crate::config::EngineConfig;
use crate::error::{SwapError, SwapResult};
use crate::events::SwapStatusEvent;
use crate::negotiation::{NegotiationManager, SwapTransport};
use crate::orchestrator::{SwapContext, SwapHandle, SwapOrchestrator};
use crate::refund::{RefundOutcome, RefundSupervisor};
use crate::store::{SwapStore, TransitionRecord};
use crate::swap::{ConfirmationSettings, NewSwap, Swap, SwapRole, SwapSnapshot};
use crate::tx::BackoffPolicy;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What `recover_funds` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "snake_case")]
pub enum Recovery {
    /// A waiting refund was told to retry now
    Nudged,
    /// The swap was not running and has been restarted
    Resumed,
    /// The swap is running and not refunding yet
    InProgress,
    Refunded,
    /// The counterparty revealed the secret and we claimed its payment
    Redeemed,
    RefundFailed(String),
    NothingToRecover,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub orders_open: usize,
    pub orders_matched: usize,
    pub swaps_running: usize,
    pub swaps_known: usize,
    pub swaps_by_state: HashMap<String, usize>,
}

pub struct SwapEngine {
    ctx: Arc<SwapContext>,
    orders: DashMap<Uuid, Order>,
    running: DashMap<Uuid, Arc<SwapHandle>>,
}

impl SwapEngine {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn SwapStore>,
        transport: Arc<dyn SwapTransport>,
        config: EngineConfig,
    ) -> Self {
        let backoff = BackoffPolicy::from(&config.backoff);
        let refunds = Arc::new(RefundSupervisor::new(
            chains.clone(),
            backoff.clone(),
            config.max_confirmation_wait(),
        ));
        let negotiation = Arc::new(NegotiationManager::new(&config));
        let (events, _) = broadcast::channel(1024);

        Self {
            ctx: Arc::new(SwapContext {
                chains,
                store,
                transport,
                refunds,
                negotiation,
                events,
                snapshots: Arc::new(DashMap::new()),
                config,
                backoff,
            }),
            orders: DashMap::new(),
            running: DashMap::new(),
        }
    }

    pub fn refunds(&self) -> &Arc<RefundSupervisor> {
        &self.ctx.refunds
    }

    /// Place a maker order
    pub async fn place_order(&self, request: OrderRequest) -> SwapResult<Order> {
        self.ctx.chains.coin(&request.base)?;
        self.ctx.chains.coin(&request.rel)?;
        let order = Order::new(request)?;
        info!(
            "Placed order {}: {} {} for {} {}",
            order.id, order.base_amount, order.base, order.rel_amount, order.rel
        );
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.iter().map(|o| o.clone()).collect()
    }

    /// Cancel an order; a matched order also cancels its swap, which is
    /// refused once the swap may have funds on chain
    pub async fn cancel_order(&self, id: Uuid) -> SwapResult<()> {
        let status = self
            .orders
            .get(&id)
            .map(|o| o.status)
            .ok_or(SwapError::OrderNotFound(id))?;

        match status {
            OrderStatus::Cancelled => return Ok(()),
            OrderStatus::Matched(swap) => self.cancel_swap(swap).await?,
            OrderStatus::Open => {}
        }

        if let Some(mut order) = self.orders.get_mut(&id) {
            order.status = OrderStatus::Cancelled;
        }
        info!("Cancelled order {}", id);
        Ok(())
    }

    /// Cancel every order that can still be cancelled
    pub async fn cancel_all_orders(&self) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self.orders.iter().map(|o| o.id).collect();
        self.cancel_each(ids).await
    }

    pub async fn cancel_all_orders_by_ticker(&self, ticker: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .orders
            .iter()
            .filter(|o| o.involves(ticker))
            .map(|o| o.id)
            .collect();
        self.cancel_each(ids).await
    }

    async fn cancel_each(&self, ids: Vec<Uuid>) -> Vec<Uuid> {
        let mut cancelled = Vec::new();
        for id in ids {
            if self.orders.get(&id).map(|o| o.status) == Some(OrderStatus::Cancelled) {
                continue;
            }
            match self.cancel_order(id).await {
                Ok(()) => cancelled.push(id),
                Err(e) => warn!("Order {} not cancelled: {}", id, e),
            }
        }
        cancelled
    }

    /// Maker side: the matching service paired one of our orders with a taker
    pub async fn on_order_matched(&self, order_id: Uuid, swap_uuid: Uuid) -> SwapResult<SwapSnapshot> {
        let order = {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or(SwapError::OrderNotFound(order_id))?;
            if order.status != OrderStatus::Open {
                return Err(SwapError::Validation(format!(
                    "order {} is not open ({:?})",
                    order_id, order.status
                )));
            }
            order.status = OrderStatus::Matched(swap_uuid);
            order.clone()
        };

        let new = self.new_swap(
            SwapRole::Maker,
            swap_uuid,
            order.id,
            &order.base,
            &order.rel,
            (order.base_amount, order.rel_amount),
            (order.base_confirmations, order.rel_confirmations),
        );
        let started = match new {
            Ok(new) => self.start(new).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &started {
            warn!("Order {} reopened, swap {} did not start: {}", order_id, swap_uuid, e);
            if let Some(mut order) = self.orders.get_mut(&order_id) {
                if order.status == OrderStatus::Matched(swap_uuid) {
                    order.status = OrderStatus::Open;
                }
            }
        }
        started
    }

    /// Taker side: accept a remote order
    pub async fn take_order(&self, request: TakeRequest) -> SwapResult<SwapSnapshot> {
        let new = self.new_swap(
            SwapRole::Taker,
            request.swap_uuid,
            request.order_id,
            &request.base,
            &request.rel,
            (request.base_amount, request.rel_amount),
            (request.base_confirmations, request.rel_confirmations),
        )?;
        self.start(new).await
    }

    #[allow(clippy::too_many_arguments)]
    fn new_swap(
        &self,
        role: SwapRole,
        uuid: Uuid,
        order_id: Uuid,
        base: &str,
        rel: &str,
        (base_amount, rel_amount): (u64, u64),
        (base_override, rel_override): (Option<ConfirmationSettings>, Option<ConfirmationSettings>),
    ) -> SwapResult<NewSwap> {
        if self.ctx.snapshots.contains_key(&uuid) || self.running.contains_key(&uuid) {
            return Err(SwapError::Validation(format!("swap {} already exists", uuid)));
        }
        let chains = &self.ctx.chains;
        let config = &self.ctx.config;

        Ok(NewSwap {
            uuid,
            order_id,
            role,
            base_coin: base.to_string(),
            rel_coin: rel.to_string(),
            base_amount,
            rel_amount,
            my_base_pubkey: chains.coin(base)?.htlc_pubkey(),
            my_rel_pubkey: chains.coin(rel)?.htlc_pubkey(),
            base_confirmations: base_override.map_or_else(|| chains.confirmations(base), Ok)?,
            rel_confirmations: rel_override.map_or_else(|| chains.confirmations(rel), Ok)?,
            secret_hash_algo: config.secret_hash_algo,
            lock_duration: config.lock_duration_secs,
            dex_fee_divisor: config.dex_fee_divisor,
        })
    }

    async fn start(&self, new: NewSwap) -> SwapResult<SwapSnapshot> {
        self.prune();
        let swap = Swap::new(new);
        let snapshot = swap.snapshot();
        let handle = SwapOrchestrator::create(swap, self.ctx.clone()).await?;
        self.running.insert(handle.uuid(), Arc::new(handle));
        Ok(snapshot)
    }

    /// Cancel a swap that has not funded anything yet
    pub async fn cancel_swap(&self, uuid: Uuid) -> SwapResult<()> {
        if let Some(snapshot) = self.ctx.snapshots.get(&uuid) {
            if !snapshot.state.is_cancelable() {
                return Err(SwapError::NotCancelable {
                    uuid,
                    state: snapshot.state_name.clone(),
                });
            }
        }
        let handle = self
            .running
            .get(&uuid)
            .map(|h| h.value().clone())
            .ok_or(SwapError::SwapNotFound(uuid))?;
        handle.cancel().await
    }

    /// Manual re-trigger of a stuck swap's refund.
    ///
    /// A running refund retries immediately; a swap that is not running is
    /// resumed; a finished swap that still has funds of ours locked gets a
    /// fresh refund attempt outside its state machine.
    pub async fn recover_funds(&self, uuid: Uuid) -> SwapResult<Recovery> {
        if self.ctx.refunds.nudge(uuid) {
            info!("Swap {}: refund nudged", uuid);
            return Ok(Recovery::Nudged);
        }
        if self.running.get(&uuid).is_some_and(|h| !h.is_finished()) {
            return Ok(Recovery::InProgress);
        }

        let mut swap = self
            .ctx
            .store
            .resume(uuid)
            .await?
            .ok_or(SwapError::SwapNotFound(uuid))?;

        if !swap.state.is_terminal() {
            let handle = SwapOrchestrator::resume(swap, self.ctx.clone())?;
            self.running.insert(uuid, Arc::new(handle));
            return Ok(Recovery::Resumed);
        }
        if swap.own_locked_payments().is_empty() {
            return Ok(Recovery::NothingToRecover);
        }

        info!("Swap {}: recovering funds locked in {}", uuid, swap.state);
        let outcome = self.ctx.refunds.refund(&mut swap).await;

        swap.sequence += 1;
        swap.updated_at = chrono::Utc::now();
        self.ctx.store.append(uuid, &TransitionRecord::of(&swap)).await?;
        self.ctx.snapshots.insert(uuid, swap.snapshot());
        let _ = self.ctx.events.send(SwapStatusEvent::of(&swap));

        Ok(match outcome? {
            RefundOutcome::Refunded => Recovery::Refunded,
            RefundOutcome::Redeemed => Recovery::Redeemed,
            RefundOutcome::RefundFailed(e) => Recovery::RefundFailed(e.to_string()),
        })
    }

    /// Latest snapshot of a swap, from memory or the store
    pub async fn swap_status(&self, uuid: Uuid) -> SwapResult<SwapSnapshot> {
        if let Some(snapshot) = self.ctx.snapshots.get(&uuid) {
            return Ok(snapshot.clone());
        }
        self.ctx
            .store
            .resume(uuid)
            .await?
            .map(|swap| swap.snapshot())
            .ok_or(SwapError::SwapNotFound(uuid))
    }

    /// Every committed record of a swap, oldest first
    pub async fn swap_history(&self, uuid: Uuid) -> SwapResult<Vec<SwapSnapshot>> {
        let history = self.ctx.store.history(uuid).await?;
        if history.is_empty() {
            return Err(SwapError::SwapNotFound(uuid));
        }
        Ok(history.into_iter().map(|record| record.swap.snapshot()).collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapStatusEvent> {
        self.ctx.events.subscribe()
    }

    /// Restart every non-terminal swap found in the store
    pub async fn resume_unfinished(&self) -> SwapResult<usize> {
        let mut resumed = 0;
        for uuid in self.ctx.store.unfinished().await? {
            if self.running.get(&uuid).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            let swap = match self.ctx.store.resume(uuid).await {
                Ok(Some(swap)) => swap,
                Ok(None) => continue,
                Err(e) => {
                    error!("Cannot load swap {}: {}", uuid, e);
                    continue;
                }
            };
            match SwapOrchestrator::resume(swap, self.ctx.clone()) {
                Ok(handle) => {
                    self.running.insert(uuid, Arc::new(handle));
                    resumed += 1;
                }
                Err(e) => error!("Cannot resume swap {}: {}", uuid, e),
            }
        }
        info!("Resumed {} unfinished swaps", resumed);
        Ok(resumed)
    }

    pub fn stats(&self) -> EngineStats {
        self.prune();
        let mut swaps_by_state = HashMap::new();
        for snapshot in self.ctx.snapshots.iter() {
            *swaps_by_state.entry(snapshot.state_name.clone()).or_insert(0) += 1;
        }
        EngineStats {
            orders_open: self.count_orders(|s| s == OrderStatus::Open),
            orders_matched: self.count_orders(|s| matches!(s, OrderStatus::Matched(_))),
            swaps_running: self.running.len(),
            swaps_known: self.ctx.snapshots.len(),
            swaps_by_state,
        }
    }

    fn count_orders(&self, pred: impl Fn(OrderStatus) -> bool) -> usize {
        self.orders.iter().filter(|o| pred(o.status)).count()
    }

    fn prune(&self) {
        self.running.retain(|_, handle| !handle.is_finished());
    }

    /// Stop every swap task; they resume from the store on next start
    pub async fn shutdown(&self) {
        info!("Stopping {} swap tasks", self.running.len());
        for handle in self.running.iter() {
            handle.abort();
        }
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::{SimulatedChain, SimulatedWallet};
    use crate::config::CoinFamily;
    use crate::coordination::Price;
    use crate::negotiation::LocalTransport;
    use crate::store::MockSwapStore;
    use std::time::Duration;

    fn engine(store: MockSwapStore) -> SwapEngine {
        let chains = Arc::new(ChainManager::new(Duration::from_millis(10)));
        let confirmations = ConfirmationSettings {
            confirmations: 1,
            protected: false,
            protected_confirmations: 1,
        };
        for (ticker, family) in [("BASE", CoinFamily::Utxo), ("REL", CoinFamily::Account)] {
            let chain = Arc::new(SimulatedChain::new(ticker, family, 5));
            chains.register(Arc::new(SimulatedWallet::new(chain, "maker")), confirmations);
        }
        SwapEngine::new(
            chains,
            Arc::new(store),
            Arc::new(LocalTransport::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_order_reopens_when_swap_cannot_be_persisted() {
        let mut store = MockSwapStore::new();
        store
            .expect_append()
            .times(1)
            .returning(|_, _| Err(SwapError::Internal("disk full".into())));
        let engine = engine(store);

        let order = engine
            .place_order(OrderRequest {
                base: "BASE".into(),
                rel: "REL".into(),
                volume: 1_000_000,
                price: Price { numer: 2, denom: 1 },
                base_confirmations: None,
                rel_confirmations: None,
            })
            .await
            .unwrap();

        let swap_uuid = Uuid::new_v4();
        assert!(matches!(
            engine.on_order_matched(order.id, swap_uuid).await,
            Err(SwapError::Internal(_))
        ));
        assert_eq!(engine.order(order.id).unwrap().status, OrderStatus::Open);
        assert_eq!(engine.stats().swaps_running, 0);
    }
}
