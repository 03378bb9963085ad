use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use super::{CachedPosition, DailyPnl, Observation, OrderTracker, PositionBook};
use crate::audit::{AuditError, AuditStore};
use crate::config::ExecutionConfig;
use crate::error::ErrorCategory;
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::models::{Action, Balance, OrderRecord, OrderSide, OrderStatus, Position, PositionSide};

/// Binance code for a client order id seen before
const DUPLICATE_CLIENT_ORDER_ID: i64 = -4116;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("quantity for notional {notional} at {price} rounds to zero")]
    QuantityTooSmall { notional: f64, price: f64 },

    #[error("invalid reference price {0}")]
    InvalidPrice(f64),

    #[error("action {0} does not produce an order")]
    NotExecutable(String),

    #[error("no {side:?} position to close on {symbol}")]
    NothingToClose { symbol: String, side: PositionSide },

    #[error("submissions suspended for {0} after a position desync")]
    Suspended(String),

    #[error("submission never acknowledged: {0}")]
    SubmitFailed(ExchangeError),

    #[error("order rejected: {0}")]
    Rejected(ExchangeError),

    #[error("order {client_order_id} not confirmed within {timeout:?}")]
    Unconfirmed {
        client_order_id: String,
        timeout: Duration,
    },

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
}

impl ExecutionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutionError::Unconfirmed { .. } => ErrorCategory::ExecutionTimeout,
            ExecutionError::Suspended(_) => ErrorCategory::PositionDesync,
            ExecutionError::Audit(_) => ErrorCategory::SystemFatal,
            ExecutionError::SubmitFailed(_) | ExecutionError::Exchange(_) => {
                ErrorCategory::DataUnavailable
            }
            ExecutionError::QuantityTooSmall { .. }
            | ExecutionError::InvalidPrice(_)
            | ExecutionError::NotExecutable(_)
            | ExecutionError::NothingToClose { .. }
            | ExecutionError::Rejected(_) => ErrorCategory::RiskRejected,
        }
    }
}

/// Every execution yields a record, failed or not
#[derive(Debug)]
pub struct ExecutionReport {
    pub order: OrderRecord,
    pub error: Option<ExecutionError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PositionDesync {
        symbol: String,
        expected: f64,
        observed: f64,
    },
    PositionResumed {
        symbol: String,
    },
    OrderResolved(OrderRecord),
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub resolved: Vec<OrderRecord>,
    pub desynced: Vec<String>,
}

struct SymbolReconciliation {
    cached: CachedPosition,
    observation: Observation,
    resolved: Vec<OrderRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_client_order_id() -> String {
    // Binance allows at most 36 characters
    format!("at-{}", Uuid::new_v4().simple())
}

/// Notional / price, rounded down to the exchange step
pub fn opening_quantity(notional: f64, price: f64, decimals: u32) -> Option<Decimal> {
    Decimal::from_f64(notional / price)
        .map(|q| q.round_dp_with_strategy(decimals, RoundingStrategy::ToZero))
        .filter(|q| q.is_sign_positive() && !q.is_zero())
}

fn closing_quantity(size: f64, decimals: u32) -> Option<Decimal> {
    Decimal::from_f64(size)
        .map(|q| q.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero))
        .filter(|q| q.is_sign_positive() && !q.is_zero())
}

/// Turns approved decisions into exchange orders and keeps local state in
/// line with the exchange
///
/// Work on one symbol is serialized: executions, freshness checks and
/// reconciliations of the same symbol never interleave.
pub struct ExecutionEngine {
    exchange: Arc<dyn Exchange>,
    config: ExecutionConfig,
    leverage: u32,
    symbols: Vec<String>,
    orders: Mutex<OrderTracker>,
    positions: Mutex<PositionBook>,
    daily: Mutex<DailyPnl>,
    leverage_set: Mutex<HashSet<String>>,
    symbol_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<EngineEvent>,
    audit: Option<Arc<dyn AuditStore>>,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: ExecutionConfig,
        leverage: u32,
        symbols: Vec<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            exchange,
            config,
            leverage,
            symbols,
            orders: Mutex::new(OrderTracker::new()),
            positions: Mutex::new(PositionBook::new()),
            daily: Mutex::new(DailyPnl::new(Utc::now())),
            leverage_set: Mutex::new(HashSet::new()),
            symbol_locks: Mutex::new(HashMap::new()),
            events,
            audit: None,
        }
    }

    /// Log orders resolved by reconciliation to this store
    pub fn with_audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn is_suspended(&self, symbol: &str) -> bool {
        lock(&self.positions).is_suspended(symbol)
    }

    /// Cached positions with their fetch time
    pub fn positions(&self) -> Vec<CachedPosition> {
        lock(&self.positions).all()
    }

    pub fn order(&self, client_order_id: &str) -> Option<OrderRecord> {
        lock(&self.orders).get(client_order_id).cloned()
    }

    pub fn unresolved_orders(&self) -> Vec<OrderRecord> {
        lock(&self.orders).unresolved()
    }

    async fn symbol_lock(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let mutex = lock(&self.symbol_locks)
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Exchange balance with the day's realized PnL filled in
    pub async fn balance(&self) -> Result<Balance, ExecutionError> {
        let mut balance = self.exchange.balance().await?;
        balance.realized_pnl_today = lock(&self.daily).realized(Utc::now());
        Ok(balance)
    }

    /// Cached position, reconciled first when older than `position_max_age`
    pub async fn fresh_position(&self, symbol: &str) -> Result<CachedPosition, ExecutionError> {
        let _guard = self.symbol_lock(symbol).await;
        self.fresh_position_locked(symbol).await
    }

    async fn fresh_position_locked(&self, symbol: &str) -> Result<CachedPosition, ExecutionError> {
        let max_age = chrono::Duration::from_std(self.config.position_max_age())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let cached = lock(&self.positions).get(symbol).cloned();
        if let Some(cached) = cached {
            if Utc::now() - cached.fetched_at <= max_age {
                return Ok(cached);
            }
        }

        Ok(self.reconcile_locked(symbol).await?.cached)
    }

    /// Draft record for an order about to be placed; no I/O
    ///
    /// The draft's client order id is the one the exchange will see.
    pub fn prepare(
        &self,
        symbol: &str,
        action: &Action,
        notional: f64,
        reference_price: f64,
    ) -> OrderRecord {
        let (side, reduce_only) = match action {
            Action::OpenShort | Action::CloseLong => (OrderSide::Sell, *action == Action::CloseLong),
            _ => (OrderSide::Buy, *action == Action::CloseShort),
        };
        let now = Utc::now();
        OrderRecord {
            client_order_id: new_client_order_id(),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            reduce_only,
            requested_quantity: 0.0,
            requested_notional: notional,
            requested_price: (reference_price > 0.0).then_some(reference_price),
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            fill_price: None,
            fees: 0.0,
            reject_reason: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Place the order for an approved action and follow it to a terminal status
    pub async fn execute(
        &self,
        symbol: &str,
        action: &Action,
        notional: f64,
        reference_price: f64,
    ) -> ExecutionReport {
        let draft = self.prepare(symbol, action, notional, reference_price);
        self.execute_prepared(action, draft).await
    }

    pub async fn execute_prepared(&self, action: &Action, mut record: OrderRecord) -> ExecutionReport {
        let symbol = record.symbol.clone();
        let symbol = symbol.as_str();
        let notional = record.requested_notional;
        let reference_price = record.requested_price.unwrap_or(0.0);

        if !(action.is_opening() || action.is_closing()) {
            return self.fail(record, ExecutionError::NotExecutable(action.as_str().to_string()));
        }
        let (side, reduce_only) = (record.side, record.reduce_only);

        let _guard = self.symbol_lock(symbol).await;

        if self.is_suspended(symbol) {
            return self.fail(record, ExecutionError::Suspended(symbol.to_string()));
        }

        let mut basis: Option<Position> = None;
        let quantity = if reduce_only {
            let cached = match self.fresh_position_locked(symbol).await {
                Ok(cached) => cached,
                Err(e) => return self.fail(record, e),
            };
            if cached.suspended {
                return self.fail(record, ExecutionError::Suspended(symbol.to_string()));
            }

            let expected_side = match action {
                Action::CloseLong => PositionSide::Long,
                _ => PositionSide::Short,
            };
            if cached.position.side != expected_side || !cached.position.is_open() {
                return self.fail(
                    record,
                    ExecutionError::NothingToClose {
                        symbol: symbol.to_string(),
                        side: expected_side,
                    },
                );
            }

            let size = cached.position.size;
            basis = Some(cached.position);
            match closing_quantity(size, self.config.quantity_decimals) {
                Some(quantity) => quantity,
                None => {
                    return self.fail(
                        record,
                        ExecutionError::QuantityTooSmall {
                            notional,
                            price: reference_price,
                        },
                    )
                }
            }
        } else {
            if !(reference_price.is_finite() && reference_price > 0.0) {
                return self.fail(record, ExecutionError::InvalidPrice(reference_price));
            }
            match opening_quantity(notional, reference_price, self.config.quantity_decimals) {
                Some(quantity) => quantity,
                None => {
                    return self.fail(
                        record,
                        ExecutionError::QuantityTooSmall {
                            notional,
                            price: reference_price,
                        },
                    )
                }
            }
        };
        record.requested_quantity = quantity.to_f64().unwrap_or_default();

        if !reduce_only {
            if let Err(e) = self.ensure_leverage(symbol).await {
                return self.fail(record, ExecutionError::SubmitFailed(e));
            }
        }

        let request = OrderRequest {
            client_order_id: record.client_order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            reduce_only,
        };
        record.submitted_at = Utc::now();
        record.updated_at = record.submitted_at;
        lock(&self.orders).insert(record.clone());

        tracing::info!(
            symbol = %symbol,
            action = %action,
            side = side.as_str(),
            quantity = %quantity,
            notional,
            client_order_id = %request.client_order_id,
            "Submitting order"
        );

        let mut attempt = 0;
        loop {
            match self.exchange.submit_order(&request).await {
                Ok(order_id) => {
                    lock(&self.orders).acknowledge(&request.client_order_id, order_id);
                    break;
                }
                Err(e) if e.is_pre_acceptance() => {
                    if attempt < self.config.submit_retries {
                        attempt += 1;
                        tracing::warn!(
                            symbol = %symbol,
                            client_order_id = %request.client_order_id,
                            attempt,
                            error = %e,
                            "Order not delivered, retrying with the same client id"
                        );
                        continue;
                    }
                    return self.fail(record, ExecutionError::SubmitFailed(e));
                }
                // an earlier attempt did reach the exchange
                Err(ExchangeError::Rejected { code, .. })
                    if code == DUPLICATE_CLIENT_ORDER_ID && attempt > 0 =>
                {
                    break;
                }
                Err(e @ ExchangeError::Rejected { .. }) | Err(e @ ExchangeError::Auth(_)) => {
                    return self.fail(record, ExecutionError::Rejected(e));
                }
                Err(e) if e.is_ambiguous() => {
                    tracing::warn!(
                        symbol = %symbol,
                        client_order_id = %request.client_order_id,
                        error = %e,
                        "Submission outcome unknown, confirming by query"
                    );
                    break;
                }
                Err(e) => return self.fail(record, ExecutionError::SubmitFailed(e)),
            }
        }

        let Some(order) = self.confirm(symbol, &request.client_order_id).await else {
            let order = lock(&self.orders)
                .set_status(&request.client_order_id, OrderStatus::Unconfirmed, None)
                .unwrap_or(record);
            tracing::warn!(
                symbol = %symbol,
                client_order_id = %order.client_order_id,
                "Order unconfirmed, leaving it to reconciliation"
            );
            return ExecutionReport {
                order,
                error: Some(ExecutionError::Unconfirmed {
                    client_order_id: request.client_order_id,
                    timeout: self.config.confirm_timeout(),
                }),
            };
        };

        tracing::info!(
            symbol = %symbol,
            client_order_id = %order.client_order_id,
            status = order.status.as_str(),
            filled = order.filled_quantity,
            price = ?order.fill_price,
            "Order resolved"
        );

        self.settle(&order, basis.as_ref());
        if order.filled_quantity > 0.0 {
            if let Err(e) = self.reconcile_locked(symbol).await {
                tracing::warn!(symbol = %symbol, error = %e, "Post-fill reconciliation failed");
            }
        }

        let error = match order.status {
            OrderStatus::Rejected => Some(ExecutionError::Rejected(ExchangeError::Rejected {
                code: 0,
                message: "rejected after acceptance".to_string(),
            })),
            _ => None,
        };
        ExecutionReport { order, error }
    }

    fn fail(&self, mut record: OrderRecord, error: ExecutionError) -> ExecutionReport {
        record.status = match error {
            ExecutionError::Rejected(_) => OrderStatus::Rejected,
            _ => OrderStatus::SubmitFailed,
        };
        record.reject_reason = Some(error.to_string());
        record.updated_at = Utc::now();
        lock(&self.orders).insert(record.clone());

        tracing::warn!(
            symbol = %record.symbol,
            client_order_id = %record.client_order_id,
            status = record.status.as_str(),
            error = %error,
            "Order not placed"
        );

        ExecutionReport {
            order: record,
            error: Some(error),
        }
    }

    async fn ensure_leverage(&self, symbol: &str) -> Result<(), ExchangeError> {
        if lock(&self.leverage_set).contains(symbol) {
            return Ok(());
        }
        self.exchange.set_leverage(symbol, self.leverage).await?;
        lock(&self.leverage_set).insert(symbol.to_string());
        Ok(())
    }

    /// Poll until terminal or `confirm_timeout`
    async fn confirm(&self, symbol: &str, client_order_id: &str) -> Option<OrderRecord> {
        let deadline = Instant::now() + self.config.confirm_timeout();

        loop {
            match self.exchange.order_status(symbol, client_order_id).await {
                Ok(update) => {
                    let record =
                        lock(&self.orders).apply(client_order_id, &update, self.config.taker_fee_rate);
                    if let Some(record) = record.filter(|r| r.status.is_terminal()) {
                        return Some(record);
                    }
                }
                Err(ExchangeError::NotFound) => {
                    tracing::debug!(client_order_id = %client_order_id, "Order not visible yet");
                }
                Err(e) => {
                    tracing::warn!(client_order_id = %client_order_id, error = %e, "Order status query failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// Book the effects of a resolved order: pending position delta and daily PnL
    fn settle(&self, order: &OrderRecord, basis: Option<&Position>) {
        if order.filled_quantity <= 0.0 {
            return;
        }

        lock(&self.positions).record_fill(&order.symbol, order.filled_quantity * order.side.sign());

        let mut pnl = -order.fees;
        if order.reduce_only {
            if let (Some(position), Some(price)) = (basis, order.fill_price) {
                pnl += (price - position.entry_price)
                    * order.filled_quantity
                    * position.signed_size().signum();
            }
        }
        lock(&self.daily).record(pnl, Utc::now());
    }

    /// Query every unresolved order of the symbol once
    async fn resolve_orders(&self, symbol: &str) -> Result<Vec<OrderRecord>, ExecutionError> {
        let unresolved: Vec<OrderRecord> = lock(&self.orders)
            .unresolved()
            .into_iter()
            .filter(|r| r.symbol == symbol)
            .collect();

        let confirm_timeout = chrono::Duration::from_std(self.config.confirm_timeout())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut resolved = Vec::new();
        for record in unresolved {
            let id = record.client_order_id.as_str();
            let outcome = match self.exchange.order_status(symbol, id).await {
                Ok(update) => lock(&self.orders)
                    .apply(id, &update, self.config.taker_fee_rate)
                    .filter(|r| r.status.is_terminal()),
                Err(ExchangeError::NotFound) if Utc::now() - record.submitted_at > confirm_timeout => {
                    lock(&self.orders).set_status(
                        id,
                        OrderStatus::SubmitFailed,
                        Some("order not found on exchange".to_string()),
                    )
                }
                Err(ExchangeError::NotFound) => None,
                Err(e) => {
                    tracing::warn!(client_order_id = %id, error = %e, "Could not resolve order");
                    None
                }
            };

            let Some(order) = outcome else {
                continue;
            };

            let basis = lock(&self.positions).get(symbol).map(|c| c.position.clone());
            self.settle(&order, basis.as_ref());

            tracing::info!(
                symbol = %symbol,
                client_order_id = %order.client_order_id,
                status = order.status.as_str(),
                "Reconciliation resolved order"
            );
            let _ = self.events.send(EngineEvent::OrderResolved(order.clone()));

            if let Some(audit) = &self.audit {
                audit.append_order_update(&order).await?;
            }
            resolved.push(order);
        }

        Ok(resolved)
    }

    async fn reconcile_locked(&self, symbol: &str) -> Result<SymbolReconciliation, ExecutionError> {
        let resolved = self.resolve_orders(symbol).await?;
        let observed = self.exchange.position(symbol).await?;

        let mut book = lock(&self.positions);
        let observation = book.observe(observed.clone(), self.config.desync_tolerance);
        let cached = book.get(symbol).cloned().unwrap_or(CachedPosition {
            fetched_at: observed.updated_at,
            position: observed,
            suspended: false,
        });
        drop(book);

        match observation {
            Observation::Diverged { expected, observed } => {
                tracing::error!(
                    symbol = %symbol,
                    expected,
                    observed,
                    "Position desync, suspending submissions"
                );
                let _ = self.events.send(EngineEvent::PositionDesync {
                    symbol: symbol.to_string(),
                    expected,
                    observed,
                });
            }
            Observation::Resumed => {
                tracing::info!(symbol = %symbol, "Position agrees with exchange again, resuming");
                let _ = self.events.send(EngineEvent::PositionResumed {
                    symbol: symbol.to_string(),
                });
            }
            Observation::First | Observation::Agreed => {
                tracing::debug!(symbol = %symbol, size = cached.position.signed_size(), "Position reconciled");
            }
        }

        Ok(SymbolReconciliation {
            cached,
            observation,
            resolved,
        })
    }

    /// Resolve unresolved orders and compare every position with the exchange
    ///
    /// Audit failures abort the pass; exchange failures only skip the symbol.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ExecutionError> {
        let mut symbols = self.symbols.clone();
        symbols.extend(lock(&self.orders).unresolved().into_iter().map(|r| r.symbol));
        symbols.extend(lock(&self.positions).all().into_iter().map(|c| c.position.symbol));
        symbols.sort();
        symbols.dedup();

        let mut report = ReconcileReport::default();
        for symbol in symbols {
            let _guard = self.symbol_lock(&symbol).await;
            match self.reconcile_locked(&symbol).await {
                Ok(outcome) => {
                    report.resolved.extend(outcome.resolved);
                    if matches!(outcome.observation, Observation::Diverged { .. }) {
                        report.desynced.push(symbol);
                    }
                }
                Err(e @ ExecutionError::Audit(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Reconciliation skipped symbol");
                }
            }
        }

        Ok(report)
    }
}
