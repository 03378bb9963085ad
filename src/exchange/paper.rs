use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Exchange, ExchangeError, OrderRequest, OrderUpdate};
use crate::market::MarketDataCache;
use crate::models::{Balance, OrderStatus, Position, PositionSide, Timeframe};

/// Scripted failure for the next submission
#[derive(Debug, Clone)]
pub enum SubmitFault {
    /// Fails before the order reaches the book
    Before(ExchangeError),
    /// The order is placed, then the response is lost
    After(ExchangeError),
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    /// Positive long, negative short
    amount: f64,
    entry_price: f64,
}

struct PaperState {
    wallet: f64,
    fee_rate: f64,
    prices: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    leverage: HashMap<String, u32>,
    orders: HashMap<String, OrderUpdate>,
    /// Requests accepted while `hold_pending` was set
    pending: HashMap<String, OrderRequest>,
    next_order_id: u64,
    submit_faults: VecDeque<SubmitFault>,
    hold_pending: bool,
    unavailable: bool,
}

impl PaperState {
    fn leverage_of(&self, symbol: &str) -> u32 {
        self.leverage.get(symbol).copied().unwrap_or(1)
    }

    fn margin_excluding(&self, symbol: &str) -> f64 {
        self.positions
            .iter()
            .filter(|(s, _)| s.as_str() != symbol)
            .map(|(s, p)| p.amount.abs() * p.entry_price / self.leverage_of(s) as f64)
            .sum()
    }

    fn unrealized(&self, symbol: &str, position: &PaperPosition) -> f64 {
        let mark = self.prices.get(symbol).copied().unwrap_or(position.entry_price);
        (mark - position.entry_price) * position.amount
    }

    fn equity(&self) -> f64 {
        self.wallet
            + self
                .positions
                .iter()
                .map(|(s, p)| self.unrealized(s, p))
                .sum::<f64>()
    }

    /// Apply a market fill at `price`, netting against the open position
    fn fill(&mut self, order: &OrderRequest, price: f64) -> Result<f64, ExchangeError> {
        let quantity = order
            .quantity
            .to_f64()
            .ok_or_else(|| ExchangeError::Parse(format!("quantity {}", order.quantity)))?;
        if quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: -4003,
                message: "Quantity less than or equal to zero.".to_string(),
            });
        }

        let current = self.positions.get(&order.symbol).copied().unwrap_or(PaperPosition {
            amount: 0.0,
            entry_price: 0.0,
        });
        let mut delta = quantity * order.side.sign();

        if order.reduce_only {
            if current.amount == 0.0 || current.amount.signum() == delta.signum() {
                return Err(ExchangeError::Rejected {
                    code: -2022,
                    message: "ReduceOnly Order is rejected.".to_string(),
                });
            }
            if delta.abs() > current.amount.abs() {
                delta = -current.amount;
            }
        }

        let new_amount = current.amount + delta;
        let fee = delta.abs() * price * self.fee_rate;

        if new_amount.abs() > current.amount.abs() {
            let leverage = self.leverage_of(&order.symbol) as f64;
            let required = self.margin_excluding(&order.symbol) + new_amount.abs() * price / leverage;
            if required + fee > self.equity() {
                return Err(ExchangeError::Rejected {
                    code: -2019,
                    message: "Margin is insufficient.".to_string(),
                });
            }
        }

        if current.amount != 0.0 && current.amount.signum() != delta.signum() {
            let closed = delta.abs().min(current.amount.abs());
            self.wallet += (price - current.entry_price) * closed * current.amount.signum();
        }
        self.wallet -= fee;

        let entry_price = if current.amount == 0.0 || new_amount.signum() != current.amount.signum() {
            price
        } else if new_amount.abs() > current.amount.abs() {
            (current.entry_price * current.amount.abs() + price * delta.abs()) / new_amount.abs()
        } else {
            current.entry_price
        };

        if new_amount.abs() < 1e-12 {
            self.positions.remove(&order.symbol);
        } else {
            self.positions.insert(
                order.symbol.clone(),
                PaperPosition {
                    amount: new_amount,
                    entry_price,
                },
            );
        }

        Ok(delta.abs())
    }
}

/// In-process futures account that fills market orders at the last known price
///
/// Used for dry runs and as the exchange double in tests. Prices come from
/// `set_price`, falling back to the market data cache when one is attached.
#[derive(Clone)]
pub struct PaperExchange {
    state: Arc<Mutex<PaperState>>,
    market: Option<(MarketDataCache, Timeframe)>,
}

impl PaperExchange {
    pub fn new(starting_balance: f64, fee_rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                wallet: starting_balance,
                fee_rate,
                prices: HashMap::new(),
                positions: HashMap::new(),
                leverage: HashMap::new(),
                orders: HashMap::new(),
                pending: HashMap::new(),
                next_order_id: 1,
                submit_faults: VecDeque::new(),
                hold_pending: false,
                unavailable: false,
            })),
            market: None,
        }
    }

    /// Mark prices from the cache's series of `timeframe`
    pub fn with_market(mut self, cache: MarketDataCache, timeframe: Timeframe) -> Self {
        self.market = Some((cache, timeframe));
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    /// Overwrite a position behind the engine's back (manual trade, liquidation)
    pub fn set_position(&self, symbol: &str, amount: f64, entry_price: f64) {
        let mut state = self.lock();
        if amount == 0.0 {
            state.positions.remove(symbol);
        } else {
            state
                .positions
                .insert(symbol.to_string(), PaperPosition { amount, entry_price });
        }
    }

    pub fn script_submit_faults(&self, faults: impl IntoIterator<Item = SubmitFault>) {
        self.lock().submit_faults.extend(faults);
    }

    /// Leave new orders `PENDING` instead of filling them
    pub fn hold_pending(&self, hold: bool) {
        self.lock().hold_pending = hold;
    }

    /// Fill every order left pending at the current mark price
    pub fn fill_pending(&self) {
        let mut state = self.lock();
        let pending: Vec<OrderRequest> = state.pending.drain().map(|(_, o)| o).collect();

        for order in pending {
            let Some(price) = self.mark_price(&state, &order.symbol) else {
                continue;
            };
            let result = state.fill(&order, price);
            if let Some(update) = state.orders.get_mut(&order.client_order_id) {
                update.updated_at = Utc::now();
                match result {
                    Ok(filled) => {
                        update.status = OrderStatus::Filled;
                        update.filled_quantity = filled;
                        update.avg_price = Some(price);
                    }
                    Err(_) => update.status = OrderStatus::Canceled,
                }
            }
        }
    }

    /// Every call fails with a connection error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    fn mark_price(&self, state: &PaperState, symbol: &str) -> Option<f64> {
        if let Some(price) = state.prices.get(symbol) {
            return Some(*price);
        }
        let (cache, timeframe) = self.market.as_ref()?;
        let series = cache.series(symbol, *timeframe)?;
        series
            .in_progress
            .as_ref()
            .or_else(|| series.last_closed())
            .map(|bar| bar.close)
    }

    fn check_available(state: &PaperState) -> Result<(), ExchangeError> {
        if state.unavailable {
            return Err(ExchangeError::Connect("paper exchange unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn submit_order(&self, order: &OrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let fault = state.submit_faults.pop_front();
        if let Some(SubmitFault::Before(error)) = fault {
            return Err(error);
        }

        if state.orders.contains_key(&order.client_order_id) {
            return Err(ExchangeError::Rejected {
                code: -4116,
                message: "ClientOrderId is duplicated.".to_string(),
            });
        }

        let price = self.mark_price(&state, &order.symbol).ok_or_else(|| {
            ExchangeError::Rejected {
                code: -1121,
                message: format!("no mark price for {}", order.symbol),
            }
        })?;

        let order_id = state.next_order_id.to_string();
        state.next_order_id += 1;

        let mut update = OrderUpdate {
            exchange_order_id: order_id.clone(),
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_price: None,
            updated_at: Utc::now(),
        };

        if state.hold_pending {
            state.pending.insert(order.client_order_id.clone(), order.clone());
        } else {
            let filled = state.fill(order, price)?;
            update.status = OrderStatus::Filled;
            update.filled_quantity = filled;
            update.avg_price = Some(price);
        }

        tracing::info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            quantity = %order.quantity,
            price,
            status = update.status.as_str(),
            "Paper order"
        );

        state.orders.insert(order.client_order_id.clone(), update);

        match fault {
            Some(SubmitFault::After(error)) => Err(error),
            _ => Ok(order_id),
        }
    }

    async fn order_status(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderUpdate, ExchangeError> {
        let state = self.lock();
        Self::check_available(&state)?;
        state
            .orders
            .get(client_order_id)
            .cloned()
            .ok_or(ExchangeError::NotFound)
    }

    async fn position(&self, symbol: &str) -> Result<Position, ExchangeError> {
        let state = self.lock();
        Self::check_available(&state)?;

        let now = Utc::now();
        let leverage = state.leverage_of(symbol);
        let Some(position) = state.positions.get(symbol) else {
            let mut flat = Position::flat(symbol, now);
            flat.leverage = leverage;
            return Ok(flat);
        };

        Ok(Position {
            symbol: symbol.to_string(),
            side: if position.amount > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            size: position.amount.abs(),
            entry_price: position.entry_price,
            leverage,
            margin: position.amount.abs() * position.entry_price / leverage as f64,
            unrealized_pnl: state.unrealized(symbol, position),
            updated_at: now,
        })
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        let state = self.lock();
        Self::check_available(&state)?;

        let total = state.equity();
        Ok(Balance {
            total,
            available: total - state.margin_excluding(""),
            unrealized_pnl: total - state.wallet,
            realized_pnl_today: 0.0,
            as_of: Utc::now(),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}
