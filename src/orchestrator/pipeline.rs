use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::state::{Progress, StatusBoard};
use crate::audit::{AuditStore, CycleQuery};
use crate::error::{CycleError, ErrorCategory};
use crate::execution::{CachedPosition, ExecutionEngine};
use crate::market::MarketDataCache;
use crate::models::{
    Balance, Decision, DecisionRequest, GateReason, GateResult, MarginHealth, PastDecision,
    PipelineState, SymbolOutcome, Timeframe,
};
use crate::oracle::{DecisionOracle, OracleError};
use crate::risk::{self, RiskLimits};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a sub-pipeline reads, shared by all symbols of a tick
pub(crate) struct PipelineContext {
    pub cache: MarketDataCache,
    pub oracle: Arc<dyn DecisionOracle>,
    pub engine: Arc<ExecutionEngine>,
    pub audit: Arc<dyn AuditStore>,
    pub history_limit: usize,
    pub limits: RiskLimits,
    pub timeframes: Vec<Timeframe>,
    pub oracle_timeout: Duration,
    pub board: Arc<Mutex<StatusBoard>>,
}

/// One symbol's pass through Fetching, AwaitingDecision, Gating, Executing
/// and Persisting
pub(crate) struct SymbolRun {
    ctx: Arc<PipelineContext>,
    symbol: String,
    progress: Arc<Mutex<Progress>>,
}

impl SymbolRun {
    pub fn new(ctx: Arc<PipelineContext>, symbol: String, progress: Arc<Mutex<Progress>>) -> Self {
        Self {
            ctx,
            symbol,
            progress,
        }
    }

    pub async fn run(self) -> SymbolOutcome {
        self.drive().await;
        self.enter(PipelineState::Persisting);
        lock(&self.progress).clone().into_outcome(&self.symbol, false)
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut lock(&self.progress));
    }

    fn enter(&self, state: PipelineState) {
        let cancelled = {
            let mut progress = lock(&self.progress);
            progress.enter(state);
            progress.cancelled
        };
        // the tick has already recorded a cancelled pipeline
        if !cancelled {
            lock(&self.ctx.board).set_state(&self.symbol, state);
        }
        tracing::debug!(symbol = %self.symbol, state = state.as_str(), "Pipeline transition");
    }

    async fn drive(&self) {
        self.enter(PipelineState::Fetching);
        let Some(request) = self.fetch().await else {
            return;
        };

        self.enter(PipelineState::AwaitingDecision);
        let decision = match tokio::time::timeout(
            self.ctx.oracle_timeout,
            self.ctx.oracle.decide(&request),
        )
        .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => return self.fall_back(e),
            Err(_) => return self.fall_back(OracleError::Timeout),
        };

        tracing::info!(
            symbol = %self.symbol,
            oracle = self.ctx.oracle.name(),
            action = %decision.action,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "Decision received"
        );
        self.update(|p| p.decision = Some(decision.clone()));

        self.enter(PipelineState::Gating);
        // the oracle may have taken longer than position_max_age
        let (cached, balance) = match self.account().await {
            Ok(account) => account,
            Err(message) => {
                tracing::warn!(symbol = %self.symbol, error = %message, "Account unavailable at the gate");
                self.update(|p| {
                    p.error = Some(CycleError::new(ErrorCategory::DataUnavailable, message))
                });
                return;
            }
        };

        let gate = if cached.suspended || self.ctx.engine.is_suspended(&self.symbol) {
            self.update(|p| {
                p.error = Some(CycleError::new(
                    ErrorCategory::PositionDesync,
                    "position desync, submissions suspended",
                ))
            });
            GateResult::reject(
                GateReason::PositionDesync,
                "local position diverged from the exchange",
            )
        } else {
            risk::evaluate(&decision, &cached.position, &balance, &self.ctx.limits)
        };

        if !gate.approved || decision.action.is_hold() {
            tracing::info!(
                symbol = %self.symbol,
                approved = gate.approved,
                reason = gate.reason.code(),
                detail = %gate.detail,
                "Gate closed, no order"
            );
            self.update(|p| p.gate = Some(gate));
            return;
        }

        let draft = self.ctx.engine.prepare(
            &self.symbol,
            &decision.action,
            gate.adjusted_size,
            request.last_price,
        );
        tracing::info!(
            symbol = %self.symbol,
            notional = gate.adjusted_size,
            client_order_id = %draft.client_order_id,
            "Gate approved"
        );
        // gate, draft order and state change together so a timeout never
        // observes an approval without its order
        let started = lock(&self.progress).begin_execution(gate, draft.clone());
        if !started {
            tracing::warn!(symbol = %self.symbol, "Tick timed out before submission, order dropped");
            return;
        }
        lock(&self.ctx.board).set_state(&self.symbol, PipelineState::Executing);
        tracing::debug!(symbol = %self.symbol, state = "executing", "Pipeline transition");

        let report = self.ctx.engine.execute_prepared(&decision.action, draft).await;
        let error = report
            .error
            .map(|e| CycleError::new(e.category(), e.to_string()));
        self.update(|p| {
            p.order = Some(report.order);
            p.error = error;
        });
    }

    /// Market snapshot plus fresh position and balance, or a recorded hold
    async fn fetch(&self) -> Option<DecisionRequest> {
        if let Err(e) = self.ctx.cache.admit_cycle(&self.symbol) {
            return self.hold_on_data(e.hold_reason(), e.to_string());
        }
        let snapshot = match self.ctx.cache.snapshot(&self.symbol, &self.ctx.timeframes) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.hold_on_data(e.hold_reason(), e.to_string()),
        };

        let (cached, balance) = match self.account().await {
            Ok(account) => account,
            Err(message) => return self.hold_on_data("exchange_unavailable", message),
        };

        let trade_history = self.trade_history().await;

        let request = DecisionRequest {
            symbol: self.symbol.clone(),
            requested_at: Utc::now(),
            last_price: snapshot.last_price,
            indicators: snapshot.indicators,
            position: cached.position,
            margin: MarginHealth::from_balance(&balance),
            balance,
            trade_history,
            risk_constraints: self.ctx.limits.describe(),
        };
        self.update(|p| p.request = Some(request.summary()));
        Some(request)
    }

    /// Latest audited decisions of this symbol, newest first
    ///
    /// The history only adds context, so a failing audit read leaves it empty.
    async fn trade_history(&self) -> Vec<PastDecision> {
        if self.ctx.history_limit == 0 {
            return Vec::new();
        }
        let query = CycleQuery {
            symbol: Some(self.symbol.clone()),
            limit: self.ctx.history_limit,
            ..Default::default()
        };
        match self.ctx.audit.query(&query).await {
            Ok(page) => page
                .cycles
                .iter()
                .filter_map(|cycle| {
                    cycle
                        .entry(&self.symbol)
                        .map(|entry| PastDecision::from_outcome(cycle.started_at, entry))
                })
                .collect(),
            Err(e) => {
                tracing::warn!(symbol = %self.symbol, error = %e, "Trade history unavailable");
                Vec::new()
            }
        }
    }

    /// Position no older than `position_max_age`, and the balance
    async fn account(&self) -> Result<(CachedPosition, Balance), String> {
        let cached = self
            .ctx
            .engine
            .fresh_position(&self.symbol)
            .await
            .map_err(|e| e.to_string())?;
        let balance = self.ctx.engine.balance().await.map_err(|e| e.to_string())?;
        Ok((cached, balance))
    }

    fn hold_on_data(&self, reason: &str, message: String) -> Option<DecisionRequest> {
        tracing::warn!(symbol = %self.symbol, reason, error = %message, "Holding without a decision");
        self.update(|p| {
            p.decision = Some(Decision::hold(reason));
            p.error = Some(CycleError::new(ErrorCategory::DataUnavailable, message));
        });
        None
    }

    fn fall_back(&self, error: OracleError) {
        tracing::warn!(symbol = %self.symbol, error = %error, "Oracle failed, holding");
        self.enter(PipelineState::ErrorFallback);
        self.update(|p| {
            p.decision = Some(Decision::hold("oracle_unavailable"));
            p.error = Some(CycleError::new(ErrorCategory::OracleError, error.to_string()));
        });
    }
}
