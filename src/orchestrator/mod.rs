// Decision orchestrator: the scheduled fetch, decide, gate, execute, persist cycle

mod pipeline;
pub mod state;

use chrono::Utc;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::audit::{AuditError, AuditStore};
use crate::config::{AppConfig, OrchestratorConfig};
use crate::error::{CycleError, ErrorCategory};
use crate::execution::{ExecutionEngine, ExecutionError};
use crate::market::MarketDataCache;
use crate::models::{Decision, DecisionCycle, PipelineState, SymbolOutcome};
use crate::oracle::DecisionOracle;
use pipeline::{lock, PipelineContext, SymbolRun};
use state::{Progress, StatusBoard};

pub use state::{OrchestratorStatus, RunState, SymbolStatus};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("orchestrator halted: {0}")]
    Halted(String),

    #[error("audit persistence failed: {0}")]
    Audit(#[from] AuditError),
}

impl OrchestratorError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::SystemFatal
    }
}

struct Inner {
    config: OrchestratorConfig,
    symbols: Vec<String>,
    ctx: Arc<PipelineContext>,
    audit: Arc<dyn AuditStore>,
    board: Arc<Mutex<StatusBoard>>,
    shutdown: watch::Sender<bool>,
    /// Timer and reconciliation tasks of the current run
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Executions that outlived their tick
    detached: Mutex<Vec<JoinHandle<SymbolOutcome>>>,
}

/// Drives every configured symbol through one decision cycle per tick
///
/// Cloning yields another handle to the same orchestrator.
#[derive(Clone)]
pub struct DecisionOrchestrator {
    inner: Arc<Inner>,
}

impl DecisionOrchestrator {
    pub fn new(
        config: &AppConfig,
        cache: MarketDataCache,
        oracle: Arc<dyn DecisionOracle>,
        engine: Arc<ExecutionEngine>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let symbols = config.market.symbols.clone();
        let board = Arc::new(Mutex::new(StatusBoard::new(&symbols)));
        let ctx = Arc::new(PipelineContext {
            cache,
            oracle,
            engine,
            audit: audit.clone(),
            history_limit: config.orchestrator.history_limit,
            limits: config.risk.clone(),
            timeframes: config.market.timeframes.clone(),
            oracle_timeout: config.orchestrator.oracle_timeout(),
            board: board.clone(),
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config: config.orchestrator.clone(),
                symbols,
                ctx,
                audit,
                board,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                detached: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the tick timer and the reconciliation task
    pub fn start(&self) -> Result<(), OrchestratorError> {
        {
            let mut board = lock(&self.inner.board);
            match board.run_state {
                RunState::Running => return Err(OrchestratorError::AlreadyRunning),
                RunState::Halted => {
                    return Err(OrchestratorError::Halted(
                        board.halt_reason.clone().unwrap_or_default(),
                    ))
                }
                RunState::Stopped => board.run_state = RunState::Running,
            }
        }

        self.inner.shutdown.send_replace(false);
        let ticker = tokio::spawn(self.clone().tick_loop(self.inner.shutdown.subscribe()));
        let reconciler = tokio::spawn(self.clone().reconcile_loop(self.inner.shutdown.subscribe()));
        lock(&self.inner.tasks).extend([ticker, reconciler]);

        tracing::info!(
            symbols = ?self.inner.symbols,
            tick_interval = ?self.inner.config.tick_interval(),
            batch_symbols = self.inner.config.batch_symbols,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Prevent further ticks, then wait for the in-flight tick and any
    /// detached executions
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Orchestrator task ended abnormally");
            }
        }
        if let Err(e) = self.collect_detached(true).await {
            self.halt(format!("order update not persisted: {e}"));
        }

        let mut board = lock(&self.inner.board);
        if board.run_state == RunState::Running {
            board.run_state = RunState::Stopped;
        }
        tracing::info!(run_state = ?board.run_state, "Orchestrator stopped");
    }

    pub fn status(&self) -> OrchestratorStatus {
        let board = lock(&self.inner.board);
        OrchestratorStatus {
            run_state: board.run_state,
            last_tick: board.last_tick,
            completed_cycles: board.completed_cycles,
            halt_reason: board.halt_reason.clone(),
            symbols: board
                .symbols
                .values()
                .cloned()
                .map(|mut status| {
                    status.suspended = self.inner.ctx.engine.is_suspended(&status.symbol);
                    status
                })
                .collect(),
        }
    }

    /// Run one tick for every symbol and persist its cycle(s)
    ///
    /// Only an audit failure is an error; it halts the orchestrator.
    pub async fn run_tick(&self) -> Result<Vec<DecisionCycle>, OrchestratorError> {
        if let Some(reason) = self.halt_reason() {
            return Err(OrchestratorError::Halted(reason));
        }
        if let Err(e) = self.collect_detached(false).await {
            self.halt(format!("order update not persisted: {e}"));
            return Err(e.into());
        }

        let started_at = Utc::now();
        let deadline = Instant::now() + self.inner.config.tick_timeout();
        tracing::info!(symbols = self.inner.symbols.len(), "Tick started");

        let runs: Vec<_> = self
            .inner
            .symbols
            .iter()
            .map(|symbol| {
                let progress = Arc::new(Mutex::new(Progress::new()));
                let run = SymbolRun::new(self.inner.ctx.clone(), symbol.clone(), progress.clone());
                (symbol.clone(), progress, tokio::spawn(run.run()))
            })
            .collect();

        let mut entries = Vec::with_capacity(runs.len());
        for (symbol, progress, mut handle) in runs {
            let outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tracing::error!(symbol = %symbol, error = %e, "Symbol pipeline failed");
                    let mut snapshot = lock(&progress).clone();
                    if snapshot.decision.is_none() {
                        snapshot.decision = Some(Decision::hold("pipeline_failed"));
                    }
                    snapshot.error = Some(CycleError::new(
                        ErrorCategory::DataUnavailable,
                        format!("pipeline task failed: {e}"),
                    ));
                    snapshot.into_outcome(&symbol, false)
                }
                Err(_) => self.time_out(&symbol, &progress, handle),
            };
            entries.push(outcome);
        }

        {
            let mut board = lock(&self.inner.board);
            for entry in &entries {
                board.record_outcome(entry);
                if entry.timed_out && entry.stages.last() == Some(&PipelineState::Executing) {
                    board.set_state(&entry.symbol, PipelineState::Executing);
                }
            }
        }

        let cycles = if self.inner.config.batch_symbols {
            vec![DecisionCycle::new(started_at, entries)]
        } else {
            entries
                .into_iter()
                .map(|entry| DecisionCycle::new(started_at, vec![entry]))
                .collect()
        };

        for cycle in &cycles {
            if let Err(violation) = cycle.check_invariants() {
                tracing::error!(cycle_id = %cycle.id, violation = %violation, "Cycle invariant violated");
            }
            if let Err(e) = self.inner.audit.append(cycle).await {
                self.halt(format!("cycle {} not persisted: {e}", cycle.id));
                return Err(e.into());
            }
        }

        {
            let mut board = lock(&self.inner.board);
            board.completed_cycles += cycles.len() as u64;
            board.last_tick = Some(started_at);
        }
        tracing::info!(
            cycles = cycles.len(),
            duration_ms = (Utc::now() - started_at).num_milliseconds(),
            "Tick complete"
        );
        Ok(cycles)
    }

    /// Outcome of a pipeline that missed the tick deadline
    ///
    /// A pipeline caught in `Executing` keeps running detached; anything
    /// earlier is cancelled and aborted. Cancelling happens under the same
    /// lock the pipeline takes to start executing, so an abort never lands
    /// on an order submission.
    fn time_out(
        &self,
        symbol: &str,
        progress: &Mutex<Progress>,
        handle: JoinHandle<SymbolOutcome>,
    ) -> SymbolOutcome {
        let (cancelled, mut snapshot) = {
            let mut progress = lock(progress);
            (progress.cancel(), progress.clone())
        };
        if !cancelled {
            tracing::warn!(symbol = %symbol, "Tick timeout during execution, detaching");
            if let Some(latest) = snapshot
                .order
                .as_ref()
                .and_then(|draft| self.inner.ctx.engine.order(&draft.client_order_id))
            {
                snapshot.order = Some(latest);
            }
            lock(&self.inner.detached).push(handle);
        } else {
            tracing::warn!(symbol = %symbol, state = snapshot.state.as_str(), "Tick timeout, aborting pipeline");
            handle.abort();
        }
        snapshot.into_outcome(symbol, true)
    }

    /// Log the final order of finished detached executions; with `wait`,
    /// wait for all of them
    async fn collect_detached(&self, wait: bool) -> Result<(), AuditError> {
        let ready: Vec<_> = {
            let mut detached = lock(&self.inner.detached);
            let (ready, pending): (Vec<_>, Vec<_>) = detached
                .drain(..)
                .partition(|handle| wait || handle.is_finished());
            *detached = pending;
            ready
        };

        for handle in ready {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "Detached execution failed");
                    continue;
                }
            };
            lock(&self.inner.board).record_outcome(&outcome);
            if let Some(order) = &outcome.order {
                tracing::info!(
                    symbol = %outcome.symbol,
                    client_order_id = %order.client_order_id,
                    status = order.status.as_str(),
                    "Detached execution finished"
                );
                self.inner.audit.append_order_update(order).await?;
            }
        }
        Ok(())
    }

    fn halt_reason(&self) -> Option<String> {
        let board = lock(&self.inner.board);
        (board.run_state == RunState::Halted).then(|| board.halt_reason.clone().unwrap_or_default())
    }

    fn halt(&self, reason: String) {
        tracing::error!(reason = %reason, "Orchestrator halted");
        {
            let mut board = lock(&self.inner.board);
            board.run_state = RunState::Halted;
            board.halt_reason = Some(reason);
            for status in board.symbols.values_mut() {
                status.last_category = Some(ErrorCategory::SystemFatal);
            }
        }
        self.inner.shutdown.send_replace(true);
    }

    async fn tick_loop(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.tick_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_tick().await {
                        tracing::error!(error = %e, category = %e.category(), "Tick failed, stopping timer");
                        break;
                    }
                }
            }
        }
    }

    async fn reconcile_loop(self, mut shutdown: watch::Receiver<bool>) {
        let engine = self.inner.ctx.engine.clone();
        let period = engine.config().reconcile_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match engine.reconcile().await {
                    Ok(report) => {
                        tracing::debug!(
                            resolved = report.resolved.len(),
                            desynced = ?report.desynced,
                            "Reconciliation pass complete"
                        );
                    }
                    Err(ExecutionError::Audit(e)) => {
                        self.halt(format!("order update not persisted: {e}"));
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Reconciliation pass failed");
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use crate::exchange::PaperExchange;
    use crate::oracle::RulesOracle;

    fn create_test_orchestrator(audit: Arc<MemoryAuditStore>) -> DecisionOrchestrator {
        let mut config = AppConfig::default();
        config.market.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let cache = MarketDataCache::new(100, std::time::Duration::from_secs(120));
        let exchange = Arc::new(PaperExchange::new(10_000.0, 0.0));
        let engine = Arc::new(ExecutionEngine::new(
            exchange,
            config.execution.clone(),
            config.risk.leverage,
            config.market.symbols.clone(),
        ));
        DecisionOrchestrator::new(&config, cache, Arc::new(RulesOracle::new()), engine, audit)
    }

    #[tokio::test]
    async fn test_silent_cache_holds_every_symbol() {
        let audit = Arc::new(MemoryAuditStore::default());
        let orchestrator = create_test_orchestrator(audit.clone());

        let cycles = orchestrator.run_tick().await.unwrap();
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.entries.len(), 2);
        cycle.check_invariants().unwrap();
        for entry in &cycle.entries {
            assert!(entry.decision.action.is_hold());
            assert_eq!(entry.decision.reasoning, "stale_data");
            assert_eq!(entry.category(), Some(ErrorCategory::DataUnavailable));
            assert!(entry.gate.is_none());
        }

        assert_eq!(audit.cycles().await.len(), 1);
        let status = orchestrator.status();
        assert_eq!(status.completed_cycles, 1);
        assert_eq!(status.run_state, RunState::Stopped);
    }

    #[tokio::test]
    async fn test_audit_failure_halts() {
        let audit = Arc::new(MemoryAuditStore::default());
        audit.set_failing(true);
        let orchestrator = create_test_orchestrator(audit);

        let result = orchestrator.run_tick().await;
        assert!(matches!(result, Err(OrchestratorError::Audit(_))));

        let status = orchestrator.status();
        assert_eq!(status.run_state, RunState::Halted);
        assert!(status
            .symbols
            .iter()
            .all(|s| s.last_category == Some(ErrorCategory::SystemFatal)));
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::Halted(_))));
        assert!(matches!(orchestrator.run_tick().await, Err(OrchestratorError::Halted(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let orchestrator = create_test_orchestrator(Arc::new(MemoryAuditStore::default()));
        orchestrator.start().unwrap();
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::AlreadyRunning)));

        orchestrator.stop().await;
        assert_eq!(orchestrator.status().run_state, RunState::Stopped);
        orchestrator.start().unwrap();
        orchestrator.stop().await;
    }
}
