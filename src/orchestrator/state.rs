use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{CycleError, ErrorCategory};
use crate::models::{
    Action, Decision, DecisionRequestSummary, GateResult, OrderRecord, PipelineState,
    SymbolOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Running,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub state: PipelineState,
    pub last_category: Option<ErrorCategory>,
    pub last_action: Option<Action>,
    pub last_reason: Option<String>,
    pub suspended: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub run_state: RunState,
    pub last_tick: Option<DateTime<Utc>>,
    pub completed_cycles: u64,
    pub halt_reason: Option<String>,
    pub symbols: Vec<SymbolStatus>,
}

/// Mutable side of the control surface, behind one lock
#[derive(Debug)]
pub(crate) struct StatusBoard {
    pub run_state: RunState,
    pub last_tick: Option<DateTime<Utc>>,
    pub completed_cycles: u64,
    pub halt_reason: Option<String>,
    pub symbols: BTreeMap<String, SymbolStatus>,
}

impl StatusBoard {
    pub fn new(symbols: &[String]) -> Self {
        Self {
            run_state: RunState::Stopped,
            last_tick: None,
            completed_cycles: 0,
            halt_reason: None,
            symbols: symbols
                .iter()
                .map(|symbol| {
                    (
                        symbol.clone(),
                        SymbolStatus {
                            symbol: symbol.clone(),
                            state: PipelineState::Idle,
                            last_category: None,
                            last_action: None,
                            last_reason: None,
                            suspended: false,
                            updated_at: None,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn set_state(&mut self, symbol: &str, state: PipelineState) {
        if let Some(status) = self.symbols.get_mut(symbol) {
            status.state = state;
        }
    }

    /// Fold a finished outcome into the symbol's status
    pub fn record_outcome(&mut self, outcome: &SymbolOutcome) {
        let Some(status) = self.symbols.get_mut(&outcome.symbol) else {
            return;
        };
        status.state = PipelineState::Idle;
        status.last_category = outcome.category();
        status.last_action = Some(outcome.decision.action.clone());
        status.last_reason = Some(outcome_reason(outcome));
        status.updated_at = Some(Utc::now());
    }
}

fn outcome_reason(outcome: &SymbolOutcome) -> String {
    if let Some(error) = &outcome.error {
        return error.message.clone();
    }
    match &outcome.gate {
        Some(gate) => gate.reason.code().to_string(),
        None => outcome.decision.reasoning.clone(),
    }
}

/// What a symbol's sub-pipeline has produced so far
///
/// Shared with the tick so a timed-out pipeline can still be recorded.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    pub state: PipelineState,
    pub stages: Vec<PipelineState>,
    pub request: Option<DecisionRequestSummary>,
    pub decision: Option<Decision>,
    pub gate: Option<GateResult>,
    pub order: Option<OrderRecord>,
    pub error: Option<CycleError>,
    /// Set by a tick timeout; the pipeline may no longer start executing
    pub cancelled: bool,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            stages: vec![PipelineState::Idle],
            request: None,
            decision: None,
            gate: None,
            order: None,
            error: None,
            cancelled: false,
        }
    }

    pub fn enter(&mut self, state: PipelineState) {
        self.state = state;
        self.stages.push(state);
    }

    /// Called under the progress lock by a timeout: refuses once the
    /// pipeline is executing, otherwise bars it from ever starting
    pub fn cancel(&mut self) -> bool {
        if self.state == PipelineState::Executing {
            return false;
        }
        self.cancelled = true;
        true
    }

    /// Record an approval and its draft order and enter `Executing`, unless
    /// the tick already gave up on this pipeline
    pub fn begin_execution(&mut self, gate: GateResult, draft: OrderRecord) -> bool {
        if self.cancelled {
            return false;
        }
        self.gate = Some(gate);
        self.order = Some(draft);
        self.enter(PipelineState::Executing);
        true
    }

    pub fn into_outcome(self, symbol: &str, timed_out: bool) -> SymbolOutcome {
        let decision = match self.decision {
            Some(decision) => decision,
            None if timed_out => Decision::hold("tick_timeout"),
            None => Decision::hold("no_decision"),
        };
        SymbolOutcome {
            symbol: symbol.to_string(),
            request: self.request,
            decision,
            gate: self.gate,
            order: self.order,
            error: self.error,
            stages: self.stages,
            timed_out,
        }
    }
}
