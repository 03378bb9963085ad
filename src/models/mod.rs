use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CycleError, ErrorCategory};

/// Bar interval, serialized as the exchange interval string ("1m", "4h", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    D1,
}

impl Timeframe {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M3 => Duration::minutes(3),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H2 => Duration::hours(2),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "2h" => Ok(Timeframe::H2),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unsupported timeframe: {}", other)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// OHLCV bar for one symbol at one timeframe
///
/// Immutable once `is_closed` is set; the in-progress bar is replaced by
/// every update carrying the same `open_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Indicator values derived from the closed bars of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Close time of the last closed bar the values were computed from
    pub as_of: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl IndicatorSet {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base units
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin: f64,
    pub unrealized_pnl: f64,
    /// When this copy was fetched from the exchange
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            leverage: 1,
            margin: 0.0,
            unrealized_pnl: 0.0,
            updated_at,
        }
    }

    /// Size with sign: positive long, negative short
    pub fn signed_size(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
            PositionSide::Flat => 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat && self.size > 0.0
    }

    pub fn notional(&self, price: f64) -> f64 {
        self.size * price
    }
}

/// Account balance in the quote currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
    /// Realized PnL of the current UTC day, tracked from confirmed fills
    pub realized_pnl_today: f64,
    pub as_of: DateTime<Utc>,
}

/// Action proposed by the decision oracle
///
/// Anything outside the fixed set is kept verbatim as `Invalid` so the risk
/// gate can reject it instead of silently treating it as a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Invalid(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::OpenLong => "OPEN_LONG",
            Action::OpenShort => "OPEN_SHORT",
            Action::CloseLong => "CLOSE_LONG",
            Action::CloseShort => "CLOSE_SHORT",
            Action::Hold => "HOLD",
            Action::Invalid(raw) => raw.as_str(),
        }
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, Action::OpenLong | Action::OpenShort)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Action::CloseLong | Action::CloseShort)
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Action::Hold)
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "OPEN_LONG" => Action::OpenLong,
            "OPEN_SHORT" => Action::OpenShort,
            "CLOSE_LONG" => Action::CloseLong,
            "CLOSE_SHORT" => Action::CloseShort,
            "HOLD" => Action::Hold,
            _ => Action::Invalid(raw),
        }
    }
}

impl From<&str> for Action {
    fn from(raw: &str) -> Self {
        Action::from(raw.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading decision returned by the oracle (untrusted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    /// Desired notional in the quote currency
    pub size_hint: Option<f64>,
    pub price_hint: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reasoning: String,
    pub confidence: f64,
}

impl Decision {
    /// Synthesized hold, used whenever the pipeline refuses to act
    pub fn hold(reasoning: &str) -> Self {
        Self {
            action: Action::Hold,
            size_hint: None,
            price_hint: None,
            stop_loss: None,
            take_profit: None,
            reasoning: reasoning.to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginRisk {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl MarginRisk {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MarginRisk::Low => "LOW",
            MarginRisk::Medium => "MEDIUM",
            MarginRisk::High => "HIGH",
            MarginRisk::Critical => "CRITICAL",
        }
    }
}

/// Share of the account tied up as margin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginHealth {
    pub margin_used: f64,
    /// `margin_used / total`, zero for an empty account
    pub margin_ratio: f64,
    pub risk: MarginRisk,
}

impl MarginHealth {
    pub fn from_balance(balance: &Balance) -> Self {
        let margin_used = (balance.total - balance.available).max(0.0);
        let margin_ratio = if balance.total > 0.0 {
            margin_used / balance.total
        } else {
            0.0
        };
        let risk = match margin_ratio {
            r if r < 0.3 => MarginRisk::Low,
            r if r < 0.6 => MarginRisk::Medium,
            r if r < 0.8 => MarginRisk::High,
            _ => MarginRisk::Critical,
        };
        Self {
            margin_used,
            margin_ratio,
            risk,
        }
    }

    pub fn liquidation_risk(&self) -> bool {
        self.margin_ratio > 0.8
    }
}

const PAST_REASONING_CHARS: usize = 200;

/// An earlier decision on the same symbol and what became of its order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastDecision {
    pub decided_at: DateTime<Utc>,
    pub action: Action,
    /// Shortened to keep the prompt small
    pub reasoning: String,
    pub order_status: Option<OrderStatus>,
    pub fill_price: Option<f64>,
}

impl PastDecision {
    pub fn from_outcome(decided_at: DateTime<Utc>, outcome: &SymbolOutcome) -> Self {
        Self {
            decided_at,
            action: outcome.decision.action.clone(),
            reasoning: outcome
                .decision
                .reasoning
                .chars()
                .take(PAST_REASONING_CHARS)
                .collect(),
            order_status: outcome.order.as_ref().map(|o| o.status),
            fill_price: outcome.order.as_ref().and_then(|o| o.fill_price),
        }
    }
}

/// Input handed to the decision oracle; never mutated after construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub symbol: String,
    pub requested_at: DateTime<Utc>,
    pub last_price: f64,
    pub indicators: Vec<IndicatorSet>,
    pub position: Position,
    pub balance: Balance,
    pub margin: MarginHealth,
    /// Newest first
    pub trade_history: Vec<PastDecision>,
    pub risk_constraints: String,
}

impl DecisionRequest {
    pub fn summary(&self) -> DecisionRequestSummary {
        DecisionRequestSummary {
            requested_at: self.requested_at,
            last_price: self.last_price,
            indicators: self.indicators.clone(),
            position: self.position.clone(),
            balance: self.balance.clone(),
            margin: self.margin.clone(),
            past_decisions: self.trade_history.len(),
        }
    }

    /// Indicator set of the given timeframe, if it was part of the snapshot
    pub fn indicators_for(&self, timeframe: Timeframe) -> Option<&IndicatorSet> {
        self.indicators.iter().find(|set| set.timeframe == timeframe)
    }
}

/// What the audit keeps of a request: no constraint prose, and only the
/// length of the trade history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequestSummary {
    pub requested_at: DateTime<Utc>,
    pub last_price: f64,
    pub indicators: Vec<IndicatorSet>,
    pub position: Position,
    pub balance: Balance,
    #[serde(default)]
    pub margin: MarginHealth,
    #[serde(default)]
    pub past_decisions: usize,
}

/// Stable reason codes produced by the risk gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Approved,
    Hold,
    InvalidDecision,
    NoLongPosition,
    NoShortPosition,
    OppositePositionOpen,
    MaxPositionSize,
    MaxDailyLoss,
    LeverageCeiling,
    PositionDesync,
}

impl GateReason {
    pub const fn code(&self) -> &'static str {
        match self {
            GateReason::Approved => "approved",
            GateReason::Hold => "hold",
            GateReason::InvalidDecision => "invalid_decision",
            GateReason::NoLongPosition => "no_long_position",
            GateReason::NoShortPosition => "no_short_position",
            GateReason::OppositePositionOpen => "opposite_position_open",
            GateReason::MaxPositionSize => "max_position_size",
            GateReason::MaxDailyLoss => "max_daily_loss",
            GateReason::LeverageCeiling => "leverage_ceiling",
            GateReason::PositionDesync => "position_desync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub approved: bool,
    pub reason: GateReason,
    pub detail: String,
    /// Risk-clamped notional in the quote currency
    pub adjusted_size: f64,
}

impl GateResult {
    pub fn approve(adjusted_size: f64, detail: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: GateReason::Approved,
            detail: detail.into(),
            adjusted_size,
        }
    }

    pub fn hold() -> Self {
        Self {
            approved: true,
            reason: GateReason::Hold,
            detail: "hold requires no order".to_string(),
            adjusted_size: 0.0,
        }
    }

    pub fn reject(reason: GateReason, detail: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason,
            detail: detail.into(),
            adjusted_size: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    /// Submitted but no terminal status confirmed within the timeout
    Unconfirmed,
    /// Never acknowledged by the exchange
    SubmitFailed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Canceled
                | OrderStatus::SubmitFailed
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Unconfirmed => "UNCONFIRMED",
            OrderStatus::SubmitFailed => "SUBMIT_FAILED",
        }
    }
}

/// Lifecycle record of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub reduce_only: bool,
    pub requested_quantity: f64,
    pub requested_notional: f64,
    pub requested_price: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub fill_price: Option<f64>,
    pub fees: f64,
    pub reject_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State of a symbol sub-pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    AwaitingDecision,
    Gating,
    Executing,
    Persisting,
    ErrorFallback,
}

impl PipelineState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Fetching => "fetching",
            PipelineState::AwaitingDecision => "awaiting_decision",
            PipelineState::Gating => "gating",
            PipelineState::Executing => "executing",
            PipelineState::Persisting => "persisting",
            PipelineState::ErrorFallback => "error_fallback",
        }
    }
}

/// Outcome of one symbol within a decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub request: Option<DecisionRequestSummary>,
    pub decision: Decision,
    pub gate: Option<GateResult>,
    pub order: Option<OrderRecord>,
    pub error: Option<CycleError>,
    /// States visited, in order
    pub stages: Vec<PipelineState>,
    pub timed_out: bool,
}

impl SymbolOutcome {
    /// Most significant outcome category, if the symbol did not simply run clean
    pub fn category(&self) -> Option<ErrorCategory> {
        if let Some(error) = &self.error {
            return Some(error.category);
        }
        match &self.gate {
            Some(gate) if !gate.approved => Some(ErrorCategory::RiskRejected),
            _ => None,
        }
    }
}

/// Audit unit: everything one scheduled tick did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCycle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub entries: Vec<SymbolOutcome>,
}

impl DecisionCycle {
    pub fn new(started_at: DateTime<Utc>, entries: Vec<SymbolOutcome>) -> Self {
        let finished_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            entries,
        }
    }

    pub fn entry(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.entries.iter().find(|e| e.symbol == symbol)
    }

    /// One entry per symbol, and an order exactly when an approved non-hold passed the gate
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.symbol.as_str()) {
                return Err(format!("duplicate entry for {}", entry.symbol));
            }

            let should_have_order = entry.gate.as_ref().map(|g| g.approved).unwrap_or(false)
                && !entry.decision.action.is_hold();
            if should_have_order != entry.order.is_some() {
                return Err(format!(
                    "{}: order present = {}, expected {}",
                    entry.symbol,
                    entry.order.is_some(),
                    should_have_order
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_round_trip_strings() {
        for tf in [Timeframe::M1, Timeframe::M3, Timeframe::H1, Timeframe::H4, Timeframe::D1] {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("7m".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::H4.duration(), Duration::hours(4));
    }

    #[test]
    fn test_action_parsing_keeps_unknown_values() {
        assert_eq!(Action::from("open_long"), Action::OpenLong);
        assert_eq!(Action::from(" HOLD "), Action::Hold);
        assert_eq!(
            Action::from("BUY_THE_DIP"),
            Action::Invalid("BUY_THE_DIP".to_string())
        );

        let decision: Decision = serde_json::from_str(
            r#"{"action":"YOLO","size_hint":null,"price_hint":null,"stop_loss":null,
                "take_profit":null,"reasoning":"x","confidence":0.5}"#,
        )
        .unwrap();
        assert!(matches!(decision.action, Action::Invalid(_)));
    }

    #[test]
    fn test_position_signed_size() {
        let mut position = Position::flat("BTCUSDT", Utc::now());
        assert_eq!(position.signed_size(), 0.0);
        assert!(!position.is_open());

        position.side = PositionSide::Short;
        position.size = 0.5;
        assert_eq!(position.signed_size(), -0.5);
        assert!(position.is_open());
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::SubmitFailed.is_terminal());
        assert!(!OrderStatus::Unconfirmed.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_margin_health_bands() {
        let balance = |total: f64, available: f64| Balance {
            total,
            available,
            unrealized_pnl: 0.0,
            realized_pnl_today: 0.0,
            as_of: Utc::now(),
        };

        let idle = MarginHealth::from_balance(&balance(10_000.0, 10_000.0));
        assert_eq!(idle.margin_used, 0.0);
        assert_eq!(idle.risk, MarginRisk::Low);

        assert_eq!(MarginHealth::from_balance(&balance(10_000.0, 6_000.0)).risk, MarginRisk::Medium);
        assert_eq!(MarginHealth::from_balance(&balance(10_000.0, 3_000.0)).risk, MarginRisk::High);

        let stretched = MarginHealth::from_balance(&balance(10_000.0, 1_000.0));
        assert_eq!(stretched.risk, MarginRisk::Critical);
        assert!(stretched.liquidation_risk());

        assert_eq!(MarginHealth::from_balance(&balance(0.0, 0.0)).margin_ratio, 0.0);
    }

    #[test]
    fn test_summary_without_margin_still_parses() {
        let now = Utc::now();
        let stored = serde_json::json!({
            "requested_at": now,
            "last_price": 100.0,
            "indicators": [],
            "position": Position::flat("BTCUSDT", now),
            "balance": {
                "total": 100.0,
                "available": 100.0,
                "unrealized_pnl": 0.0,
                "realized_pnl_today": 0.0,
                "as_of": now
            }
        });

        let summary: DecisionRequestSummary = serde_json::from_value(stored).unwrap();
        assert_eq!(summary.margin, MarginHealth::default());
        assert_eq!(summary.past_decisions, 0);
    }

    #[test]
    fn test_cycle_invariants_detect_missing_order() {
        let outcome = SymbolOutcome {
            symbol: "BTCUSDT".to_string(),
            request: None,
            decision: Decision {
                action: Action::OpenLong,
                size_hint: Some(100.0),
                price_hint: None,
                stop_loss: None,
                take_profit: None,
                reasoning: "test".to_string(),
                confidence: 0.8,
            },
            gate: Some(GateResult::approve(100.0, "ok")),
            order: None,
            error: None,
            stages: vec![PipelineState::Fetching],
            timed_out: false,
        };

        let cycle = DecisionCycle::new(Utc::now(), vec![outcome.clone()]);
        assert!(cycle.check_invariants().is_err());

        let hold = SymbolOutcome {
            decision: Decision::hold("stale_data"),
            gate: None,
            ..outcome
        };
        let cycle = DecisionCycle::new(Utc::now(), vec![hold]);
        assert!(cycle.check_invariants().is_ok());
    }
}
