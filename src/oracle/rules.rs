use async_trait::async_trait;

use super::{DecisionOracle, OracleError};
use crate::models::{Action, Decision, DecisionRequest, IndicatorSet, PositionSide};

const RSI_OVERBOUGHT: f64 = 70.0;
const RSI_OVERSOLD: f64 = 30.0;
/// ADX below this is treated as a ranging market
const MIN_TREND_STRENGTH: f64 = 20.0;
const STOP_ATR_MULTIPLE: f64 = 2.0;
const TARGET_ATR_MULTIPLE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Trend {
    Up,
    Down,
    Unclear,
}

fn trend_of(set: &IndicatorSet) -> Trend {
    let (Some(fast), Some(slow)) = (set.get("ema20"), set.get("ema50")) else {
        return Trend::Unclear;
    };
    if set.get("adx14").is_some_and(|adx| adx < MIN_TREND_STRENGTH) {
        return Trend::Unclear;
    }
    if fast > slow {
        Trend::Up
    } else if fast < slow {
        Trend::Down
    } else {
        Trend::Unclear
    }
}

/// Deterministic trend-following oracle
///
/// The slowest timeframe sets the trend (EMA20 vs EMA50, gated by ADX), the
/// fastest times entries with MACD momentum and RSI, and exits when
/// momentum turns against the position or RSI reaches an extreme.
#[derive(Debug, Clone, Default)]
pub struct RulesOracle;

impl RulesOracle {
    pub fn new() -> Self {
        Self
    }

    fn evaluate(&self, request: &DecisionRequest) -> Decision {
        let (Some(fast), Some(slow)) = (request.indicators.first(), request.indicators.last()) else {
            return Decision::hold("no indicators");
        };
        let (Some(rsi), Some(histogram)) = (fast.get("rsi14"), fast.get("macd_histogram")) else {
            return Decision::hold("momentum indicators not available yet");
        };

        let trend = trend_of(slow);
        let price = request.last_price;
        let atr = fast.get("atr14");

        let (action, confidence, reasoning) = match request.position.side {
            PositionSide::Long if histogram < 0.0 || rsi >= RSI_OVERBOUGHT || trend == Trend::Down => (
                Action::CloseLong,
                0.7,
                format!("long exit: {} trend {:?}, MACD histogram {:.4}, RSI {:.1}", slow.timeframe, trend, histogram, rsi),
            ),
            PositionSide::Short if histogram > 0.0 || rsi <= RSI_OVERSOLD || trend == Trend::Up => (
                Action::CloseShort,
                0.7,
                format!("short exit: {} trend {:?}, MACD histogram {:.4}, RSI {:.1}", slow.timeframe, trend, histogram, rsi),
            ),
            PositionSide::Flat if trend == Trend::Up && histogram > 0.0 && rsi < RSI_OVERBOUGHT => (
                Action::OpenLong,
                0.6,
                format!("{} uptrend with positive {} momentum, RSI {:.1}", slow.timeframe, fast.timeframe, rsi),
            ),
            PositionSide::Flat if trend == Trend::Down && histogram < 0.0 && rsi > RSI_OVERSOLD => (
                Action::OpenShort,
                0.6,
                format!("{} downtrend with negative {} momentum, RSI {:.1}", slow.timeframe, fast.timeframe, rsi),
            ),
            _ => (
                Action::Hold,
                0.5,
                format!("no setup: {} trend {:?}, MACD histogram {:.4}, RSI {:.1}", slow.timeframe, trend, histogram, rsi),
            ),
        };

        let (stop_loss, take_profit) = match (&action, atr) {
            (Action::OpenLong, Some(atr)) => (
                Some(price - STOP_ATR_MULTIPLE * atr),
                Some(price + TARGET_ATR_MULTIPLE * atr),
            ),
            (Action::OpenShort, Some(atr)) => (
                Some(price + STOP_ATR_MULTIPLE * atr),
                Some(price - TARGET_ATR_MULTIPLE * atr),
            ),
            _ => (None, None),
        };

        Decision {
            action,
            // the risk gate sizes to the full allowance
            size_hint: None,
            price_hint: None,
            stop_loss,
            take_profit,
            reasoning,
            confidence,
        }
    }
}

#[async_trait]
impl DecisionOracle for RulesOracle {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let decision = self.evaluate(request);
        tracing::debug!(symbol = %request.symbol, action = %decision.action, reasoning = %decision.reasoning, "Rule decision");
        Ok(decision)
    }

    fn name(&self) -> &str {
        "rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Balance, MarginHealth, Position, Timeframe};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn create_test_set(timeframe: Timeframe, values: &[(&str, f64)]) -> IndicatorSet {
        IndicatorSet {
            symbol: "BTCUSDT".to_string(),
            timeframe,
            as_of: Utc::now(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn create_test_request(fast: &[(&str, f64)], slow: &[(&str, f64)], side: PositionSide) -> DecisionRequest {
        let now = Utc::now();
        let mut position = Position::flat("BTCUSDT", now);
        if side != PositionSide::Flat {
            position.side = side;
            position.size = 1.0;
            position.entry_price = 100.0;
        }
        DecisionRequest {
            symbol: "BTCUSDT".to_string(),
            requested_at: now,
            last_price: 100.0,
            indicators: vec![
                create_test_set(Timeframe::M3, fast),
                create_test_set(Timeframe::H4, slow),
            ],
            position,
            balance: Balance {
                total: 10_000.0,
                available: 10_000.0,
                unrealized_pnl: 0.0,
                realized_pnl_today: 0.0,
                as_of: now,
            },
            margin: MarginHealth::default(),
            trade_history: Vec::new(),
            risk_constraints: String::new(),
        }
    }

    const UPTREND: &[(&str, f64)] = &[("ema20", 105.0), ("ema50", 100.0), ("adx14", 30.0)];
    const DOWNTREND: &[(&str, f64)] = &[("ema20", 95.0), ("ema50", 100.0), ("adx14", 30.0)];
    const RANGING: &[(&str, f64)] = &[("ema20", 105.0), ("ema50", 100.0), ("adx14", 12.0)];

    #[tokio::test]
    async fn test_opens_long_in_uptrend_with_momentum() {
        let request = create_test_request(
            &[("rsi14", 55.0), ("macd_histogram", 0.4), ("atr14", 2.0)],
            UPTREND,
            PositionSide::Flat,
        );
        let decision = RulesOracle::new().decide(&request).await.unwrap();

        assert_eq!(decision.action, Action::OpenLong);
        assert_eq!(decision.stop_loss, Some(96.0));
        assert_eq!(decision.take_profit, Some(106.0));
        assert!((0.0..=1.0).contains(&decision.confidence));
    }

    #[tokio::test]
    async fn test_opens_short_in_downtrend() {
        let request = create_test_request(
            &[("rsi14", 45.0), ("macd_histogram", -0.4)],
            DOWNTREND,
            PositionSide::Flat,
        );
        let decision = RulesOracle::new().decide(&request).await.unwrap();
        assert_eq!(decision.action, Action::OpenShort);
        assert_eq!(decision.stop_loss, None);
    }

    #[tokio::test]
    async fn test_holds_in_ranging_market() {
        let request = create_test_request(
            &[("rsi14", 55.0), ("macd_histogram", 0.4)],
            RANGING,
            PositionSide::Flat,
        );
        let decision = RulesOracle::new().decide(&request).await.unwrap();
        assert_eq!(decision.action, Action::Hold);
    }

    #[tokio::test]
    async fn test_closes_long_when_overbought() {
        let request = create_test_request(
            &[("rsi14", 78.0), ("macd_histogram", 0.2)],
            UPTREND,
            PositionSide::Long,
        );
        let decision = RulesOracle::new().decide(&request).await.unwrap();
        assert_eq!(decision.action, Action::CloseLong);
    }

    #[tokio::test]
    async fn test_holds_without_momentum_values() {
        let request = create_test_request(&[("rsi14", 50.0)], UPTREND, PositionSide::Flat);
        let decision = RulesOracle::new().decide(&request).await.unwrap();
        assert_eq!(decision.action, Action::Hold);
    }
}
