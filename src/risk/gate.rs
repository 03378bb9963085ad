use super::RiskLimits;
use crate::models::{Action, Balance, Decision, GateReason, GateResult, Position, PositionSide};

/// Validate a proposed decision against the current position, balance and limits
///
/// Pure function. Checks run in a fixed order and the first failure wins:
/// shape, action vs position, size, daily loss, leverage. Sizes are notional
/// in the quote currency; open positions are valued at their entry price.
pub fn evaluate(
    decision: &Decision,
    position: &Position,
    balance: &Balance,
    limits: &RiskLimits,
) -> GateResult {
    if let Err(detail) = check_shape(decision) {
        return GateResult::reject(GateReason::InvalidDecision, detail);
    }

    if decision.action.is_hold() {
        return GateResult::hold();
    }

    if let Err(result) = check_against_position(&decision.action, position) {
        return result;
    }

    if decision.action.is_closing() {
        let notional = position.notional(position.entry_price);
        return GateResult::approve(
            notional,
            format!("close whole position of {} {}", position.size, position.symbol),
        );
    }

    let size = match size_opening(decision, position, balance, limits) {
        Ok(size) => size,
        Err(result) => return result,
    };

    let daily_pnl = balance.realized_pnl_today + balance.unrealized_pnl;
    let max_daily_loss = limits.max_daily_loss_pct * balance.total;
    if daily_pnl < 0.0 && -daily_pnl >= max_daily_loss {
        return GateResult::reject(
            GateReason::MaxDailyLoss,
            format!(
                "daily loss {:.2} reached the limit of {:.2}",
                -daily_pnl, max_daily_loss
            ),
        );
    }

    let position_leverage = if position.is_open() { position.leverage } else { 0 };
    let effective_leverage = limits.leverage.max(position_leverage);
    if effective_leverage > limits.max_leverage {
        return GateResult::reject(
            GateReason::LeverageCeiling,
            format!(
                "leverage {}x above ceiling {}x",
                effective_leverage, limits.max_leverage
            ),
        );
    }

    GateResult::approve(size, format!("approved notional {:.2}", size))
}

fn check_shape(decision: &Decision) -> Result<(), String> {
    if let Action::Invalid(raw) = &decision.action {
        return Err(format!("unknown action {:?}", raw));
    }

    if !(0.0..=1.0).contains(&decision.confidence) {
        return Err(format!("confidence {} outside [0, 1]", decision.confidence));
    }

    let hints = [
        ("size_hint", decision.size_hint),
        ("price_hint", decision.price_hint),
        ("stop_loss", decision.stop_loss),
        ("take_profit", decision.take_profit),
    ];
    for (name, value) in hints {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, v));
            }
        }
    }

    Ok(())
}

fn check_against_position(action: &Action, position: &Position) -> Result<(), GateResult> {
    let side = if position.is_open() {
        position.side
    } else {
        PositionSide::Flat
    };

    match (action, side) {
        (Action::CloseLong, s) if s != PositionSide::Long => Err(GateResult::reject(
            GateReason::NoLongPosition,
            "close long requested without an open long position",
        )),
        (Action::CloseShort, s) if s != PositionSide::Short => Err(GateResult::reject(
            GateReason::NoShortPosition,
            "close short requested without an open short position",
        )),
        (Action::OpenLong, PositionSide::Short) | (Action::OpenShort, PositionSide::Long) => {
            Err(GateResult::reject(
                GateReason::OppositePositionOpen,
                format!("{} while a {:?} position is open", action, side),
            ))
        }
        _ => Ok(()),
    }
}

fn size_opening(
    decision: &Decision,
    position: &Position,
    balance: &Balance,
    limits: &RiskLimits,
) -> Result<f64, GateResult> {
    let same_side_open = if position.is_open() {
        position.notional(position.entry_price)
    } else {
        0.0
    };

    let equity_allowance = limits.max_position_size_pct * balance.total - same_side_open;
    let margin_allowance = balance.available * limits.leverage as f64;
    let allowance = equity_allowance.min(margin_allowance).max(0.0);

    let requested = decision.size_hint.unwrap_or(allowance);
    let size = requested.min(allowance);

    if size < limits.min_order_notional || size <= 0.0 {
        return Err(GateResult::reject(
            GateReason::MaxPositionSize,
            format!(
                "allowed notional {:.2} (requested {:.2}) below minimum order {:.2}",
                size, requested, limits.min_order_notional
            ),
        ));
    }

    Ok(size)
}
