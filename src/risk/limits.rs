use serde::{Deserialize, Serialize};

/// Hard limits every decision is checked against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Max notional per side and symbol, as a fraction of total equity
    pub max_position_size_pct: f64,
    /// Realized + unrealized loss of the day, as a fraction of total equity
    pub max_daily_loss_pct: f64,
    /// Leverage applied to new positions
    pub leverage: u32,
    pub max_leverage: u32,
    /// Smallest notional the exchange accepts
    pub min_order_notional: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_pct: 0.05, // 5% max per position
            max_daily_loss_pct: 0.05,    // -5% daily
            leverage: 3,
            max_leverage: 10,
            min_order_notional: 5.0,
        }
    }
}

impl RiskLimits {
    /// Human-readable constraints handed to the decision oracle
    pub fn describe(&self) -> String {
        format!(
            "Max position size: {:.1}% of equity per symbol. Max daily loss: {:.1}% of equity. \
             Leverage: {}x (ceiling {}x). Minimum order notional: {:.2} USDT. \
             Never open a position opposite to an existing one; close it first.",
            self.max_position_size_pct * 100.0,
            self.max_daily_loss_pct * 100.0,
            self.leverage,
            self.max_leverage,
            self.min_order_notional,
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, pct) in [
            ("max_position_size_pct", self.max_position_size_pct),
            ("max_daily_loss_pct", self.max_daily_loss_pct),
        ] {
            if !(pct > 0.0 && pct <= 1.0) {
                return Err(format!("risk.{} must be in (0, 1], got {}", name, pct));
            }
        }
        if self.leverage == 0 {
            return Err("risk.leverage must be at least 1".to_string());
        }
        if self.leverage > self.max_leverage {
            return Err(format!(
                "risk.leverage {} exceeds risk.max_leverage {}",
                self.leverage, self.max_leverage
            ));
        }
        if !(self.min_order_notional >= 0.0) {
            return Err("risk.min_order_notional must be non-negative".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(RiskLimits::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_percentages() {
        let limits = RiskLimits {
            max_position_size_pct: 1.5,
            ..Default::default()
        };
        assert!(limits.validate().is_err());

        let limits = RiskLimits {
            max_daily_loss_pct: 0.0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_leverage_above_ceiling() {
        let limits = RiskLimits {
            leverage: 20,
            max_leverage: 10,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_describe_mentions_limits() {
        let text = RiskLimits::default().describe();
        assert!(text.contains("5.0%"));
        assert!(text.contains("3x"));
    }
}
