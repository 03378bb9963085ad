use chrono::{Duration, Utc};

use crate::models::PriceBar;
use crate::Result;

/// Tolerated clock skew between the exchange and this host
const MAX_CLOCK_SKEW_SECS: i64 = 5;

/// Validates incoming bars for sanity before they reach the cache
#[derive(Debug, Default, Clone, Copy)]
pub struct BarValidator;

impl BarValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a bar for correctness
    pub fn validate(&self, bar: &PriceBar) -> Result<()> {
        self.validate_prices(bar)?;
        self.validate_timestamps(bar)?;
        self.validate_ohlc_relationship(bar)?;
        Ok(())
    }

    /// All prices positive and finite, volume non-negative
    fn validate_prices(&self, bar: &PriceBar) -> Result<()> {
        for (name, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("Invalid {} price: {}", name, value).into());
            }
        }
        if !bar.volume.is_finite() || bar.volume < 0.0 {
            return Err(format!("Invalid volume: {}", bar.volume).into());
        }
        Ok(())
    }

    fn validate_timestamps(&self, bar: &PriceBar) -> Result<()> {
        if bar.close_time <= bar.open_time {
            return Err(format!(
                "Close time {} is not after open time {}",
                bar.close_time, bar.open_time
            )
            .into());
        }

        let now = Utc::now();
        if bar.open_time > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(format!(
                "Bar open time is in the future: {} (now: {})",
                bar.open_time, now
            )
            .into());
        }
        Ok(())
    }

    /// High bounds everything from above, low from below
    fn validate_ohlc_relationship(&self, bar: &PriceBar) -> Result<()> {
        if bar.high < bar.low {
            return Err(format!("High ({}) is less than low ({})", bar.high, bar.low).into());
        }
        if bar.high < bar.open.max(bar.close) {
            return Err(format!(
                "High ({}) is below open/close ({}/{})",
                bar.high, bar.open, bar.close
            )
            .into());
        }
        if bar.low > bar.open.min(bar.close) {
            return Err(format!(
                "Low ({}) is above open/close ({}/{})",
                bar.low, bar.open, bar.close
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;

    fn make_valid_bar() -> PriceBar {
        let open_time = Utc::now() - Duration::hours(2);
        PriceBar {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::H1,
            open_time,
            close_time: open_time + Duration::hours(1) - Duration::milliseconds(1),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 1000000.0,
            is_closed: true,
        }
    }

    #[test]
    fn test_validate_valid_bar() {
        assert!(BarValidator::new().validate(&make_valid_bar()).is_ok());
    }

    #[test]
    fn test_validate_negative_open() {
        let mut bar = make_valid_bar();
        bar.open = -100.0;

        let result = BarValidator::new().validate(&bar);
        assert!(result.unwrap_err().to_string().contains("Invalid open price"));
    }

    #[test]
    fn test_validate_nan_close() {
        let mut bar = make_valid_bar();
        bar.close = f64::NAN;
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_validate_negative_volume() {
        let mut bar = make_valid_bar();
        bar.volume = -1.0;
        let result = BarValidator::new().validate(&bar);
        assert!(result.unwrap_err().to_string().contains("Invalid volume"));
    }

    #[test]
    fn test_zero_volume_allowed() {
        let mut bar = make_valid_bar();
        bar.volume = 0.0;
        assert!(BarValidator::new().validate(&bar).is_ok());
    }

    #[test]
    fn test_validate_high_below_low() {
        let mut bar = make_valid_bar();
        bar.high = 98.0;
        let result = BarValidator::new().validate(&bar);
        assert!(result.unwrap_err().to_string().contains("less than low"));
    }

    #[test]
    fn test_validate_close_outside_range() {
        let mut bar = make_valid_bar();
        bar.close = 105.0;
        assert!(BarValidator::new().validate(&bar).is_err());

        let mut bar = make_valid_bar();
        bar.open = 98.5;
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_validate_future_bar() {
        let mut bar = make_valid_bar();
        bar.open_time = Utc::now() + Duration::hours(1);
        bar.close_time = bar.open_time + Duration::hours(1);
        let result = BarValidator::new().validate(&bar);
        assert!(result.unwrap_err().to_string().contains("future"));
    }
}
