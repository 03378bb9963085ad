// Technical indicators module
// Pure functions over closed bars, plus the IndicatorSet builder used by the market cache

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod macd;
pub mod moving_average;
pub mod rsi;
pub mod set;
pub mod volume;

pub use adx::calculate_adx;
pub use atr::{calculate_atr, calculate_natr};
pub use bollinger::{calculate_bollinger, BollingerBands};
pub use macd::{calculate_macd, Macd};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
pub use set::build_indicator_set;
pub use volume::{
    calculate_obv_series, calculate_obv_slope, calculate_support_resistance, calculate_vwap,
};

/// Longest lookback among the indicators (EMA50); fewer closed bars is insufficient data
pub const REQUIRED_BARS: usize = 50;

#[cfg(test)]
pub(crate) fn test_bars(prices: &[(f64, f64, f64, f64)]) -> Vec<crate::models::PriceBar> {
    use crate::models::{PriceBar, Timeframe};
    use chrono::{Duration, TimeZone, Utc};

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    prices
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| {
            let open_time = start + Duration::hours(i as i64);
            PriceBar {
                symbol: "TEST".to_string(),
                timeframe: Timeframe::H1,
                open_time,
                close_time: open_time + Duration::hours(1) - Duration::milliseconds(1),
                open,
                high,
                low,
                close,
                volume: 1000.0,
                is_closed: true,
            }
        })
        .collect()
}
