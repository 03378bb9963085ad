/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing (same as RSI and ADX) for the moving average.
use crate::models::PriceBar;

/// True range of every bar after the first
pub(crate) fn true_ranges(bars: &[PriceBar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect()
}

/// Wilder's smoothing: seed with the mean of the first `period` values, then
/// `s = (s * (period - 1) + v) / period`
pub(crate) fn wilder_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let p = period as f64;
    let mut smoothed = values[..period].iter().sum::<f64>() / p;
    let mut series = vec![smoothed];
    for value in &values[period..] {
        smoothed = (smoothed * (p - 1.0) + value) / p;
        series.push(smoothed);
    }
    series
}

/// Calculate ATR for the given bars
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(bars: &[PriceBar], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }
    wilder_series(&true_ranges(bars), period).last().copied()
}

/// Normalized ATR: ATR as a percentage of the last close
pub fn calculate_natr(bars: &[PriceBar], period: usize) -> Option<f64> {
    let atr = calculate_atr(bars, period)?;
    let close = bars.last()?.close;
    if close <= 0.0 {
        return None;
    }
    Some(atr / close * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_bars;

    #[test]
    fn test_calculate_atr() {
        // Low volatility market
        let bars = test_bars(&[(100.0, 101.0, 99.0, 100.0); 15]);
        let atr = calculate_atr(&bars, 14).unwrap();

        // ATR should be around 2.0 (high-low range)
        assert!(atr > 1.5 && atr < 2.5);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        let bars = test_bars(&[
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 110.0, 98.0, 105.0),
            (105.0, 108.0, 92.0, 95.0),
            (95.0, 103.0, 88.0, 100.0),
            (100.0, 115.0, 97.0, 110.0),
            (110.0, 112.0, 95.0, 98.0),
            (98.0, 108.0, 90.0, 105.0),
            (105.0, 120.0, 100.0, 115.0),
            (115.0, 118.0, 105.0, 110.0),
            (110.0, 125.0, 108.0, 120.0),
            (120.0, 130.0, 115.0, 125.0),
            (125.0, 128.0, 110.0, 115.0),
            (115.0, 122.0, 105.0, 118.0),
            (118.0, 130.0, 115.0, 125.0),
            (125.0, 135.0, 120.0, 130.0),
        ]);

        assert!(calculate_atr(&bars, 14).unwrap() > 10.0);
    }

    #[test]
    fn test_natr_is_percentage_of_close() {
        let bars = test_bars(&[(100.0, 101.0, 99.0, 100.0); 20]);
        let natr = calculate_natr(&bars, 14).unwrap();
        assert!((natr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_data() {
        let bars = test_bars(&[(100.0, 101.0, 99.0, 100.0); 2]);
        assert!(calculate_atr(&bars, 14).is_none());
        assert!(calculate_natr(&bars, 14).is_none());
    }

    #[test]
    fn test_wilder_series_length() {
        let values = vec![1.0; 20];
        assert_eq!(wilder_series(&values, 14).len(), 7);
        assert!(wilder_series(&values[..5], 14).is_empty());
    }
}
