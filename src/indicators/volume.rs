// Volume and price-level indicators: OBV, VWAP, support/resistance

use crate::models::PriceBar;

/// On-balance volume for every bar, starting from the first bar's volume
pub fn calculate_obv_series(bars: &[PriceBar]) -> Vec<f64> {
    let Some(first) = bars.first() else {
        return Vec::new();
    };

    let mut obv = first.volume;
    let mut series = vec![obv];
    for w in bars.windows(2) {
        if w[1].close > w[0].close {
            obv += w[1].volume;
        } else if w[1].close < w[0].close {
            obv -= w[1].volume;
        }
        series.push(obv);
    }
    series
}

/// Average OBV change per bar over the last `lookback` bars
pub fn calculate_obv_slope(obv: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || obv.len() < lookback {
        return None;
    }
    let last = *obv.last()?;
    let earlier = obv[obv.len() - lookback];
    Some((last - earlier) / lookback as f64)
}

/// Volume-weighted close over the last `lookback` bars (fewer if not available)
pub fn calculate_vwap(bars: &[PriceBar], lookback: usize) -> Option<f64> {
    let window = &bars[bars.len().saturating_sub(lookback)..];
    let volume: f64 = window.iter().map(|b| b.volume).sum();
    if volume <= 0.0 {
        return None;
    }
    Some(window.iter().map(|b| b.close * b.volume).sum::<f64>() / volume)
}

/// Lowest low and highest high of the last `lookback` bars: (support, resistance)
pub fn calculate_support_resistance(bars: &[PriceBar], lookback: usize) -> Option<(f64, f64)> {
    if lookback == 0 || bars.len() < lookback {
        return None;
    }
    let window = &bars[bars.len() - lookback..];
    let support = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let resistance = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    Some((support, resistance))
}
