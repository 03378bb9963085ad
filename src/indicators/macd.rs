use super::moving_average::calculate_ema_series;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Moving Average Convergence Divergence
///
/// MACD line = EMA(fast) - EMA(slow), signal = EMA(signal) of the MACD line.
/// Needs `slow + signal - 1` prices.
pub fn calculate_macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow || signal == 0 || prices.len() < slow + signal - 1 {
        return None;
    }

    let fast_ema = calculate_ema_series(prices, fast);
    let slow_ema = calculate_ema_series(prices, slow);

    // fast series starts (slow - fast) prices earlier
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();

    let signal_line = calculate_ema_series(&macd_line, signal);
    let macd = *macd_line.last()?;
    let signal = *signal_line.last()?;

    Some(Macd {
        macd,
        signal,
        histogram: macd - signal,
    })
}
