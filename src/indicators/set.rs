use std::collections::BTreeMap;

use super::{
    calculate_adx, calculate_atr, calculate_bollinger, calculate_ema, calculate_macd,
    calculate_natr, calculate_obv_series, calculate_obv_slope, calculate_rsi, calculate_sma,
    calculate_support_resistance, calculate_vwap,
};
use crate::models::{IndicatorSet, PriceBar};

const VWAP_LOOKBACK: usize = 50;
const LEVELS_LOOKBACK: usize = 20;
const OBV_SLOPE_LOOKBACK: usize = 5;

/// Build the indicator set from a series of closed bars (oldest first)
///
/// Values whose lookback is not covered are left out. Returns None for an
/// empty series.
pub fn build_indicator_set(bars: &[PriceBar]) -> Option<IndicatorSet> {
    let last = bars.last()?;
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let mut values = BTreeMap::new();
    let mut put = |name: &str, value: Option<f64>| {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            values.insert(name.to_string(), v);
        }
    };

    put("open", Some(last.open));
    put("high", Some(last.high));
    put("low", Some(last.low));
    put("close", Some(last.close));
    put("volume", Some(last.volume));

    put("ema20", calculate_ema(&closes, 20));
    put("ema50", calculate_ema(&closes, 50));
    put("sma20", calculate_sma(&closes, 20));
    put("rsi7", calculate_rsi(&closes, 7));
    put("rsi14", calculate_rsi(&closes, 14));

    if let Some(macd) = calculate_macd(&closes, 12, 26, 9) {
        put("macd", Some(macd.macd));
        put("macd_signal", Some(macd.signal));
        put("macd_histogram", Some(macd.histogram));
    }

    put("atr14", calculate_atr(bars, 14));
    put("natr14", calculate_natr(bars, 14));

    if let Some(bands) = calculate_bollinger(&closes, 20, 2.0) {
        put("bb_upper", Some(bands.upper));
        put("bb_middle", Some(bands.middle));
        put("bb_lower", Some(bands.lower));
        put("bb_position", bands.position);
    }

    if let Some((adx, plus_di, minus_di)) = calculate_adx(bars, 14) {
        put("adx14", Some(adx));
        put("plus_di", Some(plus_di));
        put("minus_di", Some(minus_di));
    }

    let obv = calculate_obv_series(bars);
    put("obv", obv.last().copied());
    put("obv_slope", calculate_obv_slope(&obv, OBV_SLOPE_LOOKBACK));
    put("vwap", calculate_vwap(bars, VWAP_LOOKBACK));

    if let Some((support, resistance)) = calculate_support_resistance(bars, LEVELS_LOOKBACK) {
        put("support", Some(support));
        put("resistance", Some(resistance));
    }

    Some(IndicatorSet {
        symbol: last.symbol.clone(),
        timeframe: last.timeframe,
        as_of: last.close_time,
        values,
    })
}
