/// Average Directional Index (ADX) - Measures trend strength
///
/// ADX ranges from 0 to 100:
/// - ADX > 25: Strong trend (bull or bear)
/// - ADX 20-25: Moderate trend
/// - ADX < 20: Weak trend / choppy / ranging market
///
/// Also returns +DI and -DI to determine trend direction:
/// - +DI > -DI: Uptrend
/// - -DI > +DI: Downtrend
use super::atr::{true_ranges, wilder_series};
use crate::models::PriceBar;

/// Calculate ADX, +DI, and -DI for trend strength and direction
///
/// ADX is the Wilder-smoothed DX, so it needs `2 * period` bars; +DI/-DI
/// alone need `period + 1`. Returns (adx, plus_di, minus_di).
pub fn calculate_adx(bars: &[PriceBar], period: usize) -> Option<(f64, f64, f64)> {
    if period == 0 || bars.len() < 2 * period {
        return None;
    }

    let trs = true_ranges(bars);
    let (plus_dms, minus_dms): (Vec<f64>, Vec<f64>) = bars
        .windows(2)
        .map(|w| {
            let up_move = w[1].high - w[0].high;
            let down_move = w[0].low - w[1].low;
            let plus_dm = if up_move > down_move && up_move > 0.0 {
                up_move
            } else {
                0.0
            };
            let minus_dm = if down_move > up_move && down_move > 0.0 {
                down_move
            } else {
                0.0
            };
            (plus_dm, minus_dm)
        })
        .unzip();

    let smoothed_tr = wilder_series(&trs, period);
    let smoothed_plus = wilder_series(&plus_dms, period);
    let smoothed_minus = wilder_series(&minus_dms, period);

    let mut dx_series = Vec::with_capacity(smoothed_tr.len());
    let mut last_di = (0.0, 0.0);
    for ((tr, plus), minus) in smoothed_tr.iter().zip(&smoothed_plus).zip(&smoothed_minus) {
        let (plus_di, minus_di) = if *tr > 0.0 {
            (plus / tr * 100.0, minus / tr * 100.0)
        } else {
            (0.0, 0.0)
        };
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        };
        dx_series.push(dx);
        last_di = (plus_di, minus_di);
    }

    let adx = wilder_series(&dx_series, period).last().copied()?;
    Some((adx, last_di.0, last_di.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_bars;

    #[test]
    fn test_adx_strong_uptrend() {
        let prices: Vec<(f64, f64, f64, f64)> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 3.0;
                (base, base + 4.0, base - 1.0, base + 3.0)
            })
            .collect();

        let bars = test_bars(&prices);
        let (adx, plus_di, minus_di) = calculate_adx(&bars, 14).unwrap();

        assert!(plus_di > minus_di, "+DI should be > -DI in uptrend");
        assert!(adx > 25.0, "steady uptrend should read as strong, got {:.2}", adx);
    }

    #[test]
    fn test_adx_choppy_market() {
        let prices: Vec<(f64, f64, f64, f64)> = (0..40)
            .map(|i| {
                if i % 2 == 0 {
                    (100.0, 103.0, 97.0, 101.0)
                } else {
                    (101.0, 102.0, 98.0, 99.0)
                }
            })
            .collect();

        let bars = test_bars(&prices);
        let (adx, _, _) = calculate_adx(&bars, 14).unwrap();
        assert!(adx < 40.0, "ADX should be lower in choppy market, got {:.2}", adx);
    }

    #[test]
    fn test_adx_insufficient_data() {
        let bars = test_bars(&[(100.0, 102.0, 99.0, 101.0); 20]);
        assert!(calculate_adx(&bars, 14).is_none());
    }
}
