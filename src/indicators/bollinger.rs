use super::moving_average::calculate_sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Where the last price sits inside the bands: 0 at the lower band, 1 at the upper
    pub position: Option<f64>,
}

/// Bollinger Bands: SMA(period) ± k population standard deviations
pub fn calculate_bollinger(prices: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    let middle = calculate_sma(prices, period)?;
    let window = &prices[prices.len() - period..];

    let variance = window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / period as f64;
    let deviation = variance.sqrt();

    let upper = middle + k * deviation;
    let lower = middle - k * deviation;
    let last = *prices.last()?;

    let position = if upper > lower {
        Some((last - lower) / (upper - lower))
    } else {
        None
    };

    Some(BollingerBands {
        upper,
        middle,
        lower,
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_are_symmetric() {
        let prices: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 99.0 } else { 101.0 }).collect();
        let bands = calculate_bollinger(&prices, 20, 2.0).unwrap();

        assert!((bands.middle - 100.0).abs() < 1e-9);
        assert!((bands.upper - 102.0).abs() < 1e-9);
        assert!((bands.lower - 98.0).abs() < 1e-9);
        // last price 101 → 0.75 of the way up
        assert!((bands.position.unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_flat_prices_have_no_position() {
        let bands = calculate_bollinger(&[10.0; 25], 20, 2.0).unwrap();
        assert_eq!(bands.upper, bands.lower);
        assert!(bands.position.is_none());
    }
}
