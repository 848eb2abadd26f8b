// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band (SMA), upper band (SMA + k*σ), lower band (SMA - k*σ). The
// Band Width is the normalised distance (upper - lower) / middle * 100, and
// %B locates the last close within the bands (0 = lower, 1 = upper).

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
    /// Position of the last close within the bands: 0 at the lower band,
    /// 1 at the upper band, 0.5 when the bands collapse.
    pub percent_b: f64,
}

/// Calculate Bollinger Bands over the most recent `period` closes.
///
/// Returns `None` when:
/// - Fewer than `period` data points.
/// - Middle band is zero (degenerate input).
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    let middle = sum / period as f64;

    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    let last = *window.last()?;
    let percent_b = if upper > lower {
        (last - lower) / (upper - lower)
    } else {
        0.5
    };

    if width.is_finite() && percent_b.is_finite() {
        Some(BollingerResult {
            upper,
            middle,
            lower,
            width,
            percent_b,
        })
    } else {
        None
    }
}
