// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line   = EMA(fast) - EMA(slow)
//   Signal line = EMA(MACD line, signal period)
//   Histogram   = MACD line - signal line
// =============================================================================

use super::ema::calculate_ema;

/// Latest MACD reading.
#[derive(Debug, Clone)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD values for `closes`.
///
/// Returns `None` when there is not enough data to produce a signal value
/// (needs at least `slow + signal - 1` closes).
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal - 1 {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);

    // Align the two series on their tails; the slow EMA is the shorter one.
    let len = ema_slow.len().min(ema_fast.len());
    if len == 0 {
        return None;
    }
    let fast_tail = &ema_fast[ema_fast.len() - len..];
    let slow_tail = &ema_slow[ema_slow.len() - len..];

    let macd_line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal);
    let signal_val = *signal_series.last()?;
    let macd_val = *macd_line.last()?;

    let histogram = macd_val - signal_val;
    if !histogram.is_finite() {
        return None;
    }

    Some(MacdResult {
        macd: macd_val,
        signal: signal_val,
        histogram,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_bad_periods() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn macd_uptrend_positive() {
        // In a steady uptrend the fast EMA stays above the slow EMA.
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.macd > 0.0);
    }

    #[test]
    fn macd_downtrend_negative() {
        let closes: Vec<f64> = (1..=120).rev().map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.macd < 0.0);
    }

    #[test]
    fn macd_flat_is_zero() {
        let closes = vec![100.0; 120];
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.macd.abs() < 1e-10);
        assert!(macd.histogram.abs() < 1e-10);
    }
}
