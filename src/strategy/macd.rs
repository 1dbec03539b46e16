// =============================================================================
// MACD (Moving Average Convergence Divergence) — seeded EMA variant
// =============================================================================
//
// Both EMAs are seeded with the first close (ema[0] = close[0]) rather than
// an SMA warm-up, and the signal line is seeded with macd[0]. This matches
// the Pine-Script convention the SpecialK detector was calibrated against:
// every input bar produces an output bar and the early values converge over
// roughly the first `slow` bars.
//
//   k     = 2 / (period + 1)
//   ema_t = close_t * k + ema_{t-1} * (1 - k)
// =============================================================================

/// Compute the MACD line and signal line over `closes`.
///
/// Returns `(macd_line, signal_line)`, each exactly `closes.len()` long.
/// Returns empty vectors for empty input or zero periods.
pub fn macd_lines(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<f64>, Vec<f64>) {
    if closes.is_empty() || fast == 0 || slow == 0 || signal == 0 {
        return (Vec::new(), Vec::new());
    }

    let k_fast = 2.0 / (fast as f64 + 1.0);
    let k_slow = 2.0 / (slow as f64 + 1.0);

    let mut ema_fast = closes[0];
    let mut ema_slow = closes[0];
    let mut macd_line = Vec::with_capacity(closes.len());
    macd_line.push(0.0);

    for &close in &closes[1..] {
        ema_fast = close * k_fast + ema_fast * (1.0 - k_fast);
        ema_slow = close * k_slow + ema_slow * (1.0 - k_slow);
        macd_line.push(ema_fast - ema_slow);
    }

    let k_sig = 2.0 / (signal as f64 + 1.0);
    let mut signal_line = Vec::with_capacity(macd_line.len());
    signal_line.push(macd_line[0]);
    let mut prev = macd_line[0];
    for &m in &macd_line[1..] {
        prev = m * k_sig + prev * (1.0 - k_sig);
        signal_line.push(prev);
    }

    (macd_line, signal_line)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        let (m, s) = macd_lines(&[], 12, 26, 9);
        assert!(m.is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn zero_period_guard() {
        let (m, s) = macd_lines(&[1.0, 2.0], 0, 26, 9);
        assert!(m.is_empty() && s.is_empty());
    }

    #[test]
    fn output_length_matches_input() {
        let closes: Vec<f64> = (1..=80).map(|i| i as f64).collect();
        let (m, s) = macd_lines(&closes, 12, 26, 9);
        assert_eq!(m.len(), 80);
        assert_eq!(s.len(), 80);
    }

    #[test]
    fn flat_prices_stay_zero() {
        let closes = vec![42.0; 60];
        let (m, s) = macd_lines(&closes, 12, 26, 9);
        for (a, b) in m.iter().zip(s.iter()) {
            assert!(a.abs() < 1e-12);
            assert!(b.abs() < 1e-12);
        }
    }

    #[test]
    fn uptrend_pushes_macd_above_signal() {
        // In a sustained uptrend the fast EMA leads the slow EMA, and the
        // MACD line leads its own signal.
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + i as f64).collect();
        let (m, s) = macd_lines(&closes, 12, 26, 9);
        let last = closes.len() - 1;
        assert!(m[last] > 0.0);
        assert!(m[last] > s[last]);
    }

    #[test]
    fn known_recurrence_values() {
        // Hand-rolled recurrence for a short series.
        let closes = vec![10.0, 11.0, 12.0, 11.5];
        let (m, _) = macd_lines(&closes, 2, 3, 2);
        let kf = 2.0 / 3.0;
        let ks = 2.0 / 4.0;
        let mut ef = 10.0;
        let mut es = 10.0;
        let mut expected = vec![0.0];
        for &c in &closes[1..] {
            ef = c * kf + ef * (1.0 - kf);
            es = c * ks + es * (1.0 - ks);
            expected.push(ef - es);
        }
        for (a, b) in m.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "got {a}, expected {b}");
        }
    }
}
