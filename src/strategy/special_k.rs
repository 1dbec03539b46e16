// =============================================================================
// SpecialK detector — MACD-gated multi-bar momentum vs a reference asset
// =============================================================================
//
// State walk over aligned subject/reference series:
//   1. A MACD(12,26,9) golden cross arms "monitoring" and anchors the start
//      prices (subject open, reference close). A death cross disarms.
//   2. While monitoring, green bars (close > open) grow a bull streak; a red
//      bar resets the streak and re-anchors both start prices.
//   3. The bar triggers when the streak length equals `lookback` AND the
//      subject's percent gain since the anchor beats `ratio` times the
//      reference's gain (a flat-or-falling reference accepts any positive
//      subject gain).
//
// Only a trigger landing on the FINAL bar is reported — historical triggers
// inside the window must not re-alert on every poll.
//
// Cross tie-break: equality with the signal line counts as "not yet
// crossed"; the cross requires `<=` on the previous bar and strict `>` (or
// `>=` / strict `<` for the death cross) on the current bar.
// =============================================================================

use crate::strategy::macd::macd_lines;

/// Minimum aligned series length the detector will evaluate.
const MIN_BARS: usize = 50;

/// Tunable parameters for the detector.
#[derive(Debug, Clone, Copy)]
pub struct SpecialKParams {
    /// Exact bull-streak length required at the trigger bar.
    pub lookback: usize,
    /// Required multiple of the reference gain.
    pub ratio: f64,
}

impl Default for SpecialKParams {
    fn default() -> Self {
        Self {
            lookback: 4,
            ratio: 1.5,
        }
    }
}

/// Run the detector. Returns `true` iff the most recent bar triggers.
///
/// `subject_closes`, `subject_opens` and `reference_closes` must cover the
/// same bars; series shorter than 50 bars never trigger.
pub fn run_special_k(
    subject_closes: &[f64],
    subject_opens: &[f64],
    reference_closes: &[f64],
    params: SpecialKParams,
) -> bool {
    let n = subject_closes.len();
    if n < MIN_BARS
        || subject_opens.len() < n
        || reference_closes.len() < n
    {
        return false;
    }

    let (macd_line, signal_line) = macd_lines(subject_closes, 12, 26, 9);

    let mut monitoring = false;
    let mut bull_count = 0usize;
    let mut start_price = 0.0;
    let mut ref_start_price = 0.0;
    let mut last_trigger: Option<usize> = None;

    for i in 1..n {
        let golden_cross =
            macd_line[i - 1] <= signal_line[i - 1] && macd_line[i] > signal_line[i];
        let death_cross =
            macd_line[i - 1] >= signal_line[i - 1] && macd_line[i] < signal_line[i];

        if golden_cross {
            monitoring = true;
            bull_count = 0;
            start_price = subject_opens[i];
            ref_start_price = reference_closes[i];
        }
        if death_cross {
            monitoring = false;
            bull_count = 0;
        }

        if monitoring {
            if subject_closes[i] > subject_opens[i] {
                bull_count += 1;
            } else {
                bull_count = 0;
                start_price = subject_opens[i];
                ref_start_price = reference_closes[i];
            }
        }

        let change = if start_price != 0.0 {
            (subject_closes[i] - start_price) / start_price * 100.0
        } else {
            0.0
        };
        let ref_change = if ref_start_price != 0.0 {
            (reference_closes[i] - ref_start_price) / ref_start_price * 100.0
        } else {
            0.0
        };

        let ratio_ok = if ref_change > 0.0 {
            change >= ref_change * params.ratio
        } else {
            change > 0.0
        };

        if monitoring && bull_count == params.lookback && ratio_ok {
            last_trigger = Some(i);
        }
    }

    last_trigger == Some(n - 1)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Subject series: 60 bars grinding down 0.15 from 100, 35 bars climbing
    /// 0.25 from 91 (arming the MACD cross), one shakeout bar resetting the
    /// bull streak, then four +1.22% bars forming the trigger streak.
    fn fixture_subject() -> (Vec<f64>, Vec<f64>) {
        let mut closes = Vec::with_capacity(100);
        for i in 0..60 {
            closes.push(100.0 - 0.15 * i as f64);
        }
        let mut v = 91.0;
        for _ in 0..35 {
            v += 0.25;
            closes.push(v);
        }
        closes.push(*closes.last().unwrap() - 0.3);
        let mut v = *closes.last().unwrap();
        for _ in 0..4 {
            v *= 1.0122;
            closes.push(v);
        }
        // Opens follow the prior close; the first bar opens slightly above.
        let mut opens = Vec::with_capacity(100);
        opens.push(closes[0] + 0.05);
        opens.extend_from_slice(&closes[..99]);
        (closes, opens)
    }

    /// Reference series: 96 bars ascending 0.1 from 3000, then four +0.25%
    /// bars — a mild uptrend the subject must outrun by the ratio.
    fn fixture_reference() -> Vec<f64> {
        let mut reference: Vec<f64> = (0..96).map(|i| 3000.0 + 0.1 * i as f64).collect();
        let mut v = *reference.last().unwrap();
        for _ in 0..4 {
            v *= 1.0025;
            reference.push(v);
        }
        reference
    }

    #[test]
    fn fixture_triggers_on_final_bar() {
        let (closes, opens) = fixture_subject();
        let reference = fixture_reference();
        assert!(run_special_k(
            &closes,
            &opens,
            &reference,
            SpecialKParams::default()
        ));
    }

    #[test]
    fn historical_trigger_does_not_report() {
        // Drop the final bar: the streak is only 3 long at the new terminal
        // bar, so nothing is reported even though the window armed earlier.
        let (closes, opens) = fixture_subject();
        let reference = fixture_reference();
        assert!(!run_special_k(
            &closes[..99],
            &opens[..99],
            &reference[..99],
            SpecialKParams::default()
        ));
    }

    #[test]
    fn flat_reference_accepts_any_gain() {
        let (closes, opens) = fixture_subject();
        let reference = vec![3000.0; 100];
        assert!(run_special_k(
            &closes,
            &opens,
            &reference,
            SpecialKParams::default()
        ));
    }

    #[test]
    fn subject_lagging_reference_is_rejected() {
        // Subject still prints four green bars but barely moves, while the
        // reference jumps 1% per bar — the ratio check must fail.
        let (mut closes, mut opens) = fixture_subject();
        let mut v = closes[95];
        for i in 0..4 {
            opens[96 + i] = v;
            v *= 1.0001;
            closes[96 + i] = v;
        }
        let mut reference: Vec<f64> = (0..96).map(|i| 3000.0 + 0.1 * i as f64).collect();
        let mut r = *reference.last().unwrap();
        for _ in 0..4 {
            r *= 1.01;
            reference.push(r);
        }
        assert!(!run_special_k(
            &closes,
            &opens,
            &reference,
            SpecialKParams::default()
        ));
    }

    #[test]
    fn short_series_never_triggers() {
        let (closes, opens) = fixture_subject();
        let reference = fixture_reference();
        assert!(!run_special_k(
            &closes[..40],
            &opens[..40],
            &reference[..40],
            SpecialKParams::default()
        ));
    }

    #[test]
    fn downtrend_never_triggers() {
        let closes: Vec<f64> = (0..100).map(|i| 500.0 - i as f64).collect();
        let mut opens = vec![closes[0] + 1.0];
        opens.extend_from_slice(&closes[..99]);
        let reference = fixture_reference();
        assert!(!run_special_k(
            &closes,
            &opens,
            &reference,
            SpecialKParams::default()
        ));
    }
}
