//! Curve evaluation with hysteresis and response smoothing.
//!
//! A source's curve is piecewise-linear between ordered points and clamped
//! at the endpoints. Oscillation control is a two-branch hysteresis: while
//! the temperature rises the curve is followed as given; while it falls the
//! effective input is shifted up by the hysteresis band, so the output
//! releases later than it engaged. The branch flips only once the
//! temperature has moved past the tracked extremum by the full band.
//!
//! Response smoothing is a first-order exponential with time constant
//! `response_tau_seconds`; tau of zero means instant response.

use std::time::Duration;

use crate::profile::types::{CurvePoint, SourceSettings};

/// Piecewise-linear lookup, clamped at both ends.
///
/// An empty curve evaluates to full duty - the safe direction for a fan.
pub fn evaluate_curve(points: &[CurvePoint], temp_c: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 100.0;
    };

    if temp_c <= first.temp_c {
        return first.percent;
    }
    if temp_c >= last.temp_c {
        return last.percent;
    }

    for window in points.windows(2) {
        let (lower, upper) = (&window[0], &window[1]);
        if temp_c >= lower.temp_c && temp_c <= upper.temp_c {
            let span = upper.temp_c - lower.temp_c;
            if span.abs() < f64::EPSILON {
                return lower.percent;
            }
            let ratio = (temp_c - lower.temp_c) / span;
            return lower.percent + ratio * (upper.percent - lower.percent);
        }
    }

    last.percent
}

/// Per-source evaluation state: hysteresis branch and smoothing history.
#[derive(Debug, Clone, Default)]
pub struct SourceState {
    rising: bool,
    /// Tracked extremum: the max seen while rising, the min while falling
    ref_temp: Option<f64>,
    smoothed: Option<f64>,
}

impl SourceState {
    /// Evaluate one source for the reduced temperature `temp_c`.
    ///
    /// `dt` is the real time elapsed since this source was last evaluated;
    /// the smoothing integral uses it regardless of why the tick fired.
    pub fn evaluate(
        &mut self,
        points: &[CurvePoint],
        settings: &SourceSettings,
        temp_c: f64,
        dt: Duration,
    ) -> f64 {
        let hysteresis = settings.hysteresis_c.max(0.0);

        match self.ref_temp {
            None => {
                self.rising = true;
                self.ref_temp = Some(temp_c);
            }
            Some(reference) => {
                if self.rising {
                    if temp_c <= reference - hysteresis {
                        self.rising = false;
                        self.ref_temp = Some(temp_c);
                    } else if temp_c > reference {
                        self.ref_temp = Some(temp_c);
                    }
                } else if temp_c >= reference + hysteresis {
                    self.rising = true;
                    self.ref_temp = Some(temp_c);
                } else if temp_c < reference {
                    self.ref_temp = Some(temp_c);
                }
            }
        }

        let target = if self.rising {
            evaluate_curve(points, temp_c)
        } else {
            evaluate_curve(points, temp_c + hysteresis)
        };

        let tau = settings.response_tau_seconds;
        let output = match (self.smoothed, tau > 0.0) {
            (Some(previous), true) => {
                let alpha = 1.0 - (-dt.as_secs_f64() / tau).exp();
                previous + (target - previous) * alpha
            }
            _ => target,
        };
        self.smoothed = Some(output);
        output
    }

    /// Drop accumulated history (used when a new profile is applied).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<CurvePoint> {
        vec![
            CurvePoint { temp_c: 30.0, percent: 20.0 },
            CurvePoint { temp_c: 60.0, percent: 80.0 },
        ]
    }

    fn settings(hysteresis_c: f64, tau: f64) -> SourceSettings {
        SourceSettings {
            hysteresis_c,
            response_tau_seconds: tau,
            ..SourceSettings::default()
        }
    }

    #[test]
    fn interpolation_and_clamping() {
        let p = points();
        assert_eq!(evaluate_curve(&p, 45.0), 50.0);
        assert_eq!(evaluate_curve(&p, 30.0), 20.0);
        assert_eq!(evaluate_curve(&p, 10.0), 20.0);
        assert_eq!(evaluate_curve(&p, 95.0), 80.0);
    }

    #[test]
    fn empty_curve_is_full_duty() {
        assert_eq!(evaluate_curve(&[], 40.0), 100.0);
    }

    #[test]
    fn curve_is_monotone_for_monotone_points() {
        let p = points();
        let mut previous = f64::MIN;
        let mut t = 0.0;
        while t <= 100.0 {
            let value = evaluate_curve(&p, t);
            assert!(value >= previous);
            previous = value;
            t += 0.5;
        }
    }

    #[test]
    fn hysteresis_two_branch_scenario() {
        // Points [(30,20),(60,80)], hysteresis 5, tau 0.
        let p = points();
        let s = settings(5.0, 0.0);
        let mut state = SourceState::default();
        let dt = Duration::from_millis(50);

        assert_eq!(state.evaluate(&p, &s, 45.0, dt), 50.0);
        assert_eq!(state.evaluate(&p, &s, 70.0, dt), 80.0);
        // Falling: effective curve input is T + hysteresis.
        assert_eq!(state.evaluate(&p, &s, 45.0, dt), 60.0);
        assert_eq!(state.evaluate(&p, &s, 35.0, dt), 40.0);
    }

    #[test]
    fn branch_flips_only_past_band() {
        let p = points();
        let s = settings(5.0, 0.0);
        let mut state = SourceState::default();
        let dt = Duration::from_millis(50);

        state.evaluate(&p, &s, 50.0, dt); // rising, ref 50
        // A 3-degree dip stays on the rising branch.
        assert_eq!(state.evaluate(&p, &s, 47.0, dt), evaluate_curve(&p, 47.0));
        // A full-band dip flips to falling.
        assert_eq!(state.evaluate(&p, &s, 45.0, dt), evaluate_curve(&p, 50.0));
        // Falling tracks the minimum; a small rebound does not flip back.
        state.evaluate(&p, &s, 40.0, dt);
        assert_eq!(state.evaluate(&p, &s, 43.0, dt), evaluate_curve(&p, 48.0));
        // Past min + band flips to rising again.
        assert_eq!(state.evaluate(&p, &s, 46.0, dt), evaluate_curve(&p, 46.0));
    }

    #[test]
    fn smoothing_converges_exponentially() {
        let p = points();
        let s = settings(0.0, 2.0);
        let mut state = SourceState::default();

        // First evaluation snaps to target.
        assert_eq!(state.evaluate(&p, &s, 30.0, Duration::ZERO), 20.0);

        // Step to 60 degC: after one tau the output covers ~63% of the gap.
        let one_tau = state.evaluate(&p, &s, 60.0, Duration::from_secs(2));
        let expected = 20.0 + (80.0 - 20.0) * (1.0 - (-1.0f64).exp());
        assert!((one_tau - expected).abs() < 1e-9);
        assert!(one_tau < 80.0);

        // Long dt converges to the target.
        let settled = state.evaluate(&p, &s, 60.0, Duration::from_secs(60));
        assert!((settled - 80.0).abs() < 0.01);
    }

    #[test]
    fn zero_tau_is_instant() {
        let p = points();
        let s = settings(0.0, 0.0);
        let mut state = SourceState::default();
        state.evaluate(&p, &s, 30.0, Duration::from_millis(50));
        assert_eq!(state.evaluate(&p, &s, 60.0, Duration::from_millis(50)), 80.0);
    }
}
