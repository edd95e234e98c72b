//! Recent-window versus baseline anomaly detection
//!
//! Every behavioral detector has the same shape: measure something recent, optionally
//! measure a historical baseline, compare with a fixed threshold, and score. The domain
//! consumers only supply the queries; thresholds and scoring live in
//! [`BaselineAnomalyDetector`] values.

use std::future::Future;
use tracing::{debug, warn};

use crate::core::errors::Result;
use crate::detection::signals::{clamp_confidence, Evidence, GeneratedSignal, SignalType};

/// One recent value against an optional baseline and spread
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub recent: f64,
    pub baseline: Option<f64>,
    pub spread: Option<f64>,
}

impl Measurement {
    pub fn count(recent: u64) -> Self {
        Self::value(recent as f64)
    }

    pub fn value(recent: f64) -> Self {
        Self {
            recent,
            baseline: None,
            spread: None,
        }
    }

    pub fn against(recent: f64, baseline: f64) -> Self {
        Self {
            recent,
            baseline: Some(baseline),
            spread: None,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = Some(spread);
        self
    }

    fn positive_baseline(&self) -> Option<f64> {
        self.baseline.filter(|b| *b > 0.0 && b.is_finite())
    }
}

/// When a measurement is anomalous. Ratio, z-score and deviation triggers never fire on a
/// zero or missing baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    CountAtLeast(f64),
    CountAbove(f64),
    /// `recent > k * baseline`
    RatioAbove(f64),
    /// `recent < k * baseline`
    RatioBelow(f64),
    /// `(recent - baseline) / baseline > k`; the baseline mean stands in for the deviation
    ZScoreAbove(f64),
    /// `recent > baseline + k * spread`
    DeviationAbove(f64),
    /// `lo <= recent < hi`
    WithinRange(f64, f64),
}

impl Trigger {
    /// The statistic that crossed the threshold, or `None` if it did not fire
    pub fn fire(&self, m: &Measurement) -> Option<f64> {
        match *self {
            Trigger::CountAtLeast(n) => (m.recent >= n).then_some(m.recent),
            Trigger::CountAbove(n) => (m.recent > n).then_some(m.recent),
            Trigger::RatioAbove(k) => {
                let b = m.positive_baseline()?;
                (m.recent > k * b).then(|| m.recent / b)
            }
            Trigger::RatioBelow(k) => {
                let b = m.positive_baseline()?;
                (m.recent < k * b).then(|| m.recent / b)
            }
            Trigger::ZScoreAbove(k) => {
                let b = m.positive_baseline()?;
                let z = (m.recent - b) / b;
                (z > k).then_some(z)
            }
            Trigger::DeviationAbove(k) => {
                let b = m.baseline?;
                let s = m.spread.filter(|s| *s > 0.0)?;
                (m.recent > b + k * s).then(|| (m.recent - b) / s)
            }
            Trigger::WithinRange(lo, hi) => (m.recent >= lo && m.recent < hi).then_some(m.recent),
        }
    }
}

/// How a fired detector is scored
#[derive(Clone, Copy)]
pub enum Confidence {
    Fixed(f64),
    /// `min(cap, base + step * (statistic - from))`
    Linear { base: f64, step: f64, from: f64, cap: f64 },
    Custom(fn(&Measurement, f64) -> f64),
}

impl std::fmt::Debug for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Fixed(c) => f.debug_tuple("Fixed").field(c).finish(),
            Confidence::Linear { base, step, from, cap } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("step", step)
                .field("from", from)
                .field("cap", cap)
                .finish(),
            Confidence::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Confidence {
    fn score(&self, m: &Measurement, statistic: f64) -> f64 {
        let raw = match *self {
            Confidence::Fixed(c) => c,
            Confidence::Linear { base, step, from, cap } => (base + step * (statistic - from)).min(cap),
            Confidence::Custom(f) => f(m, statistic),
        };
        clamp_confidence(raw)
    }
}

/// A fired detector
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub signal_type: SignalType,
    pub measurement: Measurement,
    pub statistic: f64,
    pub confidence: f64,
}

impl Finding {
    /// Build the signal, recording the measurement alongside the caller's evidence
    pub fn into_signal(self, evidence: Evidence) -> GeneratedSignal {
        let mut evidence = evidence.with("recent", self.measurement.recent);
        if let Some(baseline) = self.measurement.baseline {
            evidence = evidence.with("baseline", baseline);
        }
        if self.statistic != self.measurement.recent {
            evidence = evidence.with("statistic", self.statistic);
        }
        GeneratedSignal::new(self.signal_type, self.confidence, evidence)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BaselineAnomalyDetector {
    pub name: &'static str,
    pub signal_type: SignalType,
    pub trigger: Trigger,
    pub confidence: Confidence,
}

impl BaselineAnomalyDetector {
    pub fn evaluate(&self, m: &Measurement) -> Option<Finding> {
        let statistic = self.trigger.fire(m)?;
        Some(Finding {
            signal_type: self.signal_type,
            measurement: *m,
            statistic,
            confidence: self.confidence.score(m, statistic),
        })
    }

    /// Await the measurement and evaluate it. `Ok(None)` means the check does not apply
    /// to this event; a failed query is logged and treated as "no anomaly".
    pub async fn run<F>(&self, measure: F) -> Option<Finding>
    where
        F: Future<Output = Result<Option<Measurement>>>,
    {
        match measure.await {
            Ok(None) => None,
            Ok(Some(m)) => {
                let finding = self.evaluate(&m);
                debug!(
                    detector = self.name,
                    recent = m.recent,
                    baseline = ?m.baseline,
                    fired = finding.is_some(),
                    "Baseline check"
                );
                finding
            }
            Err(e) => {
                warn!(detector = self.name, error = %e, transient = e.is_transient(), "Baseline query failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DetectionError;
    use test_case::test_case;

    const BURST: BaselineAnomalyDetector = BaselineAnomalyDetector {
        name: "burst",
        signal_type: SignalType::TemporalBurstActivity,
        trigger: Trigger::ZScoreAbove(3.0),
        confidence: Confidence::Linear { base: 0.5, step: 0.1, from: 3.0, cap: 0.9 },
    };

    #[test_case(Trigger::CountAtLeast(3.0), Measurement::count(3), Some(3.0); "count at threshold")]
    #[test_case(Trigger::CountAbove(0.0), Measurement::count(0), None; "count above zero")]
    #[test_case(Trigger::RatioAbove(1.5), Measurement::against(4.0, 2.0), Some(2.0); "ratio fires")]
    #[test_case(Trigger::RatioAbove(1.5), Measurement::against(4.0, 0.0), None; "zero baseline skipped")]
    #[test_case(Trigger::RatioBelow(0.25), Measurement::against(10.0, 60.0), Some(10.0 / 60.0); "ratio below")]
    #[test_case(Trigger::DeviationAbove(2.0), Measurement::against(900.0, 100.0).with_spread(50.0), Some(16.0); "deviation")]
    #[test_case(Trigger::DeviationAbove(2.0), Measurement::against(900.0, 100.0).with_spread(0.0), None; "zero spread skipped")]
    #[test_case(Trigger::WithinRange(2.0, 5.0), Measurement::value(5.0), None; "range is half open")]
    fn test_trigger(trigger: Trigger, m: Measurement, expected: Option<f64>) {
        assert_eq!(trigger.fire(&m), expected);
    }

    #[test]
    fn test_z_score_uses_mean_as_deviation_proxy() {
        let finding = BURST.evaluate(&Measurement::against(20.0, 2.0)).unwrap();
        assert_eq!(finding.statistic, 9.0);
        assert_eq!(finding.confidence, 0.9);

        let mild = BURST.evaluate(&Measurement::against(9.0, 2.0)).unwrap();
        assert!((mild.confidence - 0.55).abs() < 1e-9);
        assert!(BURST.evaluate(&Measurement::against(8.0, 2.0)).is_none());
    }

    #[test]
    fn test_custom_confidence_is_clamped() {
        let detector = BaselineAnomalyDetector {
            name: "wild",
            signal_type: SignalType::BookingValueAnomaly,
            trigger: Trigger::CountAtLeast(1.0),
            confidence: Confidence::Custom(|_, stat| stat),
        };
        assert_eq!(detector.evaluate(&Measurement::count(7)).unwrap().confidence, 1.0);
    }

    #[tokio::test]
    async fn test_failed_query_yields_nothing() {
        let finding = BURST
            .run(async { Err(DetectionError::Storage("connection reset".to_string())) })
            .await;
        assert!(finding.is_none());
    }

    #[tokio::test]
    async fn test_finding_evidence_records_measurement() {
        let signal = BURST
            .run(async { Ok(Some(Measurement::against(20.0, 2.0))) })
            .await
            .unwrap()
            .into_signal(Evidence::default());
        assert_eq!(signal.signal_type, SignalType::TemporalBurstActivity);
        assert_eq!(signal.evidence.get("recent").and_then(|v| v.as_f64()), Some(20.0));
        assert_eq!(signal.evidence.get("statistic").and_then(|v| v.as_f64()), Some(9.0));
    }
}
