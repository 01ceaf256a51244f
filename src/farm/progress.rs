use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Booting,
    Minting,
}

/// Fixed phase lengths from configuration. The backend never reports them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PhaseDurations {
    pub boot: Duration,
    pub minting: Duration,
    pub grace: Duration,
}

impl PhaseDurations {
    pub fn expected(&self) -> Duration {
        self.boot.saturating_add(self.minting)
    }

    /// Elapsed time after which completion is inferred.
    pub fn completion_threshold(&self) -> Duration {
        self.expected().saturating_add(self.grace)
    }

    pub fn phase(&self, elapsed: Duration) -> Phase {
        if elapsed < self.boot {
            Phase::Booting
        } else {
            Phase::Minting
        }
    }
}

/// Heuristic progress display for a running session. Deposit accounting never reads it.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    durations: PhaseDurations,
    cap: u8,
    last_percent: u8,
}

impl ProgressEstimator {
    pub fn new(durations: PhaseDurations, cap: u8) -> Self {
        Self {
            durations,
            cap: cap.min(100),
            last_percent: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last_percent = 0;
    }

    pub fn phase(&self, elapsed: Duration) -> Phase {
        self.durations.phase(elapsed)
    }

    pub fn is_overdue(&self, elapsed: Duration) -> bool {
        elapsed > self.durations.completion_threshold()
    }

    /// Percent for display; never decreases between resets and never exceeds the cap.
    pub fn update(&mut self, elapsed: Duration) -> u8 {
        self.last_percent = self.peek(elapsed);
        self.last_percent
    }

    pub fn peek(&self, elapsed: Duration) -> u8 {
        raw_percent(elapsed, self.durations.expected(), self.cap).max(self.last_percent)
    }
}

fn raw_percent(elapsed: Duration, expected: Duration, cap: u8) -> u8 {
    let expected_ms = expected.as_millis();
    if expected_ms == 0 {
        return cap;
    }
    let ratio = elapsed.as_millis() as f64 / expected_ms as f64;
    let percent = (ratio * 100.0).round().clamp(0.0, f64::from(cap));
    percent as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durations() -> PhaseDurations {
        PhaseDurations {
            boot: Duration::from_millis(45_000),
            minting: Duration::from_millis(105_000),
            grace: Duration::from_millis(20_000),
        }
    }

    #[test]
    fn phase_switches_after_boot() {
        let d = durations();
        assert_eq!(d.phase(Duration::from_millis(44_999)), Phase::Booting);
        assert_eq!(d.phase(Duration::from_millis(45_000)), Phase::Minting);
    }

    #[test]
    fn percent_rounds_and_respects_cap() {
        let mut estimator = ProgressEstimator::new(durations(), 99);
        assert_eq!(estimator.update(Duration::ZERO), 0);
        assert_eq!(estimator.update(Duration::from_millis(75_000)), 50);
        assert_eq!(estimator.update(Duration::from_millis(149_000)), 99);
        assert_eq!(estimator.update(Duration::from_millis(400_000)), 99);
    }

    #[test]
    fn percent_can_reach_literal_completion_when_cap_is_100() {
        let mut estimator = ProgressEstimator::new(durations(), 100);
        assert_eq!(estimator.update(Duration::from_millis(150_000)), 100);
        assert_eq!(estimator.update(Duration::from_millis(200_000)), 100);
    }

    #[test]
    fn percent_never_decreases_until_reset() {
        let mut estimator = ProgressEstimator::new(durations(), 99);
        let samples = [0u64, 30_000, 90_000, 60_000, 10_000, 120_000, 1_000];
        let mut previous = 0;
        for ms in samples {
            let percent = estimator.update(Duration::from_millis(ms));
            assert!(percent >= previous);
            assert!(percent <= 99);
            previous = percent;
        }
        estimator.reset();
        assert_eq!(estimator.update(Duration::from_millis(1_500)), 1);
    }

    #[test]
    fn overdue_only_after_expected_plus_grace() {
        let estimator = ProgressEstimator::new(durations(), 99);
        assert!(!estimator.is_overdue(Duration::from_millis(170_000)));
        assert!(estimator.is_overdue(Duration::from_millis(170_001)));
    }

    #[test]
    fn zero_expected_duration_reports_cap() {
        let estimator = ProgressEstimator::new(
            PhaseDurations {
                boot: Duration::ZERO,
                minting: Duration::ZERO,
                grace: Duration::ZERO,
            },
            97,
        );
        assert_eq!(estimator.peek(Duration::ZERO), 97);
    }
}
