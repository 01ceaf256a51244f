use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Poller {
    Tick,
    Deposits,
    Status,
    Overview,
}

/// Interval and next deadline per periodic poller.
#[derive(Debug, Default)]
pub struct PollSchedule {
    entries: BTreeMap<Poller, (Duration, Instant)>,
}

impl PollSchedule {
    /// Every poller is due immediately on the first step.
    pub fn new(intervals: &[(Poller, Duration)], now: Instant) -> Self {
        let mut entries = BTreeMap::new();
        for (poller, interval) in intervals {
            entries.insert(*poller, ((*interval).max(Duration::from_millis(1)), now));
        }
        Self { entries }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(_, next_due)| *next_due).min()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<Poller> {
        let mut due = Vec::new();
        for (poller, (interval, next_due)) in self.entries.iter_mut() {
            if now < *next_due {
                continue;
            }
            due.push(*poller);
            *next_due = now + *interval;
        }
        due
    }

    /// Pulls a poller forward so it runs on the next step.
    pub fn trigger(&mut self, poller: Poller, now: Instant) {
        if let Some((_, next_due)) = self.entries.get_mut(&poller) {
            *next_due = (*next_due).min(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pollers_fire_on_their_own_intervals() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(
            &[
                (Poller::Tick, Duration::from_secs(1)),
                (Poller::Status, Duration::from_secs(10)),
            ],
            t0,
        );
        assert_eq!(schedule.take_due(t0), vec![Poller::Tick, Poller::Status]);
        assert!(schedule.take_due(t0 + Duration::from_millis(999)).is_empty());
        assert_eq!(
            schedule.take_due(t0 + Duration::from_secs(1)),
            vec![Poller::Tick]
        );
        assert_eq!(
            schedule.next_deadline(),
            Some(t0 + Duration::from_secs(2))
        );
    }

    #[test]
    fn trigger_pulls_deadline_forward() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(&[(Poller::Status, Duration::from_secs(10))], t0);
        schedule.take_due(t0);
        let later = t0 + Duration::from_secs(2);
        schedule.trigger(Poller::Status, later);
        assert_eq!(schedule.take_due(later), vec![Poller::Status]);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(&[(Poller::Tick, Duration::ZERO)], t0);
        schedule.take_due(t0);
        assert_eq!(schedule.next_deadline(), Some(t0 + Duration::from_millis(1)));
    }
}
