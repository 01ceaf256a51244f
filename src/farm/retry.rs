use std::time::{Duration, Instant};

use super::ui::{success, warn};

const RETRY_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Rate-limits log lines for a failing poller: the first failure (optionally) logs right
/// away, repeats at most every `RETRY_LOG_INTERVAL`, and one line marks the recovery.
#[derive(Debug, Default)]
pub(crate) struct RetryTracker {
    failures: u64,
    last_log_at: Option<Instant>,
    outage_logged: bool,
}

impl RetryTracker {
    pub(crate) fn failures(&self) -> u64 {
        self.failures
    }

    pub(crate) fn note_failure(&mut self, tag: &str, first: &str, repeat: &str, immediate_first: bool) {
        if self.should_log(Instant::now(), immediate_first) {
            let message = if self.failures == 1 { first } else { repeat };
            warn(tag, message);
        }
    }

    pub(crate) fn note_recovered(&mut self, tag: &str, message: &str) {
        if self.failures == 0 {
            return;
        }
        if self.outage_logged {
            success(tag, message);
        }
        *self = Self::default();
    }

    fn should_log(&mut self, now: Instant, immediate_first: bool) -> bool {
        self.failures = self.failures.saturating_add(1);
        let should_log = if self.failures == 1 {
            immediate_first
        } else {
            self.last_log_at
                .is_none_or(|last| now.saturating_duration_since(last) >= RETRY_LOG_INTERVAL)
        };
        if should_log {
            self.last_log_at = Some(now);
            self.outage_logged = true;
        }
        should_log
    }
}
