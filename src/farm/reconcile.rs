use std::time::{Duration, Instant};

use crate::types::SessionRecord;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReconcileAction {
    None,
    Clear { orphans: usize },
}

/// Decides, once per instance, whether backend sessions for the connected wallet are
/// orphans from another instance. Ownership lives only in this process, so right after
/// startup nothing on the backend can be ours unless we started it.
#[derive(Debug)]
pub struct StaleSessionReconciler {
    window: Duration,
    first_status_at: Option<Instant>,
    orphans: usize,
    clearing: bool,
    resolved: bool,
}

impl StaleSessionReconciler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first_status_at: None,
            orphans: 0,
            clearing: false,
            resolved: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// A `Clear` has been handed out and its reply has not come back yet.
    pub fn is_clearing(&self) -> bool {
        self.clearing
    }

    pub fn orphans(&self) -> usize {
        self.orphans
    }

    /// Records a status fetch. Ignored until a wallet is connected, since only sessions
    /// scoped to that wallet are considered.
    pub fn observe_status(&mut self, wallet: Option<&str>, sessions: &[SessionRecord], now: Instant) {
        if self.resolved {
            return;
        }
        let Some(wallet) = wallet else {
            return;
        };
        self.first_status_at.get_or_insert(now);
        self.orphans = sessions
            .iter()
            .filter(|session| session.is_active() && session.belongs_to(wallet))
            .count();
    }

    pub fn poll(&mut self, started_in_this_instance: bool, now: Instant) -> ReconcileAction {
        if self.resolved || self.clearing {
            return ReconcileAction::None;
        }
        let Some(first) = self.first_status_at else {
            return ReconcileAction::None;
        };
        if now.saturating_duration_since(first) < self.window {
            return ReconcileAction::None;
        }
        if started_in_this_instance || self.orphans == 0 {
            self.resolved = true;
            return ReconcileAction::None;
        }
        self.clearing = true;
        ReconcileAction::Clear {
            orphans: self.orphans,
        }
    }

    pub fn on_cleared(&mut self) {
        self.clearing = false;
        self.resolved = true;
        self.orphans = 0;
    }

    /// A failed clear waits one more window before it is retried.
    pub fn on_clear_failed(&mut self, now: Instant) {
        self.clearing = false;
        self.first_status_at = Some(now);
    }
}
