use serde::Serialize;

use crate::types::DepositRecord;

/// Position in the per-wallet deposit feed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum Cursor {
    /// No session is running.
    Unset,
    /// Session started; the next poll establishes the baseline and reports nothing.
    Pending,
    /// Highest version already accounted for. `0` means the wallet had no prior history.
    At(u64),
}

impl Cursor {
    pub fn version(self) -> Option<u64> {
        match self {
            Self::At(version) => Some(version),
            Self::Unset | Self::Pending => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DepositQuery {
    Baseline,
    Since(u64),
}

impl DepositQuery {
    pub fn since_version(self) -> Option<u64> {
        match self {
            Self::Baseline => None,
            Self::Since(version) => Some(version),
        }
    }

    /// The baseline only ever needs the single most recent record.
    pub fn limit(self, batch_limit: u32) -> u32 {
        match self {
            Self::Baseline => 1,
            Self::Since(_) => batch_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DepositOutcome {
    Baseline { cursor: u64, prior_history: bool },
    Minted { amount: u64, records: usize, cursor: u64 },
    Empty,
    /// The reply no longer matches the outstanding query and was ignored.
    Stale,
}

#[derive(Debug, Clone)]
pub struct DepositTracker {
    cursor: Cursor,
    total_minted: u64,
    in_flight: Option<DepositQuery>,
}

impl Default for DepositTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DepositTracker {
    pub fn new() -> Self {
        Self {
            cursor: Cursor::Unset,
            total_minted: 0,
            in_flight: None,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn total_minted(&self) -> u64 {
        self.total_minted
    }

    pub fn begin(&mut self) {
        self.cursor = Cursor::Pending;
        self.in_flight = None;
    }

    /// Clears cursor and total. Only called on the transition into idle.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Next query to issue, or `None` while a poll is outstanding or no session is
    /// tracked. Polls are serialized because each `since` depends on the previous reply.
    pub fn next_query(&self) -> Option<DepositQuery> {
        if self.in_flight.is_some() {
            return None;
        }
        match self.cursor {
            Cursor::Unset => None,
            Cursor::Pending => Some(DepositQuery::Baseline),
            Cursor::At(version) => Some(DepositQuery::Since(version)),
        }
    }

    pub fn mark_in_flight(&mut self, query: DepositQuery) {
        self.in_flight = Some(query);
    }

    /// Forget the outstanding poll without touching cursor or total; its reply will be
    /// reported as stale.
    pub fn cancel_in_flight(&mut self) {
        self.in_flight = None;
    }

    pub fn fail(&mut self, query: DepositQuery) {
        if self.in_flight == Some(query) {
            self.in_flight = None;
        }
    }

    pub fn apply(&mut self, query: DepositQuery, records: &[DepositRecord]) -> DepositOutcome {
        if self.in_flight != Some(query) {
            return DepositOutcome::Stale;
        }
        self.in_flight = None;

        match (query, self.cursor) {
            (DepositQuery::Baseline, Cursor::Pending) => {
                let latest = records.iter().map(|record| record.version).max();
                let cursor = latest.unwrap_or(0);
                self.cursor = Cursor::At(cursor);
                DepositOutcome::Baseline {
                    cursor,
                    prior_history: latest.is_some(),
                }
            }
            (DepositQuery::Since(since), Cursor::At(current)) if since == current => {
                let mut amount = 0u64;
                let mut count = 0usize;
                let mut max_version = current;
                // The backend may treat `since` inclusively; anything at or below the
                // cursor has already been counted.
                for record in records.iter().filter(|record| record.version > current) {
                    amount = amount.saturating_add(record.amount);
                    count += 1;
                    max_version = max_version.max(record.version);
                }
                if count == 0 {
                    return DepositOutcome::Empty;
                }
                self.total_minted = self.total_minted.saturating_add(amount);
                self.cursor = Cursor::At(max_version);
                DepositOutcome::Minted {
                    amount,
                    records: count,
                    cursor: max_version,
                }
            }
            _ => DepositOutcome::Stale,
        }
    }
}
