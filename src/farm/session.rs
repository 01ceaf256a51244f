use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::api::{is_capacity_error, ApiStatusError};
use crate::types::{DepositRecord, StartSessionResponse};

use super::deposits::{Cursor, DepositOutcome, DepositQuery, DepositTracker};
use super::gateway::{GatewayCall, StopReason};
use super::notify::{Notification, Notifier};
use super::progress::{Phase, PhaseDurations, ProgressEstimator};
use super::retry::RetryTracker;
use super::ui::{info, success, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Complete,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Complete => "complete",
        }
    }

    /// States in which this instance owns a live backend session.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Session {
    pub id: String,
    pub wallet: String,
    pub requested_workers: u32,
    pub worker_count: u32,
    pub started_at: Instant,
    pub expected_yield: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryOutcome {
    Completed,
    Stopped,
}

/// Read-only record of a finished run, captured before any cleanup is issued.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub wallet: String,
    pub worker_count: u32,
    pub minted: u64,
    pub elapsed_ms: u64,
    pub expected_yield: u64,
    pub outcome: SummaryOutcome,
}

impl SessionSummary {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// One-shot guard shared by inferred completion and user stop. Whichever path flips it
/// first performs the teardown side effects; the other becomes a no-op.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: bool,
}

impl CompletionLatch {
    pub fn try_fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn rearm(&mut self) {
        self.fired = false;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ActionError {
    NoWallet,
    InvalidWorkers { requested: u32, max: u32 },
    AlreadyActive(SessionState),
    NothingToStop(SessionState),
    NotComplete(SessionState),
    Reconciling,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWallet => write!(f, "connect a wallet before starting a session"),
            Self::InvalidWorkers { requested, max } => {
                write!(f, "worker count must be between 1 and {max} (got {requested})")
            }
            Self::AlreadyActive(state) => write!(f, "a session is already {state}"),
            Self::NothingToStop(state) => {
                write!(f, "no running session to stop (session is {state})")
            }
            Self::NotComplete(state) => write!(f, "nothing to dismiss (session is {state})"),
            Self::Reconciling => {
                write!(f, "stale backend sessions are being cleared; retry in a moment")
            }
        }
    }
}

impl std::error::Error for ActionError {}

#[derive(Debug, Clone, Copy)]
pub struct FarmSettings {
    pub durations: PhaseDurations,
    pub progress_cap: u8,
    pub deposit_limit: u32,
    pub expected_mint_per_worker: u64,
    pub max_workers: u32,
}

impl FarmSettings {
    pub fn expected_yield(&self, workers: u32) -> u64 {
        u64::from(workers).saturating_mul(self.expected_mint_per_worker)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub generation: u64,
    pub started_in_this_instance: bool,
    pub session_id: Option<String>,
    pub wallet: Option<String>,
    pub requested_workers: Option<u32>,
    pub worker_count: Option<u32>,
    pub percent: u8,
    pub phase: Option<Phase>,
    pub elapsed_ms: Option<u64>,
    pub expected_ms: u64,
    pub total_minted: u64,
    pub expected_yield: Option<u64>,
    pub cursor: Cursor,
    pub summary: Option<SessionSummary>,
    pub last_error: Option<String>,
}

/// Authoritative lifecycle for one running instance:
/// `idle -> starting -> running -> stopping -> complete -> idle`.
///
/// Every method takes the current `Instant` instead of reading the clock so the machine
/// can be driven deterministically. Gateway work is returned as a [`GatewayCall`] for the
/// caller to execute; replies come back through the `on_*` methods and are dropped when
/// their generation no longer matches.
pub struct FarmSession {
    settings: FarmSettings,
    notifier: Arc<dyn Notifier>,
    state: SessionState,
    generation: u64,
    started_in_this_instance: bool,
    pending_start: Option<(String, u32)>,
    session: Option<Session>,
    tracker: DepositTracker,
    progress: ProgressEstimator,
    percent: u8,
    latch: CompletionLatch,
    stop_snapshot: Option<SessionSummary>,
    summary: Option<SessionSummary>,
    last_error: Option<String>,
    deposit_retry: RetryTracker,
}

impl FarmSession {
    pub fn new(settings: FarmSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            progress: ProgressEstimator::new(settings.durations, settings.progress_cap),
            settings,
            notifier,
            state: SessionState::Idle,
            generation: 0,
            started_in_this_instance: false,
            pending_start: None,
            session: None,
            tracker: DepositTracker::new(),
            percent: 0,
            latch: CompletionLatch::default(),
            stop_snapshot: None,
            summary: None,
            last_error: None,
            deposit_retry: RetryTracker::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_in_this_instance(&self) -> bool {
        self.started_in_this_instance
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn total_minted(&self) -> u64 {
        self.tracker.total_minted()
    }

    pub fn cursor(&self) -> Cursor {
        self.tracker.cursor()
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn start(&mut self, wallet: Option<&str>, workers: u32) -> Result<GatewayCall, ActionError> {
        if self.state.is_active() {
            return Err(ActionError::AlreadyActive(self.state));
        }
        let Some(wallet) = wallet else {
            return Err(self.reject(ActionError::NoWallet));
        };
        if workers == 0 || workers > self.settings.max_workers {
            return Err(self.reject(ActionError::InvalidWorkers {
                requested: workers,
                max: self.settings.max_workers,
            }));
        }
        if self.state == SessionState::Complete {
            self.enter_idle();
        }

        self.started_in_this_instance = true;
        self.last_error = None;
        self.state = SessionState::Starting;
        self.generation += 1;
        self.pending_start = Some((wallet.to_string(), workers));
        info("FARM", format!("requesting {workers} workers for {wallet}"));
        Ok(GatewayCall::StartSession {
            generation: self.generation,
            wallet: wallet.to_string(),
            workers,
        })
    }

    /// Applies the start reply. Returns a cleanup call when the backend created a session
    /// with no workers in it.
    pub fn on_started(
        &mut self,
        generation: u64,
        requested: u32,
        result: Result<StartSessionResponse>,
        now: Instant,
    ) -> Option<GatewayCall> {
        if self.state != SessionState::Starting || generation != self.generation {
            warn("FARM", "ignoring start reply for a superseded request");
            return None;
        }
        let (wallet, _) = self.pending_start.take()?;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let message = if is_capacity_error(&err) {
                    let detail = err
                        .downcast_ref::<ApiStatusError>()
                        .map(|api_err| api_err.message().to_string())
                        .unwrap_or_default();
                    format!("backend is at capacity, no workers started: {detail}")
                } else {
                    format!("failed to start session: {err:#}")
                };
                self.fail_start(message);
                return None;
            }
        };

        let worker_count = response.worker_count();
        if worker_count == 0 {
            self.fail_start(format!(
                "no workers could be started for session {} (capacity or provisioning failure)",
                response.session_id
            ));
            return Some(GatewayCall::StopSession {
                generation: self.generation,
                session_id: response.session_id,
                reason: StopReason::Abandoned,
            });
        }

        let expected_yield = self.settings.expected_yield(worker_count);
        self.state = SessionState::Running;
        self.generation += 1;
        self.tracker.begin();
        self.progress.reset();
        self.percent = 0;
        self.latch.rearm();
        self.summary = None;
        self.stop_snapshot = None;
        self.deposit_retry = RetryTracker::default();
        self.notifier.notify(Notification::Started {
            session_id: response.session_id.clone(),
            worker_count,
            requested,
            expected_yield,
        });
        self.session = Some(Session {
            id: response.session_id,
            wallet,
            requested_workers: requested,
            worker_count,
            started_at: now,
            expected_yield,
        });
        None
    }

    /// Progress tick. Infers completion once elapsed time passes boot + minting + grace.
    pub fn tick(&mut self, now: Instant) -> Option<GatewayCall> {
        if self.state != SessionState::Running {
            return None;
        }
        let session = self.session.as_ref()?;
        let elapsed = now.saturating_duration_since(session.started_at);
        self.percent = self.progress.update(elapsed);

        if !self.progress.is_overdue(elapsed) || !self.latch.try_fire() {
            return None;
        }

        let summary = self.capture_summary(session, elapsed, SummaryOutcome::Completed);
        let session_id = session.id.clone();
        self.state = SessionState::Complete;
        self.generation += 1;
        self.tracker.cancel_in_flight();
        self.summary = Some(summary.clone());
        self.notifier.notify(Notification::Completed(summary));
        Some(GatewayCall::StopSession {
            generation: self.generation,
            session_id,
            reason: StopReason::Completed,
        })
    }

    pub fn stop(&mut self, now: Instant) -> Result<GatewayCall, ActionError> {
        if self.state != SessionState::Running {
            return Err(ActionError::NothingToStop(self.state));
        }
        let Some(session) = self.session.as_ref() else {
            return Err(ActionError::NothingToStop(self.state));
        };
        if !self.latch.try_fire() {
            return Err(ActionError::NothingToStop(self.state));
        }

        let elapsed = now.saturating_duration_since(session.started_at);
        let snapshot = self.capture_summary(session, elapsed, SummaryOutcome::Stopped);
        let session_id = session.id.clone();
        self.stop_snapshot = Some(snapshot);
        self.state = SessionState::Stopping;
        self.generation += 1;
        self.tracker.cancel_in_flight();
        info("FARM", format!("stopping session {session_id}"));
        Ok(GatewayCall::StopSession {
            generation: self.generation,
            session_id,
            reason: StopReason::UserRequested,
        })
    }

    pub fn on_stopped(&mut self, generation: u64, reason: StopReason, result: Result<()>) {
        match reason {
            StopReason::UserRequested => self.settle_user_stop(generation, result),
            StopReason::Completed | StopReason::Abandoned => match result {
                Ok(()) => info("FARM", "backend session cleaned up"),
                Err(err) => warn("FARM", format!("session cleanup failed: {err:#}")),
            },
        }
    }

    fn settle_user_stop(&mut self, generation: u64, result: Result<()>) {
        if self.state != SessionState::Stopping || generation != self.generation {
            return;
        }
        match result {
            Ok(()) => {
                self.state = SessionState::Complete;
                self.summary = self.stop_snapshot.take();
                if let Some(summary) = self.summary.clone() {
                    self.notifier.notify(Notification::Stopped(summary));
                }
            }
            Err(err) => {
                self.state = SessionState::Running;
                self.generation += 1;
                self.latch.rearm();
                self.stop_snapshot = None;
                let message = format!("failed to stop session, still running: {err:#}");
                self.last_error = Some(message.clone());
                self.notifier.notify(Notification::error(message));
            }
        }
    }

    /// Next deposit poll, gated on `running` past the boot phase with no poll outstanding.
    pub fn poll_deposits(&mut self, now: Instant) -> Option<GatewayCall> {
        if self.state != SessionState::Running {
            return None;
        }
        let session = self.session.as_ref()?;
        let elapsed = now.saturating_duration_since(session.started_at);
        if self.progress.phase(elapsed) != Phase::Minting {
            return None;
        }
        let query = self.tracker.next_query()?;
        let wallet = session.wallet.clone();
        self.tracker.mark_in_flight(query);
        Some(GatewayCall::Deposits {
            generation: self.generation,
            wallet,
            query,
            limit: self.settings.deposit_limit,
        })
    }

    pub fn on_deposits(
        &mut self,
        generation: u64,
        query: DepositQuery,
        result: Result<Vec<DepositRecord>>,
    ) {
        if self.state != SessionState::Running || generation != self.generation {
            return;
        }
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                self.tracker.fail(query);
                self.deposit_retry.note_failure(
                    "DEPOSITS",
                    &format!("deposit poll failed; retrying: {err:#}"),
                    "deposit poll still failing; retrying",
                    false,
                );
                return;
            }
        };
        self.deposit_retry
            .note_recovered("DEPOSITS", "deposit poll recovered");

        match self.tracker.apply(query, &records) {
            DepositOutcome::Baseline {
                cursor,
                prior_history,
            } => {
                let history = if prior_history { "prior history" } else { "no prior history" };
                info("DEPOSITS", format!("baseline cursor={cursor} ({history})"));
            }
            DepositOutcome::Minted { amount, records, .. } => {
                self.notifier.notify(Notification::Minted {
                    amount,
                    records,
                    total: self.tracker.total_minted(),
                });
            }
            DepositOutcome::Empty | DepositOutcome::Stale => {}
        }
    }

    pub fn dismiss(&mut self) -> Result<(), ActionError> {
        if self.state != SessionState::Complete {
            return Err(ActionError::NotComplete(self.state));
        }
        self.enter_idle();
        success("FARM", "ready for a new session");
        Ok(())
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let elapsed = self
            .session
            .as_ref()
            .map(|session| now.saturating_duration_since(session.started_at));
        let live = matches!(self.state, SessionState::Running | SessionState::Stopping);
        let percent = if self.state == SessionState::Complete {
            100
        } else {
            self.percent
        };
        SessionSnapshot {
            state: self.state,
            generation: self.generation,
            started_in_this_instance: self.started_in_this_instance,
            session_id: self.session.as_ref().map(|session| session.id.clone()),
            wallet: self
                .session
                .as_ref()
                .map(|session| session.wallet.clone())
                .or_else(|| self.pending_start.as_ref().map(|(wallet, _)| wallet.clone())),
            requested_workers: self
                .session
                .as_ref()
                .map(|session| session.requested_workers)
                .or_else(|| self.pending_start.as_ref().map(|(_, workers)| *workers)),
            worker_count: self.session.as_ref().map(|session| session.worker_count),
            percent,
            phase: elapsed
                .filter(|_| live)
                .map(|elapsed| self.progress.phase(elapsed)),
            elapsed_ms: elapsed
                .filter(|_| live)
                .map(duration_ms),
            expected_ms: duration_ms(self.settings.durations.expected()),
            total_minted: self.tracker.total_minted(),
            expected_yield: self.session.as_ref().map(|session| session.expected_yield),
            cursor: self.tracker.cursor(),
            summary: self.summary.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn capture_summary(
        &self,
        session: &Session,
        elapsed: Duration,
        outcome: SummaryOutcome,
    ) -> SessionSummary {
        let minted = match self.progress.phase(elapsed) {
            Phase::Booting => 0,
            Phase::Minting => self.tracker.total_minted(),
        };
        SessionSummary {
            session_id: session.id.clone(),
            wallet: session.wallet.clone(),
            worker_count: session.worker_count,
            minted,
            elapsed_ms: duration_ms(elapsed),
            expected_yield: session.expected_yield,
            outcome,
        }
    }

    fn reject(&mut self, err: ActionError) -> ActionError {
        self.last_error = Some(err.to_string());
        self.notifier.notify(Notification::error(err.to_string()));
        err
    }

    fn fail_start(&mut self, message: String) {
        self.enter_idle();
        self.last_error = Some(message.clone());
        self.notifier.notify(Notification::error(message));
    }

    /// The only place cursor and total are cleared.
    fn enter_idle(&mut self) {
        self.state = SessionState::Idle;
        self.generation += 1;
        self.pending_start = None;
        self.session = None;
        self.tracker.reset();
        self.progress.reset();
        self.percent = 0;
        self.latch.rearm();
        self.stop_snapshot = None;
        self.summary = None;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
