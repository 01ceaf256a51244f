use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{never, Receiver, Sender};
use serde::Serialize;

use crate::types::{Overview, SessionRecord};

use super::gateway::{GatewayCall, GatewayReply, SessionGateway, StopReason};
use super::notify::{Notification, Notifier};
use super::reconcile::{ReconcileAction, StaleSessionReconciler};
use super::retry::RetryTracker;
use super::schedule::{PollSchedule, Poller};
use super::session::{ActionError, FarmSession, FarmSettings, SessionSnapshot, SessionState};
use super::stats::format_tokens;
use super::ui::{info, warn};
use super::wallet::{WalletConnection, WalletSource};
use super::worker::GatewayWorker;

const MIN_WAIT: Duration = Duration::from_millis(1);
const MAX_WAIT: Duration = Duration::from_millis(100);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub farm: FarmSettings,
    pub default_workers: u32,
    pub token_decimals: u32,
    pub tick: Duration,
    pub deposit_poll: Duration,
    pub status_poll: Duration,
    pub overview_poll: Duration,
    pub reconcile_window: Duration,
}

pub enum FarmCommand {
    Start {
        workers: Option<u32>,
        reply: Sender<Result<(), ActionError>>,
    },
    Stop {
        reply: Sender<Result<(), ActionError>>,
    },
    Dismiss {
        reply: Sender<Result<(), ActionError>>,
    },
    ConnectWallet {
        address: String,
        reply: Sender<Result<String>>,
    },
    DisconnectWallet {
        reply: Sender<Option<String>>,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitPolicy {
    /// Leave once the session reaches `complete` and its cleanup has settled.
    WhenComplete,
    /// Run until shutdown; an interrupt also counts as shutdown.
    OnShutdown,
}

#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub interrupt: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    pub session: SessionSnapshot,
    pub wallet: Option<String>,
    pub network: Option<Overview>,
    pub backend_active_sessions: Option<usize>,
    pub reconciled: bool,
}

pub type SnapshotSink = Box<dyn FnMut(&DriverSnapshot) + Send>;

/// Single-threaded cooperative loop around one [`FarmSession`]. Pollers fire from a
/// deadline schedule, gateway calls go to a background worker, and replies are applied
/// back on this thread, so the session is only ever mutated here.
pub struct FarmDriver {
    settings: DriverSettings,
    session: FarmSession,
    reconciler: StaleSessionReconciler,
    worker: GatewayWorker,
    notifier: Arc<dyn Notifier>,
    schedule: PollSchedule,
    wallet: WalletConnection,
    overview: Option<Overview>,
    backend_active: Option<usize>,
    status_pending: bool,
    overview_pending: bool,
    cleanups_pending: usize,
    auto_start: Option<u32>,
    stop_after_start: bool,
    status_retry: RetryTracker,
    overview_retry: RetryTracker,
    snapshot_sink: Option<SnapshotSink>,
    dirty: bool,
}

impl FarmDriver {
    pub fn new(
        settings: DriverSettings,
        gateway: Arc<dyn SessionGateway>,
        notifier: Arc<dyn Notifier>,
        wallet: WalletConnection,
    ) -> Result<Self> {
        let now = Instant::now();
        Ok(Self {
            session: FarmSession::new(settings.farm, Arc::clone(&notifier)),
            reconciler: StaleSessionReconciler::new(settings.reconcile_window),
            worker: GatewayWorker::spawn(gateway)?,
            notifier,
            schedule: PollSchedule::new(
                &[
                    (Poller::Tick, settings.tick),
                    (Poller::Deposits, settings.deposit_poll),
                    (Poller::Status, settings.status_poll),
                    (Poller::Overview, settings.overview_poll),
                ],
                now,
            ),
            settings,
            wallet,
            overview: None,
            backend_active: None,
            status_pending: false,
            overview_pending: false,
            cleanups_pending: 0,
            auto_start: None,
            stop_after_start: false,
            status_retry: RetryTracker::default(),
            overview_retry: RetryTracker::default(),
            snapshot_sink: None,
            dirty: true,
        })
    }

    /// Starts a session with `workers` once reconciliation has settled.
    pub fn with_auto_start(mut self, workers: u32) -> Self {
        self.auto_start = Some(workers);
        self
    }

    pub fn set_snapshot_sink(&mut self, sink: SnapshotSink) {
        self.snapshot_sink = Some(sink);
        self.dirty = true;
    }

    pub fn session(&self) -> &FarmSession {
        &self.session
    }

    pub fn snapshot(&self, now: Instant) -> DriverSnapshot {
        DriverSnapshot {
            session: self.session.snapshot(now),
            wallet: self.wallet.address().map(str::to_string),
            network: self.overview.clone(),
            backend_active_sessions: self.backend_active,
            reconciled: self.reconciler.is_resolved(),
        }
    }

    pub fn start(&mut self, workers: Option<u32>) -> Result<(), ActionError> {
        let workers = workers.unwrap_or(self.settings.default_workers);
        if self.reconciler.is_clearing() {
            return Err(ActionError::Reconciling);
        }
        let call = self.session.start(self.wallet.address(), workers)?;
        self.submit(call);
        self.dirty = true;
        Ok(())
    }

    pub fn stop(&mut self, now: Instant) -> Result<(), ActionError> {
        let call = self.session.stop(now)?;
        self.submit(call);
        self.dirty = true;
        Ok(())
    }

    pub fn dismiss(&mut self) -> Result<(), ActionError> {
        self.session.dismiss()?;
        self.dirty = true;
        Ok(())
    }

    pub fn connect_wallet(&mut self, raw: &str, source: WalletSource, now: Instant) -> Result<String> {
        let address = self.wallet.connect(raw, source)?.to_string();
        info("WALLET", format!("connected {address} via {}", source.as_str()));
        self.schedule.trigger(Poller::Status, now);
        self.dirty = true;
        Ok(address)
    }

    pub fn disconnect_wallet(&mut self) -> Option<String> {
        let previous = self.wallet.disconnect();
        if let Some(address) = previous.as_deref() {
            info("WALLET", format!("disconnected {address}"));
        }
        self.dirty = true;
        previous
    }

    pub fn step(&mut self, now: Instant) {
        while let Some(reply) = self.worker.try_recv() {
            self.handle_reply(reply, now);
        }

        for poller in self.schedule.take_due(now) {
            match poller {
                Poller::Tick => {
                    if let Some(call) = self.session.tick(now) {
                        self.submit(call);
                    }
                    if self.session.state() == SessionState::Running {
                        self.dirty = true;
                    }
                }
                Poller::Deposits => {
                    if let Some(call) = self.session.poll_deposits(now) {
                        self.submit(call);
                    }
                }
                Poller::Status => {
                    if !self.status_pending {
                        let wallet = self.wallet.address().map(str::to_string);
                        self.submit(GatewayCall::Status { wallet });
                    }
                }
                Poller::Overview => {
                    if !self.overview_pending {
                        self.submit(GatewayCall::Overview);
                    }
                }
            }
        }

        if let ReconcileAction::Clear { orphans } = self
            .reconciler
            .poll(self.session.started_in_this_instance(), now)
        {
            warn(
                "RECONCILE",
                format!("{orphans} active session(s) from another instance; clearing backend"),
            );
            self.submit(GatewayCall::ClearAll { orphans });
        }

        self.maybe_auto_start();
        if self.stop_after_start && self.session.state() == SessionState::Running {
            self.stop_after_start = false;
            if let Err(err) = self.stop(now) {
                warn("FARM", err.to_string());
            }
        }

        self.publish(now);
    }

    pub fn run(
        &mut self,
        commands: Option<&Receiver<FarmCommand>>,
        signals: &Signals,
        policy: ExitPolicy,
    ) -> Result<()> {
        let mut replies = self.worker.replies().clone();
        let mut commands = commands.cloned().unwrap_or_else(never);

        let result = loop {
            if signals.shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }
            let now = Instant::now();
            if signals.interrupt.swap(false, Ordering::AcqRel)
                && (policy == ExitPolicy::OnShutdown || !self.on_interrupt(now))
            {
                break Ok(());
            }

            self.step(now);
            if policy == ExitPolicy::WhenComplete {
                if let Some(outcome) = self.farm_outcome() {
                    break outcome;
                }
            }

            let wait = self.wait_for(Instant::now());
            let mut replies_closed = false;
            let mut commands_closed = false;
            crossbeam_channel::select! {
                recv(replies) -> reply => match reply {
                    Ok(reply) => self.handle_reply(reply, Instant::now()),
                    Err(_) => replies_closed = true,
                },
                recv(commands) -> command => match command {
                    Ok(command) => self.handle_command(command, Instant::now()),
                    Err(_) => commands_closed = true,
                },
                default(wait) => {}
            }
            if replies_closed {
                replies = never();
            }
            if commands_closed {
                commands = never();
            }
        };

        self.shutdown();
        result
    }

    /// Stops a live session best-effort, then joins the gateway threads.
    pub fn shutdown(&mut self) {
        if self.session.state() == SessionState::Running && self.stop(Instant::now()).is_ok() {
            let deadline = Instant::now() + SHUTDOWN_WAIT;
            while self.session.state() == SessionState::Stopping && Instant::now() < deadline {
                if let Ok(reply) = self.worker.replies().recv_timeout(MAX_WAIT) {
                    self.handle_reply(reply, Instant::now());
                }
            }
        }
        self.publish(Instant::now());
        if !self.worker.shutdown_for(SHUTDOWN_WAIT) {
            warn("GATEWAY", "gateway calls still in flight at exit; detaching");
        }
    }

    fn on_interrupt(&mut self, now: Instant) -> bool {
        match self.session.state() {
            SessionState::Running => {
                if let Err(err) = self.stop(now) {
                    warn("FARM", err.to_string());
                }
                warn("FARM", "press Ctrl-C again to exit without waiting for cleanup");
                true
            }
            SessionState::Starting => {
                self.stop_after_start = true;
                warn(
                    "FARM",
                    "session is still starting; it will be stopped once running (Ctrl-C again to exit)",
                );
                true
            }
            SessionState::Stopping => {
                info("FARM", "already stopping; waiting for cleanup");
                true
            }
            SessionState::Idle | SessionState::Complete => false,
        }
    }

    fn farm_outcome(&self) -> Option<Result<()>> {
        if self.cleanups_pending > 0 {
            return None;
        }
        match self.session.state() {
            SessionState::Complete => Some(Ok(())),
            SessionState::Idle if self.auto_start.is_none() => Some(Err(anyhow!(
                "{}",
                self.session.last_error().unwrap_or("no session was started")
            ))),
            _ => None,
        }
    }

    fn maybe_auto_start(&mut self) {
        let Some(workers) = self.auto_start else {
            return;
        };
        if self.wallet.is_connected() && !self.reconciler.is_resolved() {
            return;
        }
        self.auto_start = None;
        if let Err(err) = self.start(Some(workers)) {
            warn("FARM", err.to_string());
        }
    }

    fn handle_command(&mut self, command: FarmCommand, now: Instant) {
        match command {
            FarmCommand::Start { workers, reply } => {
                let result = self.start(workers);
                self.publish(now);
                let _ = reply.send(result);
            }
            FarmCommand::Stop { reply } => {
                let result = self.stop(now);
                self.publish(now);
                let _ = reply.send(result);
            }
            FarmCommand::Dismiss { reply } => {
                let result = self.dismiss();
                self.publish(now);
                let _ = reply.send(result);
            }
            FarmCommand::ConnectWallet { address, reply } => {
                let result = self.connect_wallet(&address, WalletSource::ControlApi, now);
                self.publish(now);
                let _ = reply.send(result);
            }
            FarmCommand::DisconnectWallet { reply } => {
                let result = self.disconnect_wallet();
                self.publish(now);
                let _ = reply.send(result);
            }
        }
    }

    fn handle_reply(&mut self, reply: GatewayReply, now: Instant) {
        self.dirty = true;
        match reply {
            GatewayReply::Started {
                generation,
                requested,
                result,
            } => {
                if let Some(cleanup) = self.session.on_started(generation, requested, result, now) {
                    self.submit(cleanup);
                }
                self.schedule.trigger(Poller::Status, now);
            }
            GatewayReply::Stopped {
                generation,
                reason,
                result,
            } => {
                if reason != StopReason::UserRequested {
                    self.cleanups_pending = self.cleanups_pending.saturating_sub(1);
                }
                self.session.on_stopped(generation, reason, result);
                self.schedule.trigger(Poller::Status, now);
            }
            GatewayReply::Cleared { orphans, result } => match result {
                Ok(()) => {
                    self.reconciler.on_cleared();
                    self.backend_active = Some(0);
                    self.notifier
                        .notify(Notification::OrphansCleared { sessions: orphans });
                    self.schedule.trigger(Poller::Status, now);
                }
                Err(err) => {
                    self.reconciler.on_clear_failed(now);
                    warn("RECONCILE", format!("failed to clear stale sessions: {err:#}"));
                }
            },
            GatewayReply::Deposits {
                generation,
                query,
                result,
            } => self.session.on_deposits(generation, query, result),
            GatewayReply::Status { wallet, result } => {
                self.status_pending = false;
                match result {
                    Ok(sessions) => {
                        self.status_retry.note_recovered("STATUS", "status poll recovered");
                        self.apply_status(wallet.as_deref(), &sessions, now);
                    }
                    Err(err) => self.status_retry.note_failure(
                        "STATUS",
                        &format!("status poll failed: {err:#}"),
                        "status poll still failing",
                        true,
                    ),
                }
            }
            GatewayReply::Overview { result } => {
                self.overview_pending = false;
                match result {
                    Ok(overview) => {
                        self.overview_retry
                            .note_recovered("NETWORK", "overview poll recovered");
                        if self.overview.as_ref() != Some(&overview) {
                            info(
                                "NETWORK",
                                format!(
                                    "sessions={} active={} workers={} minted~{}",
                                    overview.total_sessions,
                                    overview.active_sessions,
                                    overview.total_bots,
                                    format_tokens(
                                        overview.estimated_total_minted,
                                        self.settings.token_decimals
                                    )
                                ),
                            );
                        }
                        self.overview = Some(overview);
                    }
                    Err(err) => self.overview_retry.note_failure(
                        "NETWORK",
                        &format!("overview poll failed: {err:#}"),
                        "overview poll still failing",
                        false,
                    ),
                }
            }
        }
    }

    fn apply_status(&mut self, wallet: Option<&str>, sessions: &[SessionRecord], now: Instant) {
        let active = sessions
            .iter()
            .filter(|session| session.is_active())
            .filter(|session| wallet.is_none_or(|wallet| session.belongs_to(wallet)))
            .count();
        if self.backend_active != Some(active) {
            let scope = wallet.unwrap_or("all wallets");
            info("STATUS", format!("backend reports {active} active session(s) for {scope}"));
        }
        self.backend_active = Some(active);
        self.reconciler.observe_status(wallet, sessions, now);
    }

    fn submit(&mut self, call: GatewayCall) {
        let is_status = matches!(call, GatewayCall::Status { .. });
        let is_overview = matches!(call, GatewayCall::Overview);
        let is_cleanup = matches!(
            call,
            GatewayCall::StopSession {
                reason: StopReason::Completed | StopReason::Abandoned,
                ..
            }
        );
        if let Err(err) = self.worker.submit(call) {
            warn("GATEWAY", format!("{err:#}"));
            return;
        }
        self.status_pending |= is_status;
        self.overview_pending |= is_overview;
        if is_cleanup {
            self.cleanups_pending += 1;
        }
    }

    fn publish(&mut self, now: Instant) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if self.snapshot_sink.is_none() {
            return;
        }
        let snapshot = self.snapshot(now);
        if let Some(sink) = self.snapshot_sink.as_mut() {
            sink(&snapshot);
        }
    }

    fn wait_for(&self, now: Instant) -> Duration {
        self.schedule
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(MAX_WAIT)
            .clamp(MIN_WAIT, MAX_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossbeam_channel::bounded;

    use crate::farm::gateway::testing::{deposit, ScriptedGateway};
    use crate::farm::notify::testing::RecordingNotifier;
    use crate::farm::progress::PhaseDurations;
    use crate::farm::session::SummaryOutcome;

    const WALLET: &str = "0xabc";

    fn settings(boot_ms: u64, mint_ms: u64) -> DriverSettings {
        DriverSettings {
            farm: FarmSettings {
                durations: PhaseDurations {
                    boot: Duration::from_millis(boot_ms),
                    minting: Duration::from_millis(mint_ms),
                    grace: Duration::from_millis(10),
                },
                progress_cap: 99,
                deposit_limit: 25,
                expected_mint_per_worker: 1_000,
                max_workers: 50,
            },
            default_workers: 3,
            token_decimals: 0,
            tick: Duration::from_millis(2),
            deposit_poll: Duration::from_millis(2),
            status_poll: Duration::from_millis(20),
            overview_poll: Duration::from_millis(50),
            reconcile_window: Duration::from_millis(10),
        }
    }

    fn driver_with(
        gateway: &Arc<ScriptedGateway>,
        settings: DriverSettings,
        wallet: Option<&str>,
    ) -> (FarmDriver, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut connection = WalletConnection::default();
        if let Some(wallet) = wallet {
            connection
                .connect(wallet, WalletSource::CliFlag)
                .expect("valid wallet");
        }
        let driver = FarmDriver::new(settings, gateway.clone(), notifier.clone(), connection)
            .expect("driver should spawn");
        (driver, notifier)
    }

    fn pump_until(driver: &mut FarmDriver, done: impl Fn(&FarmDriver) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(driver) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            driver.step(Instant::now());
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn orphan() -> SessionRecord {
        SessionRecord {
            id: "stale".to_string(),
            wallet_address: Some(WALLET.to_string()),
            status: "active".to_string(),
            worker_count: Some(4),
            started_at: None,
        }
    }

    #[test]
    fn fresh_instance_clears_orphan_and_stays_idle() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.statuses.lock().expect("status lock").push(orphan());
        let (mut driver, notifier) = driver_with(&gateway, settings(10, 50), Some(WALLET));

        pump_until(&mut driver, |driver| driver.reconciler.is_resolved());
        assert_eq!(gateway.count("clear"), 1);
        assert_eq!(notifier.count("orphans_cleared"), 1);
        assert_eq!(driver.session().state(), SessionState::Idle);
        assert!(driver.snapshot(Instant::now()).reconciled);
        driver.shutdown();
    }

    #[test]
    fn start_is_refused_until_orphan_clear_settles() {
        let gateway = Arc::new(ScriptedGateway::with_workers(1));
        gateway.statuses.lock().expect("status lock").push(orphan());
        *gateway.clear_delay.lock().expect("clear lock") = Duration::from_millis(200);
        let (mut driver, notifier) = driver_with(&gateway, settings(10, 10_000), Some(WALLET));

        pump_until(&mut driver, |driver| driver.reconciler.is_clearing());
        assert_eq!(driver.start(Some(1)), Err(ActionError::Reconciling));
        assert_eq!(driver.session().state(), SessionState::Idle);

        pump_until(&mut driver, |driver| driver.reconciler.is_resolved());
        driver.start(Some(1)).expect("start accepted after clear");
        pump_until(&mut driver, |driver| {
            driver.session().state() == SessionState::Running
        });

        let calls = gateway.calls();
        let clear_at = calls.iter().position(|call| call == "clear").expect("clear call");
        let start_at = calls
            .iter()
            .position(|call| call.starts_with("start:"))
            .expect("start call");
        assert!(clear_at < start_at, "clear must reach the backend first: {calls:?}");
        assert_eq!(gateway.count("start:"), 1);
        assert_eq!(notifier.count("orphans_cleared"), 1);
        driver.shutdown();
    }

    #[test]
    fn farm_run_completes_and_counts_only_new_deposits() {
        let gateway = Arc::new(ScriptedGateway::with_workers(2));
        gateway.push_deposits(vec![deposit(5, 1)]);
        gateway.push_deposits(vec![deposit(6, 100), deposit(5, 1)]);
        let (driver, notifier) = driver_with(&gateway, settings(10, 300), Some(WALLET));
        let mut driver = driver.with_auto_start(3);

        driver
            .run(None, &Signals::default(), ExitPolicy::WhenComplete)
            .expect("farm run should complete");

        let summary = driver.session().summary().expect("summary");
        assert_eq!(summary.outcome, SummaryOutcome::Completed);
        assert_eq!(summary.worker_count, 2);
        assert_eq!(summary.minted, 100);
        assert_eq!(gateway.count("start:0xabc:3"), 1);
        assert_eq!(gateway.count("stop:s-test"), 1);
        assert_eq!(gateway.count("clear"), 0);
        assert_eq!(notifier.count("completed"), 1);
        assert_eq!(notifier.count("minted"), 1);
    }

    #[test]
    fn interrupt_stops_running_session() {
        let gateway = Arc::new(ScriptedGateway::with_workers(1));
        let (driver, notifier) = driver_with(&gateway, settings(10, 10_000), Some(WALLET));
        let mut driver = driver.with_auto_start(1);
        pump_until(&mut driver, |driver| {
            driver.session().state() == SessionState::Running
        });

        let signals = Signals::default();
        signals.interrupt.store(true, Ordering::Relaxed);
        driver
            .run(None, &signals, ExitPolicy::WhenComplete)
            .expect("stopped run exits cleanly");

        let summary = driver.session().summary().expect("summary");
        assert_eq!(summary.outcome, SummaryOutcome::Stopped);
        assert_eq!(notifier.count("stopped"), 1);
        assert_eq!(notifier.count("completed"), 0);
    }

    #[test]
    fn failed_start_ends_farm_run_with_error() {
        let gateway = Arc::new(ScriptedGateway::with_workers(0));
        let (driver, _) = driver_with(&gateway, settings(10, 50), Some(WALLET));
        let mut driver = driver.with_auto_start(2);
        let err = driver
            .run(None, &Signals::default(), ExitPolicy::WhenComplete)
            .expect_err("zero workers should fail the run");
        assert!(format!("{err:#}").contains("no workers could be started"));
        assert_eq!(gateway.count("stop:s-test"), 1);
    }

    #[test]
    fn commands_are_answered_with_action_results() {
        let gateway = Arc::new(ScriptedGateway::with_workers(2));
        let (mut driver, _) = driver_with(&gateway, settings(10, 50), None);
        let now = Instant::now();

        let (reply_tx, reply_rx) = bounded(1);
        driver.handle_command(
            FarmCommand::Start {
                workers: Some(2),
                reply: reply_tx,
            },
            now,
        );
        assert_eq!(reply_rx.recv().expect("reply"), Err(ActionError::NoWallet));

        let (wallet_tx, wallet_rx) = bounded(1);
        driver.handle_command(
            FarmCommand::ConnectWallet {
                address: "0xABC".to_string(),
                reply: wallet_tx,
            },
            now,
        );
        assert_eq!(wallet_rx.recv().expect("reply").expect("connected"), WALLET);

        let (reply_tx, reply_rx) = bounded(1);
        driver.handle_command(
            FarmCommand::Start {
                workers: None,
                reply: reply_tx,
            },
            now,
        );
        assert_eq!(reply_rx.recv().expect("reply"), Ok(()));
        assert_eq!(driver.session().state(), SessionState::Starting);

        let (reply_tx, reply_rx) = bounded(1);
        driver.handle_command(FarmCommand::Stop { reply: reply_tx }, now);
        assert_eq!(
            reply_rx.recv().expect("reply"),
            Err(ActionError::NothingToStop(SessionState::Starting))
        );

        pump_until(&mut driver, |driver| {
            driver.session().state() == SessionState::Running
        });
        assert_eq!(gateway.count("start:0xabc:3"), 1);
        driver.shutdown();
        assert_eq!(driver.session().state(), SessionState::Complete);
    }

    #[test]
    fn snapshot_sink_sees_state_changes() {
        let gateway = Arc::new(ScriptedGateway::with_workers(1));
        let (mut driver, _) = driver_with(&gateway, settings(10, 50), Some(WALLET));
        let (snap_tx, snap_rx) = crossbeam_channel::unbounded();
        driver.set_snapshot_sink(Box::new(move |snapshot: &DriverSnapshot| {
            let _ = snap_tx.send(snapshot.session.state);
        }));

        driver.start(Some(1)).expect("start accepted");
        driver.publish(Instant::now());
        pump_until(&mut driver, |driver| {
            driver.session().state() == SessionState::Running
        });
        let seen: Vec<_> = snap_rx.try_iter().collect();
        assert!(seen.contains(&SessionState::Starting));
        assert!(seen.contains(&SessionState::Running));
        driver.shutdown();
    }
}
