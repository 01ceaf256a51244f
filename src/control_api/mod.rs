use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_stream::stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, FarmConfig, ServeConfig};
use crate::farm::driver::{DriverSnapshot, ExitPolicy, FarmCommand, Signals};
use crate::farm::notify::{LogNotifier, Notification, Notifier};
use crate::farm::session::{ActionError, SessionState};
use crate::farm::ui::{info, set_log_sink, UiLogEvent};
use crate::farm::{build_driver, print_banner};

const API_EVENT_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "unavailable",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        let message = err.to_string();
        match err {
            ActionError::NoWallet => Self::bad_request("no_wallet", message),
            ActionError::InvalidWorkers { .. } => Self::bad_request("invalid_workers", message),
            ActionError::AlreadyActive(_) => Self::conflict("already_active", message),
            ActionError::NothingToStop(_) => Self::conflict("nothing_to_stop", message),
            ActionError::NotComplete(_) => Self::conflict("not_complete", message),
            ActionError::Reconciling => Self::conflict("reconciling", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct StreamEnvelope {
    seq: u64,
    ts_unix_ms: u64,
    event: String,
    data: Value,
}

/// Latest driver snapshot plus the broadcast feed behind the SSE stream.
struct EventHub {
    events_tx: broadcast::Sender<StreamEnvelope>,
    seq: AtomicU64,
    latest: Mutex<Option<DriverSnapshot>>,
}

impl EventHub {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(API_EVENT_CHANNEL_CAPACITY);
        Self {
            events_tx,
            seq: AtomicU64::new(0),
            latest: Mutex::new(None),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamEnvelope> {
        self.events_tx.subscribe()
    }

    fn latest(&self) -> Option<DriverSnapshot> {
        lock(&self.latest).clone()
    }

    fn store(&self, snapshot: &DriverSnapshot) {
        *lock(&self.latest) = Some(snapshot.clone());
    }

    fn emit(&self, event: &str, data: Value) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let _ = self.events_tx.send(StreamEnvelope {
            seq,
            ts_unix_ms: now_unix_millis(),
            event: event.to_string(),
            data,
        });
    }

    fn ingest_log(&self, log: UiLogEvent) {
        self.emit(
            "log",
            json!({
                "elapsed_secs": log.elapsed_secs,
                "level": log.level,
                "tag": log.tag,
                "message": log.message,
            }),
        );
    }
}

/// Logs notifications like the terminal modes do and mirrors them onto the event feed.
struct ControlNotifier {
    log: LogNotifier,
    hub: Arc<EventHub>,
    decimals: u32,
}

impl Notifier for ControlNotifier {
    fn notify(&self, notification: Notification) {
        let message = notification.message(self.decimals);
        let detail = serde_json::to_value(&notification).unwrap_or(Value::Null);
        self.hub.emit(
            "notification",
            json!({
                "kind": notification.kind(),
                "message": message,
                "detail": detail,
            }),
        );
        self.log.notify(notification);
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<EventHub>,
    commands: Sender<FarmCommand>,
    started_unix_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct StartRequest {
    workers: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectWalletRequest {
    address: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    started_unix_ms: u64,
    now_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ActionResponse {
    ok: bool,
    message: String,
    state: Option<DriverSnapshot>,
}

pub fn run(cfg: &Config, farm: &FarmConfig, serve: &ServeConfig, signals: Signals) -> Result<()> {
    let bind_addr = parse_api_bind_addr(&serve.bind)?;
    check_bind_allowed(bind_addr, serve.allow_unsafe_bind)?;
    let cors = build_cors_layer(&serve.cors)?;

    let hub = Arc::new(EventHub::new());
    let notifier: Arc<dyn Notifier> = Arc::new(ControlNotifier {
        log: LogNotifier::new(farm.token_decimals),
        hub: Arc::clone(&hub),
        decimals: farm.token_decimals,
    });
    let (mut driver, wallet) = build_driver(cfg, farm, notifier)?;
    driver.set_snapshot_sink(snapshot_sink(Arc::clone(&hub)));
    print_banner(cfg, farm, "serve", &wallet);

    let log_hub = Arc::clone(&hub);
    set_log_sink(Some(Arc::new(move |event| {
        log_hub.ingest_log(event);
    })));

    let (command_tx, command_rx) = unbounded::<FarmCommand>();
    let driver_signals = signals.clone();
    let driver_thread = thread::Builder::new()
        .name("farmhand-driver".to_string())
        .spawn(move || {
            let result = driver.run(Some(&command_rx), &driver_signals, ExitPolicy::OnShutdown);
            driver_signals.shutdown.store(true, Ordering::SeqCst);
            result
        })
        .context("failed to spawn farm driver thread")?;

    let app_state = AppState {
        hub,
        commands: command_tx,
        started_unix_ms: now_unix_millis(),
    };
    let served = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime for control API")
        .and_then(|runtime| {
            runtime.block_on(serve_api(app_state, cors, bind_addr, signals.clone()))
        });

    signals.shutdown.store(true, Ordering::SeqCst);
    let driven = driver_thread
        .join()
        .map_err(|_| anyhow!("farm driver thread panicked"))
        .and_then(|result| result);
    set_log_sink(None);

    served?;
    driven
}

async fn serve_api(
    state: AppState,
    cors: CorsLayer,
    bind_addr: SocketAddr,
    signals: Signals,
) -> Result<()> {
    let app = router(state).layer(cors);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind control API listener at {bind_addr}"))?;
    info("API", format!("control API listening on http://{bind_addr}"));

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(signals))
        .await
        .context("control API server exited unexpectedly")
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/v1/session", get(get_session))
        .route("/v1/session/start", post(post_session_start))
        .route("/v1/session/stop", post(post_session_stop))
        .route("/v1/session/dismiss", post(post_session_dismiss))
        .route("/v1/wallet/connect", post(post_wallet_connect))
        .route("/v1/wallet/disconnect", post(post_wallet_disconnect))
        .route("/v1/events/stream", get(get_events_stream))
        .with_state(state)
}

/// Stores every published snapshot and emits `state.changed` / `session.progress`
/// only when those actually move.
fn snapshot_sink(hub: Arc<EventHub>) -> Box<dyn FnMut(&DriverSnapshot) + Send> {
    let mut last_state: Option<SessionState> = None;
    let mut last_percent: Option<u8> = None;
    Box::new(move |snapshot| {
        hub.store(snapshot);
        let session = &snapshot.session;
        if last_state != Some(session.state) {
            hub.emit(
                "state.changed",
                json!({
                    "previous": last_state,
                    "current": session.state,
                    "session_id": session.session_id,
                    "last_error": session.last_error,
                }),
            );
            last_state = Some(session.state);
        }
        if last_percent != Some(session.percent) {
            hub.emit(
                "session.progress",
                json!({
                    "percent": session.percent,
                    "phase": session.phase,
                    "total_minted": session.total_minted,
                }),
            );
            last_percent = Some(session.percent);
        }
    })
}

async fn wait_for_shutdown(signals: Signals) {
    while !signals.shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn build_cors_layer(cors_value: &str) -> Result<CorsLayer> {
    let trimmed = cors_value.trim();
    if trimmed == "*" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let value = axum::http::HeaderValue::from_str(trimmed)
        .with_context(|| format!("invalid CORS origin '{trimmed}'"))?;
    Ok(CorsLayer::new()
        .allow_origin(value)
        .allow_methods(Any)
        .allow_headers(Any))
}

fn parse_api_bind_addr(bind: &str) -> Result<SocketAddr> {
    let bind = bind.trim();
    if let Ok(addr) = SocketAddr::from_str(bind) {
        return Ok(addr);
    }

    if let Some((host, port)) = bind.rsplit_once(':') {
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid bind port in '{bind}'"))?;
        if host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
        }
    }

    bail!("invalid bind '{bind}' (expected host:port)")
}

fn check_bind_allowed(addr: SocketAddr, allow_unsafe_bind: bool) -> Result<()> {
    if addr.ip().is_loopback() || allow_unsafe_bind {
        return Ok(());
    }
    bail!("refusing to expose the control API on {addr}; pass --allow-unsafe-bind to override")
}

/// Hands a command to the driver thread and waits for its answer off the async runtime.
async fn dispatch<T: Send + 'static>(
    state: &AppState,
    command: impl FnOnce(Sender<T>) -> FarmCommand,
) -> Result<T, ApiError> {
    let (reply_tx, reply_rx) = bounded::<T>(1);
    state
        .commands
        .send(command(reply_tx))
        .map_err(|_| ApiError::unavailable("farm driver is not running"))?;
    tokio::task::spawn_blocking(move || reply_rx.recv_timeout(COMMAND_TIMEOUT))
        .await
        .map_err(|err| ApiError::internal(format!("command wait failed: {err}")))?
        .map_err(|_| ApiError::unavailable("farm driver did not answer in time"))
}

fn action_response(state: &AppState, message: impl Into<String>) -> Json<ActionResponse> {
    Json(ActionResponse {
        ok: true,
        message: message.into(),
        state: state.hub.latest(),
    })
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::version::release_version(),
        started_unix_ms: state.started_unix_ms,
        now_unix_ms: now_unix_millis(),
    })
}

async fn get_session(State(state): State<AppState>) -> Result<Json<DriverSnapshot>, ApiError> {
    state
        .hub
        .latest()
        .map(Json)
        .ok_or_else(|| ApiError::unavailable("farm driver has not published a snapshot yet"))
}

async fn post_session_start(
    State(state): State<AppState>,
    payload: Option<Json<StartRequest>>,
) -> Result<Json<ActionResponse>, ApiError> {
    let request = payload.map(|value| value.0).unwrap_or_default();
    dispatch(&state, |reply| FarmCommand::Start {
        workers: request.workers,
        reply,
    })
    .await??;
    Ok(action_response(&state, "session starting"))
}

async fn post_session_stop(State(state): State<AppState>) -> Result<Json<ActionResponse>, ApiError> {
    dispatch(&state, |reply| FarmCommand::Stop { reply }).await??;
    Ok(action_response(&state, "session stopping"))
}

async fn post_session_dismiss(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    dispatch(&state, |reply| FarmCommand::Dismiss { reply }).await??;
    Ok(action_response(&state, "summary dismissed"))
}

async fn post_wallet_connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectWalletRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let address = dispatch(&state, |reply| FarmCommand::ConnectWallet {
        address: request.address,
        reply,
    })
    .await?
    .map_err(|err| ApiError::bad_request("invalid_wallet", format!("{err:#}")))?;
    Ok(action_response(&state, format!("wallet {address} connected")))
}

async fn post_wallet_disconnect(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    let message = match dispatch(&state, |reply| FarmCommand::DisconnectWallet { reply }).await? {
        Some(address) => format!("wallet {address} disconnected"),
        None => "no wallet was connected".to_string(),
    };
    Ok(action_response(&state, message))
}

async fn get_events_stream(State(state): State<AppState>) -> impl IntoResponse {
    let mut rx = state.hub.subscribe();

    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    let sse_event = Event::default()
                        .id(event.seq.to_string())
                        .event(event.event)
                        .data(payload);
                    yield Ok::<Event, std::convert::Infallible>(sse_event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (AppState, crossbeam_channel::Receiver<FarmCommand>) {
        let (commands, command_rx) = unbounded();
        let state = AppState {
            hub: Arc::new(EventHub::new()),
            commands,
            started_unix_ms: 1,
        };
        (state, command_rx)
    }

    #[test]
    fn parse_api_bind_addr_accepts_localhost_alias() {
        let addr = parse_api_bind_addr(" localhost:9977 ").expect("localhost bind should parse");
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9977)));
        assert!(parse_api_bind_addr("example.com:9977").is_err());
        assert!(parse_api_bind_addr("localhost:notaport").is_err());
    }

    #[test]
    fn non_loopback_bind_requires_opt_in() {
        let public = SocketAddr::from(([0, 0, 0, 0], 9977));
        assert!(check_bind_allowed(public, false).is_err());
        assert!(check_bind_allowed(public, true).is_ok());
        assert!(check_bind_allowed(SocketAddr::from(([127, 0, 0, 1], 9977)), false).is_ok());
    }

    #[test]
    fn build_cors_layer_rejects_invalid_origin() {
        assert!(build_cors_layer("*").is_ok());
        assert!(build_cors_layer("http://localhost:3000").is_ok());
        assert!(build_cors_layer("bad\norigin").is_err());
    }

    #[test]
    fn action_errors_map_to_http_statuses() {
        let no_wallet = ApiError::from(ActionError::NoWallet);
        assert_eq!(no_wallet.status, StatusCode::BAD_REQUEST);
        assert_eq!(no_wallet.code, "no_wallet");

        let active = ApiError::from(ActionError::AlreadyActive(SessionState::Running));
        assert_eq!(active.status, StatusCode::CONFLICT);
        assert_eq!(active.code, "already_active");

        let reconciling = ApiError::from(ActionError::Reconciling);
        assert_eq!(reconciling.status, StatusCode::CONFLICT);
        assert_eq!(reconciling.code, "reconciling");

        let workers = ApiError::from(ActionError::InvalidWorkers {
            requested: 0,
            max: 50,
        });
        assert_eq!(workers.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn event_hub_numbers_events_in_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit("first", json!({}));
        hub.emit("second", json!({"n": 2}));
        assert_eq!(rx.try_recv().expect("first event").seq, 1);
        let second = rx.try_recv().expect("second event");
        assert_eq!(second.seq, 2);
        assert_eq!(second.event, "second");
    }

    #[test]
    fn control_notifier_mirrors_notifications() {
        let hub = Arc::new(EventHub::new());
        let mut rx = hub.subscribe();
        let notifier = ControlNotifier {
            log: LogNotifier::new(0),
            hub: Arc::clone(&hub),
            decimals: 0,
        };
        notifier.notify(Notification::OrphansCleared { sessions: 2 });

        let event = rx.try_recv().expect("notification event");
        assert_eq!(event.event, "notification");
        assert_eq!(event.data["kind"], "orphans_cleared");
        assert_eq!(event.data["detail"]["sessions"], 2);
    }

    #[tokio::test]
    async fn start_rejection_is_reported_as_bad_request() {
        let (state, command_rx) = test_state();
        let responder = thread::spawn(move || match command_rx.recv() {
            Ok(FarmCommand::Start { workers, reply }) => {
                assert_eq!(workers, Some(3));
                let _ = reply.send(Err(ActionError::NoWallet));
            }
            _ => panic!("expected a start command"),
        });

        let result = post_session_start(
            State(state),
            Some(Json(StartRequest { workers: Some(3) })),
        )
        .await;
        let err = result.err().expect("start should be rejected");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "no_wallet");
        responder.join().expect("responder thread");
    }

    #[tokio::test]
    async fn commands_fail_when_driver_is_gone() {
        let (state, command_rx) = test_state();
        drop(command_rx);
        let err = post_session_stop(State(state))
            .await
            .err()
            .expect("stop should fail without a driver");
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn session_endpoint_serves_latest_snapshot() {
        let (state, _command_rx) = test_state();
        assert!(get_session(State(state.clone())).await.is_err());
        let health = get_health(State(state)).await;
        assert_eq!(health.status, "ok");
    }
}
