pub mod deposits;
pub mod driver;
pub mod gateway;
pub mod notify;
pub mod progress;
pub mod reconcile;
mod retry;
mod schedule;
pub mod session;
pub mod stats;
pub mod ui;
pub mod wallet;
mod worker;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};

use crate::api::ApiClient;
use crate::config::{Config, FarmConfig, MAX_WORKERS};
use crate::version::ui_display_version;

use driver::{DriverSettings, ExitPolicy, FarmDriver, Signals};
use gateway::SessionGateway;
use notify::{LogNotifier, Notifier};
use progress::PhaseDurations;
use session::FarmSettings;
use stats::{format_duration, format_tokens};
use ui::{startup_banner, success};
use wallet::{resolve_wallet, WalletConnection, WALLET_ENV};

pub fn driver_settings(farm: &FarmConfig) -> DriverSettings {
    DriverSettings {
        farm: FarmSettings {
            durations: PhaseDurations {
                boot: farm.boot,
                minting: farm.minting,
                grace: farm.grace,
            },
            progress_cap: farm.progress_cap,
            deposit_limit: farm.deposit_limit,
            expected_mint_per_worker: farm.expected_mint_per_worker,
            max_workers: MAX_WORKERS,
        },
        default_workers: farm.workers,
        token_decimals: farm.token_decimals,
        tick: farm.tick,
        deposit_poll: farm.deposit_poll,
        status_poll: farm.status_poll,
        overview_poll: farm.overview_poll,
        reconcile_window: farm.reconcile_window,
    }
}

pub fn api_client(cfg: &Config) -> Result<ApiClient> {
    ApiClient::new(cfg.api_url.clone(), cfg.token.clone(), cfg.request_timeout)
}

/// Builds a driver against the HTTP backend for a fresh instance.
pub fn build_driver(
    cfg: &Config,
    farm: &FarmConfig,
    notifier: Arc<dyn Notifier>,
) -> Result<(FarmDriver, WalletConnection)> {
    let wallet = resolve_wallet(farm.wallet.as_deref())?;
    let gateway: Arc<dyn SessionGateway> = Arc::new(api_client(cfg)?);
    let driver = FarmDriver::new(driver_settings(farm), gateway, notifier, wallet.clone())?;
    Ok((driver, wallet))
}

pub fn run_farm(cfg: &Config, farm: &FarmConfig, signals: &Signals) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(farm.token_decimals));
    let (driver, wallet) = build_driver(cfg, farm, notifier)?;
    if !wallet.is_connected() {
        bail!("farm needs a wallet: pass --wallet or set {WALLET_ENV}");
    }
    print_banner(cfg, farm, "farm", &wallet);

    let mut driver = driver.with_auto_start(farm.workers);
    driver.run(None, signals, ExitPolicy::WhenComplete)?;

    if let Some(summary) = driver.session().summary() {
        success(
            "SUMMARY",
            format!(
                "minted={} expected~{} elapsed={} workers={}",
                format_tokens(summary.minted, farm.token_decimals),
                format_tokens(summary.expected_yield, farm.token_decimals),
                format_duration(summary.elapsed()),
                summary.worker_count
            ),
        );
    }
    Ok(())
}

pub fn run_watch(cfg: &Config, farm: &FarmConfig, signals: &Signals) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(farm.token_decimals));
    let (mut driver, wallet) = build_driver(cfg, farm, notifier)?;
    print_banner(cfg, farm, "watch", &wallet);
    driver.run(None, signals, ExitPolicy::OnShutdown)?;
    let snapshot = driver.snapshot(Instant::now());
    if let Some(network) = snapshot.network {
        success(
            "NETWORK",
            format!(
                "last seen: sessions={} active={} workers={}",
                network.total_sessions, network.active_sessions, network.total_bots
            ),
        );
    }
    Ok(())
}

pub fn print_banner(cfg: &Config, farm: &FarmConfig, mode: &str, wallet: &WalletConnection) {
    let wallet_line = match (wallet.address(), wallet.source()) {
        (Some(address), Some(source)) => format!("{address} ({})", source.as_str()),
        (Some(address), None) => address.to_string(),
        _ => "not connected".to_string(),
    };
    let expected = farm.boot.saturating_add(farm.minting);
    startup_banner(&[
        ("Version", ui_display_version()),
        ("Mode", mode.to_string()),
        ("Backend", cfg.api_url.clone()),
        ("Wallet", wallet_line),
        ("Workers", farm.workers.to_string()),
        (
            "Session",
            format!(
                "boot {} + mint {} (+{} grace)",
                format_duration(farm.boot),
                format_duration(farm.minting),
                format_duration(farm.grace)
            ),
        ),
        ("Expected", format_duration(expected)),
        (
            "Yield/worker",
            format!(
                "~{} tokens",
                format_tokens(farm.expected_mint_per_worker, farm.token_decimals)
            ),
        ),
    ]);
}
