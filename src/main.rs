mod api;
mod config;
mod control_api;
mod farm;
mod types;
mod version;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;

use config::{CommandConfig, Config};
use farm::driver::Signals;
use farm::ui::warn;
use farm::wallet::{normalize_address, WALLET_ENV};

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;
    let signals = install_signal_handler()?;

    match &cfg.command {
        CommandConfig::Farm(farm) => farm::run_farm(&cfg, farm, &signals),
        CommandConfig::Watch(farm) => farm::run_watch(&cfg, farm, &signals),
        CommandConfig::Serve(farm, serve) => control_api::run(&cfg, farm, serve, signals),
        CommandConfig::Status { session_id } => {
            let client = farm::api_client(&cfg)?;
            print_json(&client.get_status(session_id.as_deref())?)
        }
        CommandConfig::Overview => {
            let client = farm::api_client(&cfg)?;
            print_json(&client.get_overview()?)
        }
        CommandConfig::Deposits {
            wallet,
            since,
            limit,
        } => {
            let wallet = deposits_wallet(wallet.as_deref())?;
            let client = farm::api_client(&cfg)?;
            print_json(&client.get_deposits(&wallet, *since, *limit)?)
        }
        CommandConfig::Stop { session_id } => {
            let client = farm::api_client(&cfg)?;
            client.stop_session(session_id)?;
            print_json(&json!({ "ok": true, "stopped": session_id }))
        }
        CommandConfig::Clear => {
            let client = farm::api_client(&cfg)?;
            client.clear_all_sessions()?;
            print_json(&json!({ "ok": true, "cleared": "all" }))
        }
    }
}

/// First Ctrl-C asks the running session to wind down; a second one exits right away.
fn install_signal_handler() -> Result<Signals> {
    let signals = Signals::default();
    let presses = Arc::new(AtomicUsize::new(0));
    let handler_signals = signals.clone();
    ctrlc::set_handler(move || {
        let count = presses.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            handler_signals.interrupt.store(true, Ordering::SeqCst);
            warn("SIGNAL", "interrupt received; stopping session (press again to exit now)");
        } else {
            handler_signals.shutdown.store(true, Ordering::SeqCst);
        }
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(signals)
}

fn deposits_wallet(flag: Option<&str>) -> Result<String> {
    if let Some(raw) = flag {
        return normalize_address(raw);
    }
    match std::env::var(WALLET_ENV) {
        Ok(raw) if !raw.trim().is_empty() => normalize_address(&raw),
        _ => bail!("deposits needs a wallet: pass --wallet or set {WALLET_ENV}"),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}
