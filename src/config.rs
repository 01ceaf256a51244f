use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

use crate::types::parse_u64_field;

pub const MAX_WORKERS: u32 = 50;
const MAX_DEPOSIT_LIMIT: u32 = 1_000;
const MAX_TOKEN_DECIMALS: u32 = 18;

#[derive(Debug, Parser)]
#[command(
    name = "farmhand",
    version = crate::version::release_version(),
    about = "Farming session orchestrator for the storage network test-token faucet"
)]
struct Cli {
    /// Base URL of the farming backend.
    #[arg(long = "api-url", default_value = "http://127.0.0.1:3001", global = true)]
    api_url: String,

    /// Bearer token for backends that require authentication.
    #[arg(long, env = "FARMHAND_API_TOKEN", global = true)]
    token: Option<String>,

    /// Per-request timeout for backend calls.
    #[arg(long, default_value_t = 15, global = true)]
    request_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session for the wallet and run it to completion.
    Farm(FarmArgs),
    /// Follow network and session status without starting anything.
    Watch(FarmArgs),
    /// Run the orchestrator behind a local HTTP control API.
    Serve {
        #[command(flatten)]
        farm: FarmArgs,
        #[command(flatten)]
        serve: ServeArgs,
    },
    /// Print backend session status as JSON.
    Status {
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Print aggregate network counts as JSON.
    Overview,
    /// Print deposit records for a wallet as JSON.
    Deposits {
        /// Wallet address (falls back to FARMHAND_WALLET).
        #[arg(long)]
        wallet: Option<String>,
        /// Only records after this ledger version.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 25)]
        limit: u32,
    },
    /// Stop one backend session.
    Stop { session_id: String },
    /// Clear every backend session.
    Clear,
}

#[derive(Debug, Clone, Args)]
struct FarmArgs {
    /// Wallet address that owns the session (falls back to FARMHAND_WALLET).
    #[arg(long)]
    wallet: Option<String>,

    /// Workers to request per session.
    #[arg(long, default_value_t = 5)]
    workers: u32,

    /// Expected boot phase before workers start minting.
    #[arg(long, default_value_t = 45)]
    boot_secs: u64,

    /// Expected minting phase after boot.
    #[arg(long, default_value_t = 105)]
    mint_secs: u64,

    /// Extra time past boot + minting before completion is inferred.
    #[arg(long, default_value_t = 20)]
    grace_secs: u64,

    /// Highest percent shown before the session is known complete.
    #[arg(long, default_value_t = 99)]
    progress_cap: u8,

    /// Progress tick interval.
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,

    #[arg(long, default_value_t = 5)]
    deposit_poll_secs: u64,

    /// Maximum deposit records fetched per poll.
    #[arg(long, default_value_t = 25)]
    deposit_limit: u32,

    #[arg(long, default_value_t = 10)]
    status_poll_secs: u64,

    #[arg(long, default_value_t = 30)]
    overview_poll_secs: u64,

    /// Delay after the first status fetch before stale sessions are cleared.
    #[arg(long, default_value_t = 3)]
    reconcile_window_secs: u64,

    /// Expected mint per worker over a full session, in base units.
    #[arg(long, default_value_t = 1_000_000_000)]
    expected_mint_per_worker: u64,

    #[arg(long, default_value_t = 8)]
    token_decimals: u32,
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Control API bind address.
    #[arg(long, default_value = "127.0.0.1:9977")]
    bind: String,

    /// Allow binding the control API to a non-loopback address.
    #[arg(long, default_value_t = false)]
    allow_unsafe_bind: bool,

    /// Allowed CORS origin, or `*`.
    #[arg(long, default_value = "*")]
    cors: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub command: CommandConfig,
}

#[derive(Debug, Clone)]
pub enum CommandConfig {
    Farm(FarmConfig),
    Watch(FarmConfig),
    Serve(FarmConfig, ServeConfig),
    Status { session_id: Option<String> },
    Overview,
    Deposits {
        wallet: Option<String>,
        since: Option<u64>,
        limit: u32,
    },
    Stop { session_id: String },
    Clear,
}

#[derive(Debug, Clone)]
pub struct FarmConfig {
    pub wallet: Option<String>,
    pub workers: u32,
    pub boot: Duration,
    pub minting: Duration,
    pub grace: Duration,
    pub progress_cap: u8,
    pub tick: Duration,
    pub deposit_poll: Duration,
    pub deposit_limit: u32,
    pub status_poll: Duration,
    pub overview_poll: Duration,
    pub reconcile_window: Duration,
    pub expected_mint_per_worker: u64,
    pub token_decimals: u32,
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: String,
    pub allow_unsafe_bind: bool,
    pub cors: String,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if cli.request_timeout_secs == 0 {
            bail!("request-timeout-secs must be >= 1");
        }
        let token = match cli.token {
            Some(token) if token.trim().is_empty() => bail!("--token is empty"),
            Some(token) => Some(token.trim().to_string()),
            None => None,
        };

        let command = match cli.command {
            Command::Farm(args) => CommandConfig::Farm(farm_config(args)?),
            Command::Watch(args) => CommandConfig::Watch(farm_config(args)?),
            Command::Serve { farm, serve } => CommandConfig::Serve(
                farm_config(farm)?,
                ServeConfig {
                    bind: serve.bind.trim().to_string(),
                    allow_unsafe_bind: serve.allow_unsafe_bind,
                    cors: serve.cors,
                },
            ),
            Command::Status { session_id } => CommandConfig::Status {
                session_id: non_empty(session_id),
            },
            Command::Overview => CommandConfig::Overview,
            Command::Deposits {
                wallet,
                since,
                limit,
            } => {
                validate_deposit_limit(limit)?;
                let since = since
                    .as_deref()
                    .map(|raw| parse_u64_field(raw, "--since"))
                    .transpose()?;
                CommandConfig::Deposits {
                    wallet: non_empty(wallet),
                    since,
                    limit,
                }
            }
            Command::Stop { session_id } => {
                let session_id = session_id.trim().to_string();
                if session_id.is_empty() {
                    bail!("session id is empty");
                }
                CommandConfig::Stop { session_id }
            }
            Command::Clear => CommandConfig::Clear,
        };

        Ok(Self {
            api_url: normalize_api_url(&cli.api_url),
            token,
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            command,
        })
    }
}

fn farm_config(args: FarmArgs) -> Result<FarmConfig> {
    if args.workers == 0 || args.workers > MAX_WORKERS {
        bail!("workers must be between 1 and {MAX_WORKERS}");
    }
    if !(95..=100).contains(&args.progress_cap) {
        bail!("progress-cap must be between 95 and 100");
    }
    if args.mint_secs == 0 {
        bail!("mint-secs must be >= 1");
    }
    if args.tick_ms == 0 {
        bail!("tick-ms must be >= 1");
    }
    validate_deposit_limit(args.deposit_limit)?;
    if args.token_decimals > MAX_TOKEN_DECIMALS {
        bail!("token-decimals must be <= {MAX_TOKEN_DECIMALS}");
    }

    Ok(FarmConfig {
        wallet: non_empty(args.wallet),
        workers: args.workers,
        boot: Duration::from_secs(args.boot_secs),
        minting: Duration::from_secs(args.mint_secs),
        grace: Duration::from_secs(args.grace_secs),
        progress_cap: args.progress_cap,
        tick: Duration::from_millis(args.tick_ms),
        deposit_poll: Duration::from_secs(args.deposit_poll_secs.max(1)),
        deposit_limit: args.deposit_limit,
        status_poll: Duration::from_secs(args.status_poll_secs.max(1)),
        overview_poll: Duration::from_secs(args.overview_poll_secs.max(1)),
        reconcile_window: Duration::from_secs(args.reconcile_window_secs),
        expected_mint_per_worker: args.expected_mint_per_worker,
        token_decimals: args.token_decimals,
    })
}

fn validate_deposit_limit(limit: u32) -> Result<()> {
    if limit == 0 || limit > MAX_DEPOSIT_LIMIT {
        bail!("deposit limit must be between 1 and {MAX_DEPOSIT_LIMIT}");
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_api_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    format!("http://{trimmed}")
}
