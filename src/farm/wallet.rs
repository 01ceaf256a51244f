use std::env;

use anyhow::{bail, Result};

pub const WALLET_ENV: &str = "FARMHAND_WALLET";
const MAX_ADDRESS_HEX: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WalletSource {
    CliFlag,
    Environment,
    ControlApi,
}

impl WalletSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CliFlag => "--wallet",
            Self::Environment => WALLET_ENV,
            Self::ControlApi => "control api",
        }
    }
}

/// Read-only view of the connected wallet. The orchestrator never signs anything; it only
/// needs the address to scope sessions and deposits.
#[derive(Debug, Clone, Default)]
pub struct WalletConnection {
    address: Option<String>,
    source: Option<WalletSource>,
}

impl WalletConnection {
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn source(&self) -> Option<WalletSource> {
        self.source
    }

    pub fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    pub fn connect(&mut self, raw: &str, source: WalletSource) -> Result<&str> {
        let address = normalize_address(raw)?;
        self.source = Some(source);
        Ok(self.address.insert(address))
    }

    pub fn disconnect(&mut self) -> Option<String> {
        self.source = None;
        self.address.take()
    }
}

/// Resolves the startup wallet from `--wallet`, falling back to the environment.
pub fn resolve_wallet(flag: Option<&str>) -> Result<WalletConnection> {
    let mut wallet = WalletConnection::default();
    if let Some(raw) = flag.filter(|raw| !raw.trim().is_empty()) {
        wallet.connect(raw, WalletSource::CliFlag)?;
        return Ok(wallet);
    }
    if let Ok(raw) = env::var(WALLET_ENV) {
        if !raw.trim().is_empty() {
            wallet.connect(&raw, WalletSource::Environment)?;
        }
    }
    Ok(wallet)
}

pub fn normalize_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    else {
        bail!("wallet address must start with 0x");
    };
    if hex.is_empty() || hex.len() > MAX_ADDRESS_HEX {
        bail!("wallet address must carry 1..={MAX_ADDRESS_HEX} hex digits");
    }
    if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        bail!("wallet address contains non-hex characters");
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}
