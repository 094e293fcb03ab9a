//! Application configuration loaded from environment variables.
//!
//! Required: `HMAC_SECRET`, `COORDINATOR_PROGRAM_ID`, `RAFFLE_PROGRAM_ID`
//! Optional: `RPC_URL`, `WS_URL`, `AUTHORITY_KEYPAIR_PATH`, `KEEPER_KEYPAIR_PATH`,
//!           `FULFILLER_ENABLED`, `KEEPER_ENABLED`, `KEEPER_POLL_INTERVAL_MS`,
//!           `CLUSTER`, `HTTP_PORT`, `MAX_RETRIES`, `INITIAL_RETRY_DELAY_MS`,
//!           `PRIORITY_FEE_MICRO_LAMPORTS`, `FULFILLMENT_CONCURRENCY`

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by the oracle and keeper halves of the backend.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Solana PubSub endpoint (WebSocket) for log subscriptions.
    pub ws_url: String,
    /// Oracle key; signs fulfillment proofs and pays for them.
    pub authority_keypair: Arc<Keypair>,
    /// Pays for `perform_upkeep`. Defaults to the oracle key.
    pub keeper_keypair: Arc<Keypair>,
    /// Secret key for HMAC-SHA256 randomness generation.
    pub hmac_secret: Vec<u8>,
    pub coordinator_program_id: Pubkey,
    pub raffle_program_id: Pubkey,
    pub fulfiller_enabled: bool,
    pub keeper_enabled: bool,
    pub keeper_poll_interval: Duration,
    /// Cluster name for explorer URLs.
    pub cluster: String,
    pub http_port: u16,
    /// Maximum send attempts per transaction.
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    /// Priority fee in micro-lamports per compute unit.
    pub priority_fee_micro_lamports: u64,
    /// Maximum concurrent fulfillment tasks.
    pub fulfillment_concurrency: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8899".into());
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8900".into());

        let authority_path = std::env::var("AUTHORITY_KEYPAIR_PATH")
            .unwrap_or_else(|_| "~/.config/solana/id.json".into());
        let authority_keypair = Arc::new(load_keypair(&authority_path)?);

        let keeper_keypair = match std::env::var("KEEPER_KEYPAIR_PATH") {
            Ok(path) => Arc::new(load_keypair(&path)?),
            Err(_) => authority_keypair.clone(),
        };

        let hmac_secret = std::env::var("HMAC_SECRET")
            .context("HMAC_SECRET env var must be set")?
            .into_bytes();

        let coordinator_program_id = required_pubkey("COORDINATOR_PROGRAM_ID")?;
        let raffle_program_id = required_pubkey("RAFFLE_PROGRAM_ID")?;

        let cluster = std::env::var("CLUSTER").unwrap_or_else(|_| "devnet".into());

        Ok(Self {
            rpc_url,
            ws_url,
            authority_keypair,
            keeper_keypair,
            hmac_secret,
            coordinator_program_id,
            raffle_program_id,
            fulfiller_enabled: env_or("FULFILLER_ENABLED", true),
            keeper_enabled: env_or("KEEPER_ENABLED", true),
            keeper_poll_interval: Duration::from_millis(env_or("KEEPER_POLL_INTERVAL_MS", 5_000)),
            cluster,
            http_port: env_or("HTTP_PORT", 8080),
            max_retries: env_or("MAX_RETRIES", 5),
            initial_retry_delay_ms: env_or("INITIAL_RETRY_DELAY_MS", 500),
            priority_fee_micro_lamports: env_or("PRIORITY_FEE_MICRO_LAMPORTS", 0),
            fulfillment_concurrency: env_or("FULFILLMENT_CONCURRENCY", 4),
        })
    }

    /// Return the Solscan explorer URL for a given transaction signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        match self.cluster.as_str() {
            "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
            cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
        }
    }
}

fn load_keypair(path: &str) -> Result<Keypair> {
    let path = shellexpand::tilde(path).to_string();
    read_keypair_file(&path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to read keypair from {path}"))
}

fn required_pubkey(name: &str) -> Result<Pubkey> {
    let value = std::env::var(name).with_context(|| format!("{name} env var must be set"))?;
    Pubkey::from_str(&value).with_context(|| format!("invalid {name}: {value}"))
}

/// Parse `name` from the environment, falling back to `default` when unset or
/// unparseable.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        // Variable names unique to this test so parallel tests don't race.
        unsafe {
            std::env::set_var("RAFFLE_TEST_ENV_OR_BAD", "not-a-number");
        }
        assert_eq!(env_or("RAFFLE_TEST_ENV_OR_BAD", 7u32), 7);
        assert_eq!(env_or("RAFFLE_TEST_ENV_OR_UNSET", 9u64), 9);
    }

    #[test]
    fn env_or_parses_bools() {
        unsafe {
            std::env::set_var("RAFFLE_TEST_ENV_OR_BOOL", "false");
        }
        assert!(!env_or("RAFFLE_TEST_ENV_OR_BOOL", true));
    }
}
