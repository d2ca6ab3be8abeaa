use std::time::Duration;

use anyhow::{Context, Result};
use ethers::types::Address;

/// Addresses and deploy blocks for the contracts a view reads from.
#[derive(Clone, Debug)]
pub struct ContractsConfig {
    pub chain_id: u64,
    /// Marketplace contract. Also the escrow holder for listed assets.
    pub marketplace: Address,
    /// The tradable asset (ERC-721) contract.
    pub ticket: Address,
    /// Quiz/payout registry. History aggregation is disabled without it.
    pub registry: Option<Address>,
    /// Quiz contract, used as secondary history source when set.
    pub quiz: Option<Address>,
    pub deploy_block_marketplace: u64,
    pub deploy_block_ticket: u64,
}

impl ContractsConfig {
    /// Load from the environment (`.env` supported). Required:
    /// `CHAIN_ID`, `MARKETPLACE_ADDRESS`, `TICKET_ADDRESS`. Optional:
    /// `REGISTRY_ADDRESS`, `QUIZ_ADDRESS`, `DEPLOY_BLOCK_MARKETPLACE`,
    /// `DEPLOY_BLOCK_TICKET`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let chain_id: u64 = std::env::var("CHAIN_ID")
            .context("CHAIN_ID must be set")?
            .parse()
            .context("CHAIN_ID must be a u64")?;
        let marketplace = parse_addr_var("MARKETPLACE_ADDRESS")?
            .context("MARKETPLACE_ADDRESS must be set")?;
        let ticket = parse_addr_var("TICKET_ADDRESS")?.context("TICKET_ADDRESS must be set")?;

        Ok(Self {
            chain_id,
            marketplace,
            ticket,
            registry: parse_addr_var("REGISTRY_ADDRESS")?,
            quiz: parse_addr_var("QUIZ_ADDRESS")?,
            deploy_block_marketplace: parse_block_var("DEPLOY_BLOCK_MARKETPLACE"),
            deploy_block_ticket: parse_block_var("DEPLOY_BLOCK_TICKET"),
        })
    }
}

fn parse_addr_var(name: &str) -> Result<Option<Address>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            let addr = v
                .trim()
                .parse()
                .with_context(|| format!("{name} is not a valid address"))?;
            Ok(Some(addr))
        }
        _ => Ok(None),
    }
}

// A missing or malformed deploy block just means scanning from genesis.
fn parse_block_var(name: &str) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Tunables for the reconciliation engines. Every heuristic the aggregator
/// applies (fallback windows, fetch bounds) lives here rather than as a
/// baked-in constant.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Periodic full reconcile of the listing view.
    pub poll_interval: Duration,
    /// Periodic refetch of the history view.
    pub history_poll_interval: Duration,
    /// Coalescing delay for bursts of triggers before a recompute runs.
    pub debounce: Duration,
    /// How many registry rows to read per stream, newest first.
    pub fetch_limit: usize,
    /// Upper bound when widening the quiz-end fetch to chase payout seeds
    /// that had no quiz among the first `fetch_limit` rows.
    pub max_quiz_widen: usize,
    /// Time-proximity window for attaching leftover payouts to payout-less
    /// quiz rounds.
    pub fallback_window_light: Duration,
    /// Time window for the winner-overlap inference pass.
    pub fallback_window_exhaustive: Duration,
    /// How far back the activity feed scans on its first fetch.
    pub activity_window_blocks: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            history_poll_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(300),
            fetch_limit: 50,
            max_quiz_widen: 200,
            fallback_window_light: Duration::from_secs(3 * 3600),
            fallback_window_exhaustive: Duration::from_secs(24 * 3600),
            activity_window_blocks: 200_000,
        }
    }
}

impl SyncConfig {
    /// Fetch limit clamped to the supported range.
    pub fn bounded_fetch_limit(&self) -> usize {
        self.fetch_limit.clamp(10, 200)
    }
}
