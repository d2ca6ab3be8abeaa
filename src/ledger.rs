//! The remote-ledger boundary. Both traits model a read-only, unreliable
//! chain: calls may fail transiently, event queries may overlap or miss
//! windows, and push delivery is best-effort. The engines own all
//! reconciliation; implementations only move bytes.

use anyhow::Result;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use tokio::sync::mpsc;

use crate::types::{DistributionRecord, ListingEvent, QuizEndRecord};

/// Which listing-lifecycle event to query. The kinds are fetched
/// independently, matching the per-event-name log filters the chain exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventName {
    Listed,
    Cancelled,
    Bought,
}

impl EventName {
    pub const ALL: [EventName; 3] = [EventName::Listed, EventName::Cancelled, EventName::Bought];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Listed => "Listed",
            EventName::Cancelled => "Cancelled",
            EventName::Bought => "Bought",
        }
    }
}

/// Push-style delivery of newly observed events. Dropping the receiver
/// releases the underlying subscription.
pub type EventReceiver = mpsc::Receiver<Vec<ListingEvent>>;

/// An ERC-721 `Transfer` touching some account, as surfaced to the activity
/// feed.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub asset: Address,
    pub from: Address,
    pub to: Address,
    pub token_id: U256,
}

/// Read access to the marketplace contract and the asset it escrows.
#[async_trait]
pub trait MarketplaceLedger: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> Result<u64>;

    /// Historical events of one kind in `[from_block, to_block]`
    /// (`None` = latest). May omit, duplicate, or reorder entries across
    /// calls; the replayer tolerates all of that.
    async fn query_events(
        &self,
        name: EventName,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<ListingEvent>>;

    /// Subscribe to new events of one kind. Best-effort: the engine still
    /// reconciles periodically via [`Self::query_events`].
    async fn subscribe_events(&self, name: EventName) -> Result<EventReceiver>;

    /// Direct state read of the listing record; returns the `active` flag.
    async fn listing_active(&self, id: H256) -> Result<bool>;

    /// Current holder of the asset.
    async fn token_owner(&self, asset: Address, token_id: U256) -> Result<Address>;

    /// Batched verification reads, one slot per `(id, asset, tokenId)`
    /// candidate: the listing record's `active` flag and the token's current
    /// owner. `None` marks an individual failed read. Implementations should
    /// aggregate the round-trips where the chain allows it; the default
    /// degrades to concurrent single calls.
    async fn listing_states(
        &self,
        candidates: &[(H256, Address, U256)],
    ) -> Vec<(Option<bool>, Option<Address>)> {
        let reads = candidates.iter().map(|(id, asset, token_id)| async move {
            (
                self.listing_active(*id).await.ok(),
                self.token_owner(*asset, *token_id).await.ok(),
            )
        });
        futures::future::join_all(reads).await
    }

    /// ERC-721 transfers where `account` is sender or recipient.
    async fn transfers_touching(
        &self,
        account: Address,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<TransferEvent>>;
}

/// Read access to the quiz/payout registry and the quiz contract's own
/// history (the secondary source).
#[async_trait]
pub trait HistoryLedger: Send + Sync {
    async fn quiz_ends_len(&self) -> Result<u64>;

    async fn distributions_len(&self) -> Result<u64>;

    /// Batched point reads. One slot per requested index; a slot is `None`
    /// when that read failed or decoded badly (the row is skipped, the batch
    /// survives).
    async fn quiz_ends(&self, indices: &[u64]) -> Result<Vec<Option<QuizEndRecord>>>;

    async fn distributions(&self, indices: &[u64]) -> Result<Vec<Option<DistributionRecord>>>;

    /// Length of the quiz contract's local history, 0 when no quiz contract
    /// is configured.
    async fn local_history_len(&self) -> Result<u64>;

    /// Local history rows. These carry no seed or winners.
    async fn local_history(&self, indices: &[u64]) -> Result<Vec<Option<QuizEndRecord>>>;
}
