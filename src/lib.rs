pub mod activity;
pub mod cache;
pub mod config;
pub mod engine;
pub mod history;
pub mod ledger;
pub mod replay;
pub mod store;
pub mod types;
pub mod verify;
pub mod view;

pub mod eth;

pub use activity::{ActivityFeed, ActivityItem};
pub use config::{ContractsConfig, SyncConfig};
pub use engine::ListingEngine;
pub use history::{correlate, HistoryAggregator, HistoryEngine};
pub use ledger::{HistoryLedger, MarketplaceLedger};
pub use store::{KvStore, MemoryStore};
pub use types::{Group, Listing, ListingId, ListingKey, SortOrder};
pub use view::{build_view, ViewPage};
