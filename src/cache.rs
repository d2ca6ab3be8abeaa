//! Optimistic listing cache: tentative entries the current user just
//! submitted, shown before the chain corroborates them. Every mutation is
//! mirrored to the persisted store so a reload before confirmation does not
//! lose the pending action. Persistence failures only degrade reload
//! survival; the in-memory view stays correct.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use tracing::debug;

use crate::store::{scope_key, KvStore};
use crate::types::{Listing, ListingId, ListingKey};

const PURPOSE: &str = "optimistic_listings";

pub struct OptimisticCache {
    store: Arc<dyn KvStore>,
    chain_id: u64,
    marketplace: Address,
    account: Option<Address>,
    entries: HashMap<ListingKey, Listing>,
}

impl OptimisticCache {
    pub fn new(store: Arc<dyn KvStore>, chain_id: u64, marketplace: Address) -> Self {
        Self {
            store,
            chain_id,
            marketplace,
            account: None,
            entries: HashMap::new(),
        }
    }

    pub fn account(&self) -> Option<Address> {
        self.account
    }

    /// Switch the active account. The previous account's entries are
    /// discarded entirely (no cross-account leakage) and the new account's
    /// persisted entries are reseeded, if any survive from a prior session.
    pub async fn set_account(&mut self, account: Option<Address>) {
        self.entries.clear();
        self.account = account;
        let Some(account) = account else { return };

        match self.store.get(&self.key_for(account)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Listing>>(&raw) {
                Ok(list) => {
                    for l in list {
                        self.entries.insert(l.key(), l);
                    }
                }
                // Corrupted payload is the same as no payload.
                Err(e) => debug!(error = %e, "discarding malformed optimistic payload"),
            },
            Ok(None) => {}
            Err(e) => debug!(error = %e, "optimistic seed read failed"),
        }
    }

    /// Insert or overwrite a tentative entry keyed by (seller, asset, tokenId).
    pub async fn put(&mut self, listing: Listing) {
        self.entries.insert(listing.key(), listing);
        self.persist().await;
    }

    /// Delete by cache key. Returns whether anything was removed.
    pub async fn remove(&mut self, key: &ListingKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Delete every entry carrying this listing id. Used when chain state
    /// supersedes or invalidates the tentative action.
    pub async fn remove_by_id(&mut self, id: &ListingId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, l| l.id != *id);
        let changed = self.entries.len() != before;
        if changed {
            self.persist().await;
        }
        changed
    }

    /// Current tentative entries for the active account.
    pub fn all(&self) -> Vec<Listing> {
        let mut out: Vec<Listing> = self.entries.values().cloned().collect();
        out.sort_by_key(|l| l.id);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_for(&self, account: Address) -> String {
        scope_key(PURPOSE, self.chain_id, self.marketplace, account)
    }

    async fn persist(&self) {
        let Some(account) = self.account else { return };
        let payload = match serde_json::to_string(&self.all()) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "optimistic payload serialization failed");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.key_for(account), &payload).await {
            debug!(error = %e, "optimistic persistence failed, in-memory state kept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use ethers::types::U256;

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    fn listing(seller: u8, token: u64) -> Listing {
        Listing::new(addr(seller), addr(1), U256::from(token), U256::from(100u64))
    }

    async fn cache_with(store: Arc<dyn KvStore>, account: Address) -> OptimisticCache {
        let mut cache = OptimisticCache::new(store, 84532, addr(9));
        cache.set_account(Some(account)).await;
        cache
    }

    #[tokio::test]
    async fn entries_survive_a_reload() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut cache = cache_with(store.clone(), addr(2)).await;
        cache.put(listing(2, 7)).await;

        // fresh cache over the same store = new session
        let reloaded = cache_with(store, addr(2)).await;
        assert_eq!(reloaded.all(), vec![listing(2, 7)]);
    }

    #[tokio::test]
    async fn account_switch_discards_previous_entries() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut cache = cache_with(store, addr(2)).await;
        cache.put(listing(2, 7)).await;

        cache.set_account(Some(addr(3))).await;
        assert!(cache.all().is_empty());

        // switching back reseeds the first account's persisted entries
        cache.set_account(Some(addr(2))).await;
        assert_eq!(cache.all(), vec![listing(2, 7)]);
    }

    #[tokio::test]
    async fn malformed_persisted_payload_is_treated_as_absent() {
        let store = Arc::new(MemoryStore::new());
        let key = scope_key(PURPOSE, 84532, addr(9), addr(2));
        store.set(&key, "{not json").await.unwrap();

        let cache = cache_with(store, addr(2)).await;
        assert!(cache.all().is_empty());
    }

    #[tokio::test]
    async fn remove_by_id_drops_every_matching_entry() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut cache = cache_with(store, addr(2)).await;
        let keep = listing(2, 7);
        let drop = listing(2, 8);
        cache.put(keep.clone()).await;
        cache.put(drop.clone()).await;

        assert!(cache.remove_by_id(&drop.id).await);
        assert!(!cache.remove_by_id(&drop.id).await);
        assert_eq!(cache.all(), vec![keep]);
    }

    struct FailingStore;

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(anyhow!("io down"))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(anyhow!("io down"))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(anyhow!("io down"))
        }
    }

    #[tokio::test]
    async fn persistence_failures_are_swallowed() {
        let mut cache = cache_with(Arc::new(FailingStore), addr(2)).await;
        cache.put(listing(2, 7)).await;
        // still correct in memory for this session
        assert_eq!(cache.all(), vec![listing(2, 7)]);
    }
}
