//! Direct state verification of candidate listings. Event replay alone
//! cannot catch everything: window boundaries, RPC pagination limits, and
//! asset moves outside the marketplace all leave stale entries that no
//! later event will correct. Each candidate is double-checked against the
//! chain: its stored record must still be active and its asset must still
//! sit in the marketplace escrow.

use std::collections::{HashMap, HashSet};

use ethers::types::{Address, U256};
use tracing::debug;

use crate::ledger::MarketplaceLedger;
use crate::types::{Listing, ListingId};

#[derive(Debug, Default)]
pub struct VerifyOutcome {
    /// Candidates confirmed genuinely active.
    pub verified: HashMap<ListingId, Listing>,
    /// Candidates refuted by state; stale regardless of why.
    pub dropped: HashSet<ListingId>,
}

/// Verify all candidates in one aggregated batch read. A failed slot keeps
/// its candidate (the next pass retries); only a definitive
/// `active == false` or an owner other than `escrow` drops it. The call
/// itself never fails, so a degraded node cannot wipe known-good state.
pub async fn verify_candidates(
    ledger: &dyn MarketplaceLedger,
    escrow: Address,
    candidates: Vec<Listing>,
) -> VerifyOutcome {
    let wanted: Vec<(ListingId, Address, U256)> = candidates
        .iter()
        .map(|l| (l.id, l.asset, l.token_id))
        .collect();
    let states = ledger.listing_states(&wanted).await;

    let mut outcome = VerifyOutcome::default();
    for (listing, state) in candidates.into_iter().zip(states) {
        let keep = match state {
            (Some(active), Some(owner)) => active && owner == escrow,
            (record, owner) => {
                if record.is_none() {
                    debug!(id = ?listing.id, "listing record read failed, keeping entry");
                }
                if owner.is_none() {
                    debug!(id = ?listing.id, "owner read failed, keeping entry");
                }
                true
            }
        };
        if keep {
            outcome.verified.insert(listing.id, listing);
        } else {
            outcome.dropped.insert(listing.id);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventName, EventReceiver, TransferEvent};
    use crate::types::ListingEvent;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use ethers::types::{H256, U256};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    #[derive(Default)]
    struct StateOnlyLedger {
        active: Mutex<HashMap<H256, bool>>,
        owners: Mutex<HashMap<U256, Address>>,
        fail_records: bool,
    }

    #[async_trait]
    impl MarketplaceLedger for StateOnlyLedger {
        async fn block_number(&self) -> Result<u64> {
            Ok(0)
        }
        async fn query_events(
            &self,
            _name: EventName,
            _from_block: u64,
            _to_block: Option<u64>,
        ) -> Result<Vec<ListingEvent>> {
            Ok(vec![])
        }
        async fn subscribe_events(&self, _name: EventName) -> Result<EventReceiver> {
            Err(anyhow!("not supported"))
        }
        async fn listing_active(&self, id: H256) -> Result<bool> {
            if self.fail_records {
                return Err(anyhow!("node error"));
            }
            Ok(*self.active.lock().unwrap().get(&id).unwrap_or(&false))
        }
        async fn token_owner(&self, _asset: Address, token_id: U256) -> Result<Address> {
            Ok(*self
                .owners
                .lock()
                .unwrap()
                .get(&token_id)
                .unwrap_or(&Address::zero()))
        }
        async fn transfers_touching(
            &self,
            _account: Address,
            _from_block: u64,
            _to_block: Option<u64>,
        ) -> Result<Vec<TransferEvent>> {
            Ok(vec![])
        }
    }

    fn listing(token: u64) -> Listing {
        Listing::new(addr(2), addr(1), U256::from(token), U256::from(100u64))
    }

    #[tokio::test]
    async fn drops_inactive_and_unescrowed_entries() {
        let escrow = addr(9);
        let good = listing(1);
        let inactive = listing(2);
        let moved = listing(3);

        let ledger = StateOnlyLedger::default();
        {
            let mut active = ledger.active.lock().unwrap();
            active.insert(good.id, true);
            active.insert(inactive.id, false);
            active.insert(moved.id, true);
            let mut owners = ledger.owners.lock().unwrap();
            owners.insert(good.token_id, escrow);
            owners.insert(moved.token_id, addr(7)); // left escrow by another path
        }

        let out =
            verify_candidates(&ledger, escrow, vec![good.clone(), inactive.clone(), moved.clone()])
                .await;
        assert_eq!(out.verified.len(), 1);
        assert!(out.verified.contains_key(&good.id));
        assert!(out.dropped.contains(&inactive.id));
        assert!(out.dropped.contains(&moved.id));
    }

    #[tokio::test]
    async fn read_failures_keep_the_candidate() {
        let escrow = addr(9);
        let l = listing(1);
        let ledger = StateOnlyLedger {
            fail_records: true,
            ..Default::default()
        };
        let out = verify_candidates(&ledger, escrow, vec![l.clone()]).await;
        assert!(out.verified.contains_key(&l.id));
        assert!(out.dropped.is_empty());
    }
}
