//! Deterministic reconstruction of the active listing set from lifecycle
//! events. Events are sorted by `(block, log index)` and folded left:
//! `Listed` inserts, `Cancelled`/`Bought` deletes. The fold is idempotent:
//! replaying any superset of previously seen events, in any chunking, lands
//! on the same map, which is what makes overlapping query windows safe.

use std::collections::HashMap;

use crate::types::{Listing, ListingEvent, ListingEventKind, ListingId};

/// The authoritative set derived purely from events. Per id, the event with
/// the greatest ordinal decides: a removal beats any `Listed` at or below
/// its ordinal, and a later `Listed` relists the id (the same triple derives
/// the same id, so cancel-then-relist is a normal lifecycle, not a
/// conflict). Stale removal ordinals are remembered so out-of-order
/// re-delivery of an old `Listed` cannot resurrect anything.
#[derive(Clone, Debug, Default)]
pub struct ActiveSet {
    pub active: HashMap<ListingId, Listing>,
    /// Greatest removal ordinal seen per id.
    removed: HashMap<ListingId, (u64, u64)>,
    /// Greatest applied `Listed` ordinal per id.
    listed: HashMap<ListingId, (u64, u64)>,
}

impl ActiveSet {
    /// Apply one batch of events on top of the current state. Used for
    /// push-delivered events between full replays; the periodic replay
    /// remains the source of truth.
    pub fn apply(&mut self, events: impl IntoIterator<Item = ListingEvent>) {
        let mut batch: Vec<ListingEvent> = events.into_iter().collect();
        batch.sort_by_key(ListingEvent::ordinal);
        for ev in batch {
            let ordinal = ev.ordinal();
            match ev.kind {
                ListingEventKind::Listed(listing) => {
                    let superseded_by_removal = self
                        .removed
                        .get(&listing.id)
                        .is_some_and(|r| *r >= ordinal);
                    let superseded_by_listing = self
                        .listed
                        .get(&listing.id)
                        .is_some_and(|l| *l > ordinal);
                    if !superseded_by_removal && !superseded_by_listing {
                        self.listed.insert(listing.id, ordinal);
                        self.active.insert(listing.id, listing);
                    }
                }
                ListingEventKind::Cancelled { id } | ListingEventKind::Bought { id, .. } => {
                    let latest = self.removed.entry(id).or_insert(ordinal);
                    if *latest < ordinal {
                        *latest = ordinal;
                    }
                    // a removal older than the current listing is stale
                    if self.listed.get(&id).map_or(true, |l| *l < ordinal) {
                        self.active.remove(&id);
                    }
                }
            }
        }
    }

    /// True when the latest known event for this id is a removal. Gates the
    /// optimistic merge: a tentative entry for a removed, not-relisted id is
    /// stale and must not render.
    pub fn suppressed(&self, id: &ListingId) -> bool {
        self.removed.contains_key(id) && !self.active.contains_key(id)
    }
}

/// Rebuild the active set from scratch from every known event.
pub fn replay(events: impl IntoIterator<Item = ListingEvent>) -> ActiveSet {
    let mut set = ActiveSet::default();
    set.apply(events);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, H256, U256};

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    fn listing(token: u64) -> Listing {
        Listing::new(addr(2), addr(1), U256::from(token), U256::from(100u64))
    }

    fn listed(l: &Listing, block: u64, idx: u64) -> ListingEvent {
        ListingEvent {
            block_number: block,
            log_index: idx,
            tx_hash: H256::zero(),
            kind: ListingEventKind::Listed(l.clone()),
        }
    }

    fn bought(l: &Listing, block: u64, idx: u64) -> ListingEvent {
        ListingEvent {
            block_number: block,
            log_index: idx,
            tx_hash: H256::zero(),
            kind: ListingEventKind::Bought {
                id: l.id,
                buyer: addr(3),
                seller: l.seller,
                asset: l.asset,
                token_id: l.token_id,
                price: l.price,
            },
        }
    }

    fn cancelled(l: &Listing, block: u64, idx: u64) -> ListingEvent {
        ListingEvent {
            block_number: block,
            log_index: idx,
            tx_hash: H256::zero(),
            kind: ListingEventKind::Cancelled { id: l.id },
        }
    }

    #[test]
    fn lone_listed_event_is_active() {
        let l = listing(1);
        let set = replay([listed(&l, 10, 0)]);
        assert_eq!(set.active.get(&l.id), Some(&l));
        assert!(!set.suppressed(&l.id));
    }

    #[test]
    fn buy_after_list_empties_the_set() {
        let l = listing(1);
        let set = replay([listed(&l, 10, 0), bought(&l, 12, 0)]);
        assert!(set.active.is_empty());
        assert!(set.suppressed(&l.id));
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let l = listing(1);
        // delivered buy-first, but block order says list(3) then buy(5)
        let set = replay([bought(&l, 5, 0), listed(&l, 3, 0)]);
        assert!(set.active.is_empty());
    }

    #[test]
    fn intra_block_log_position_breaks_ties() {
        let l = listing(1);
        let set = replay([cancelled(&l, 10, 1), listed(&l, 10, 0)]);
        assert!(set.active.is_empty());
        // cancel at log 0, list at log 1: the list is the later event
        let set = replay([listed(&l, 10, 1), cancelled(&l, 10, 0)]);
        assert_eq!(set.active.get(&l.id), Some(&l));
    }

    #[test]
    fn stale_listed_cannot_resurrect_a_removed_id() {
        let l = listing(1);
        // a Listed at or below the removal's ordinal stays suppressed
        let set = replay([bought(&l, 5, 0), listed(&l, 3, 0)]);
        assert!(set.active.is_empty());

        // and incrementally, re-delivery of the old Listed changes nothing
        let mut set = replay([bought(&l, 5, 0)]);
        set.apply([listed(&l, 3, 0)]);
        set.apply([listed(&l, 3, 0)]);
        assert!(set.active.is_empty());
        assert!(set.suppressed(&l.id));
    }

    #[test]
    fn relisting_after_cancel_restores_the_listing() {
        // same (seller, asset, token) triple: the relist derives the same id
        let first = listing(1);
        let relist = Listing::new(
            first.seller,
            first.asset,
            first.token_id,
            U256::from(200u64),
        );
        assert_eq!(first.id, relist.id);

        let set = replay([
            listed(&first, 10, 0),
            cancelled(&first, 12, 0),
            listed(&relist, 20, 0),
        ]);
        assert_eq!(set.active.get(&relist.id), Some(&relist));
        assert!(!set.suppressed(&relist.id));
    }

    #[test]
    fn late_delivered_removal_does_not_undo_a_relist() {
        let first = listing(1);
        let relist = Listing::new(
            first.seller,
            first.asset,
            first.token_id,
            U256::from(200u64),
        );
        // the relist arrives before the cancel that preceded it on chain
        let mut set = replay([listed(&first, 10, 0), listed(&relist, 20, 0)]);
        set.apply([cancelled(&first, 12, 0)]);
        assert_eq!(set.active.get(&relist.id), Some(&relist));
    }

    #[test]
    fn replay_is_idempotent_across_overlapping_chunks() {
        let a = listing(1);
        let b = listing(2);
        let c = listing(3);
        let all = vec![
            listed(&a, 10, 0),
            listed(&b, 11, 0),
            bought(&a, 12, 0),
            listed(&c, 12, 1),
            cancelled(&c, 13, 0),
        ];

        let from_scratch = replay(all.clone());

        // same events twice over
        let doubled = replay(all.iter().cloned().chain(all.iter().cloned()));
        assert_eq!(doubled.active, from_scratch.active);

        // incremental with an overlapping re-delivered window
        let mut incremental = replay(all[..3].iter().cloned());
        incremental.apply(all[1..].iter().cloned());
        assert_eq!(incremental.active, from_scratch.active);

        assert_eq!(from_scratch.active.len(), 1);
        assert!(from_scratch.active.contains_key(&b.id));
    }

    #[test]
    fn removal_of_one_id_leaves_others_alone() {
        let old = listing(1);
        // same asset+token, different seller: a distinct id
        let new = Listing::new(addr(4), old.asset, old.token_id, U256::from(200u64));
        let set = replay([
            listed(&old, 10, 0),
            listed(&new, 11, 0),
            bought(&new, 12, 0),
        ]);
        assert!(set.active.contains_key(&old.id));
        assert!(!set.active.contains_key(&new.id));
        assert!(set.suppressed(&new.id));
    }
}
