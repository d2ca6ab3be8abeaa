use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Deterministic listing identifier, `keccak256(abi.encodePacked(nft, tokenId, seller))`.
/// Stable across observers: every client derives the same id for the same offer.
pub type ListingId = H256;

pub fn listing_id(asset: Address, token_id: U256, seller: Address) -> ListingId {
    let mut buf = [0u8; 72];
    buf[..20].copy_from_slice(asset.as_bytes());
    token_id.to_big_endian(&mut buf[20..52]);
    buf[52..].copy_from_slice(seller.as_bytes());
    H256::from(keccak256(buf))
}

/// One asset offered for sale. Immutable once observed; a price change is
/// modelled on-chain as cancel + relist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller: Address,
    pub asset: Address,
    pub token_id: U256,
    pub price: U256,
}

impl Listing {
    pub fn new(seller: Address, asset: Address, token_id: U256, price: U256) -> Self {
        Self {
            id: listing_id(asset, token_id, seller),
            seller,
            asset,
            token_id,
            price,
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            seller: self.seller,
            asset: self.asset,
            token_id: self.token_id,
        }
    }
}

/// Cache key for tentative entries: (seller, asset, tokenId).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub seller: Address,
    pub asset: Address,
    pub token_id: U256,
}

/// A listing-lifecycle log entry. `(block_number, log_index)` is the sole
/// ordering key; wall-clock observation order is meaningless because the
/// three event kinds are queried independently.
#[derive(Clone, Debug, PartialEq)]
pub struct ListingEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub kind: ListingEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListingEventKind {
    Listed(Listing),
    Cancelled {
        id: ListingId,
    },
    Bought {
        id: ListingId,
        buyer: Address,
        seller: Address,
        asset: Address,
        token_id: U256,
        price: U256,
    },
}

impl ListingEvent {
    pub fn id(&self) -> ListingId {
        match &self.kind {
            ListingEventKind::Listed(l) => l.id,
            ListingEventKind::Cancelled { id } => *id,
            ListingEventKind::Bought { id, .. } => *id,
        }
    }

    pub fn ordinal(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// One completed quiz round as recorded by the registry. For the local
/// fallback source the quiz contract itself is the recorder; then seed and
/// winners are zero and `source` is the quiz contract.
#[derive(Clone, Debug, PartialEq)]
pub struct QuizEndRecord {
    /// Registry (or local-history) index. Stable tie-break key.
    pub index: u64,
    pub id: U256,
    pub title: String,
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: u8,
    pub participants: U256,
    pub correct: U256,
    pub winners: [Address; 3],
    /// Correlation key shared with the payout records. Zero when absent.
    pub seed: H256,
    /// Epoch seconds.
    pub ended_at: u64,
    pub source: Address,
}

/// One payout action. Each winner slot may be zero-filled when that share
/// was skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionRecord {
    /// Registry index. Stable tie-break key.
    pub index: u64,
    pub winners: [Address; 3],
    pub amounts: [U256; 3],
    pub tx_hashes: [H256; 3],
    pub seed: H256,
    /// Epoch seconds.
    pub at: u64,
    pub source: Address,
}

impl DistributionRecord {
    pub fn total(&self) -> U256 {
        self.amounts
            .iter()
            .fold(U256::zero(), |acc, a| acc.saturating_add(*a))
    }

    /// Number of non-zero transaction hashes: evidence that this row reflects
    /// a real payout rather than a placeholder.
    pub fn evidence(&self) -> usize {
        self.tx_hashes.iter().filter(|t| !t.is_zero()).count()
    }

    /// True when at least one non-zero winner slot appears in both records,
    /// in any slot position.
    pub fn shares_winner(&self, winners: &[Address; 3]) -> bool {
        self.winners
            .iter()
            .any(|w| !w.is_zero() && winners.iter().any(|o| o == w))
    }
}

/// Reconciled view unit: a seed with its optional quiz round and every payout
/// correlated to it. Every `DistributionRecord` belongs to exactly one group.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub seed: H256,
    pub quiz: Option<QuizEndRecord>,
    pub distributions: Vec<DistributionRecord>,
    /// Max of all linked timestamps (distribution `at`s and quiz `ended_at`).
    pub latest_at: u64,
    /// Sum of every linked distribution amount, smallest unit.
    pub total_amount: U256,
}

impl Group {
    /// The most-evidenced linked payout, if any. Distributions are kept
    /// sorted by (evidence desc, at desc), so this is the first one.
    pub fn best(&self) -> Option<&DistributionRecord> {
        self.distributions.first()
    }

    /// `latest_at` as a UTC timestamp; `None` when no linked record carries
    /// a timestamp at all.
    pub fn latest_at_utc(&self) -> Option<DateTime<Utc>> {
        (self.latest_at > 0)
            .then(|| DateTime::from_timestamp(self.latest_at as i64, 0))
            .flatten()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    #[test]
    fn listing_id_matches_packed_keccak() {
        let asset = addr(1);
        let seller = addr(2);
        let token_id = U256::from(42u64);
        let packed = ethers::abi::encode_packed(&[
            Token::Address(asset),
            Token::Uint(token_id),
            Token::Address(seller),
        ])
        .unwrap();
        assert_eq!(packed.len(), 72);
        assert_eq!(
            listing_id(asset, token_id, seller),
            H256::from(keccak256(packed))
        );
    }

    #[test]
    fn listing_id_is_stable_and_distinct() {
        let a = listing_id(addr(1), U256::from(7u64), addr(2));
        let b = listing_id(addr(1), U256::from(7u64), addr(2));
        let c = listing_id(addr(1), U256::from(8u64), addr(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn listing_survives_json_round_trip() {
        let l = Listing::new(addr(2), addr(1), U256::from(7u64), U256::from(1_000u64));
        let json = serde_json::to_string(&l).unwrap();
        let back: Listing = serde_json::from_str(&json).unwrap();
        assert_eq!(l, back);
    }

    #[test]
    fn distribution_evidence_counts_nonzero_hashes() {
        let mut d = DistributionRecord {
            index: 0,
            winners: [addr(1), Address::zero(), Address::zero()],
            amounts: [U256::from(10u64), U256::zero(), U256::zero()],
            tx_hashes: [H256::zero(); 3],
            seed: H256::zero(),
            at: 0,
            source: addr(9),
        };
        assert_eq!(d.evidence(), 0);
        d.tx_hashes[0] = H256::from([1u8; 32]);
        d.tx_hashes[2] = H256::from([2u8; 32]);
        assert_eq!(d.evidence(), 2);
    }

    #[test]
    fn winner_overlap_ignores_slot_order_and_zero() {
        let d = DistributionRecord {
            index: 0,
            winners: [addr(5), Address::zero(), addr(6)],
            amounts: [U256::zero(); 3],
            tx_hashes: [H256::zero(); 3],
            seed: H256::zero(),
            at: 0,
            source: addr(9),
        };
        assert!(d.shares_winner(&[addr(7), addr(6), Address::zero()]));
        assert!(!d.shares_winner(&[addr(7), addr(8), Address::zero()]));
        // zero addresses on both sides never count as overlap
        assert!(!d.shares_winner(&[Address::zero(); 3]));
    }

    #[test]
    fn latest_at_renders_as_utc_or_not_at_all() {
        let mut g = Group {
            seed: H256::zero(),
            quiz: None,
            distributions: vec![],
            latest_at: 0,
            total_amount: U256::zero(),
        };
        assert_eq!(g.latest_at_utc(), None);
        g.latest_at = 1_700_000_000;
        assert_eq!(
            g.latest_at_utc().map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn group_total_saturates_instead_of_overflowing() {
        let d = DistributionRecord {
            index: 0,
            winners: [addr(1); 3],
            amounts: [U256::MAX, U256::from(1u64), U256::zero()],
            tx_hashes: [H256::zero(); 3],
            seed: H256::zero(),
            at: 0,
            source: addr(9),
        };
        assert_eq!(d.total(), U256::MAX);
    }
}
