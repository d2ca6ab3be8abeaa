//! JSON-RPC ledger backend. Implements both ledger traits over an HTTP
//! provider: typed log queries with metadata for replay, installed-filter
//! polling for push delivery, and multicall-aggregated view reads for
//! verification and the history streams (degrading to concurrent single
//! calls on chains without a multicall deployment).

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::{Detokenize, Token};
use ethers::contract::{ContractCall, EthEvent, Multicall};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Filter, H256, U256};
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BoughtFilter, CancelledFilter, ListedFilter, Marketplace, QuizGame, QuizRegistry, TicketToken,
    TransferFilter,
};
use crate::config::ContractsConfig;
use crate::ledger::{EventName, EventReceiver, HistoryLedger, MarketplaceLedger, TransferEvent};
use crate::types::{
    DistributionRecord, Listing, ListingEvent, ListingEventKind, QuizEndRecord,
};

pub struct EthLedger {
    provider: Arc<Provider<Http>>,
    contracts: ContractsConfig,
    marketplace: Marketplace<Provider<Http>>,
    ticket: TicketToken<Provider<Http>>,
    registry: Option<QuizRegistry<Provider<Http>>>,
    quiz: Option<QuizGame<Provider<Http>>>,
}

impl EthLedger {
    pub fn new(provider: Arc<Provider<Http>>, contracts: ContractsConfig) -> Self {
        let marketplace = Marketplace::new(contracts.marketplace, provider.clone());
        let ticket = TicketToken::new(contracts.ticket, provider.clone());
        let registry = contracts
            .registry
            .map(|addr| QuizRegistry::new(addr, provider.clone()));
        let quiz = contracts
            .quiz
            .map(|addr| QuizGame::new(addr, provider.clone()));
        Self {
            provider,
            contracts,
            marketplace,
            ticket,
            registry,
            quiz,
        }
    }

    /// Build from the environment: `RPC_URL` plus the contract variables
    /// [`ContractsConfig::from_env`] reads.
    pub async fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let rpc = std::env::var("RPC_URL").context("RPC_URL must be set")?;
        let provider = Provider::<Http>::try_from(rpc).context("RPC_URL is not a valid url")?;
        let contracts = ContractsConfig::from_env()?;
        Ok(Self::new(Arc::new(provider), contracts))
    }

    pub fn contracts(&self) -> &ContractsConfig {
        &self.contracts
    }

    /// One aggregated round-trip for the verifier's paired reads. Each call
    /// is allowed to fail individually; a reverted slot decodes to `None`.
    async fn batched_listing_states(
        &self,
        candidates: &[(H256, Address, U256)],
    ) -> Result<Vec<(Option<bool>, Option<Address>)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = Multicall::new(self.provider.clone(), None).await?;
        for (id, asset, token_id) in candidates {
            batch.add_call(self.marketplace.listings((*id).into()), true);
            let erc721 = TicketToken::new(*asset, self.provider.clone());
            batch.add_call(erc721.owner_of(*token_id), true);
        }
        let tokens = batch.call_raw().await?;

        let mut slots = tokens.into_iter();
        let mut out = Vec::with_capacity(candidates.len());
        while let (Some(record), Some(owner)) = (slots.next(), slots.next()) {
            let active = record
                .ok()
                .and_then(detokenize_row::<ListingTuple>)
                .map(|(_, _, _, _, active)| active);
            let owner = owner.ok().and_then(Token::into_address);
            out.push((active, owner));
        }
        Ok(out)
    }

    /// One aggregated round-trip for a set of per-index view reads. A slot
    /// that reverts or decodes badly becomes `None`; the batch survives.
    async fn batched_rows<T, F>(&self, indices: &[u64], call: F) -> Result<Vec<Option<T>>>
    where
        T: Detokenize + Send,
        F: Fn(u64) -> ContractCall<Provider<Http>, T> + Send + Sync,
    {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = Multicall::new(self.provider.clone(), None).await?;
        for &index in indices {
            batch.add_call(call(index), true);
        }
        let tokens = batch.call_raw().await?;
        Ok(tokens
            .into_iter()
            .map(|slot| slot.ok().and_then(detokenize_row::<T>))
            .collect())
    }
}

#[async_trait]
impl MarketplaceLedger for EthLedger {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn query_events(
        &self,
        name: EventName,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<ListingEvent>> {
        let to = to_block.map_or(BlockNumber::Latest, BlockNumber::from);
        let events = match name {
            EventName::Listed => {
                let logs = self
                    .marketplace
                    .event::<ListedFilter>()
                    .from_block(from_block)
                    .to_block(to)
                    .query_with_meta()
                    .await?;
                logs.into_iter()
                    .map(|(ev, meta)| ListingEvent {
                        block_number: meta.block_number.as_u64(),
                        log_index: meta.log_index.as_u64(),
                        tx_hash: meta.transaction_hash,
                        kind: ListingEventKind::Listed(Listing {
                            id: H256::from(ev.id),
                            seller: ev.seller,
                            asset: ev.nft,
                            token_id: ev.token_id,
                            price: ev.price,
                        }),
                    })
                    .collect()
            }
            EventName::Cancelled => {
                let logs = self
                    .marketplace
                    .event::<CancelledFilter>()
                    .from_block(from_block)
                    .to_block(to)
                    .query_with_meta()
                    .await?;
                logs.into_iter()
                    .map(|(ev, meta)| ListingEvent {
                        block_number: meta.block_number.as_u64(),
                        log_index: meta.log_index.as_u64(),
                        tx_hash: meta.transaction_hash,
                        kind: ListingEventKind::Cancelled {
                            id: H256::from(ev.id),
                        },
                    })
                    .collect()
            }
            EventName::Bought => {
                let logs = self
                    .marketplace
                    .event::<BoughtFilter>()
                    .from_block(from_block)
                    .to_block(to)
                    .query_with_meta()
                    .await?;
                logs.into_iter()
                    .map(|(ev, meta)| ListingEvent {
                        block_number: meta.block_number.as_u64(),
                        log_index: meta.log_index.as_u64(),
                        tx_hash: meta.transaction_hash,
                        kind: ListingEventKind::Bought {
                            id: H256::from(ev.id),
                            buyer: ev.buyer,
                            seller: ev.seller,
                            asset: ev.nft,
                            token_id: ev.token_id,
                            price: ev.price,
                        },
                    })
                    .collect()
            }
        };
        Ok(events)
    }

    async fn subscribe_events(&self, name: EventName) -> Result<EventReceiver> {
        let topic0 = match name {
            EventName::Listed => ListedFilter::signature(),
            EventName::Cancelled => CancelledFilter::signature(),
            EventName::Bought => BoughtFilter::signature(),
        };
        let filter = Filter::new()
            .address(self.contracts.marketplace)
            .topic0(topic0);

        let (tx, rx) = mpsc::channel(32);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            // Installed-filter polling; the node drops the filter when we
            // stop polling, and we stop when the receiver goes away.
            let mut watcher = match provider.watch(&filter).await {
                Ok(w) => w,
                Err(e) => {
                    debug!(event = name.as_str(), error = %e, "log watch failed");
                    return;
                }
            };
            while let Some(log) = watcher.next().await {
                let Some(event) = decode_listing_log(name, &log) else {
                    continue;
                };
                if tx.send(vec![event]).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn listing_active(&self, id: H256) -> Result<bool> {
        let (_, _, _, _, active) = self.marketplace.listings(id.into()).call().await?;
        Ok(active)
    }

    async fn token_owner(&self, asset: Address, token_id: U256) -> Result<Address> {
        let erc721 = TicketToken::new(asset, self.provider.clone());
        Ok(erc721.owner_of(token_id).call().await?)
    }

    async fn listing_states(
        &self,
        candidates: &[(H256, Address, U256)],
    ) -> Vec<(Option<bool>, Option<Address>)> {
        match self.batched_listing_states(candidates).await {
            Ok(states) => states,
            // no multicall on this chain, or the aggregate call itself
            // failed: degrade to concurrent single reads
            Err(e) => {
                debug!(error = %e, "aggregated verification read failed, using single calls");
                let reads = candidates.iter().map(|(id, asset, token_id)| async move {
                    (
                        self.listing_active(*id).await.ok(),
                        self.token_owner(*asset, *token_id).await.ok(),
                    )
                });
                join_all(reads).await
            }
        }
    }

    async fn transfers_touching(
        &self,
        account: Address,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<TransferEvent>> {
        let to = to_block.map_or(BlockNumber::Latest, BlockNumber::from);
        let topic = address_topic(account);
        let outgoing = self
            .ticket
            .event::<TransferFilter>()
            .from_block(from_block)
            .to_block(to)
            .topic1(topic);
        let incoming = self
            .ticket
            .event::<TransferFilter>()
            .from_block(from_block)
            .to_block(to)
            .topic2(topic);
        let (sent, received) =
            tokio::try_join!(outgoing.query_with_meta(), incoming.query_with_meta())?;

        let mut transfers: Vec<TransferEvent> = sent
            .into_iter()
            .chain(received)
            .map(|(ev, meta)| TransferEvent {
                block_number: meta.block_number.as_u64(),
                log_index: meta.log_index.as_u64(),
                tx_hash: meta.transaction_hash,
                asset: self.contracts.ticket,
                from: ev.from,
                to: ev.to,
                token_id: ev.token_id,
            })
            .collect();
        // A self-transfer matches both topic queries.
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        transfers.dedup_by_key(|t| (t.block_number, t.log_index));
        Ok(transfers)
    }
}

#[async_trait]
impl HistoryLedger for EthLedger {
    async fn quiz_ends_len(&self) -> Result<u64> {
        let Some(registry) = &self.registry else {
            return Ok(0);
        };
        Ok(registry.quiz_ends_length().call().await?.as_u64())
    }

    async fn distributions_len(&self) -> Result<u64> {
        let Some(registry) = &self.registry else {
            return Ok(0);
        };
        Ok(registry.distributions_length().call().await?.as_u64())
    }

    async fn quiz_ends(&self, indices: &[u64]) -> Result<Vec<Option<QuizEndRecord>>> {
        let Some(registry) = &self.registry else {
            return Ok(indices.iter().map(|_| None).collect());
        };
        match self
            .batched_rows(indices, |i| registry.get_quiz_end(U256::from(i)))
            .await
        {
            Ok(rows) => Ok(rows
                .into_iter()
                .zip(indices)
                .map(|(row, &index)| row.map(|t| quiz_end_from(index, t)))
                .collect()),
            Err(e) => {
                debug!(error = %e, "aggregated quiz read failed, using single calls");
                let reads = indices.iter().map(|&index| async move {
                    match registry.get_quiz_end(U256::from(index)).call().await {
                        Ok(t) => Some(quiz_end_from(index, t)),
                        Err(e) => {
                            debug!(index, error = %e, "quiz end read failed, skipping row");
                            None
                        }
                    }
                });
                Ok(join_all(reads).await)
            }
        }
    }

    async fn distributions(&self, indices: &[u64]) -> Result<Vec<Option<DistributionRecord>>> {
        let Some(registry) = &self.registry else {
            return Ok(indices.iter().map(|_| None).collect());
        };
        match self
            .batched_rows(indices, |i| registry.get_distribution(U256::from(i)))
            .await
        {
            Ok(rows) => Ok(rows
                .into_iter()
                .zip(indices)
                .map(|(row, &index)| row.map(|t| distribution_from(index, t)))
                .collect()),
            Err(e) => {
                debug!(error = %e, "aggregated distribution read failed, using single calls");
                let reads = indices.iter().map(|&index| async move {
                    match registry.get_distribution(U256::from(index)).call().await {
                        Ok(t) => Some(distribution_from(index, t)),
                        Err(e) => {
                            debug!(index, error = %e, "distribution read failed, skipping row");
                            None
                        }
                    }
                });
                Ok(join_all(reads).await)
            }
        }
    }

    async fn local_history_len(&self) -> Result<u64> {
        let Some(quiz) = &self.quiz else {
            return Ok(0);
        };
        Ok(quiz.history_length().call().await?.as_u64())
    }

    async fn local_history(&self, indices: &[u64]) -> Result<Vec<Option<QuizEndRecord>>> {
        let Some(quiz) = &self.quiz else {
            return Ok(indices.iter().map(|_| None).collect());
        };
        let source = quiz.address();
        match self
            .batched_rows(indices, |i| quiz.get_history(U256::from(i)))
            .await
        {
            Ok(rows) => Ok(rows
                .into_iter()
                .zip(indices)
                .map(|(row, &index)| row.map(|t| local_history_from(index, source, t)))
                .collect()),
            Err(e) => {
                debug!(error = %e, "aggregated history read failed, using single calls");
                let reads = indices.iter().map(|&index| async move {
                    match quiz.get_history(U256::from(index)).call().await {
                        Ok(t) => Some(local_history_from(index, source, t)),
                        Err(e) => {
                            debug!(index, error = %e, "local history read failed, skipping row");
                            None
                        }
                    }
                });
                Ok(join_all(reads).await)
            }
        }
    }
}

type ListingTuple = (Address, Address, U256, U256, bool);
type QuizEndTuple = (
    U256,
    String,
    String,
    Vec<String>,
    u8,
    U256,
    U256,
    Address,
    Address,
    Address,
    [u8; 32],
    u64,
    Address,
);
type DistributionTuple = (
    Address,
    Address,
    Address,
    U256,
    U256,
    U256,
    [u8; 32],
    [u8; 32],
    [u8; 32],
    [u8; 32],
    u64,
    Address,
);
type LocalHistoryTuple = (U256, String, String, Vec<String>, u8, U256, U256, u64);

/// Multicall returns each multi-output call as one tuple token; single-output
/// calls come back as the bare value.
fn detokenize_row<T: Detokenize>(token: Token) -> Option<T> {
    match token {
        Token::Tuple(fields) => T::from_tokens(fields).ok(),
        other => T::from_tokens(vec![other]).ok(),
    }
}

fn quiz_end_from(index: u64, t: QuizEndTuple) -> QuizEndRecord {
    let (
        id,
        title,
        question,
        options,
        correct_option,
        participants,
        correct,
        w1,
        w2,
        w3,
        seed,
        ended_at,
        source,
    ) = t;
    QuizEndRecord {
        index,
        id,
        title,
        question,
        options,
        correct_option,
        participants,
        correct,
        winners: [w1, w2, w3],
        seed: H256::from(seed),
        ended_at,
        source,
    }
}

fn distribution_from(index: u64, t: DistributionTuple) -> DistributionRecord {
    let (w1, w2, w3, a1, a2, a3, t1, t2, t3, seed, at, source) = t;
    DistributionRecord {
        index,
        winners: [w1, w2, w3],
        amounts: [a1, a2, a3],
        tx_hashes: [H256::from(t1), H256::from(t2), H256::from(t3)],
        seed: H256::from(seed),
        at,
        source,
    }
}

/// No seed, no winners: the quiz contract does not record them, which is
/// exactly why this source is secondary.
fn local_history_from(index: u64, source: Address, t: LocalHistoryTuple) -> QuizEndRecord {
    let (id, title, question, options, correct_option, participants, correct, ended_at) = t;
    QuizEndRecord {
        index,
        id,
        title,
        question,
        options,
        correct_option,
        participants,
        correct,
        winners: [Address::zero(); 3],
        seed: H256::zero(),
        ended_at,
        source,
    }
}

fn decode_listing_log(name: EventName, log: &ethers::types::Log) -> Option<ListingEvent> {
    // Pending logs carry no position; skip until mined.
    let block_number = log.block_number?.as_u64();
    let log_index = log.log_index?.as_u64();
    let tx_hash = log.transaction_hash?;
    let raw = ethers::abi::RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let kind = match name {
        EventName::Listed => {
            let ev = ListedFilter::decode_log(&raw).ok()?;
            ListingEventKind::Listed(Listing {
                id: H256::from(ev.id),
                seller: ev.seller,
                asset: ev.nft,
                token_id: ev.token_id,
                price: ev.price,
            })
        }
        EventName::Cancelled => {
            let ev = CancelledFilter::decode_log(&raw).ok()?;
            ListingEventKind::Cancelled {
                id: H256::from(ev.id),
            }
        }
        EventName::Bought => {
            let ev = BoughtFilter::decode_log(&raw).ok()?;
            ListingEventKind::Bought {
                id: H256::from(ev.id),
                buyer: ev.buyer,
                seller: ev.seller,
                asset: ev.nft,
                token_id: ev.token_id,
                price: ev.price,
            }
        }
    };
    Some(ListingEvent {
        block_number,
        log_index,
        tx_hash,
        kind,
    })
}

fn address_topic(addr: Address) -> H256 {
    let mut topic = H256::zero();
    topic.0[12..].copy_from_slice(addr.as_bytes());
    topic
}
