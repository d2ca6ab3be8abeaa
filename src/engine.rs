//! The optimistic listing view. One engine instance owns one derived cache:
//! replayed chain events merged with the account's tentative entries,
//! double-checked by direct state reads, published over a watch channel.
//! Every trigger (user action, poll tick, push delivery, explicit refresh)
//! funnels into a single non-reentrant recompute; overlapping triggers
//! coalesce into at most one queued follow-up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use ethers::types::{Address, U256};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Consecutive fetch failures before the log level escalates.
const FETCH_FAILURE_ALERT: u32 = 3;

use crate::cache::OptimisticCache;
use crate::config::{ContractsConfig, SyncConfig};
use crate::ledger::{EventName, MarketplaceLedger};
use crate::replay::{replay, ActiveSet};
use crate::store::KvStore;
use crate::types::{Listing, ListingEvent, ListingId, ListingKey};
use crate::verify::verify_candidates;

pub struct ListingEngine {
    inner: Arc<ListingInner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct ListingInner {
    ledger: Arc<dyn MarketplaceLedger>,
    contracts: ContractsConfig,
    config: SyncConfig,
    state: Mutex<ViewState>,
    tx: watch::Sender<Vec<Listing>>,
    trigger: Notify,
    gate: Mutex<()>,
    rerun: AtomicBool,
    disposed: AtomicBool,
    fetch_failures: AtomicU32,
}

struct ViewState {
    cache: OptimisticCache,
    active: ActiveSet,
    /// Session-only hidden ids (e.g. an item this session just bought).
    /// Never persisted.
    hidden: HashSet<ListingId>,
}

impl ListingEngine {
    pub fn new(
        ledger: Arc<dyn MarketplaceLedger>,
        store: Arc<dyn KvStore>,
        contracts: ContractsConfig,
        config: SyncConfig,
    ) -> Self {
        let cache = OptimisticCache::new(store, contracts.chain_id, contracts.marketplace);
        let (tx, _rx) = watch::channel(Vec::new());
        let inner = Arc::new(ListingInner {
            ledger,
            contracts,
            config,
            state: Mutex::new(ViewState {
                cache,
                active: ActiveSet::default(),
                hidden: HashSet::new(),
            }),
            tx,
            trigger: Notify::new(),
            gate: Mutex::new(()),
            rerun: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            fetch_failures: AtomicU32::new(0),
        });

        let mut tasks = Vec::new();

        // Poll loop; also drains debounced triggers.
        tasks.push({
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = inner.trigger.notified() => {
                            tokio::time::sleep(inner.config.debounce).await;
                        }
                    }
                    if inner.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.recompute().await;
                }
            })
        });

        // Push subscriptions, one per event kind. Delivery is best-effort;
        // the poll loop reconciles whatever they miss.
        for name in EventName::ALL {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                let mut rx = match inner.ledger.subscribe_events(name).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        debug!(event = name.as_str(), error = %e, "event subscription unavailable");
                        return;
                    }
                };
                while let Some(batch) = rx.recv().await {
                    if inner.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.apply_live(batch).await;
                }
            }));
        }

        Self {
            inner,
            tasks: std::sync::Mutex::new(tasks),
        }
    }

    /// Current verified, deduplicated, account-scoped listing snapshot.
    pub fn listings(&self) -> Vec<Listing> {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Listing>> {
        self.inner.tx.subscribe()
    }

    /// Record a just-submitted listing so it shows before the chain
    /// confirms it. Returns the tentative entry with its derived id.
    pub async fn add_optimistic(
        &self,
        seller: Address,
        asset: Address,
        token_id: U256,
        price: U256,
    ) -> Listing {
        let listing = Listing::new(seller, asset, token_id, price);
        {
            let mut state = self.inner.state.lock().await;
            state.cache.put(listing.clone()).await;
            self.inner.publish(&state);
        }
        self.inner.trigger.notify_one();
        listing
    }

    /// Drop a tentative entry (the submitting session confirmed or
    /// abandoned the action).
    pub async fn remove_optimistic(&self, key: &ListingKey) {
        {
            let mut state = self.inner.state.lock().await;
            state.cache.remove(key).await;
            self.inner.publish(&state);
        }
        self.inner.trigger.notify_one();
    }

    /// Hide a listing for this session only, e.g. right after buying it.
    pub async fn hide_listing(&self, id: ListingId) {
        let mut state = self.inner.state.lock().await;
        state.hidden.insert(id);
        self.inner.publish(&state);
    }

    /// Switch the active account. The previous account's tentative entries
    /// are discarded and the new account's persisted ones reseeded.
    pub async fn set_account(&self, account: Option<Address>) {
        {
            let mut state = self.inner.state.lock().await;
            state.cache.set_account(account).await;
            self.inner.publish(&state);
        }
        self.inner.trigger.notify_one();
    }

    /// Schedule a reconcile (debounced, coalesced).
    pub fn refresh(&self) {
        self.inner.trigger.notify_one();
    }

    /// Run one full reconcile pass and wait for it.
    pub async fn refresh_now(&self) {
        self.inner.recompute().await;
    }

    /// Tear the view down: timers and subscriptions are released, and any
    /// in-flight fetch completing afterwards is discarded, not applied.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ListingEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ListingInner {
    async fn recompute(self: &Arc<Self>) {
        let Ok(_guard) = self.gate.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            return;
        };
        loop {
            self.pass().await;
            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
        }
    }

    /// One full reconcile: replay, merge, verify, publish.
    async fn pass(&self) {
        match self.query_full_window().await {
            Ok(events) => {
                self.fetch_failures.store(0, Ordering::SeqCst);
                self.install_replay(replay(events)).await;
            }
            // Transient; the last reconciled set stays visible and the next
            // scheduled pass retries.
            Err(e) => {
                let streak = self.fetch_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if streak >= FETCH_FAILURE_ALERT {
                    error!(error = %e, streak, "event fetch keeps failing, listing view is stale");
                } else {
                    warn!(error = %e, "event fetch failed, keeping last reconciled listings");
                }
            }
        }

        // Snapshot candidates, verify without holding the state lock (the
        // batch read may be slow and user actions must not queue behind it).
        let (candidates, escrow) = {
            let state = self.state.lock().await;
            (candidates_of(&state), self.contracts.marketplace)
        };
        let outcome = verify_candidates(&*self.ledger, escrow, candidates).await;

        // Drops leave the current snapshot and purge any tentative copy, but
        // are not recorded as removals: only a real removal event outranks a
        // later Listed, so a refuted pre-mine optimistic entry can still
        // surface once its transaction lands.
        let mut state = self.state.lock().await;
        for id in &outcome.dropped {
            state.active.active.remove(id);
            state.cache.remove_by_id(id).await;
        }
        self.publish(&state);
    }

    async fn query_full_window(&self) -> Result<Vec<ListingEvent>> {
        let from = self.contracts.deploy_block_marketplace;
        let events = self.query_window(from).await?;
        // A misconfigured deploy block looks like an empty contract; rescan
        // from genesis before believing that.
        if from > 0 && events.is_empty() {
            debug!("no events above configured deploy block, rescanning from genesis");
            return self.query_window(0).await;
        }
        Ok(events)
    }

    async fn query_window(&self, from: u64) -> Result<Vec<ListingEvent>> {
        let (listed, cancelled, bought) = tokio::try_join!(
            self.ledger.query_events(EventName::Listed, from, None),
            self.ledger.query_events(EventName::Cancelled, from, None),
            self.ledger.query_events(EventName::Bought, from, None),
        )?;
        Ok(listed
            .into_iter()
            .chain(cancelled)
            .chain(bought)
            .collect())
    }

    /// A full replay replaces the previous fold wholesale; removal history
    /// is rebuilt from the events themselves every pass.
    async fn install_replay(&self, rebuilt: ActiveSet) {
        let mut state = self.state.lock().await;

        // Tentative entries superseded by confirmed chain state, or
        // invalidated by an observed removal, leave the cache.
        let purge: Vec<ListingId> = state
            .cache
            .all()
            .into_iter()
            .filter(|l| rebuilt.active.contains_key(&l.id) || rebuilt.suppressed(&l.id))
            .map(|l| l.id)
            .collect();
        for id in purge {
            state.cache.remove_by_id(&id).await;
        }

        state.active = rebuilt;
    }

    /// Incremental application of push-delivered events between replays.
    async fn apply_live(&self, batch: Vec<ListingEvent>) {
        let mut state = self.state.lock().await;
        let ids: Vec<ListingId> = batch.iter().map(ListingEvent::id).collect();
        state.active.apply(batch);
        // Whatever the chain now says about an id supersedes the tentative
        // entry carrying it.
        for id in ids {
            state.cache.remove_by_id(&id).await;
        }
        self.publish(&state);
        drop(state);
        // Verify the refreshed merge soon.
        self.trigger.notify_one();
    }

    fn publish(&self, state: &ViewState) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.tx.send_replace(visible_of(state));
    }
}

fn candidates_of(state: &ViewState) -> Vec<Listing> {
    let mut out: Vec<Listing> = state.active.active.values().cloned().collect();
    let keys: HashSet<ListingKey> = out.iter().map(Listing::key).collect();
    for l in state.cache.all() {
        if !state.active.suppressed(&l.id) && !keys.contains(&l.key()) {
            out.push(l);
        }
    }
    out.sort_by_key(|l| l.id);
    out
}

fn visible_of(state: &ViewState) -> Vec<Listing> {
    let mut out = candidates_of(state);
    out.retain(|l| !state.hidden.contains(&l.id));
    out
}
