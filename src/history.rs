//! History aggregation: joins the two independently-emitted registry streams
//! (quiz-end records and prize distributions) into display groups. The seed
//! is the primary correlation key; when it is absent or unrecorded the
//! aggregator falls back to heuristic inference (shared winner addresses
//! inside a bounded time window), and whatever still cannot be correlated
//! surfaces as an orphaned payout rather than being dropped.
//!
//! The heuristics are deliberately best-effort: false positive/negative
//! links are possible by design, and both time windows are configuration,
//! not contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ethers::types::U256;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive per-stream failures before the log level escalates.
const STREAM_FAILURE_ALERT: u32 = 3;

use crate::config::SyncConfig;
use crate::ledger::HistoryLedger;
use crate::types::{DistributionRecord, Group, QuizEndRecord};

pub struct HistoryAggregator {
    ledger: Arc<dyn HistoryLedger>,
    config: SyncConfig,
}

impl HistoryAggregator {
    pub fn new(ledger: Arc<dyn HistoryLedger>, config: SyncConfig) -> Self {
        Self { ledger, config }
    }

    /// Fetch both record streams, each newest-first and bounded. The streams
    /// fail independently so one bad read surface cannot zero out the other.
    pub async fn fetch_streams(
        &self,
    ) -> (
        Result<Vec<QuizEndRecord>>,
        Result<Vec<DistributionRecord>>,
    ) {
        let (quizzes, dists) = tokio::join!(self.fetch_quiz_stream(), self.fetch_dist_stream());

        // Widen the quiz fetch when payouts reference seeds we have not seen
        // yet; the registry may hold the matching quiz further back.
        let quizzes = match (quizzes, &dists) {
            (Ok(qs), Ok(ds)) => Ok(self.widen_for_missing_seeds(qs, ds).await),
            (qs, _) => qs,
        };

        // Secondary source merges last so widened registry rows keep their
        // precedence over local copies.
        let quizzes = match quizzes {
            Ok(mut qs) => {
                self.merge_local_history(&mut qs).await;
                Ok(qs)
            }
            err => err,
        };

        (quizzes, dists)
    }

    /// One-shot convenience: correlate whatever fetched. Errors only when
    /// both streams fail; a single failed stream degrades to empty for this
    /// pass (callers wanting stream-level memory use [`fetch_streams`]).
    ///
    /// [`fetch_streams`]: Self::fetch_streams
    pub async fn fetch_groups(&self) -> Result<Vec<Group>> {
        let (quizzes, dists) = self.fetch_streams().await;
        match (quizzes, dists) {
            (Err(qe), Err(de)) => Err(anyhow!("both history streams failed: {qe:#}; {de:#}")),
            (quizzes, dists) => {
                if let Err(e) = &quizzes {
                    warn!(error = %e, "quiz-end stream failed, correlating payouts alone");
                }
                if let Err(e) = &dists {
                    warn!(error = %e, "distribution stream failed, rendering quizzes alone");
                }
                Ok(correlate(
                    quizzes.unwrap_or_default(),
                    dists.unwrap_or_default(),
                    &self.config,
                ))
            }
        }
    }

    async fn fetch_quiz_stream(&self) -> Result<Vec<QuizEndRecord>> {
        let len = self.ledger.quiz_ends_len().await?;
        let indices = newest_indices(len, self.config.bounded_fetch_limit());
        let rows = self.ledger.quiz_ends(&indices).await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn fetch_dist_stream(&self) -> Result<Vec<DistributionRecord>> {
        let len = self.ledger.distributions_len().await?;
        let indices = newest_indices(len, self.config.bounded_fetch_limit());
        let rows = self.ledger.distributions(&indices).await?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Widening is opportunistic: any failure along the way keeps the rows
    /// already fetched instead of failing the stream.
    async fn widen_for_missing_seeds(
        &self,
        quizzes: Vec<QuizEndRecord>,
        dists: &[DistributionRecord],
    ) -> Vec<QuizEndRecord> {
        let have: HashSet<_> = quizzes.iter().map(|q| q.seed).collect();
        let missing = dists
            .iter()
            .any(|d| !d.seed.is_zero() && !have.contains(&d.seed));
        if !missing {
            return quizzes;
        }

        let len = match self.ledger.quiz_ends_len().await {
            Ok(len) => len,
            Err(e) => {
                debug!(error = %e, "quiz widen length read failed");
                return quizzes;
            }
        };
        if len as usize <= quizzes.len() {
            return quizzes;
        }

        let want = self.config.max_quiz_widen.max(self.config.bounded_fetch_limit());
        let indices = newest_indices(len, want);
        let rows = match self.ledger.quiz_ends(&indices).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "quiz widen fetch failed");
                return quizzes;
            }
        };

        // Merge unique by registry index.
        let mut by_index: HashMap<u64, QuizEndRecord> =
            quizzes.into_iter().map(|q| (q.index, q)).collect();
        for q in rows.into_iter().flatten() {
            by_index.entry(q.index).or_insert(q);
        }
        let mut merged: Vec<QuizEndRecord> = by_index.into_values().collect();
        merged.sort_by_key(|q| q.index);
        info!(rows = merged.len(), "widened quiz-end fetch for unmatched payout seeds");
        merged
    }

    /// Secondary source: rounds the quiz contract recorded locally but the
    /// registry never saw. Registry entries take precedence on id conflict.
    async fn merge_local_history(&self, quizzes: &mut Vec<QuizEndRecord>) {
        let len = match self.ledger.local_history_len().await {
            Ok(len) if len > 0 => len,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "local quiz history unavailable");
                return;
            }
        };
        let indices = newest_indices(len, self.config.bounded_fetch_limit());
        let rows = match self.ledger.local_history(&indices).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "local quiz history fetch failed");
                return;
            }
        };

        let known: HashSet<U256> = quizzes.iter().map(|q| q.id).collect();
        for q in rows.into_iter().flatten() {
            if !known.contains(&q.id) {
                quizzes.push(q);
            }
        }
    }
}

fn newest_indices(len: u64, take: usize) -> Vec<u64> {
    (0..take as u64)
        .filter(|i| *i < len)
        .map(|i| len - 1 - i)
        .collect()
}

/// Correlate the two record streams into groups. Pure and deterministic:
/// ties break on stable record keys, never on arrival order, so the same
/// underlying chain state always produces the same grouping.
///
/// 1. Primary join on seed (zero seeds never participate).
/// 2. Winner-overlap inference inside `fallback_window_exhaustive` for quiz
///    rounds the join left empty; among multiple candidates the payout with
///    the most non-zero tx hashes wins, closest timestamp breaks ties.
/// 3. Time-proximity attachment inside `fallback_window_light` for payouts
///    still left over, onto the nearest payout-less round.
/// 4. Whatever remains becomes an orphan group so no payout is ever dropped.
pub fn correlate(
    mut quizzes: Vec<QuizEndRecord>,
    mut dists: Vec<DistributionRecord>,
    config: &SyncConfig,
) -> Vec<Group> {
    quizzes.sort_by_key(|q| q.index);
    dists.sort_by_key(|d| d.index);

    // Primary join target per seed: the lowest-index quiz claims it.
    let mut quiz_by_seed: HashMap<_, usize> = HashMap::new();
    for (pos, q) in quizzes.iter().enumerate() {
        if !q.seed.is_zero() {
            quiz_by_seed.entry(q.seed).or_insert(pos);
        }
    }

    let mut links: Vec<Vec<DistributionRecord>> = vec![Vec::new(); quizzes.len()];
    let mut used: HashSet<u64> = HashSet::new();

    for d in &dists {
        if d.seed.is_zero() {
            continue;
        }
        if let Some(&pos) = quiz_by_seed.get(&d.seed) {
            links[pos].push(d.clone());
            used.insert(d.index);
        }
    }

    // Step 2: winner overlap within the exhaustive window.
    let exhaustive = config.fallback_window_exhaustive.as_secs();
    for (pos, q) in quizzes.iter().enumerate() {
        if !links[pos].is_empty() {
            continue;
        }
        let best = dists
            .iter()
            .filter(|d| !used.contains(&d.index))
            .filter(|d| d.shares_winner(&q.winners))
            .filter(|d| q.ended_at == 0 || q.ended_at.abs_diff(d.at) <= exhaustive)
            .min_by_key(|d| {
                let dt = if q.ended_at == 0 {
                    0
                } else {
                    q.ended_at.abs_diff(d.at)
                };
                // most evidence first, then closest, then stable key
                (usize::MAX - d.evidence(), dt, d.index)
            });
        if let Some(d) = best {
            used.insert(d.index);
            links[pos].push(d.clone());
        }
    }

    // Step 3: leftover payouts attach to the nearest still-empty round
    // within the light window, by time proximity alone.
    let light = config.fallback_window_light.as_secs();
    for d in &dists {
        if used.contains(&d.index) || d.at == 0 {
            continue;
        }
        let target = quizzes
            .iter()
            .enumerate()
            .filter(|(pos, q)| links[*pos].is_empty() && q.ended_at > 0)
            .filter(|(_, q)| q.ended_at.abs_diff(d.at) <= light)
            .min_by_key(|(_, q)| (q.ended_at.abs_diff(d.at), q.index));
        if let Some((pos, _)) = target {
            used.insert(d.index);
            links[pos].push(d.clone());
        }
    }

    let mut groups: Vec<Group> = quizzes
        .iter()
        .zip(links)
        .map(|(q, linked)| make_group(Some(q.clone()), q.seed, linked))
        .collect();

    // Step 4: orphans. Payouts sharing a seed share a group; seedless ones
    // stand alone.
    let mut orphans_by_seed: HashMap<_, Vec<DistributionRecord>> = HashMap::new();
    for d in dists.into_iter().filter(|d| !used.contains(&d.index)) {
        if d.seed.is_zero() {
            groups.push(make_group(None, d.seed, vec![d]));
        } else {
            orphans_by_seed.entry(d.seed).or_default().push(d);
        }
    }
    let mut orphan_seeds: Vec<_> = orphans_by_seed.into_iter().collect();
    orphan_seeds.sort_by_key(|(seed, _)| *seed);
    for (seed, linked) in orphan_seeds {
        groups.push(make_group(None, seed, linked));
    }

    groups.sort_by(|a, b| {
        b.latest_at
            .cmp(&a.latest_at)
            .then(a.seed.cmp(&b.seed))
            .then_with(|| {
                let ka = a.quiz.as_ref().map(|q| q.index);
                let kb = b.quiz.as_ref().map(|q| q.index);
                ka.cmp(&kb)
            })
    });
    groups
}

fn make_group(
    quiz: Option<QuizEndRecord>,
    seed: ethers::types::H256,
    mut linked: Vec<DistributionRecord>,
) -> Group {
    // Most-evidenced payout first; placeholders sink.
    linked.sort_by_key(|d| (usize::MAX - d.evidence(), u64::MAX - d.at, d.index));

    let total_amount = linked
        .iter()
        .fold(U256::zero(), |acc, d| acc.saturating_add(d.total()));
    let latest_at = linked
        .iter()
        .map(|d| d.at)
        .chain(quiz.iter().map(|q| q.ended_at))
        .max()
        .unwrap_or(0);

    Group {
        seed,
        quiz,
        distributions: linked,
        latest_at,
        total_amount,
    }
}

/// Owned, reactive history view. Polls the registry, funnels refresh
/// triggers through one non-reentrant recompute, remembers the last good
/// snapshot per stream so a transient failure on one surface never blanks
/// the other, and publishes reconciled groups over a watch channel.
pub struct HistoryEngine {
    inner: Arc<HistoryInner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct HistoryInner {
    aggregator: HistoryAggregator,
    config: SyncConfig,
    tx: watch::Sender<Vec<Group>>,
    trigger: Notify,
    gate: Mutex<()>,
    rerun: AtomicBool,
    disposed: AtomicBool,
    last_quizzes: std::sync::Mutex<Vec<QuizEndRecord>>,
    last_dists: std::sync::Mutex<Vec<DistributionRecord>>,
    quiz_failures: AtomicU32,
    dist_failures: AtomicU32,
}

impl HistoryEngine {
    pub fn new(ledger: Arc<dyn HistoryLedger>, config: SyncConfig) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        let inner = Arc::new(HistoryInner {
            aggregator: HistoryAggregator::new(ledger, config.clone()),
            config,
            tx,
            trigger: Notify::new(),
            gate: Mutex::new(()),
            rerun: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_quizzes: std::sync::Mutex::new(Vec::new()),
            last_dists: std::sync::Mutex::new(Vec::new()),
            quiz_failures: AtomicU32::new(0),
            dist_failures: AtomicU32::new(0),
        });

        let poller = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.history_poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = inner.trigger.notified() => {
                            // coalesce trigger bursts before recomputing
                            tokio::time::sleep(inner.config.debounce).await;
                        }
                    }
                    if inner.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.recompute().await;
                }
            })
        };

        Self {
            inner,
            tasks: std::sync::Mutex::new(vec![poller]),
        }
    }

    /// Latest reconciled groups.
    pub fn groups(&self) -> Vec<Group> {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Group>> {
        self.inner.tx.subscribe()
    }

    /// Schedule a recompute (debounced, coalesced with other triggers).
    pub fn refresh(&self) {
        self.inner.trigger.notify_one();
    }

    /// Run one full recompute and wait for it.
    pub async fn refresh_now(&self) {
        self.inner.recompute().await;
    }

    /// Release the poll loop. In-flight fetches finishing after this are
    /// discarded rather than applied.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for HistoryEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl HistoryInner {
    async fn recompute(self: &Arc<Self>) {
        // One writer per view: a recompute already in flight means we queue
        // exactly one follow-up instead of running concurrently.
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

    async fn pass(&self) {
        let (quizzes, dists) = self.aggregator.fetch_streams().await;

        let quizzes = match quizzes {
            Ok(qs) => {
                self.quiz_failures.store(0, Ordering::SeqCst);
                *self.last_quizzes.lock().unwrap() = qs.clone();
                qs
            }
            Err(e) => {
                let streak = self.quiz_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if streak >= STREAM_FAILURE_ALERT {
                    error!(error = %e, streak, "quiz-end stream keeps failing, view is stale");
                } else {
                    warn!(error = %e, "quiz-end stream failed, reusing last good snapshot");
                }
                self.last_quizzes.lock().unwrap().clone()
            }
        };
        let dists = match dists {
            Ok(ds) => {
                self.dist_failures.store(0, Ordering::SeqCst);
                *self.last_dists.lock().unwrap() = ds.clone();
                ds
            }
            Err(e) => {
                let streak = self.dist_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if streak >= STREAM_FAILURE_ALERT {
                    error!(error = %e, streak, "distribution stream keeps failing, view is stale");
                } else {
                    warn!(error = %e, "distribution stream failed, reusing last good snapshot");
                }
                self.last_dists.lock().unwrap().clone()
            }
        };

        let groups = correlate(quizzes, dists, &self.config);
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        debug!(groups = groups.len(), "history view reconciled");
        self.tx.send_replace(groups);
    }
}
