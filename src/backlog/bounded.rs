use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::block::SavedBlock;
use crate::ledger::Ledger;
use crate::numbers::{Account, BlockHash};
use crate::processing::{BlockProcessor, ProcessedItem};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{BucketIndex, Bucketing};
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::{AccountInfo, ConfirmationHeightInfo, Transaction, Writer};
use crate::utils::Worker;

use super::ActivatedInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedBacklogConfig {
    pub enable: bool,
    /// Ceiling on unconfirmed blocks held by the ledger.
    pub max_backlog: usize,
    /// Rollbacks only touch buckets holding more than this many entries.
    pub bucket_threshold: usize,
    /// Targets gathered and rolled back per cycle.
    pub batch_size: usize,
    /// Back-pressure limit on queued rollback notifications.
    pub max_queued_notifications: usize,
}

impl Default for BoundedBacklogConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_backlog: 100_000,
            bucket_threshold: 1000,
            batch_size: 32,
            max_queued_notifications: 128,
        }
    }
}

/// Subsystems that can veto rolling back a specific hash, e.g. because an
/// election or cementing operation is in flight for it.
pub trait RollbackInterlock: Send + Sync {
    fn veto_rollback(&self, hash: &BlockHash) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BacklogEntry {
    hash: BlockHash,
    account: Account,
    bucket: BucketIndex,
    priority: u64,
}

/// Index of every unconfirmed block, queryable by hash, account and
/// per-bucket priority, plus a sequential view for the re-check scan.
#[derive(Default)]
pub struct BacklogIndex {
    by_hash: BTreeMap<BlockHash, BacklogEntry>,
    by_account: BTreeSet<(Account, BlockHash)>,
    by_priority: BTreeSet<(BucketIndex, u64, BlockHash)>,
    size_by_bucket: BTreeMap<BucketIndex, usize>,
}

impl BacklogIndex {
    pub fn insert(
        &mut self,
        hash: BlockHash,
        account: Account,
        bucket: BucketIndex,
        priority: u64,
    ) -> bool {
        if self.by_hash.contains_key(&hash) {
            return false;
        }
        self.by_hash.insert(
            hash,
            BacklogEntry {
                hash,
                account,
                bucket,
                priority,
            },
        );
        self.by_account.insert((account, hash));
        self.by_priority.insert((bucket, priority, hash));
        *self.size_by_bucket.entry(bucket).or_insert(0) += 1;
        true
    }

    pub fn erase_hash(&mut self, hash: &BlockHash) -> bool {
        match self.by_hash.remove(hash) {
            Some(entry) => {
                self.by_account.remove(&(entry.account, entry.hash));
                self.by_priority
                    .remove(&(entry.bucket, entry.priority, entry.hash));
                if let Some(size) = self.size_by_bucket.get_mut(&entry.bucket) {
                    *size -= 1;
                    if *size == 0 {
                        self.size_by_bucket.remove(&entry.bucket);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn erase_account(&mut self, account: &Account) -> bool {
        let hashes: Vec<BlockHash> = self
            .by_account
            .range((*account, BlockHash::ZERO)..=(*account, BlockHash::from_bytes([0xff; 32])))
            .map(|(_, hash)| *hash)
            .collect();
        let mut erased = false;
        for hash in hashes {
            erased |= self.erase_hash(&hash);
        }
        erased
    }

    /// Up to `count` hashes of `bucket` in descending `(bucket, priority)`
    /// order, i.e. the newest blocks of the bucket first, filtered.
    pub fn top(
        &self,
        bucket: BucketIndex,
        count: usize,
        mut filter: impl FnMut(&BlockHash) -> bool,
    ) -> Vec<BlockHash> {
        self.by_priority
            .range((bucket, 0, BlockHash::ZERO)..=(bucket, u64::MAX, BlockHash::from_bytes([0xff; 32])))
            .rev()
            .filter(|(_, _, hash)| filter(hash))
            .take(count)
            .map(|(_, _, hash)| *hash)
            .collect()
    }

    /// Up to `count` hashes strictly after `last`, in hash order.
    pub fn next(&self, last: &BlockHash, count: usize) -> Vec<BlockHash> {
        self.by_hash
            .range((Bound::Excluded(*last), Bound::Unbounded))
            .take(count)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn bucket_size(&self, bucket: BucketIndex) -> usize {
        self.size_by_bucket.get(&bucket).copied().unwrap_or(0)
    }
}

struct BacklogState {
    index: BacklogIndex,
    stopped: bool,
}

/// Keeps the set of unconfirmed blocks below the configured ceiling by
/// rolling back the lowest-priority blocks of over-budget buckets, while
/// honoring interlocks from subsystems that are using a block.
pub struct BoundedBacklog {
    weak_self: Weak<BoundedBacklog>,
    config: BoundedBacklogConfig,
    ledger: Arc<Ledger>,
    bucketing: Arc<Bucketing>,
    block_processor: Arc<BlockProcessor>,
    stats: Arc<Stats>,
    state: Mutex<BacklogState>,
    condition: Condvar,
    interlocks: Mutex<Vec<Arc<dyn RollbackInterlock>>>,
    scan_limiter: RateLimiter,
    workers: Worker,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BoundedBacklog {
    pub fn new(
        config: BoundedBacklogConfig,
        ledger: Arc<Ledger>,
        bucketing: Arc<Bucketing>,
        block_processor: Arc<BlockProcessor>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            scan_limiter: RateLimiter::new(config.batch_size),
            config,
            ledger,
            bucketing,
            block_processor,
            stats,
            state: Mutex::new(BacklogState {
                index: BacklogIndex::default(),
                stopped: false,
            }),
            condition: Condvar::new(),
            interlocks: Mutex::new(Vec::new()),
            workers: Worker::new("backlog notif"),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Registers a veto source consulted before every rollback.
    pub fn add_interlock(&self, interlock: Arc<dyn RollbackInterlock>) {
        self.interlocks.lock().push(interlock);
    }

    pub fn start(&self) {
        if !self.config.enable {
            return;
        }
        let mut threads = self.threads.lock();
        debug_assert!(threads.is_empty());
        let backlog = self.weak_self.upgrade().expect("backlog is alive");
        threads.push(
            std::thread::Builder::new()
                .name("bounded backlog".into())
                .spawn(move || backlog.run())
                .expect("spawning bounded backlog thread"),
        );
        let backlog = self.weak_self.upgrade().expect("backlog is alive");
        threads.push(
            std::thread::Builder::new()
                .name("backlog rescan".into())
                .spawn(move || backlog.run_scan())
                .expect("spawning backlog scan thread"),
        );
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
        }
        self.condition.notify_all();
        let mut threads = self.threads.lock();
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
        self.workers.stop();
    }

    pub fn index_len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.lock().index.contains(hash)
    }

    pub fn bucket_size(&self, bucket: BucketIndex) -> usize {
        self.state.lock().index.bucket_size(bucket)
    }

    /*
     * event subscriptions, wired by the node
     */

    /// Track every freshly applied block.
    pub fn on_batch_processed(&self, batch: &[ProcessedItem]) {
        let tx = self.ledger.tx_begin_read();
        for item in batch {
            if let Some(saved) = &item.saved {
                self.insert(&tx, saved);
            }
        }
    }

    /// Remove blocks reversed by fork resolution or rollback.
    pub fn on_rolled_back(&self, blocks: &[SavedBlock]) {
        let mut state = self.state.lock();
        for block in blocks {
            state.index.erase_hash(&block.hash());
        }
    }

    /// Remove cemented blocks.
    pub fn on_batch_cemented(&self, blocks: &[SavedBlock]) {
        let mut state = self.state.lock();
        for block in blocks {
            state.index.erase_hash(&block.hash());
        }
    }

    /// Drop accounts the scanner found fully confirmed.
    pub fn on_batch_scanned(&self, batch: &[ActivatedInfo]) {
        let mut state = self.state.lock();
        for info in batch {
            if info.conf_info.height == info.account_info.block_count {
                state.index.erase_account(&info.account);
            }
        }
    }

    /// Track the unconfirmed tail of an account the scanner activated.
    pub fn activate(
        &self,
        tx: &dyn Transaction,
        _account: &Account,
        account_info: &AccountInfo,
        conf_info: &ConfirmationHeightInfo,
    ) {
        debug_assert!(conf_info.frontier != account_info.head);

        let mut current = account_info.head;
        while !current.is_zero() {
            // The confirmed frontier ends the unconfirmed tail
            if current == conf_info.frontier {
                break;
            }
            let Some(block) = self.ledger.any().block_get(tx, &current) else {
                break;
            };
            if self.contains(&current) {
                break;
            }
            if !self.insert(tx, &block) {
                break;
            }
            current = block.block.previous();
        }
    }

    fn insert(&self, tx: &dyn Transaction, block: &SavedBlock) -> bool {
        let (priority_balance, priority_timestamp) =
            self.ledger.block_priority(tx, &block.block);
        let bucket = self.bucketing.bucket_index(priority_balance);
        let mut state = self.state.lock();
        state
            .index
            .insert(block.hash(), block.account(), bucket, priority_timestamp)
    }

    fn should_rollback(&self, hash: &BlockHash) -> bool {
        !self
            .interlocks
            .lock()
            .iter()
            .any(|interlock| interlock.veto_rollback(hash))
    }

    fn predicate(&self, index_len: usize) -> bool {
        // Both the ledger count and the tracked index must be over the limit
        self.ledger.backlog_count() > self.config.max_backlog as u64
            && index_len > self.config.max_backlog
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if self.predicate(state.index.len()) {
                // Wait for outstanding rollback notifications to drain
                while self.workers.queued_tasks() >= self.config.max_queued_notifications {
                    self.stats
                        .inc(StatType::BoundedBacklog, StatDetail::Cooldown);
                    self.condition
                        .wait_for(&mut state, Duration::from_millis(100));
                    if state.stopped {
                        return;
                    }
                }

                self.stats.inc(StatType::BoundedBacklog, StatDetail::Loop);

                let backlog = self.ledger.backlog_count();
                let target_count = (backlog as usize).saturating_sub(self.config.max_backlog);

                let targets =
                    self.gather_targets(&state.index, target_count.min(self.config.batch_size));
                if !targets.is_empty() {
                    drop(state);

                    self.stats.add(
                        StatType::BoundedBacklog,
                        StatDetail::GatheredTargets,
                        targets.len() as u64,
                    );
                    let processed = self.perform_rollbacks(&targets);

                    state = self.state.lock();
                    for hash in processed {
                        state.index.erase_hash(&hash);
                    }
                } else {
                    // No eligible targets; avoid a hot loop
                    self.stats
                        .inc(StatType::BoundedBacklog, StatDetail::NoTargets);
                    self.condition
                        .wait_for(&mut state, Duration::from_millis(100));
                }
            } else {
                self.condition.wait_for(&mut state, Duration::from_secs(1));
            }
        }
    }

    /// Newest blocks of each over-threshold bucket, lowest buckets first.
    fn gather_targets(&self, index: &BacklogIndex, max_count: usize) -> Vec<BlockHash> {
        let mut targets = Vec::new();
        for bucket in self.bucketing.bucket_indices() {
            if index.bucket_size(*bucket) > self.config.bucket_threshold {
                let count = max_count.min(self.config.batch_size);
                for hash in index.top(*bucket, count, |hash| self.should_rollback(hash)) {
                    targets.push(hash);
                }
            }
        }
        targets
    }

    fn perform_rollbacks(&self, targets: &[BlockHash]) -> Vec<BlockHash> {
        self.stats
            .inc(StatType::BoundedBacklog, StatDetail::PerformingRollbacks);

        let mut tx = self.ledger.tx_begin_write(Writer::BoundedBacklog);

        let mut processed = Vec::new();
        for hash in targets {
            // Re-checked under the ledger write lock: the interlocks may have
            // picked the block up since the targets were gathered
            if !self.should_rollback(hash) {
                self.stats
                    .inc(StatType::BoundedBacklog, StatDetail::RollbackSkipped);
                continue;
            }

            match self.ledger.any().block_get(&tx, hash) {
                Some(block) => {
                    debug!(
                        target: "bounded_backlog",
                        block = %hash,
                        account = %block.account(),
                        "rolling back"
                    );
                    let root = block.block.qualified_root();
                    match self.ledger.rollback(&mut tx, hash) {
                        Ok(rolled_back) => {
                            self.stats
                                .inc(StatType::BoundedBacklog, StatDetail::Rollback);
                            for block in &rolled_back {
                                processed.push(block.hash());
                            }
                            // Notify on a worker thread, never while holding
                            // the ledger write transaction
                            let block_processor = self.block_processor.clone();
                            self.workers.post(move || {
                                block_processor.rolled_back.notify(&(rolled_back, root));
                            });
                        }
                        Err(_) => {
                            self.stats
                                .inc(StatType::BoundedBacklog, StatDetail::RollbackFailed);
                        }
                    }
                }
                None => {
                    self.stats
                        .inc(StatType::BoundedBacklog, StatDetail::RollbackMissingBlock);
                    processed.push(*hash);
                }
            }
        }

        processed
    }

    /// Periodically re-checks every indexed hash against the ledger, catching
    /// entries left behind if a cementation or rollback signal was missed.
    fn run_scan(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            let mut last = BlockHash::ZERO;
            loop {
                if state.stopped {
                    return;
                }
                while !self.scan_limiter.should_pass(self.config.batch_size) {
                    self.condition
                        .wait_for(&mut state, Duration::from_millis(100));
                    if state.stopped {
                        return;
                    }
                }

                self.stats
                    .inc(StatType::BoundedBacklog, StatDetail::LoopScan);

                let batch = state.index.next(&last, self.config.batch_size);
                if batch.is_empty() {
                    // Wrapped around the whole index
                    break;
                }

                drop(state);
                {
                    let tx = self.ledger.tx_begin_read();
                    let mut stale = Vec::new();
                    for hash in &batch {
                        self.stats.inc(StatType::BoundedBacklog, StatDetail::Scanned);
                        if !self.ledger.unconfirmed_exists(&tx, hash) {
                            stale.push(*hash);
                        }
                        last = *hash;
                    }
                    state = self.state.lock();
                    for hash in stale {
                        state.index.erase_hash(&hash);
                    }
                }
            }
            self.condition.wait_for(&mut state, Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u64) -> BlockHash {
        BlockHash::from_u64(n)
    }

    fn account(n: u64) -> Account {
        Account::from_u64(n)
    }

    #[test]
    fn index_insert_and_erase_keep_bucket_sizes() {
        let mut index = BacklogIndex::default();
        assert!(index.insert(hash(1), account(1), 3, 100));
        assert!(index.insert(hash(2), account(1), 3, 200));
        assert!(index.insert(hash(3), account(2), 5, 50));
        // Duplicate hash rejected
        assert!(!index.insert(hash(1), account(9), 9, 1));

        assert_eq!(index.len(), 3);
        assert_eq!(index.bucket_size(3), 2);
        assert_eq!(index.bucket_size(5), 1);
        assert_eq!(index.bucket_size(7), 0);

        assert!(index.erase_hash(&hash(2)));
        assert!(!index.erase_hash(&hash(2)));
        assert_eq!(index.bucket_size(3), 1);

        assert!(index.erase_account(&account(1)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.bucket_size(3), 0);
    }

    #[test]
    fn top_returns_descending_priority_within_bucket() {
        let mut index = BacklogIndex::default();
        index.insert(hash(1), account(1), 3, 100);
        index.insert(hash(2), account(2), 3, 300);
        index.insert(hash(3), account(3), 3, 200);
        index.insert(hash(4), account(4), 4, 999);

        let top = index.top(3, 10, |_| true);
        assert_eq!(top, vec![hash(2), hash(3), hash(1)]);

        // Filter applies before the count
        let top = index.top(3, 1, |hash_| *hash_ != hash(2));
        assert_eq!(top, vec![hash(3)]);
    }

    #[test]
    fn next_iterates_in_hash_order() {
        let mut index = BacklogIndex::default();
        index.insert(hash(10), account(1), 0, 1);
        index.insert(hash(20), account(2), 0, 2);
        index.insert(hash(30), account(3), 0, 3);

        let first = index.next(&BlockHash::ZERO, 2);
        assert_eq!(first, vec![hash(10), hash(20)]);
        let rest = index.next(&hash(20), 2);
        assert_eq!(rest, vec![hash(30)]);
        assert!(index.next(&hash(30), 2).is_empty());
    }
}
