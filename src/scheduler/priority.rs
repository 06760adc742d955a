use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::block::SavedBlock;
use crate::elections::ActiveElections;
use crate::ledger::Ledger;
use crate::numbers::{Account, BlockHash};
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::Transaction;

use super::{Bucketing, PriorityBucket, PriorityBucketConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySchedulerConfig {
    pub enable: bool,
    pub bucket: PriorityBucketConfig,
}

impl Default for PrioritySchedulerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bucket: PriorityBucketConfig::default(),
        }
    }
}

/// Feeds eligible unconfirmed blocks into elections, one queue per balance
/// bucket. A main thread activates blocks whenever a bucket reports
/// availability; a cleanup thread drops finished elections once per second.
pub struct PriorityScheduler {
    weak_self: Weak<PriorityScheduler>,
    config: PrioritySchedulerConfig,
    ledger: Arc<Ledger>,
    bucketing: Arc<Bucketing>,
    buckets: Vec<Arc<PriorityBucket>>,
    stats: Arc<Stats>,
    mutex: Mutex<bool>,
    condition: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityScheduler {
    pub fn new(
        config: PrioritySchedulerConfig,
        ledger: Arc<Ledger>,
        bucketing: Arc<Bucketing>,
        active: Arc<dyn ActiveElections>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let buckets = bucketing
            .bucket_indices()
            .iter()
            .map(|index| {
                Arc::new(PriorityBucket::new(
                    *index,
                    config.bucket,
                    active.clone(),
                    stats.clone(),
                ))
            })
            .collect();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            ledger,
            bucketing,
            buckets,
            stats,
            mutex: Mutex::new(false),
            condition: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn start(&self) {
        if !self.config.enable {
            return;
        }
        let mut threads = self.threads.lock();
        debug_assert!(threads.is_empty());

        let scheduler = self.weak_self.upgrade().expect("scheduler is alive");
        threads.push(
            std::thread::Builder::new()
                .name("sched priority".into())
                .spawn(move || scheduler.run())
                .expect("spawning scheduler thread"),
        );
        let scheduler = self.weak_self.upgrade().expect("scheduler is alive");
        threads.push(
            std::thread::Builder::new()
                .name("sched cleanup".into())
                .spawn(move || scheduler.run_cleanup())
                .expect("spawning scheduler cleanup thread"),
        );
    }

    pub fn stop(&self) {
        {
            let mut stopped = self.mutex.lock();
            *stopped = true;
        }
        self.condition.notify_all();
        let mut threads = self.threads.lock();
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }

    pub fn notify(&self) {
        self.condition.notify_all();
    }

    /// Queues the next unconfirmed block of `account` if its dependencies are
    /// confirmed. Returns true when a block was activated.
    pub fn activate(&self, tx: &dyn Transaction, account: &Account) -> bool {
        if !self.config.enable {
            return false;
        }
        debug_assert!(!account.is_zero());
        if let Some(info) = self.ledger.any().account_get(tx, account) {
            let conf_info = self
                .ledger
                .store()
                .confirmation_height_get(tx, account)
                .unwrap_or_default();
            if conf_info.height < info.block_count {
                return self.activate_with_info(tx, account, &info, &conf_info);
            }
        }
        self.stats
            .inc(StatType::ElectionScheduler, StatDetail::ActivateSkip);
        false
    }

    fn activate_with_info(
        &self,
        tx: &dyn Transaction,
        account: &Account,
        info: &crate::store::AccountInfo,
        conf_info: &crate::store::ConfirmationHeightInfo,
    ) -> bool {
        debug_assert!(conf_info.frontier != info.head);

        let hash = if conf_info.height == 0 {
            info.open_block
        } else {
            self.ledger
                .any()
                .block_successor(tx, &conf_info.frontier)
                .unwrap_or(BlockHash::ZERO)
        };
        let Some(block) = self.ledger.any().block_get(tx, &hash) else {
            return false;
        };

        if !self.ledger.dependents_confirmed(tx, &block) {
            self.stats
                .inc(StatType::ElectionScheduler, StatDetail::ActivateFailed);
            return false;
        }

        let (priority_balance, priority_timestamp) =
            self.ledger.block_priority(tx, &block.block);
        let bucket_index = self.bucketing.bucket_index(priority_balance);
        let bucket = &self.buckets[bucket_index];
        if bucket.push(priority_timestamp, block.block.clone()) {
            trace!(
                target: "election_scheduler",
                account = %account,
                block = %hash,
                bucket = bucket_index,
                priority = priority_timestamp,
                "block activated"
            );
            self.notify();
        } else {
            self.stats
                .inc(StatType::ElectionScheduler, StatDetail::ActivateFull);
        }
        true
    }

    /// Activates the block's own account and, for sends, the destination
    /// account, propagating confirmations downstream.
    pub fn activate_successors(&self, tx: &dyn Transaction, block: &SavedBlock) -> bool {
        let mut result = self.activate(tx, &block.account());
        if let Some(destination) = block.destination() {
            if !destination.is_zero() && destination != block.account() {
                result |= self.activate(tx, &destination);
            }
        }
        result
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.buckets.iter().any(|bucket| bucket.contains(hash))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    fn predicate(&self) -> bool {
        self.buckets.iter().any(|bucket| bucket.available())
    }

    fn run(&self) {
        let mut stopped = self.mutex.lock();
        while !*stopped {
            self.condition
                .wait_while(&mut stopped, |stopped| !*stopped && !self.predicate());
            if *stopped {
                return;
            }
            self.stats.inc(StatType::ElectionScheduler, StatDetail::Loop);
            drop(stopped);

            for bucket in &self.buckets {
                if bucket.available() {
                    bucket.activate();
                }
            }

            stopped = self.mutex.lock();
        }
    }

    fn run_cleanup(&self) {
        let mut stopped = self.mutex.lock();
        while !*stopped {
            self.condition
                .wait_while_for(&mut stopped, |stopped| !*stopped, Duration::from_secs(1));
            if *stopped {
                return;
            }
            self.stats
                .inc(StatType::ElectionScheduler, StatDetail::Cleanup);
            drop(stopped);

            for bucket in &self.buckets {
                bucket.update();
            }

            stopped = self.mutex.lock();
        }
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        debug_assert!(self.threads.lock().is_empty(), "stop() must run before drop");
        debug!(target: "election_scheduler", "scheduler dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elections::ElectionContainer;
    use crate::ledger::test_helpers::LedgerContext;
    use crate::numbers::Amount;

    fn scheduler_for(ctx: &LedgerContext) -> (Arc<PriorityScheduler>, Arc<ElectionContainer>) {
        let active = Arc::new(ElectionContainer::new(1000));
        let ledger = Arc::new(
            crate::ledger::Ledger::new(
                ctx.ledger.store().clone(),
                ctx.params.ledger.clone(),
                ctx.stats.clone(),
            )
            .unwrap(),
        );
        let scheduler = PriorityScheduler::new(
            PrioritySchedulerConfig::default(),
            ledger,
            Arc::new(Bucketing::new()),
            active.clone(),
            ctx.stats.clone(),
        );
        (scheduler, active)
    }

    #[test]
    fn activate_queues_next_unconfirmed_block() {
        let ctx = LedgerContext::new();
        let key = crate::crypto::KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();

        let (scheduler, _) = scheduler_for(&ctx);
        let tx = ctx.ledger.tx_begin_read();
        assert!(scheduler.activate(&tx, &ctx.params.ledger.genesis_account));
        assert!(scheduler.contains(&send.hash()));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn activate_skips_fully_confirmed_account() {
        let ctx = LedgerContext::new();
        let (scheduler, _) = scheduler_for(&ctx);
        let tx = ctx.ledger.tx_begin_read();
        // Genesis is cemented, nothing to do
        assert!(!scheduler.activate(&tx, &ctx.params.ledger.genesis_account));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn activate_successors_reaches_destination() {
        let ctx = LedgerContext::new();
        let key = crate::crypto::KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        let saved_send = ctx.process(&send).unwrap();
        let open = ctx.open_account(
            &key,
            send.hash(),
            Amount::MAX.saturating_sub(Amount::raw(100)),
        );
        ctx.process(&open).unwrap();
        ctx.confirm(send.hash());

        let (scheduler, _) = scheduler_for(&ctx);
        let tx = ctx.ledger.tx_begin_read();
        assert!(scheduler.activate_successors(&tx, &saved_send));
        // The destination's open block is now eligible
        assert!(scheduler.contains(&open.hash()));
    }
}
