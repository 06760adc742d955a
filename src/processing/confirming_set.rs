use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::block::SavedBlock;
use crate::ledger::Ledger;
use crate::numbers::BlockHash;
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::Writer;
use crate::utils::ObserverSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmingSetConfig {
    /// Hashes cemented per write transaction.
    pub batch_size: usize,
}

impl Default for ConfirmingSetConfig {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

/// A block cemented on behalf of one confirmation root.
#[derive(Clone)]
pub struct CementedNotification {
    pub block: SavedBlock,
    /// Hash the voting layer nominated; every block up the chain below it is
    /// cemented alongside.
    pub confirmation_root: BlockHash,
}

struct SetState {
    queue: VecDeque<BlockHash>,
    queued: HashSet<BlockHash>,
    processing: HashSet<BlockHash>,
    stopped: bool,
}

/// Receives hashes nominated as cemented by the voting layer, advances
/// confirmation heights in batches and emits `batch_cemented`.
pub struct ConfirmingSet {
    weak_self: Weak<ConfirmingSet>,
    config: ConfirmingSetConfig,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    state: Mutex<SetState>,
    condition: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub batch_cemented: ObserverSet<Vec<CementedNotification>>,
}

impl ConfirmingSet {
    pub fn new(config: ConfirmingSetConfig, ledger: Arc<Ledger>, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            ledger,
            stats,
            state: Mutex::new(SetState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            thread: Mutex::new(None),
            batch_cemented: ObserverSet::new(),
        })
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock();
        debug_assert!(thread.is_none());
        let set = self.weak_self.upgrade().expect("confirming set is alive");
        *thread = Some(
            std::thread::Builder::new()
                .name("confirming set".into())
                .spawn(move || set.run())
                .expect("spawning confirming set thread"),
        );
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Nominates a hash for cementing.
    pub fn add(&self, hash: BlockHash) {
        {
            let mut state = self.state.lock();
            if !state.queued.insert(hash) {
                return;
            }
            state.queue.push_back(hash);
        }
        self.stats.inc(StatType::ConfirmingSet, StatDetail::Cementing);
        self.condition.notify_all();
    }

    /// True while the hash is queued or being cemented. Used as a rollback
    /// interlock by the bounded backlog.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        let state = self.state.lock();
        state.queued.contains(hash) || state.processing.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if state.queue.is_empty() {
                self.condition
                    .wait_while(&mut state, |state| !state.stopped && state.queue.is_empty());
                continue;
            }

            let mut batch = Vec::new();
            while batch.len() < self.config.batch_size {
                let Some(hash) = state.queue.pop_front() else {
                    break;
                };
                state.queued.remove(&hash);
                state.processing.insert(hash);
                batch.push(hash);
            }
            drop(state);

            let notifications = self.cement_batch(&batch);
            if !notifications.is_empty() {
                self.batch_cemented.notify(&notifications);
            }

            state = self.state.lock();
            for hash in &batch {
                state.processing.remove(hash);
            }
        }
    }

    fn cement_batch(&self, batch: &[BlockHash]) -> Vec<CementedNotification> {
        let mut notifications = Vec::new();
        let mut tx = self.ledger.tx_begin_write(Writer::ConfirmationHeight);
        for hash in batch {
            tx.refresh_if_needed();
            let cemented = self.ledger.confirm(&mut tx, *hash);
            debug!(
                target: "confirming_set",
                root = %hash,
                count = cemented.len(),
                "cemented blocks"
            );
            for block in cemented {
                notifications.push(CementedNotification {
                    block,
                    confirmation_root: *hash,
                });
            }
        }
        notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_helpers::LedgerContext;
    use crate::numbers::Amount;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
        let start = Instant::now();
        while !predicate() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn cements_chain_in_ascending_order() {
        let ctx = LedgerContext::new();
        let ledger = Arc::new(
            Ledger::new(
                ctx.ledger.store().clone(),
                ctx.params.ledger.clone(),
                ctx.stats.clone(),
            )
            .unwrap(),
        );
        let key = crate::crypto::KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();

        let set = ConfirmingSet::new(
            ConfirmingSetConfig::default(),
            ledger.clone(),
            ctx.stats.clone(),
        );
        let cemented: Arc<Mutex<Vec<BlockHash>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let cemented = cemented.clone();
            set.batch_cemented.add(move |batch| {
                let mut cemented = cemented.lock();
                for notification in batch {
                    cemented.push(notification.block.hash());
                }
            });
        }
        set.start();

        set.add(send.hash());
        wait_until(Duration::from_secs(5), || !cemented.lock().is_empty());
        set.stop();

        assert_eq!(*cemented.lock(), vec![send.hash()]);
        let tx = ledger.tx_begin_read();
        assert!(ledger.block_confirmed(&tx, &send.hash()));
    }

    #[test]
    fn contains_covers_queued_hashes() {
        let ctx = LedgerContext::new();
        let ledger = Arc::new(
            Ledger::new(
                ctx.ledger.store().clone(),
                ctx.params.ledger.clone(),
                ctx.stats.clone(),
            )
            .unwrap(),
        );
        let set = ConfirmingSet::new(ConfirmingSetConfig::default(), ledger, ctx.stats.clone());
        let hash = BlockHash::from_u64(42);
        // Worker not started: the hash stays queued
        set.add(hash);
        assert!(set.contains(&hash));
        assert!(!set.contains(&BlockHash::from_u64(43)));
        assert_eq!(set.len(), 1);
    }
}
