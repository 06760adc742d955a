use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Block;
use crate::elections::{ActiveElections, Election};
use crate::numbers::{BlockHash, QualifiedRoot};
use crate::stats::{StatDetail, StatType, Stats};

use super::BucketIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityBucketConfig {
    /// Maximum number of blocks to sort by priority per bucket.
    pub max_blocks: usize,
    /// Guaranteed election slots per bucket.
    pub reserved_elections: usize,
    /// Upper bound of elections per bucket, usable while the overall election
    /// container reports vacancy.
    pub max_elections: usize,
}

impl Default for PriorityBucketConfig {
    fn default() -> Self {
        Self {
            max_blocks: 1024 * 8,
            reserved_elections: 100,
            max_elections: 150,
        }
    }
}

struct ElectionEntry {
    election: Arc<Election>,
    priority: u64,
}

struct BucketState {
    /// Blocks ordered by `(time, hash)` ascending; oldest arrival first.
    queue: BTreeMap<(u64, BlockHash), Arc<Block>>,
    by_hash: HashMap<BlockHash, u64>,
    elections: HashMap<QualifiedRoot, ElectionEntry>,
    by_priority: BTreeSet<(u64, QualifiedRoot)>,
}

/// Ordered set of blocks waiting for an election slot, plus the elections
/// this bucket has started.
pub struct PriorityBucket {
    pub index: BucketIndex,
    config: PriorityBucketConfig,
    active: Arc<dyn ActiveElections>,
    stats: Arc<Stats>,
    state: Mutex<BucketState>,
}

impl PriorityBucket {
    pub fn new(
        index: BucketIndex,
        config: PriorityBucketConfig,
        active: Arc<dyn ActiveElections>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            index,
            config,
            active,
            stats,
            state: Mutex::new(BucketState {
                queue: BTreeMap::new(),
                by_hash: HashMap::new(),
                elections: HashMap::new(),
                by_priority: BTreeSet::new(),
            }),
        }
    }

    /// Inserts a block with its priority timestamp. When the queue overflows
    /// the entry with the highest `(time, hash)` is dropped, so older
    /// arrivals keep priority. Returns false iff the pushed block did not
    /// survive the insert.
    pub fn push(&self, time: u64, block: Arc<Block>) -> bool {
        let hash = block.hash();
        let mut state = self.state.lock();
        if state.by_hash.contains_key(&hash) {
            return false;
        }
        state.queue.insert((time, hash), block);
        state.by_hash.insert(hash, time);
        if state.queue.len() > self.config.max_blocks {
            let dropped_key = *state
                .queue
                .keys()
                .next_back()
                .expect("queue is non-empty past the cap");
            state.queue.remove(&dropped_key);
            state.by_hash.remove(&dropped_key.1);
            return dropped_key.1 != hash;
        }
        true
    }

    /// True when a block could be activated right now: the queue holds work
    /// and an election slot is available, either reserved or granted by the
    /// active-election container.
    pub fn available(&self) -> bool {
        let state = self.state.lock();
        if state.queue.is_empty() {
            return false;
        }
        self.election_vacancy(&state)
    }

    fn election_vacancy(&self, state: &BucketState) -> bool {
        let count = state.elections.len();
        if count >= self.config.max_elections {
            return false;
        }
        count < self.config.reserved_elections || self.active.vacancy(self.index)
    }

    /// Pops the lowest `(time, hash)` block and starts an election bound to
    /// its root. Cancels the lowest-priority election if the bucket overfills.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        let Some((key, block)) = state
            .queue
            .iter()
            .next()
            .map(|(key, block)| (*key, block.clone()))
        else {
            return false;
        };
        state.queue.remove(&key);
        state.by_hash.remove(&key.1);

        let (time, _) = key;
        let root = block.qualified_root();
        match self.active.insert(&block, time) {
            Some(election) => {
                state.elections.insert(
                    root,
                    ElectionEntry {
                        election,
                        priority: time,
                    },
                );
                state.by_priority.insert((time, root));
                self.stats
                    .inc(StatType::ElectionScheduler, StatDetail::Activated);
            }
            None => {
                self.stats
                    .inc(StatType::ElectionScheduler, StatDetail::ActivateFailed);
                return false;
            }
        }

        if state.elections.len() > self.config.max_elections {
            self.cancel_lowest_election(&mut state);
        }
        true
    }

    /// The lowest-priority election is the one with the numerically highest
    /// timestamp.
    fn cancel_lowest_election(&self, state: &mut BucketState) {
        if let Some(&(priority, root)) = state.by_priority.iter().next_back() {
            state.by_priority.remove(&(priority, root));
            state.elections.remove(&root);
            self.active.erase(&root);
            self.stats
                .inc(StatType::ElectionScheduler, StatDetail::CancelLowest);
        }
    }

    /// Forgets elections that have finished since the last sweep.
    pub fn update(&self) {
        let mut state = self.state.lock();
        let finished: Vec<(QualifiedRoot, u64)> = state
            .elections
            .iter()
            .filter(|(_, entry)| entry.election.finished())
            .map(|(root, entry)| (*root, entry.priority))
            .collect();
        for (root, priority) in finished {
            state.elections.remove(&root);
            state.by_priority.remove(&(priority, root));
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.lock().by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn election_count(&self) -> usize {
        self.state.lock().elections.len()
    }

    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.state.lock().queue.values().cloned().collect()
    }
}
