use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Block;
use crate::numbers::{BlockHash, QualifiedRoot};
use crate::scheduler::BucketIndex;

/// A single running election. The vote-counting layer itself is an external
/// collaborator; the core only tracks identity and lifecycle.
pub struct Election {
    root: QualifiedRoot,
    winner: BlockHash,
    block: Arc<Block>,
    confirmed: AtomicBool,
    finished: AtomicBool,
}

impl Election {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            root: block.qualified_root(),
            winner: block.hash(),
            block,
            confirmed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> QualifiedRoot {
        self.root
    }

    pub fn winner(&self) -> BlockHash {
        self.winner
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Slot accounting for concurrently running elections. The production
/// election scheduler defines the real vacancy metric; the buckets only
/// consume this trait.
pub trait ActiveElections: Send + Sync {
    /// Whether the bucket may start another election beyond its reserved
    /// slots.
    fn vacancy(&self, bucket: BucketIndex) -> bool;

    /// Starts an election for the block's root. Returns `None` when one is
    /// already running for that root.
    fn insert(&self, block: &Arc<Block>, priority: u64) -> Option<Arc<Election>>;

    fn erase(&self, root: &QualifiedRoot);

    fn size(&self) -> usize;
}

/// Bounded election container used by the node wiring and tests.
pub struct ElectionContainer {
    target: usize,
    elections: Mutex<HashMap<QualifiedRoot, Arc<Election>>>,
}

impl ElectionContainer {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            elections: Mutex::new(HashMap::new()),
        }
    }

    pub fn election(&self, root: &QualifiedRoot) -> Option<Arc<Election>> {
        self.elections.lock().get(root).cloned()
    }

    /// Drops finished elections from the container.
    pub fn flush(&self) {
        self.elections
            .lock()
            .retain(|_, election| !election.finished());
    }
}

impl ActiveElections for ElectionContainer {
    fn vacancy(&self, _bucket: BucketIndex) -> bool {
        self.size() < self.target
    }

    fn insert(&self, block: &Arc<Block>, _priority: u64) -> Option<Arc<Election>> {
        let mut elections = self.elections.lock();
        let root = block.qualified_root();
        if elections.contains_key(&root) {
            return None;
        }
        let election = Arc::new(Election::new(block.clone()));
        elections.insert(root, election.clone());
        Some(election)
    }

    fn erase(&self, root: &QualifiedRoot) {
        if let Some(election) = self.elections.lock().remove(root) {
            election.cancel();
        }
    }

    fn size(&self) -> usize {
        self.elections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::crypto::KeyPair;
    use crate::numbers::{Amount, Link};

    fn sample_block() -> Arc<Block> {
        let key = KeyPair::generate();
        Arc::new(
            BlockBuilder::state()
                .account(key.account())
                .previous(BlockHash::from_u64(1))
                .representative(key.account())
                .balance(Amount::raw(1))
                .link(Link::from_u64(2))
                .sign(key.raw(), &key.account()),
        )
    }

    #[test]
    fn insert_is_unique_per_root() {
        let container = ElectionContainer::new(10);
        let block = sample_block();
        let election = container.insert(&block, 0).unwrap();
        assert!(container.insert(&block, 0).is_none());
        assert_eq!(container.size(), 1);
        assert_eq!(container.election(&block.qualified_root()).unwrap().root(), election.root());
    }

    #[test]
    fn vacancy_bound_by_target() {
        let container = ElectionContainer::new(1);
        assert!(container.vacancy(0));
        container.insert(&sample_block(), 0);
        assert!(!container.vacancy(0));
    }

    #[test]
    fn flush_drops_finished() {
        let container = ElectionContainer::new(10);
        let block = sample_block();
        let election = container.insert(&block, 0).unwrap();
        election.cancel();
        container.flush();
        assert_eq!(container.size(), 0);
    }
}
