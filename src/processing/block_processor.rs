use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::block::{Block, SavedBlock};
use crate::ledger::{BlockStatus, Ledger};
use crate::numbers::QualifiedRoot;
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::{WriteTransaction, Writer};
use crate::utils::ObserverSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Live,
    Bootstrap,
    Local,
    Forced,
}

#[derive(Clone)]
pub struct BlockContext {
    pub block: Arc<Block>,
    pub source: BlockSource,
}

/// One entry of a `batch_processed` notification.
#[derive(Clone)]
pub struct ProcessedItem {
    pub status: BlockStatus,
    pub context: BlockContext,
    /// Present iff `status == Progress`.
    pub saved: Option<SavedBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockProcessorConfig {
    /// Queue length past which `add` back-pressures producers.
    pub max_queue: usize,
    /// Blocks applied per write transaction.
    pub batch_max: usize,
}

impl Default for BlockProcessorConfig {
    fn default() -> Self {
        Self {
            max_queue: 8 * 1024,
            batch_max: 256,
        }
    }
}

struct ProcessorState {
    queue: VecDeque<BlockContext>,
    forced: VecDeque<BlockContext>,
    stopped: bool,
}

/// Serialized queue that hands blocks to the ledger in arrival order.
/// Subscribers observe `batch_processed` after every batch and `rolled_back`
/// whenever fork resolution reversed a competing chain.
pub struct BlockProcessor {
    weak_self: Weak<BlockProcessor>,
    config: BlockProcessorConfig,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    state: Mutex<ProcessorState>,
    condition: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub batch_processed: ObserverSet<Vec<ProcessedItem>>,
    pub rolled_back: ObserverSet<(Vec<SavedBlock>, QualifiedRoot)>,
}

impl BlockProcessor {
    pub fn new(config: BlockProcessorConfig, ledger: Arc<Ledger>, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            ledger,
            stats,
            state: Mutex::new(ProcessorState {
                queue: VecDeque::new(),
                forced: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            thread: Mutex::new(None),
            batch_processed: ObserverSet::new(),
            rolled_back: ObserverSet::new(),
        })
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock();
        debug_assert!(thread.is_none());
        let processor = self.weak_self.upgrade().expect("processor is alive");
        *thread = Some(
            std::thread::Builder::new()
                .name("blck processing".into())
                .spawn(move || processor.run())
                .expect("spawning block processor thread"),
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

    /// Submits a block for processing. Returns false when the queue is full;
    /// the caller decides whether to drop or retry.
    pub fn add(&self, block: Arc<Block>, source: BlockSource) -> bool {
        {
            let mut state = self.state.lock();
            if state.queue.len() >= self.config.max_queue {
                self.stats
                    .inc(StatType::BlockProcessor, StatDetail::Overfill);
                return false;
            }
            state.queue.push_back(BlockContext { block, source });
        }
        self.condition.notify_all();
        true
    }

    /// Submits a block that must win its fork: any competing chain segment is
    /// rolled back before this block is applied.
    pub fn force(&self, block: Arc<Block>) {
        {
            let mut state = self.state.lock();
            state.forced.push_back(BlockContext {
                block,
                source: BlockSource::Forced,
            });
        }
        self.stats.inc(StatType::BlockProcessor, StatDetail::Force);
        self.condition.notify_all();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + state.forced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if state.queue.is_empty() && state.forced.is_empty() {
                self.condition.wait_while(&mut state, |state| {
                    !state.stopped && state.queue.is_empty() && state.forced.is_empty()
                });
                continue;
            }

            let mut batch = Vec::new();
            while batch.len() < self.config.batch_max {
                if let Some(context) = state.forced.pop_front() {
                    batch.push(context);
                } else if let Some(context) = state.queue.pop_front() {
                    batch.push(context);
                } else {
                    break;
                }
            }
            drop(state);

            let (processed, rollbacks) = self.process_batch(batch);

            // Failure of a single block never aborts the batch; every context
            // is reported with its own status.
            self.batch_processed.notify(&processed);
            for rollback in rollbacks {
                self.rolled_back.notify(&rollback);
            }

            state = self.state.lock();
        }
    }

    fn process_batch(
        &self,
        batch: Vec<BlockContext>,
    ) -> (Vec<ProcessedItem>, Vec<(Vec<SavedBlock>, QualifiedRoot)>) {
        let mut processed = Vec::with_capacity(batch.len());
        let mut rollbacks = Vec::new();

        let mut tx = self.ledger.tx_begin_write(Writer::BlockProcessor);
        for context in batch {
            tx.refresh_if_needed();

            let mut result = self.ledger.process(&mut tx, &context.block);
            if matches!(result, Err(BlockStatus::Fork)) && context.source == BlockSource::Forced {
                if let Some(rolled_back) = self.rollback_competitor(&mut tx, &context.block) {
                    rollbacks.push((rolled_back, context.block.qualified_root()));
                }
                result = self.ledger.process(&mut tx, &context.block);
            }

            let (status, saved) = match result {
                Ok(saved) => (BlockStatus::Progress, Some(saved)),
                Err(status) => (status, None),
            };
            self.stats
                .inc(StatType::BlockProcessor, status.as_stat_detail());
            debug!(
                target: "blockprocessor",
                block = %context.block.hash(),
                ?status,
                "processed block"
            );
            processed.push(ProcessedItem {
                status,
                context,
                saved,
            });
        }
        drop(tx);

        (processed, rollbacks)
    }

    /// Rolls back whichever chain segment currently occupies this block's
    /// root.
    fn rollback_competitor(
        &self,
        tx: &mut WriteTransaction,
        block: &Arc<Block>,
    ) -> Option<Vec<SavedBlock>> {
        let hash = block.hash();
        let successor = {
            let previous = block.previous();
            if previous.is_zero() {
                let account = block.account_field()?;
                self.ledger
                    .any()
                    .account_get(tx, &account)
                    .map(|info| info.open_block)
            } else {
                self.ledger.any().block_successor(tx, &previous)
            }
        }?;
        if successor == hash {
            return None;
        }
        match self.ledger.rollback(tx, &successor) {
            Ok(rolled_back) => {
                self.stats
                    .inc(StatType::BlockProcessor, StatDetail::Rollback);
                Some(rolled_back)
            }
            Err(err) => {
                self.stats
                    .inc(StatType::BlockProcessor, StatDetail::RollbackFailed);
                warn!(
                    target: "blockprocessor",
                    block = %hash,
                    %err,
                    "failed to roll back competitor"
                );
                None
            }
        }
    }
}
