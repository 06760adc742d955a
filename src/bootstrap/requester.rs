use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use tracing::{debug, trace};

use crate::block::Block;
use crate::ledger::{BlockStatus, Ledger};
use crate::numbers::{Account, BlockHash, U256};
use crate::processing::{BlockProcessor, BlockSource, ProcessedItem};
use crate::rate_limiter::RateLimiter;
use crate::stats::{StatDetail, StatType, Stats};
use crate::transport::message::{AscPullAckPayload, AscPullReqPayload};
use crate::transport::{Message, TcpChannel, TrafficType};

use super::account_sets::PRIORITY_INITIAL;
use super::{AccountSets, AccountSetsConfig, PeerScoring, PeerScoringConfig, Throttle};

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub enable: bool,
    /// Requests per second across all peers.
    pub rate_limit: usize,
    /// Window of request outcomes used for backoff.
    pub throttle_window: usize,
    /// An unanswered request counts as failed after this long.
    pub request_timeout: Duration,
    /// Blocks asked for per pull.
    pub pull_count: u8,
    pub peer_scoring: PeerScoringConfig,
    pub account_sets: AccountSetsConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enable: true,
            rate_limit: 64,
            throttle_window: 128,
            request_timeout: Duration::from_secs(15),
            pull_count: 128,
            peer_scoring: PeerScoringConfig::default(),
            account_sets: AccountSetsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryTarget {
    /// Pulling the unconfirmed tail of an account.
    Account(Account),
    /// Resolving the account that owns a dependency hash.
    Dependency(BlockHash),
}

struct RunningQuery {
    target: QueryTarget,
    sent: Instant,
}

/// Drives ascending bootstrap: selects accounts through the priority and
/// blocking sets, picks peers through scoring, sends pull requests on the
/// bootstrap traffic class and feeds responses back into the block processor
/// and the sets.
pub struct BootstrapRequester {
    weak_self: Weak<BootstrapRequester>,
    config: BootstrapConfig,
    ledger: Arc<Ledger>,
    block_processor: Arc<BlockProcessor>,
    stats: Arc<Stats>,
    sets: Mutex<AccountSets>,
    scoring: Mutex<PeerScoring>,
    throttle: Mutex<Throttle>,
    running: Mutex<HashMap<u64, RunningQuery>>,
    limiter: RateLimiter,
    stopped: Mutex<bool>,
    condition: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapRequester {
    pub fn new(
        config: BootstrapConfig,
        ledger: Arc<Ledger>,
        block_processor: Arc<BlockProcessor>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            sets: Mutex::new(AccountSets::new(config.account_sets.clone(), stats.clone())),
            scoring: Mutex::new(PeerScoring::new(config.peer_scoring)),
            throttle: Mutex::new(Throttle::new(config.throttle_window)),
            limiter: RateLimiter::new(config.rate_limit),
            config,
            ledger,
            block_processor,
            stats,
            running: Mutex::new(HashMap::new()),
            stopped: Mutex::new(false),
            condition: Condvar::new(),
            thread: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        if !self.config.enable {
            return;
        }
        let mut thread = self.thread.lock();
        debug_assert!(thread.is_none());
        let requester = self.weak_self.upgrade().expect("requester is alive");
        *thread = Some(
            std::thread::Builder::new()
                .name("bootstrap".into())
                .spawn(move || requester.run())
                .expect("spawning bootstrap thread"),
        );
    }

    pub fn stop(&self) {
        {
            let mut stopped = self.stopped.lock();
            *stopped = true;
        }
        self.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Refreshes the candidate channel list, typically from the listener's
    /// realtime channels.
    pub fn sync_channels(&self, channels: Vec<Arc<TcpChannel>>) {
        self.scoring.lock().sync(channels);
        self.condition.notify_all();
    }

    pub fn prioritized(&self, account: &Account) -> bool {
        self.sets.lock().prioritized(account)
    }

    pub fn blocked(&self, account: &Account) -> bool {
        self.sets.lock().blocked(account)
    }

    pub fn priority_len(&self) -> usize {
        self.sets.lock().priority_len()
    }

    pub fn running_len(&self) -> usize {
        self.running.lock().len()
    }

    /// Feeds ledger outcomes back into account selection.
    pub fn on_batch_processed(&self, batch: &[ProcessedItem]) {
        let mut sets = self.sets.lock();
        for item in batch {
            if item.context.source != BlockSource::Bootstrap {
                continue;
            }
            match item.status {
                BlockStatus::Progress => {
                    if let Some(saved) = &item.saved {
                        sets.priority_up(&saved.account());
                        // An applied block may satisfy a tracked dependency
                        sets.dependency_update(&saved.hash(), saved.account());
                    }
                }
                BlockStatus::GapSource => {
                    if let (Some(account), Some(dependency)) = (
                        item.context.block.account_field(),
                        dependency_of(&item.context.block),
                    ) {
                        sets.block(&account, dependency);
                    }
                }
                BlockStatus::GapPrevious => {
                    if let Some(account) = item.context.block.account_field() {
                        sets.priority_up(&account);
                    }
                }
                BlockStatus::BadSignature | BlockStatus::InsufficientWork => {
                    if let Some(account) = item.context.block.account_field() {
                        sets.priority_down(&account);
                    }
                }
                _ => {}
            }
        }
    }

    /// Unblocks accounts whose dependency just got cemented or applied.
    pub fn on_block_applied(&self, hash: &BlockHash, account: &Account) {
        let mut sets = self.sets.lock();
        sets.dependency_update(hash, *account);
    }

    /// Handles a pull response received on `channel`.
    pub fn process(&self, message: &Message, channel: &Arc<TcpChannel>) {
        let Message::AscPullAck { id, payload } = message else {
            return;
        };
        let Some(query) = self.running.lock().remove(id) else {
            return;
        };
        self.scoring.lock().received_message(channel);
        self.throttle.lock().add(true);
        self.stats.inc(StatType::Bootstrap, StatDetail::Reply);
        trace!(target: "bootstrap", id, "received pull response");

        match payload {
            AscPullAckPayload::Blocks { blocks } => {
                if blocks.is_empty() {
                    if let QueryTarget::Account(account) = query.target {
                        self.sets.lock().priority_down(&account);
                    }
                }
                for block in blocks {
                    self.block_processor.add(block.clone(), BlockSource::Bootstrap);
                }
            }
            AscPullAckPayload::AccountInfo { account, .. } => {
                if let QueryTarget::Dependency(dependency) = query.target {
                    if !account.is_zero() {
                        let mut sets = self.sets.lock();
                        sets.dependency_update(&dependency, *account);
                        sets.priority_set(account, PRIORITY_INITIAL);
                    }
                }
            }
        }
        self.condition.notify_all();
    }

    fn run(&self) {
        let mut last_housekeeping = Instant::now();
        loop {
            {
                let mut stopped = self.stopped.lock();
                if *stopped {
                    return;
                }
                self.condition
                    .wait_for(&mut stopped, Duration::from_millis(100));
                if *stopped {
                    return;
                }
            }

            if last_housekeeping.elapsed() >= Duration::from_secs(1) {
                self.housekeeping();
                last_housekeeping = Instant::now();
            }

            if self.throttle.lock().throttled() {
                self.stats.inc(StatType::Bootstrap, StatDetail::Throttled);
                continue;
            }
            if !self.limiter.should_pass(1) {
                continue;
            }

            self.send_next();
        }
    }

    fn housekeeping(&self) {
        // Expire unanswered requests
        let timeout = self.config.request_timeout;
        let expired: Vec<RunningQuery> = {
            let mut running = self.running.lock();
            let expired_ids: Vec<u64> = running
                .iter()
                .filter(|(_, query)| query.sent.elapsed() >= timeout)
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| running.remove(&id))
                .collect()
        };
        for query in expired {
            self.stats.inc(StatType::Bootstrap, StatDetail::Timeout);
            self.throttle.lock().add(false);
            if let QueryTarget::Account(account) = query.target {
                let mut sets = self.sets.lock();
                sets.timestamp_reset(&account);
                sets.priority_down(&account);
            }
        }

        self.scoring.lock().timeout();
        self.sets.lock().sync_dependencies();
    }

    fn send_next(&self) {
        let Some(request) = self.next_request() else {
            return;
        };
        let Some(channel) = self.scoring.lock().channel() else {
            return;
        };

        let (id, message, target) = request;
        self.running
            .lock()
            .insert(id, RunningQuery { target, sent: Instant::now() });
        match target {
            QueryTarget::Account(_) => {
                self.stats.inc(StatType::Bootstrap, StatDetail::Request)
            }
            QueryTarget::Dependency(_) => self
                .stats
                .inc(StatType::Bootstrap, StatDetail::RequestBlocking),
        }
        debug!(target: "bootstrap", id, ?target, "sending pull request");
        channel.send(&message, TrafficType::Bootstrap, None);
    }

    fn next_request(&self) -> Option<(u64, Message, QueryTarget)> {
        let running = self.running.lock();
        let sets = self.sets.lock();

        // Priority targets first
        let next = sets.next_priority(|account| {
            !running
                .values()
                .any(|query| query.target == QueryTarget::Account(*account))
        });
        if !next.account.is_zero() {
            drop(sets);
            drop(running);
            let start = {
                let tx = self.ledger.tx_begin_read();
                match self.ledger.any().account_head(&tx, &next.account) {
                    Some(head) => *head.as_bytes(),
                    None => *next.account.as_bytes(),
                }
            };
            self.sets.lock().timestamp_set(&next.account);
            let id = rand::rngs::OsRng.next_u64();
            return Some((
                id,
                Message::AscPullReq {
                    id,
                    payload: AscPullReqPayload::Blocks {
                        start: U256::from_bytes(start),
                        count: self.config.pull_count,
                    },
                },
                QueryTarget::Account(next.account),
            ));
        }

        // Otherwise resolve a blocking dependency
        let dependency = sets.next_blocking(|hash| {
            !running
                .values()
                .any(|query| query.target == QueryTarget::Dependency(*hash))
        });
        if !dependency.is_zero() {
            let id = rand::rngs::OsRng.next_u64();
            return Some((
                id,
                Message::AscPullReq {
                    id,
                    payload: AscPullReqPayload::AccountInfo {
                        target: U256::from_bytes(*dependency.as_bytes()),
                    },
                },
                QueryTarget::Dependency(dependency),
            ));
        }
        None
    }
}

fn dependency_of(block: &Block) -> Option<BlockHash> {
    block
        .source_field()
        .or_else(|| block.link_field().map(|link| link.as_block_hash()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_helpers::LedgerContext;
    use crate::numbers::Amount;

    fn requester_for(ctx: &LedgerContext, config: BootstrapConfig) -> Arc<BootstrapRequester> {
        let ledger = Arc::new(
            Ledger::new(
                ctx.ledger.store().clone(),
                ctx.params.ledger.clone(),
                ctx.stats.clone(),
            )
            .unwrap(),
        );
        let processor = BlockProcessor::new(
            crate::processing::BlockProcessorConfig::default(),
            ledger.clone(),
            ctx.stats.clone(),
        );
        BootstrapRequester::new(config, ledger, processor, ctx.stats.clone())
    }

    #[test]
    fn progress_feedback_prioritizes_account() {
        let ctx = LedgerContext::new();
        let requester = requester_for(&ctx, BootstrapConfig::default());
        let key = crate::crypto::KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        let saved = ctx.process(&send).unwrap();

        requester.on_batch_processed(&[ProcessedItem {
            status: BlockStatus::Progress,
            context: crate::processing::BlockContext {
                block: send.clone(),
                source: BlockSource::Bootstrap,
            },
            saved: Some(saved),
        }]);
        assert!(requester.prioritized(&ctx.params.ledger.genesis_account));
    }

    #[test]
    fn gap_source_blocks_account() {
        let ctx = LedgerContext::new();
        let requester = requester_for(&ctx, BootstrapConfig::default());
        let key = crate::crypto::KeyPair::generate();
        let missing_source = BlockHash::from_u64(12345);
        let open = ctx.open_account(&key, missing_source, Amount::raw(1));

        // The account was being pulled, then hit a missing dependency
        {
            let mut sets = requester.sets.lock();
            sets.priority_up(&key.account());
        }
        requester.on_batch_processed(&[ProcessedItem {
            status: BlockStatus::GapSource,
            context: crate::processing::BlockContext {
                block: open.clone(),
                source: BlockSource::Bootstrap,
            },
            saved: None,
        }]);
        assert!(requester.blocked(&key.account()));
        assert!(!requester.prioritized(&key.account()));
    }

    #[test]
    fn live_blocks_do_not_touch_account_sets() {
        let ctx = LedgerContext::new();
        let requester = requester_for(&ctx, BootstrapConfig::default());
        let key = crate::crypto::KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        let saved = ctx.process(&send).unwrap();

        requester.on_batch_processed(&[ProcessedItem {
            status: BlockStatus::Progress,
            context: crate::processing::BlockContext {
                block: send,
                source: BlockSource::Live,
            },
            saved: Some(saved),
        }]);
        assert!(!requester.prioritized(&ctx.params.ledger.genesis_account));
    }
}
