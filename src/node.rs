use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backlog::{BacklogScan, BoundedBacklog, RollbackInterlock};
use crate::block::Block;
use crate::bootstrap::BootstrapRequester;
use crate::config::NodeConfig;
use crate::crypto::KeyPair;
use crate::elections::ElectionContainer;
use crate::errors::CoreResult;
use crate::ledger::Ledger;
use crate::network_params::NetworkParams;
use crate::numbers::BlockHash;
use crate::processing::{BlockProcessor, BlockSource, ConfirmingSet};
use crate::rate_limiter::BandwidthLimiter;
use crate::scheduler::{Bucketing, PriorityScheduler};
use crate::stats::Stats;
use crate::store::Store;
use crate::transport::message::{AscPullAckPayload, AscPullReqPayload};
use crate::transport::{Message, TcpChannel, TcpListener, TrafficType};

impl RollbackInterlock for PriorityScheduler {
    fn veto_rollback(&self, hash: &BlockHash) -> bool {
        self.contains(hash)
    }
}

impl RollbackInterlock for ConfirmingSet {
    fn veto_rollback(&self, hash: &BlockHash) -> bool {
        self.contains(hash)
    }
}

/// Composition root: constructs every subsystem against one store and wires
/// the event flow between them. The RPC surface, wallet and vote layer attach
/// from the outside.
pub struct Node {
    pub params: NetworkParams,
    pub config: NodeConfig,
    pub stats: Arc<Stats>,
    pub ledger: Arc<Ledger>,
    pub bucketing: Arc<Bucketing>,
    pub active_elections: Arc<ElectionContainer>,
    pub block_processor: Arc<BlockProcessor>,
    pub confirming_set: Arc<ConfirmingSet>,
    pub scheduler: Arc<PriorityScheduler>,
    pub backlog_scan: Arc<BacklogScan>,
    pub bounded_backlog: Arc<BoundedBacklog>,
    pub online_reps: Arc<crate::online_reps::OnlineReps>,
    pub listener: Arc<TcpListener>,
    pub bootstrap: Arc<BootstrapRequester>,
    runtime: tokio::runtime::Runtime,
}

impl Node {
    pub fn new(config: NodeConfig, params: NetworkParams) -> CoreResult<Self> {
        let stats = Arc::new(Stats::new());
        let store = Store::new();
        let ledger = Arc::new(Ledger::new(
            store,
            params.ledger.clone(),
            stats.clone(),
        )?);
        let bucketing = Arc::new(Bucketing::new());
        let active_elections = Arc::new(ElectionContainer::new(config.active_elections_target));

        let block_processor = BlockProcessor::new(
            config.block_processor_config(),
            ledger.clone(),
            stats.clone(),
        );
        let confirming_set = ConfirmingSet::new(
            config.confirming_set_config(),
            ledger.clone(),
            stats.clone(),
        );
        let scheduler = PriorityScheduler::new(
            config.scheduler_config(),
            ledger.clone(),
            bucketing.clone(),
            active_elections.clone(),
            stats.clone(),
        );
        let backlog_scan = BacklogScan::new(
            config.backlog_scan_config(),
            ledger.clone(),
            stats.clone(),
        );
        let bounded_backlog = BoundedBacklog::new(
            config.bounded_backlog_config(),
            ledger.clone(),
            bucketing.clone(),
            block_processor.clone(),
            stats.clone(),
        );
        let online_reps = crate::online_reps::OnlineReps::new(
            params.network.clone(),
            ledger.clone(),
            stats.clone(),
        );

        let node_key = KeyPair::generate();
        let limiter = Arc::new(BandwidthLimiter::new(config.bandwidth_config()));
        let listener = TcpListener::new(
            config.listener_config(),
            config.socket_config(&params.network),
            params.network.clone(),
            node_key,
            limiter,
            stats.clone(),
        );
        let bootstrap = BootstrapRequester::new(
            config.bootstrap_config(),
            ledger.clone(),
            block_processor.clone(),
            stats.clone(),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let node = Self {
            params,
            config,
            stats,
            ledger,
            bucketing,
            active_elections,
            block_processor,
            confirming_set,
            scheduler,
            backlog_scan,
            bounded_backlog,
            online_reps,
            listener,
            bootstrap,
            runtime,
        };
        node.wire_events();
        Ok(node)
    }

    /// Connects the event flow: processed batches feed the scheduler, the
    /// backlog and bootstrap; cemented batches propagate confirmations;
    /// scanner batches populate both backlog views; inbound frames dispatch
    /// into the processing queues.
    fn wire_events(&self) {
        // batch_processed -> scheduler activation
        {
            let scheduler = self.scheduler.clone();
            let ledger = self.ledger.clone();
            self.block_processor.batch_processed.add(move |batch| {
                let tx = ledger.tx_begin_read();
                for item in batch {
                    if let Some(saved) = &item.saved {
                        scheduler.activate_successors(&tx, saved);
                    }
                }
            });
        }
        // batch_processed -> backlog tracking
        {
            let bounded_backlog = self.bounded_backlog.clone();
            self.block_processor.batch_processed.add(move |batch| {
                bounded_backlog.on_batch_processed(batch);
            });
        }
        // batch_processed -> bootstrap account selection feedback
        {
            let bootstrap = self.bootstrap.clone();
            self.block_processor.batch_processed.add(move |batch| {
                bootstrap.on_batch_processed(batch);
            });
        }
        // rolled_back -> backlog eviction
        {
            let bounded_backlog = self.bounded_backlog.clone();
            self.block_processor.rolled_back.add(move |(blocks, _root)| {
                bounded_backlog.on_rolled_back(blocks);
            });
        }
        // batch_cemented -> confirmation propagation + backlog eviction
        {
            let scheduler = self.scheduler.clone();
            let ledger = self.ledger.clone();
            let bounded_backlog = self.bounded_backlog.clone();
            self.confirming_set.batch_cemented.add(move |batch| {
                let blocks: Vec<_> = batch
                    .iter()
                    .map(|notification| notification.block.clone())
                    .collect();
                bounded_backlog.on_batch_cemented(&blocks);
                let tx = ledger.tx_begin_read();
                for block in &blocks {
                    scheduler.activate_successors(&tx, block);
                }
            });
        }
        // backlog scan -> scheduler + bounded backlog
        {
            let scheduler = self.scheduler.clone();
            let bounded_backlog = self.bounded_backlog.clone();
            let ledger = self.ledger.clone();
            self.backlog_scan.batch_activated.add(move |batch| {
                let tx = ledger.tx_begin_read();
                for info in batch {
                    scheduler.activate(&tx, &info.account);
                    bounded_backlog.activate(&tx, &info.account, &info.account_info, &info.conf_info);
                }
            });
        }
        {
            let bounded_backlog = self.bounded_backlog.clone();
            self.backlog_scan.batch_scanned.add(move |batch| {
                bounded_backlog.on_batch_scanned(batch);
            });
        }
        // Rollback interlocks: elections and cementing must win over eviction
        self.bounded_backlog.add_interlock(self.scheduler.clone());
        self.bounded_backlog.add_interlock(self.confirming_set.clone());

        // Inbound traffic dispatch
        {
            let block_processor = self.block_processor.clone();
            let bootstrap = self.bootstrap.clone();
            let online_reps = self.online_reps.clone();
            let ledger = self.ledger.clone();
            let pull_count_max = self.config.bootstrap.pull_count;
            self.listener.inbound.add(move |(channel, message)| {
                match message {
                    Message::Publish { block } => {
                        block_processor.add(block.clone(), BlockSource::Live);
                    }
                    Message::ConfirmAck { vote } => {
                        online_reps.observe(vote.account);
                    }
                    Message::AscPullAck { .. } => {
                        bootstrap.process(message, channel);
                    }
                    Message::AscPullReq { id, payload } => {
                        serve_pull(&ledger, channel, *id, payload, pull_count_max);
                    }
                    _ => {}
                }
            });
        }
        // Fresh handshakes refresh bootstrap's channel list
        {
            let bootstrap = self.bootstrap.clone();
            let listener = self.listener.clone();
            self.listener.connection_accepted.add(move |_channel| {
                bootstrap.sync_channels(listener.realtime_channels());
            });
        }
    }

    pub fn start(&self) -> CoreResult<()> {
        info!(target: "node", network = ?self.params.kind, "starting node core");
        self.block_processor.start();
        self.confirming_set.start();
        self.scheduler.start();
        self.backlog_scan.start();
        self.bounded_backlog.start();
        self.online_reps.start();
        let listener = self.listener.clone();
        self.runtime
            .block_on(async move { listener.start().await })
            .map_err(|err| crate::errors::CoreError::Config(format!("listener failed: {err}")))?;
        self.bootstrap.start();
        Ok(())
    }

    pub fn stop(&self) {
        debug!(target: "node", "stopping node core");
        self.bootstrap.stop();
        self.listener.stop();
        self.online_reps.stop();
        self.bounded_backlog.stop();
        self.backlog_scan.stop();
        self.scheduler.stop();
        self.confirming_set.stop();
        self.block_processor.stop();
    }

    /// Dials a peer inside the node's runtime.
    pub fn connect(&self, endpoint: std::net::SocketAddr) -> CoreResult<Arc<TcpChannel>> {
        let listener = self.listener.clone();
        self.runtime
            .block_on(async move { listener.connect(endpoint).await })
            .map_err(|err| crate::errors::CoreError::Config(format!("connect failed: {err}")))
    }

    pub fn port(&self) -> Option<u16> {
        self.listener.port()
    }
}

/// Answers an ascending pull request from local ledger state.
fn serve_pull(
    ledger: &Arc<Ledger>,
    channel: &Arc<TcpChannel>,
    id: u64,
    payload: &AscPullReqPayload,
    pull_count_max: u8,
) {
    let tx = ledger.tx_begin_read();
    let response = match payload {
        AscPullReqPayload::Blocks { start, count } => {
            let start_account = crate::numbers::Account::from(*start);
            let start_hash = BlockHash::from(*start);
            // The start target is an account frontier or a block hash
            let mut cursor = match ledger.any().account_get(&tx, &start_account) {
                Some(info) => Some(info.open_block),
                None => ledger
                    .any()
                    .block_exists(&tx, &start_hash)
                    .then_some(start_hash),
            };
            let mut blocks: Vec<Arc<Block>> = Vec::new();
            let limit = (*count).min(pull_count_max) as usize;
            while let Some(hash) = cursor {
                if blocks.len() >= limit {
                    break;
                }
                let Some(block) = ledger.any().block_get(&tx, &hash) else {
                    break;
                };
                blocks.push(block.block.clone());
                cursor = ledger.any().block_successor(&tx, &hash);
            }
            Message::AscPullAck {
                id,
                payload: AscPullAckPayload::Blocks { blocks },
            }
        }
        AscPullReqPayload::AccountInfo { target } => {
            let account = crate::numbers::Account::from(*target);
            let hash = BlockHash::from(*target);
            let resolved = match ledger.any().account_get(&tx, &account) {
                Some(_) => Some(account),
                None => ledger.any().block_account(&tx, &hash),
            };
            match resolved {
                Some(account) => {
                    let info = ledger.any().account_get(&tx, &account);
                    let conf = ledger
                        .store()
                        .confirmation_height_get(&tx, &account)
                        .unwrap_or_default();
                    Message::AscPullAck {
                        id,
                        payload: AscPullAckPayload::AccountInfo {
                            account,
                            head: info.map(|i| i.head).unwrap_or(BlockHash::ZERO),
                            head_height: info.map(|i| i.block_count).unwrap_or(0),
                            conf_frontier: conf.frontier,
                            conf_height: conf.height,
                        },
                    }
                }
                None => Message::AscPullAck {
                    id,
                    payload: AscPullAckPayload::AccountInfo {
                        account: crate::numbers::Account::ZERO,
                        head: BlockHash::ZERO,
                        head_height: 0,
                        conf_frontier: BlockHash::ZERO,
                        conf_height: 0,
                    },
                },
            }
        }
    };
    if !channel.send(&response, TrafficType::Bootstrap, None) {
        warn!(target: "node", "dropping pull response, channel full");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elections::ActiveElections;
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
    fn full_pipeline_processes_and_schedules() {
        let node = Node::new(NodeConfig::default(), NetworkParams::dev()).unwrap();
        node.start().unwrap();

        let genesis = node.params.ledger.genesis_key.clone();
        let key = KeyPair::generate();
        let head = node.params.ledger.genesis_block.hash();
        let send = Arc::new(
            crate::block::BlockBuilder::state()
                .account(genesis.account())
                .previous(head)
                .representative(genesis.account())
                .balance(Amount::MAX.saturating_sub(Amount::raw(100)))
                .link(crate::numbers::Link::from(key.account()))
                .work(crate::crypto::work_generate(
                    node.params.ledger.work_threshold,
                    &crate::numbers::Root::from(head),
                ))
                .sign(genesis.raw(), &genesis.account()),
        );

        assert!(node.block_processor.add(send.clone(), BlockSource::Live));

        // The pipeline applies the block, indexes it and schedules it
        wait_until(Duration::from_secs(10), || {
            let tx = node.ledger.tx_begin_read();
            node.ledger.any().block_exists(&tx, &send.hash())
        });
        wait_until(Duration::from_secs(10), || {
            node.bounded_backlog.contains(&send.hash())
        });
        wait_until(Duration::from_secs(10), || {
            node.active_elections.size() > 0 || node.scheduler.contains(&send.hash())
        });

        // Cementing clears it everywhere
        node.confirming_set.add(send.hash());
        wait_until(Duration::from_secs(10), || {
            let tx = node.ledger.tx_begin_read();
            node.ledger.block_confirmed(&tx, &send.hash())
        });
        wait_until(Duration::from_secs(10), || {
            !node.bounded_backlog.contains(&send.hash())
        });
        assert_eq!(node.ledger.backlog_count(), 0);

        node.stop();
    }
}
