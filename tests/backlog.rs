use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_node::block::BlockBuilder;
use lattice_node::crypto::{work_generate, KeyPair};
use lattice_node::numbers::{Amount, BlockHash, Link, Root};
use lattice_node::processing::BlockSource;
use lattice_node::store::Writer;
use lattice_node::{NetworkParams, Node, NodeConfig};

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
    let start = Instant::now();
    while !predicate() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Injects 2K unconfirmed open blocks across two balance buckets and holds
/// them out of the vote paths; the bounded backlog must roll the ledger back
/// to at most K unconfirmed blocks, draining buckets down to the threshold.
#[test]
fn backlog_is_rolled_back_to_the_ceiling() {
    const MAX_BACKLOG: usize = 8;
    const ACCOUNTS: usize = 16;

    let mut config = NodeConfig::default();
    config.bounded_backlog.max_backlog = MAX_BACKLOG;
    config.bounded_backlog.bucket_threshold = MAX_BACKLOG / 2;
    config.bounded_backlog.batch_size = 2;
    // Keep the blocks out of election and bootstrap paths
    config.priority_scheduler.enable = false;
    config.bootstrap.enable = false;
    config.backlog_scan.enable = false;

    let node = Node::new(config, NetworkParams::dev()).unwrap();
    node.start().unwrap();

    let genesis = node.params.ledger.genesis_key.clone();
    let threshold = node.params.ledger.work_threshold;

    // Two balance classes, far enough apart to land in different buckets
    let small = Amount::raw(1);
    let large = Amount::raw(1u128 << 100);

    // Build and cement the genesis send chain so only the opens stay
    // unconfirmed
    let mut keys = Vec::new();
    let mut sends = Vec::new();
    {
        let mut head = node.params.ledger.genesis_block.hash();
        let mut balance = Amount::MAX;
        let mut tx = node.ledger.tx_begin_write(Writer::Testing);
        for i in 0..ACCOUNTS {
            let key = KeyPair::generate();
            let amount = if i % 2 == 0 { small } else { large };
            balance = balance.saturating_sub(amount);
            let send = Arc::new(
                BlockBuilder::state()
                    .account(genesis.account())
                    .previous(head)
                    .representative(genesis.account())
                    .balance(balance)
                    .link(Link::from(key.account()))
                    .work(work_generate(threshold, &Root::from(head)))
                    .sign(genesis.raw(), &genesis.account()),
            );
            node.ledger.process(&mut tx, &send).unwrap();
            head = send.hash();
            keys.push((key, amount));
            sends.push(send);
        }
        node.ledger.confirm(&mut tx, head);
    }
    assert_eq!(node.ledger.backlog_count(), 0);

    // Open all accounts through the processor so the backlog tracks them
    for ((key, amount), send) in keys.iter().zip(&sends) {
        let open = Arc::new(
            BlockBuilder::state()
                .account(key.account())
                .previous(BlockHash::ZERO)
                .representative(key.account())
                .balance(*amount)
                .link(Link::from(send.hash()))
                .work(work_generate(threshold, &Root::from(key.account())))
                .sign(key.raw(), &key.account()),
        );
        assert!(node.block_processor.add(open, BlockSource::Live));
    }

    wait_until(Duration::from_secs(10), || {
        node.ledger.backlog_count() >= ACCOUNTS as u64
    });
    assert!(node.bounded_backlog.index_len() >= ACCOUNTS);

    // The rollback loop trims the ledger down to the ceiling
    wait_until(Duration::from_secs(30), || {
        node.ledger.backlog_count() <= MAX_BACKLOG as u64
    });
    wait_until(Duration::from_secs(30), || {
        node.bounded_backlog.index_len() <= MAX_BACKLOG
    });

    // No over-threshold bucket remains
    let bucketing = lattice_node::scheduler::Bucketing::new();
    let small_bucket = bucketing.bucket_index(small);
    let large_bucket = bucketing.bucket_index(large);
    assert_ne!(small_bucket, large_bucket);
    assert!(node.bounded_backlog.bucket_size(small_bucket) <= MAX_BACKLOG / 2);
    assert!(node.bounded_backlog.bucket_size(large_bucket) <= MAX_BACKLOG / 2);

    // Rolled-back accounts disappeared from the ledger entirely
    let tx = node.ledger.tx_begin_read();
    let surviving = keys
        .iter()
        .filter(|(key, _)| {
            node.ledger
                .any()
                .account_get(&tx, &key.account())
                .is_some()
        })
        .count();
    assert_eq!(surviving as u64, node.ledger.backlog_count());
    drop(tx);

    node.stop();
}

/// Cementing removes blocks from the backlog without any rollback.
#[test]
fn cemented_blocks_leave_the_backlog() {
    let mut config = NodeConfig::default();
    config.priority_scheduler.enable = false;
    config.bootstrap.enable = false;

    let node = Node::new(config, NetworkParams::dev()).unwrap();
    node.start().unwrap();

    let genesis = node.params.ledger.genesis_key.clone();
    let key = KeyPair::generate();
    let head = node.params.ledger.genesis_block.hash();
    let send = Arc::new(
        BlockBuilder::state()
            .account(genesis.account())
            .previous(head)
            .representative(genesis.account())
            .balance(Amount::MAX.saturating_sub(Amount::raw(7)))
            .link(Link::from(key.account()))
            .work(work_generate(
                node.params.ledger.work_threshold,
                &Root::from(head),
            ))
            .sign(genesis.raw(), &genesis.account()),
    );
    node.block_processor.add(send.clone(), BlockSource::Live);

    wait_until(Duration::from_secs(10), || {
        node.bounded_backlog.contains(&send.hash())
    });

    node.confirming_set.add(send.hash());
    wait_until(Duration::from_secs(10), || {
        !node.bounded_backlog.contains(&send.hash())
    });
    assert_eq!(node.ledger.backlog_count(), 0);

    node.stop();
}
