use std::sync::Arc;

use lattice_node::block::BlockBuilder;
use lattice_node::crypto::{work_generate, KeyPair};
use lattice_node::ledger::{BlockStatus, Ledger};
use lattice_node::numbers::{Amount, BlockHash, Link, Root};
use lattice_node::scheduler::Bucketing;
use lattice_node::stats::Stats;
use lattice_node::store::{Store, Writer};
use lattice_node::NetworkParams;

struct Fixture {
    params: NetworkParams,
    ledger: Ledger,
}

impl Fixture {
    fn new() -> Self {
        let params = NetworkParams::dev();
        let ledger = Ledger::new(
            Store::new(),
            params.ledger.clone(),
            Arc::new(Stats::new()),
        )
        .expect("ledger initializes");
        Self { params, ledger }
    }

    fn genesis(&self) -> &KeyPair {
        &self.params.ledger.genesis_key
    }

    fn work(&self, root: Root) -> u64 {
        work_generate(self.params.ledger.work_threshold, &root)
    }
}

#[test]
fn bucketing_shape_is_stable() {
    let bucketing = Bucketing::new();
    assert_eq!(bucketing.size(), 63);
    let indices = bucketing.bucket_indices();
    assert_eq!(indices.len(), 63);
    assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn process_is_idempotent_across_transactions() {
    let fixture = Fixture::new();
    let genesis = fixture.genesis();
    let key = KeyPair::generate();
    let head = fixture.params.ledger.genesis_block.hash();
    let send = Arc::new(
        BlockBuilder::state()
            .account(genesis.account())
            .previous(head)
            .representative(genesis.account())
            .balance(Amount::MAX.saturating_sub(Amount::raw(1)))
            .link(Link::from(key.account()))
            .work(fixture.work(Root::from(head)))
            .sign(genesis.raw(), &genesis.account()),
    );

    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        assert!(fixture.ledger.process(&mut tx, &send).is_ok());
    }
    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        assert_eq!(
            fixture.ledger.process(&mut tx, &send),
            Err(BlockStatus::Old)
        );
    }
}

#[test]
fn full_balance_send_keeps_genesis_priority() {
    let fixture = Fixture::new();
    let genesis = fixture.genesis();
    let key = KeyPair::generate();
    let head = fixture.params.ledger.genesis_block.hash();
    let send = Arc::new(
        BlockBuilder::state()
            .account(genesis.account())
            .previous(head)
            .representative(genesis.account())
            .balance(Amount::ZERO)
            .link(Link::from(key.account()))
            .work(fixture.work(Root::from(head)))
            .sign(genesis.raw(), &genesis.account()),
    );
    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        fixture.ledger.process(&mut tx, &send).unwrap();
    }

    let tx = fixture.ledger.tx_begin_read();
    let (balance, timestamp) = fixture.ledger.block_priority(&tx, &send);
    // The emptied account keeps the sender's weight class and age
    assert_eq!(balance, fixture.params.ledger.genesis_amount);
    let genesis_timestamp = fixture
        .ledger
        .any()
        .block_get(&tx, &head)
        .unwrap()
        .sideband
        .timestamp;
    assert_eq!(timestamp, genesis_timestamp);
}

#[test]
fn cross_account_transfer_and_rollback_conserves_balances() {
    let fixture = Fixture::new();
    let genesis = fixture.genesis();
    let key = KeyPair::generate();
    let head = fixture.params.ledger.genesis_block.hash();
    let remaining = Amount::MAX.saturating_sub(Amount::raw(500));

    let send = Arc::new(
        BlockBuilder::state()
            .account(genesis.account())
            .previous(head)
            .representative(genesis.account())
            .balance(remaining)
            .link(Link::from(key.account()))
            .work(fixture.work(Root::from(head)))
            .sign(genesis.raw(), &genesis.account()),
    );
    let open = Arc::new(
        BlockBuilder::state()
            .account(key.account())
            .previous(BlockHash::ZERO)
            .representative(key.account())
            .balance(Amount::raw(500))
            .link(Link::from(send.hash()))
            .work(fixture.work(Root::from(key.account())))
            .sign(key.raw(), &key.account()),
    );

    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        fixture.ledger.process(&mut tx, &send).unwrap();
        fixture.ledger.process(&mut tx, &open).unwrap();
    }
    assert_eq!(fixture.ledger.backlog_count(), 2);

    {
        let tx = fixture.ledger.tx_begin_read();
        let genesis_balance = fixture
            .ledger
            .any()
            .account_balance(&tx, &genesis.account())
            .unwrap();
        let receiver_balance = fixture
            .ledger
            .any()
            .account_balance(&tx, &key.account())
            .unwrap();
        assert_eq!(
            genesis_balance.checked_add(receiver_balance).unwrap(),
            Amount::MAX
        );
    }

    // Rolling back the receive restores the pending entry; rolling back the
    // send removes it again
    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        fixture.ledger.rollback(&mut tx, &open.hash()).unwrap();
        fixture.ledger.rollback(&mut tx, &send.hash()).unwrap();
    }
    assert_eq!(fixture.ledger.backlog_count(), 0);
    let tx = fixture.ledger.tx_begin_read();
    assert_eq!(
        fixture.ledger.any().account_balance(&tx, &genesis.account()),
        Some(Amount::MAX)
    );
    assert!(fixture.ledger.any().account_get(&tx, &key.account()).is_none());
    assert_eq!(fixture.ledger.weight(&genesis.account()), Amount::MAX);
    assert_eq!(fixture.ledger.weight(&key.account()), Amount::ZERO);
}

#[test]
fn confirmation_height_tracks_cemented_prefix() {
    let fixture = Fixture::new();
    let genesis = fixture.genesis();
    let key = KeyPair::generate();
    let mut head = fixture.params.ledger.genesis_block.hash();
    let mut blocks = Vec::new();
    let mut balance = Amount::MAX;
    for _ in 0..3 {
        balance = balance.saturating_sub(Amount::raw(10));
        let send = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(head)
                .representative(genesis.account())
                .balance(balance)
                .link(Link::from(key.account()))
                .work(fixture.work(Root::from(head)))
                .sign(genesis.raw(), &genesis.account()),
        );
        head = send.hash();
        blocks.push(send);
    }
    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        for block in &blocks {
            fixture.ledger.process(&mut tx, block).unwrap();
        }
    }
    assert_eq!(fixture.ledger.backlog_count(), 3);

    // Cementing the middle block cements everything below it
    {
        let mut tx = fixture.ledger.tx_begin_write(Writer::Testing);
        let cemented = fixture.ledger.confirm(&mut tx, blocks[1].hash());
        assert_eq!(cemented.len(), 2);
        assert_eq!(cemented[0].hash(), blocks[0].hash());
        assert_eq!(cemented[1].hash(), blocks[1].hash());
    }
    assert_eq!(fixture.ledger.backlog_count(), 1);

    let tx = fixture.ledger.tx_begin_read();
    assert!(fixture.ledger.block_confirmed(&tx, &blocks[1].hash()));
    assert!(!fixture.ledger.block_confirmed(&tx, &blocks[2].hash()));
    assert!(fixture.ledger.unconfirmed_exists(&tx, &blocks[2].hash()));
    let info = fixture
        .ledger
        .any()
        .account_get(&tx, &genesis.account())
        .unwrap();
    let conf = fixture
        .ledger
        .store()
        .confirmation_height_get(&tx, &genesis.account())
        .unwrap();
    assert!(conf.height <= info.block_count);
}
