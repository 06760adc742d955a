pub mod write_queue;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::SavedBlock;
use crate::epoch::Epoch;
use crate::numbers::{Account, Amount, BlockHash, QualifiedRoot};

pub use write_queue::{WriteGuard, WriteQueue, Writer};

pub const STORE_VERSION: u32 = 1;

/// Mutations applied under one write transaction before `refresh_if_needed`
/// yields the writer slot.
const REFRESH_OPS_THRESHOLD: u64 = 500;

/// Per-account head state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub head: BlockHash,
    pub open_block: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub modified: u64,
    pub block_count: u64,
    pub epoch: Epoch,
}

/// Highest confirmed block of an account chain. `height == block_count`
/// means the account is fully confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationHeightInfo {
    pub height: u64,
    pub frontier: BlockHash,
}

impl Default for ConfirmationHeightInfo {
    fn default() -> Self {
        Self {
            height: 0,
            frontier: BlockHash::ZERO,
        }
    }
}

/// Key of a receivable entry: the destination account and the send hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub account: Account,
    pub hash: BlockHash,
}

impl PendingKey {
    pub fn new(account: Account, hash: BlockHash) -> Self {
        Self { account, hash }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInfo {
    pub source: Account,
    pub amount: Amount,
    pub epoch: Epoch,
}

#[derive(Default)]
struct Tables {
    account: BTreeMap<Account, AccountInfo>,
    block: BTreeMap<BlockHash, SavedBlock>,
    confirmation_height: BTreeMap<Account, ConfirmationHeightInfo>,
    pending: BTreeMap<PendingKey, PendingInfo>,
    rep_weight: BTreeMap<Account, Amount>,
    online_weight: BTreeMap<u64, Amount>,
    final_vote: BTreeMap<QualifiedRoot, BlockHash>,
    peer: BTreeMap<SocketAddr, u64>,
    pruned: BTreeSet<BlockHash>,
    version: Option<u32>,
}

/// In-memory table store behind the transaction/iterator contract the ledger
/// consumes. Readers are unbounded; writers are serialized through the named
/// write queue.
#[derive(Clone)]
pub struct Store {
    tables: Arc<RwLock<Tables>>,
    write_queue: Arc<WriteQueue>,
}

/// Marker for read access to the store. Both transaction flavors implement
/// it; a `WriteTransaction` additionally proves exclusive write access.
pub trait Transaction {}

pub struct ReadTransaction {
    _private: (),
}

impl Transaction for ReadTransaction {}

pub struct WriteTransaction {
    guard: WriteGuard,
    ops: AtomicU64,
    refreshed: AtomicU64,
}

impl Transaction for WriteTransaction {}

impl WriteTransaction {
    pub(crate) fn count_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Commits and reopens the transaction once enough operations have
    /// accumulated. Iterator positions obtained earlier are invalidated.
    pub fn refresh_if_needed(&mut self) {
        if self.ops.load(Ordering::Relaxed) >= REFRESH_OPS_THRESHOLD {
            self.refresh();
        }
    }

    pub fn refresh(&mut self) {
        self.guard.release();
        self.guard.renew();
        self.ops.store(0, Ordering::Relaxed);
        self.refreshed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn writer(&self) -> Writer {
        self.guard.writer()
    }

    #[cfg(test)]
    pub(crate) fn refresh_count(&self) -> u64 {
        self.refreshed.load(Ordering::Relaxed)
    }
}

impl Store {
    pub fn new() -> Self {
        let store = Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            write_queue: WriteQueue::new(),
        };
        store.tables.write().version = Some(STORE_VERSION);
        store
    }

    pub fn tx_begin_read(&self) -> ReadTransaction {
        ReadTransaction { _private: () }
    }

    /// Blocks until the named writer slot reaches the head of the queue.
    pub fn tx_begin_write(&self, writer: Writer) -> WriteTransaction {
        WriteTransaction {
            guard: self.write_queue.wait(writer),
            ops: AtomicU64::new(0),
            refreshed: AtomicU64::new(0),
        }
    }

    pub fn write_queue(&self) -> &Arc<WriteQueue> {
        &self.write_queue
    }

    pub fn version(&self, _tx: &dyn Transaction) -> u32 {
        self.tables.read().version.unwrap_or(STORE_VERSION)
    }

    /*
     * account table
     */

    pub fn account_get(&self, _tx: &dyn Transaction, account: &Account) -> Option<AccountInfo> {
        self.tables.read().account.get(account).copied()
    }

    pub fn account_put(&self, tx: &WriteTransaction, account: &Account, info: AccountInfo) {
        tx.count_op();
        self.tables.write().account.insert(*account, info);
    }

    pub fn account_del(&self, tx: &WriteTransaction, account: &Account) {
        tx.count_op();
        self.tables.write().account.remove(account);
    }

    pub fn account_count(&self, _tx: &dyn Transaction) -> u64 {
        self.tables.read().account.len() as u64
    }

    /// Lower-bound seek: first entry at or after `lower_bound`.
    pub fn account_begin(
        &self,
        _tx: &dyn Transaction,
        lower_bound: &Account,
    ) -> Option<(Account, AccountInfo)> {
        self.tables
            .read()
            .account
            .range(*lower_bound..)
            .next()
            .map(|(account, info)| (*account, *info))
    }

    /*
     * block table
     */

    pub fn block_get(&self, _tx: &dyn Transaction, hash: &BlockHash) -> Option<SavedBlock> {
        self.tables.read().block.get(hash).cloned()
    }

    pub fn block_exists(&self, _tx: &dyn Transaction, hash: &BlockHash) -> bool {
        self.tables.read().block.contains_key(hash)
    }

    pub fn block_put(&self, tx: &WriteTransaction, hash: &BlockHash, block: SavedBlock) {
        tx.count_op();
        self.tables.write().block.insert(*hash, block);
    }

    pub fn block_del(&self, tx: &WriteTransaction, hash: &BlockHash) {
        tx.count_op();
        self.tables.write().block.remove(hash);
    }

    pub fn block_count(&self, _tx: &dyn Transaction) -> u64 {
        self.tables.read().block.len() as u64
    }

    /// Rewrites the stored successor hash of `hash`.
    pub fn block_successor_set(
        &self,
        tx: &WriteTransaction,
        hash: &BlockHash,
        successor: BlockHash,
    ) {
        tx.count_op();
        if let Some(existing) = self.tables.write().block.get_mut(hash) {
            existing.sideband.successor = successor;
        }
    }

    pub fn block_successor(&self, _tx: &dyn Transaction, hash: &BlockHash) -> Option<BlockHash> {
        self.tables
            .read()
            .block
            .get(hash)
            .map(|block| block.sideband.successor)
            .filter(|successor| !successor.is_zero())
    }

    /*
     * confirmation_height table
     */

    pub fn confirmation_height_get(
        &self,
        _tx: &dyn Transaction,
        account: &Account,
    ) -> Option<ConfirmationHeightInfo> {
        self.tables.read().confirmation_height.get(account).copied()
    }

    pub fn confirmation_height_put(
        &self,
        tx: &WriteTransaction,
        account: &Account,
        info: ConfirmationHeightInfo,
    ) {
        tx.count_op();
        self.tables.write().confirmation_height.insert(*account, info);
    }

    pub fn confirmation_height_del(&self, tx: &WriteTransaction, account: &Account) {
        tx.count_op();
        self.tables.write().confirmation_height.remove(account);
    }

    /*
     * pending table
     */

    pub fn pending_get(&self, _tx: &dyn Transaction, key: &PendingKey) -> Option<PendingInfo> {
        self.tables.read().pending.get(key).copied()
    }

    pub fn pending_exists(&self, _tx: &dyn Transaction, key: &PendingKey) -> bool {
        self.tables.read().pending.contains_key(key)
    }

    pub fn pending_put(&self, tx: &WriteTransaction, key: &PendingKey, info: PendingInfo) {
        tx.count_op();
        self.tables.write().pending.insert(*key, info);
    }

    pub fn pending_del(&self, tx: &WriteTransaction, key: &PendingKey) {
        tx.count_op();
        self.tables.write().pending.remove(key);
    }

    /// First receivable entry for `account` at or after `lower_bound`.
    pub fn pending_begin(
        &self,
        _tx: &dyn Transaction,
        lower_bound: &PendingKey,
    ) -> Option<(PendingKey, PendingInfo)> {
        self.tables
            .read()
            .pending
            .range(*lower_bound..)
            .next()
            .map(|(key, info)| (*key, *info))
    }

    /*
     * rep_weight table
     */

    pub fn rep_weight_get(&self, _tx: &dyn Transaction, representative: &Account) -> Amount {
        self.tables
            .read()
            .rep_weight
            .get(representative)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    pub fn rep_weight_put(
        &self,
        tx: &WriteTransaction,
        representative: &Account,
        weight: Amount,
    ) {
        tx.count_op();
        let mut tables = self.tables.write();
        if weight.is_zero() {
            tables.rep_weight.remove(representative);
        } else {
            tables.rep_weight.insert(*representative, weight);
        }
    }

    /*
     * online_weight table
     */

    pub fn online_weight_put(&self, tx: &WriteTransaction, timestamp: u64, weight: Amount) {
        tx.count_op();
        self.tables.write().online_weight.insert(timestamp, weight);
    }

    pub fn online_weight_del(&self, tx: &WriteTransaction, timestamp: u64) {
        tx.count_op();
        self.tables.write().online_weight.remove(&timestamp);
    }

    pub fn online_weight_count(&self, _tx: &dyn Transaction) -> u64 {
        self.tables.read().online_weight.len() as u64
    }

    /// Samples in ascending timestamp order starting at `lower_bound`.
    pub fn online_weight_begin(
        &self,
        _tx: &dyn Transaction,
        lower_bound: u64,
    ) -> Option<(u64, Amount)> {
        self.tables
            .read()
            .online_weight
            .range(lower_bound..)
            .next()
            .map(|(timestamp, weight)| (*timestamp, *weight))
    }

    /*
     * final_vote table
     */

    pub fn final_vote_get(
        &self,
        _tx: &dyn Transaction,
        root: &QualifiedRoot,
    ) -> Option<BlockHash> {
        self.tables.read().final_vote.get(root).copied()
    }

    pub fn final_vote_put(&self, tx: &WriteTransaction, root: &QualifiedRoot, hash: BlockHash) {
        tx.count_op();
        self.tables.write().final_vote.insert(*root, hash);
    }

    pub fn final_vote_del(&self, tx: &WriteTransaction, root: &QualifiedRoot) {
        tx.count_op();
        self.tables.write().final_vote.remove(root);
    }

    /*
     * peer table
     */

    pub fn peer_put(&self, tx: &WriteTransaction, endpoint: SocketAddr, timestamp: u64) {
        tx.count_op();
        self.tables.write().peer.insert(endpoint, timestamp);
    }

    pub fn peer_del(&self, tx: &WriteTransaction, endpoint: &SocketAddr) {
        tx.count_op();
        self.tables.write().peer.remove(endpoint);
    }

    pub fn peer_exists(&self, _tx: &dyn Transaction, endpoint: &SocketAddr) -> bool {
        self.tables.read().peer.contains_key(endpoint)
    }

    pub fn peer_count(&self, _tx: &dyn Transaction) -> u64 {
        self.tables.read().peer.len() as u64
    }

    /*
     * pruned table
     */

    pub fn pruned_put(&self, tx: &WriteTransaction, hash: &BlockHash) {
        tx.count_op();
        self.tables.write().pruned.insert(*hash);
    }

    pub fn pruned_exists(&self, _tx: &dyn Transaction, hash: &BlockHash) -> bool {
        self.tables.read().pruned.contains(hash)
    }

    pub fn pruned_count(&self, _tx: &dyn Transaction) -> u64 {
        self.tables.read().pruned.len() as u64
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(n: u64) -> Account {
        Account::from_u64(n)
    }

    fn sample_info() -> AccountInfo {
        AccountInfo {
            head: BlockHash::from_u64(1),
            open_block: BlockHash::from_u64(1),
            representative: account(2),
            balance: Amount::raw(3),
            modified: 4,
            block_count: 1,
            epoch: Epoch::Epoch0,
        }
    }

    #[test]
    fn account_crud_and_seek() {
        let store = Store::new();
        let tx = store.tx_begin_write(Writer::Testing);
        store.account_put(&tx, &account(10), sample_info());
        store.account_put(&tx, &account(20), sample_info());
        drop(tx);

        let tx = store.tx_begin_read();
        assert_eq!(store.account_count(&tx), 2);
        assert!(store.account_get(&tx, &account(10)).is_some());
        assert!(store.account_get(&tx, &account(15)).is_none());

        let (found, _) = store.account_begin(&tx, &account(11)).unwrap();
        assert_eq!(found, account(20));
        assert!(store.account_begin(&tx, &account(21)).is_none());
    }

    #[test]
    fn pending_seek_by_account_prefix() {
        let store = Store::new();
        let info = PendingInfo {
            source: account(1),
            amount: Amount::raw(5),
            epoch: Epoch::Epoch0,
        };
        let tx = store.tx_begin_write(Writer::Testing);
        store.pending_put(&tx, &PendingKey::new(account(5), BlockHash::from_u64(9)), info);
        drop(tx);

        let tx = store.tx_begin_read();
        let (key, _) = store
            .pending_begin(&tx, &PendingKey::new(account(5), BlockHash::ZERO))
            .unwrap();
        assert_eq!(key.account, account(5));
        assert!(store
            .pending_begin(&tx, &PendingKey::new(account(6), BlockHash::ZERO))
            .is_none());
    }

    #[test]
    fn refresh_if_needed_trips_on_op_count() {
        let store = Store::new();
        let mut tx = store.tx_begin_write(Writer::Testing);
        for i in 0..600u64 {
            store.account_put(&tx, &account(i), sample_info());
        }
        tx.refresh_if_needed();
        assert_eq!(tx.refresh_count(), 1);
        tx.refresh_if_needed();
        assert_eq!(tx.refresh_count(), 1);
    }

    #[test]
    fn version_initialized() {
        let store = Store::new();
        let tx = store.tx_begin_read();
        assert_eq!(store.version(&tx), STORE_VERSION);
    }
}
