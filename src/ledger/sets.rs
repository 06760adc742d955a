use crate::block::SavedBlock;
use crate::numbers::{Account, Amount, BlockHash};
use crate::store::Transaction;

use super::Ledger;

/// Queries over every block the store holds, confirmed or not.
pub struct LedgerAny<'a> {
    pub(super) ledger: &'a Ledger,
}

impl LedgerAny<'_> {
    pub fn block_get(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<SavedBlock> {
        self.ledger.store.block_get(tx, hash)
    }

    pub fn block_exists(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        self.ledger.store.block_exists(tx, hash)
    }

    pub fn block_balance(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<Amount> {
        self.block_get(tx, hash).map(|block| block.balance())
    }

    pub fn block_successor(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<BlockHash> {
        self.ledger.store.block_successor(tx, hash)
    }

    pub fn account_get(
        &self,
        tx: &dyn Transaction,
        account: &Account,
    ) -> Option<crate::store::AccountInfo> {
        self.ledger.store.account_get(tx, account)
    }

    pub fn account_head(&self, tx: &dyn Transaction, account: &Account) -> Option<BlockHash> {
        self.account_get(tx, account).map(|info| info.head)
    }

    pub fn account_balance(&self, tx: &dyn Transaction, account: &Account) -> Option<Amount> {
        self.account_get(tx, account).map(|info| info.balance)
    }

    /// Account that authored `hash`.
    pub fn block_account(&self, tx: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        self.block_get(tx, hash).map(|block| block.account())
    }
}

/// Queries restricted to the cemented prefix of each account chain.
pub struct LedgerConfirmed<'a> {
    pub(super) ledger: &'a Ledger,
}

impl LedgerConfirmed<'_> {
    pub fn block_exists(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        self.ledger.block_confirmed(tx, hash)
    }

    /// Hash of the highest confirmed block, or zero if nothing is cemented.
    pub fn account_frontier(&self, tx: &dyn Transaction, account: &Account) -> BlockHash {
        self.ledger
            .store
            .confirmation_height_get(tx, account)
            .map(|info| info.frontier)
            .unwrap_or(BlockHash::ZERO)
    }

    pub fn account_height(&self, tx: &dyn Transaction, account: &Account) -> u64 {
        self.ledger
            .store
            .confirmation_height_get(tx, account)
            .map(|info| info.height)
            .unwrap_or(0)
    }
}
