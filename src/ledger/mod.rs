mod sets;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::block::{Block, BlockDetails, BlockSideband, BlockType, SavedBlock};
use crate::crypto::work_validate;
use crate::epoch::{Epoch, Epochs};
use crate::errors::{CoreError, CoreResult};
use crate::network_params::LedgerConstants;
use crate::numbers::{Account, Amount, BlockHash};
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::{
    AccountInfo, ConfirmationHeightInfo, PendingInfo, PendingKey, Store, Transaction,
    WriteTransaction, Writer,
};
use crate::utils::seconds_since_epoch;

pub use sets::{LedgerAny, LedgerConfirmed};

/// Outcome of `Ledger::process`. Check order is normative: work first,
/// signature second, structural third, semantic last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    Progress,
    Old,
    Fork,
    GapPrevious,
    GapSource,
    GapEpochOpenPending,
    BadSignature,
    NegativeSpend,
    Unreceivable,
    BlockPosition,
    InsufficientWork,
    RepresentativeMismatch,
    BalanceMismatch,
    OpenedBurnAccount,
}

impl BlockStatus {
    pub fn as_stat_detail(self) -> StatDetail {
        match self {
            BlockStatus::Progress => StatDetail::Progress,
            BlockStatus::Old => StatDetail::Old,
            BlockStatus::Fork => StatDetail::Fork,
            BlockStatus::GapPrevious => StatDetail::GapPrevious,
            BlockStatus::GapSource => StatDetail::GapSource,
            BlockStatus::GapEpochOpenPending => StatDetail::GapEpochOpenPending,
            BlockStatus::BadSignature => StatDetail::BadSignature,
            BlockStatus::NegativeSpend => StatDetail::NegativeSpend,
            BlockStatus::Unreceivable => StatDetail::Unreceivable,
            BlockStatus::BlockPosition => StatDetail::BlockPosition,
            BlockStatus::InsufficientWork => StatDetail::InsufficientWork,
            BlockStatus::RepresentativeMismatch => StatDetail::RepresentativeMismatch,
            BlockStatus::BalanceMismatch => StatDetail::BalanceMismatch,
            BlockStatus::OpenedBurnAccount => StatDetail::OpenedBurnAccount,
        }
    }
}

/// Cached representative weights, kept in sync with the `rep_weight` table.
struct RepWeights {
    weights: Mutex<HashMap<Account, Amount>>,
}

impl RepWeights {
    fn new() -> Self {
        Self {
            weights: Mutex::new(HashMap::new()),
        }
    }

    fn weight(&self, representative: &Account) -> Amount {
        self.weights
            .lock()
            .get(representative)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Seeds the cache from a persisted weight without touching the table.
    fn prime(&self, representative: &Account, weight: Amount) {
        if !weight.is_zero() {
            self.weights.lock().insert(*representative, weight);
        }
    }

    fn adjust(
        &self,
        store: &Store,
        tx: &WriteTransaction,
        representative: &Account,
        add: Amount,
        sub: Amount,
    ) {
        let mut weights = self.weights.lock();
        let current = weights.get(representative).copied().unwrap_or(Amount::ZERO);
        let updated = current.saturating_add(add).saturating_sub(sub);
        if updated.is_zero() {
            weights.remove(representative);
        } else {
            weights.insert(*representative, updated);
        }
        store.rep_weight_put(tx, representative, updated);
    }
}

/// Account-chain ledger. Applies and reverses blocks against the store and
/// answers the queries the schedulers and the backlog depend on.
pub struct Ledger {
    pub(crate) store: Store,
    pub constants: LedgerConstants,
    stats: Arc<Stats>,
    rep_weights: RepWeights,
    backlog: AtomicU64,
}

/// Everything validation resolved, consumed by the apply step.
struct ApplyPlan {
    account: Account,
    old_info: Option<AccountInfo>,
    new_balance: Amount,
    representative: Account,
    epoch: Epoch,
    source_epoch: Epoch,
    height: u64,
    is_send: bool,
    is_receive: bool,
    is_epoch: bool,
    /// Receivable entry consumed by this block.
    pending_taken: Option<PendingKey>,
    /// Receivable entry created by this block.
    pending_added: Option<(PendingKey, PendingInfo)>,
}

impl Ledger {
    pub fn new(store: Store, constants: LedgerConstants, stats: Arc<Stats>) -> CoreResult<Self> {
        let ledger = Self {
            store,
            constants,
            stats,
            rep_weights: RepWeights::new(),
            backlog: AtomicU64::new(0),
        };
        ledger.initialize()?;
        Ok(ledger)
    }

    fn initialize(&self) -> CoreResult<()> {
        let mut tx = self.store.tx_begin_write(Writer::Generic);
        if self.store.account_count(&tx) == 0 {
            let genesis = self.constants.genesis_block.clone();
            let hash = genesis.hash();
            let account = self.constants.genesis_account;
            let sideband = BlockSideband {
                successor: BlockHash::ZERO,
                account,
                balance: self.constants.genesis_amount,
                height: 1,
                // Zero timestamp gives genesis the highest possible priority
                timestamp: 0,
                details: BlockDetails::new(Epoch::Epoch0, false, false, false),
                source_epoch: Epoch::Epoch0,
            };
            self.store
                .block_put(&tx, &hash, SavedBlock::new(genesis, sideband));
            self.store.account_put(
                &tx,
                &account,
                AccountInfo {
                    head: hash,
                    open_block: hash,
                    representative: account,
                    balance: self.constants.genesis_amount,
                    modified: seconds_since_epoch(),
                    block_count: 1,
                    epoch: Epoch::Epoch0,
                },
            );
            // Genesis starts cemented
            self.store.confirmation_height_put(
                &tx,
                &account,
                ConfirmationHeightInfo {
                    height: 1,
                    frontier: hash,
                },
            );
            self.rep_weights.adjust(
                &self.store,
                &tx,
                &account,
                self.constants.genesis_amount,
                Amount::ZERO,
            );
        } else {
            // Rebuild caches from persisted state
            let mut backlog = 0u64;
            let mut next = Account::ZERO;
            while let Some((account, info)) = self.store.account_begin(&tx, &next) {
                let confirmed = self
                    .store
                    .confirmation_height_get(&tx, &account)
                    .map(|c| c.height)
                    .unwrap_or(0);
                if confirmed > info.block_count {
                    return Err(CoreError::Ledger(format!(
                        "confirmation height above block count for {account}"
                    )));
                }
                backlog += info.block_count - confirmed;
                self.rep_weights.prime(
                    &info.representative,
                    self.store.rep_weight_get(&tx, &info.representative),
                );
                let Some(incremented) = increment(account) else {
                    break;
                };
                next = incremented;
            }
            self.backlog.store(backlog, Ordering::SeqCst);
        }
        drop(tx);
        Ok(())
    }

    pub fn any(&self) -> LedgerAny<'_> {
        LedgerAny { ledger: self }
    }

    pub fn confirmed(&self) -> LedgerConfirmed<'_> {
        LedgerConfirmed { ledger: self }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tx_begin_read(&self) -> crate::store::ReadTransaction {
        self.store.tx_begin_read()
    }

    pub fn tx_begin_write(&self, writer: Writer) -> WriteTransaction {
        self.store.tx_begin_write(writer)
    }

    fn epochs(&self) -> &Epochs {
        &self.constants.epochs
    }

    /// Total unconfirmed blocks across all accounts, cached and maintained on
    /// process, rollback and cement.
    pub fn backlog_count(&self) -> u64 {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Voting weight delegated to `representative`.
    pub fn weight(&self, representative: &Account) -> Amount {
        self.rep_weights.weight(representative)
    }

    pub fn weight_exact(&self, tx: &dyn Transaction, representative: &Account) -> Amount {
        self.store.rep_weight_get(tx, representative)
    }

    /// True iff the block is stored and above its account's confirmation
    /// frontier.
    pub fn unconfirmed_exists(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        match self.store.block_get(tx, hash) {
            Some(block) => {
                let confirmed = self
                    .store
                    .confirmation_height_get(tx, &block.account())
                    .map(|info| info.height)
                    .unwrap_or(0);
                block.height() > confirmed
            }
            None => false,
        }
    }

    pub fn block_confirmed(&self, tx: &dyn Transaction, hash: &BlockHash) -> bool {
        if self.store.pruned_exists(tx, hash) {
            return true;
        }
        match self.store.block_get(tx, hash) {
            Some(block) => {
                let confirmed = self
                    .store
                    .confirmation_height_get(tx, &block.account())
                    .map(|info| info.height)
                    .unwrap_or(0);
                block.height() <= confirmed
            }
            None => false,
        }
    }

    /// True iff the block's previous (if any) and source (if it receives)
    /// are both cemented.
    pub fn dependents_confirmed(&self, tx: &dyn Transaction, block: &SavedBlock) -> bool {
        let previous_ok = {
            let previous = block.block.previous();
            previous.is_zero() || self.block_confirmed(tx, &previous)
        };
        let source_ok = match block.source() {
            Some(source) => self.block_confirmed(tx, &source),
            None => true,
        };
        previous_ok && source_ok
    }

    /// Priority inputs used by the scheduler buckets and the bounded
    /// backlog. The block does not need to be the canonical head: forks of
    /// the same root compute identical results.
    pub fn block_priority(&self, tx: &dyn Transaction, block: &Block) -> (Amount, u64) {
        let saved = self.store.block_get(tx, &block.hash());
        let own_timestamp = saved
            .as_ref()
            .map(|block| block.sideband.timestamp)
            .unwrap_or(0);
        let balance = block
            .balance_field()
            .or_else(|| saved.as_ref().map(|block| block.balance()))
            .unwrap_or(Amount::ZERO);

        // Legacy receives and opens take their own timestamp and balance
        if matches!(block.block_type(), BlockType::Receive | BlockType::Open) {
            return (balance, own_timestamp);
        }

        let previous = block.previous();
        if previous.is_zero() {
            return (balance, own_timestamp);
        }
        match self.store.block_get(tx, &previous) {
            Some(previous_block) => (
                balance.max(previous_block.balance()),
                previous_block.sideband.timestamp,
            ),
            None => (balance, own_timestamp),
        }
    }

    /*
     * process
     */

    pub fn process(
        &self,
        tx: &mut WriteTransaction,
        block: &Arc<Block>,
    ) -> Result<SavedBlock, BlockStatus> {
        let plan = self.validate(tx, block)?;
        Ok(self.apply(tx, block, plan))
    }

    fn validate(&self, tx: &WriteTransaction, block: &Block) -> Result<ApplyPlan, BlockStatus> {
        let hash = block.hash();
        if self.store.block_exists(tx, &hash) {
            return Err(BlockStatus::Old);
        }
        if !work_validate(self.constants.work_threshold, &block.root(), block.work()) {
            return Err(BlockStatus::InsufficientWork);
        }
        match block {
            Block::State(_) => self.validate_state(tx, block, hash),
            Block::Open(_) => self.validate_open(tx, block, hash),
            _ => self.validate_legacy(tx, block, hash),
        }
    }

    fn validate_state(
        &self,
        tx: &WriteTransaction,
        block: &Block,
        hash: BlockHash,
    ) -> Result<ApplyPlan, BlockStatus> {
        let Block::State(state) = block else {
            unreachable!()
        };
        let account = state.account;

        let epoch_link = self.epochs().is_epoch_link(&state.link);
        let signed_by_account = block.valid_signature(&account);
        let signed_by_epoch_signer = epoch_link
            && self
                .epochs()
                .signer(&state.link)
                .map(|signer| block.valid_signature(&signer))
                .unwrap_or(false);
        if !signed_by_account && !signed_by_epoch_signer {
            return Err(BlockStatus::BadSignature);
        }
        if account.is_zero() {
            return Err(BlockStatus::OpenedBurnAccount);
        }

        let old_info = self.store.account_get(tx, &account);
        let previous_block = if state.previous.is_zero() {
            if old_info.is_some() {
                return Err(BlockStatus::Fork);
            }
            None
        } else {
            let Some(info) = &old_info else {
                return Err(BlockStatus::GapPrevious);
            };
            let Some(previous) = self.store.block_get(tx, &state.previous) else {
                return Err(BlockStatus::GapPrevious);
            };
            if info.head != state.previous {
                return Err(BlockStatus::Fork);
            }
            Some(previous)
        };

        let previous_balance = previous_block
            .as_ref()
            .map(|block| block.balance())
            .unwrap_or(Amount::ZERO);
        let previous_epoch = old_info.map(|info| info.epoch).unwrap_or(Epoch::Epoch0);

        let is_epoch = epoch_link && state.balance == previous_balance;
        if is_epoch {
            let target = self.epochs().epoch(&state.link).expect("checked epoch link");
            if !Epochs::is_sequential(previous_epoch, target) {
                return Err(BlockStatus::BlockPosition);
            }
            if let Some(info) = &old_info {
                if state.representative != info.representative {
                    return Err(BlockStatus::RepresentativeMismatch);
                }
            } else {
                // Epoch open: only valid for accounts with receivable funds
                if !state.representative.is_zero() {
                    return Err(BlockStatus::RepresentativeMismatch);
                }
                let probe = PendingKey::new(account, BlockHash::ZERO);
                let has_pending = self
                    .store
                    .pending_begin(tx, &probe)
                    .map(|(key, _)| key.account == account)
                    .unwrap_or(false);
                if !has_pending {
                    return Err(BlockStatus::GapEpochOpenPending);
                }
            }
            return Ok(ApplyPlan {
                account,
                old_info,
                new_balance: state.balance,
                representative: state.representative,
                epoch: target,
                source_epoch: Epoch::Epoch0,
                height: old_info.map(|info| info.block_count).unwrap_or(0) + 1,
                is_send: false,
                is_receive: false,
                is_epoch: true,
                pending_taken: None,
                pending_added: None,
            });
        }

        // Regular state block must be signed by its own account
        if !signed_by_account {
            return Err(BlockStatus::BadSignature);
        }

        let height = old_info.map(|info| info.block_count).unwrap_or(0) + 1;
        if state.balance < previous_balance {
            // Send
            let amount = previous_balance
                .checked_sub(state.balance)
                .expect("balance ordering checked");
            let destination = state.link.as_account();
            let key = PendingKey::new(destination, hash);
            let info = PendingInfo {
                source: account,
                amount,
                epoch: previous_epoch,
            };
            Ok(ApplyPlan {
                account,
                old_info,
                new_balance: state.balance,
                representative: state.representative,
                epoch: previous_epoch,
                source_epoch: Epoch::Epoch0,
                height,
                is_send: true,
                is_receive: false,
                is_epoch: false,
                pending_taken: None,
                pending_added: Some((key, info)),
            })
        } else if state.link.is_zero() {
            // Representative change (or no-op)
            if old_info.is_none() {
                return Err(BlockStatus::GapPrevious);
            }
            Ok(ApplyPlan {
                account,
                old_info,
                new_balance: state.balance,
                representative: state.representative,
                epoch: previous_epoch,
                source_epoch: Epoch::Epoch0,
                height,
                is_send: false,
                is_receive: false,
                is_epoch: false,
                pending_taken: None,
                pending_added: None,
            })
        } else {
            // Receive
            let source = state.link.as_block_hash();
            if !self.store.block_exists(tx, &source) && !self.store.pruned_exists(tx, &source) {
                return Err(BlockStatus::GapSource);
            }
            let key = PendingKey::new(account, source);
            let Some(pending) = self.store.pending_get(tx, &key) else {
                return Err(BlockStatus::Unreceivable);
            };
            let expected = previous_balance.checked_add(pending.amount);
            if expected != Some(state.balance) {
                return Err(BlockStatus::BalanceMismatch);
            }
            Ok(ApplyPlan {
                account,
                old_info,
                new_balance: state.balance,
                representative: state.representative,
                epoch: previous_epoch,
                source_epoch: pending.epoch,
                height,
                is_send: false,
                is_receive: true,
                is_epoch: false,
                pending_taken: Some(key),
                pending_added: None,
            })
        }
    }

    fn validate_open(
        &self,
        tx: &WriteTransaction,
        block: &Block,
        _hash: BlockHash,
    ) -> Result<ApplyPlan, BlockStatus> {
        let Block::Open(open) = block else {
            unreachable!()
        };
        let account = open.account;
        if !block.valid_signature(&account) {
            return Err(BlockStatus::BadSignature);
        }
        if account.is_zero() {
            return Err(BlockStatus::OpenedBurnAccount);
        }
        if self.store.account_get(tx, &account).is_some() {
            return Err(BlockStatus::Fork);
        }
        if !self.store.block_exists(tx, &open.source) {
            return Err(BlockStatus::GapSource);
        }
        let key = PendingKey::new(account, open.source);
        let Some(pending) = self.store.pending_get(tx, &key) else {
            return Err(BlockStatus::Unreceivable);
        };
        // Funds sent under an upgraded epoch cannot be received legacy-style
        if pending.epoch > Epoch::Epoch0 {
            return Err(BlockStatus::Unreceivable);
        }
        Ok(ApplyPlan {
            account,
            old_info: None,
            new_balance: pending.amount,
            representative: open.representative,
            epoch: Epoch::Epoch0,
            source_epoch: pending.epoch,
            height: 1,
            is_send: false,
            is_receive: true,
            is_epoch: false,
            pending_taken: Some(key),
            pending_added: None,
        })
    }

    fn validate_legacy(
        &self,
        tx: &WriteTransaction,
        block: &Block,
        hash: BlockHash,
    ) -> Result<ApplyPlan, BlockStatus> {
        let previous_hash = block.previous();
        let Some(previous) = self.store.block_get(tx, &previous_hash) else {
            return Err(BlockStatus::GapPrevious);
        };
        let account = previous.account();
        // Legacy blocks cannot extend a state-block chain
        if previous.block.block_type() == BlockType::State {
            return Err(BlockStatus::BlockPosition);
        }
        let info = self
            .store
            .account_get(tx, &account)
            .expect("stored chain has account info");
        if info.epoch > Epoch::Epoch0 {
            return Err(BlockStatus::BlockPosition);
        }
        if !block.valid_signature(&account) {
            return Err(BlockStatus::BadSignature);
        }
        if info.head != previous_hash {
            return Err(BlockStatus::Fork);
        }

        let height = info.block_count + 1;
        match block {
            Block::Send(send) => {
                if send.balance >= previous.balance() {
                    return Err(BlockStatus::NegativeSpend);
                }
                let amount = previous
                    .balance()
                    .checked_sub(send.balance)
                    .expect("balance ordering checked");
                let key = PendingKey::new(send.destination, hash);
                let pending = PendingInfo {
                    source: account,
                    amount,
                    epoch: Epoch::Epoch0,
                };
                Ok(ApplyPlan {
                    account,
                    old_info: Some(info),
                    new_balance: send.balance,
                    representative: info.representative,
                    epoch: Epoch::Epoch0,
                    source_epoch: Epoch::Epoch0,
                    height,
                    is_send: true,
                    is_receive: false,
                    is_epoch: false,
                    pending_taken: None,
                    pending_added: Some((key, pending)),
                })
            }
            Block::Receive(receive) => {
                if !self.store.block_exists(tx, &receive.source) {
                    return Err(BlockStatus::GapSource);
                }
                let key = PendingKey::new(account, receive.source);
                let Some(pending) = self.store.pending_get(tx, &key) else {
                    return Err(BlockStatus::Unreceivable);
                };
                if pending.epoch > Epoch::Epoch0 {
                    return Err(BlockStatus::Unreceivable);
                }
                let Some(balance) = info.balance.checked_add(pending.amount) else {
                    return Err(BlockStatus::BalanceMismatch);
                };
                Ok(ApplyPlan {
                    account,
                    old_info: Some(info),
                    new_balance: balance,
                    representative: info.representative,
                    epoch: Epoch::Epoch0,
                    source_epoch: pending.epoch,
                    height,
                    is_send: false,
                    is_receive: true,
                    is_epoch: false,
                    pending_taken: Some(key),
                    pending_added: None,
                })
            }
            Block::Change(change) => Ok(ApplyPlan {
                account,
                old_info: Some(info),
                new_balance: info.balance,
                representative: change.representative,
                epoch: Epoch::Epoch0,
                source_epoch: Epoch::Epoch0,
                height,
                is_send: false,
                is_receive: false,
                is_epoch: false,
                pending_taken: None,
                pending_added: None,
            }),
            _ => unreachable!("send, receive and change are the only legacy chain extensions"),
        }
    }

    fn apply(&self, tx: &mut WriteTransaction, block: &Arc<Block>, plan: ApplyPlan) -> SavedBlock {
        let hash = block.hash();
        let now = seconds_since_epoch();
        let sideband = BlockSideband {
            successor: BlockHash::ZERO,
            account: plan.account,
            balance: plan.new_balance,
            height: plan.height,
            timestamp: now,
            details: BlockDetails::new(plan.epoch, plan.is_send, plan.is_receive, plan.is_epoch),
            source_epoch: plan.source_epoch,
        };
        let saved = SavedBlock::new(block.clone(), sideband);
        self.store.block_put(tx, &hash, saved.clone());

        let previous = block.previous();
        if !previous.is_zero() {
            self.store.block_successor_set(tx, &previous, hash);
        }

        if let Some(key) = &plan.pending_taken {
            self.store.pending_del(tx, key);
        }
        if let Some((key, info)) = &plan.pending_added {
            self.store.pending_put(tx, key, *info);
        }

        let open_block = plan
            .old_info
            .map(|info| info.open_block)
            .unwrap_or(hash);
        self.store.account_put(
            tx,
            &plan.account,
            AccountInfo {
                head: hash,
                open_block,
                representative: plan.representative,
                balance: plan.new_balance,
                modified: now,
                block_count: plan.height,
                epoch: plan.epoch,
            },
        );

        // Move delegated weight between representatives
        if let Some(old) = &plan.old_info {
            self.rep_weights.adjust(
                &self.store,
                tx,
                &old.representative,
                Amount::ZERO,
                old.balance,
            );
        }
        self.rep_weights
            .adjust(&self.store, tx, &plan.representative, plan.new_balance, Amount::ZERO);

        self.backlog.fetch_add(1, Ordering::SeqCst);
        tx.count_op();
        saved
    }

    /*
     * rollback
     */

    /// Reverses blocks in height-descending order from the account's head
    /// down to and including `hash`, returning every reversed block. Fails if
    /// `hash` is already cemented.
    pub fn rollback(
        &self,
        tx: &mut WriteTransaction,
        hash: &BlockHash,
    ) -> CoreResult<Vec<SavedBlock>> {
        let Some(target) = self.store.block_get(tx, hash) else {
            return Err(CoreError::Ledger(format!("rollback target missing: {hash}")));
        };
        let account = target.account();
        let confirmed = self
            .store
            .confirmation_height_get(tx, &account)
            .map(|info| info.height)
            .unwrap_or(0);
        if target.height() <= confirmed {
            return Err(CoreError::Ledger(format!(
                "rollback target already cemented: {hash}"
            )));
        }

        let info = self
            .store
            .account_get(tx, &account)
            .ok_or_else(|| CoreError::Ledger(format!("missing account info for {account}")))?;

        let mut rolled_back = Vec::new();
        let mut head = info.head;
        loop {
            let block = self
                .store
                .block_get(tx, &head)
                .ok_or_else(|| CoreError::Ledger(format!("broken chain at {head}")))?;
            let done = block.hash() == *hash;
            self.rollback_one(tx, &block)?;
            head = block.block.previous();
            rolled_back.push(block);
            if done {
                break;
            }
            tx.refresh_if_needed();
        }
        debug!(
            target: "ledger",
            account = %account,
            count = rolled_back.len(),
            "rolled back chain segment"
        );
        Ok(rolled_back)
    }

    fn rollback_one(&self, tx: &WriteTransaction, block: &SavedBlock) -> CoreResult<()> {
        let hash = block.hash();
        let account = block.account();
        let previous_hash = block.block.previous();

        if let Some(destination) = block.destination() {
            self.store
                .pending_del(tx, &PendingKey::new(destination, hash));
        }
        if let Some(source) = block.source() {
            let source_block = self.store.block_get(tx, &source).ok_or_else(|| {
                CoreError::Ledger(format!("source missing while reversing {hash}"))
            })?;
            let previous_balance = if previous_hash.is_zero() {
                Amount::ZERO
            } else {
                self.any()
                    .block_balance(tx, &previous_hash)
                    .unwrap_or(Amount::ZERO)
            };
            let amount = block
                .balance()
                .checked_sub(previous_balance)
                .unwrap_or(Amount::ZERO);
            self.store.pending_put(
                tx,
                &PendingKey::new(account, source),
                PendingInfo {
                    source: source_block.account(),
                    amount,
                    epoch: block.sideband.source_epoch,
                },
            );
        }

        self.rep_weights.adjust(
            &self.store,
            tx,
            &self.representative_of(tx, block),
            Amount::ZERO,
            block.balance(),
        );

        self.store.block_del(tx, &hash);
        if previous_hash.is_zero() {
            self.store.account_del(tx, &account);
            self.store.confirmation_height_del(tx, &account);
        } else {
            self.store
                .block_successor_set(tx, &previous_hash, BlockHash::ZERO);
            let previous = self.store.block_get(tx, &previous_hash).ok_or_else(|| {
                CoreError::Ledger(format!("previous missing while reversing {hash}"))
            })?;
            let representative = self.representative_of(tx, &previous);
            let open_block = self
                .store
                .account_get(tx, &account)
                .map(|info| info.open_block)
                .unwrap_or(previous_hash);
            self.store.account_put(
                tx,
                &account,
                AccountInfo {
                    head: previous_hash,
                    open_block,
                    representative,
                    balance: previous.balance(),
                    modified: seconds_since_epoch(),
                    block_count: previous.height(),
                    epoch: previous.sideband.details.epoch,
                },
            );
            self.rep_weights
                .adjust(&self.store, tx, &representative, previous.balance(), Amount::ZERO);
        }
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Representative in effect at `block`, walking back through blocks that
    /// do not carry the field.
    fn representative_of(&self, tx: &dyn Transaction, block: &SavedBlock) -> Account {
        let mut current = block.clone();
        loop {
            if let Some(representative) = current.block.representative_field() {
                return representative;
            }
            let previous = current.block.previous();
            if previous.is_zero() {
                return Account::ZERO;
            }
            match self.store.block_get(tx, &previous) {
                Some(block) => current = block,
                None => return Account::ZERO,
            }
        }
    }

    /*
     * cementing
     */

    /// Advances the confirmation frontier of `target`'s account up to and
    /// including `target`, returning the newly cemented blocks in ascending
    /// height order. No-op when the target is already cemented.
    pub fn confirm(&self, tx: &mut WriteTransaction, target: BlockHash) -> Vec<SavedBlock> {
        let Some(target_block) = self.store.block_get(tx, &target) else {
            return Vec::new();
        };
        let account = target_block.account();
        let conf = self
            .store
            .confirmation_height_get(tx, &account)
            .unwrap_or_default();
        if conf.height >= target_block.height() {
            self.stats
                .inc(StatType::ConfirmingSet, StatDetail::AlreadyCemented);
            return Vec::new();
        }

        let mut chain = Vec::new();
        let mut current = target;
        while !current.is_zero() && current != conf.frontier {
            match self.store.block_get(tx, &current) {
                Some(block) => {
                    current = block.block.previous();
                    chain.push(block);
                }
                None => break,
            }
            tx.refresh_if_needed();
        }
        chain.reverse();

        self.store.confirmation_height_put(
            tx,
            &account,
            ConfirmationHeightInfo {
                height: target_block.height(),
                frontier: target,
            },
        );
        self.backlog
            .fetch_sub(chain.len() as u64, Ordering::SeqCst);
        self.stats
            .add(StatType::ConfirmingSet, StatDetail::Cemented, chain.len() as u64);
        chain
    }
}

fn increment(account: Account) -> Option<Account> {
    let mut bytes = *account.as_bytes();
    for i in (0..32).rev() {
        let (value, overflow) = bytes[i].overflowing_add(1);
        bytes[i] = value;
        if !overflow {
            return Some(Account::from_bytes(bytes));
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::crypto::{work_generate, KeyPair};
    use crate::network_params::NetworkParams;
    use crate::numbers::{Link, Root};

    /// Store + ledger against a fresh dev profile.
    pub struct LedgerContext {
        pub params: NetworkParams,
        pub stats: Arc<Stats>,
        pub ledger: Ledger,
    }

    impl LedgerContext {
        pub fn new() -> Self {
            let params = NetworkParams::dev();
            let stats = Arc::new(Stats::new());
            let ledger = Ledger::new(Store::new(), params.ledger.clone(), stats.clone())
                .expect("empty store initializes");
            Self {
                params,
                stats,
                ledger,
            }
        }

        pub fn genesis_key(&self) -> &KeyPair {
            &self.params.ledger.genesis_key
        }

        pub fn genesis_hash(&self) -> BlockHash {
            self.params.ledger.genesis_block.hash()
        }

        pub fn work(&self, root: Root) -> u64 {
            work_generate(self.params.ledger.work_threshold, &root)
        }

        /// State send from genesis leaving `remaining` raw behind.
        pub fn genesis_send(&self, destination: &KeyPair, remaining: Amount) -> Arc<Block> {
            let genesis = self.genesis_key();
            let tx = self.ledger.tx_begin_read();
            let head = self
                .ledger
                .any()
                .account_head(&tx, &genesis.account())
                .expect("genesis account exists");
            drop(tx);
            Arc::new(
                BlockBuilder::state()
                    .account(genesis.account())
                    .previous(head)
                    .representative(genesis.account())
                    .balance(remaining)
                    .link(Link::from(destination.account()))
                    .work(self.work(Root::from(head)))
                    .sign(genesis.raw(), &genesis.account()),
            )
        }

        /// State open receiving `source`.
        pub fn open_account(
            &self,
            key: &KeyPair,
            source: BlockHash,
            balance: Amount,
        ) -> Arc<Block> {
            Arc::new(
                BlockBuilder::state()
                    .account(key.account())
                    .previous(BlockHash::ZERO)
                    .representative(key.account())
                    .balance(balance)
                    .link(Link::from(source))
                    .work(self.work(Root::from(key.account())))
                    .sign(key.raw(), &key.account()),
            )
        }

        pub fn process(&self, block: &Arc<Block>) -> Result<SavedBlock, BlockStatus> {
            let mut tx = self.ledger.tx_begin_write(Writer::Testing);
            self.ledger.process(&mut tx, block)
        }

        pub fn confirm(&self, hash: BlockHash) -> Vec<SavedBlock> {
            let mut tx = self.ledger.tx_begin_write(Writer::Testing);
            self.ledger.confirm(&mut tx, hash)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::LedgerContext;
    use super::*;
    use crate::block::BlockBuilder;
    use crate::crypto::KeyPair;
    use crate::numbers::{Link, Root};

    #[test]
    fn genesis_initialized_and_cemented() {
        let ctx = LedgerContext::new();
        let tx = ctx.ledger.tx_begin_read();
        let genesis = ctx.params.ledger.genesis_account;
        let info = ctx.ledger.any().account_get(&tx, &genesis).unwrap();
        assert_eq!(info.block_count, 1);
        assert_eq!(info.balance, Amount::MAX);
        assert_eq!(ctx.ledger.backlog_count(), 0);
        assert!(ctx.ledger.block_confirmed(&tx, &ctx.genesis_hash()));
        assert_eq!(ctx.ledger.weight(&genesis), Amount::MAX);
    }

    #[test]
    fn process_state_send_and_reprocess_is_old() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));

        let saved = ctx.process(&send).unwrap();
        assert!(saved.is_send());
        assert_eq!(saved.height(), 2);
        assert_eq!(ctx.ledger.backlog_count(), 1);

        assert_eq!(ctx.process(&send), Err(BlockStatus::Old));
        // Idempotent: backlog unchanged
        assert_eq!(ctx.ledger.backlog_count(), 1);
    }

    #[test]
    fn send_then_open_receives_funds() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();

        let open = ctx.open_account(&key, send.hash(), Amount::MAX.saturating_sub(Amount::raw(100)));
        let saved = ctx.process(&open).unwrap();
        assert!(saved.is_receive());
        assert_eq!(saved.height(), 1);

        let tx = ctx.ledger.tx_begin_read();
        assert_eq!(
            ctx.ledger.any().account_balance(&tx, &key.account()),
            Some(Amount::MAX.saturating_sub(Amount::raw(100)))
        );
        // Pending entry consumed
        assert!(!ctx
            .ledger
            .store()
            .pending_exists(&tx, &crate::store::PendingKey::new(key.account(), send.hash())));
    }

    #[test]
    fn open_without_send_is_gap_source() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let open = ctx.open_account(&key, BlockHash::from_u64(12345), Amount::raw(1));
        assert_eq!(ctx.process(&open), Err(BlockStatus::GapSource));
    }

    #[test]
    fn receive_balance_mismatch_rejected() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();

        // Claims more than was sent
        let open = ctx.open_account(&key, send.hash(), Amount::MAX);
        assert_eq!(ctx.process(&open), Err(BlockStatus::BalanceMismatch));
    }

    #[test]
    fn fork_detected_on_competing_successor() {
        let ctx = LedgerContext::new();
        let key1 = KeyPair::generate();
        let key2 = KeyPair::generate();
        let send_a = ctx.genesis_send(&key1, Amount::raw(100));
        ctx.process(&send_a).unwrap();

        let genesis = ctx.genesis_key();
        let fork = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::raw(150))
                .link(Link::from(key2.account()))
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&fork), Err(BlockStatus::Fork));
    }

    #[test]
    fn bad_signature_rejected() {
        let ctx = LedgerContext::new();
        let genesis = ctx.genesis_key();
        let stranger = KeyPair::generate();
        let forged = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::raw(0))
                .link(Link::from(stranger.account()))
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(stranger.raw(), &stranger.account()),
        );
        assert_eq!(ctx.process(&forged), Err(BlockStatus::BadSignature));
    }

    #[test]
    fn insufficient_work_rejected_before_signature() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let genesis = ctx.genesis_key();
        let block = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::raw(0))
                .link(Link::from(key.account()))
                .work(0)
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&block), Err(BlockStatus::InsufficientWork));
    }

    #[test]
    fn legacy_send_negative_spend() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let genesis = ctx.genesis_key();
        let send = Arc::new(
            BlockBuilder::send()
                .previous(ctx.genesis_hash())
                .destination(key.account())
                .balance(Amount::MAX)
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&send), Err(BlockStatus::NegativeSpend));
    }

    #[test]
    fn rollback_restores_previous_state() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();
        assert_eq!(ctx.ledger.backlog_count(), 1);

        let mut tx = ctx.ledger.tx_begin_write(Writer::Testing);
        let rolled_back = ctx.ledger.rollback(&mut tx, &send.hash()).unwrap();
        drop(tx);
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].hash(), send.hash());
        assert_eq!(ctx.ledger.backlog_count(), 0);

        let tx = ctx.ledger.tx_begin_read();
        let genesis = ctx.params.ledger.genesis_account;
        let info = ctx.ledger.any().account_get(&tx, &genesis).unwrap();
        assert_eq!(info.head, ctx.genesis_hash());
        assert_eq!(info.balance, Amount::MAX);
        assert_eq!(ctx.ledger.weight(&genesis), Amount::MAX);
        assert!(!ctx.ledger.any().block_exists(&tx, &send.hash()));
        // Pending entry reversed as well
        assert!(!ctx
            .ledger
            .store()
            .pending_exists(&tx, &crate::store::PendingKey::new(key.account(), send.hash())));
    }

    #[test]
    fn rollback_of_cemented_block_fails() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();
        ctx.confirm(send.hash());

        let mut tx = ctx.ledger.tx_begin_write(Writer::Testing);
        assert!(ctx.ledger.rollback(&mut tx, &send.hash()).is_err());
    }

    #[test]
    fn rollback_reverses_whole_segment_above_target() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let genesis = ctx.genesis_key();
        let send1 = ctx.genesis_send(&key, Amount::raw(200));
        ctx.process(&send1).unwrap();
        let send2 = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(send1.hash())
                .representative(genesis.account())
                .balance(Amount::raw(100))
                .link(Link::from(key.account()))
                .work(ctx.work(Root::from(send1.hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        ctx.process(&send2).unwrap();

        let mut tx = ctx.ledger.tx_begin_write(Writer::Testing);
        let rolled_back = ctx.ledger.rollback(&mut tx, &send1.hash()).unwrap();
        drop(tx);
        // Newest first
        assert_eq!(rolled_back.len(), 2);
        assert_eq!(rolled_back[0].hash(), send2.hash());
        assert_eq!(rolled_back[1].hash(), send1.hash());
        assert_eq!(ctx.ledger.backlog_count(), 0);
    }

    #[test]
    fn confirm_advances_frontier_and_backlog() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();
        assert_eq!(ctx.ledger.backlog_count(), 1);

        let cemented = ctx.confirm(send.hash());
        assert_eq!(cemented.len(), 1);
        assert_eq!(ctx.ledger.backlog_count(), 0);

        let tx = ctx.ledger.tx_begin_read();
        assert!(ctx.ledger.block_confirmed(&tx, &send.hash()));
        assert!(!ctx.ledger.unconfirmed_exists(&tx, &send.hash()));
        // Second confirm is a no-op
        drop(tx);
        assert!(ctx.confirm(send.hash()).is_empty());
    }

    #[test]
    fn height_never_exceeds_block_count() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();
        ctx.confirm(send.hash());

        let tx = ctx.ledger.tx_begin_read();
        let genesis = ctx.params.ledger.genesis_account;
        let info = ctx.ledger.any().account_get(&tx, &genesis).unwrap();
        let conf = ctx
            .ledger
            .store()
            .confirmation_height_get(&tx, &genesis)
            .unwrap();
        assert!(conf.height <= info.block_count);
        assert_eq!(conf.height, info.block_count);
    }

    #[test]
    fn dependents_confirmed_requires_cemented_links() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        let saved_send = ctx.process(&send).unwrap();

        let tx = ctx.ledger.tx_begin_read();
        // Previous (genesis) is cemented
        assert!(ctx.ledger.dependents_confirmed(&tx, &saved_send));
        drop(tx);

        let open = ctx.open_account(&key, send.hash(), Amount::MAX.saturating_sub(Amount::raw(100)));
        let saved_open = ctx.process(&open).unwrap();
        let tx = ctx.ledger.tx_begin_read();
        // Source send not yet cemented
        assert!(!ctx.ledger.dependents_confirmed(&tx, &saved_open));
        drop(tx);

        ctx.confirm(send.hash());
        let tx = ctx.ledger.tx_begin_read();
        assert!(ctx.ledger.dependents_confirmed(&tx, &saved_open));
    }

    /*
     * block_priority
     */

    #[test]
    fn genesis_priority() {
        let ctx = LedgerContext::new();
        let tx = ctx.ledger.tx_begin_read();
        let (balance, timestamp) = ctx
            .ledger
            .block_priority(&tx, &ctx.params.ledger.genesis_block);
        assert_eq!(balance, Amount::MAX);
        assert_eq!(timestamp, 0);
    }

    #[test]
    fn send_priority_uses_max_balance_and_previous_timestamp() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::raw(100));
        ctx.process(&send).unwrap();

        let tx = ctx.ledger.tx_begin_read();
        let genesis_timestamp = ctx
            .ledger
            .any()
            .block_get(&tx, &ctx.genesis_hash())
            .unwrap()
            .sideband
            .timestamp;
        let (balance, timestamp) = ctx.ledger.block_priority(&tx, &send);
        assert_eq!(balance, Amount::MAX);
        assert_eq!(timestamp, genesis_timestamp);
    }

    #[test]
    fn full_balance_send_priority() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let send = ctx.genesis_send(&key, Amount::ZERO);
        ctx.process(&send).unwrap();

        let tx = ctx.ledger.tx_begin_read();
        let (balance, timestamp) = ctx.ledger.block_priority(&tx, &send);
        assert_eq!(balance, Amount::MAX);
        assert_eq!(timestamp, 0);
    }

    #[test]
    fn sequential_priorities_follow_the_chain() {
        let ctx = LedgerContext::new();
        let key = KeyPair::generate();
        let genesis = ctx.genesis_key();
        let send1 = ctx.genesis_send(&key, Amount::MAX.saturating_sub(Amount::raw(100)));
        let saved_send1 = ctx.process(&send1).unwrap();
        let open = ctx.open_account(&key, send1.hash(), Amount::raw(100));
        let saved_open = ctx.process(&open).unwrap();
        let send2 = Arc::new(
            BlockBuilder::state()
                .account(key.account())
                .previous(open.hash())
                .representative(key.account())
                .balance(Amount::raw(50))
                .link(Link::from(genesis.account()))
                .work(ctx.work(Root::from(open.hash())))
                .sign(key.raw(), &key.account()),
        );
        ctx.process(&send2).unwrap();

        let tx = ctx.ledger.tx_begin_read();
        let (balance1, _) = ctx.ledger.block_priority(&tx, &send1);
        let (balance2, timestamp2) = ctx.ledger.block_priority(&tx, &open);
        let (balance3, timestamp3) = ctx.ledger.block_priority(&tx, &send2);
        assert_eq!(balance1, Amount::MAX);
        assert_eq!(balance2, Amount::raw(100));
        assert_eq!(balance3, Amount::raw(100));
        // Opening account sorts at or after the sending block
        assert!(timestamp2 >= saved_send1.sideband.timestamp);
        assert_eq!(timestamp3, saved_open.sideband.timestamp);
    }

    #[test]
    fn fork_priorities_match_without_canonical_head() {
        let ctx = LedgerContext::new();
        let key1 = KeyPair::generate();
        let key2 = KeyPair::generate();
        let genesis = ctx.genesis_key();

        let send1 = ctx.genesis_send(&key1, Amount::MAX.saturating_sub(Amount::raw(100)));
        let saved_send1 = ctx.process(&send1).unwrap();

        let build_fork = |balance: Amount, destination: &KeyPair| {
            Arc::new(
                BlockBuilder::state()
                    .account(genesis.account())
                    .previous(send1.hash())
                    .representative(genesis.account())
                    .balance(balance)
                    .link(Link::from(destination.account()))
                    .work(ctx.work(Root::from(send1.hash())))
                    .sign(genesis.raw(), &genesis.account()),
            )
        };
        let send2a = build_fork(Amount::MAX.saturating_sub(Amount::raw(200)), &key1);
        let send2b = build_fork(Amount::MAX.saturating_sub(Amount::raw(150)), &key2);

        ctx.process(&send2a).unwrap();
        assert_eq!(ctx.process(&send2b), Err(BlockStatus::Fork));

        let tx = ctx.ledger.tx_begin_read();
        let (balance_a, timestamp_a) = ctx.ledger.block_priority(&tx, &send2a);
        // send2b is not stored, yet computes from the same previous
        let (balance_b, timestamp_b) = ctx.ledger.block_priority(&tx, &send2b);
        drop(tx);

        let mut tx = ctx.ledger.tx_begin_write(Writer::Testing);
        ctx.ledger.rollback(&mut tx, &send2a.hash()).unwrap();
        ctx.ledger.process(&mut tx, &send2b).unwrap();
        drop(tx);

        let tx = ctx.ledger.tx_begin_read();
        let (balance_b2, timestamp_b2) = ctx.ledger.block_priority(&tx, &send2b);
        assert_eq!(balance_a, Amount::MAX.saturating_sub(Amount::raw(100)));
        assert_eq!(balance_b, balance_a);
        assert_eq!(balance_b2, balance_a);
        assert_eq!(timestamp_a, saved_send1.sideband.timestamp);
        assert_eq!(timestamp_b, timestamp_a);
        assert_eq!(timestamp_b2, timestamp_a);
    }

    /*
     * epochs
     */

    #[test]
    fn epoch_upgrade_and_monotonicity() {
        let ctx = LedgerContext::new();
        let genesis = ctx.genesis_key();
        let epochs = &ctx.params.ledger.epochs;
        let link_v1 = epochs.link(Epoch::Epoch1).unwrap();
        let link_v2 = epochs.link(Epoch::Epoch2).unwrap();

        // Skipping straight to epoch 2 is rejected
        let skip = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::MAX)
                .link(link_v2)
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&skip), Err(BlockStatus::BlockPosition));

        let upgrade = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::MAX)
                .link(link_v1)
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        let saved = ctx.process(&upgrade).unwrap();
        assert!(saved.is_epoch());
        assert_eq!(saved.sideband.details.epoch, Epoch::Epoch1);

        let tx = ctx.ledger.tx_begin_read();
        let info = ctx
            .ledger
            .any()
            .account_get(&tx, &genesis.account())
            .unwrap();
        assert_eq!(info.epoch, Epoch::Epoch1);
        drop(tx);

        // Changing the representative inside an epoch block is rejected
        let other = KeyPair::generate();
        let bad_rep = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(upgrade.hash())
                .representative(other.account())
                .balance(Amount::MAX)
                .link(link_v2)
                .work(ctx.work(Root::from(upgrade.hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&bad_rep), Err(BlockStatus::RepresentativeMismatch));
    }

    #[test]
    fn legacy_block_after_epoch_upgrade_rejected() {
        let ctx = LedgerContext::new();
        let genesis = ctx.genesis_key();
        let key = KeyPair::generate();
        let link_v1 = ctx.params.ledger.epochs.link(Epoch::Epoch1).unwrap();
        let upgrade = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::MAX)
                .link(link_v1)
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        ctx.process(&upgrade).unwrap();

        let legacy = Arc::new(
            BlockBuilder::send()
                .previous(upgrade.hash())
                .destination(key.account())
                .balance(Amount::raw(100))
                .work(ctx.work(Root::from(upgrade.hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&legacy), Err(BlockStatus::BlockPosition));
    }

    #[test]
    fn open_burn_account_rejected() {
        let ctx = LedgerContext::new();
        let genesis = ctx.genesis_key();
        let burn = Account::ZERO;
        let send = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(genesis.account())
                .balance(Amount::MAX.saturating_sub(Amount::raw(1)))
                .link(Link::from(burn))
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        ctx.process(&send).unwrap();
        // No key exists for the burn account, so nothing can open it; the
        // ledger also refuses a structurally valid attempt outright.
        let forged = Arc::new(
            BlockBuilder::state()
                .account(burn)
                .previous(BlockHash::ZERO)
                .representative(burn)
                .balance(Amount::raw(1))
                .link(Link::from(send.hash()))
                .work(ctx.work(Root::from(burn)))
                .sign(genesis.raw(), &genesis.account()),
        );
        assert_eq!(ctx.process(&forged), Err(BlockStatus::BadSignature));
    }

    #[test]
    fn weight_moves_with_representative_changes() {
        let ctx = LedgerContext::new();
        let genesis = ctx.genesis_key();
        let rep = KeyPair::generate();
        let change = Arc::new(
            BlockBuilder::state()
                .account(genesis.account())
                .previous(ctx.genesis_hash())
                .representative(rep.account())
                .balance(Amount::MAX)
                .link(Link::ZERO)
                .work(ctx.work(Root::from(ctx.genesis_hash())))
                .sign(genesis.raw(), &genesis.account()),
        );
        ctx.process(&change).unwrap();
        assert_eq!(ctx.ledger.weight(&genesis.account()), Amount::ZERO);
        assert_eq!(ctx.ledger.weight(&rep.account()), Amount::MAX);

        let tx = ctx.ledger.tx_begin_read();
        assert_eq!(ctx.ledger.weight_exact(&tx, &rep.account()), Amount::MAX);
    }
}
