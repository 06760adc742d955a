use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::numbers::{Account, BlockHash};
use crate::stats::{StatDetail, StatType, Stats};

pub const PRIORITY_INITIAL: f64 = 2.0;
pub const PRIORITY_INCREASE: f64 = 2.0;
pub const PRIORITY_DIVIDE: f64 = 2.0;
pub const PRIORITY_MAX: f64 = 32.0;
pub const PRIORITY_CUTOFF: f64 = 0.15;
pub const MAX_FAILS: u32 = 3;

#[derive(Debug, Clone)]
pub struct AccountSetsConfig {
    pub priorities_max: usize,
    pub blocking_max: usize,
    /// An account is not handed out again until this much time has passed
    /// since its last request.
    pub cooldown: Duration,
}

impl Default for AccountSetsConfig {
    fn default() -> Self {
        Self {
            priorities_max: 256 * 1024,
            blocking_max: 256 * 1024,
            cooldown: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PriorityEntry {
    priority: f64,
    fails: u32,
    timestamp: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct BlockingEntry {
    dependency: BlockHash,
    /// Filled in once the dependency's account is discovered; that is what
    /// actually unblocks.
    dependency_account: Account,
    sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityResult {
    pub account: Account,
    pub priority: f64,
    pub fails: u32,
}

/// Total order over positive finite floats via their IEEE bit pattern.
fn priority_bits(priority: f64) -> u64 {
    debug_assert!(priority >= 0.0);
    priority.to_bits()
}

/// The two bootstrap account containers: accounts worth requesting, ordered
/// by a score that decays on failure, and accounts blocked on a missing
/// dependency.
pub struct AccountSets {
    config: AccountSetsConfig,
    stats: Arc<Stats>,

    priorities: HashMap<Account, PriorityEntry>,
    priorities_ordered: BTreeSet<(u64, Account)>,

    blocking: HashMap<Account, BlockingEntry>,
    blocking_by_dependency: BTreeSet<(BlockHash, Account)>,
    blocking_by_dependency_account: BTreeSet<(Account, Account)>,
    blocking_sequence: BTreeMap<u64, Account>,
    next_sequence: u64,
}

impl AccountSets {
    pub fn new(config: AccountSetsConfig, stats: Arc<Stats>) -> Self {
        Self {
            config,
            stats,
            priorities: HashMap::new(),
            priorities_ordered: BTreeSet::new(),
            blocking: HashMap::new(),
            blocking_by_dependency: BTreeSet::new(),
            blocking_by_dependency_account: BTreeSet::new(),
            blocking_sequence: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    fn priority_insert(&mut self, account: Account, entry: PriorityEntry) {
        if let Some(previous) = self.priorities.insert(account, entry) {
            self.priorities_ordered
                .remove(&(priority_bits(previous.priority), account));
        }
        self.priorities_ordered
            .insert((priority_bits(entry.priority), account));
    }

    fn priority_erase(&mut self, account: &Account) -> bool {
        match self.priorities.remove(account) {
            Some(entry) => {
                self.priorities_ordered
                    .remove(&(priority_bits(entry.priority), *account));
                true
            }
            None => false,
        }
    }

    fn blocking_insert(&mut self, account: Account, entry: BlockingEntry) {
        debug_assert!(!self.blocking.contains_key(&account));
        self.blocking_by_dependency.insert((entry.dependency, account));
        self.blocking_by_dependency_account
            .insert((entry.dependency_account, account));
        self.blocking_sequence.insert(entry.sequence, account);
        self.blocking.insert(account, entry);
    }

    fn blocking_erase(&mut self, account: &Account) -> Option<BlockingEntry> {
        let entry = self.blocking.remove(account)?;
        self.blocking_by_dependency.remove(&(entry.dependency, *account));
        self.blocking_by_dependency_account
            .remove(&(entry.dependency_account, *account));
        self.blocking_sequence.remove(&entry.sequence);
        Some(entry)
    }

    /// Bumps an account's score, inserting it when new. Blocked accounts are
    /// not prioritized.
    pub fn priority_up(&mut self, account: &Account) {
        if account.is_zero() {
            return;
        }
        if self.blocked(account) {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::PrioritizeFailed);
            return;
        }
        self.stats
            .inc(StatType::BootstrapAccountSets, StatDetail::Prioritize);

        match self.priorities.get(account).copied() {
            Some(mut entry) => {
                entry.priority = (entry.priority + PRIORITY_INCREASE).min(PRIORITY_MAX);
                entry.fails = 0;
                self.priority_insert(*account, entry);
            }
            None => {
                self.stats
                    .inc(StatType::BootstrapAccountSets, StatDetail::PriorityInsert);
                self.priority_insert(
                    *account,
                    PriorityEntry {
                        priority: PRIORITY_INITIAL,
                        fails: 0,
                        timestamp: None,
                    },
                );
                self.trim_overflow();
            }
        }
    }

    /// Halves an account's score after a failed request, erasing it once the
    /// score or failure count crosses the cutoff.
    pub fn priority_down(&mut self, account: &Account) {
        if account.is_zero() {
            return;
        }
        match self.priorities.get(account).copied() {
            Some(mut entry) => {
                self.stats
                    .inc(StatType::BootstrapAccountSets, StatDetail::Deprioritize);
                let halved = entry.priority / PRIORITY_DIVIDE;
                if entry.fails >= MAX_FAILS
                    || entry.fails as f64 >= entry.priority
                    || halved <= PRIORITY_CUTOFF
                {
                    self.stats
                        .inc(StatType::BootstrapAccountSets, StatDetail::EraseByThreshold);
                    self.priority_erase(account);
                } else {
                    entry.fails += 1;
                    entry.priority = halved;
                    self.priority_insert(*account, entry);
                }
            }
            None => {
                self.stats
                    .inc(StatType::BootstrapAccountSets, StatDetail::DeprioritizeFailed);
            }
        }
    }

    /// Inserts with an explicit score, unless the account is blocked or
    /// already present.
    pub fn priority_set(&mut self, account: &Account, priority: f64) {
        if account.is_zero() {
            return;
        }
        if self.blocked(account) {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::PrioritizeFailed);
            return;
        }
        if !self.priorities.contains_key(account) {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::PrioritySet);
            self.priority_insert(
                *account,
                PriorityEntry {
                    priority,
                    fails: 0,
                    timestamp: None,
                },
            );
            self.trim_overflow();
        }
    }

    /// Moves an account into the blocking set, keyed by the dependency hash
    /// that must arrive first.
    pub fn block(&mut self, account: &Account, dependency: BlockHash) {
        debug_assert!(!account.is_zero());

        if self.priority_erase(account) {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::EraseByBlocking);
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::Block);

            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.blocking_insert(
                *account,
                BlockingEntry {
                    dependency,
                    dependency_account: Account::ZERO,
                    sequence,
                },
            );
            self.trim_overflow();
        } else {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::BlockFailed);
        }
    }

    /// Unblocks when the stored dependency matches (or none was given),
    /// re-inserting the account with the initial priority.
    pub fn unblock(&mut self, account: &Account, hash: Option<BlockHash>) {
        if account.is_zero() {
            return;
        }
        let matches = self
            .blocking
            .get(account)
            .map(|entry| hash.is_none() || hash == Some(entry.dependency))
            .unwrap_or(false);
        if matches {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::Unblock);
            self.blocking_erase(account);
            debug_assert!(!self.priorities.contains_key(account));
            self.priority_insert(
                *account,
                PriorityEntry {
                    priority: PRIORITY_INITIAL,
                    fails: 0,
                    timestamp: None,
                },
            );
            self.trim_overflow();
        } else {
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::UnblockFailed);
        }
    }

    /// Marks the account as requested just now, starting its cooldown.
    pub fn timestamp_set(&mut self, account: &Account) {
        debug_assert!(!account.is_zero());
        if let Some(entry) = self.priorities.get_mut(account) {
            entry.timestamp = Some(Instant::now());
        }
    }

    pub fn timestamp_reset(&mut self, account: &Account) {
        debug_assert!(!account.is_zero());
        if let Some(entry) = self.priorities.get_mut(account) {
            entry.timestamp = None;
        }
    }

    /// Fills in the dependency account for every blocking entry waiting on
    /// `hash` where it is still unknown.
    pub fn dependency_update(&mut self, hash: &BlockHash, dependency_account: Account) {
        debug_assert!(!dependency_account.is_zero());
        let accounts: Vec<Account> = self
            .blocking_by_dependency
            .range((*hash, Account::ZERO)..=(*hash, Account::from_bytes([0xff; 32])))
            .map(|(_, account)| *account)
            .collect();
        let mut updated = false;
        for account in accounts {
            let entry = self.blocking.get(&account).copied().expect("index in sync");
            if entry.dependency_account != dependency_account {
                self.stats
                    .inc(StatType::BootstrapAccountSets, StatDetail::DependencyUpdate);
                self.blocking_by_dependency_account
                    .remove(&(entry.dependency_account, account));
                self.blocking_by_dependency_account
                    .insert((dependency_account, account));
                self.blocking.get_mut(&account).expect("present").dependency_account =
                    dependency_account;
                updated = true;
            }
        }
        if !updated {
            self.stats.inc(
                StatType::BootstrapAccountSets,
                StatDetail::DependencyUpdateFailed,
            );
        }
    }

    /// Re-prioritizes the discovered dependency accounts of blocked entries,
    /// stopping once the priority set is full.
    pub fn sync_dependencies(&mut self) {
        self.stats
            .inc(StatType::BootstrapAccountSets, StatDetail::SyncDependencies);

        let candidates: Vec<Account> = self
            .blocking_by_dependency_account
            .range((
                std::ops::Bound::Excluded((Account::ZERO, Account::from_bytes([0xff; 32]))),
                std::ops::Bound::Unbounded,
            ))
            .map(|(dependency_account, _)| *dependency_account)
            .collect();

        for dependency_account in candidates {
            if self.priorities.len() >= self.config.priorities_max {
                break;
            }
            debug_assert!(!dependency_account.is_zero());
            if !self.blocked(&dependency_account) && !self.prioritized(&dependency_account) {
                self.stats
                    .inc(StatType::BootstrapAccountSets, StatDetail::DependencySynced);
                self.priority_set(&dependency_account, PRIORITY_INITIAL);
            }
        }

        self.trim_overflow();
    }

    fn trim_overflow(&mut self) {
        while self.priorities.len() > self.config.priorities_max {
            // Evict the lowest priority entry
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::PriorityOverflow);
            let Some(&(_, account)) = self.priorities_ordered.iter().next() else {
                break;
            };
            self.priority_erase(&account);
        }
        while self.blocking.len() > self.config.blocking_max {
            // Evict the oldest blocking entry
            self.stats
                .inc(StatType::BootstrapAccountSets, StatDetail::BlockingOverflow);
            let Some((_, account)) = self.blocking_sequence.iter().next().map(|(s, a)| (*s, *a))
            else {
                break;
            };
            self.blocking_erase(&account);
        }
    }

    /// Highest-priority account that is off cooldown and passes `filter`,
    /// or the zero account.
    pub fn next_priority(&self, filter: impl Fn(&Account) -> bool) -> PriorityResult {
        if self.priorities.is_empty() {
            return PriorityResult {
                account: Account::ZERO,
                priority: 0.0,
                fails: 0,
            };
        }
        for (_, account) in self.priorities_ordered.iter().rev() {
            let entry = self.priorities.get(account).expect("index in sync");
            if let Some(timestamp) = entry.timestamp {
                // Still cooling down from the last request
                if timestamp.elapsed() < self.config.cooldown {
                    continue;
                }
            }
            if !filter(account) {
                continue;
            }
            return PriorityResult {
                account: *account,
                priority: entry.priority,
                fails: entry.fails,
            };
        }
        PriorityResult {
            account: Account::ZERO,
            priority: 0.0,
            fails: 0,
        }
    }

    /// First unknown dependency hash passing `filter`, from the subset of
    /// blocking entries whose dependency account has not been discovered.
    pub fn next_blocking(&self, filter: impl Fn(&BlockHash) -> bool) -> BlockHash {
        for (dependency_account, account) in self.blocking_by_dependency_account.iter() {
            if !dependency_account.is_zero() {
                break;
            }
            let entry = self.blocking.get(account).expect("index in sync");
            if filter(&entry.dependency) {
                return entry.dependency;
            }
        }
        BlockHash::ZERO
    }

    pub fn blocked(&self, account: &Account) -> bool {
        self.blocking.contains_key(account)
    }

    pub fn prioritized(&self, account: &Account) -> bool {
        self.priorities.contains_key(account)
    }

    pub fn priority_len(&self) -> usize {
        self.priorities.len()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocking.len()
    }

    pub fn priority_half_full(&self) -> bool {
        self.priorities.len() > self.config.priorities_max / 2
    }

    pub fn blocked_half_full(&self) -> bool {
        self.blocking.len() > self.config.blocking_max / 2
    }

    /// Current score of an unblocked account, zero otherwise.
    pub fn priority(&self, account: &Account) -> f64 {
        if !self.blocked(account) {
            if let Some(entry) = self.priorities.get(account) {
                return entry.priority;
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets() -> AccountSets {
        AccountSets::new(AccountSetsConfig::default(), Arc::new(Stats::new()))
    }

    fn account(n: u64) -> Account {
        Account::from_u64(n)
    }

    #[test]
    fn priority_up_inserts_and_saturates() {
        let mut sets = sets();
        let a = account(1);
        sets.priority_up(&a);
        assert_eq!(sets.priority(&a), PRIORITY_INITIAL);
        for _ in 0..100 {
            sets.priority_up(&a);
        }
        assert_eq!(sets.priority(&a), PRIORITY_MAX);
    }

    #[test]
    fn priority_down_erases_after_enough_failures() {
        let mut sets = sets();
        let a = account(1);
        sets.priority_set(&a, 1.0);
        for _ in 0..10 {
            sets.priority_down(&a);
        }
        assert!(!sets.prioritized(&a));
        assert_eq!(sets.priority(&a), 0.0);
        let next = sets.next_priority(|_| true);
        assert_eq!(next.account, Account::ZERO);
    }

    #[test]
    fn priority_down_decays_before_erasing() {
        let mut sets = sets();
        let a = account(1);
        sets.priority_set(&a, PRIORITY_MAX);
        sets.priority_down(&a);
        assert_eq!(sets.priority(&a), PRIORITY_MAX / PRIORITY_DIVIDE);
    }

    #[test]
    fn block_moves_to_blocking_set() {
        let mut sets = sets();
        let a = account(1);
        let dependency = BlockHash::from_u64(42);
        sets.priority_up(&a);
        sets.block(&a, dependency);
        assert!(sets.blocked(&a));
        assert!(!sets.prioritized(&a));
        // Blocked accounts cannot be prioritized
        sets.priority_up(&a);
        assert!(!sets.prioritized(&a));
    }

    #[test]
    fn unblock_requires_matching_dependency() {
        let mut sets = sets();
        let a = account(1);
        let dependency = BlockHash::from_u64(42);
        sets.priority_up(&a);
        sets.block(&a, dependency);

        sets.unblock(&a, Some(BlockHash::from_u64(43)));
        assert!(sets.blocked(&a));

        sets.unblock(&a, Some(dependency));
        assert!(!sets.blocked(&a));
        assert_eq!(sets.priority(&a), PRIORITY_INITIAL);
    }

    #[test]
    fn next_priority_orders_by_score_and_cooldown() {
        let mut sets = sets();
        let low = account(1);
        let high = account(2);
        sets.priority_set(&low, 1.0);
        sets.priority_set(&high, 10.0);

        let next = sets.next_priority(|_| true);
        assert_eq!(next.account, high);

        sets.timestamp_set(&high);
        let next = sets.next_priority(|_| true);
        assert_eq!(next.account, low);

        sets.timestamp_reset(&high);
        let next = sets.next_priority(|_| true);
        assert_eq!(next.account, high);

        // Caller filter applies after cooldown
        let next = sets.next_priority(|candidate| *candidate != high);
        assert_eq!(next.account, low);
    }

    #[test]
    fn dependency_update_and_next_blocking() {
        let mut sets = sets();
        let a = account(1);
        let b = account(2);
        let dep_a = BlockHash::from_u64(10);
        let dep_b = BlockHash::from_u64(20);
        sets.priority_up(&a);
        sets.priority_up(&b);
        sets.block(&a, dep_a);
        sets.block(&b, dep_b);

        // Both dependencies unknown; next_blocking walks them
        let first = sets.next_blocking(|_| true);
        assert!(first == dep_a || first == dep_b);
        let filtered = sets.next_blocking(|hash| *hash == dep_b);
        assert_eq!(filtered, dep_b);

        let dep_account = account(99);
        sets.dependency_update(&dep_a, dep_account);
        // dep_a is now known and no longer offered
        let remaining = sets.next_blocking(|_| true);
        assert_eq!(remaining, dep_b);
    }

    #[test]
    fn sync_dependencies_prioritizes_known_accounts() {
        let mut sets = sets();
        let a = account(1);
        let dep_hash = BlockHash::from_u64(10);
        let dep_account = account(99);
        sets.priority_up(&a);
        sets.block(&a, dep_hash);
        sets.dependency_update(&dep_hash, dep_account);

        sets.sync_dependencies();
        assert!(sets.prioritized(&dep_account));
        assert_eq!(sets.priority(&dep_account), PRIORITY_INITIAL);
    }

    #[test]
    fn priority_overflow_evicts_lowest() {
        let stats = Arc::new(Stats::new());
        let mut sets = AccountSets::new(
            AccountSetsConfig {
                priorities_max: 2,
                ..Default::default()
            },
            stats,
        );
        sets.priority_set(&account(1), 1.0);
        sets.priority_set(&account(2), 2.0);
        sets.priority_set(&account(3), 3.0);
        assert_eq!(sets.priority_len(), 2);
        assert!(!sets.prioritized(&account(1)));
        assert!(sets.prioritized(&account(3)));
    }

    #[test]
    fn blocking_overflow_evicts_oldest() {
        let stats = Arc::new(Stats::new());
        let mut sets = AccountSets::new(
            AccountSetsConfig {
                blocking_max: 2,
                ..Default::default()
            },
            stats,
        );
        for i in 1..=3 {
            let a = account(i);
            sets.priority_up(&a);
            sets.block(&a, BlockHash::from_u64(i));
        }
        assert_eq!(sets.blocked_len(), 2);
        assert!(!sets.blocked(&account(1)));
        assert!(sets.blocked(&account(3)));
    }
}
