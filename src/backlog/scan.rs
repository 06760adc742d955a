use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ledger::Ledger;
use crate::numbers::Account;
use crate::rate_limiter::RateLimiter;
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::{AccountInfo, ConfirmationHeightInfo};
use crate::utils::ObserverSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogScanConfig {
    /// Control if ongoing backlog scanning is enabled. If not, the scan can
    /// still be triggered manually.
    pub enable: bool,
    /// Number of accounts per second to process.
    pub rate_limit: usize,
    /// Number of accounts per batch.
    pub batch_size: usize,
}

impl Default for BacklogScanConfig {
    fn default() -> Self {
        Self {
            enable: true,
            rate_limit: 10_000,
            batch_size: 1000,
        }
    }
}

/// Account-head state handed to subscribers.
#[derive(Clone)]
pub struct ActivatedInfo {
    pub account: Account,
    pub account_info: AccountInfo,
    pub conf_info: ConfirmationHeightInfo,
}

struct ScanState {
    triggered: bool,
    stopped: bool,
}

/// Rate-limited walk over the account table. Emits `batch_scanned` for every
/// visited account and `batch_activated` for those with unconfirmed blocks.
pub struct BacklogScan {
    weak_self: Weak<BacklogScan>,
    config: BacklogScanConfig,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    limiter: RateLimiter,
    state: Mutex<ScanState>,
    condition: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Accounts scanned, whether or not anything is unconfirmed.
    pub batch_scanned: ObserverSet<Vec<ActivatedInfo>>,
    /// Accounts with at least one unconfirmed block.
    pub batch_activated: ObserverSet<Vec<ActivatedInfo>>,
}

impl BacklogScan {
    pub fn new(config: BacklogScanConfig, ledger: Arc<Ledger>, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            limiter: RateLimiter::new(config.rate_limit),
            config,
            ledger,
            stats,
            state: Mutex::new(ScanState {
                triggered: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            thread: Mutex::new(None),
            batch_scanned: ObserverSet::new(),
            batch_activated: ObserverSet::new(),
        })
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock();
        debug_assert!(thread.is_none());
        let scan = self.weak_self.upgrade().expect("scan is alive");
        *thread = Some(
            std::thread::Builder::new()
                .name("backlog scan".into())
                .spawn(move || scan.run())
                .expect("spawning backlog scan thread"),
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

    /// Requests a single scan iteration, even when periodic scanning is
    /// disabled.
    pub fn trigger(&self) {
        {
            let mut state = self.state.lock();
            state.triggered = true;
        }
        self.condition.notify_all();
    }

    pub fn notify(&self) {
        self.condition.notify_all();
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if state.triggered || self.config.enable {
                self.stats.inc(StatType::BacklogScan, StatDetail::Loop);
                state.triggered = false;
                self.populate_backlog(&mut state);
            } else {
                self.condition
                    .wait_while(&mut state, |state| !state.stopped && !state.triggered);
            }
        }
    }

    /// One full iteration over all accounts.
    fn populate_backlog(&self, state: &mut parking_lot::MutexGuard<'_, ScanState>) {
        let mut next = Account::ZERO;
        let mut done = false;
        while !state.stopped && !done {
            while !self.limiter.should_pass(self.config.batch_size) {
                let wait_time = Duration::from_millis(
                    1000 / (self.config.rate_limit / self.config.batch_size).max(1) as u64 / 2,
                );
                self.condition
                    .wait_for(state, wait_time.max(Duration::from_millis(10)));
                if state.stopped {
                    return;
                }
            }

            let mut scanned = Vec::new();
            let mut activated = Vec::new();
            {
                let tx = self.ledger.tx_begin_read();
                let mut count = 0;
                loop {
                    if count >= self.config.batch_size {
                        break;
                    }
                    let Some((account, account_info)) =
                        self.ledger.store().account_begin(&tx, &next)
                    else {
                        done = true;
                        break;
                    };
                    self.stats.inc(StatType::BacklogScan, StatDetail::Total);

                    let conf_info = self
                        .ledger
                        .store()
                        .confirmation_height_get(&tx, &account)
                        .unwrap_or_default();
                    let info = ActivatedInfo {
                        account,
                        account_info,
                        conf_info,
                    };
                    scanned.push(info.clone());
                    if conf_info.height < account_info.block_count {
                        activated.push(info);
                    }

                    match increment(account) {
                        Some(incremented) => next = incremented,
                        None => {
                            done = true;
                            break;
                        }
                    }
                    count += 1;
                }
            }

            self.stats
                .add(StatType::BacklogScan, StatDetail::Scanned, scanned.len() as u64);
            self.stats.add(
                StatType::BacklogScan,
                StatDetail::Activated,
                activated.len() as u64,
            );

            // Notify without holding the scan lock or a store transaction
            parking_lot::MutexGuard::unlocked(state, || {
                self.batch_scanned.notify(&scanned);
                self.batch_activated.notify(&activated);
            });
        }
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
