use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::ledger::Ledger;
use crate::network_params::NetworkConstants;
use crate::numbers::{Account, Amount};
use crate::stats::{StatDetail, StatType, Stats};
use crate::store::Writer;
use crate::utils::seconds_since_epoch;

struct RepsState {
    by_account: HashMap<Account, u64>,
    by_time: BTreeSet<(u64, Account)>,
    sequence: u64,
    started: Instant,
    cached_online: Amount,
    cached_trended: Amount,
}

impl RepsState {
    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Tracks which representatives voted recently and keeps a trended online
/// weight series in the store. `delta()` is the quorum requirement derived
/// from the larger of the live and trended weights.
pub struct OnlineReps {
    weak_self: Weak<OnlineReps>,
    network: NetworkConstants,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    state: Mutex<RepsState>,
    condition: Condvar,
    stopped: Mutex<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OnlineReps {
    pub fn new(network: NetworkConstants, ledger: Arc<Ledger>, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            network,
            ledger,
            stats,
            state: Mutex::new(RepsState {
                by_account: HashMap::new(),
                by_time: BTreeSet::new(),
                sequence: 0,
                started: Instant::now(),
                cached_online: Amount::ZERO,
                cached_trended: Amount::ZERO,
            }),
            condition: Condvar::new(),
            stopped: Mutex::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        {
            // Sanitize the persisted series and prime the trended cache
            let mut tx = self.ledger.tx_begin_write(Writer::OnlineWeight);
            self.sanitize_trended(&mut tx);
            let trended = self.calculate_trended(&tx);
            drop(tx);
            let mut state = self.state.lock();
            state.cached_trended = trended;
            info!(target: "online_reps", trended = %trended, "initial trended weight");
        }

        let mut thread = self.thread.lock();
        debug_assert!(thread.is_none());
        let reps = self.weak_self.upgrade().expect("online reps is alive");
        *thread = Some(
            std::thread::Builder::new()
                .name("online reps".into())
                .spawn(move || reps.run())
                .expect("spawning online reps thread"),
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

    /// Records a vote observation if the representative carries enough
    /// weight.
    pub fn observe(&self, representative: Account) {
        if self.ledger.weight(&representative) <= self.network.representative_vote_weight_minimum {
            return;
        }
        let mut state = self.state.lock();

        let new_insert = match state.by_account.remove(&representative) {
            Some(time) => {
                state.by_time.remove(&(time, representative));
                false
            }
            None => true,
        };
        let now = state.now_millis();
        // Sequence breaks ties between same-millisecond observations
        let key = now.max(state.sequence + 1);
        state.sequence = key;
        state.by_account.insert(representative, key);
        state.by_time.insert((key, representative));

        self.stats.inc(
            StatType::OnlineReps,
            if new_insert {
                StatDetail::RepNew
            } else {
                StatDetail::RepUpdate
            },
        );

        let trimmed = self.trim(&mut state);
        if new_insert || trimmed {
            self.stats
                .inc(StatType::OnlineReps, StatDetail::UpdateOnline);
            state.cached_online = self.calculate_online(&state);
        }
    }

    fn trim(&self, state: &mut RepsState) -> bool {
        let cutoff = state
            .now_millis()
            .saturating_sub(self.network.weight_interval.as_millis() as u64);
        let stale: Vec<(u64, Account)> = state
            .by_time
            .range(..(cutoff, Account::ZERO))
            .copied()
            .collect();
        let trimmed = !stale.is_empty();
        for (time, account) in stale {
            state.by_time.remove(&(time, account));
            state.by_account.remove(&account);
        }
        trimmed
    }

    fn calculate_online(&self, state: &RepsState) -> Amount {
        state
            .by_account
            .keys()
            .fold(Amount::ZERO, |sum, representative| {
                sum.saturating_add(self.ledger.weight(representative))
            })
    }

    /// Current online weight: sum of the weights of recently seen reps.
    pub fn online(&self) -> Amount {
        self.state.lock().cached_online
    }

    /// Median of the persisted samples, floored at the configured minimum.
    pub fn trended(&self) -> Amount {
        let state = self.state.lock();
        state.cached_trended.max(self.network.online_weight_minimum)
    }

    /// Quorum delta: `max(online, trended, minimum) * quorum / 100`.
    pub fn delta(&self) -> Amount {
        let state = self.state.lock();
        let weight = state
            .cached_online
            .max(state.cached_trended)
            .max(self.network.online_weight_minimum);
        // 256-bit intermediate to avoid overflowing the percentage product
        let wide = primitive_types::U256::from(weight.number())
            * primitive_types::U256::from(self.network.online_weight_quorum);
        let delta = wide / primitive_types::U256::from(100u8);
        Amount::raw(delta.as_u128())
    }

    pub fn list(&self) -> Vec<Account> {
        self.state.lock().by_account.keys().copied().collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.by_account.clear();
        state.by_time.clear();
        state.cached_online = Amount::ZERO;
    }

    fn run(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            let result = self
                .condition
                .wait_for(&mut stopped, self.network.weight_interval);
            if *stopped {
                return;
            }
            if result.timed_out() {
                drop(stopped);
                self.sample();
                stopped = self.stopped.lock();
            }
        }
    }

    /// Persists the current online weight and refreshes the trended median.
    pub fn sample(&self) {
        self.stats.inc(StatType::OnlineReps, StatDetail::Sample);

        let mut tx = self.ledger.tx_begin_write(Writer::OnlineWeight);
        self.trim_trended(&mut tx);
        self.ledger
            .store()
            .online_weight_put(&tx, seconds_since_epoch(), self.online());
        let trended = self.calculate_trended(&tx);
        drop(tx);

        let mut state = self.state.lock();
        state.cached_trended = trended;
        debug!(target: "online_reps", trended = %trended, "updated trended weight");
    }

    fn trim_trended(&self, tx: &mut crate::store::WriteTransaction) {
        let now = seconds_since_epoch();
        let cutoff = now.saturating_sub(self.network.weight_cutoff.as_secs());
        let mut timestamp = 0;
        while let Some((sample_time, _)) = self.ledger.store().online_weight_begin(tx, timestamp) {
            if sample_time >= cutoff {
                // Samples are ordered, nothing older remains
                break;
            }
            self.stats.inc(StatType::OnlineReps, StatDetail::TrimTrend);
            self.ledger.store().online_weight_del(tx, sample_time);
            timestamp = sample_time + 1;
        }
    }

    /// Startup cleanup: drops samples outside `[now - cutoff, now]`.
    fn sanitize_trended(&self, tx: &mut crate::store::WriteTransaction) {
        let now = seconds_since_epoch();
        let cutoff = now.saturating_sub(self.network.weight_cutoff.as_secs());

        let mut removed_old = 0u64;
        let mut removed_future = 0u64;
        let mut timestamp = 0;
        while let Some((sample_time, _)) = self.ledger.store().online_weight_begin(tx, timestamp) {
            if sample_time < cutoff {
                self.stats
                    .inc(StatType::OnlineReps, StatDetail::SanitizeOld);
                self.ledger.store().online_weight_del(tx, sample_time);
                removed_old += 1;
            } else if sample_time > now {
                self.stats
                    .inc(StatType::OnlineReps, StatDetail::SanitizeFuture);
                self.ledger.store().online_weight_del(tx, sample_time);
                removed_future += 1;
            }
            timestamp = sample_time + 1;
        }
        if removed_old + removed_future > 0 {
            debug!(
                target: "online_reps",
                removed_old,
                removed_future,
                "sanitized online weight trend"
            );
        }
    }

    fn calculate_trended(&self, tx: &dyn crate::store::Transaction) -> Amount {
        let mut samples = Vec::new();
        let mut timestamp = 0;
        while let Some((sample_time, weight)) = self.ledger.store().online_weight_begin(tx, timestamp)
        {
            samples.push(weight);
            timestamp = sample_time + 1;
        }
        if samples.is_empty() {
            return Amount::ZERO;
        }
        let median = samples.len() / 2;
        samples.select_nth_unstable(median);
        samples[median]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_helpers::LedgerContext;
    use crate::network_params::NetworkParams;
    use std::time::Duration;

    fn reps_for(ctx: &LedgerContext) -> Arc<OnlineReps> {
        let ledger = Arc::new(
            Ledger::new(
                ctx.ledger.store().clone(),
                ctx.params.ledger.clone(),
                ctx.stats.clone(),
            )
            .unwrap(),
        );
        OnlineReps::new(NetworkParams::dev().network, ledger, ctx.stats.clone())
    }

    #[test]
    fn observe_counts_weighted_reps_once() {
        let ctx = LedgerContext::new();
        let reps = reps_for(&ctx);
        let genesis = ctx.params.ledger.genesis_account;

        assert_eq!(reps.online(), Amount::ZERO);
        reps.observe(genesis);
        assert_eq!(reps.online(), Amount::MAX);
        reps.observe(genesis);
        assert_eq!(reps.online(), Amount::MAX);
        assert_eq!(reps.list(), vec![genesis]);

        // Zero-weight accounts are ignored
        reps.observe(Account::from_u64(42));
        assert_eq!(reps.list().len(), 1);
    }

    #[test]
    fn trim_drops_stale_observations() {
        let ctx = LedgerContext::new();
        let reps = reps_for(&ctx);
        let genesis = ctx.params.ledger.genesis_account;
        reps.observe(genesis);
        assert_eq!(reps.online(), Amount::MAX);

        // Dev weight interval is 500ms
        std::thread::sleep(Duration::from_millis(700));
        reps.observe(genesis);
        assert_eq!(reps.list().len(), 1);
    }

    #[test]
    fn sample_persists_and_trended_is_median() {
        let ctx = LedgerContext::new();
        let reps = reps_for(&ctx);
        let genesis = ctx.params.ledger.genesis_account;

        reps.sample();
        assert_eq!(reps.trended(), Amount::ZERO.max(Amount::ZERO));

        reps.observe(genesis);
        reps.sample();
        {
            let tx = ctx.ledger.tx_begin_read();
            assert!(ctx.ledger.store().online_weight_count(&tx) >= 1);
        }
        // Odd number of samples makes the median the middle value
        reps.sample();
        assert!(reps.trended() == Amount::ZERO || reps.trended() == Amount::MAX);
    }

    #[test]
    fn delta_is_quorum_share_of_max_weight() {
        let ctx = LedgerContext::new();
        let reps = reps_for(&ctx);
        let genesis = ctx.params.ledger.genesis_account;
        reps.observe(genesis);

        let expected = {
            let wide = primitive_types::U256::from(u128::MAX) * primitive_types::U256::from(67u8);
            Amount::raw((wide / primitive_types::U256::from(100u8)).as_u128())
        };
        assert_eq!(reps.delta(), expected);
    }

    #[test]
    fn clear_resets_online() {
        let ctx = LedgerContext::new();
        let reps = reps_for(&ctx);
        reps.observe(ctx.params.ledger.genesis_account);
        reps.clear();
        assert_eq!(reps.online(), Amount::ZERO);
        assert!(reps.list().is_empty());
    }
}
