use std::collections::HashMap;

use parking_lot::Mutex;

/// Subsystem a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatType {
    Ledger,
    BlockProcessor,
    ConfirmingSet,
    ElectionScheduler,
    BacklogScan,
    BoundedBacklog,
    Tcp,
    TcpListener,
    TcpListenerRejected,
    TcpChannel,
    Handshake,
    BootstrapAccountSets,
    Bootstrap,
    OnlineReps,
    TrafficTcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatDetail {
    // Ledger / block processor results
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
    Overfill,
    Force,
    Rollback,
    RollbackFailed,
    RollbackSkipped,
    RollbackMissingBlock,
    // Confirming set
    Cementing,
    Cemented,
    AlreadyCemented,
    // Scheduler
    Loop,
    Cleanup,
    Activated,
    ActivateSkip,
    ActivateFull,
    ActivateFailed,
    CancelLowest,
    // Backlog
    Total,
    Scanned,
    LoopScan,
    Cooldown,
    GatheredTargets,
    NoTargets,
    PerformingRollbacks,
    // Transport
    AcceptSuccess,
    AcceptFailure,
    MaxPerIp,
    MaxPerSubnetwork,
    MaxInbound,
    ConnectError,
    ReadError,
    WriteError,
    IoTimeoutDrop,
    SilentConnectionDrop,
    Queued,
    Drop,
    Send,
    All,
    // Handshake
    CookieIssued,
    CookieExpired,
    ResponseInvalid,
    ResponseAccepted,
    // Bootstrap account sets
    Prioritize,
    PrioritizeFailed,
    Deprioritize,
    DeprioritizeFailed,
    PriorityInsert,
    PrioritySet,
    EraseByThreshold,
    EraseByBlocking,
    Block,
    BlockFailed,
    Unblock,
    UnblockFailed,
    DependencyUpdate,
    DependencyUpdateFailed,
    PriorityOverflow,
    BlockingOverflow,
    SyncDependencies,
    DependencySynced,
    // Bootstrap requester
    Request,
    RequestBlocking,
    Reply,
    Timeout,
    Throttled,
    // Online reps
    RepNew,
    RepUpdate,
    UpdateOnline,
    Sample,
    TrimTrend,
    SanitizeOld,
    SanitizeFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatDir {
    In,
    Out,
}

/// Process-wide counter sink. One instance is constructed per node so tests
/// can assert on isolated counters.
pub struct Stats {
    counters: Mutex<HashMap<(StatType, StatDetail, StatDir), u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn inc(&self, stat_type: StatType, detail: StatDetail) {
        self.add_dir(stat_type, detail, StatDir::In, 1);
    }

    pub fn inc_dir(&self, stat_type: StatType, detail: StatDetail, dir: StatDir) {
        self.add_dir(stat_type, detail, dir, 1);
    }

    pub fn add(&self, stat_type: StatType, detail: StatDetail, value: u64) {
        self.add_dir(stat_type, detail, StatDir::In, value);
    }

    pub fn add_dir(&self, stat_type: StatType, detail: StatDetail, dir: StatDir, value: u64) {
        if value == 0 {
            return;
        }
        *self
            .counters
            .lock()
            .entry((stat_type, detail, dir))
            .or_insert(0) += value;
    }

    pub fn count(&self, stat_type: StatType, detail: StatDetail) -> u64 {
        self.count_dir(stat_type, detail, StatDir::In)
    }

    pub fn count_dir(&self, stat_type: StatType, detail: StatDetail, dir: StatDir) -> u64 {
        self.counters
            .lock()
            .get(&(stat_type, detail, dir))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_key() {
        let stats = Stats::new();
        stats.inc(StatType::Tcp, StatDetail::ConnectError);
        stats.inc(StatType::Tcp, StatDetail::ConnectError);
        stats.add_dir(StatType::TrafficTcp, StatDetail::All, StatDir::Out, 512);
        assert_eq!(stats.count(StatType::Tcp, StatDetail::ConnectError), 2);
        assert_eq!(
            stats.count_dir(StatType::TrafficTcp, StatDetail::All, StatDir::Out),
            512
        );
        assert_eq!(stats.count(StatType::TrafficTcp, StatDetail::All), 0);
    }
}
