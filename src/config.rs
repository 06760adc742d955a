use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backlog::{BacklogScanConfig, BoundedBacklogConfig};
use crate::bootstrap::{AccountSetsConfig, BootstrapConfig, PeerScoringConfig};
use crate::errors::{CoreError, CoreResult};
use crate::network_params::NetworkConstants;
use crate::processing::{BlockProcessorConfig, ConfirmingSetConfig};
use crate::rate_limiter::BandwidthLimiterConfig;
use crate::scheduler::{PriorityBucketConfig, PrioritySchedulerConfig};
use crate::transport::{TcpListenerConfig, TcpSocketConfig};

/// Top-level node configuration, stored as TOML. Durations are expressed in
/// the unit their field name carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_tcp_io_timeout_secs")]
    pub tcp_io_timeout_secs: u64,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub block_processor: BlockProcessorSection,
    #[serde(default)]
    pub backlog_scan: BacklogScanSection,
    #[serde(default)]
    pub bounded_backlog: BoundedBacklogSection,
    #[serde(default)]
    pub priority_bucket: PriorityBucketSection,
    #[serde(default)]
    pub priority_scheduler: PrioritySchedulerSection,
    #[serde(default)]
    pub bandwidth: BandwidthSection,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    /// Overall target used by the default election slot container.
    #[serde(default = "default_active_elections_target")]
    pub active_elections_target: usize,
}

fn default_tcp_io_timeout_secs() -> u64 {
    30
}

fn default_active_elections_target() -> usize {
    5000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tcp_io_timeout_secs: default_tcp_io_timeout_secs(),
            tcp: TcpSection::default(),
            network: NetworkSection::default(),
            block_processor: BlockProcessorSection::default(),
            backlog_scan: BacklogScanSection::default(),
            bounded_backlog: BoundedBacklogSection::default(),
            priority_bucket: PriorityBucketSection::default(),
            priority_scheduler: PrioritySchedulerSection::default(),
            bandwidth: BandwidthSection::default(),
            bootstrap: BootstrapSection::default(),
            active_elections_target: default_active_elections_target(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpSection {
    pub port: u16,
    pub max_inbound_connections: usize,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            port: 0,
            max_inbound_connections: 2048,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSection {
    /// 0 disables the per-IP limit.
    pub max_peers_per_ip: usize,
    /// 0 disables the per-subnet limit.
    pub max_peers_per_subnetwork: usize,
    pub silent_connection_tolerance_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            max_peers_per_ip: 4,
            max_peers_per_subnetwork: 16,
            silent_connection_tolerance_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockProcessorSection {
    pub max_queue: usize,
    pub batch_max: usize,
}

impl Default for BlockProcessorSection {
    fn default() -> Self {
        let defaults = BlockProcessorConfig::default();
        Self {
            max_queue: defaults.max_queue,
            batch_max: defaults.batch_max,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BacklogScanSection {
    pub enable: bool,
    pub batch_size: usize,
    pub rate_limit: usize,
}

impl Default for BacklogScanSection {
    fn default() -> Self {
        let defaults = BacklogScanConfig::default();
        Self {
            enable: defaults.enable,
            batch_size: defaults.batch_size,
            rate_limit: defaults.rate_limit,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundedBacklogSection {
    pub enable: bool,
    pub max_backlog: usize,
    pub bucket_threshold: usize,
    pub batch_size: usize,
    pub max_queued_notifications: usize,
}

impl Default for BoundedBacklogSection {
    fn default() -> Self {
        let defaults = BoundedBacklogConfig::default();
        Self {
            enable: defaults.enable,
            max_backlog: defaults.max_backlog,
            bucket_threshold: defaults.bucket_threshold,
            batch_size: defaults.batch_size,
            max_queued_notifications: defaults.max_queued_notifications,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriorityBucketSection {
    pub max_blocks: usize,
    pub reserved_elections: usize,
    pub max_elections: usize,
}

impl Default for PriorityBucketSection {
    fn default() -> Self {
        let defaults = PriorityBucketConfig::default();
        Self {
            max_blocks: defaults.max_blocks,
            reserved_elections: defaults.reserved_elections,
            max_elections: defaults.max_elections,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrioritySchedulerSection {
    pub enable: bool,
}

impl Default for PrioritySchedulerSection {
    fn default() -> Self {
        Self { enable: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandwidthSection {
    pub limit: usize,
    pub burst_ratio: f64,
    pub bootstrap_limit: usize,
    pub bootstrap_burst_ratio: f64,
}

impl Default for BandwidthSection {
    fn default() -> Self {
        let defaults = BandwidthLimiterConfig::default();
        Self {
            limit: defaults.generic_limit,
            burst_ratio: defaults.generic_burst_ratio,
            bootstrap_limit: defaults.bootstrap_limit,
            bootstrap_burst_ratio: defaults.bootstrap_burst_ratio,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapSection {
    pub enable: bool,
    pub rate_limit: usize,
    pub throttle_window: usize,
    pub request_timeout_secs: u64,
    pub pull_count: u8,
    pub channel_limit: usize,
    pub priorities_max: usize,
    pub blocking_max: usize,
    pub cooldown_secs: u64,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        let defaults = BootstrapConfig::default();
        Self {
            enable: defaults.enable,
            rate_limit: defaults.rate_limit,
            throttle_window: defaults.throttle_window,
            request_timeout_secs: defaults.request_timeout.as_secs(),
            pull_count: defaults.pull_count,
            channel_limit: defaults.peer_scoring.channel_limit,
            priorities_max: defaults.account_sets.priorities_max,
            blocking_max: defaults.account_sets.blocking_max,
            cooldown_secs: defaults.account_sets.cooldown.as_secs(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| CoreError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| CoreError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /*
     * materialized subsystem configs
     */

    pub fn socket_config(&self, network: &NetworkConstants) -> TcpSocketConfig {
        TcpSocketConfig {
            io_timeout: Duration::from_secs(self.tcp_io_timeout_secs),
            silent_connection_tolerance: Duration::from_secs(
                self.network.silent_connection_tolerance_secs,
            ),
            checkup_interval: network.checkup_interval,
            queue_size: 128,
        }
    }

    pub fn listener_config(&self) -> TcpListenerConfig {
        TcpListenerConfig {
            port: self.tcp.port,
            max_inbound_connections: self.tcp.max_inbound_connections,
            max_peers_per_ip: self.network.max_peers_per_ip,
            max_peers_per_subnetwork: self.network.max_peers_per_subnetwork,
        }
    }

    pub fn block_processor_config(&self) -> BlockProcessorConfig {
        BlockProcessorConfig {
            max_queue: self.block_processor.max_queue,
            batch_max: self.block_processor.batch_max,
        }
    }

    pub fn confirming_set_config(&self) -> ConfirmingSetConfig {
        ConfirmingSetConfig::default()
    }

    pub fn backlog_scan_config(&self) -> BacklogScanConfig {
        BacklogScanConfig {
            enable: self.backlog_scan.enable,
            batch_size: self.backlog_scan.batch_size,
            rate_limit: self.backlog_scan.rate_limit,
        }
    }

    pub fn bounded_backlog_config(&self) -> BoundedBacklogConfig {
        BoundedBacklogConfig {
            enable: self.bounded_backlog.enable,
            max_backlog: self.bounded_backlog.max_backlog,
            bucket_threshold: self.bounded_backlog.bucket_threshold,
            batch_size: self.bounded_backlog.batch_size,
            max_queued_notifications: self.bounded_backlog.max_queued_notifications,
        }
    }

    pub fn scheduler_config(&self) -> PrioritySchedulerConfig {
        PrioritySchedulerConfig {
            enable: self.priority_scheduler.enable,
            bucket: PriorityBucketConfig {
                max_blocks: self.priority_bucket.max_blocks,
                reserved_elections: self.priority_bucket.reserved_elections,
                max_elections: self.priority_bucket.max_elections,
            },
        }
    }

    pub fn bandwidth_config(&self) -> BandwidthLimiterConfig {
        BandwidthLimiterConfig {
            generic_limit: self.bandwidth.limit,
            generic_burst_ratio: self.bandwidth.burst_ratio,
            bootstrap_limit: self.bandwidth.bootstrap_limit,
            bootstrap_burst_ratio: self.bandwidth.bootstrap_burst_ratio,
        }
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            enable: self.bootstrap.enable,
            rate_limit: self.bootstrap.rate_limit,
            throttle_window: self.bootstrap.throttle_window,
            request_timeout: Duration::from_secs(self.bootstrap.request_timeout_secs),
            pull_count: self.bootstrap.pull_count,
            peer_scoring: PeerScoringConfig {
                channel_limit: self.bootstrap.channel_limit,
            },
            account_sets: AccountSetsConfig {
                priorities_max: self.bootstrap.priorities_max,
                blocking_max: self.bootstrap.blocking_max,
                cooldown: Duration::from_secs(self.bootstrap.cooldown_secs),
            },
        }
    }
}
