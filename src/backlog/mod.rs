mod bounded;
mod scan;

pub use bounded::{BacklogIndex, BoundedBacklog, BoundedBacklogConfig, RollbackInterlock};
pub use scan::{ActivatedInfo, BacklogScan, BacklogScanConfig};
