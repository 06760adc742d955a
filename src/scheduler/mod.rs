mod bucket;
mod bucketing;
mod priority;

pub use bucket::{PriorityBucket, PriorityBucketConfig};
pub use bucketing::{BucketIndex, Bucketing};
pub use priority::{PriorityScheduler, PrioritySchedulerConfig};
