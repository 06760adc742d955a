mod account_sets;
mod peer_scoring;
mod requester;
mod throttle;

pub use account_sets::{AccountSets, AccountSetsConfig, PriorityResult};
pub use peer_scoring::{PeerScoring, PeerScoringConfig};
pub use requester::{BootstrapConfig, BootstrapRequester};
pub use throttle::Throttle;
