use std::sync::Arc;
use std::time::Duration;

use crate::block::{Block, BlockBuilder};
use crate::crypto::{blake2b, KeyPair, WORK_THRESHOLD_DEV, WORK_THRESHOLD_LIVE};
use crate::epoch::{Epoch, Epochs};
use crate::numbers::{Account, Amount, Link, RawKey};

/// Which network profile a node runs against. Tests construct a dedicated
/// dev profile per case instead of sharing ambient globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Dev,
    Live,
}

impl NetworkKind {
    /// Second byte of the wire magic.
    pub fn id_char(self) -> u8 {
        match self {
            NetworkKind::Dev => b'X',
            NetworkKind::Live => b'C',
        }
    }
}

#[derive(Clone)]
pub struct LedgerConstants {
    pub genesis_key: KeyPair,
    pub genesis_account: Account,
    pub genesis_block: Arc<Block>,
    pub genesis_amount: Amount,
    pub burn_account: Account,
    pub epochs: Epochs,
    pub work_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct NetworkConstants {
    pub kind: NetworkKind,
    pub protocol_version: u8,
    pub protocol_version_min: u8,
    pub silent_connection_tolerance: Duration,
    pub idle_timeout: Duration,
    pub checkup_interval: Duration,
    pub handshake_timeout: Duration,
    pub syn_cookie_ttl: Duration,
    pub weight_interval: Duration,
    pub weight_cutoff: Duration,
    pub online_weight_minimum: Amount,
    pub representative_vote_weight_minimum: Amount,
    pub online_weight_quorum: u8,
}

#[derive(Clone)]
pub struct NetworkParams {
    pub kind: NetworkKind,
    pub ledger: LedgerConstants,
    pub network: NetworkConstants,
}

impl NetworkParams {
    pub fn dev() -> Self {
        Self::new(NetworkKind::Dev)
    }

    pub fn live() -> Self {
        Self::new(NetworkKind::Live)
    }

    pub fn new(kind: NetworkKind) -> Self {
        let genesis_key = KeyPair::from_raw(RawKey::from_bytes(blake2b::<32>(&[
            b"lattice dev genesis key",
        ])))
        .expect("dev genesis key is valid");
        let genesis_account = genesis_key.account();

        // Genesis is trusted and its work is never validated, so the nonce is
        // produced against the cheap dev threshold for both profiles.
        let genesis_block = BlockBuilder::open()
            .source(crate::numbers::BlockHash(genesis_account.0))
            .representative(genesis_account)
            .account(genesis_account)
            .work(crate::crypto::work_generate(
                WORK_THRESHOLD_DEV,
                &crate::numbers::Root::from(genesis_account),
            ))
            .sign(genesis_key.raw(), &genesis_account);

        let mut epochs = Epochs::new();
        epochs.add(Epoch::Epoch1, genesis_account, epoch_link(b"lattice epoch v1"));
        epochs.add(Epoch::Epoch2, genesis_account, epoch_link(b"lattice epoch v2"));

        let ledger = LedgerConstants {
            genesis_account,
            genesis_block: Arc::new(genesis_block),
            genesis_amount: Amount::MAX,
            burn_account: Account::ZERO,
            epochs,
            work_threshold: match kind {
                NetworkKind::Dev => WORK_THRESHOLD_DEV,
                NetworkKind::Live => WORK_THRESHOLD_LIVE,
            },
            genesis_key,
        };

        let network = match kind {
            NetworkKind::Dev => NetworkConstants {
                kind,
                protocol_version: 21,
                protocol_version_min: 18,
                silent_connection_tolerance: Duration::from_secs(120),
                idle_timeout: Duration::from_secs(120),
                checkup_interval: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(5),
                syn_cookie_ttl: Duration::from_secs(5),
                weight_interval: Duration::from_millis(500),
                weight_cutoff: Duration::from_secs(60),
                online_weight_minimum: Amount::raw(0),
                representative_vote_weight_minimum: Amount::raw(0),
                online_weight_quorum: 67,
            },
            NetworkKind::Live => NetworkConstants {
                kind,
                protocol_version: 21,
                protocol_version_min: 18,
                silent_connection_tolerance: Duration::from_secs(120),
                idle_timeout: Duration::from_secs(120),
                checkup_interval: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(30),
                syn_cookie_ttl: Duration::from_secs(5),
                weight_interval: Duration::from_secs(5 * 60),
                weight_cutoff: Duration::from_secs(14 * 24 * 60 * 60),
                online_weight_minimum: Amount::raw(60_000_000 * crate::numbers::NANO_RATIO),
                representative_vote_weight_minimum: Amount::raw(10 * crate::numbers::NANO_RATIO),
                online_weight_quorum: 67,
            },
        };

        Self {
            kind,
            ledger,
            network,
        }
    }

    pub fn is_dev(&self) -> bool {
        self.kind == NetworkKind::Dev
    }
}

fn epoch_link(tag: &[u8; 16]) -> Link {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(tag);
    Link::from_bytes(bytes)
}
