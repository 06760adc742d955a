use std::collections::HashMap;

use crate::numbers::{Account, Link};

/// Ledger rule version an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Epoch {
    Invalid = 0,
    Unspecified = 1,
    Epoch0 = 2,
    Epoch1 = 3,
    Epoch2 = 4,
}

pub const EPOCH_MAX: Epoch = Epoch::Epoch2;

impl Epoch {
    pub fn from_u8(value: u8) -> Option<Epoch> {
        match value {
            0 => Some(Epoch::Invalid),
            1 => Some(Epoch::Unspecified),
            2 => Some(Epoch::Epoch0),
            3 => Some(Epoch::Epoch1),
            4 => Some(Epoch::Epoch2),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Maps `Epoch0` to 0, `Epoch1` to 1 and so on.
    pub fn normalized(self) -> u8 {
        (self as u8).saturating_sub(Epoch::Epoch0 as u8)
    }

    pub fn successor(self) -> Option<Epoch> {
        match self {
            Epoch::Epoch0 => Some(Epoch::Epoch1),
            Epoch::Epoch1 => Some(Epoch::Epoch2),
            _ => None,
        }
    }
}

/// Upgrade links recognized by the ledger, with the account allowed to sign
/// each upgrade block.
#[derive(Clone)]
pub struct Epochs {
    epochs: HashMap<Link, (Account, Epoch)>,
}

impl Epochs {
    pub fn new() -> Self {
        Self {
            epochs: HashMap::new(),
        }
    }

    pub fn add(&mut self, epoch: Epoch, signer: Account, link: Link) {
        self.epochs.insert(link, (signer, epoch));
    }

    pub fn is_epoch_link(&self, link: &Link) -> bool {
        self.epochs.contains_key(link)
    }

    pub fn epoch(&self, link: &Link) -> Option<Epoch> {
        self.epochs.get(link).map(|(_, epoch)| *epoch)
    }

    pub fn signer(&self, link: &Link) -> Option<Account> {
        self.epochs.get(link).map(|(signer, _)| *signer)
    }

    pub fn link(&self, epoch: Epoch) -> Option<Link> {
        self.epochs
            .iter()
            .find(|(_, (_, e))| *e == epoch)
            .map(|(link, _)| *link)
    }

    /// Upgrades may only move forward one epoch at a time.
    pub fn is_sequential(from: Epoch, to: Epoch) -> bool {
        from.successor() == Some(to)
    }
}

impl Default for Epochs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_values() {
        assert_eq!(Epoch::Epoch0.normalized(), 0);
        assert_eq!(Epoch::Epoch1.normalized(), 1);
        assert_eq!(Epoch::Epoch2.normalized(), 2);
    }

    #[test]
    fn sequential_upgrades_only() {
        assert!(Epochs::is_sequential(Epoch::Epoch0, Epoch::Epoch1));
        assert!(Epochs::is_sequential(Epoch::Epoch1, Epoch::Epoch2));
        assert!(!Epochs::is_sequential(Epoch::Epoch0, Epoch::Epoch2));
        assert!(!Epochs::is_sequential(Epoch::Epoch2, Epoch::Epoch1));
        assert!(!Epochs::is_sequential(Epoch::Unspecified, Epoch::Epoch1));
    }

    #[test]
    fn link_lookup() {
        let mut epochs = Epochs::new();
        let signer = Account::from_u64(5);
        let link = Link::from_u64(100);
        epochs.add(Epoch::Epoch1, signer, link);
        assert!(epochs.is_epoch_link(&link));
        assert_eq!(epochs.epoch(&link), Some(Epoch::Epoch1));
        assert_eq!(epochs.signer(&link), Some(signer));
        assert_eq!(epochs.link(Epoch::Epoch1), Some(link));
        assert!(!epochs.is_epoch_link(&Link::from_u64(101)));
    }
}
