// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::{PeerId, RosterId};

/// Ordered list of peers participating in one protocol run.
///
/// The [`RosterId`] is derived from the exact peer order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Roster {
    id: RosterId,
    peers: Vec<PeerId>,
}

impl Roster {
    /// Creates a new roster from the given peers, in the given order.
    #[must_use]
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self {
            id: RosterId::from_peers(&peers),
            peers,
        }
    }

    #[must_use]
    pub const fn id(&self) -> RosterId {
        self.id
    }

    #[must_use]
    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    /// Gives the number of peers that may fail while a quorum is still reached.
    ///
    /// This is the Byzantine bound `floor((n - 1) / 3)` for a roster of size `n`.
    #[must_use]
    pub fn default_allowed_failures(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_failures() {
        assert_eq!(Roster::new(vec![]).default_allowed_failures(), 0);
        assert_eq!(Roster::new(vec![0]).default_allowed_failures(), 0);
        assert_eq!(Roster::new((0..4).collect()).default_allowed_failures(), 1);
        assert_eq!(Roster::new((0..10).collect()).default_allowed_failures(), 3);
        assert_eq!(Roster::new((0..100).collect()).default_allowed_failures(), 33);
    }

    #[test]
    fn id_follows_order() {
        let a = Roster::new(vec![1, 2, 3]);
        let b = Roster::new(vec![1, 2, 3]);
        let c = Roster::new(vec![3, 2, 1]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(a.contains(2));
        assert!(!a.contains(4));
    }
}
