// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identifier types shared by all components.
//!
//! Rosters, trees and protocol kinds are identified by digests of their
//! defining data, so every peer derives the same identifier independently.
//! Protocol instances are identified by a random [`InstanceId`].
//! The four of them together form the [`Token`] of a running instance.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, hash_all};

/// Peer identity type.
pub type PeerId = u64;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(Hash);

        impl $name {
            /// Wraps the given digest.
            #[must_use]
            pub const fn from_bytes(bytes: Hash) -> Self {
                Self(bytes)
            }

            /// Returns the underlying digest.
            #[must_use]
            pub const fn as_bytes(&self) -> &Hash {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }
    };
}

digest_id!(
    /// Identifies a protocol kind, derived from its registered name.
    ProtocolId
);
digest_id!(
    /// Identifies a [`crate::Roster`], derived from its ordered peer list.
    RosterId
);
digest_id!(
    /// Identifies a [`crate::Tree`], derived from roster, root and branching factor.
    TreeId
);

impl ProtocolId {
    /// Derives the protocol ID for the given protocol name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(hash_all(&[b"arbor-protocol", name.as_bytes()]))
    }
}

impl RosterId {
    pub(crate) fn from_peers(peers: &[PeerId]) -> Self {
        let bytes: Vec<u8> = peers.iter().flat_map(|p| p.to_be_bytes()).collect();
        Self(hash_all(&[b"arbor-roster", &bytes]))
    }
}

impl TreeId {
    pub(crate) fn derive(roster: &RosterId, root: PeerId, branching: usize) -> Self {
        Self(hash_all(&[
            b"arbor-tree",
            roster.as_bytes(),
            &root.to_be_bytes(),
            &(branching as u64).to_be_bytes(),
        ]))
    }
}

/// Random identity of a single protocol run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InstanceId(u128);

impl InstanceId {
    /// Draws a fresh random instance ID.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", (self.0 >> 96) as u32)
    }
}

/// Unique address of one running protocol instance.
///
/// Immutable once created. A token becomes invalid when its instance retires
/// and is never reused afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token {
    pub protocol: ProtocolId,
    pub tree: TreeId,
    pub roster: RosterId,
    pub instance: InstanceId,
}

impl Token {
    /// Creates a token for a new instance with a random [`InstanceId`].
    #[must_use]
    pub fn new(protocol: ProtocolId, tree: TreeId, roster: RosterId) -> Self {
        Self {
            protocol,
            tree,
            roster,
            instance: InstanceId::random(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            &self.protocol.to_string()[..8],
            &self.tree.to_string()[..8],
            self.instance
        )
    }
}
