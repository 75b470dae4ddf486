// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Arbor: runtime for tree-structured distributed protocols
//!
//! Peers of a [`Roster`] are arranged into a [`Tree`]. Protocol instances run
//! on every peer of the tree and exchange typed [`Message`]s with their
//! parent and children through their [`Node`]. Messages from children are
//! aggregated per type, so an instance sees all answers of its subtree in
//! one batch.
//!
//! The [`Overlay`] of each peer creates instances, routes incoming frames to
//! them and removes them again once they signal completion.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod collect;
pub mod config;
pub mod crypto;
pub mod logging;
pub mod message;
pub mod network;
pub mod node;
pub mod overlay;
pub mod propagate;
pub mod protocol;
mod roster;
mod sync;
#[cfg(test)]
pub mod test_utils;
pub mod tree;
pub mod types;

use std::sync::Arc;

pub use self::config::Config;
pub use self::message::{Envelope, Message, MessageType, Received};
use self::network::LocalNetworkCore;
pub use self::node::{DoneHandle, IMMEDIATE_DELIVERY, Node};
pub use self::overlay::{Overlay, OverlayError};
pub use self::protocol::{ProtocolError, ProtocolFactory, ProtocolInstance};
pub use self::roster::Roster;
pub use self::tree::{Tree, TreeNode, TreeNodeIndex};
pub use self::types::{PeerId, Token};

/// Creates `count` overlays with peer IDs `0..count`, linked in-process.
///
/// Every overlay already receives in its own task. The returned network core
/// can be used to break links between peers.
///
/// This code lives here to enable sharing between tests, benchmarks and the
/// `local_cluster` binary. It should not be used in production code.
pub async fn create_local_cluster(
    count: u64,
    config: &Config,
) -> (Arc<LocalNetworkCore>, Vec<Arc<Overlay>>) {
    let core = Arc::new(LocalNetworkCore::new());
    let mut overlays = Vec::with_capacity(count as usize);
    for id in 0..count {
        let network = core.join(id).await;
        let overlay = Overlay::new(Arc::new(network), config.clone());
        tokio::spawn(Arc::clone(&overlay).run());
        overlays.push(overlay);
    }
    (core, overlays)
}
