// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Utility types and functions for tests.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Roster;
use crate::message::Envelope;
use crate::node::{DispatchError, Node};
use crate::protocol::{ProtocolError, ProtocolFactory, ProtocolInstance};
use crate::tree::Tree;
use crate::types::{PeerId, ProtocolId, Token};

/// Instance that records every batch it receives through the fallback.
#[derive(Default)]
pub struct RecordingInstance {
    batches: Mutex<Vec<Vec<Envelope>>>,
}

impl RecordingInstance {
    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolInstance for RecordingInstance {
    async fn start(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn dispatch(&self, batch: Vec<Envelope>) -> Result<(), DispatchError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Instance that relies on the default fallback, rejecting every batch.
pub struct SilentInstance;

#[async_trait]
impl ProtocolInstance for SilentInstance {
    async fn start(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Factory building a fresh [`RecordingInstance`] for every node.
pub fn recording_factory() -> ProtocolFactory {
    Arc::new(|_: Arc<Node>| -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
        Ok(Arc::new(RecordingInstance::default()))
    })
}

/// Creates a node for `peer` in a tree over peers `0..n` rooted at 0.
///
/// The node is not attached to any overlay, so it cannot send.
pub fn standalone_node(n: u64, branching: usize, peer: PeerId) -> (Arc<Node>, Arc<RecordingInstance>) {
    let roster = Arc::new(Roster::new((0..n).collect()));
    let tree = Arc::new(Tree::new_nary(roster, branching, 0).unwrap());
    let index = tree.find(peer).unwrap().index();
    let token = Token::new(
        ProtocolId::from_name("test"),
        tree.id(),
        tree.roster().id(),
    );
    let node = Arc::new(Node::new(
        token,
        tree,
        index,
        Weak::new(),
        CancellationToken::new(),
    ));
    let instance = Arc::new(RecordingInstance::default());
    node.attach(Arc::clone(&instance) as Arc<dyn ProtocolInstance>);
    (node, instance)
}
