// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of running protocol instances.
//!
//! The [`Overlay`] owns everything shared between instances on one peer:
//! - the [`ProtocolRegistry`] of protocol kinds
//! - all known [`Tree`]s and [`Roster`]s
//! - the table mapping each [`Token`] to the [`Node`] of its instance
//!
//! It also sits between the [`Transport`] and the nodes. Incoming frames are
//! resolved to the addressed node, outgoing envelopes are preceded by a tree
//! announcement the first time a tree is used towards a peer.
//!
//! Instances on non-root peers are created lazily, when the first message
//! for their token arrives.

pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use fastrace::Span;
use fastrace::future::FutureExt;
use log::{debug, trace, warn};
use moka::sync::Cache;
use scc::hash_map::Entry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use self::registry::ProtocolRegistry;
use crate::config::Config;
use crate::message::Envelope;
use crate::network::{Frame, NetworkError, Transport};
use crate::node::{DispatchError, Node, SendError};
use crate::protocol::{ProtocolError, ProtocolFactory};
use crate::sync::{lock, read, write};
use crate::tree::{Tree, TreeNodeIndex};
use crate::types::{PeerId, ProtocolId, RosterId, Token, TreeId};
use crate::Roster;

/// Errors when creating or addressing protocol instances.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no protocol registered for kind {0}")]
    UnknownProtocolKind(ProtocolId),
    #[error("no protocol registered under name {0:?}")]
    UnknownProtocolName(String),
    #[error("protocol name {0:?} is already registered")]
    ProtocolAlreadyRegistered(String),
    #[error("tree {0} not found")]
    TreeNotFound(TreeId),
    #[error("roster {0} not found")]
    RosterNotFound(RosterId),
    #[error("peer {0} is not part of the tree")]
    NotInTree(PeerId),
    #[error("no running instance for token {0}")]
    UnknownInstance(Token),
    #[error("building protocol instance failed")]
    Instantiate(#[source] ProtocolError),
    #[error("dispatching message failed")]
    Dispatch(#[from] DispatchError),
    #[error("overlay is shutting down")]
    ShuttingDown,
}

/// Envelopes waiting for the announcement of their tree.
struct HeldBack {
    since: Instant,
    envelopes: Vec<Envelope>,
}

/// Instance registry and message router of one peer.
pub struct Overlay {
    transport: Arc<dyn Transport>,
    config: Config,
    protocols: ProtocolRegistry,
    trees: RwLock<HashMap<TreeId, Arc<Tree>>>,
    rosters: RwLock<HashMap<RosterId, Arc<Roster>>>,
    nodes: scc::HashMap<Token, Arc<Node>>,
    /// Tokens of instances that retired recently.
    retired: Cache<Token, ()>,
    pending: Mutex<HashMap<TreeId, HeldBack>>,
    /// Peers that already know a tree, by tree.
    announced: Mutex<HashSet<(TreeId, PeerId)>>,
    cancel: CancellationToken,
}

impl Overlay {
    /// Creates a new overlay on top of `transport`.
    ///
    /// Nothing is received until [`Overlay::run`] is spawned.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Arc<Self> {
        let retired = Cache::builder().time_to_live(config.retired_ttl()).build();
        Arc::new(Self {
            transport,
            config,
            protocols: ProtocolRegistry::default(),
            trees: RwLock::new(HashMap::new()),
            rosters: RwLock::new(HashMap::new()),
            nodes: scc::HashMap::default(),
            retired,
            pending: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.transport.peer_id()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// Registers a protocol kind under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::ProtocolAlreadyRegistered`] if `name` is taken.
    pub fn register_protocol(
        &self,
        name: &str,
        factory: ProtocolFactory,
    ) -> Result<ProtocolId, OverlayError> {
        let id = self.protocols.register(name, factory)?;
        debug!("registered protocol {name:?} as {id}");
        Ok(id)
    }

    /// Makes `tree` known to this overlay and returns the shared copy.
    ///
    /// Registering a tree with a known ID returns the existing tree.
    /// Envelopes held back for this tree are routed afterwards.
    pub fn register_tree(self: &Arc<Self>, tree: Tree) -> Arc<Tree> {
        let id = tree.id();
        let tree = Arc::clone(write(&self.trees).entry(id).or_insert_with(|| Arc::new(tree)));
        write(&self.rosters)
            .entry(tree.roster().id())
            .or_insert_with(|| Arc::clone(tree.roster()));

        let held = lock(&self.pending).remove(&id);
        let Some(held) = held else {
            return tree;
        };
        debug!("routing {} held back envelopes for tree {id}", held.envelopes.len());
        for envelope in held.envelopes {
            if let Err(err) = self.route(envelope) {
                debug!("dropping held back envelope: {err}");
            }
        }
        tree
    }

    #[must_use]
    pub fn tree(&self, id: &TreeId) -> Option<Arc<Tree>> {
        read(&self.trees).get(id).cloned()
    }

    #[must_use]
    pub fn roster(&self, id: &RosterId) -> Option<Arc<Roster>> {
        read(&self.rosters).get(id).cloned()
    }

    fn node(&self, token: &Token) -> Option<Arc<Node>> {
        self.nodes.read(token, |_, node| Arc::clone(node))
    }

    /// Creates the instance addressed by `token` on this peer.
    ///
    /// If the instance already runs, its node is returned instead.
    /// Otherwise the protocol factory is called once, and the instance's run
    /// loop is spawned as a task of its own. When two calls race for the same
    /// token, one node is kept and the other is cancelled before it starts.
    ///
    /// # Errors
    ///
    /// Fails if any part of `token` does not resolve, if this peer is not in
    /// the tree, if the token already retired, or if the factory fails.
    pub fn create(self: &Arc<Self>, token: Token) -> Result<Arc<Node>, OverlayError> {
        if self.cancel.is_cancelled() {
            return Err(OverlayError::ShuttingDown);
        }
        if let Some(node) = self.node(&token) {
            return Ok(node);
        }
        if self.is_retired(&token) {
            return Err(OverlayError::UnknownInstance(token));
        }
        let tree = self
            .tree(&token.tree)
            .ok_or(OverlayError::TreeNotFound(token.tree))?;
        let roster = self
            .roster(&token.roster)
            .ok_or(OverlayError::RosterNotFound(token.roster))?;
        if roster.id() != tree.roster().id() {
            return Err(OverlayError::RosterNotFound(token.roster));
        }
        let index = tree
            .find(self.peer_id())
            .ok_or(OverlayError::NotInTree(self.peer_id()))?
            .index();
        let factory = self
            .protocols
            .factory(&token.protocol)
            .ok_or(OverlayError::UnknownProtocolKind(token.protocol))?;

        // no lock is held here, the factory may hand out and drop completion handles
        let node = self.instantiate(token, tree, index, &factory)?;
        match self.nodes.entry(token) {
            Entry::Occupied(entry) => {
                let winner = Arc::clone(entry.get());
                drop(entry);
                trace!("lost creation race for {token}");
                node.cancel();
                return Ok(winner);
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(Arc::clone(&node));
            }
        }
        if self.is_retired(&token) {
            self.nodes.remove_if(&token, |listed| Arc::ptr_eq(listed, &node));
            node.cancel();
            return Err(OverlayError::UnknownInstance(token));
        }
        if !node.mark_listed() {
            // every completion handle signaled before the node was listed
            self.retire(&token);
            return Ok(node);
        }

        let name = self.protocols.name(&token.protocol).unwrap_or_default();
        trace!("created instance {token} of {name:?} at {index}");
        if let Some(instance) = node.instance() {
            let span = Span::enter_with_local_parent(format!("{name} {token}"));
            tokio::spawn(instance.run().in_span(span));
        }
        Ok(node)
    }

    fn instantiate(
        self: &Arc<Self>,
        token: Token,
        tree: Arc<Tree>,
        index: TreeNodeIndex,
        factory: &ProtocolFactory,
    ) -> Result<Arc<Node>, OverlayError> {
        let node = Arc::new(Node::new(
            token,
            tree,
            index,
            Arc::downgrade(self),
            self.cancel.child_token(),
        ));
        let instance = factory(Arc::clone(&node)).map_err(OverlayError::Instantiate)?;
        node.attach(instance);
        Ok(node)
    }

    /// Registers `tree` and creates a new instance of protocol `name` on it.
    ///
    /// The new instance gets a fresh random token.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::UnknownProtocolName`] if `name` is not
    /// registered, otherwise as [`Overlay::create`].
    pub fn create_protocol(self: &Arc<Self>, name: &str, tree: Tree) -> Result<Arc<Node>, OverlayError> {
        let protocol = self
            .protocols
            .lookup(name)
            .ok_or_else(|| OverlayError::UnknownProtocolName(name.to_owned()))?;
        let tree = self.register_tree(tree);
        let token = Token::new(protocol, tree.id(), tree.roster().id());
        self.create(token)
    }

    /// Hands `envelope` to the node of the instance it is addressed to.
    ///
    /// Envelopes for unknown trees are held back until the tree is registered,
    /// for at most [`Config::pending_ttl`].
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::UnknownInstance`] if the instance already
    /// retired, otherwise as [`Overlay::create`] and [`Node::dispatch`].
    #[fastrace::trace(short_name = true)]
    pub fn route(self: &Arc<Self>, envelope: Envelope) -> Result<(), OverlayError> {
        let token = envelope.token;
        if let Some(node) = self.node(&token) {
            return deliver(&node, envelope);
        }
        if self.is_retired(&token) {
            return Err(OverlayError::UnknownInstance(token));
        }
        {
            // tree registration drains the pending map after inserting the tree
            let mut pending = lock(&self.pending);
            if self.tree(&token.tree).is_none() {
                self.hold_back(&mut pending, envelope);
                return Ok(());
            }
        }
        let node = self.create(token)?;
        deliver(&node, envelope)
    }

    fn hold_back(&self, pending: &mut HashMap<TreeId, HeldBack>, envelope: Envelope) {
        let ttl = self.config.pending_ttl();
        pending.retain(|tree, held| {
            let keep = held.since.elapsed() < ttl;
            if !keep {
                debug!("tree {tree} never announced, dropping {} envelopes", held.envelopes.len());
            }
            keep
        });
        let tree = envelope.token.tree;
        let held = pending.entry(tree).or_insert_with(|| HeldBack {
            since: Instant::now(),
            envelopes: Vec::new(),
        });
        if held.envelopes.len() >= self.config.max_pending_per_tree {
            debug!("too many envelopes for unknown tree {tree}, dropping one");
            return;
        }
        trace!("holding back envelope for unknown tree {tree}");
        held.envelopes.push(envelope);
    }

    /// Removes the instance addressed by `token`.
    ///
    /// Late messages for `token` are rejected for [`Config::retired_ttl`]
    /// afterwards. Returns `true` iff an instance was removed by this call.
    pub fn retire(&self, token: &Token) -> bool {
        self.retired.insert(*token, ());
        let removed = self.nodes.remove(token).is_some();
        if removed {
            trace!("retired instance {token}");
        }
        removed
    }

    #[must_use]
    pub fn is_retired(&self, token: &Token) -> bool {
        self.retired.contains_key(token)
    }

    /// Tears down the instance addressed by `token` without waiting for it.
    ///
    /// Returns `false` if no such instance is running.
    pub fn cancel(&self, token: &Token) -> bool {
        match self.node(token) {
            Some(node) => {
                node.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels all running instances and stops receiving.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut nodes = Vec::new();
        self.nodes.retain(|_, node| {
            nodes.push(Arc::clone(node));
            false
        });
        debug!("shutting down {} instances", nodes.len());
        for node in nodes {
            node.cancel();
        }
    }

    /// Number of instances currently running on this peer.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.nodes.len()
    }

    /// Receives and handles frames until [`Overlay::shutdown`] is called or
    /// the transport closes.
    pub async fn run(self: Arc<Self>) {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                res = self.transport.receive() => res,
            };
            match frame {
                Ok(frame) => self.handle_frame(frame),
                Err(NetworkError::Closed) => {
                    warn!("peer {}: transport closed", self.peer_id());
                    break;
                }
                Err(err) => warn!("peer {}: receiving frame failed: {err}", self.peer_id()),
            }
        }
        debug!("peer {}: overlay stopped", self.peer_id());
    }

    /// Handles a single frame received from the transport.
    pub fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Tree(descriptor) => match Tree::from_descriptor(&descriptor) {
                Ok(tree) => {
                    self.register_tree(tree);
                }
                Err(err) => warn!("ignoring invalid tree announcement: {err}"),
            },
            Frame::Envelope(envelope) => match self.route(envelope) {
                Ok(()) => {}
                Err(err @ OverlayError::UnknownInstance(_)) => debug!("dropping envelope: {err}"),
                Err(err) => warn!("routing envelope failed: {err}"),
            },
        }
    }

    /// Sends `envelope` to the peer at position `to` of `tree`.
    ///
    /// Envelopes to this peer itself are routed locally.
    pub(crate) async fn send_envelope(
        self: &Arc<Self>,
        tree: &Tree,
        to: TreeNodeIndex,
        envelope: Envelope,
    ) -> Result<(), SendError> {
        let peer = tree.node(to).ok_or(SendError::UnknownTreeNode(to))?.peer();
        if peer == self.peer_id() {
            if let Err(err) = self.route(envelope) {
                warn!("routing local envelope failed: {err}");
            }
            return Ok(());
        }

        let key = (tree.id(), peer);
        let announce = lock(&self.announced).insert(key);
        if announce {
            if let Err(err) = self.transport.send(peer, &tree.descriptor().into()).await {
                lock(&self.announced).remove(&key);
                return Err(err.into());
            }
        }
        self.transport.send(peer, &envelope.into()).await?;
        Ok(())
    }
}

/// Dispatches `envelope` on `node`.
///
/// A node that retired but is still listed counts as gone.
fn deliver(node: &Node, envelope: Envelope) -> Result<(), OverlayError> {
    match node.dispatch(envelope) {
        Err(DispatchError::Retired) => Err(OverlayError::UnknownInstance(*node.token())),
        res => Ok(res?),
    }
}
