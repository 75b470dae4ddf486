// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-instance dispatch engine.
//!
//! A [`Node`] is the only handle a [`ProtocolInstance`] has on the outside
//! world. It is bound to one [`Token`] and one position in one [`Tree`].
//!
//! Incoming messages are aggregated before delivery:
//! - messages from the parent (or from this node itself) are delivered
//!   immediately, as a batch of one
//! - with [`IMMEDIATE_DELIVERY`] set, every message is delivered immediately
//! - otherwise, messages from children are buffered per message type and
//!   sender, and delivered as one batch once every child has sent one
//!
//! Batches go to the channel or handler registered for their message type,
//! or to [`ProtocolInstance::dispatch`] if there is none.
//!
//! Completion is reference-counted: every call to [`Node::done`] hands out a
//! [`DoneHandle`], and the node retires from the overlay once all handles
//! have signaled.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{Envelope, Message, MessageType, Received};
use crate::network::NetworkError;
use crate::overlay::Overlay;
use crate::protocol::{ProtocolError, ProtocolInstance};
use crate::sync::lock;
use crate::tree::{Tree, TreeNode, TreeNodeIndex};
use crate::types::{PeerId, Token};
use crate::Roster;

/// Flag: deliver every message immediately, never aggregate.
pub const IMMEDIATE_DELIVERY: u32 = 1 << 0;

/// Errors when binding a message type to a delivery target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("message type {0} already has a delivery target")]
    AlreadyRegistered(MessageType),
    #[error("message type {0} was already received before registration")]
    AlreadyReceiving(MessageType),
}

/// Errors when dispatching an incoming message.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sender {from} is not a child of {to}")]
    NotAChild {
        from: TreeNodeIndex,
        to: TreeNodeIndex,
    },
    #[error("duplicate message of type {msg_type} from {from}")]
    DuplicateSender {
        from: TreeNodeIndex,
        msg_type: MessageType,
    },
    #[error("payload does not match the shape registered for type {msg_type}")]
    ChannelShapeInvalid {
        msg_type: MessageType,
        #[source]
        source: bincode::error::DecodeError,
    },
    #[error("delivery channel for type {0} is closed")]
    ChannelClosed(MessageType),
    #[error("no delivery target for message type {0:?}")]
    Unhandled(Option<MessageType>),
    #[error("message handler failed")]
    Handler(#[from] ProtocolError),
    #[error("instance not yet attached to its node")]
    NotInstantiated,
    #[error("instance already retired")]
    Retired,
}

/// Errors when sending a message from a node.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("root has no parent")]
    NoParent,
    #[error("no tree node {0}")]
    UnknownTreeNode(TreeNodeIndex),
    #[error("overlay is gone")]
    OverlayGone,
    #[error("serialization error")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("network error")]
    Network(#[from] NetworkError),
}

/// Where batches of one message type end up.
trait Target: Send + Sync {
    fn deliver(&self, batch: Vec<Envelope>) -> Result<(), DispatchError>;
}

fn decode_batch<M: Message>(batch: Vec<Envelope>) -> Result<Vec<Received<M>>, DispatchError> {
    batch
        .into_iter()
        .map(|env| {
            env.decode::<M>()
                .map(|msg| Received { from: env.from, msg })
                .map_err(|source| DispatchError::ChannelShapeInvalid {
                    msg_type: env.msg_type,
                    source,
                })
        })
        .collect()
}

struct ChannelTarget<M> {
    sender: mpsc::UnboundedSender<Received<M>>,
}

impl<M: Message> Target for ChannelTarget<M> {
    fn deliver(&self, batch: Vec<Envelope>) -> Result<(), DispatchError> {
        for received in decode_batch::<M>(batch)? {
            self.sender
                .send(received)
                .map_err(|_| DispatchError::ChannelClosed(M::message_type()))?;
        }
        Ok(())
    }
}

struct HandlerTarget<M, F> {
    handler: F,
    _msg_type: PhantomData<fn() -> M>,
}

impl<M, F> Target for HandlerTarget<M, F>
where
    M: Message,
    F: Fn(Vec<Received<M>>) -> Result<(), ProtocolError> + Send + Sync,
{
    fn deliver(&self, batch: Vec<Envelope>) -> Result<(), DispatchError> {
        let batch = decode_batch::<M>(batch)?;
        (self.handler)(batch)?;
        Ok(())
    }
}

#[derive(Default)]
struct DispatchState {
    targets: HashMap<MessageType, Arc<dyn Target>>,
    /// Buffered child messages, by type and sender.
    queues: HashMap<MessageType, BTreeMap<TreeNodeIndex, Envelope>>,
    /// Types that have been received at least once.
    seen: HashSet<MessageType>,
}

#[derive(Default)]
struct Completion {
    issued: usize,
    signaled: usize,
    retired: bool,
    /// Set once the overlay's table holds this node.
    listed: bool,
}

/// Dispatch context of one protocol instance.
pub struct Node {
    token: Token,
    index: TreeNodeIndex,
    tree: Arc<Tree>,
    overlay: Weak<Overlay>,
    instance: Mutex<Option<Arc<dyn ProtocolInstance>>>,
    state: Mutex<DispatchState>,
    flags: AtomicU32,
    completion: Mutex<Completion>,
    cancel: CancellationToken,
}

impl Node {
    /// Creates a node for position `index` of `tree`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a position in `tree`.
    pub(crate) fn new(
        token: Token,
        tree: Arc<Tree>,
        index: TreeNodeIndex,
        overlay: Weak<Overlay>,
        cancel: CancellationToken,
    ) -> Self {
        assert!(index.get() < tree.len(), "node index outside of tree");
        Self {
            token,
            index,
            tree,
            overlay,
            instance: Mutex::new(None),
            state: Mutex::new(DispatchState::default()),
            flags: AtomicU32::new(0),
            completion: Mutex::new(Completion::default()),
            cancel,
        }
    }

    /// Binds the instance built for this node.
    ///
    /// An instance built for a node that already retired is dropped.
    pub(crate) fn attach(&self, instance: Arc<dyn ProtocolInstance>) {
        let completion = lock(&self.completion);
        if !completion.retired {
            *lock(&self.instance) = Some(instance);
        }
    }

    /// Records that the overlay's table now holds this node.
    ///
    /// From then on, teardown removes the node from the overlay. Returns
    /// `false` if the node already retired before being listed, in which
    /// case the caller has to remove it.
    pub(crate) fn mark_listed(&self) -> bool {
        let mut completion = lock(&self.completion);
        if completion.retired {
            return false;
        }
        completion.listed = true;
        true
    }

    #[must_use]
    pub const fn token(&self) -> &Token {
        &self.token
    }

    #[must_use]
    pub const fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    #[must_use]
    pub fn roster(&self) -> &Arc<Roster> {
        self.tree.roster()
    }

    /// Position of this node in its tree.
    #[must_use]
    pub const fn index(&self) -> TreeNodeIndex {
        self.index
    }

    #[must_use]
    pub fn tree_node(&self) -> &TreeNode {
        &self.tree[self.index]
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.tree_node().peer()
    }

    #[must_use]
    pub fn parent(&self) -> Option<TreeNodeIndex> {
        self.tree_node().parent()
    }

    #[must_use]
    pub fn children(&self) -> &[TreeNodeIndex] {
        self.tree_node().children()
    }

    #[must_use]
    pub fn root(&self) -> &TreeNode {
        self.tree.root()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.tree_node().is_root()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.tree_node().is_leaf()
    }

    /// The protocol instance driven by this node, unless it already retired.
    #[must_use]
    pub fn instance(&self) -> Option<Arc<dyn ProtocolInstance>> {
        lock(&self.instance).clone()
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Delivers every message of type `M` to `sender`, one at a time.
    ///
    /// # Errors
    ///
    /// Fails if type `M` already has a target or was already received.
    pub fn register_channel<M: Message>(
        &self,
        sender: mpsc::UnboundedSender<Received<M>>,
    ) -> Result<(), RegisterError> {
        self.register_target(M::message_type(), Arc::new(ChannelTarget { sender }))
    }

    /// Delivers every batch of type `M` to `handler`.
    ///
    /// # Errors
    ///
    /// Fails if type `M` already has a target or was already received.
    pub fn register_handler<M, F>(&self, handler: F) -> Result<(), RegisterError>
    where
        M: Message,
        F: Fn(Vec<Received<M>>) -> Result<(), ProtocolError> + Send + Sync + 'static,
    {
        let target = HandlerTarget {
            handler,
            _msg_type: PhantomData,
        };
        self.register_target(M::message_type(), Arc::new(target))
    }

    fn register_target(
        &self,
        msg_type: MessageType,
        target: Arc<dyn Target>,
    ) -> Result<(), RegisterError> {
        let mut state = lock(&self.state);
        if state.seen.contains(&msg_type) {
            return Err(RegisterError::AlreadyReceiving(msg_type));
        }
        match state.targets.entry(msg_type) {
            Entry::Occupied(_) => Err(RegisterError::AlreadyRegistered(msg_type)),
            Entry::Vacant(entry) => {
                entry.insert(target);
                Ok(())
            }
        }
    }

    /// Aggregates an incoming message and delivers any completed batch.
    ///
    /// Never blocks: delivery is either a channel send on an unbounded
    /// channel or a synchronous handler call.
    ///
    /// # Errors
    ///
    /// Fails if the sender may not contribute to aggregation, if it already
    /// contributed to the pending batch, or if delivery fails.
    pub fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        if self.is_retired() {
            return Err(DispatchError::Retired);
        }
        let msg_type = envelope.msg_type;
        let from = envelope.from;

        let (batch, target) = {
            let mut state = lock(&self.state);
            state.seen.insert(msg_type);
            let immediate = from == self.index
                || Some(from) == self.parent()
                || self.has_flag(IMMEDIATE_DELIVERY);
            let batch = if immediate {
                vec![envelope]
            } else {
                let children = self.children();
                if !children.contains(&from) {
                    return Err(DispatchError::NotAChild {
                        from,
                        to: self.index,
                    });
                }
                let queue = state.queues.entry(msg_type).or_default();
                if queue.contains_key(&from) {
                    return Err(DispatchError::DuplicateSender { from, msg_type });
                }
                queue.insert(from, envelope);
                if queue.len() < children.len() {
                    trace!(
                        "{}: buffered {} of {} messages of type {msg_type}",
                        self.token,
                        queue.len(),
                        children.len()
                    );
                    return Ok(());
                }
                state
                    .queues
                    .remove(&msg_type)
                    .unwrap_or_default()
                    .into_values()
                    .collect()
            };
            (batch, state.targets.get(&msg_type).cloned())
        };

        trace!(
            "{}: delivering batch of {} messages of type {msg_type}",
            self.token,
            batch.len()
        );
        match target {
            Some(target) => target.deliver(batch),
            None => self
                .instance()
                .ok_or(DispatchError::NotInstantiated)?
                .dispatch(batch),
        }
    }

    /// Starts the protocol instance.
    ///
    /// # Errors
    ///
    /// Returns whatever error the instance's start returns.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let instance = self.instance().ok_or(ProtocolError::NotInstantiated)?;
        instance.start().await
    }

    /// Sends `msg` to the node at position `to` of this node's tree.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be encoded or the overlay cannot send it.
    pub async fn send_to<M: Message>(&self, to: TreeNodeIndex, msg: &M) -> Result<(), SendError> {
        let overlay = self.overlay.upgrade().ok_or(SendError::OverlayGone)?;
        let envelope = Envelope::new(self.token, self.index, msg)?;
        overlay.send_envelope(&self.tree, to, envelope).await
    }

    /// Sends `msg` to the parent of this node.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NoParent`] at the root, otherwise as [`Node::send_to`].
    pub async fn send_to_parent<M: Message>(&self, msg: &M) -> Result<(), SendError> {
        let parent = self.parent().ok_or(SendError::NoParent)?;
        self.send_to(parent, msg).await
    }

    /// Sends `msg` to all children of this node in parallel.
    ///
    /// Every child is attempted, even if sending to an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered, if any.
    pub async fn send_to_children<M: Message>(&self, msg: &M) -> Result<(), SendError> {
        let overlay = self.overlay.upgrade().ok_or(SendError::OverlayGone)?;
        let envelope = Envelope::new(self.token, self.index, msg)?;
        let sends = self
            .children()
            .iter()
            .map(|child| overlay.send_envelope(&self.tree, *child, envelope.clone()));
        let mut first_err = None;
        for (child, res) in self.children().iter().zip(join_all(sends).await) {
            if let Err(err) = res {
                warn!("{}: sending to child {child} failed: {err}", self.token);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hands out a new completion handle.
    ///
    /// The node retires once every handle handed out so far has signaled.
    #[must_use = "the node only retires once the handle signals"]
    pub fn done(self: &Arc<Self>) -> DoneHandle {
        let mut completion = lock(&self.completion);
        let active = !completion.retired;
        if active {
            completion.issued += 1;
        }
        DoneHandle {
            node: Arc::clone(self),
            active,
        }
    }

    fn complete_one(&self) {
        {
            let mut completion = lock(&self.completion);
            if completion.retired {
                return;
            }
            completion.signaled += 1;
            trace!(
                "{}: completion {} of {}",
                self.token, completion.signaled, completion.issued
            );
            if completion.signaled < completion.issued {
                return;
            }
            completion.retired = true;
        }
        self.teardown();
    }

    /// Tears down the instance right away, without waiting for completions.
    ///
    /// Outstanding [`DoneHandle`]s turn into no-ops.
    pub fn cancel(&self) {
        {
            let mut completion = lock(&self.completion);
            if completion.retired {
                return;
            }
            completion.retired = true;
        }
        debug!("{}: cancelled", self.token);
        self.teardown();
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        lock(&self.completion).retired
    }

    /// Token that fires once this node retires or is cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn teardown(&self) {
        self.cancel.cancel();
        // dropping instance and targets breaks the node <-> instance cycle
        let instance = lock(&self.instance).take();
        {
            let mut state = lock(&self.state);
            state.targets.clear();
            state.queues.clear();
        }
        drop(instance);
        // a node that never made it into the table must not evict the one that did
        let listed = lock(&self.completion).listed;
        if let Some(overlay) = self.overlay.upgrade().filter(|_| listed) {
            overlay.retire(&self.token);
        }
        debug!("{}: retired", self.token);
    }
}

/// Completion handle handed out by [`Node::done`].
///
/// Signals either explicitly with [`DoneHandle::signal`] or when dropped.
pub struct DoneHandle {
    node: Arc<Node>,
    active: bool,
}

impl DoneHandle {
    /// Signals that the unit of work owning this handle has finished.
    pub fn signal(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            self.node.complete_one();
        }
    }
}

impl Drop for DoneHandle {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::test_utils::{SilentInstance, standalone_node};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Vote(u64);

    impl Message for Vote {
        const NAME: &'static str = "test::Vote";
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Other(String);

    impl Message for Other {
        const NAME: &'static str = "test::Other";
    }

    fn envelope<M: Message>(node: &Node, from: u32, msg: &M) -> Envelope {
        Envelope::new(*node.token(), TreeNodeIndex::new(from), msg).unwrap()
    }

    #[test]
    fn aggregates_children() {
        // root with three children
        let (node, _) = standalone_node(4, 3, 0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.register_channel::<Vote>(tx).unwrap();

        node.dispatch(envelope(&node, 2, &Vote(2))).unwrap();
        node.dispatch(envelope(&node, 1, &Vote(1))).unwrap();
        assert!(rx.try_recv().is_err());
        node.dispatch(envelope(&node, 3, &Vote(3))).unwrap();

        // whole batch at once, in child order
        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| (r.from.get(), r.msg.0))
            .collect();
        assert_eq!(got, vec![(1, 1), (2, 2), (3, 3)]);

        // buffer starts from scratch afterwards
        node.dispatch(envelope(&node, 1, &Vote(10))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handler_gets_one_batch() {
        let (node, _) = standalone_node(4, 3, 0);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::clone(&batches);
        node.register_handler::<Vote, _>(move |batch| {
            b.lock().unwrap().push(batch.len());
            Ok(())
        })
        .unwrap();

        for child in 1..=3 {
            node.dispatch(envelope(&node, child, &Vote(u64::from(child))))
                .unwrap();
        }
        assert_eq!(*batches.lock().unwrap(), vec![3]);
    }

    #[test]
    fn types_aggregate_separately() {
        let (node, instance) = standalone_node(3, 2, 0);
        node.dispatch(envelope(&node, 1, &Vote(1))).unwrap();
        node.dispatch(envelope(&node, 1, &Other("a".into()))).unwrap();
        node.dispatch(envelope(&node, 2, &Other("b".into()))).unwrap();
        // falls back to the instance, no target registered
        let batches = instance.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].msg_type, Other::message_type());
        node.dispatch(envelope(&node, 2, &Vote(2))).unwrap();
        assert_eq!(instance.batches().len(), 2);
    }

    #[test]
    fn parent_is_immediate() {
        // peer 1 sits below the root and has children 3 and 4
        let (node, _) = standalone_node(5, 2, 1);
        assert_eq!(node.parent(), Some(TreeNodeIndex::ROOT));
        assert_eq!(node.children().len(), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.register_channel::<Vote>(tx).unwrap();

        node.dispatch(envelope(&node, 0, &Vote(7))).unwrap();
        assert_eq!(rx.try_recv().unwrap().msg, Vote(7));
        node.dispatch(envelope(&node, 0, &Vote(8))).unwrap();
        assert_eq!(rx.try_recv().unwrap().msg, Vote(8));
    }

    #[test]
    fn immediate_flag() {
        let (node, _) = standalone_node(4, 3, 0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.register_channel::<Vote>(tx).unwrap();
        node.set_flag(IMMEDIATE_DELIVERY);
        assert!(node.has_flag(IMMEDIATE_DELIVERY));

        node.dispatch(envelope(&node, 2, &Vote(2))).unwrap();
        assert_eq!(rx.try_recv().unwrap().from, TreeNodeIndex::new(2));
        // duplicates are fine without aggregation
        node.dispatch(envelope(&node, 2, &Vote(3))).unwrap();
        assert_eq!(rx.try_recv().unwrap().msg, Vote(3));

        node.clear_flag(IMMEDIATE_DELIVERY);
        node.dispatch(envelope(&node, 2, &Vote(4))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejects_duplicates_and_strangers() {
        let (node, _) = standalone_node(7, 2, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.register_channel::<Vote>(tx).unwrap();
        let child = node.children()[0].get() as u32;

        node.dispatch(envelope(&node, child, &Vote(1))).unwrap();
        assert!(matches!(
            node.dispatch(envelope(&node, child, &Vote(1))),
            Err(DispatchError::DuplicateSender { .. })
        ));
        // sibling of this node is not a child
        assert!(matches!(
            node.dispatch(envelope(&node, 2, &Vote(1))),
            Err(DispatchError::NotAChild { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn leaf_rejects_child_messages() {
        let (node, _) = standalone_node(3, 2, 2);
        assert!(node.is_leaf());
        assert!(matches!(
            node.dispatch(envelope(&node, 1, &Vote(1))),
            Err(DispatchError::NotAChild { .. })
        ));
    }

    #[test]
    fn registration_rules() {
        let (node, _) = standalone_node(3, 2, 0);
        let (tx, _rx) = mpsc::unbounded_channel::<Received<Vote>>();
        node.register_channel(tx.clone()).unwrap();
        assert_eq!(
            node.register_channel(tx),
            Err(RegisterError::AlreadyRegistered(Vote::message_type()))
        );
        assert_eq!(
            node.register_handler::<Vote, _>(|_| Ok(())),
            Err(RegisterError::AlreadyRegistered(Vote::message_type()))
        );

        node.dispatch(envelope(&node, 1, &Other("x".into()))).unwrap();
        assert_eq!(
            node.register_handler::<Other, _>(|_| Ok(())),
            Err(RegisterError::AlreadyReceiving(Other::message_type()))
        );
    }

    #[test]
    fn shape_mismatch() {
        let (node, _) = standalone_node(2, 1, 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        node.register_channel::<Other>(tx).unwrap();
        let mut env = envelope(&node, 0, &Vote(u64::MAX));
        env.msg_type = Other::message_type();
        assert!(matches!(
            node.dispatch(env),
            Err(DispatchError::ChannelShapeInvalid { .. })
        ));
    }

    #[test]
    fn unhandled_fallback() {
        let (node, _) = standalone_node(2, 1, 1);
        node.attach(Arc::new(SilentInstance));
        assert!(matches!(
            node.dispatch(envelope(&node, 0, &Vote(1))),
            Err(DispatchError::Unhandled(Some(_)))
        ));
    }

    #[test]
    fn done_counts() {
        let (node, _) = standalone_node(2, 1, 0);
        let handles: Vec<_> = (0..5).map(|_| node.done()).collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert!(!node.is_retired(), "retired after {i} signals");
            handle.signal();
        }
        assert!(node.is_retired());
        assert!(node.cancellation_token().is_cancelled());
        assert!(node.instance().is_none());
        assert!(matches!(
            node.dispatch(envelope(&node, 1, &Vote(1))),
            Err(DispatchError::Retired)
        ));
    }

    #[test]
    fn done_handle_signals_on_drop() {
        let (node, _) = standalone_node(2, 1, 0);
        let h1 = node.done();
        let h2 = node.done();
        drop(h2);
        assert!(!node.is_retired());
        drop(h1);
        assert!(node.is_retired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn done_concurrent() {
        for _ in 0..20 {
            let (node, _) = standalone_node(2, 1, 0);
            let handles: Vec<_> = (0..64).map(|_| node.done()).collect();
            let tasks: Vec<_> = handles
                .into_iter()
                .map(|h| tokio::spawn(async move { h.signal() }))
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            assert!(node.is_retired());
        }
    }

    #[test]
    fn cancel_releases_handles() {
        let (node, _) = standalone_node(2, 1, 0);
        let handle = node.done();
        node.cancel();
        assert!(node.is_retired());
        assert!(node.cancellation_token().is_cancelled());
        // no-op after cancellation
        handle.signal();
        let late = node.done();
        late.signal();
        assert!(node.is_retired());
    }

    #[test]
    fn topology_accessors() {
        let (node, _) = standalone_node(10, 8, 9);
        assert_eq!(node.peer_id(), 9);
        assert_eq!(node.parent(), Some(TreeNodeIndex::new(1)));
        assert!(node.is_leaf());
        assert!(!node.is_root());
        assert_eq!(node.root().peer(), 0);
        assert_eq!(node.roster().len(), 10);
    }
}
