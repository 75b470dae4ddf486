// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reliable broadcast with a quorum-tolerant timeout.
//!
//! The root sends [`SendData`] to itself, and from there it floods down the
//! tree. Every non-root node acknowledges receipt to its parent with a
//! [`Reply`] and forwards one further [`Reply`] upwards for every one it
//! receives from below. The root therefore ends up with one acknowledgment
//! per descendant that got the data.
//!
//! Every node restarts its timer on every event, using the timeout carried in
//! the data message. If the timer fires before every descendant acknowledged,
//! the run still succeeds as long as at most `allowed_failures` of them are
//! missing. Otherwise the root reports [`PropagateError::Timeout`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use arbor::propagate::new_propagation_func;
//! use arbor::{Overlay, Roster};
//!
//! async fn broadcast(overlay: &Arc<Overlay>, roster: &Arc<Roster>) {
//!     let func = new_propagation_func::<String, _>(overlay, "greeting", |_| {}, None).unwrap();
//!     let msg = "hello".to_string();
//!     let acks = func.propagate(roster, &msg, Duration::from_secs(5)).await.unwrap();
//!     assert!(acks <= roster.len());
//! }
//! ```

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::message::{self, Message, Received};
use crate::node::{IMMEDIATE_DELIVERY, Node};
use crate::overlay::{Overlay, OverlayError};
use crate::protocol::{ProtocolError, ProtocolFactory, ProtocolInstance};
use crate::sync::lock;
use crate::tree::{Tree, TreeError};
use crate::Roster;

/// Payload flooding down the tree, with the timeout chosen by the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendData {
    pub data: Vec<u8>,
    pub timeout_ms: u64,
}

impl Message for SendData {
    const NAME: &'static str = "arbor::propagate::SendData";
}

/// Acknowledgment travelling up the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply;

impl Message for Reply {
    const NAME: &'static str = "arbor::propagate::Reply";
}

/// Errors reported by a propagation run.
#[derive(Debug, Error)]
pub enum PropagateError {
    #[error("building tree failed")]
    Tree(#[from] TreeError),
    #[error("overlay error")]
    Overlay(#[from] OverlayError),
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),
    #[error("encoding payload failed")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("timed out with {received} of {required} required acknowledgments")]
    Timeout { received: usize, required: usize },
    #[error("propagation cancelled")]
    Cancelled,
    #[error("instance is not a propagation of this message type")]
    UnexpectedInstance,
}

type OnData<M> = Arc<dyn Fn(M) + Send + Sync>;
type OnDone = Box<dyn FnOnce(usize) + Send>;
type Outcome = Result<usize, PropagateError>;

struct Inbox {
    data: mpsc::UnboundedReceiver<Received<SendData>>,
    replies: mpsc::UnboundedReceiver<Received<Reply>>,
}

/// Propagation instance on one peer.
pub struct Propagate<M> {
    node: Arc<Node>,
    allowed_failures: usize,
    initial_wait: Duration,
    inbox: Mutex<Option<Inbox>>,
    payload: Mutex<Option<SendData>>,
    on_data: Mutex<Option<OnData<M>>>,
    on_done: Mutex<Option<OnDone>>,
    result_tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    result_rx: Mutex<Option<oneshot::Receiver<Outcome>>>,
}

impl<M> Propagate<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates the instance and registers its message channels on `node`.
    ///
    /// # Errors
    ///
    /// Fails if the propagation messages are already bound on `node`.
    pub fn new(
        node: Arc<Node>,
        allowed_failures: usize,
        initial_wait: Duration,
    ) -> Result<Arc<Self>, ProtocolError> {
        node.set_flag(IMMEDIATE_DELIVERY);
        let (data_tx, data) = mpsc::unbounded_channel();
        node.register_channel(data_tx)?;
        let (reply_tx, replies) = mpsc::unbounded_channel();
        node.register_channel(reply_tx)?;
        let (result_tx, result_rx) = oneshot::channel();
        Ok(Arc::new(Self {
            node,
            allowed_failures,
            initial_wait,
            inbox: Mutex::new(Some(Inbox { data, replies })),
            payload: Mutex::new(None),
            on_data: Mutex::new(None),
            on_done: Mutex::new(None),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
        }))
    }

    /// Sets the message and timeout the root will send on start.
    ///
    /// # Errors
    ///
    /// Fails if `msg` cannot be encoded.
    pub fn config(&self, msg: &M, timeout: Duration) -> Result<(), PropagateError> {
        let data = message::encode(msg)?;
        *lock(&self.payload) = Some(SendData {
            data,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
        Ok(())
    }

    /// Calls `on_data` with the decoded message once it reaches this peer.
    pub fn register_on_data(&self, on_data: impl Fn(M) + Send + Sync + 'static) {
        *lock(&self.on_data) = Some(Arc::new(on_data));
    }

    /// Calls `on_done` with the number of peers that got the message.
    ///
    /// Only called at the root, and only if the run succeeds.
    pub fn register_on_done(&self, on_done: impl FnOnce(usize) + Send + 'static) {
        *lock(&self.on_done) = Some(Box::new(on_done));
    }

    /// Takes the receiver for the final outcome at the root.
    ///
    /// Returns `None` if it was already taken.
    pub fn result(&self) -> Option<oneshot::Receiver<Outcome>> {
        lock(&self.result_rx).take()
    }

    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn set_on_data(&self, on_data: OnData<M>) {
        *lock(&self.on_data) = Some(on_data);
    }

    async fn handle_data(&self, data: &SendData) {
        let on_data = lock(&self.on_data).clone();
        if let Some(on_data) = on_data {
            match message::decode::<M>(&data.data) {
                Ok(msg) => on_data(msg),
                Err(err) => warn!("{}: decoding propagated data failed: {err}", self.node.token()),
            }
        }
        if !self.node.is_root() {
            if let Err(err) = self.node.send_to_parent(&Reply).await {
                warn!("{}: acknowledging to parent failed: {err}", self.node.token());
            }
        }
        if !self.node.is_leaf() {
            if let Err(err) = self.node.send_to_children(data).await {
                warn!("{}: forwarding data failed: {err}", self.node.token());
            }
        }
    }

    /// Waits for data and acknowledgments, returns the acknowledgment count.
    async fn collect(&self, mut inbox: Inbox) -> Outcome {
        let cancel = self.node.cancellation_token();
        let expected = self.node.tree_node().descendants();
        let required = expected.saturating_sub(self.allowed_failures);
        let mut wait = self.initial_wait;
        let mut has_data = false;
        let mut received = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(PropagateError::Cancelled),
                Some(data) = inbox.data.recv() => {
                    if has_data {
                        debug!("{}: ignoring repeated data", self.node.token());
                    } else {
                        has_data = true;
                        wait = Duration::from_millis(data.msg.timeout_ms);
                        self.handle_data(&data.msg).await;
                    }
                }
                Some(_) = inbox.replies.recv() => {
                    received += 1;
                    trace!("{}: {received} of {expected} acknowledgments", self.node.token());
                    if !self.node.is_root() {
                        if let Err(err) = self.node.send_to_parent(&Reply).await {
                            warn!("{}: forwarding acknowledgment failed: {err}", self.node.token());
                        }
                    }
                }
                () = tokio::time::sleep(wait) => {
                    if has_data && received >= required {
                        debug!(
                            "{}: timed out with {received} of {expected} acknowledgments, quorum reached",
                            self.node.token()
                        );
                        return Ok(received);
                    }
                    return Err(PropagateError::Timeout { received, required });
                }
            }
            if has_data && received >= expected {
                return Ok(received);
            }
        }
    }
}

#[async_trait]
impl<M> ProtocolInstance for Propagate<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    async fn start(&self) -> Result<(), ProtocolError> {
        if !self.node.is_root() {
            return Err(ProtocolError::NotRoot);
        }
        let payload = lock(&self.payload).clone().ok_or(ProtocolError::NotConfigured)?;
        self.node.send_to(self.node.index(), &payload).await?;
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let Some(inbox) = lock(&self.inbox).take() else {
            return;
        };
        let done = self.node.done();
        let outcome = self.collect(inbox).await;

        if self.node.is_root() {
            // the root counts itself
            let outcome = outcome.map(|received| received + 1);
            if let Ok(count) = outcome {
                debug!("{}: propagation reached {count} peers", self.node.token());
                let on_done = lock(&self.on_done).take();
                if let Some(on_done) = on_done {
                    on_done(count);
                }
            }
            let result_tx = lock(&self.result_tx).take();
            if let Some(tx) = result_tx {
                let _ = tx.send(outcome);
            }
        } else if let Err(err) = outcome {
            warn!("{}: {err}", self.node.token());
        }
        done.signal();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle for starting propagation runs of one registered protocol.
pub struct PropagationFunc<M> {
    overlay: Arc<Overlay>,
    name: String,
    _msg: PhantomData<fn(M)>,
}

impl<M> PropagationFunc<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Propagates `msg` to every peer of `roster`, with this peer as root.
    ///
    /// Returns the number of peers that acknowledged, including this one.
    ///
    /// # Errors
    ///
    /// Returns [`PropagateError::Timeout`] if too few peers acknowledged
    /// within `timeout`, and other variants if the run cannot be set up.
    pub async fn propagate(
        &self,
        roster: &Arc<Roster>,
        msg: &M,
        timeout: Duration,
    ) -> Result<usize, PropagateError> {
        let tree = Tree::new_nary(
            Arc::clone(roster),
            self.overlay.config().branching_factor,
            self.overlay.peer_id(),
        )?;
        let node = self.overlay.create_protocol(&self.name, tree)?;
        let propagate = node
            .instance()
            .and_then(|instance| instance.as_any().downcast::<Propagate<M>>().ok())
            .ok_or(PropagateError::UnexpectedInstance)?;
        let result = propagate.result().ok_or(PropagateError::UnexpectedInstance)?;
        propagate.config(msg, timeout)?;
        if let Err(err) = node.start().await {
            node.cancel();
            return Err(err.into());
        }
        result.await.map_err(|_| PropagateError::Cancelled)?
    }
}

/// Registers a propagation protocol for messages of type `M` under `name`.
///
/// Every peer running the protocol calls `on_data` once the message reaches
/// it. Without an explicit `allowed_failures`, the overlay configuration
/// decides, and after that the Byzantine default of the roster.
///
/// # Errors
///
/// Returns [`OverlayError::ProtocolAlreadyRegistered`] if `name` is taken.
pub fn new_propagation_func<M, F>(
    overlay: &Arc<Overlay>,
    name: &str,
    on_data: F,
    allowed_failures: Option<usize>,
) -> Result<PropagationFunc<M>, OverlayError>
where
    M: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(M) + Send + Sync + 'static,
{
    let on_data: OnData<M> = Arc::new(on_data);
    let config = overlay.config().clone();
    let factory: ProtocolFactory = Arc::new(
        move |node: Arc<Node>| -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
            let allowed_failures = allowed_failures
                .or(config.allowed_failures)
                .unwrap_or_else(|| node.roster().default_allowed_failures());
            let propagate = Propagate::<M>::new(node, allowed_failures, config.initial_wait())?;
            propagate.set_on_data(Arc::clone(&on_data));
            Ok(propagate)
        },
    );
    overlay.register_protocol(name, factory)?;
    Ok(PropagationFunc {
        overlay: Arc::clone(overlay),
        name: name.to_owned(),
        _msg: PhantomData,
    })
}
