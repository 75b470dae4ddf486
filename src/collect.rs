// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Collection of pending transactions from all peers of a tree.
//!
//! The root sends a [`CollectTxRequest`] down the tree. Every peer takes the
//! transactions from its local [`TxSource`], waits for the aggregated answers
//! of all its children, and answers its parent with everything together.
//! The root ends up with the transactions of the whole tree.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::message::{Message, Received};
use crate::node::Node;
use crate::overlay::{Overlay, OverlayError};
use crate::protocol::{ProtocolError, ProtocolFactory, ProtocolInstance};
use crate::sync::lock;
use crate::tree::Tree;
use crate::types::{PeerId, ProtocolId};

/// Opaque transaction payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

/// Asks every peer for its pending transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectTxRequest {
    /// Peer that will use the transactions.
    pub leader: PeerId,
    /// Opaque context for the transaction source.
    pub context: Vec<u8>,
    /// Maximum number of transactions each peer contributes, if limited.
    pub max_txs: Option<u32>,
}

impl Message for CollectTxRequest {
    const NAME: &'static str = "arbor::collect::CollectTxRequest";
}

/// Transactions of one subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectTxResponse {
    pub txs: Vec<Transaction>,
}

impl Message for CollectTxResponse {
    const NAME: &'static str = "arbor::collect::CollectTxResponse";
}

/// Local supplier of pending transactions.
pub type TxSource = Arc<dyn Fn(&CollectTxRequest) -> Vec<Transaction> + Send + Sync>;

/// Errors of a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("overlay error")]
    Overlay(#[from] OverlayError),
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),
    #[error("collection cancelled")]
    Cancelled,
    #[error("instance is not a transaction collection")]
    UnexpectedInstance,
}

struct Inbox {
    requests: mpsc::UnboundedReceiver<Received<CollectTxRequest>>,
    responses: mpsc::UnboundedReceiver<Vec<Received<CollectTxResponse>>>,
}

/// Transaction collection instance on one peer.
pub struct CollectTx {
    node: Arc<Node>,
    source: TxSource,
    /// How long to wait for the answers of all children.
    wait: Duration,
    inbox: Mutex<Option<Inbox>>,
    request: Mutex<Option<CollectTxRequest>>,
    result_tx: Mutex<Option<oneshot::Sender<Vec<Transaction>>>>,
    result_rx: Mutex<Option<oneshot::Receiver<Vec<Transaction>>>>,
}

impl CollectTx {
    /// Creates the instance and registers its delivery targets on `node`.
    ///
    /// # Errors
    ///
    /// Fails if the collection messages are already bound on `node`.
    pub fn new(node: Arc<Node>, source: TxSource, wait: Duration) -> Result<Arc<Self>, ProtocolError> {
        let (request_tx, requests) = mpsc::unbounded_channel();
        node.register_channel(request_tx)?;
        // answers of all children arrive as one aggregated batch
        let (response_tx, responses) = mpsc::unbounded_channel();
        node.register_handler::<CollectTxResponse, _>(move |batch| {
            response_tx
                .send(batch)
                .map_err(|_| ProtocolError::Other("collection already finished".into()))
        })?;
        let (result_tx, result_rx) = oneshot::channel();
        Ok(Arc::new(Self {
            node,
            source,
            wait,
            inbox: Mutex::new(Some(Inbox {
                requests,
                responses,
            })),
            request: Mutex::new(None),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
        }))
    }

    /// Sets the request the root sends on start.
    pub fn config(&self, request: CollectTxRequest) {
        *lock(&self.request) = Some(request);
    }

    /// Takes the receiver for the transactions collected at the root.
    pub fn result(&self) -> Option<oneshot::Receiver<Vec<Transaction>>> {
        lock(&self.result_rx).take()
    }

    async fn serve(&self, inbox: &mut Inbox) -> Option<Vec<Transaction>> {
        let request = inbox.requests.recv().await?.msg;
        let mut txs = (self.source)(&request);
        if let Some(max) = request.max_txs {
            txs.truncate(max as usize);
        }

        if !self.node.is_leaf() {
            if let Err(err) = self.node.send_to_children(&request).await {
                warn!("{}: forwarding request failed: {err}", self.node.token());
            }
            match tokio::time::timeout(self.wait, inbox.responses.recv()).await {
                Ok(Some(batch)) => txs.extend(batch.into_iter().flat_map(|r| r.msg.txs)),
                Ok(None) => {}
                Err(_) => warn!(
                    "{}: children did not answer within {:?}",
                    self.node.token(),
                    self.wait
                ),
            }
        }

        if !self.node.is_root() {
            let response = CollectTxResponse { txs: txs.clone() };
            if let Err(err) = self.node.send_to_parent(&response).await {
                warn!("{}: answering parent failed: {err}", self.node.token());
            }
        }
        Some(txs)
    }
}

#[async_trait]
impl ProtocolInstance for CollectTx {
    async fn start(&self) -> Result<(), ProtocolError> {
        if !self.node.is_root() {
            return Err(ProtocolError::NotRoot);
        }
        let request = lock(&self.request).clone().ok_or(ProtocolError::NotConfigured)?;
        self.node.send_to(self.node.index(), &request).await?;
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let Some(mut inbox) = lock(&self.inbox).take() else {
            return;
        };
        let done = self.node.done();
        let cancel = self.node.cancellation_token();
        let txs = tokio::select! {
            () = cancel.cancelled() => None,
            txs = self.serve(&mut inbox) => txs,
        };
        if self.node.is_root() {
            let result_tx = lock(&self.result_tx).take();
            if let (Some(tx), Some(txs)) = (result_tx, txs) {
                debug!("{}: collected {} transactions", self.node.token(), txs.len());
                let _ = tx.send(txs);
            }
        }
        done.signal();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Registers transaction collection under `name`, served from `source`.
///
/// # Errors
///
/// Returns [`OverlayError::ProtocolAlreadyRegistered`] if `name` is taken.
pub fn register_collect_tx(
    overlay: &Overlay,
    name: &str,
    source: TxSource,
) -> Result<ProtocolId, OverlayError> {
    let wait = overlay.config().default_timeout();
    let factory: ProtocolFactory = Arc::new(
        move |node: Arc<Node>| -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
            Ok(CollectTx::new(node, Arc::clone(&source), wait)?)
        },
    );
    overlay.register_protocol(name, factory)
}

/// Runs transaction collection `name` over `tree`, rooted at this peer.
///
/// # Errors
///
/// Fails if the instance cannot be created or started, or if it is
/// cancelled before the root collected its transactions.
pub async fn collect_txs(
    overlay: &Arc<Overlay>,
    name: &str,
    tree: Tree,
    request: CollectTxRequest,
) -> Result<Vec<Transaction>, CollectError> {
    let node = overlay.create_protocol(name, tree)?;
    let collect = node
        .instance()
        .and_then(|instance| instance.as_any().downcast::<CollectTx>().ok())
        .ok_or(CollectError::UnexpectedInstance)?;
    let result = collect.result().ok_or(CollectError::UnexpectedInstance)?;
    collect.config(request);
    if let Err(err) = node.start().await {
        node.cancel();
        return Err(err.into());
    }
    result.await.map_err(|_| CollectError::Cancelled)
}
