// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process network interface.
//!
//! [`LocalNetwork`] instances communicate with each other via an underlying
//! [`LocalNetworkCore`], which links them together. The core hands each
//! frame to a per-peer delivery task, which holds it back for the configured
//! latency. Since every frame experiences the same latency, frames between
//! any pair of peers arrive in the order they were sent.
//!
//! Individual directed links can be broken to simulate unreachable peers.
//! Frames on a broken link are silently dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{trace, warn};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;

use super::{Frame, NetworkError, Transport};
use crate::types::PeerId;

struct LocalPacket {
    deliver_at: Instant,
    payload: Vec<u8>,
}

/// In-process network core, where frames are routed between peers.
pub struct LocalNetworkCore {
    /// Map from peer ID to channel for delivering packets.
    peers: RwLock<HashMap<PeerId, mpsc::UnboundedSender<LocalPacket>>>,
    /// Directed links `(from, to)` that drop every frame.
    broken: RwLock<HashSet<(PeerId, PeerId)>>,
    /// Delay applied to every frame.
    latency: Duration,
}

impl Default for LocalNetworkCore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetworkCore {
    /// Creates a new network core without any peers and without latency.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            broken: RwLock::new(HashSet::new()),
            latency: Duration::ZERO,
        }
    }

    /// Turns this instance into a new instance with a different latency.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds a peer to the network.
    ///
    /// Returns a [`LocalNetwork`] interface for the peer.
    /// A new task is spawned that handles the delayed delivery of any frames
    /// targeting that peer.
    pub async fn join(self: &Arc<Self>, id: PeerId) -> LocalNetwork {
        // core -> background
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel::<LocalPacket>();
        // background -> receiver
        let (br_tx, br_rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(id, cb_tx);

        // background task: hold back each packet until its delivery time
        tokio::spawn(async move {
            while let Some(packet) = cb_rx.recv().await {
                tokio::time::sleep_until(packet.deliver_at).await;
                if br_tx.send(packet.payload).is_err() {
                    break;
                }
            }
        });

        LocalNetwork {
            id,
            core: Arc::clone(self),
            receiver: Mutex::new(br_rx),
        }
    }

    /// Removes a peer from the network, as if it crashed.
    ///
    /// Frames already in flight towards the peer are still delivered.
    pub async fn leave(&self, id: PeerId) {
        self.peers.write().await.remove(&id);
    }

    /// Breaks the directed link from `from` to `to`.
    pub async fn break_link(&self, from: PeerId, to: PeerId) {
        self.broken.write().await.insert((from, to));
    }

    /// Repairs a directed link previously broken with [`Self::break_link`].
    pub async fn repair_link(&self, from: PeerId, to: PeerId) {
        self.broken.write().await.remove(&(from, to));
    }

    /// Sends serialized bytes from one peer to another.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownPeer`] if `to` never joined or left,
    /// and [`NetworkError::Closed`] if its delivery task is gone.
    pub async fn send(&self, payload: Vec<u8>, from: PeerId, to: PeerId) -> Result<(), NetworkError> {
        if self.broken.read().await.contains(&(from, to)) {
            trace!("dropping {} bytes on broken link {from} -> {to}", payload.len());
            return Ok(());
        }
        let packet = LocalPacket {
            deliver_at: Instant::now() + self.latency,
            payload,
        };
        let peers = self.peers.read().await;
        let channel = peers.get(&to).ok_or(NetworkError::UnknownPeer(to))?;
        channel.send(packet).map_err(|_| NetworkError::Closed)
    }
}

/// An in-process network interface for local testing and simulations.
pub struct LocalNetwork {
    /// ID of the peer this network interface belongs to.
    id: PeerId,
    /// Reference to the network core this interface is attached to.
    core: Arc<LocalNetworkCore>,
    /// Receiver for incoming frames.
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Transport for LocalNetwork {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    async fn send(&self, to: PeerId, frame: &Frame) -> Result<(), NetworkError> {
        let bytes = frame.to_bytes()?;
        self.core.send(bytes, self.id, to).await
    }

    async fn receive(&self) -> Result<Frame, NetworkError> {
        loop {
            let Some(bytes) = self.receiver.lock().await.recv().await else {
                return Err(NetworkError::Closed);
            };
            match Frame::from_bytes(&bytes) {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    warn!("deserializing frame failed with {err:?}");
                }
            }
        }
    }
}
