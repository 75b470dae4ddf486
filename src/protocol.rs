// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the dispatch engine and protocol implementations.
//!
//! A protocol is registered on an [`crate::Overlay`] under a name, together
//! with a [`ProtocolFactory`]. For every new instance the overlay builds a
//! [`Node`] and calls the factory with it. The factory registers delivery
//! targets on the node and returns the [`ProtocolInstance`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Envelope;
use crate::node::{DispatchError, Node, RegisterError, SendError};

/// Errors raised by protocol implementations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("registering delivery target failed")]
    Register(#[from] RegisterError),
    #[error("sending message failed")]
    Send(#[from] SendError),
    #[error("instance not yet attached to its node")]
    NotInstantiated,
    #[error("only the root may start this protocol")]
    NotRoot,
    #[error("instance started before it was configured")]
    NotConfigured,
    #[error("{0}")]
    Other(String),
}

/// Builds the protocol instance for a freshly created [`Node`].
///
/// No overlay lock is held while the factory runs. If two creations of the
/// same token race, both may call the factory and the instance that loses is
/// cancelled before it ever starts.
pub type ProtocolFactory =
    Arc<dyn Fn(Arc<Node>) -> Result<Arc<dyn ProtocolInstance>, ProtocolError> + Send + Sync>;

/// Pluggable unit implementing a specific tree protocol.
#[async_trait]
pub trait ProtocolInstance: Send + Sync + 'static {
    /// Starts the protocol.
    ///
    /// Called on the root by whoever created the instance. This is usually
    /// where the first messages are sent to the children.
    async fn start(&self) -> Result<(), ProtocolError>;

    /// Receives a batch of same-typed messages no target was registered for.
    ///
    /// The default implementation rejects every batch.
    fn dispatch(&self, batch: Vec<Envelope>) -> Result<(), DispatchError> {
        Err(DispatchError::Unhandled(
            batch.first().map(|env| env.msg_type),
        ))
    }

    /// Runs the instance's event loop, if it has one.
    ///
    /// Spawned as its own task by the overlay right after creation.
    async fn run(self: Arc<Self>) {}

    /// Gives access to the concrete instance type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
