// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An abstraction layer for networking.
//!
//! The [`Transport`] trait provides a common interface for delivering
//! [`Frame`]s between peers. Framing, encryption and connection handling are
//! left entirely to implementors.
//!
//! This crate ships one implementation:
//! - [`LocalNetwork`] links peers inside one process via a [`LocalNetworkCore`]
//!
//! # Examples
//!
//! ```
//! use arbor::network::{Frame, Transport};
//!
//! async fn echo(transport: impl Transport, to: u64) {
//!     let frame = transport.receive().await.unwrap();
//!     transport.send(to, &frame).await.unwrap();
//! }
//! ```

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::local::{LocalNetwork, LocalNetworkCore};
use crate::message::{BINCODE_CONFIG, Envelope};
use crate::tree::TreeDescriptor;
use crate::types::PeerId;

/// Maximum size of a serialized frame.
pub const MAX_FRAME_BYTES: usize = 1 << 24;

/// Unit of transmission between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Announces a tree, sent before the first envelope for that tree.
    Tree(TreeDescriptor),
    /// Carries a protocol message.
    Envelope(Envelope),
}

impl Frame {
    /// Tries to deserialize a `Frame` from bytes using [`bincode`].
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Deserialization`] if bincode decoding fails.
    /// This includes the case where `bytes` exceed the limit of [`MAX_FRAME_BYTES`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::Deserialization(
                bincode::error::DecodeError::LimitExceeded,
            ));
        }
        let (frame, _) = bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(frame)
    }

    /// Serializes this frame into owned bytes using [`bincode`].
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Serialization`] if bincode encoding fails,
    /// or [`NetworkError::FrameTooLarge`] if the frame exceeds [`MAX_FRAME_BYTES`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        let bytes = bincode::serde::encode_to_vec(self, BINCODE_CONFIG)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Self::Envelope(envelope)
    }
}

impl From<TreeDescriptor> for Frame {
    fn from(descriptor: TreeDescriptor) -> Self {
        Self::Tree(descriptor)
    }
}

/// Error type for network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("serialization error")]
    Serialization(#[from] bincode::error::EncodeError),
    #[error("deserialization error")]
    Deserialization(#[from] bincode::error::DecodeError),
    #[error("network closed")]
    Closed,
}

/// Abstraction of a network interface for sending and receiving frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local peer.
    fn peer_id(&self) -> PeerId;

    /// Sends `frame` to peer `to`.
    ///
    /// Frames sent from one peer to another must arrive in the order sent.
    async fn send(&self, to: PeerId, frame: &Frame) -> Result<(), NetworkError>;

    /// Receives the next frame addressed to the local peer.
    async fn receive(&self) -> Result<Frame, NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeNodeIndex;
    use crate::types::{ProtocolId, RosterId, Token, TreeId};

    #[test]
    fn frame_bytes() {
        let frame = Frame::Tree(TreeDescriptor {
            peers: vec![3, 1, 2],
            root: 1,
            branching: 2,
        });
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);

        let token = Token::new(
            ProtocolId::from_name("test"),
            TreeId::from_bytes([0; 32]),
            RosterId::from_bytes([0; 32]),
        );
        let frame = Frame::Envelope(Envelope {
            token,
            from: TreeNodeIndex::new(7),
            msg_type: crate::MessageType::from_name("test::Msg"),
            payload: vec![1, 2, 3],
        });
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn deserialize_garbage() {
        assert!(Frame::from_bytes(&[0xff; 3]).is_err());
        let bytes = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(NetworkError::Deserialization(_))
        ));
    }
}
