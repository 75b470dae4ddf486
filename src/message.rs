// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed protocol messages and the wire envelope carrying them.
//!
//! Every message kind implements [`Message`], which fixes a stable
//! [`MessageType`] tag derived from the message name. On the wire a message
//! travels as an [`Envelope`]: the tag plus the [`bincode`]-encoded payload.
//! Delivery targets registered on a [`crate::Node`] decode the payload back
//! into the concrete type and hand it out as [`Received`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_all, truncate_u64};
use crate::tree::TreeNodeIndex;
use crate::types::Token;

pub(crate) const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Stable tag identifying a message kind on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MessageType(u64);

impl MessageType {
    /// Derives the tag for the given message name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(truncate_u64(&hash_all(&[b"arbor-message", name.as_bytes()])))
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({:016x})", self.0)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A message kind that protocols can exchange.
///
/// # Examples
///
/// ```
/// use arbor::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Announce {
///     round: u64,
/// }
///
/// impl Message for Announce {
///     const NAME: &'static str = "example::Announce";
/// }
///
/// assert_eq!(Announce::message_type(), Announce::message_type());
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Globally unique name of this message kind.
    const NAME: &'static str;

    /// Tag under which this message kind travels.
    #[must_use]
    fn message_type() -> MessageType {
        MessageType::from_name(Self::NAME)
    }
}

/// A message as delivered to a protocol instance, together with its sender.
#[derive(Clone, Debug)]
pub struct Received<M> {
    /// Position of the sender in the instance's tree.
    pub from: TreeNodeIndex,
    pub msg: M,
}

/// Wire representation of a protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance the message is addressed to.
    pub token: Token,
    /// Position of the sender in the instance's tree.
    pub from: TreeNodeIndex,
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encodes `msg` into a new envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if [`bincode`] encoding of `msg` fails.
    pub fn new<M: Message>(
        token: Token,
        from: TreeNodeIndex,
        msg: &M,
    ) -> Result<Self, bincode::error::EncodeError> {
        Ok(Self {
            token,
            from,
            msg_type: M::message_type(),
            payload: encode(msg)?,
        })
    }

    /// Decodes the payload as message type `M`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid encoding of `M`.
    pub fn decode<M: Message>(&self) -> Result<M, bincode::error::DecodeError> {
        decode(&self.payload)
    }
}

/// Serializes a value with the crate-wide [`bincode`] configuration.
///
/// # Errors
///
/// Returns an error if [`bincode`] encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, BINCODE_CONFIG)
}

/// Deserializes a value with the crate-wide [`bincode`] configuration.
///
/// # Errors
///
/// Returns an error if `bytes` are not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProtocolId, RosterId, TreeId};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Hello {
        text: String,
    }

    impl Message for Hello {
        const NAME: &'static str = "test::Hello";
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Numbers(Vec<u64>);

    impl Message for Numbers {
        const NAME: &'static str = "test::Numbers";
    }

    fn token() -> Token {
        let roster = RosterId::from_bytes([1; 32]);
        let tree = TreeId::from_bytes([2; 32]);
        Token::new(ProtocolId::from_name("test"), tree, roster)
    }

    #[test]
    fn distinct_tags() {
        assert_ne!(Hello::message_type(), Numbers::message_type());
        assert_eq!(Hello::message_type(), MessageType::from_name("test::Hello"));
    }

    #[test]
    fn envelope_carries_typed_payload() {
        let msg = Hello {
            text: "hi".to_string(),
        };
        let env = Envelope::new(token(), TreeNodeIndex::new(3), &msg).unwrap();
        assert_eq!(env.msg_type, Hello::message_type());
        assert_eq!(env.decode::<Hello>().unwrap(), msg);
    }

    #[test]
    fn decode_wrong_shape() {
        let env = Envelope::new(token(), TreeNodeIndex::ROOT, &Numbers(vec![u64::MAX; 4])).unwrap();
        assert!(env.decode::<Hello>().is_err());
    }
}
