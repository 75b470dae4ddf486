// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Registry of protocol kinds known to an overlay.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::RwLock;

use super::OverlayError;
use crate::protocol::ProtocolFactory;
use crate::sync::{read, write};
use crate::types::ProtocolId;

struct Registration {
    name: String,
    factory: ProtocolFactory,
}

/// Maps protocol kinds to the factories building their instances.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<ProtocolId, Registration>>,
}

impl ProtocolRegistry {
    /// Registers `factory` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::ProtocolAlreadyRegistered`] if `name` is taken.
    pub fn register(&self, name: &str, factory: ProtocolFactory) -> Result<ProtocolId, OverlayError> {
        let id = ProtocolId::from_name(name);
        let mut protocols = write(&self.protocols);
        match protocols.entry(id) {
            Entry::Occupied(_) => Err(OverlayError::ProtocolAlreadyRegistered(name.to_owned())),
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    name: name.to_owned(),
                    factory,
                });
                Ok(id)
            }
        }
    }

    /// Looks up the factory for the protocol kind `id`.
    #[must_use]
    pub fn factory(&self, id: &ProtocolId) -> Option<ProtocolFactory> {
        let protocols = read(&self.protocols);
        protocols.get(id).map(|r| r.factory.clone())
    }

    /// Resolves a registered protocol name to its kind.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        let id = ProtocolId::from_name(name);
        let protocols = read(&self.protocols);
        protocols.contains_key(&id).then_some(id)
    }

    /// Name under which protocol kind `id` was registered.
    #[must_use]
    pub fn name(&self, id: &ProtocolId) -> Option<String> {
        let protocols = read(&self.protocols);
        protocols.get(id).map(|r| r.name.clone())
    }
}
