//! Minimal actor substrate: mailboxes, handles, supervision and remote delivery.
//!
//! Every actor owns a mailbox task that processes messages strictly one at a
//! time. Handles are cheap to clone and hide whether the actor is local or
//! reached through a [`RemoteTransport`].

mod handle;
mod supervisor;
mod system;
mod transport;

pub use handle::{ActorHandle, Handle, LocalHandle};
pub use supervisor::{Directive, LoggingSupervisor, StopSupervisor, Supervisor};
pub use system::{ActorContext, ActorSystem, Behavior, Router};
pub use transport::{LocalNetwork, RemoteHandle, RemoteTransport};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// An opaque message: a tag naming the operation and its encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub tag: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    /// Build a message whose payload is `value` encoded with MessagePack.
    pub fn encode<T: Serialize>(tag: impl Into<String>, value: &T) -> Result<Self, ClusterError> {
        Ok(Self::new(tag, crate::error::encode(value)?))
    }

    /// Decode the payload of a message built with [`Message::encode`].
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClusterError> {
        crate::error::decode(&self.payload)
    }
}
