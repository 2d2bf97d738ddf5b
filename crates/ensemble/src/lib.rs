//! Leader-elected sharding, passivation and event-sourced persistence for
//! clustered actors.
//!
//! Every addressable instance is owned by exactly one node at a time. The
//! owner is decided by an election over a coordination service, idle
//! instances are passivated without dropping messages, and instance state is
//! journaled transactionally with strictly increasing sequence numbers.

pub mod actor;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod demo;
pub mod dispatcher;
pub mod election;
pub mod error;
pub mod fatal;
pub mod hash;
pub mod instance_runner;
pub mod membership;
pub mod metrics;
pub mod persistence;
pub mod singleton;
pub mod testing;
pub mod types;

pub use cluster::ClusterNode;
pub use config::ClusterConfig;
pub use error::ClusterError;

/// Commonly used items.
pub mod prelude {
    pub use crate::actor::{
        ActorContext, ActorHandle, ActorSystem, Behavior, Handle, LoggingSupervisor, Message,
    };
    pub use crate::cluster::ClusterNode;
    pub use crate::config::ClusterConfig;
    pub use crate::dispatcher::{MessageToId, ShardedDispatcher};
    pub use crate::error::ClusterError;
    pub use crate::persistence::transactional::{EventBuffer, PersistentHandler, StateCell};
    pub use crate::types::{ActorAddress, EntityId, HostPort, MemberId};
}
