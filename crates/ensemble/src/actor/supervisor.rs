use crate::error::ClusterError;
use crate::types::ActorAddress;

/// What an actor does after its behavior fails on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep the current state and continue with the next message.
    Resume,
    /// Stop the actor. Queued messages are failed.
    Stop,
}

/// Failure policy consulted whenever a behavior returns an error.
///
/// The failed caller always receives the error; the directive only decides
/// the fate of the actor itself.
pub trait Supervisor: Send + Sync {
    fn on_failure(&self, address: &ActorAddress, error: &ClusterError) -> Directive;
}

/// Logs the failure and resumes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSupervisor;

impl Supervisor for LoggingSupervisor {
    fn on_failure(&self, address: &ActorAddress, error: &ClusterError) -> Directive {
        tracing::warn!(actor = %address, error = %error, "actor failed handling message, resuming");
        Directive::Resume
    }
}

/// Logs the failure and stops the actor.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopSupervisor;

impl Supervisor for StopSupervisor {
    fn on_failure(&self, address: &ActorAddress, error: &ClusterError) -> Directive {
        tracing::warn!(actor = %address, error = %error, "actor failed handling message, stopping");
        Directive::Stop
    }
}
