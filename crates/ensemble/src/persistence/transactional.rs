//! Behavior wrapper that journals every message transactionally.
//!
//! For each message the wrapper opens a journal transaction keyed by the
//! actor's fully qualified name, loads the latest state, lets the handler
//! read and replace it and append events, then writes the final state and the
//! events in one commit. The caller sees the reply only after the commit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::actor::{ActorContext, Behavior, Message};
use crate::error::ClusterError;
use crate::persistence::{persistence_error, JournalStorage, JournalTransaction};

/// Current state of an instance during one message.
#[derive(Debug)]
pub struct StateCell<S> {
    value: S,
}

impl<S> StateCell<S> {
    fn new(value: S) -> Self {
        Self { value }
    }

    pub fn get(&self) -> &S {
        &self.value
    }

    /// Replace the state. May be called any number of times.
    pub fn set(&mut self, value: S) {
        self.value = value;
    }

    fn into_inner(self) -> S {
        self.value
    }
}

/// Events appended while handling one message.
#[derive(Debug)]
pub struct EventBuffer<E> {
    events: Vec<E>,
}

impl<E> EventBuffer<E> {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.events.iter()
    }
}

/// Stateful message handler whose effects are journaled.
#[async_trait]
pub trait PersistentHandler: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Event: Serialize + Send + 'static;

    /// Handle one message. Returning an error discards every state change and
    /// event of this message.
    async fn handle(
        &self,
        state: &mut StateCell<Self::State>,
        events: &mut EventBuffer<Self::Event>,
        ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError>;
}

/// [`Behavior`] adapter running a [`PersistentHandler`] inside journal
/// transactions.
///
/// The actor state of this behavior is the initial state used when the
/// journal has nothing for the instance yet.
pub struct Transactional<H> {
    handler: H,
    journal: Arc<dyn JournalStorage>,
}

impl<H: PersistentHandler> Transactional<H> {
    pub fn new(handler: H, journal: Arc<dyn JournalStorage>) -> Self {
        Self { handler, journal }
    }

    async fn run(
        &self,
        tx: &mut Box<dyn JournalTransaction>,
        initial: &H::State,
        ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError> {
        let (state, sequence) = match tx.get().await? {
            Some(stored) => (
                serde_json::from_value(stored.state)
                    .map_err(|e| persistence_error("failed to decode stored state", e))?,
                stored.sequence,
            ),
            None => (initial.clone(), 0),
        };

        let mut cell = StateCell::new(state);
        let mut buffer = EventBuffer::new();
        let reply = self
            .handler
            .handle(&mut cell, &mut buffer, ctx, message)
            .await?;

        let emitted = buffer.len() as i64;
        let state = serde_json::to_value(cell.into_inner())
            .map_err(|e| persistence_error("failed to encode state", e))?;
        tx.set(&state, sequence + emitted).await?;
        for (offset, event) in buffer.events.into_iter().enumerate() {
            let event = serde_json::to_value(event)
                .map_err(|e| persistence_error("failed to encode event", e))?;
            tx.emit(&event, sequence + 1 + offset as i64).await?;
        }
        Ok(reply)
    }
}

#[async_trait]
impl<H: PersistentHandler> Behavior for Transactional<H> {
    type State = H::State;

    async fn receive(
        &self,
        initial: &mut H::State,
        ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError> {
        let persistence_id = ctx.fully_qualified_name();
        let mut tx = self.journal.begin(&persistence_id).await?;
        match self.run(&mut tx, initial, ctx, message).await {
            Ok(reply) => {
                tx.commit().await?;
                Ok(reply)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(
                        persistence_id = %persistence_id,
                        error = %rollback,
                        "journal rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}
