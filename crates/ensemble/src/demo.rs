//! The users demo: one persistent instance per user id.
//!
//! A user starts out [`UserState::Initial`]. `Create` records two events and
//! moves it to [`UserState::User`]; creating it again is answered with
//! [`CreateReply::UserAlreadyCreated`] and changes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actor::{ActorContext, Message};
use crate::cluster::ClusterNode;
use crate::dispatcher::{MessageToId, ShardedDispatcher};
use crate::error::ClusterError;
use crate::persistence::transactional::{EventBuffer, PersistentHandler, StateCell};
use crate::types::EntityId;

/// Actor system name of the demo.
pub const SYSTEM_NAME: &str = "EffectTsActorsDemo";

/// Actor kind of user instances.
pub const USERS_KIND: &str = "users";

const USERS_TAG: &str = "users";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserState {
    Initial,
    User { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    Created { id: String },
    Activated { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsersCommand {
    Create { id: String },
    Get { id: String },
}

impl UsersCommand {
    pub fn id(&self) -> &str {
        match self {
            UsersCommand::Create { id } | UsersCommand::Get { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateReply {
    Created { id: String },
    UserAlreadyCreated,
}

/// Handler of the `users` kind.
pub struct UsersHandler;

#[async_trait]
impl PersistentHandler for UsersHandler {
    type State = UserState;
    type Event = UserEvent;

    async fn handle(
        &self,
        state: &mut StateCell<UserState>,
        events: &mut EventBuffer<UserEvent>,
        ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError> {
        match message.decode::<UsersCommand>()? {
            UsersCommand::Create { id } => match state.get() {
                UserState::Initial => {
                    events.emit(UserEvent::Created { id: id.clone() });
                    events.emit(UserEvent::Activated { id: id.clone() });
                    state.set(UserState::User { id: id.clone() });
                    tracing::debug!(instance = %ctx.fully_qualified_name(), user = %id, "user created");
                    crate::error::encode(&CreateReply::Created { id })
                }
                UserState::User { .. } => crate::error::encode(&CreateReply::UserAlreadyCreated),
            },
            UsersCommand::Get { .. } => crate::error::encode(state.get()),
        }
    }
}

/// Id of the user a users message is addressed to.
pub fn message_to_id() -> MessageToId {
    Arc::new(|message: &Message| {
        let command: UsersCommand = message.decode()?;
        Ok(EntityId::new(command.id()))
    })
}

pub fn create(id: &str) -> Result<Message, ClusterError> {
    Message::encode(USERS_TAG, &UsersCommand::Create { id: id.to_string() })
}

pub fn get(id: &str) -> Result<Message, ClusterError> {
    Message::encode(USERS_TAG, &UsersCommand::Get { id: id.to_string() })
}

/// Register the users kind on `node`.
pub fn register(node: &ClusterNode) -> Result<Arc<ShardedDispatcher>, ClusterError> {
    node.persistent(USERS_KIND, message_to_id(), |_| (UsersHandler, UserState::Initial))
}

pub async fn create_user(users: &ShardedDispatcher, id: &str) -> Result<CreateReply, ClusterError> {
    let reply = users.ask(create(id)?).await?;
    crate::error::decode(&reply)
}

pub async fn get_user(users: &ShardedDispatcher, id: &str) -> Result<UserState, ClusterError> {
    let reply = users.ask(get(id)?).await?;
    crate::error::decode(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorHandle, ActorSystem, LocalNetwork, LoggingSupervisor};
    use crate::persistence::memory::MemoryJournal;
    use crate::persistence::transactional::Transactional;
    use crate::persistence::JournalStorage;
    use crate::types::HostPort;
    use serde_json::json;

    #[tokio::test]
    async fn create_twice_records_events_once() {
        let journal = MemoryJournal::default();
        let system = ActorSystem::new(
            SYSTEM_NAME,
            "ensemble",
            HostPort::new("127.0.0.1", 1),
            Arc::new(LocalNetwork::new()),
        );
        let mike = system
            .spawn(
                "users/mike",
                Arc::new(LoggingSupervisor),
                Transactional::new(UsersHandler, Arc::new(journal.clone())),
                UserState::Initial,
            )
            .unwrap();

        let first: CreateReply =
            crate::error::decode(&mike.ask(create("mike").unwrap()).await.unwrap()).unwrap();
        assert_eq!(first, CreateReply::Created { id: "mike".into() });
        let second: CreateReply =
            crate::error::decode(&mike.ask(create("mike").unwrap()).await.unwrap()).unwrap();
        assert_eq!(second, CreateReply::UserAlreadyCreated);

        let events = journal
            .load_events("EffectTsActorsDemo(users/mike)")
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, json!({"Created": {"id": "mike"}}));
        let stored = journal
            .load_state("EffectTsActorsDemo(users/mike)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.sequence, 2);
        assert_eq!(stored.state, json!({"User": {"id": "mike"}}));
    }

    #[test]
    fn message_to_id_reads_the_user_id() {
        let to_id = message_to_id();
        assert_eq!(to_id(&get("mike").unwrap()).unwrap(), EntityId::new("mike"));
        assert!(to_id(&Message::new(USERS_TAG, vec![0xc1])).is_err());
    }
}
