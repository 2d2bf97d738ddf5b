mod actor_address;
mod entity_id;
mod host_port;
mod member_id;

pub use actor_address::ActorAddress;
pub use entity_id::EntityId;
pub use host_port::HostPort;
pub use member_id::MemberId;
