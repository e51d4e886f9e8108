// Wire-visible models shared between servers and clients
pub mod consistency;
pub mod event;
pub mod publish;

pub use consistency::ConsistencyLevel;
pub use event::Event;
pub use publish::{PublishRequest, PublishResponse, ResponseStatus};
