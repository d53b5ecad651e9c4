pub mod entity;
pub mod id;

pub use entity::{EntityKind, MutationFields};
pub use id::{EntityId, UserId};
