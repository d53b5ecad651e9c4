//! Data-layer seams used by the realtime core
//!
//! The relational store belongs to the CRUD service. The realtime layer only
//! needs two things from it: who may see an entity, and a way to write a
//! coalesced mutation back.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::{
    models::{EntityId, EntityKind, MutationFields, UserId},
    Result,
};

pub use memory::{InMemoryAccessRepository, InMemoryMutationStore, PersistedMutation};
pub use postgres::{PgAccessRepository, PgMutationStore};

/// Entitlement lookup for entities
#[async_trait]
pub trait AccessRepository: Send + Sync {
    /// Identities allowed to observe events about `id`.
    ///
    /// An unknown entity yields an empty set, not an error.
    async fn lookup_entity_access_list(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<HashSet<UserId>>;
}

/// Durable write path for coalesced mutations
#[async_trait]
pub trait MutationStore: Send + Sync {
    async fn persist_mutation(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: &MutationFields,
    ) -> Result<()>;
}
