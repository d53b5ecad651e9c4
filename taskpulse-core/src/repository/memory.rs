//! In-process data layer for single-node demos and tests

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

use super::{AccessRepository, MutationStore};
use crate::{
    models::{EntityId, EntityKind, MutationFields, UserId},
    Result,
};

/// Access lists held in memory
#[derive(Debug, Default)]
pub struct InMemoryAccessRepository {
    grants: RwLock<HashMap<(EntityKind, EntityId), HashSet<UserId>>>,
}

impl InMemoryAccessRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `user` to observe the entity
    pub fn grant(&self, kind: EntityKind, id: EntityId, user: UserId) {
        self.grants.write().entry((kind, id)).or_default().insert(user);
    }

    pub fn revoke(&self, kind: EntityKind, id: &EntityId, user: &UserId) {
        let mut grants = self.grants.write();
        if let Some(users) = grants.get_mut(&(kind, *id)) {
            users.remove(user);
            if users.is_empty() {
                grants.remove(&(kind, *id));
            }
        }
    }
}

#[async_trait]
impl AccessRepository for InMemoryAccessRepository {
    async fn lookup_entity_access_list(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<HashSet<UserId>> {
        Ok(self
            .grants
            .read()
            .get(&(kind, *id))
            .cloned()
            .unwrap_or_default())
    }
}

/// One durable write as seen by [`InMemoryMutationStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMutation {
    pub kind: EntityKind,
    pub id: EntityId,
    pub fields: MutationFields,
}

/// Records every write and keeps the merged row state
#[derive(Debug, Default)]
pub struct InMemoryMutationStore {
    writes: Mutex<Vec<PersistedMutation>>,
    rows: RwLock<HashMap<(EntityKind, EntityId), MutationFields>>,
}

impl InMemoryMutationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes in the order they were applied
    #[must_use]
    pub fn writes(&self) -> Vec<PersistedMutation> {
        self.writes.lock().clone()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Current stored fields of an entity
    #[must_use]
    pub fn row(&self, kind: EntityKind, id: &EntityId) -> Option<MutationFields> {
        self.rows.read().get(&(kind, *id)).cloned()
    }
}

#[async_trait]
impl MutationStore for InMemoryMutationStore {
    async fn persist_mutation(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: &MutationFields,
    ) -> Result<()> {
        {
            let mut rows = self.rows.write();
            let row = rows.entry((kind, *id)).or_default();
            for (name, value) in fields {
                row.insert(name.clone(), value.clone());
            }
        }

        self.writes.lock().push(PersistedMutation {
            kind,
            id: *id,
            fields: fields.clone(),
        });

        Ok(())
    }
}
