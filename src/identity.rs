use crate::error::{Result, SyncError};
use crate::protocol::{NetworkId, NO_NETWORK_ID};
use crate::world::EntityId;
use ahash::AHashMap;

/// Bidirectional entity <-> network-id registry.
///
/// A mapping exists for a network id iff it exists for the corresponding
/// entity; the two maps are always updated together. Only the authoritative
/// (server) instance may mint fresh ids; they are monotonically increasing
/// starting above the [`NO_NETWORK_ID`] sentinel and never reused for the
/// lifetime of the process.
pub struct NetworkIdMap {
    authoritative: bool,
    next_id: NetworkId,
    by_id: AHashMap<NetworkId, EntityId>,
    by_entity: AHashMap<EntityId, NetworkId>,
}

impl NetworkIdMap {
    pub fn new_authoritative() -> Self {
        Self::new(true)
    }

    pub fn new_remote() -> Self {
        Self::new(false)
    }

    fn new(authoritative: bool) -> Self {
        Self {
            authoritative,
            next_id: NO_NETWORK_ID + 1,
            by_id: AHashMap::new(),
            by_entity: AHashMap::new(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Mints a fresh id for `entity`. Server-only.
    pub fn assign(&mut self, entity: EntityId) -> Result<NetworkId> {
        if !self.authoritative {
            return Err(SyncError::NotAuthoritative);
        }
        if self.by_entity.contains_key(&entity) {
            return Err(SyncError::DuplicateEntity(entity));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.by_id.insert(id, entity);
        self.by_entity.insert(entity, id);
        Ok(id)
    }

    /// Records a server-assigned id on the remote side, or rehydrates server
    /// state. No id is minted, just bookkeeping.
    pub fn register(&mut self, id: NetworkId, entity: EntityId) -> Result<()> {
        if id == NO_NETWORK_ID {
            return Err(SyncError::InvalidMessage(
                "network id 0 is the reserved sentinel".into(),
            ));
        }
        if self.by_id.contains_key(&id) {
            return Err(SyncError::DuplicateId(id));
        }
        if self.by_entity.contains_key(&entity) {
            return Err(SyncError::DuplicateEntity(entity));
        }

        self.by_id.insert(id, entity);
        self.by_entity.insert(entity, id);
        // keep future minted ids above anything rehydrated
        if self.authoritative && id >= self.next_id {
            self.next_id = id + 1;
        }
        Ok(())
    }

    pub fn entity(&self, id: NetworkId) -> Option<EntityId> {
        self.by_id.get(&id).copied()
    }

    pub fn network_id(&self, entity: EntityId) -> Option<NetworkId> {
        self.by_entity.get(&entity).copied()
    }

    /// Removes both directions of the mapping, returning the id it held.
    pub fn unregister_entity(&mut self, entity: EntityId) -> Option<NetworkId> {
        let id = self.by_entity.remove(&entity)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn unregister_id(&mut self, id: NetworkId) -> Option<EntityId> {
        let entity = self.by_id.remove(&id)?;
        self.by_entity.remove(&entity);
        Some(entity)
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_entity.clear();
    }

    /// All live (id, entity) pairs; order is not meaningful.
    pub fn all(&self) -> Vec<(NetworkId, EntityId)> {
        self.by_id.iter().map(|(id, e)| (*id, *e)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
