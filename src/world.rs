use crate::protocol::ClientId;
use crate::registry::{ComponentTypeId, ComponentValue};
use ahash::AHashMap;
use serde::Serialize;

/// Opaque host-world entity handle.
pub type EntityId = u64;

/// Replication tag applied to client-side entities: entities owned by the
/// local client are predicted, everything else is interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityTag {
    pub owner: ClientId,
    pub predicted: bool,
}

impl EntityTag {
    pub fn predicted(owner: ClientId) -> Self {
        Self {
            owner,
            predicted: true,
        }
    }

    pub fn interpolated(owner: ClientId) -> Self {
        Self {
            owner,
            predicted: false,
        }
    }
}

/// Narrow seam to the host's entity-component storage. The replication state
/// machines only ever touch the world through these operations; queries,
/// scheduling, and everything else stay on the host's side.
pub trait EntityWorld {
    fn spawn(&mut self) -> EntityId;
    /// Returns false when the entity was already gone.
    fn despawn(&mut self, entity: EntityId) -> bool;

    fn has_component(&self, entity: EntityId, type_id: ComponentTypeId) -> bool;
    /// Component type ids present on `entity`, registered or not.
    fn component_types(&self, entity: EntityId) -> Vec<ComponentTypeId>;
    fn get_component(&self, entity: EntityId, type_id: ComponentTypeId) -> Option<ComponentValue>;
    fn set_component(&mut self, entity: EntityId, type_id: ComponentTypeId, value: ComponentValue);
    fn remove_component(&mut self, entity: EntityId, type_id: ComponentTypeId) -> bool;

    fn set_parent(&mut self, child: EntityId, parent: Option<EntityId>);
    fn set_tag(&mut self, entity: EntityId, tag: EntityTag);
}

#[derive(Default)]
struct EntityRecord {
    components: AHashMap<ComponentTypeId, ComponentValue>,
    parent: Option<EntityId>,
    tag: Option<EntityTag>,
}

/// Plain in-memory [`EntityWorld`] used by tests and demos, in the same
/// spirit as the in-memory loopback transport.
#[derive(Default)]
pub struct MemoryWorld {
    entities: AHashMap<EntityId, EntityRecord>,
    next_entity: EntityId,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.entities.get(&entity).and_then(|r| r.parent)
    }

    pub fn tag(&self, entity: EntityId) -> Option<EntityTag> {
        self.entities.get(&entity).and_then(|r| r.tag)
    }
}

impl EntityWorld for MemoryWorld {
    fn spawn(&mut self) -> EntityId {
        self.next_entity += 1;
        self.entities.insert(self.next_entity, EntityRecord::default());
        self.next_entity
    }

    fn despawn(&mut self, entity: EntityId) -> bool {
        self.entities.remove(&entity).is_some()
    }

    fn has_component(&self, entity: EntityId, type_id: ComponentTypeId) -> bool {
        self.entities
            .get(&entity)
            .map(|r| r.components.contains_key(&type_id))
            .unwrap_or(false)
    }

    fn component_types(&self, entity: EntityId) -> Vec<ComponentTypeId> {
        self.entities
            .get(&entity)
            .map(|r| r.components.keys().copied().collect())
            .unwrap_or_default()
    }

    fn get_component(&self, entity: EntityId, type_id: ComponentTypeId) -> Option<ComponentValue> {
        self.entities
            .get(&entity)
            .and_then(|r| r.components.get(&type_id).cloned())
    }

    fn set_component(&mut self, entity: EntityId, type_id: ComponentTypeId, value: ComponentValue) {
        if let Some(record) = self.entities.get_mut(&entity) {
            record.components.insert(type_id, value);
        }
    }

    fn remove_component(&mut self, entity: EntityId, type_id: ComponentTypeId) -> bool {
        self.entities
            .get_mut(&entity)
            .map(|r| r.components.remove(&type_id).is_some())
            .unwrap_or(false)
    }

    fn set_parent(&mut self, child: EntityId, parent: Option<EntityId>) {
        if let Some(record) = self.entities.get_mut(&child) {
            record.parent = parent;
        }
    }

    fn set_tag(&mut self, entity: EntityId, tag: EntityTag) {
        if let Some(record) = self.entities.get_mut(&entity) {
            record.tag = Some(tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldValue;

    #[test]
    fn test_spawn_despawn() {
        let mut world = MemoryWorld::new();
        let e = world.spawn();
        assert!(world.contains(e));
        assert!(world.despawn(e));
        assert!(!world.despawn(e));
        assert!(world.is_empty());
    }

    #[test]
    fn test_component_access() {
        let mut world = MemoryWorld::new();
        let e = world.spawn();

        world.set_component(e, 1, vec![FieldValue::Float(1.0)]);
        assert!(world.has_component(e, 1));
        assert_eq!(world.component_types(e), vec![1]);
        assert_eq!(world.get_component(e, 1), Some(vec![FieldValue::Float(1.0)]));

        assert!(world.remove_component(e, 1));
        assert!(!world.has_component(e, 1));
    }

    #[test]
    fn test_parent_and_tag() {
        let mut world = MemoryWorld::new();
        let parent = world.spawn();
        let child = world.spawn();

        world.set_parent(child, Some(parent));
        assert_eq!(world.parent(child), Some(parent));
        world.set_parent(child, None);
        assert_eq!(world.parent(child), None);

        world.set_tag(child, EntityTag::interpolated(2));
        assert_eq!(world.tag(child), Some(EntityTag::interpolated(2)));
        assert!(!world.tag(child).unwrap().predicted);
    }
}
