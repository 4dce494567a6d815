use super::{ComponentMask, EcsError, Entity, EntityId, MAX_ENTITIES};
use ahash::AHashMap;
use log::*;
use orrery_utils::Counter;

/// Entity bookkeeping of a [`super::Registry`]: id allocation, the active entity list and
/// per-entity component masks.
///
/// Ids are never recycled within a session, only [`EntityManager::reset`] starts over.
#[derive(Debug)]
pub struct EntityManager {
    next_id: Counter,
    /// Active ids, in creation order until something gets destroyed.
    active_ids: Vec<EntityId>,
    /// Indexed by id.
    masks: Vec<ComponentMask>,
    entities: AHashMap<EntityId, Entity>,
    active_index: AHashMap<EntityId, usize>,
}

impl EntityManager {
    pub fn new() -> Self {
        Self {
            next_id: Counter::new(0),
            active_ids: Vec::new(),
            masks: Vec::new(),
            entities: AHashMap::new(),
            active_index: AHashMap::new(),
        }
    }

    pub fn create(&mut self, name: Option<&str>) -> Result<Entity, EcsError> {
        if self.next_id.peek() >= MAX_ENTITIES as u64 {
            return Err(EcsError::EntityLimitReached);
        }
        let id = self.next_id.next() as EntityId;

        let entity = Entity {
            id,
            name: name.map(str::to_owned),
        };

        if self.masks.len() <= id as usize {
            self.masks.resize(id as usize + 1, ComponentMask::EMPTY);
        }
        self.masks[id as usize] = ComponentMask::EMPTY;
        self.active_index.insert(id, self.active_ids.len());
        self.active_ids.push(id);
        self.entities.insert(id, entity.clone());

        Ok(entity)
    }

    /// Destroys an entity. Unknown ids are reported and otherwise ignored.
    pub fn destroy(&mut self, id: EntityId) -> bool {
        let Some(index) = self.active_index.remove(&id) else {
            warn!("Attempted to destroy unknown entity #{id}");
            return false;
        };

        self.active_ids.swap_remove(index);
        if let Some(&moved) = self.active_ids.get(index) {
            self.active_index.insert(moved, index);
        }
        self.masks[id as usize] = ComponentMask::EMPTY;
        self.entities.remove(&id);
        true
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn mask(&self, id: EntityId) -> ComponentMask {
        self.masks
            .get(id as usize)
            .copied()
            .unwrap_or(ComponentMask::EMPTY)
    }

    pub fn mask_mut(&mut self, id: EntityId) -> Option<&mut ComponentMask> {
        if !self.contains(id) {
            return None;
        }
        self.masks.get_mut(id as usize)
    }

    pub fn active_ids(&self) -> &[EntityId] {
        &self.active_ids
    }

    pub fn len(&self) -> usize {
        self.active_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_ids.is_empty()
    }

    /// Forgets every entity and restarts id allocation from zero.
    pub fn reset(&mut self) {
        self.next_id.reset(0);
        self.active_ids.clear();
        self.masks.clear();
        self.entities.clear();
        self.active_index.clear();
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}
