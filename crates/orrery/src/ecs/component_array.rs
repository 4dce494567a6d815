use super::{Component, EcsError, EntityId};
use ahash::AHashMap;
use std::any::type_name;

/// A sparse set storing all components of type `T`.
///
/// Values are kept densely packed, with a parallel vector of owning entities and a map from
/// entity ids back to dense indices. Erasure swaps the last element into the hole, so all
/// operations are O(1), at the cost of not preserving insertion order.
#[derive(Debug, Clone)]
pub struct ComponentArray<T: Component> {
    dense: Vec<T>,
    entities: Vec<EntityId>,
    sparse: AHashMap<EntityId, usize>,
}

impl<T: Component> ComponentArray<T> {
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            entities: Vec::new(),
            sparse: AHashMap::new(),
        }
    }

    /// Appends a component for the entity. Fails if the entity already has one.
    pub fn insert(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        if self.sparse.contains_key(&entity) {
            return Err(EcsError::EntityExists {
                entity,
                component: type_name::<T>(),
            });
        }

        self.sparse.insert(entity, self.dense.len());
        self.dense.push(value);
        self.entities.push(entity);
        Ok(())
    }

    /// Removes the entity's component, returning it. Does nothing if the entity has none.
    pub fn erase(&mut self, entity: EntityId) -> Option<T> {
        let index = self.sparse.remove(&entity)?;
        let removed = self.dense.swap_remove(index);
        self.entities.swap_remove(index);

        // Whatever used to be last now lives in the hole
        if let Some(&moved) = self.entities.get(index) {
            self.sparse.insert(moved, index);
        }

        Some(removed)
    }

    /// Overwrites the entity's component in place. Fails if the entity has none.
    pub fn update(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let slot = self.get(entity).ok_or(EcsError::MissingComponent {
            entity,
            component: type_name::<T>(),
        })?;
        *slot = value;
        Ok(())
    }

    /// Returns a mutable reference to the entity's component.
    ///
    /// The reference (and any other reference into the array) is invalidated by the next
    /// insertion or erasure.
    pub fn get(&mut self, entity: EntityId) -> Option<&mut T> {
        let index = *self.sparse.get(&entity)?;
        self.dense.get_mut(index)
    }

    pub fn get_ref(&self, entity: EntityId) -> Option<&T> {
        let index = *self.sparse.get(&entity)?;
        self.dense.get(index)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.sparse.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Iterates over `(entity, component)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.entities.iter().copied().zip(self.dense.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.entities.iter().copied().zip(self.dense.iter_mut())
    }

    pub fn clear(&mut self) {
        self.dense.clear();
        self.entities.clear();
        self.sparse.clear();
    }

    /// Checks the structural invariants of the sparse set.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.dense.len() == self.entities.len()
            && self.entities.len() == self.sparse.len()
            && self
                .sparse
                .iter()
                .all(|(&entity, &index)| self.entities.get(index) == Some(&entity))
    }
}

impl<T: Component> Default for ComponentArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Mass(f64);
    impl Component for Mass {}

    fn filled(count: u32) -> ComponentArray<Mass> {
        let mut array = ComponentArray::new();
        for id in 0..count {
            array.insert(id, Mass(id as f64 * 10.0)).unwrap();
        }
        array
    }

    #[test]
    pub fn insert_rejects_duplicates() {
        let mut array = filled(3);
        assert!(matches!(
            array.insert(1, Mass(0.0)),
            Err(EcsError::EntityExists { entity: 1, .. })
        ));
        assert_eq!(array.get_ref(1), Some(&Mass(10.0)));
    }

    #[test]
    pub fn swap_erase_preserves_others() {
        let mut array = filled(5);
        assert_eq!(array.erase(1), Some(Mass(10.0)));
        assert!(array.is_consistent());
        assert!(!array.contains(1));

        for id in [0, 2, 3, 4] {
            assert_eq!(array.get_ref(id), Some(&Mass(id as f64 * 10.0)));
        }

        // Erasing the last element doesn't need a swap
        array.erase(3);
        array.erase(4);
        assert!(array.is_consistent());
        assert_eq!(array.len(), 2);
    }

    #[test]
    pub fn erase_of_absent_entity_is_a_noop() {
        let mut array = filled(2);
        assert_eq!(array.erase(42), None);
        assert_eq!(array.len(), 2);
        assert!(array.is_consistent());
    }

    #[test]
    pub fn update_requires_presence() {
        let mut array = filled(2);
        array.update(0, Mass(1.5)).unwrap();
        assert_eq!(array.get_ref(0), Some(&Mass(1.5)));
        assert!(matches!(
            array.update(7, Mass(0.0)),
            Err(EcsError::MissingComponent { entity: 7, .. })
        ));
    }

    #[test]
    pub fn get_gives_mutable_access() {
        let mut array = filled(3);
        if let Some(mass) = array.get(2) {
            mass.0 = -1.0;
        }
        assert_eq!(array.get_ref(2), Some(&Mass(-1.0)));
        assert!(array.get(9).is_none());
    }
}
