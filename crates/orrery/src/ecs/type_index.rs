use super::{Component, EcsError, MAX_COMPONENTS_PER_ENTITY};
use ahash::AHashMap;
use log::*;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{type_name, TypeId};

/// Hands out dense, 0-based indices to component types on first use.
#[derive(Debug)]
pub struct TypeIndexer {
    indices: RwLock<AHashMap<TypeId, usize>>,
    limit: usize,
}

impl TypeIndexer {
    pub fn new(limit: usize) -> Self {
        Self {
            indices: RwLock::new(AHashMap::new()),
            limit,
        }
    }

    /// Returns the index of `T`, assigning the next free one if `T` wasn't seen before.
    pub fn index_of<T: Component>(&self) -> Result<usize, EcsError> {
        if let Some(&index) = self.indices.read().get(&TypeId::of::<T>()) {
            return Ok(index);
        }

        let mut indices = self.indices.write();
        // Somebody could've registered it in between the two locks
        if let Some(&index) = indices.get(&TypeId::of::<T>()) {
            return Ok(index);
        }

        let index = indices.len();
        if index >= self.limit {
            return Err(EcsError::ComponentLimitReached(type_name::<T>()));
        }
        indices.insert(TypeId::of::<T>(), index);
        trace!("Component {} was assigned type index {index}", type_name::<T>());
        Ok(index)
    }

    /// Returns the index of `T` without registering it.
    pub fn lookup<T: Component>(&self) -> Option<usize> {
        self.indices.read().get(&TypeId::of::<T>()).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.read().len()
    }
}

static COMPONENT_TYPES: Lazy<TypeIndexer> =
    Lazy::new(|| TypeIndexer::new(MAX_COMPONENTS_PER_ENTITY));

/// Process-wide type index of a component type. Indices are shared by all registries.
pub fn component_type_index<T: Component>() -> Result<usize, EcsError> {
    COMPONENT_TYPES.index_of::<T>()
}

/// Like [`component_type_index`], but doesn't register `T` if it's new.
pub fn lookup_component_type_index<T: Component>() -> Option<usize> {
    COMPONENT_TYPES.lookup::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct First;
    impl Component for First {}

    #[derive(Clone)]
    struct Second;
    impl Component for Second {}

    #[derive(Clone)]
    struct Third;
    impl Component for Third {}

    #[test]
    pub fn indices_are_dense_and_stable() {
        let indexer = TypeIndexer::new(8);
        assert_eq!(indexer.lookup::<First>(), None);
        assert_eq!(indexer.index_of::<First>(), Ok(0));
        assert_eq!(indexer.index_of::<Second>(), Ok(1));
        assert_eq!(indexer.index_of::<First>(), Ok(0));
        assert_eq!(indexer.len(), 2);
    }

    #[test]
    pub fn limit_is_enforced() {
        let indexer = TypeIndexer::new(2);
        indexer.index_of::<First>().unwrap();
        indexer.index_of::<Second>().unwrap();
        assert!(matches!(
            indexer.index_of::<Third>(),
            Err(EcsError::ComponentLimitReached(_))
        ));
        // Known types still resolve
        assert_eq!(indexer.index_of::<Second>(), Ok(1));
    }
}
