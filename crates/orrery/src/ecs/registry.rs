use super::{
    component_type_index, components::ReferenceFrame, lookup_component_type_index, Component,
    ComponentArray, ComponentMask, EcsError, Entity, EntityId, EntityManager,
    ErasedComponentArray, Query, View, NULL_ENTITY, RENDER_SPACE_ENTITY,
};
use crate::{
    events::{EventDispatcher, RegistryReset},
    gpu::Device,
};
use log::*;
use parking_lot::ReentrantMutex;
use std::{any::type_name, cell::RefCell, fmt, sync::Arc};

/// Component arrays of a registry, indexed by component type index.
#[derive(Default)]
pub struct ComponentStorage {
    arrays: Vec<Option<Box<dyn ErasedComponentArray>>>,
}

impl ComponentStorage {
    pub fn array<T: Component>(&self) -> Option<&ComponentArray<T>> {
        let index = lookup_component_type_index::<T>()?;
        self.arrays.get(index)?.as_deref()?.try_cast()
    }

    pub fn array_mut<T: Component>(&mut self) -> Option<&mut ComponentArray<T>> {
        let index = lookup_component_type_index::<T>()?;
        self.arrays.get_mut(index)?.as_deref_mut()?.try_cast_mut()
    }

    /// Checks whether the array at the given type index was initialized.
    pub fn has_array(&self, type_index: usize) -> bool {
        matches!(self.arrays.get(type_index), Some(Some(_)))
    }

    fn array_or_insert<T: Component>(
        &mut self,
        type_index: usize,
    ) -> &mut ComponentArray<T> {
        if self.arrays.len() <= type_index {
            self.arrays.resize_with(type_index + 1, || None);
        }
        self.arrays[type_index]
            .get_or_insert_with(|| Box::new(ComponentArray::<T>::new()))
            .try_cast_mut()
            .expect("invalid internal ecs type mapping")
    }

    fn erase_all(&mut self, entity: EntityId, mask: ComponentMask) {
        for index in mask.iter() {
            if let Some(Some(array)) = self.arrays.get_mut(index) {
                array.erase(entity);
            }
        }
    }
}

struct RegistryState {
    entities: EntityManager,
    storage: ComponentStorage,
}

/// Owns all entities and their components.
///
/// Every operation takes the registry's reentrant lock, so a registry can be freely shared
/// between threads, and event handlers triggered by registry operations (see [`Registry::clear`])
/// can call back into it.
pub struct Registry {
    state: ReentrantMutex<RefCell<RegistryState>>,
    dispatcher: Option<Arc<EventDispatcher>>,
    device: Option<Arc<dyn Device>>,
}

impl Registry {
    /// Creates a standalone registry, with its sentinel entities.
    pub fn new() -> Result<Self, EcsError> {
        Self::build(None, None)
    }

    /// Creates a registry that publishes [`RegistryReset`] on `dispatcher` whenever it's cleared,
    /// and waits for `device` to go idle before dropping components.
    pub fn with_context(
        dispatcher: Arc<EventDispatcher>,
        device: Arc<dyn Device>,
    ) -> Result<Self, EcsError> {
        Self::build(Some(dispatcher), Some(device))
    }

    fn build(
        dispatcher: Option<Arc<EventDispatcher>>,
        device: Option<Arc<dyn Device>>,
    ) -> Result<Self, EcsError> {
        let mut state = RegistryState {
            entities: EntityManager::new(),
            storage: ComponentStorage::default(),
        };
        Self::init_sentinels(&mut state)?;

        Ok(Self {
            state: ReentrantMutex::new(RefCell::new(state)),
            dispatcher,
            device,
        })
    }

    fn init_sentinels(state: &mut RegistryState) -> Result<(), EcsError> {
        let null = state.entities.create(Some("null"))?;
        let scene = state.entities.create(Some("Scene"))?;
        debug_assert_eq!((null.id, scene.id), (NULL_ENTITY, RENDER_SPACE_ENTITY));

        let type_index = component_type_index::<ReferenceFrame>()?;
        state
            .storage
            .array_or_insert::<ReferenceFrame>(type_index)
            .insert(scene.id, ReferenceFrame::ROOT)?;
        if let Some(mask) = state.entities.mask_mut(scene.id) {
            mask.set(type_index);
        }
        Ok(())
    }

    /// Runs `f` with exclusive access to the registry state.
    ///
    /// Calling back into the registry from `f` panics, as the state is already borrowed.
    fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    pub(crate) fn with_storage<R>(&self, f: impl FnOnce(&ComponentStorage) -> R) -> R {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state.storage)
    }

    pub fn create_entity(&self, name: Option<&str>) -> Result<Entity, EcsError> {
        let entity = self.with_state(|state| state.entities.create(name))?;
        trace!("Created entity {entity}");
        Ok(entity)
    }

    /// Destroys an entity. Its components are left in their arrays, use
    /// [`Self::destroy_entity_and_components`] to get rid of them as well.
    pub fn destroy_entity(&self, id: EntityId) {
        if self.with_state(|state| state.entities.destroy(id)) {
            trace!("Destroyed entity #{id}");
        }
    }

    /// Erases every component owned by the entity, then destroys it.
    pub fn destroy_entity_and_components(&self, id: EntityId) -> Result<(), EcsError> {
        self.with_state(|state| {
            if !state.entities.contains(id) {
                return Err(EcsError::UnknownEntity(id));
            }
            let mask = state.entities.mask(id);
            state.storage.erase_all(id, mask);
            state.entities.destroy(id);
            Ok(())
        })
    }

    pub fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.with_state(|state| state.entities.get(id).cloned())
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.with_state(|state| state.entities.contains(id))
    }

    /// All active entities, in active list order.
    pub fn active_entities(&self) -> Vec<Entity> {
        self.with_state(|state| {
            state
                .entities
                .active_ids()
                .iter()
                .filter_map(|&id| state.entities.get(id).cloned())
                .collect()
        })
    }

    pub fn entity_count(&self) -> usize {
        self.with_state(|state| state.entities.len())
    }

    /// Id of the entity owning the root reference frame.
    pub fn render_space(&self) -> EntityId {
        RENDER_SPACE_ENTITY
    }

    pub fn add_component<T: Component>(&self, id: EntityId, value: T) -> Result<(), EcsError> {
        let type_index = component_type_index::<T>()?;
        self.with_state(|state| {
            if !state.entities.contains(id) {
                return Err(EcsError::UnknownEntity(id));
            }
            state
                .storage
                .array_or_insert::<T>(type_index)
                .insert(id, value)?;
            if let Some(mask) = state.entities.mask_mut(id) {
                mask.set(type_index);
            }
            Ok(())
        })
    }

    /// Removes the component from the entity. Removing a component the entity doesn't have
    /// does nothing.
    pub fn remove_component<T: Component>(&self, id: EntityId) -> Result<(), EcsError> {
        let type_index = self.registered_index::<T>()?;
        self.with_state(|state| {
            if let Some(array) = state.storage.array_mut::<T>() {
                array.erase(id);
            }
            if let Some(mask) = state.entities.mask_mut(id) {
                mask.clear(type_index);
            }
            Ok(())
        })
    }

    pub fn update_component<T: Component>(&self, id: EntityId, value: T) -> Result<(), EcsError> {
        self.registered_index::<T>()?;
        self.with_state(|state| {
            state
                .storage
                .array_mut::<T>()
                .ok_or(EcsError::UnregisteredComponent(type_name::<T>()))?
                .update(id, value)
        })
    }

    /// Returns a copy of the entity's component.
    pub fn get_component<T: Component>(&self, id: EntityId) -> Result<T, EcsError> {
        self.with_component(id, T::clone)
    }

    /// Runs `f` on a reference to the entity's component.
    pub fn with_component<T: Component, R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, EcsError> {
        self.with_storage(|storage| {
            let array = storage
                .array::<T>()
                .ok_or(EcsError::MissingComponent {
                    entity: id,
                    component: type_name::<T>(),
                })?;
            let component = array.get_ref(id).ok_or(EcsError::MissingComponent {
                entity: id,
                component: type_name::<T>(),
            })?;
            Ok(f(component))
        })
    }

    /// Runs `f` on a mutable reference to the entity's component.
    ///
    /// `f` must not call back into the registry.
    pub fn with_component_mut<T: Component, R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, EcsError> {
        self.with_state(|state| {
            let component = state
                .storage
                .array_mut::<T>()
                .and_then(|array| array.get(id))
                .ok_or(EcsError::MissingComponent {
                    entity: id,
                    component: type_name::<T>(),
                })?;
            Ok(f(component))
        })
    }

    pub fn has_component<T: Component>(&self, id: EntityId) -> bool {
        self.with_storage(|storage| {
            storage
                .array::<T>()
                .map(|array| array.contains(id))
                .unwrap_or(false)
        })
    }

    /// Builds a view over all entities that have every component in `Q`.
    ///
    /// `Q` is a tuple of component types, for example
    /// `registry.get_view::<(Transform, MeshRenderable)>()`.
    pub fn get_view<Q: Query>(&self) -> Result<View<'_, Q>, EcsError> {
        View::new(self)
    }

    /// Type index of `T`, if this registry has an array for it.
    pub(crate) fn registered_index<T: Component>(&self) -> Result<usize, EcsError> {
        lookup_component_type_index::<T>()
            .filter(|&index| self.with_storage(|storage| storage.has_array(index)))
            .ok_or(EcsError::UnregisteredComponent(type_name::<T>()))
    }

    /// Copies the active ids and their masks.
    pub(crate) fn snapshot(&self) -> Vec<(EntityId, ComponentMask)> {
        self.with_state(|state| {
            state
                .entities
                .active_ids()
                .iter()
                .map(|&id| (id, state.entities.mask(id)))
                .collect()
        })
    }

    /// Drops every entity and component, then recreates the sentinel entities.
    ///
    /// Waits for the device to go idle first, since components may reference GPU resources
    /// still in use. [`RegistryReset`] is published afterwards, with the registry lock still
    /// held, so handlers observe the fresh state before any other thread does.
    pub fn clear(&self) -> Result<(), EcsError> {
        if let Some(device) = &self.device {
            if let Err(error) = device.device_wait_idle() {
                error!("Couldn't wait for device idle before clearing the registry: {error}");
            }
        }

        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            state.entities.reset();
            state.storage = ComponentStorage::default();
            Self::init_sentinels(&mut state)?;
        }
        debug!("Registry cleared");

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(&RegistryReset);
        }
        drop(guard);
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entity_count", &self.entity_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f64,
        y: f64,
        z: f64,
    }
    impl Component for Position {}

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity(f64);
    impl Component for Velocity {}

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct NeverAdded;
    impl Component for NeverAdded {}

    const P: Position = Position {
        x: 1.0,
        y: 2.0,
        z: 3.0,
    };

    #[test]
    pub fn sentinels_exist() {
        let registry = Registry::new().unwrap();
        assert_eq!(registry.entity_count(), 2);
        assert_eq!(
            registry.get_entity(NULL_ENTITY).unwrap().name.as_deref(),
            Some("null")
        );
        assert_eq!(
            registry.get_entity(RENDER_SPACE_ENTITY).unwrap().name.as_deref(),
            Some("Scene")
        );
        assert_eq!(
            registry.get_component::<ReferenceFrame>(RENDER_SPACE_ENTITY),
            Ok(ReferenceFrame::ROOT)
        );
    }

    #[test]
    pub fn entity_lifecycle() {
        let registry = Registry::new().unwrap();
        let a = registry.create_entity(Some("A")).unwrap();
        let b = registry.create_entity(Some("B")).unwrap();
        let c = registry.create_entity(Some("C")).unwrap();
        // Sentinels take the first two ids
        assert_eq!((a.id, b.id, c.id), (2, 3, 4));

        registry.add_component(b.id, P).unwrap();
        let found: Vec<_> = registry.get_view::<(Position,)>().unwrap().iter().collect();
        assert_eq!(found, vec![(b.id, (P,))]);

        registry.destroy_entity_and_components(b.id).unwrap();
        assert_eq!(registry.get_view::<(Position,)>().unwrap().iter().count(), 0);
        assert!(!registry.has_entity(b.id));
    }

    #[test]
    pub fn masks_follow_components() {
        let registry = Registry::new().unwrap();
        let e = registry.create_entity(None).unwrap().id;
        registry.add_component(e, Velocity(3.0)).unwrap();

        let index = registry.registered_index::<Velocity>().unwrap();
        let mask = |registry: &Registry| {
            registry
                .snapshot()
                .into_iter()
                .find(|&(id, _)| id == e)
                .unwrap()
                .1
        };
        assert!(mask(&registry).test(index));

        registry.remove_component::<Velocity>(e).unwrap();
        assert!(!mask(&registry).test(index));
        assert!(!registry.has_component::<Velocity>(e));

        // add/remove/add restores the value
        registry.add_component(e, Velocity(3.0)).unwrap();
        assert_eq!(registry.get_component::<Velocity>(e), Ok(Velocity(3.0)));
    }

    #[test]
    pub fn contract_violations_are_reported() {
        let registry = Registry::new().unwrap();
        let e = registry.create_entity(None).unwrap().id;

        assert!(matches!(
            registry.get_component::<Position>(e),
            Err(EcsError::MissingComponent { .. })
        ));
        assert!(matches!(
            registry.update_component(e, NeverAdded),
            Err(EcsError::UnregisteredComponent(_))
        ));
        assert!(matches!(
            registry.get_view::<(NeverAdded,)>(),
            Err(EcsError::UnregisteredComponent(_))
        ));
        assert!(matches!(registry.get_view::<()>(), Err(EcsError::EmptyViewSpec)));

        registry.add_component(e, P).unwrap();
        assert!(matches!(
            registry.add_component(e, P),
            Err(EcsError::EntityExists { .. })
        ));
        assert_eq!(
            registry.add_component(9999, P),
            Err(EcsError::UnknownEntity(9999))
        );
    }

    #[test]
    pub fn plain_destroy_leaves_orphan_components() {
        let registry = Registry::new().unwrap();
        let e = registry.create_entity(None).unwrap().id;
        registry.add_component(e, Velocity(1.0)).unwrap();

        registry.destroy_entity(e);
        assert!(!registry.has_entity(e));
        assert!(registry.has_component::<Velocity>(e));
        // The mask was reset, so views skip it
        assert_eq!(registry.get_view::<(Velocity,)>().unwrap().size(), 0);

        // Unknown ids only produce a warning
        registry.destroy_entity(e);
        assert_eq!(registry.entity_count(), 2);
    }

    #[test]
    pub fn updates_and_in_place_mutation() {
        let registry = Registry::new().unwrap();
        let e = registry.create_entity(None).unwrap().id;
        registry.add_component(e, Velocity(1.0)).unwrap();

        registry.update_component(e, Velocity(2.0)).unwrap();
        assert_eq!(registry.get_component::<Velocity>(e), Ok(Velocity(2.0)));

        registry
            .with_component_mut::<Velocity, _>(e, |v| v.0 *= 10.0)
            .unwrap();
        assert_eq!(registry.get_component::<Velocity>(e), Ok(Velocity(20.0)));
    }

    #[test]
    pub fn clear_resets_ids_and_reenters_from_handlers() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let device: Arc<dyn Device> = Arc::new(crate::gpu::headless::HeadlessDevice::default());
        let registry = Arc::new(Registry::with_context(dispatcher.clone(), device).unwrap());

        struct Observer;
        let observer = dispatcher.register_subscriber::<Observer>();
        let observed = Arc::new(AtomicUsize::new(0));
        {
            let registry = Arc::downgrade(&registry);
            let observed = observed.clone();
            dispatcher
                .subscribe::<RegistryReset>(observer, move |_| {
                    if let Some(registry) = registry.upgrade() {
                        // Re-entering from the handler sees the fresh state
                        observed.store(registry.entity_count(), Ordering::SeqCst);
                        registry.create_entity(Some("spawned on reset")).unwrap();
                    }
                })
                .unwrap();
        }

        for _ in 0..5 {
            registry.create_entity(None).unwrap();
        }
        registry.clear().unwrap();

        assert_eq!(observed.load(Ordering::SeqCst), 2);
        assert!(dispatcher.event_callbacks_invoked(observer, RegistryReset::FLAG));
        assert_eq!(registry.entity_count(), 3);
        assert_eq!(registry.active_entities()[2].id, 2);
    }
}
