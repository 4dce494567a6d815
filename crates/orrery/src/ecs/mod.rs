//! The Orrery entity component system
//!
//! Entities are plain 32-bit ids handed out by a monotonic counter. Every component type gets a
//! dense type index the first time it's used, and each [`Registry`] keeps one sparse set
//! ([`ComponentArray`]) per type, stored in a vector indexed by that type index. Which component
//! types an entity owns is tracked by its [`ComponentMask`], a 64-bit bitset.
//!
//! Multi-component iteration goes through [`View`]s, which snapshot the matching entities when
//! they're created and fetch components lazily while iterating.
//!
//! ## Sentinel entities
//! A freshly created (or cleared) registry always contains two entities:
//!  * the null entity (id 0, named `null`), which carries no meaning and exists so that id 0
//!    never refers to anything real,
//!  * the render space entity (id 1, named `Scene`), which carries the root [`ReferenceFrame`].
//!
//! [`ReferenceFrame`]: components::ReferenceFrame

use std::{any::Any, fmt};
use thiserror::Error;

pub mod components;
pub mod systems;

#[doc(inline)]
pub use component_array::*;
mod component_array;

#[doc(inline)]
pub use type_index::*;
mod type_index;

#[doc(inline)]
pub use entity_manager::*;
mod entity_manager;

#[doc(inline)]
pub use registry::*;
mod registry;

#[doc(inline)]
pub use view::*;
mod view;

pub type EntityId = u32;

/// Marks an invalid or absent entity.
pub const INVALID_ENTITY: EntityId = EntityId::MAX;

/// Maximum amount of entities that can be allocated during a session.
pub const MAX_ENTITIES: usize = 100_000;

/// Maximum amount of distinct component types, and the width of a [`ComponentMask`].
pub const MAX_COMPONENTS_PER_ENTITY: usize = 64;

/// Id of the null entity.
pub const NULL_ENTITY: EntityId = 0;

/// Id of the render space entity.
pub const RENDER_SPACE_ENTITY: EntityId = 1;

/// An entity with its optional name. Equality only takes the id into account.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: Option<String>,
}

impl Entity {
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} `{}`", self.id, self.name_or_default())
    }
}

/// Marker trait for components.
///
/// Components are cloned out of the registry when read, so they should stay small.
pub trait Component: Any + Send + Sync + Clone {}

/// Set of component types owned by an entity, one bit per type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComponentMask(u64);

impl ComponentMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn with(self, type_index: usize) -> Self {
        debug_assert!(type_index < MAX_COMPONENTS_PER_ENTITY);
        Self(self.0 | 1 << type_index)
    }

    pub fn set(&mut self, type_index: usize) {
        *self = self.with(type_index);
    }

    pub fn clear(&mut self, type_index: usize) {
        self.0 &= !(1 << type_index);
    }

    pub const fn test(self, type_index: usize) -> bool {
        self.0 & 1 << type_index != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Type indices of all set bits, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_COMPONENTS_PER_ENTITY).filter(move |&index| self.test(index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcsError {
    #[error("entity #{entity} has no {component} component")]
    MissingComponent {
        entity: EntityId,
        component: &'static str,
    },
    #[error("component {0} has no array in this registry")]
    UnregisteredComponent(&'static str),
    #[error("views need at least one required component")]
    EmptyViewSpec,
    #[error("entity #{entity} already has a {component} component")]
    EntityExists {
        entity: EntityId,
        component: &'static str,
    },
    #[error("can't allocate more than {} entities", MAX_ENTITIES)]
    EntityLimitReached,
    #[error("can't register component {0}, all {} type slots are taken", MAX_COMPONENTS_PER_ENTITY)]
    ComponentLimitReached(&'static str),
    #[error("entity #{0} doesn't exist")]
    UnknownEntity(EntityId),
}

/// Type erasure over [`ComponentArray`], so that the registry can erase entities from arrays
/// without knowing their component types.
pub trait ErasedComponentArray: Any + Send + Sync {
    fn erase(&mut self, entity: EntityId);
    fn contains(&self, entity: EntityId) -> bool;
    fn len(&self) -> usize;
    fn component_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn ErasedComponentArray {
    pub fn try_cast<T: Component>(&self) -> Option<&ComponentArray<T>> {
        self.as_any().downcast_ref()
    }

    pub fn try_cast_mut<T: Component>(&mut self) -> Option<&mut ComponentArray<T>> {
        self.as_any_mut().downcast_mut()
    }
}

impl<T: Component> ErasedComponentArray for ComponentArray<T> {
    fn erase(&mut self, entity: EntityId) {
        ComponentArray::erase(self, entity);
    }

    fn contains(&self, entity: EntityId) -> bool {
        ComponentArray::contains(self, entity)
    }

    fn len(&self) -> usize {
        ComponentArray::len(self)
    }

    fn component_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self as &dyn Any
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self as &mut dyn Any
    }
}
