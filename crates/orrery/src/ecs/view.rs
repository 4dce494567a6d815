use super::{
    lookup_component_type_index, Component, ComponentMask, ComponentStorage, EcsError, EntityId,
    Registry,
};
use std::{fmt, marker::PhantomData};

/// A set of component types, expressed as a tuple (`(A,)`, `(A, B)`, ...).
///
/// Implemented for tuples of up to eight components. The empty tuple is a valid [`Query`], but
/// views refuse it with [`EcsError::EmptyViewSpec`].
pub trait Query: 'static {
    /// What iteration yields for each entity, a tuple of component clones.
    type Item;

    /// Mask of all types in the query. Fails if any of them has no array in the registry.
    fn required_mask(registry: &Registry) -> Result<ComponentMask, EcsError>;

    /// Mask of the types in the query that were ever registered. Types that weren't can't be
    /// owned by any entity, so they contribute nothing.
    fn known_mask() -> ComponentMask;

    fn fetch(storage: &ComponentStorage, entity: EntityId) -> Option<Self::Item>;
}

impl Query for () {
    type Item = ();

    fn required_mask(_registry: &Registry) -> Result<ComponentMask, EcsError> {
        Err(EcsError::EmptyViewSpec)
    }

    fn known_mask() -> ComponentMask {
        ComponentMask::EMPTY
    }

    fn fetch(_storage: &ComponentStorage, _entity: EntityId) -> Option<Self::Item> {
        Some(())
    }
}

macro_rules! impl_query {
    ($($t:ident),+) => {
        impl<$($t: Component),+> Query for ($($t,)+) {
            type Item = ($($t,)+);

            fn required_mask(registry: &Registry) -> Result<ComponentMask, EcsError> {
                let mut mask = ComponentMask::EMPTY;
                $(mask.set(registry.registered_index::<$t>()?);)+
                Ok(mask)
            }

            fn known_mask() -> ComponentMask {
                let mut mask = ComponentMask::EMPTY;
                $(
                    if let Some(index) = lookup_component_type_index::<$t>() {
                        mask.set(index);
                    }
                )+
                mask
            }

            fn fetch(storage: &ComponentStorage, entity: EntityId) -> Option<Self::Item> {
                Some(($(storage.array::<$t>()?.get_ref(entity)?.clone(),)+))
            }
        }
    };
}

impl_query!(A);
impl_query!(A, B);
impl_query!(A, B, C);
impl_query!(A, B, C, D);
impl_query!(A, B, C, D, E);
impl_query!(A, B, C, D, E, F);
impl_query!(A, B, C, D, E, F, G);
impl_query!(A, B, C, D, E, F, G, H);

/// A filtered snapshot of the registry's entities.
///
/// The set of matching entities is captured when the view is created (or refreshed), while
/// components are read during iteration. Components may be updated or added while a view is
/// being iterated, but an entity whose required components get erased before iteration reaches
/// it is skipped rather than yielded.
///
/// Iteration yields clones of the components rather than references into the arrays. Each entity
/// is fetched under the registry lock, which is released before the item is handed out, so an
/// item doesn't pin the array and later writes go through
/// [`Registry::update_component`]. An item reflects the array at the moment its entity was
/// reached and doesn't follow later updates.
pub struct View<'r, Q: Query> {
    registry: &'r Registry,
    required: ComponentMask,
    ignored: ComponentMask,
    snapshot: Vec<(EntityId, ComponentMask)>,
    matches: Vec<EntityId>,
    _query: PhantomData<fn() -> Q>,
}

impl<'r, Q: Query> View<'r, Q> {
    pub(crate) fn new(registry: &'r Registry) -> Result<Self, EcsError> {
        let required = Q::required_mask(registry)?;
        let mut view = Self {
            registry,
            required,
            ignored: ComponentMask::EMPTY,
            snapshot: registry.snapshot(),
            matches: Vec::new(),
            _query: PhantomData,
        };
        view.filter();
        Ok(view)
    }

    /// Excludes entities owning any of the components in `I`.
    pub fn ignore_components<I: Query>(mut self) -> Self {
        self.ignored = self.ignored.union(I::known_mask());
        self.filter();
        self
    }

    /// Takes a new snapshot of the registry.
    pub fn refresh(&mut self) {
        self.snapshot = self.registry.snapshot();
        self.filter();
    }

    /// Amount of matching entities in the snapshot.
    pub fn size(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Matching entity ids, in iteration order.
    pub fn entities(&self) -> &[EntityId] {
        &self.matches
    }

    pub fn iter(&self) -> ViewIter<'_, 'r, Q> {
        ViewIter {
            view: self,
            position: 0,
        }
    }

    fn filter(&mut self) {
        let (required, ignored) = (self.required, self.ignored);
        self.matches = self
            .snapshot
            .iter()
            .filter(|(_, mask)| mask.contains_all(required) && !mask.intersects(ignored))
            .map(|&(id, _)| id)
            .collect();
    }
}

impl<'v, 'r, Q: Query> IntoIterator for &'v View<'r, Q> {
    type Item = (EntityId, Q::Item);
    type IntoIter = ViewIter<'v, 'r, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<Q: Query> fmt::Debug for View<'_, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("required", &self.required)
            .field("ignored", &self.ignored)
            .field("matches", &self.matches)
            .finish()
    }
}

pub struct ViewIter<'v, 'r, Q: Query> {
    view: &'v View<'r, Q>,
    position: usize,
}

impl<Q: Query> Iterator for ViewIter<'_, '_, Q> {
    type Item = (EntityId, Q::Item);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&entity) = self.view.matches.get(self.position) {
            self.position += 1;
            let fetched = self
                .view
                .registry
                .with_storage(|storage| Q::fetch(storage, entity));
            if let Some(components) = fetched {
                return Some((entity, components));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.view.matches.len() - self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct A;
    impl Component for A {}

    #[derive(Debug, Clone, PartialEq)]
    struct B;
    impl Component for B {}

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u32);
    impl Component for Counter {}

    #[test]
    pub fn views_filter_by_required_and_ignored() {
        let registry = Registry::new().unwrap();
        let e1 = registry.create_entity(Some("E1")).unwrap().id;
        let e2 = registry.create_entity(Some("E2")).unwrap().id;
        let e3 = registry.create_entity(Some("E3")).unwrap().id;
        registry.add_component(e1, A).unwrap();
        registry.add_component(e2, A).unwrap();
        registry.add_component(e2, B).unwrap();
        registry.add_component(e3, B).unwrap();

        let both = registry.get_view::<(A, B)>().unwrap();
        assert_eq!(both.entities(), &[e2]);

        let only_a = registry
            .get_view::<(A,)>()
            .unwrap()
            .ignore_components::<(B,)>();
        assert_eq!(only_a.entities(), &[e1]);
    }

    #[test]
    pub fn views_are_complete() {
        let registry = Registry::new().unwrap();
        let mut expected = Vec::new();
        for i in 0..50 {
            let id = registry.create_entity(None).unwrap().id;
            if i % 3 != 0 {
                registry.add_component(id, Counter(i)).unwrap();
                expected.push(id);
            }
        }

        let view = registry.get_view::<(Counter,)>().unwrap();
        let mut seen: Vec<_> = view.iter().map(|(id, _)| id).collect();
        seen.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    pub fn snapshot_is_stable_until_refresh() {
        let registry = Registry::new().unwrap();
        let first = registry.create_entity(None).unwrap().id;
        registry.add_component(first, Counter(1)).unwrap();

        let mut view = registry.get_view::<(Counter,)>().unwrap();
        let second = registry.create_entity(None).unwrap().id;
        registry.add_component(second, Counter(2)).unwrap();
        assert_eq!(view.size(), 1);

        view.refresh();
        assert_eq!(view.size(), 2);
    }

    #[test]
    pub fn items_are_read_when_reached() {
        let registry = Registry::new().unwrap();
        let first = registry.create_entity(None).unwrap().id;
        let second = registry.create_entity(None).unwrap().id;
        registry.add_component(first, Counter(1)).unwrap();
        registry.add_component(second, Counter(2)).unwrap();

        let view = registry.get_view::<(Counter,)>().unwrap();
        let mut iter = view.iter();
        let (_, (held,)) = iter.next().unwrap();

        registry.update_component(first, Counter(10)).unwrap();
        registry.update_component(second, Counter(20)).unwrap();

        // The held item is a clone, the next one is read after the update
        assert_eq!(held, Counter(1));
        assert_eq!(iter.next(), Some((second, (Counter(20),))));
        assert_eq!(registry.get_component::<Counter>(first), Ok(Counter(10)));
    }

    #[test]
    pub fn mutation_during_iteration() {
        let registry = Registry::new().unwrap();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let id = registry.create_entity(None).unwrap().id;
                registry.add_component(id, Counter(i)).unwrap();
                id
            })
            .collect();

        let view = registry.get_view::<(Counter,)>().unwrap();
        let mut visited = Vec::new();
        for (id, (counter,)) in &view {
            visited.push(id);
            // Updating the current entity is fine
            registry.update_component(id, Counter(counter.0 + 100)).unwrap();
            // Erasing an entity that hasn't been visited yet makes the view skip it
            if id == ids[0] {
                registry.remove_component::<Counter>(ids[2]).unwrap();
            }
        }

        assert_eq!(visited, vec![ids[0], ids[1], ids[3]]);
        assert_eq!(registry.get_component::<Counter>(ids[1]), Ok(Counter(101)));
    }
}
