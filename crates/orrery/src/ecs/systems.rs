//! Systems operating on the registry

use super::{
    components::{ReferenceFrame, Transform},
    EcsError, EntityId, Registry,
};
use ahash::{AHashMap, AHashSet};
use log::*;

/// Outcome of [`propagate_reference_frames`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Amount of frames whose global transform was recomputed.
    pub updated: usize,
    /// Frames that are part of a parent cycle, or descend from one. Their global transforms are
    /// left untouched.
    pub cyclic: Vec<EntityId>,
}

/// Recomputes the global transform of every reference frame from its parent chain.
///
/// Parents are always resolved before their children. A frame whose parent has no
/// [`ReferenceFrame`] is treated like a root.
pub fn propagate_reference_frames(registry: &Registry) -> Result<PropagationReport, EcsError> {
    let view = registry.get_view::<(ReferenceFrame,)>()?;
    let order: Vec<EntityId> = view.entities().to_vec();
    let frames: AHashMap<EntityId, ReferenceFrame> =
        view.iter().map(|(id, (frame,))| (id, frame)).collect();

    let mut resolved: AHashMap<EntityId, Transform> = AHashMap::with_capacity(frames.len());
    let mut cyclic: AHashSet<EntityId> = AHashSet::new();

    for &start in &order {
        if resolved.contains_key(&start) || cyclic.contains(&start) {
            continue;
        }

        // Walk up until something with a known global transform shows up
        let mut path = Vec::new();
        let mut on_path = AHashSet::new();
        let mut current = start;
        let base = loop {
            if let Some(global) = resolved.get(&current) {
                break Some(*global);
            }
            if cyclic.contains(&current) {
                break None;
            }
            if !on_path.insert(current) {
                error!("Reference frame #{current} is part of a parent cycle");
                break None;
            }
            path.push(current);

            match frames.get(&current).and_then(|frame| frame.parent) {
                None => break Some(Transform::IDENTITY),
                Some(parent) if frames.contains_key(&parent) => current = parent,
                Some(parent) => {
                    warn!("Parent #{parent} of reference frame #{current} has no frame itself");
                    break Some(Transform::IDENTITY);
                }
            }
        };

        match base {
            Some(mut global) => {
                for id in path.iter().rev() {
                    global = global.compose(&frames[id].local);
                    resolved.insert(*id, global);
                }
            }
            None => cyclic.extend(path),
        }
    }

    for (&id, &global) in &resolved {
        registry.with_component_mut::<ReferenceFrame, _>(id, |frame| frame.global = global)?;
    }

    let mut cyclic: Vec<_> = cyclic.into_iter().collect();
    cyclic.sort_unstable();
    Ok(PropagationReport {
        updated: resolved.len(),
        cyclic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::RENDER_SPACE_ENTITY;
    use glam::{DQuat, DVec3};

    fn frame_at(registry: &Registry, parent: EntityId, position: DVec3) -> EntityId {
        let id = registry.create_entity(None).unwrap().id;
        registry
            .add_component(
                id,
                ReferenceFrame::child_of(parent, Transform::from_position(position)),
            )
            .unwrap();
        id
    }

    #[test]
    pub fn globals_follow_the_parent_chain() {
        let registry = Registry::new().unwrap();
        let earth = frame_at(&registry, RENDER_SPACE_ENTITY, DVec3::new(1.5e11, 0.0, 0.0));
        // Added before its parent's parent on purpose
        let moon = frame_at(&registry, earth, DVec3::new(3.84e8, 0.0, 0.0));

        registry
            .with_component_mut::<ReferenceFrame, _>(earth, |frame| {
                frame.local.rotation = DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2);
            })
            .unwrap();

        let report = propagate_reference_frames(&registry).unwrap();
        assert_eq!(report.updated, 3);
        assert!(report.cyclic.is_empty());

        let moon = registry.get_component::<ReferenceFrame>(moon).unwrap();
        let expected = DVec3::new(1.5e11, 3.84e8, 0.0);
        assert!((moon.global.position - expected).length() < 1e-3);
    }

    #[test]
    pub fn cycles_are_reported_not_followed() {
        let registry = Registry::new().unwrap();
        let a = frame_at(&registry, RENDER_SPACE_ENTITY, DVec3::X);
        let b = frame_at(&registry, a, DVec3::Y);
        let orphan_child = frame_at(&registry, b, DVec3::Z);
        registry
            .with_component_mut::<ReferenceFrame, _>(a, |frame| frame.parent = Some(b))
            .unwrap();

        let report = propagate_reference_frames(&registry).unwrap();
        assert_eq!(report.cyclic, vec![a, b, orphan_child]);
        // Only the render space root got resolved
        assert_eq!(report.updated, 1);
    }
}
