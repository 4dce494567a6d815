use super::Transform;
use crate::ecs::{Component, EntityId};

/// A node of the reference frame tree.
///
/// `local` is relative to the parent frame, `global` is the absolute transform in simulation
/// space, and is derived from the parent chain by
/// [`propagate_reference_frames`](crate::ecs::systems::propagate_reference_frames).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceFrame {
    /// `None` only for the root frame.
    pub parent: Option<EntityId>,
    /// Physical scale (radius) in meters.
    pub scale: f64,
    /// Multiplier applied on top of the physical scale when rendering. Children of this frame
    /// get their offsets exaggerated by it as well.
    pub visual_scale: f64,
    pub local: Transform,
    pub global: Transform,
}

impl Component for ReferenceFrame {}

impl ReferenceFrame {
    /// The root frame attached to the render space entity.
    pub const ROOT: Self = Self {
        parent: None,
        scale: 1.0,
        visual_scale: 1.0,
        local: Transform::IDENTITY,
        global: Transform::IDENTITY,
    };

    pub fn child_of(parent: EntityId, local: Transform) -> Self {
        Self {
            parent: Some(parent),
            local,
            global: local,
            ..Self::ROOT
        }
    }
}

impl Default for ReferenceFrame {
    fn default() -> Self {
        Self::ROOT
    }
}
