use crate::ecs::Component;

/// A mesh drawn from the global vertex and index buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRenderable {
    /// First index of the mesh in the global index buffer.
    pub mesh_offset: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    /// Slot of the mesh in the per-object uniform buffer. Stable for the renderable's lifetime.
    pub ubo_index: u32,
    /// Slot in the bindless texture array, if the mesh is textured.
    pub texture_index: Option<u32>,
}

impl Component for MeshRenderable {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Scene,
    CelestialBody,
    Spacecraft,
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifiers {
    pub kind: EntityKind,
}

impl Component for Identifiers {}
