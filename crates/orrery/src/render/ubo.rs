use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Per-frame global uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub view: Mat4,
    pub projection: Mat4,
    /// Render space anchor (xyz), in render units. Used for camera relative shading.
    pub render_origin: Vec4,
    pub camera_position: Vec4,
}

/// Per-object uniform block, one per renderable, addressed with a dynamic offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectUbo {
    pub model: Mat4,
    pub normal_matrix: Mat4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    pub fn layouts_have_no_padding() {
        assert_eq!(mem::size_of::<GlobalUbo>(), 160);
        assert_eq!(mem::size_of::<ObjectUbo>(), 128);
        assert_eq!(mem::size_of::<Vertex>(), 32);
    }
}
