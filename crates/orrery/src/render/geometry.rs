//! Procedurally generated meshes

use super::Vertex;

/// A unit cube (edge length 2, centered at the origin) with per-face normals and UVs.
pub fn unit_cube() -> (Vec<Vertex>, Vec<u32>) {
    // normal, then the two axes spanning the face
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, u, v) in FACES {
        let base = vertices.len() as u32;
        for (s, t) in CORNERS {
            let position = [0, 1, 2].map(|axis| normal[axis] + u[axis] * s + v[axis] * t);
            vertices.push(Vertex {
                position,
                normal,
                uv: [(s + 1.0) * 0.5, 1.0 - (t + 1.0) * 0.5],
            });
        }
        indices.extend([0, 1, 2, 2, 3, 0].map(|i| base + i));
    }

    (vertices, indices)
}

/// Concatenates `count` copies of a mesh. Returns the combined buffers and the index count of
/// a single copy; copy `n` starts at index `n * index_count`.
pub fn replicate(vertices: &[Vertex], indices: &[u32], count: usize) -> (Vec<Vertex>, Vec<u32>) {
    let mut all_vertices = Vec::with_capacity(vertices.len() * count);
    let mut all_indices = Vec::with_capacity(indices.len() * count);
    for copy in 0..count {
        let base = (copy * vertices.len()) as u32;
        all_vertices.extend_from_slice(vertices);
        all_indices.extend(indices.iter().map(|&i| base + i));
    }
    (all_vertices, all_indices)
}
