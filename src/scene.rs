// CPU-side scene data
//
// Geometry after import: one global vertex buffer, one global index buffer,
// and submeshes identifying contiguous draw ranges within them. Submeshes are
// kept in source parse order; the frame loop draws them in exactly that order
// with no sorting by material, depth or transparency.

use bytemuck::{Pod, Zeroable};
use std::path::Path;

use crate::error::{RenderError, Result};

/// Interleaved vertex layout: position @0, normal @12, texcoord @24.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
}

pub const VERTEX_STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Material {
    pub diffuse_color: [f32; 4],
    /// Texture file reference as authored in the source material, if any.
    pub diffuse_texture: Option<String>,
}

/// A contiguous draw range within the shared global buffers.
#[derive(Debug, Clone)]
pub struct Submesh {
    pub start_index: u32,
    pub index_count: u32,
    pub base_vertex: u32,
    pub material: Material,
}

pub struct SceneData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<Submesh>,
}

impl SceneData {
    /// Import an OBJ file, flattening every model into the shared buffers in
    /// parse order. Each model becomes one submesh carrying its material.
    pub fn load_obj(path: &Path, scale: f32) -> Result<Self> {
        let load_error = |reason: String| RenderError::SceneLoad {
            path: path.to_path_buf(),
            reason,
        };

        let (models, materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
        )
        .map_err(|e| load_error(e.to_string()))?;
        let materials = materials.unwrap_or_default();

        let mut scene = Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            submeshes: Vec::new(),
        };

        for model in &models {
            let mesh = &model.mesh;
            if mesh.positions.len() % 3 != 0 {
                return Err(load_error(format!(
                    "model '{}': position stream length {} is not a multiple of 3",
                    model.name,
                    mesh.positions.len()
                )));
            }

            let base_vertex = scene.vertices.len() as u32;
            let start_index = scene.indices.len() as u32;
            let vertex_count = mesh.positions.len() / 3;

            for i in 0..vertex_count {
                let position = [
                    mesh.positions[3 * i] * scale,
                    mesh.positions[3 * i + 1] * scale,
                    mesh.positions[3 * i + 2] * scale,
                ];
                let normal = if mesh.normals.len() >= 3 * (i + 1) {
                    [
                        mesh.normals[3 * i],
                        mesh.normals[3 * i + 1],
                        mesh.normals[3 * i + 2],
                    ]
                } else {
                    [0.0, 1.0, 0.0]
                };
                let texcoord = if mesh.texcoords.len() >= 2 * (i + 1) {
                    // OBJ texture space is bottom-up
                    [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
                } else {
                    [0.0, 0.0]
                };
                scene.vertices.push(Vertex {
                    position,
                    normal,
                    texcoord,
                });
            }

            scene.indices.extend_from_slice(&mesh.indices);

            let material = mesh
                .material_id
                .and_then(|id| materials.get(id))
                .map(|m| Material {
                    diffuse_color: m
                        .diffuse
                        .map(|[r, g, b]| [r, g, b, 1.0])
                        .unwrap_or([1.0, 1.0, 1.0, 1.0]),
                    diffuse_texture: m.diffuse_texture.clone(),
                })
                .unwrap_or(Material {
                    diffuse_color: [1.0, 1.0, 1.0, 1.0],
                    diffuse_texture: None,
                });

            scene.submeshes.push(Submesh {
                start_index,
                index_count: mesh.indices.len() as u32,
                base_vertex,
                material,
            });
        }

        if scene.submeshes.is_empty() {
            return Err(load_error("no geometry found".to_string()));
        }

        scene.validate()?;
        log::info!(
            "Imported {:?}: {} vertices, {} indices, {} submeshes",
            path,
            scene.vertices.len(),
            scene.indices.len(),
            scene.submeshes.len()
        );
        Ok(scene)
    }

    /// Procedural unit cube: 8 corner vertices, 36 indices, one submesh with
    /// no texture reference. The fallback scene when no model is configured.
    pub fn unit_cube(scale: f32) -> Self {
        let s = 0.5 * scale;
        let corners = [
            [-s, -s, -s],
            [s, -s, -s],
            [s, s, -s],
            [-s, s, -s],
            [-s, -s, s],
            [s, -s, s],
            [s, s, s],
            [-s, s, s],
        ];

        let vertices = corners
            .iter()
            .map(|&position| {
                // Corner-averaged normal: the normalized corner direction.
                let len = (position[0] * position[0]
                    + position[1] * position[1]
                    + position[2] * position[2])
                    .sqrt();
                Vertex {
                    position,
                    normal: [position[0] / len, position[1] / len, position[2] / len],
                    texcoord: [0.0, 0.0],
                }
            })
            .collect();

        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 0, 3, 2, // back
            4, 5, 6, 4, 6, 7, // front
            0, 1, 5, 0, 5, 4, // bottom
            3, 6, 2, 3, 7, 6, // top
            0, 4, 7, 0, 7, 3, // left
            1, 2, 6, 1, 6, 5, // right
        ];

        Self {
            vertices,
            indices,
            submeshes: vec![Submesh {
                start_index: 0,
                index_count: 36,
                base_vertex: 0,
                material: Material {
                    diffuse_color: [0.8, 0.8, 0.9, 1.0],
                    diffuse_texture: None,
                },
            }],
        }
    }

    /// Boundary checks, enforced at load time rather than at draw time:
    /// every submesh range must lie within the global index buffer, and every
    /// index value, after base-vertex adjustment, must name a real vertex.
    pub fn validate(&self) -> Result<()> {
        let total_indices = self.indices.len() as u32;
        let total_vertices = self.vertices.len() as u32;

        for (i, submesh) in self.submeshes.iter().enumerate() {
            let end = submesh
                .start_index
                .checked_add(submesh.index_count)
                .ok_or(RenderError::SubmeshOutOfBounds {
                    submesh: i,
                    start: submesh.start_index,
                    count: submesh.index_count,
                    total: total_indices,
                })?;
            if end > total_indices {
                return Err(RenderError::SubmeshOutOfBounds {
                    submesh: i,
                    start: submesh.start_index,
                    count: submesh.index_count,
                    total: total_indices,
                });
            }

            let range = submesh.start_index as usize..end as usize;
            for &index in &self.indices[range] {
                let resolved = index as u64 + submesh.base_vertex as u64;
                if resolved >= total_vertices as u64 {
                    return Err(RenderError::IndexOutOfBounds {
                        submesh: i,
                        resolved,
                        total: total_vertices,
                    });
                }
            }
        }
        Ok(())
    }

    /// Unique texture references across all submeshes, in first-seen order
    /// (source parse order).
    pub fn unique_texture_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        for submesh in &self.submeshes {
            if let Some(texture) = submesh.material.diffuse_texture.as_deref() {
                if !texture.is_empty() && !refs.contains(&texture) {
                    refs.push(texture);
                }
            }
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_scene(vertices: usize, indices: Vec<u32>, submeshes: Vec<Submesh>) -> SceneData {
        SceneData {
            vertices: vec![Vertex::zeroed(); vertices],
            indices,
            submeshes,
        }
    }

    fn plain_submesh(start_index: u32, index_count: u32, base_vertex: u32) -> Submesh {
        Submesh {
            start_index,
            index_count,
            base_vertex,
            material: Material::default(),
        }
    }

    #[test]
    fn cube_has_eight_vertices_and_thirty_six_indices() {
        let cube = SceneData::unit_cube(1.0);
        assert_eq!(cube.vertices.len(), 8);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.submeshes.len(), 1);
        assert_eq!(cube.submeshes[0].index_count, 36);
        assert_eq!(cube.submeshes[0].start_index, 0);
        assert_eq!(cube.submeshes[0].base_vertex, 0);
        cube.validate().unwrap();
    }

    #[test]
    fn vertex_layout_matches_pipeline_offsets() {
        assert_eq!(VERTEX_STRIDE, 32);
        assert_eq!(std::mem::offset_of!(Vertex, position), 0);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 12);
        assert_eq!(std::mem::offset_of!(Vertex, texcoord), 24);
    }

    #[test]
    fn range_past_index_buffer_is_rejected() {
        let scene = flat_scene(4, vec![0, 1, 2], vec![plain_submesh(0, 4, 0)]);
        assert!(matches!(
            scene.validate(),
            Err(RenderError::SubmeshOutOfBounds { submesh: 0, .. })
        ));
    }

    #[test]
    fn offset_range_past_index_buffer_is_rejected() {
        let scene = flat_scene(4, vec![0, 1, 2], vec![plain_submesh(2, 2, 0)]);
        assert!(scene.validate().is_err());
    }

    #[test]
    fn resolved_index_past_vertex_buffer_is_rejected() {
        // index 1 + base_vertex 3 = 4, but only 4 vertices (max valid 3)
        let scene = flat_scene(4, vec![0, 1, 2], vec![plain_submesh(0, 3, 3)]);
        assert!(matches!(
            scene.validate(),
            Err(RenderError::IndexOutOfBounds {
                submesh: 0,
                resolved: 4,
                ..
            })
        ));
    }

    #[test]
    fn adjacent_submeshes_within_bounds_pass() {
        let scene = flat_scene(
            6,
            vec![0, 1, 2, 0, 1, 2],
            vec![plain_submesh(0, 3, 0), plain_submesh(3, 3, 3)],
        );
        scene.validate().unwrap();
    }

    #[test]
    fn unique_refs_keep_first_seen_order() {
        let with_texture = |name: &str| Submesh {
            start_index: 0,
            index_count: 0,
            base_vertex: 0,
            material: Material {
                diffuse_color: [1.0; 4],
                diffuse_texture: Some(name.to_string()),
            },
        };
        let scene = flat_scene(
            0,
            vec![],
            vec![
                with_texture("wood.png"),
                with_texture("brick.png"),
                with_texture("wood.png"),
                plain_submesh(0, 0, 0),
            ],
        );
        assert_eq!(scene.unique_texture_refs(), vec!["wood.png", "brick.png"]);
    }
}
