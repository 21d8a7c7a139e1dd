//! Asset import collaborators

use std::path::{Path, PathBuf};

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::{SkinnedVertex, Vertex};

/// Material parameters read alongside a mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshMaterial {
    pub diffuse_texture: Option<PathBuf>,
    pub diffuse_color: Vec3,
    pub specular: f32,
    pub shininess: f32,
}

#[derive(Debug, Clone)]
pub enum MeshVertices {
    Static(Vec<Vertex>),
    Skinned(Vec<SkinnedVertex>),
}

impl MeshVertices {
    pub fn len(&self) -> usize {
        match self {
            MeshVertices::Static(v) => v.len(),
            MeshVertices::Skinned(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Imported mesh data ready for upload
#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: MeshVertices,
    pub indices: Vec<u32>,
    pub material: Option<MeshMaterial>,
}

#[derive(Debug, Clone)]
pub struct Bone {
    pub name: String,
    pub parent: Option<usize>,
    pub inverse_bind: Mat4,
}

#[derive(Debug, Clone)]
pub struct AnimationClip {
    pub name: String,
    pub duration: f32,
}

/// Bone hierarchy plus the clips that animate it
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    pub bones: Vec<Bone>,
    pub clips: Vec<AnimationClip>,
}

/// Mesh and skeleton import
pub trait AssetLoader {
    fn load_mesh(&self, path: &Path) -> Result<MeshData, String>;

    fn load_skeleton(&self, path: &Path) -> Result<Skeleton, String>;
}

/// Wavefront OBJ importer on `tobj`
#[derive(Debug, Default)]
pub struct ObjLoader;

impl AssetLoader for ObjLoader {
    fn load_mesh(&self, path: &Path) -> Result<MeshData, String> {
        let (models, materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
        )
        .map_err(|e| e.to_string())?;

        if models.is_empty() {
            return Err("file contains no geometry".into());
        }

        // All models in the file are merged into one vertex/index stream.
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut material_id = None;

        for model in &models {
            let mesh = &model.mesh;
            let base = vertices.len() as u32;
            let count = mesh.positions.len() / 3;
            let has_normals = mesh.normals.len() == mesh.positions.len();
            let has_uvs = mesh.texcoords.len() / 2 == count;

            for i in 0..count {
                let position = Vec3::from_slice(&mesh.positions[i * 3..i * 3 + 3]);
                let normal = if has_normals {
                    Vec3::from_slice(&mesh.normals[i * 3..i * 3 + 3])
                } else {
                    Vec3::Y
                };
                let uv = if has_uvs {
                    // OBJ has v pointing up
                    Vec2::new(mesh.texcoords[i * 2], 1.0 - mesh.texcoords[i * 2 + 1])
                } else {
                    Vec2::ZERO
                };
                vertices.push(Vertex {
                    position,
                    normal,
                    uv,
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
            indices.extend(mesh.indices.iter().map(|i| base + i));
            material_id = material_id.or(mesh.material_id);
        }

        let material = match (material_id, materials) {
            (Some(id), Ok(materials)) => materials.get(id).map(|m| {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                MeshMaterial {
                    diffuse_texture: m.diffuse_texture.as_ref().map(|t| dir.join(t)),
                    diffuse_color: m.diffuse.map(Vec3::from).unwrap_or(Vec3::ONE),
                    specular: m.specular.map(|s| s[0]).unwrap_or(0.0),
                    shininess: m.shininess.unwrap_or(32.0),
                }
            }),
            (_, Err(e)) => {
                log::warn!("{}: material library not loaded: {}", path.display(), e);
                None
            }
            _ => None,
        };

        log::debug!(
            "Imported {} ({} vertices, {} triangles)",
            path.display(),
            vertices.len(),
            indices.len() / 3
        );

        Ok(MeshData {
            vertices: MeshVertices::Static(vertices),
            indices,
            material,
        })
    }

    fn load_skeleton(&self, path: &Path) -> Result<Skeleton, String> {
        Err(format!("{} : OBJ files carry no skeleton", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_loader_reads_triangle() {
        let dir = std::env::temp_dir().join("tidewater_obj_loader_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tri.obj");
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nvt 1 0\nvt 0 1\nvn 0 0 1\nf 1/1/1 2/2/1 3/3/1\n",
        )
        .unwrap();

        let data = ObjLoader.load_mesh(&path).unwrap();
        assert_eq!(data.vertices.len(), 3);
        assert_eq!(data.indices, vec![0, 1, 2]);
        match data.vertices {
            MeshVertices::Static(v) => assert_eq!(v[0].normal, Vec3::Z),
            MeshVertices::Skinned(_) => panic!("expected static vertices"),
        }
    }

    #[test]
    fn test_obj_loader_missing_file() {
        assert!(ObjLoader.load_mesh(Path::new("nowhere/none.obj")).is_err());
    }
}
