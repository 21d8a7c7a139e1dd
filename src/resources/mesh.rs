//! Mesh generation, upload and the mesh cache

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};

use crate::backend::*;
use crate::error::{EngineError, EngineResult, ErrorKind};

use super::cache::{GpuResource, ResourceCache};
use super::loader::{AssetLoader, MeshData, MeshMaterial, MeshVertices, ObjLoader, Skeleton};
use super::texture::normalize_path;

/// Procedurally generated meshes available without any asset file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinMesh {
    Cube,
    /// Unit quad in the XY plane, drawn as a triangle strip
    Quad,
    /// Clip-space quad covering the whole viewport, drawn as a triangle strip
    FullscreenQuad,
    /// 1x1 XZ plane subdivided into a grid
    Plane,
    Sphere,
}

/// Cache key for meshes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MeshKey {
    File(PathBuf),
    BuiltIn(BuiltinMesh),
}

impl MeshKey {
    pub fn file(path: impl AsRef<Path>) -> Self {
        MeshKey::File(normalize_path(path.as_ref()))
    }
}

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub topology: PrimitiveTopology,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            topology: PrimitiveTopology::TriangleList,
            name: name.to_string(),
        }
    }

    pub fn builtin(kind: BuiltinMesh) -> Self {
        match kind {
            BuiltinMesh::Cube => Self::cube(),
            BuiltinMesh::Quad => Self::quad(),
            BuiltinMesh::FullscreenQuad => Self::fullscreen_quad(),
            BuiltinMesh::Plane => Self::plane(1.0, 1.0, 16),
            BuiltinMesh::Sphere => Self::sphere(32, 16),
        }
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];

        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = mesh.vertices.len() as u32;
            let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
            for (u, v) in corners {
                mesh.vertices.push(Vertex {
                    position: (normal + right * u + up * v) * 0.5,
                    normal,
                    uv: Vec2::new((u + 1.0) * 0.5, 1.0 - (v + 1.0) * 0.5),
                    tangent: right.extend(1.0),
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// Unit quad centered at the origin in the XY plane
    pub fn quad() -> Self {
        let mut mesh = Mesh::new("quad");
        mesh.topology = PrimitiveTopology::TriangleStrip;
        for (x, y) in [(-0.5, 0.5), (-0.5, -0.5), (0.5, 0.5), (0.5, -0.5)] {
            mesh.vertices.push(Vertex {
                position: Vec3::new(x, y, 0.0),
                normal: Vec3::Z,
                uv: Vec2::new(x + 0.5, 0.5 - y),
                tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
            });
        }
        mesh
    }

    /// Quad spanning clip space from (-1, -1) to (1, 1)
    pub fn fullscreen_quad() -> Self {
        let mut mesh = Self::quad();
        mesh.name = "fullscreen_quad".to_string();
        for vertex in &mut mesh.vertices {
            vertex.position *= 2.0;
        }
        mesh
    }

    /// Create a UV sphere
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");

        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());

                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal: normal.normalize_or_zero(),
                    uv: Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                    tangent: Vec3::new(-theta.sin(), 0.0, theta.cos()).extend(1.0),
                });
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }

    /// Create a plane on the XZ axis
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");

        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                mesh.vertices.push(Vertex {
                    position: Vec3::new(
                        -width / 2.0 + x as f32 * step_x,
                        0.0,
                        -depth / 2.0 + z as f32 * step_z,
                    ),
                    normal: Vec3::Y,
                    uv: Vec2::new(
                        x as f32 / subdivisions as f32,
                        z as f32 / subdivisions as f32,
                    ),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }
}

/// Vertex and index buffers shared by every entity drawing this mesh
#[derive(Debug)]
pub struct GpuMesh {
    pub name: String,
    vertex_buffer: BufferHandle,
    layout: VertexBufferLayout,
    vertex_count: u32,
    index_buffer: Option<BufferHandle>,
    index_count: u32,
    topology: PrimitiveTopology,
    pub material: Option<MeshMaterial>,
}

impl GpuMesh {
    pub fn upload(backend: &mut dyn GraphicsBackend, mesh: &Mesh) -> EngineResult<Self> {
        Self::upload_raw(
            backend,
            &mesh.name,
            bytemuck::cast_slice(&mesh.vertices),
            mesh.vertices.len() as u32,
            Vertex::layout(),
            &mesh.indices,
            mesh.topology,
        )
    }

    pub fn upload_data(
        backend: &mut dyn GraphicsBackend,
        name: &str,
        data: &MeshData,
    ) -> EngineResult<Self> {
        let (bytes, layout): (&[u8], _) = match &data.vertices {
            MeshVertices::Static(v) => (bytemuck::cast_slice(v), Vertex::layout()),
            MeshVertices::Skinned(v) => (bytemuck::cast_slice(v), SkinnedVertex::layout()),
        };
        let mut mesh = Self::upload_raw(
            backend,
            name,
            bytes,
            data.vertices.len() as u32,
            layout,
            &data.indices,
            PrimitiveTopology::TriangleList,
        )?;
        mesh.material = data.material.clone();
        Ok(mesh)
    }

    fn upload_raw(
        backend: &mut dyn GraphicsBackend,
        name: &str,
        vertex_bytes: &[u8],
        vertex_count: u32,
        layout: VertexBufferLayout,
        indices: &[u32],
        topology: PrimitiveTopology,
    ) -> EngineResult<Self> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{name} vertices")),
                size: vertex_bytes.len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            vertex_bytes,
        )?;

        let index_buffer = if indices.is_empty() {
            None
        } else {
            let bytes: &[u8] = bytemuck::cast_slice(indices);
            match backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("{name} indices")),
                    size: bytes.len() as u64,
                    usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                },
                bytes,
            ) {
                Ok(buffer) => Some(buffer),
                Err(err) => {
                    backend.destroy_buffer(vertex_buffer);
                    return Err(err.into());
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            vertex_buffer,
            layout,
            vertex_count,
            index_buffer,
            index_count: indices.len() as u32,
            topology,
            material: None,
        })
    }

    pub fn is_indexed(&self) -> bool {
        self.index_buffer.is_some()
    }

    pub fn element_count(&self) -> u32 {
        if self.is_indexed() {
            self.index_count
        } else {
            self.vertex_count
        }
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.topology
    }

    /// Bind the mesh's buffers into vertex slot 0
    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_vertex_buffer(0, self.vertex_buffer, &self.layout);
        if let Some(index_buffer) = self.index_buffer {
            backend.set_index_buffer(index_buffer, IndexFormat::Uint32);
        }
    }

    /// Issue the draw for a mesh bound with [`GpuMesh::bind`]
    pub fn draw(&self, backend: &mut dyn GraphicsBackend, instances: Range<u32>) {
        if self.is_indexed() {
            backend.draw_indexed(self.topology, 0..self.index_count, instances);
        } else {
            backend.draw(self.topology, 0..self.vertex_count, instances);
        }
    }
}

impl GpuResource for GpuMesh {
    fn release(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertex_buffer);
        if let Some(index_buffer) = self.index_buffer {
            backend.destroy_buffer(index_buffer);
        }
    }
}

/// Cache of uploaded meshes keyed by file path or built-in name
pub struct MeshManager {
    cache: ResourceCache<MeshKey, GpuMesh>,
    loader: Box<dyn AssetLoader>,
}

impl MeshManager {
    pub fn new() -> Self {
        Self::with_loader(Box::new(ObjLoader))
    }

    pub fn with_loader(loader: Box<dyn AssetLoader>) -> Self {
        Self {
            cache: ResourceCache::new("mesh"),
            loader,
        }
    }

    pub fn get(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        path: impl AsRef<Path>,
    ) -> EngineResult<Arc<GpuMesh>> {
        self.get_key(backend, &MeshKey::file(path))
    }

    pub fn builtin(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        kind: BuiltinMesh,
    ) -> EngineResult<Arc<GpuMesh>> {
        self.get_key(backend, &MeshKey::BuiltIn(kind))
    }

    pub fn get_key(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        key: &MeshKey,
    ) -> EngineResult<Arc<GpuMesh>> {
        let loader = &self.loader;
        self.cache.get_or_create(key, |key| match key {
            MeshKey::BuiltIn(kind) => GpuMesh::upload(backend, &Mesh::builtin(*kind)),
            MeshKey::File(path) => {
                let data = loader.load_mesh(path).map_err(|reason| {
                    EngineError::new(ErrorKind::MeshLoad {
                        path: path.clone(),
                        reason,
                    })
                })?;
                if data.vertices.is_empty() {
                    return Err(EngineError::new(ErrorKind::MeshLoad {
                        path: path.clone(),
                        reason: "mesh has no vertices".into(),
                    }));
                }
                log::info!("Loaded mesh {}", path.display());
                GpuMesh::upload_data(backend, &path.to_string_lossy(), &data)
            }
        })
    }

    /// Skeletons are handed straight to the animation collaborator and not cached
    pub fn load_skeleton(&self, path: impl AsRef<Path>) -> EngineResult<Skeleton> {
        let path = path.as_ref();
        self.loader.load_skeleton(path).map_err(|reason| {
            EngineError::new(ErrorKind::MeshLoad {
                path: path.to_path_buf(),
                reason,
            })
        })
    }

    pub fn contains(&self, key: &MeshKey) -> bool {
        self.cache.contains(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn constructions(&self) -> usize {
        self.cache.constructions()
    }

    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        self.cache.release_all(backend);
    }
}

impl Default for MeshManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_faces_point_outward() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        for v in &cube.vertices {
            assert!(v.position.dot(v.normal) > 0.0);
        }
    }

    #[test]
    fn test_fullscreen_quad_covers_clip_space() {
        let quad = Mesh::fullscreen_quad();
        assert_eq!(quad.topology, PrimitiveTopology::TriangleStrip);
        assert!(quad.indices.is_empty());
        let max = quad
            .vertices
            .iter()
            .fold(Vec3::ZERO, |acc, v| acc.max(v.position.abs()));
        assert_eq!(max, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_builtin_is_uploaded_once() {
        let mut backend = HeadlessBackend::default();
        let mut meshes = MeshManager::new();
        let a = meshes.builtin(&mut backend, BuiltinMesh::Cube).unwrap();
        let b = meshes.builtin(&mut backend, BuiltinMesh::Cube).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.live_buffers(), 2);
        assert_eq!(a.element_count(), 36);
    }

    #[test]
    fn test_missing_mesh_file_names_path() {
        let mut backend = HeadlessBackend::default();
        let mut meshes = MeshManager::new();
        let err = meshes.get(&mut backend, "models/absent.obj").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::MeshLoad { path, .. } if path == Path::new("models/absent.obj")
        ));
        assert!(meshes.is_empty());
    }

    #[test]
    fn test_release_frees_vertex_and_index_buffers() {
        let mut backend = HeadlessBackend::default();
        let mut meshes = MeshManager::new();
        meshes.builtin(&mut backend, BuiltinMesh::Sphere).unwrap();
        meshes.builtin(&mut backend, BuiltinMesh::Quad).unwrap();
        assert_eq!(backend.live_buffers(), 3);
        meshes.release_all(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
    }
}
