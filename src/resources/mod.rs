//! Resource management
//!
//! Cached shader programs, textures and meshes. Every cache lives as long as
//! the application and releases its GPU objects only at shutdown.

mod cache;
mod loader;
mod material;
mod mesh;
mod shader;
mod texture;

pub use cache::*;
pub use loader::*;
pub use material::*;
pub use mesh::*;
pub use shader::*;
pub use texture::*;

use crate::backend::GraphicsBackend;

/// The three resource caches shared by every render system
pub struct ResourceManagers {
    pub shaders: ShaderManager,
    pub textures: TextureManager,
    pub meshes: MeshManager,
}

impl ResourceManagers {
    pub fn new() -> Self {
        Self {
            shaders: ShaderManager::new(),
            textures: TextureManager::new(),
            meshes: MeshManager::new(),
        }
    }

    /// Caches backed by custom decoding and import collaborators
    pub fn with_collaborators(
        decoder: Box<dyn TextureDecoder>,
        loader: Box<dyn AssetLoader>,
    ) -> Self {
        Self {
            shaders: ShaderManager::new(),
            textures: TextureManager::with_decoder(decoder),
            meshes: MeshManager::with_loader(loader),
        }
    }

    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        self.shaders.release_all(backend);
        self.textures.release_all(backend);
        self.meshes.release_all(backend);
    }
}

impl Default for ResourceManagers {
    fn default() -> Self {
        Self::new()
    }
}
