//! Texture decoding, upload and the path-keyed texture cache

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::backend::*;
use crate::error::{EngineError, EngineResult, ErrorKind};

use super::cache::{GpuResource, ResourceCache};

/// Fold `.` and `..` and unify separators so aliases of one file share an entry.
///
/// `\` counts as a separator on every platform, so asset paths written on
/// Windows resolve to the same key as their `/` spelling.
pub fn normalize_path(path: &Path) -> PathBuf {
    let unified = match path.to_str() {
        Some(text) if text.contains('\\') => PathBuf::from(text.replace('\\', "/")),
        _ => path.to_path_buf(),
    };
    let mut out = PathBuf::new();
    for component in unified.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Cache key for textures
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    File(PathBuf),
    /// Faces in +X, -X, +Y, -Y, +Z, -Z order
    Cubemap([PathBuf; 6]),
    /// 1x1 generated texture of one color
    Solid([u8; 4]),
}

impl TextureKey {
    pub fn file(path: impl AsRef<Path>) -> Self {
        TextureKey::File(normalize_path(path.as_ref()))
    }

    pub fn cubemap<P: AsRef<Path>>(faces: [P; 6]) -> Self {
        TextureKey::Cubemap(faces.map(|p| normalize_path(p.as_ref())))
    }

    pub fn white() -> Self {
        TextureKey::Solid([255, 255, 255, 255])
    }

    /// Flat tangent-space normal (0, 0, 1)
    pub fn flat_normal() -> Self {
        TextureKey::Solid([128, 128, 255, 255])
    }
}

/// Decoded pixel data, always expanded to RGBA8
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Channel count of the source image before expansion
    pub channels: u8,
    pub rgba: Vec<u8>,
}

impl DecodedImage {
    fn from_image(img: DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        let channels = img.color().channel_count();
        Self {
            width,
            height,
            channels,
            rgba: img.to_rgba8().into_raw(),
        }
    }

    pub fn solid_color(color: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            channels: 4,
            rgba: color.to_vec(),
        }
    }
}

/// Image decoding collaborator
pub trait TextureDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, String>;
}

/// Decoder on the `image` crate.
///
/// `.dds` files take the block-compressed path (DXT1/3/5), everything else
/// goes through format detection.
#[derive(Debug, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    fn is_block_compressed(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("dds"))
    }
}

impl TextureDecoder for ImageDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, String> {
        let img = if Self::is_block_compressed(path) {
            let file = File::open(path).map_err(|e| e.to_string())?;
            image::load(BufReader::new(file), ImageFormat::Dds).map_err(|e| e.to_string())?
        } else {
            image::open(path).map_err(|e| e.to_string())?
        };
        Ok(DecodedImage::from_image(img))
    }
}

/// GPU texture plus the metadata decoded with it
#[derive(Debug)]
pub struct Texture {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub dimension: TextureDimension,
}

impl Texture {
    fn upload_2d(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        image: &DecodedImage,
    ) -> EngineResult<Self> {
        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width: image.width,
            height: image.height,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            address_mode: AddressMode::Repeat,
        })?;
        backend.write_texture(handle, 0, &image.rgba, image.width, image.height);

        Ok(Self {
            handle,
            width: image.width,
            height: image.height,
            channels: image.channels,
            dimension: TextureDimension::D2,
        })
    }

    fn upload_cubemap(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        faces: &[DecodedImage],
        face_paths: &[PathBuf; 6],
    ) -> EngineResult<Self> {
        let (width, height) = (faces[0].width, faces[0].height);
        if let Some((face, path)) = faces
            .iter()
            .zip(face_paths)
            .find(|(f, _)| f.width != width || f.height != height)
        {
            return Err(EngineError::new(ErrorKind::TextureLoad {
                path: path.clone(),
                reason: format!(
                    "cubemap face is {}x{}, expected {}x{}",
                    face.width, face.height, width, height
                ),
            }));
        }

        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            dimension: TextureDimension::Cube,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            address_mode: AddressMode::ClampToEdge,
        })?;
        for (layer, face) in faces.iter().enumerate() {
            backend.write_texture(handle, layer as u32, &face.rgba, width, height);
        }

        Ok(Self {
            handle,
            width,
            height,
            channels: faces[0].channels,
            dimension: TextureDimension::Cube,
        })
    }
}

impl GpuResource for Texture {
    fn release(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture(self.handle);
    }
}

/// Cache of decoded and uploaded textures
pub struct TextureManager {
    cache: ResourceCache<TextureKey, Texture>,
    decoder: Box<dyn TextureDecoder>,
}

impl TextureManager {
    pub fn new() -> Self {
        Self::with_decoder(Box::new(ImageDecoder))
    }

    pub fn with_decoder(decoder: Box<dyn TextureDecoder>) -> Self {
        Self {
            cache: ResourceCache::new("texture"),
            decoder,
        }
    }

    /// Texture for a file path
    pub fn get(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        path: impl AsRef<Path>,
    ) -> EngineResult<Arc<Texture>> {
        self.get_key(backend, &TextureKey::file(path))
    }

    pub fn get_cubemap<P: AsRef<Path>>(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        faces: [P; 6],
    ) -> EngineResult<Arc<Texture>> {
        self.get_key(backend, &TextureKey::cubemap(faces))
    }

    pub fn get_key(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        key: &TextureKey,
    ) -> EngineResult<Arc<Texture>> {
        let decoder = &self.decoder;
        self.cache.get_or_create(key, |key| match key {
            TextureKey::File(path) => {
                let image = decode(decoder.as_ref(), path)?;
                log::info!(
                    "Loaded texture {} ({}x{}, {} channels)",
                    path.display(),
                    image.width,
                    image.height,
                    image.channels
                );
                Texture::upload_2d(backend, &path.to_string_lossy(), &image)
            }
            TextureKey::Cubemap(paths) => {
                let faces = paths
                    .iter()
                    .map(|p| decode(decoder.as_ref(), p))
                    .collect::<EngineResult<Vec<_>>>()?;
                log::info!("Loaded cubemap {}", paths[0].display());
                Texture::upload_cubemap(backend, &paths[0].to_string_lossy(), &faces, paths)
            }
            TextureKey::Solid(color) => {
                Texture::upload_2d(backend, "solid", &DecodedImage::solid_color(*color))
            }
        })
    }

    pub fn contains(&self, key: &TextureKey) -> bool {
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

impl Default for TextureManager {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(decoder: &dyn TextureDecoder, path: &Path) -> EngineResult<DecodedImage> {
    decoder.decode(path).map_err(|reason| {
        EngineError::new(ErrorKind::TextureLoad {
            path: path.to_path_buf(),
            reason,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingDecoder(Rc<Cell<usize>>);

    impl TextureDecoder for CountingDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, String> {
            self.0.set(self.0.get() + 1);
            if path.to_string_lossy().contains("missing") {
                return Err("no such file".into());
            }
            Ok(DecodedImage {
                width: 4,
                height: 2,
                channels: 3,
                rgba: vec![0; 4 * 2 * 4],
            })
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("assets/./textures/../textures/grass.png")),
            PathBuf::from("assets/textures/grass.png")
        );
        assert_eq!(normalize_path(Path::new("../a/b")), PathBuf::from("../a/b"));
        assert_eq!(
            normalize_path(Path::new("assets\\textures\\.\\grass.png")),
            PathBuf::from("assets/textures/grass.png")
        );
    }

    #[test]
    fn test_backslash_alias_shares_one_upload() {
        let decodes = Rc::new(Cell::new(0));
        let mut backend = HeadlessBackend::default();
        let mut textures = TextureManager::with_decoder(Box::new(CountingDecoder(decodes.clone())));

        let a = textures.get(&mut backend, "terrain/sand.png").unwrap();
        let b = textures.get(&mut backend, "terrain\\sand.png").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(decodes.get(), 1);
        assert_eq!(textures.len(), 1);

        textures.release_all(&mut backend);
    }

    #[test]
    fn test_aliased_paths_share_one_upload() {
        let decodes = Rc::new(Cell::new(0));
        let mut backend = HeadlessBackend::default();
        let mut textures = TextureManager::with_decoder(Box::new(CountingDecoder(decodes.clone())));

        let a = textures.get(&mut backend, "assets/grass.png").unwrap();
        let b = textures.get(&mut backend, "assets/./grass.png").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(decodes.get(), 1);
        assert_eq!(backend.textures_created(), 1);
        assert_eq!((a.width, a.height, a.channels), (4, 2, 3));
    }

    #[test]
    fn test_cubemap_uploads_six_layers() {
        let decodes = Rc::new(Cell::new(0));
        let mut backend = HeadlessBackend::default();
        let mut textures = TextureManager::with_decoder(Box::new(CountingDecoder(decodes.clone())));

        let sky = textures
            .get_cubemap(&mut backend, ["px.png", "nx.png", "py.png", "ny.png", "pz.png", "nz.png"])
            .unwrap();

        assert_eq!(sky.dimension, TextureDimension::Cube);
        assert_eq!(decodes.get(), 6);
        assert_eq!(backend.texture_layers_written(sky.handle), 6);
    }

    #[test]
    fn test_missing_cubemap_face_names_that_face() {
        let decodes = Rc::new(Cell::new(0));
        let mut backend = HeadlessBackend::default();
        let mut textures = TextureManager::with_decoder(Box::new(CountingDecoder(decodes)));

        let result = textures.get_cubemap(
            &mut backend,
            ["px.png", "nx.png", "missing.png", "ny.png", "pz.png", "nz.png"],
        );
        match result.unwrap_err().kind() {
            ErrorKind::TextureLoad { path, .. } => assert_eq!(path, Path::new("missing.png")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_image_decoder_reports_missing_file() {
        let err = ImageDecoder
            .decode(Path::new("does/not/exist.png"))
            .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_dds_selected_by_extension() {
        assert!(ImageDecoder::is_block_compressed(Path::new("water/dudv.DDS")));
        assert!(!ImageDecoder::is_block_compressed(Path::new("water/dudv.png")));
    }
}
