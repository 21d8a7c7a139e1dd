//! Off-screen render targets
//!
//! A [`FrameBufferTarget`] owns one framebuffer and its attachments. The set
//! and order of attachments is fixed per [`FrameBufferKind`]. A target only
//! exists once it passed its completeness check, and it cannot be resized:
//! a new resolution means releasing it and building a new one.

use crate::backend::*;
use crate::error::{EngineError, EngineResult, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameBufferKind {
    /// Single sampled depth texture (shadow and utility passes)
    DepthOnly,
    /// World position, normal, albedo+specular and a depth renderbuffer
    GBuffer,
    /// Color texture plus write-only depth renderbuffer
    WaterReflection,
    /// Color texture plus sampled depth texture
    WaterRefraction,
}

impl FrameBufferKind {
    pub fn label(&self) -> &'static str {
        match self {
            FrameBufferKind::DepthOnly => "depth_only",
            FrameBufferKind::GBuffer => "gbuffer",
            FrameBufferKind::WaterReflection => "water_reflection",
            FrameBufferKind::WaterRefraction => "water_refraction",
        }
    }

    /// Attachments in creation order
    fn attachments(&self) -> &'static [AttachmentSpec] {
        const SAMPLED_DEPTH: AttachmentSpec = AttachmentSpec {
            name: "depth",
            format: TextureFormat::Depth32Float,
            sampled: true,
        };
        const DEPTH_RENDERBUFFER: AttachmentSpec = AttachmentSpec {
            name: "depth",
            format: TextureFormat::Depth32Float,
            sampled: false,
        };
        const COLOR: AttachmentSpec = AttachmentSpec {
            name: "color",
            format: TextureFormat::Rgba8Unorm,
            sampled: true,
        };

        match self {
            FrameBufferKind::DepthOnly => &[SAMPLED_DEPTH],
            FrameBufferKind::GBuffer => &[
                AttachmentSpec {
                    name: "position",
                    format: TextureFormat::Rgba16Float,
                    sampled: true,
                },
                AttachmentSpec {
                    name: "normal",
                    format: TextureFormat::Rgba16Float,
                    sampled: true,
                },
                AttachmentSpec {
                    name: "albedo_spec",
                    format: TextureFormat::Rgba8Unorm,
                    sampled: true,
                },
                DEPTH_RENDERBUFFER,
            ],
            FrameBufferKind::WaterReflection => &[COLOR, DEPTH_RENDERBUFFER],
            FrameBufferKind::WaterRefraction => &[COLOR, SAMPLED_DEPTH],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttachmentSpec {
    name: &'static str,
    format: TextureFormat,
    /// Renderbuffers are attachments that are never sampled
    sampled: bool,
}

/// Depth attachment flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthAttachment {
    Renderbuffer(TextureHandle),
    Texture(TextureHandle),
}

impl DepthAttachment {
    pub fn handle(&self) -> TextureHandle {
        match self {
            DepthAttachment::Renderbuffer(h) | DepthAttachment::Texture(h) => *h,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unbound,
    Bound,
}

#[derive(Debug)]
pub struct FrameBufferTarget {
    kind: FrameBufferKind,
    width: u32,
    height: u32,
    framebuffer: FramebufferHandle,
    color: Vec<TextureHandle>,
    depth: Option<DepthAttachment>,
    state: TargetState,
    released: bool,
}

impl FrameBufferTarget {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        kind: FrameBufferKind,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::new(ErrorKind::FramebufferIncomplete {
                label: format!("{} ({}x{})", kind.label(), width, height),
                status: FramebufferStatus::IncompleteDimensions,
            }));
        }

        let mut color = Vec::new();
        let mut depth = None;
        let mut created = Vec::new();

        for spec in kind.attachments() {
            let usage = if spec.sampled {
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING
            } else {
                TextureUsage::RENDER_ATTACHMENT
            };
            let texture = match backend.create_texture(&TextureDescriptor {
                label: Some(format!("{} {}", kind.label(), spec.name)),
                width,
                height,
                dimension: TextureDimension::D2,
                format: spec.format,
                usage,
                address_mode: AddressMode::ClampToEdge,
            }) {
                Ok(texture) => texture,
                Err(err) => {
                    destroy_textures(backend, &created);
                    return Err(err.into());
                }
            };
            created.push(texture);

            if spec.format.is_depth() {
                depth = Some(if spec.sampled {
                    DepthAttachment::Texture(texture)
                } else {
                    DepthAttachment::Renderbuffer(texture)
                });
            } else {
                color.push(texture);
            }
        }

        let framebuffer = match backend.create_framebuffer(&FramebufferDescriptor {
            label: Some(kind.label().to_string()),
            color_attachments: color.clone(),
            depth_attachment: depth.map(|d| d.handle()),
        }) {
            Ok(fb) => fb,
            Err(err) => {
                destroy_textures(backend, &created);
                return Err(err.into());
            }
        };

        let status = backend.framebuffer_status(framebuffer);
        if status != FramebufferStatus::Complete {
            backend.destroy_framebuffer(framebuffer);
            destroy_textures(backend, &created);
            return Err(EngineError::new(ErrorKind::FramebufferIncomplete {
                label: kind.label().to_string(),
                status,
            }));
        }

        log::debug!(
            "Created {} framebuffer {}x{} ({} color attachments)",
            kind.label(),
            width,
            height,
            color.len()
        );

        Ok(Self {
            kind,
            width,
            height,
            framebuffer,
            color,
            depth,
            state: TargetState::Unbound,
            released: false,
        })
    }

    pub fn depth_only(backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<Self> {
        Self::new(backend, FrameBufferKind::DepthOnly, width, height)
    }

    pub fn gbuffer(backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<Self> {
        Self::new(backend, FrameBufferKind::GBuffer, width, height)
    }

    pub fn water_reflection(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        Self::new(backend, FrameBufferKind::WaterReflection, width, height)
    }

    pub fn water_refraction(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        Self::new(backend, FrameBufferKind::WaterRefraction, width, height)
    }

    pub fn kind(&self) -> FrameBufferKind {
        self.kind
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.width, self.height)
    }

    pub fn handle(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Color attachment by draw-buffer index
    pub fn color_texture(&self, index: usize) -> Option<TextureHandle> {
        self.color.get(index).copied()
    }

    pub fn color_textures(&self) -> &[TextureHandle] {
        &self.color
    }

    /// Depth attachment if it can be sampled
    pub fn depth_texture(&self) -> Option<TextureHandle> {
        match self.depth {
            Some(DepthAttachment::Texture(texture)) => Some(texture),
            _ => None,
        }
    }

    pub fn depth_attachment(&self) -> Option<DepthAttachment> {
        self.depth
    }

    /// Redirect rendering into this target at its own resolution
    pub fn bind_as_render_target(&mut self, backend: &mut dyn GraphicsBackend) {
        debug_assert_eq!(
            self.state,
            TargetState::Unbound,
            "{} bound twice; nested targets are not supported",
            self.kind.label()
        );
        backend.set_viewport(self.viewport());
        backend.bind_framebuffer(Some(self.framebuffer));
        self.state = TargetState::Bound;
    }

    /// Return to the default target and restore the application's viewport
    pub fn unbind_render_target(&mut self, backend: &mut dyn GraphicsBackend, app_viewport: Viewport) {
        debug_assert_eq!(self.state, TargetState::Bound);
        backend.bind_framebuffer(None);
        backend.set_viewport(app_viewport);
        self.state = TargetState::Unbound;
    }

    /// Free the framebuffer and every attachment. Further calls do nothing.
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.released {
            return;
        }
        backend.destroy_framebuffer(self.framebuffer);
        destroy_textures(backend, &self.color);
        if let Some(depth) = self.depth {
            backend.destroy_texture(depth.handle());
        }
        self.released = true;
    }
}

impl Drop for FrameBufferTarget {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("{} framebuffer dropped without release", self.kind.label());
        }
    }
}

fn destroy_textures(backend: &mut dyn GraphicsBackend, textures: &[TextureHandle]) {
    for texture in textures {
        backend.destroy_texture(*texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::depth_only(FrameBufferKind::DepthOnly, 0, true)]
    #[case::gbuffer(FrameBufferKind::GBuffer, 3, false)]
    #[case::reflection(FrameBufferKind::WaterReflection, 1, false)]
    #[case::refraction(FrameBufferKind::WaterRefraction, 1, true)]
    fn test_every_kind_is_complete(
        #[case] kind: FrameBufferKind,
        #[case] colors: usize,
        #[case] sampled_depth: bool,
    ) {
        let mut backend = HeadlessBackend::default();
        let mut target = FrameBufferTarget::new(&mut backend, kind, 320, 180).unwrap();

        assert_eq!(
            backend.framebuffer_status(target.handle()),
            FramebufferStatus::Complete
        );
        assert_eq!(target.color_textures().len(), colors);
        assert_eq!(target.depth_texture().is_some(), sampled_depth);
        for texture in target.color_textures() {
            let desc = backend.texture_descriptor(*texture).unwrap();
            assert_eq!((desc.width, desc.height), (320, 180));
        }
        target.release(&mut backend);
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::zero_width(0, 64)]
    #[case::zero_height(64, 0)]
    fn test_degenerate_size_is_rejected(#[case] width: u32, #[case] height: u32) {
        let mut backend = HeadlessBackend::default();
        let err = FrameBufferTarget::gbuffer(&mut backend, width, height).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::FramebufferIncomplete {
                status: FramebufferStatus::IncompleteDimensions,
                ..
            }
        ));
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_framebuffers(), 0);
    }

    #[test]
    fn test_gbuffer_attachment_order() {
        let mut backend = HeadlessBackend::default();
        let mut target = FrameBufferTarget::gbuffer(&mut backend, 64, 64).unwrap();
        let formats: Vec<_> = target
            .color_textures()
            .iter()
            .map(|t| backend.texture_descriptor(*t).unwrap().format)
            .collect();
        assert_eq!(
            formats,
            vec![
                TextureFormat::Rgba16Float,
                TextureFormat::Rgba16Float,
                TextureFormat::Rgba8Unorm
            ]
        );
        assert!(matches!(
            target.depth_attachment(),
            Some(DepthAttachment::Renderbuffer(_))
        ));
        target.release(&mut backend);
    }

    #[test]
    fn test_unbind_restores_application_viewport() {
        let mut backend = HeadlessBackend::with_surface_size(800, 600);
        let mut target = FrameBufferTarget::water_reflection(&mut backend, 400, 300).unwrap();

        target.bind_as_render_target(&mut backend);
        assert_eq!(backend.viewport(), Viewport::new(400, 300));
        assert_eq!(backend.bound_framebuffer(), Some(target.handle()));
        assert_eq!(target.state(), TargetState::Bound);

        // The application's viewport, not whatever was set before binding
        target.unbind_render_target(&mut backend, Viewport::new(1024, 768));
        assert_eq!(backend.viewport(), Viewport::new(1024, 768));
        assert_eq!(backend.bound_framebuffer(), None);
        assert_eq!(target.state(), TargetState::Unbound);
        target.release(&mut backend);
    }

    #[test]
    fn test_release_frees_everything_once() {
        let mut backend = HeadlessBackend::default();
        let mut target = FrameBufferTarget::water_refraction(&mut backend, 32, 32).unwrap();
        assert_eq!(backend.live_textures(), 2);
        target.release(&mut backend);
        target.release(&mut backend);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_framebuffers(), 0);
    }
}
