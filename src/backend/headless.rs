//! Headless backend for tests and tooling.
//!
//! This backend performs no GPU work. It tracks the same global state a GL
//! context would (bound framebuffer, viewport, fixed-function state, current
//! program, bound textures, uniform values) and records every command so the
//! pipeline's behavior can be inspected after a frame.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use crate::backend::shader::{ShaderReflection, UniformSlot};
use crate::backend::traits::*;
use crate::backend::types::*;

/// One recorded backend command
#[derive(Debug, Clone)]
pub enum Command {
    BeginFrame,
    EndFrame,
    BindFramebuffer(Option<FramebufferHandle>),
    SetViewport(Viewport),
    SetRenderState(RenderState),
    Clear {
        framebuffer: Option<FramebufferHandle>,
        request: ClearRequest,
    },
    UseProgram(ProgramHandle),
    SetUniform {
        program: ProgramHandle,
        name: String,
        value: UniformValue,
    },
    BindTexture {
        binding: u32,
        texture: TextureHandle,
    },
    Draw(DrawCall),
}

/// Snapshot of the state a draw was issued with
#[derive(Debug, Clone)]
pub struct DrawCall {
    pub program: Option<ProgramHandle>,
    pub program_label: String,
    pub framebuffer: Option<FramebufferHandle>,
    pub viewport: Viewport,
    pub state: RenderState,
    pub topology: PrimitiveTopology,
    pub indexed: bool,
    pub elements: Range<u32>,
    pub instances: Range<u32>,
    pub textures: BTreeMap<u32, TextureHandle>,
    pub uniforms: BTreeMap<String, UniformValue>,
}

impl DrawCall {
    pub fn instance_count(&self) -> u32 {
        self.instances.end - self.instances.start
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    pub fn samples(&self, texture: TextureHandle) -> bool {
        self.textures.values().any(|t| *t == texture)
    }
}

#[derive(Debug)]
struct BufferRecord {
    data: Vec<u8>,
    alive: bool,
}

#[derive(Debug)]
struct TextureRecord {
    desc: TextureDescriptor,
    layers_written: u32,
    alive: bool,
}

#[derive(Debug)]
struct FramebufferRecord {
    desc: FramebufferDescriptor,
    alive: bool,
}

#[derive(Debug)]
struct ProgramRecord {
    label: String,
    reflection: ShaderReflection,
    uniforms: BTreeMap<String, UniformValue>,
    alive: bool,
}

/// Recording backend with no GPU behind it
#[derive(Debug)]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    next_id: u64,
    buffers: HashMap<u64, BufferRecord>,
    textures: HashMap<u64, TextureRecord>,
    framebuffers: HashMap<u64, FramebufferRecord>,
    programs: HashMap<u64, ProgramRecord>,
    bound_framebuffer: Option<FramebufferHandle>,
    viewport: Viewport,
    state: RenderState,
    program: Option<ProgramHandle>,
    bound_textures: BTreeMap<u32, TextureHandle>,
    commands: Vec<Command>,
    frames: u64,
}

impl HeadlessBackend {
    /// Create a headless backend with a virtual surface of the given size
    pub fn with_surface_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            bound_framebuffer: None,
            viewport: Viewport::new(width, height),
            state: RenderState::ENGINE_DEFAULT,
            program: None,
            bound_textures: BTreeMap::new(),
            commands: Vec::new(),
            frames: 0,
        }
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Headless Backend"
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Drain the command log
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn draw_calls(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|c| match c {
            Command::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    /// Draws issued with a program whose label is `label`
    pub fn draws_with_program<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a DrawCall> {
        self.draw_calls().filter(move |d| d.program_label == label)
    }

    pub fn bound_framebuffer(&self) -> Option<FramebufferHandle> {
        self.bound_framebuffer
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames
    }

    /// Last value written to `name` in `program`
    pub fn uniform_value(&self, program: ProgramHandle, name: &str) -> Option<&UniformValue> {
        self.programs.get(&program.0)?.uniforms.get(name)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures
            .get(&texture.0)
            .filter(|t| t.alive)
            .map(|t| &t.desc)
    }

    /// Number of layers uploaded to a texture so far
    pub fn texture_layers_written(&self, texture: TextureHandle) -> u32 {
        self.textures
            .get(&texture.0)
            .map(|t| t.layers_written)
            .unwrap_or(0)
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers
            .get(&buffer.0)
            .filter(|b| b.alive)
            .map(|b| b.data.as_slice())
    }

    pub fn framebuffer_attachments(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferDescriptor> {
        self.framebuffers
            .get(&framebuffer.0)
            .filter(|f| f.alive)
            .map(|f| &f.desc)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.values().filter(|b| b.alive).count()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.values().filter(|t| t.alive).count()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.values().filter(|f| f.alive).count()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.values().filter(|p| p.alive).count()
    }

    /// Total number of programs ever created
    pub fn programs_created(&self) -> usize {
        self.programs.len()
    }

    /// Total number of textures ever created
    pub fn textures_created(&self) -> usize {
        self.textures.len()
    }

    fn evaluate_status(&self, desc: &FramebufferDescriptor) -> FramebufferStatus {
        if desc.color_attachments.is_empty() && desc.depth_attachment.is_none() {
            return FramebufferStatus::MissingAttachment;
        }

        let mut size = None;
        let attachments = desc
            .color_attachments
            .iter()
            .map(|t| (t, false))
            .chain(desc.depth_attachment.iter().map(|t| (t, true)));

        for (texture, is_depth_slot) in attachments {
            let Some(record) = self.textures.get(&texture.0).filter(|t| t.alive) else {
                return FramebufferStatus::IncompleteAttachment;
            };
            let tex = &record.desc;
            if tex.width == 0
                || tex.height == 0
                || !tex.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            {
                return FramebufferStatus::IncompleteAttachment;
            }
            if tex.format.is_depth() != is_depth_slot {
                return FramebufferStatus::UnsupportedFormat;
            }
            match size {
                None => size = Some((tex.width, tex.height)),
                Some(s) if s != (tex.width, tex.height) => {
                    return FramebufferStatus::IncompleteDimensions
                }
                Some(_) => {}
            }
        }

        FramebufferStatus::Complete
    }

    fn record_draw(
        &mut self,
        topology: PrimitiveTopology,
        indexed: bool,
        elements: Range<u32>,
        instances: Range<u32>,
    ) {
        let (program_label, uniforms) = match self.program.and_then(|p| self.programs.get(&p.0)) {
            Some(record) => (record.label.clone(), record.uniforms.clone()),
            None => (String::new(), BTreeMap::new()),
        };
        log::trace!(
            "HeadlessBackend: draw {} ({:?}, {} instances)",
            program_label,
            elements,
            instances.end - instances.start
        );
        self.commands.push(Command::Draw(DrawCall {
            program: self.program,
            program_label,
            framebuffer: self.bound_framebuffer,
            viewport: self.viewport,
            state: self.state,
            topology,
            indexed,
            elements,
            instances,
            textures: self.bound_textures.clone(),
            uniforms,
        }));
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::with_surface_size(1280, 720)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn new(window: Arc<winit::window::Window>, _vsync: bool) -> BackendResult<Self> {
        let size = window.inner_size();
        Ok(Self::with_surface_size(size.width.max(1), size.height.max(1)))
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        self.commands.push(Command::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.frames += 1;
        self.commands.push(Command::EndFrame);
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let mut contents = data.to_vec();
        contents.resize(desc.size.max(data.len() as u64) as usize, 0);
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            BufferRecord {
                data: contents,
                alive: true,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(record) = self.buffers.get_mut(&buffer.0) {
            let start = offset as usize;
            let end = start + data.len();
            if record.data.len() < end {
                record.data.resize(end, 0);
            }
            record.data[start..end].copy_from_slice(data);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.textures.insert(
            id,
            TextureRecord {
                desc: desc.clone(),
                layers_written: 0,
                alive: true,
            },
        );
        Ok(TextureHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) {
        if let Some(record) = self.textures.get_mut(&texture.0) {
            debug_assert!(layer < record.desc.dimension.layers());
            debug_assert_eq!(
                data.len() as u32,
                width * height * record.desc.format.bytes_per_pixel()
            );
            record.layers_written += 1;
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        log::trace!("HeadlessBackend: creating framebuffer {:?}", desc.label);
        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            FramebufferRecord {
                desc: desc.clone(),
                alive: true,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn framebuffer_status(&self, framebuffer: FramebufferHandle) -> FramebufferStatus {
        match self.framebuffers.get(&framebuffer.0).filter(|f| f.alive) {
            Some(record) => self.evaluate_status(&record.desc),
            None => FramebufferStatus::MissingAttachment,
        }
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        log::trace!("HeadlessBackend: creating program {}", desc.label);
        let id = self.allocate_id();
        self.programs.insert(
            id,
            ProgramRecord {
                label: desc.label.to_string(),
                reflection: desc.reflection.clone(),
                uniforms: BTreeMap::new(),
                alive: true,
            },
        );
        Ok(ProgramHandle(id))
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.bound_framebuffer = framebuffer;
        self.commands.push(Command::BindFramebuffer(framebuffer));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.commands.push(Command::SetViewport(viewport));
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_render_state(&mut self, state: RenderState) {
        self.state = state;
        self.commands.push(Command::SetRenderState(state));
    }

    fn render_state(&self) -> RenderState {
        self.state
    }

    fn clear(&mut self, request: ClearRequest) {
        self.commands.push(Command::Clear {
            framebuffer: self.bound_framebuffer,
            request,
        });
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.program = Some(program);
        self.bound_textures.clear();
        self.commands.push(Command::UseProgram(program));
    }

    fn set_uniform(&mut self, program: ProgramHandle, slot: &UniformSlot, value: &UniformValue) {
        let Some(record) = self.programs.get_mut(&program.0) else {
            return;
        };
        debug_assert!(record.reflection.uniform(&slot.name).is_some());
        debug_assert!(value.to_bytes().len() <= slot.size as usize);
        record.uniforms.insert(slot.name.clone(), value.clone());
        self.commands.push(Command::SetUniform {
            program,
            name: slot.name.clone(),
            value: value.clone(),
        });
    }

    fn bind_texture(&mut self, binding: u32, texture: TextureHandle) {
        self.bound_textures.insert(binding, texture);
        self.commands.push(Command::BindTexture { binding, texture });
    }

    fn set_vertex_buffer(&mut self, _slot: u32, _buffer: BufferHandle, _layout: &VertexBufferLayout) {}

    fn set_index_buffer(&mut self, _buffer: BufferHandle, _format: IndexFormat) {}

    fn draw(&mut self, topology: PrimitiveTopology, vertices: Range<u32>, instances: Range<u32>) {
        self.record_draw(topology, false, vertices, instances);
    }

    fn draw_indexed(
        &mut self,
        topology: PrimitiveTopology,
        indices: Range<u32>,
        instances: Range<u32>,
    ) {
        self.record_draw(topology, true, indices, instances);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(record) = self.buffers.get_mut(&buffer.0) {
            debug_assert!(record.alive, "buffer released twice");
            record.alive = false;
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(record) = self.textures.get_mut(&texture.0) {
            debug_assert!(record.alive, "texture released twice");
            record.alive = false;
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(record) = self.framebuffers.get_mut(&framebuffer.0) {
            debug_assert!(record.alive, "framebuffer released twice");
            record.alive = false;
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if let Some(record) = self.programs.get_mut(&program.0) {
            debug_assert!(record.alive, "program released twice");
            record.alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(backend: &mut HeadlessBackend, w: u32, h: u32, format: TextureFormat) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor {
                width: w,
                height: h,
                format,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_complete_framebuffer() {
        let mut backend = HeadlessBackend::default();
        let color = attachment(&mut backend, 64, 64, TextureFormat::Rgba8Unorm);
        let depth = attachment(&mut backend, 64, 64, TextureFormat::Depth32Float);
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![color],
                depth_attachment: Some(depth),
            })
            .unwrap();
        assert_eq!(backend.framebuffer_status(fb), FramebufferStatus::Complete);
    }

    #[test]
    fn test_mismatched_attachment_sizes() {
        let mut backend = HeadlessBackend::default();
        let color = attachment(&mut backend, 64, 64, TextureFormat::Rgba8Unorm);
        let depth = attachment(&mut backend, 32, 32, TextureFormat::Depth32Float);
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![color],
                depth_attachment: Some(depth),
            })
            .unwrap();
        assert_eq!(
            backend.framebuffer_status(fb),
            FramebufferStatus::IncompleteDimensions
        );
    }

    #[test]
    fn test_depth_format_in_color_slot() {
        let mut backend = HeadlessBackend::default();
        let depth = attachment(&mut backend, 16, 16, TextureFormat::Depth32Float);
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![depth],
                depth_attachment: None,
            })
            .unwrap();
        assert_eq!(
            backend.framebuffer_status(fb),
            FramebufferStatus::UnsupportedFormat
        );
    }

    #[test]
    fn test_empty_framebuffer_is_incomplete() {
        let mut backend = HeadlessBackend::default();
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![],
                depth_attachment: None,
            })
            .unwrap();
        assert_eq!(
            backend.framebuffer_status(fb),
            FramebufferStatus::MissingAttachment
        );
    }

    #[test]
    fn test_draw_snapshots_state() {
        let mut backend = HeadlessBackend::default();
        backend.set_render_state(RenderState::ENGINE_DEFAULT.with_depth_test(false));
        backend.draw(PrimitiveTopology::TriangleStrip, 0..4, 0..3);
        let draw = backend.draw_calls().next().unwrap();
        assert!(!draw.state.depth_test);
        assert_eq!(draw.instance_count(), 3);
        assert!(draw.framebuffer.is_none());
    }
}
