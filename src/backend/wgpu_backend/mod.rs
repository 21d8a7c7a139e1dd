//! wgpu backend implementation
//!
//! The render systems drive this backend like a GL context: bind a target,
//! switch state, write uniforms and draw. Calls between `begin_frame` and
//! `end_frame` are recorded into passes and encoded in one command buffer
//! when the frame ends. A pass starts whenever the target changes or a
//! clear follows draws on the current one.

mod convert;

use crate::backend::shader::{
    ShaderReflection, TextureSampleKind, TextureSlot, UniformSlot, SAMPLER_BINDING,
    TEXTURE_GROUP, UNIFORM_GROUP,
};
use crate::backend::traits::*;
use crate::backend::types::*;
use convert::*;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Format of the depth buffer that backs the window's default target
const SURFACE_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDescriptor,
}

struct ProgramEntry {
    label: String,
    module: wgpu::ShaderModule,
    reflection: ShaderReflection,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// CPU copy of the uniform block, snapshotted into the frame arena per draw
    uniforms: Vec<u8>,
}

/// Everything that makes two draws need different pipeline objects
#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u64,
    state: RenderState,
    topology: PrimitiveTopology,
    vertex_layouts: Vec<VertexBufferLayout>,
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct TextureGroupKey {
    program: u64,
    textures: Vec<u64>,
    address_mode: AddressMode,
}

enum DrawKind {
    Direct,
    Indexed { buffer: u64, format: IndexFormat },
}

struct RecordedDraw {
    program: u64,
    pipeline: usize,
    texture_group: usize,
    uniform_offset: u32,
    vertex_buffers: Vec<(u32, u64)>,
    kind: DrawKind,
    elements: Range<u32>,
    instances: Range<u32>,
    viewport: Viewport,
}

struct RecordedPass {
    target: Option<FramebufferHandle>,
    clear: ClearRequest,
    draws: Vec<RecordedDraw>,
}

impl RecordedPass {
    fn load(target: Option<FramebufferHandle>) -> Self {
        Self {
            target,
            clear: ClearRequest {
                color: None,
                depth: None,
            },
            draws: Vec::new(),
        }
    }
}

enum Destroyed {
    Buffer(u64),
    Texture(u64),
    Framebuffer(u64),
    Program(u64),
}

/// Placeholder textures bound to slots a draw left empty
struct FallbackTextures {
    white: TextureEntry,
    white_cube: TextureEntry,
    depth: TextureEntry,
}

/// wgpu implementation of [`GraphicsBackend`]
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    surface_depth: TextureEntry,
    current_texture: Option<wgpu::SurfaceTexture>,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, TextureEntry>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    programs: HashMap<u64, ProgramEntry>,
    samplers: HashMap<AddressMode, wgpu::Sampler>,
    fallback: FallbackTextures,
    next_id: u64,

    // Caches
    pipelines: Vec<wgpu::RenderPipeline>,
    pipeline_index: HashMap<PipelineKey, usize>,
    texture_groups: Vec<wgpu::BindGroup>,
    texture_group_index: HashMap<TextureGroupKey, usize>,

    // GL-style current state
    framebuffer: Option<FramebufferHandle>,
    viewport: Viewport,
    state: RenderState,
    program: Option<ProgramHandle>,
    bound_textures: HashMap<u32, TextureHandle>,
    vertex_buffers: Vec<Option<(BufferHandle, VertexBufferLayout)>>,
    index_buffer: Option<(BufferHandle, IndexFormat)>,

    // Frame recording
    in_frame: bool,
    passes: Vec<RecordedPass>,
    uniform_arena: Vec<u8>,
    uniform_alignment: u32,
    graveyard: Vec<Destroyed>,
}

impl WgpuBackend {
    /// Async initialization, wrapped by `new`
    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let (instance, surface, adapter, device, queue) = Self::init_native(window.clone()).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb() && convert_texture_format_back(*f).is_some())
            .or_else(|| {
                surface_caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| convert_texture_format_back(*f).is_some())
            })
            .ok_or_else(|| {
                BackendError::SurfaceCreationFailed("no supported surface format".into())
            })?;

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let (width, height) = clamp_surface_size(&device, size.width, size.height);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let surface_depth = Self::make_texture(
            &device,
            &TextureDescriptor {
                label: Some("surface depth".into()),
                width,
                height,
                format: SURFACE_DEPTH_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT,
                ..Default::default()
            },
        );

        let fallback = Self::make_fallback_textures(&device, &queue);
        let samplers = [AddressMode::Repeat, AddressMode::ClampToEdge]
            .into_iter()
            .map(|mode| (mode, Self::make_sampler(&device, mode)))
            .collect();
        let uniform_alignment = device.limits().min_uniform_buffer_offset_alignment;

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            surface_depth,
            current_texture: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            samplers,
            fallback,
            next_id: 1,
            pipelines: Vec::new(),
            pipeline_index: HashMap::new(),
            texture_groups: Vec::new(),
            texture_group_index: HashMap::new(),
            framebuffer: None,
            viewport: Viewport::new(width, height),
            state: RenderState::ENGINE_DEFAULT,
            program: None,
            bound_textures: HashMap::new(),
            vertex_buffers: Vec::new(),
            index_buffer: None,
            in_frame: false,
            passes: Vec::new(),
            uniform_arena: Vec::new(),
            uniform_alignment,
            graveyard: Vec::new(),
        })
    }

    async fn init_native(
        window: Arc<winit::window::Window>,
    ) -> BackendResult<(
        wgpu::Instance,
        wgpu::Surface<'static>,
        wgpu::Adapter,
        wgpu::Device,
        wgpu::Queue,
    )> {
        // On Windows, try Vulkan first to avoid D3D12 debug layer validation errors
        let backends = if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::Backends::all()
        } else {
            #[cfg(target_os = "windows")]
            {
                wgpu::Backends::VULKAN
            }
            #[cfg(not(target_os = "windows"))]
            {
                wgpu::Backends::all()
            }
        };

        let (instance, surface, adapter) = match Self::request_adapter(&window, backends).await? {
            (instance, surface, Some(adapter)) => (instance, surface, adapter),
            _ if backends != wgpu::Backends::all() => {
                log::warn!("Preferred backend not available, falling back to all backends");
                match Self::request_adapter(&window, wgpu::Backends::all()).await? {
                    (instance, surface, Some(adapter)) => (instance, surface, adapter),
                    _ => {
                        return Err(BackendError::InitializationFailed(
                            "No suitable adapter found".into(),
                        ))
                    }
                }
            }
            _ => {
                return Err(BackendError::InitializationFailed(
                    "No suitable adapter found".into(),
                ))
            }
        };

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        Ok((instance, surface, adapter, device, queue))
    }

    async fn request_adapter(
        window: &Arc<winit::window::Window>,
        backends: wgpu::Backends,
    ) -> BackendResult<(wgpu::Instance, wgpu::Surface<'static>, Option<wgpu::Adapter>)> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await;
        Ok((instance, surface, adapter))
    }

    fn make_texture(device: &wgpu::Device, desc: &TextureDescriptor) -> TextureEntry {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.dimension.layers(),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: convert_texture_format(desc.format),
            usage: convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(convert_view_dimension(desc.dimension)),
            ..Default::default()
        });
        TextureEntry {
            texture,
            view,
            desc: desc.clone(),
        }
    }

    fn make_fallback_textures(device: &wgpu::Device, queue: &wgpu::Queue) -> FallbackTextures {
        let white_desc = TextureDescriptor {
            label: Some("fallback white".into()),
            ..Default::default()
        };
        let white = Self::make_texture(device, &white_desc);
        let white_cube = Self::make_texture(
            device,
            &TextureDescriptor {
                label: Some("fallback white cube".into()),
                dimension: TextureDimension::Cube,
                ..white_desc
            },
        );
        for (entry, layers) in [(&white, 1), (&white_cube, 6)] {
            for layer in 0..layers {
                write_texture_layer(queue, &entry.texture, layer, &[255; 4], 1, 1, 4);
            }
        }
        let depth = Self::make_texture(
            device,
            &TextureDescriptor {
                label: Some("fallback depth".into()),
                format: TextureFormat::Depth32Float,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
                ..Default::default()
            },
        );
        FallbackTextures {
            white,
            white_cube,
            depth,
        }
    }

    fn make_sampler(device: &wgpu::Device, mode: AddressMode) -> wgpu::Sampler {
        let address_mode = convert_address_mode(mode);
        device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("texture sampler"),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Color and depth formats of the bound target
    fn target_formats(&self) -> (Vec<TextureFormat>, Option<TextureFormat>) {
        let Some(framebuffer) = self.framebuffer else {
            return (
                vec![self.swapchain_format()],
                Some(SURFACE_DEPTH_FORMAT),
            );
        };
        let Some(desc) = self.framebuffers.get(&framebuffer.0) else {
            return (Vec::new(), None);
        };
        let format_of = |t: &TextureHandle| self.textures.get(&t.0).map(|e| e.desc.format);
        (
            desc.color_attachments.iter().filter_map(format_of).collect(),
            desc.depth_attachment.as_ref().and_then(format_of),
        )
    }

    fn target_size(&self, target: Option<FramebufferHandle>) -> (u32, u32) {
        let Some(framebuffer) = target else {
            return self.surface_size();
        };
        self.framebuffers
            .get(&framebuffer.0)
            .and_then(|desc| {
                desc.color_attachments
                    .first()
                    .or(desc.depth_attachment.as_ref())
            })
            .and_then(|t| self.textures.get(&t.0))
            .map(|e| (e.desc.width, e.desc.height))
            .unwrap_or((1, 1))
    }

    fn pipeline_for(&mut self, key: PipelineKey) -> Option<usize> {
        if let Some(&index) = self.pipeline_index.get(&key) {
            return Some(index);
        }
        let program = self.programs.get(&key.program)?;

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = key
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: convert_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = key
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: convert_step_mode(layout.step_mode),
                attributes,
            })
            .collect();

        let blend = key.state.blend.map(convert_blend_state);
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: convert_texture_format(*format),
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format: convert_texture_format(format),
            depth_write_enabled: key.state.depth_test && key.state.depth_write,
            depth_compare: if key.state.depth_test {
                convert_compare_function(key.state.depth_compare)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&program.label),
                layout: Some(&program.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &buffers,
                },
                primitive: wgpu::PrimitiveState {
                    topology: convert_topology(key.topology),
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: convert_cull_mode(key.state.cull_mode),
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                }),
                multiview: None,
            });

        log::debug!(
            "Created pipeline for program {} ({} cached)",
            program.label,
            self.pipelines.len() + 1
        );
        let index = self.pipelines.len();
        self.pipelines.push(pipeline);
        self.pipeline_index.insert(key, index);
        Some(index)
    }

    fn fallback_for(&self, slot: &TextureSlot) -> &TextureEntry {
        match (slot.sample_kind, slot.dimension) {
            (TextureSampleKind::Depth, _) => &self.fallback.depth,
            (TextureSampleKind::Float, TextureDimension::Cube) => &self.fallback.white_cube,
            (TextureSampleKind::Float, TextureDimension::D2) => &self.fallback.white,
        }
    }

    /// Bind group of sampler plus the textures currently bound for `program`
    fn texture_group_for(&mut self, program: u64) -> Option<usize> {
        let entry = self.programs.get(&program)?;
        let slots = entry.reflection.textures();
        let textures: Vec<u64> = slots
            .iter()
            .map(|slot| {
                self.bound_textures
                    .get(&slot.binding)
                    .filter(|t| self.textures.contains_key(&t.0))
                    .map_or(0, |t| t.0)
            })
            .collect();
        let address_mode = textures
            .iter()
            .find_map(|id| self.textures.get(id))
            .map_or(AddressMode::Repeat, |e| e.desc.address_mode);

        let key = TextureGroupKey {
            program,
            textures,
            address_mode,
        };
        if let Some(&index) = self.texture_group_index.get(&key) {
            return Some(index);
        }

        let sampler = self.samplers.get(&address_mode)?;
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: SAMPLER_BINDING,
            resource: wgpu::BindingResource::Sampler(sampler),
        }];
        for (slot, id) in slots.iter().zip(&key.textures) {
            let view = match self.textures.get(id) {
                Some(texture) => &texture.view,
                None => &self.fallback_for(slot).view,
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&entry.label),
            layout: &entry.texture_layout,
            entries: &entries,
        });
        let index = self.texture_groups.len();
        self.texture_groups.push(group);
        self.texture_group_index.insert(key, index);
        Some(index)
    }

    /// Copy the program's uniform block into the frame arena
    fn snapshot_uniforms(&mut self, program: u64) -> Option<u32> {
        let entry = self.programs.get(&program)?;
        let align = self.uniform_alignment.max(1) as usize;
        let offset = self.uniform_arena.len().div_ceil(align) * align;
        self.uniform_arena.resize(offset, 0);
        self.uniform_arena.extend_from_slice(&entry.uniforms);
        Some(offset as u32)
    }

    fn current_pass(&mut self) -> &mut RecordedPass {
        let target = self.framebuffer;
        if self.passes.last().map_or(true, |pass| pass.target != target) {
            self.passes.push(RecordedPass::load(target));
        }
        let last = self.passes.len() - 1;
        &mut self.passes[last]
    }

    fn record_draw(
        &mut self,
        topology: PrimitiveTopology,
        indexed: bool,
        elements: Range<u32>,
        instances: Range<u32>,
    ) {
        if !self.in_frame {
            log::warn!("Draw issued outside of a frame, ignored");
            return;
        }
        let Some(program) = self.program.map(|p| p.0) else {
            log::warn!("Draw issued without a program, ignored");
            return;
        };

        let bound: Vec<(u32, u64, VertexBufferLayout)> = self
            .vertex_buffers
            .iter()
            .enumerate()
            .filter_map(|(slot, bound)| {
                bound
                    .as_ref()
                    .map(|(buffer, layout)| (slot as u32, buffer.0, layout.clone()))
            })
            .collect();
        let kind = if indexed {
            match self.index_buffer {
                Some((buffer, format)) => DrawKind::Indexed {
                    buffer: buffer.0,
                    format,
                },
                None => {
                    log::warn!("Indexed draw without an index buffer, ignored");
                    return;
                }
            }
        } else {
            DrawKind::Direct
        };

        let (color_formats, depth_format) = self.target_formats();
        let key = PipelineKey {
            program,
            state: self.state,
            topology,
            vertex_layouts: bound.iter().map(|(_, _, layout)| layout.clone()).collect(),
            color_formats,
            depth_format,
        };
        let Some(pipeline) = self.pipeline_for(key) else {
            return;
        };
        let Some(texture_group) = self.texture_group_for(program) else {
            return;
        };
        let Some(uniform_offset) = self.snapshot_uniforms(program) else {
            return;
        };

        let draw = RecordedDraw {
            program,
            pipeline,
            texture_group,
            uniform_offset,
            vertex_buffers: bound.iter().map(|(slot, id, _)| (*slot, *id)).collect(),
            kind,
            elements,
            instances,
            viewport: self.viewport,
        };
        self.current_pass().draws.push(draw);
    }

    fn encode_frame(&mut self, surface_view: Option<&wgpu::TextureView>) -> wgpu::CommandBuffer {
        let passes = std::mem::take(&mut self.passes);
        let arena = std::mem::take(&mut self.uniform_arena);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        let arena_buffer = (!arena.is_empty()).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("frame uniforms"),
                    contents: &arena,
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });

        let mut uniform_groups: HashMap<u64, wgpu::BindGroup> = HashMap::new();
        if let Some(arena_buffer) = &arena_buffer {
            for draw in passes.iter().flat_map(|pass| &pass.draws) {
                if uniform_groups.contains_key(&draw.program) {
                    continue;
                }
                let Some(program) = self.programs.get(&draw.program) else {
                    continue;
                };
                let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&program.label),
                    layout: &program.uniform_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: arena_buffer,
                            offset: 0,
                            size: NonZeroU64::new(u64::from(uniform_block_size(
                                &program.reflection,
                            ))),
                        }),
                    }],
                });
                uniform_groups.insert(draw.program, group);
            }
        }

        for pass in &passes {
            if pass.draws.is_empty() && pass.clear.color.is_none() && pass.clear.depth.is_none() {
                continue;
            }
            let (color_views, depth_view) = match pass.target {
                None => match surface_view {
                    Some(view) => (vec![view], Some(&self.surface_depth.view)),
                    None => continue,
                },
                Some(framebuffer) => {
                    let Some(desc) = self.framebuffers.get(&framebuffer.0) else {
                        continue;
                    };
                    let view_of = |t: &TextureHandle| self.textures.get(&t.0).map(|e| &e.view);
                    (
                        desc.color_attachments.iter().filter_map(view_of).collect(),
                        desc.depth_attachment.as_ref().and_then(view_of),
                    )
                }
            };

            let color_load = match pass.clear.color {
                Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(r),
                    g: f64::from(g),
                    b: f64::from(b),
                    a: f64::from(a),
                }),
                None => wgpu::LoadOp::Load,
            };
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: color_load,
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();
            let depth_stencil_attachment =
                depth_view.map(|view| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: pass
                            .clear
                            .depth
                            .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                });

            let (target_width, target_height) = self.target_size(pass.target);
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(if pass.target.is_some() {
                    "offscreen pass"
                } else {
                    "surface pass"
                }),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &pass.draws {
                let Some(uniforms) = uniform_groups.get(&draw.program) else {
                    continue;
                };
                render_pass.set_pipeline(&self.pipelines[draw.pipeline]);
                render_pass.set_bind_group(UNIFORM_GROUP, uniforms, &[draw.uniform_offset]);
                render_pass.set_bind_group(
                    TEXTURE_GROUP,
                    &self.texture_groups[draw.texture_group],
                    &[],
                );
                for (slot, buffer) in &draw.vertex_buffers {
                    if let Some(buffer) = self.buffers.get(buffer) {
                        render_pass.set_vertex_buffer(*slot, buffer.slice(..));
                    }
                }

                let vp = clamp_viewport(draw.viewport, target_width, target_height);
                render_pass.set_viewport(
                    vp.x as f32,
                    vp.y as f32,
                    vp.width as f32,
                    vp.height as f32,
                    0.0,
                    1.0,
                );

                match &draw.kind {
                    DrawKind::Direct => {
                        render_pass.draw(draw.elements.clone(), draw.instances.clone())
                    }
                    DrawKind::Indexed { buffer, format } => {
                        if let Some(buffer) = self.buffers.get(buffer) {
                            render_pass
                                .set_index_buffer(buffer.slice(..), convert_index_format(*format));
                            render_pass.draw_indexed(
                                draw.elements.clone(),
                                0,
                                draw.instances.clone(),
                            );
                        }
                    }
                }
            }
        }

        encoder.finish()
    }

    /// Free everything destroyed during the frame that was just submitted
    fn collect_garbage(&mut self) {
        let mut textures_changed = false;
        for dead in std::mem::take(&mut self.graveyard) {
            match dead {
                Destroyed::Buffer(id) => {
                    if let Some(buffer) = self.buffers.remove(&id) {
                        buffer.destroy();
                    }
                }
                Destroyed::Texture(id) => {
                    if let Some(entry) = self.textures.remove(&id) {
                        entry.texture.destroy();
                        textures_changed = true;
                    }
                }
                Destroyed::Framebuffer(id) => {
                    self.framebuffers.remove(&id);
                }
                Destroyed::Program(id) => {
                    if self.programs.remove(&id).is_some() {
                        self.pipeline_index.retain(|key, _| key.program != id);
                        textures_changed = true;
                    }
                }
            }
        }
        if textures_changed {
            // Group indices are baked into recorded draws, so only reset between frames
            self.texture_groups.clear();
            self.texture_group_index.clear();
        }
    }

    fn configure_surface(&mut self) {
        self.surface.configure(&self.device, &self.surface_config);
        self.surface_depth.texture.destroy();
        self.surface_depth = Self::make_texture(
            &self.device,
            &TextureDescriptor {
                width: self.surface_config.width,
                height: self.surface_config.height,
                ..self.surface_depth.desc.clone()
            },
        );
    }

    /// Get the wgpu device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get the wgpu queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Number of distinct pipeline objects created so far
    pub fn cached_pipelines(&self) -> usize {
        self.pipeline_index.len()
    }
}

impl GraphicsBackend for WgpuBackend {
    fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let (width, height) = clamp_surface_size(&self.device, width, height);
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.configure_surface();
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::debug!("Surface outdated, reconfiguring");
                self.configure_surface();
                self.surface
                    .get_current_texture()
                    .map_err(|e| match e {
                        wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
                        wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
                        _ => BackendError::AcquireImageFailed(e.to_string()),
                    })?
            }
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(BackendError::OutOfMemory),
            Err(e) => return Err(BackendError::AcquireImageFailed(e.to_string())),
        };

        self.current_texture = Some(output);
        self.in_frame = true;
        self.passes.clear();
        self.uniform_arena.clear();
        self.framebuffer = None;
        self.viewport = Viewport::new(self.surface_config.width, self.surface_config.height);
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.in_frame {
            return Ok(());
        }
        self.in_frame = false;

        let output = self.current_texture.take();
        let surface_view = output
            .as_ref()
            .map(|o| o.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let commands = self.encode_frame(surface_view.as_ref());
        self.queue.submit(std::iter::once(commands));

        if let Some(output) = output {
            output.present();
        }
        self.collect_garbage();
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        convert_texture_format_back(self.surface_config.format).unwrap_or(TextureFormat::Bgra8UnormSrgb)
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        if desc.size == 0 && data.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!(
                "{} is empty",
                desc.label.as_deref().unwrap_or("buffer")
            )));
        }
        let mut contents = data.to_vec();
        if (contents.len() as u64) < desc.size {
            contents.resize(desc.size as usize, 0);
        }
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: desc.label.as_deref(),
                contents: &contents,
                usage: convert_buffer_usage(desc.usage),
            });

        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(buf) = self.buffers.get(&buffer.0) else {
            return;
        };
        // Copies must be a multiple of four bytes
        if data.len() % 4 == 0 {
            self.queue.write_buffer(buf, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.queue.write_buffer(buf, offset, &padded);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(BackendError::TextureCreationFailed(format!(
                "{} has unsupported size {}x{}",
                desc.label.as_deref().unwrap_or("texture"),
                desc.width,
                desc.height
            )));
        }
        let entry = Self::make_texture(&self.device, desc);
        let id = self.allocate_id();
        self.textures.insert(id, entry);
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
        if let Some(entry) = self.textures.get(&texture.0) {
            write_texture_layer(
                &self.queue,
                &entry.texture,
                layer,
                data,
                width,
                height,
                entry.desc.format.bytes_per_pixel(),
            );
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn framebuffer_status(&self, framebuffer: FramebufferHandle) -> FramebufferStatus {
        let Some(desc) = self.framebuffers.get(&framebuffer.0) else {
            return FramebufferStatus::MissingAttachment;
        };
        if desc.color_attachments.is_empty() && desc.depth_attachment.is_none() {
            return FramebufferStatus::MissingAttachment;
        }

        let attachments = desc
            .color_attachments
            .iter()
            .map(|t| (t, false))
            .chain(desc.depth_attachment.iter().map(|t| (t, true)));
        let mut size = None;
        for (texture, is_depth_slot) in attachments {
            let Some(entry) = self.textures.get(&texture.0) else {
                return FramebufferStatus::IncompleteAttachment;
            };
            if !entry.desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
                return FramebufferStatus::IncompleteAttachment;
            }
            if entry.desc.format.is_depth() != is_depth_slot {
                return FramebufferStatus::UnsupportedFormat;
            }
            let dims = (entry.desc.width, entry.desc.height);
            if *size.get_or_insert(dims) != dims {
                return FramebufferStatus::IncompleteDimensions;
            }
        }
        FramebufferStatus::Complete
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(desc.source.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ProgramCreationFailed(format!(
                "{}: {error}",
                desc.label
            )));
        }

        let block_size = uniform_block_size(desc.reflection);
        let uniform_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: NonZeroU64::new(u64::from(block_size)),
                    },
                    count: None,
                }],
            });

        let mut texture_entries = vec![wgpu::BindGroupLayoutEntry {
            binding: SAMPLER_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        }];
        texture_entries.extend(desc.reflection.textures().iter().map(|slot| {
            wgpu::BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: match slot.sample_kind {
                        TextureSampleKind::Float => {
                            wgpu::TextureSampleType::Float { filterable: true }
                        }
                        TextureSampleKind::Depth => wgpu::TextureSampleType::Depth,
                    },
                    view_dimension: convert_view_dimension(slot.dimension),
                    multisampled: false,
                },
                count: None,
            }
        }));
        let texture_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &texture_entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&uniform_layout, &texture_layout],
                push_constant_ranges: &[],
            });

        let id = self.allocate_id();
        log::debug!("Created program {} ({} byte uniform block)", desc.label, block_size);
        self.programs.insert(
            id,
            ProgramEntry {
                label: desc.label.to_string(),
                module,
                reflection: desc.reflection.clone(),
                uniform_layout,
                texture_layout,
                pipeline_layout,
                uniforms: vec![0; block_size as usize],
            },
        );
        Ok(ProgramHandle(id))
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.framebuffer = framebuffer;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_render_state(&mut self, state: RenderState) {
        self.state = state;
    }

    fn render_state(&self) -> RenderState {
        self.state
    }

    fn clear(&mut self, request: ClearRequest) {
        if !self.in_frame {
            return;
        }
        let target = self.framebuffer;
        let pass = self.current_pass();
        if !pass.draws.is_empty() {
            self.passes.push(RecordedPass::load(target));
        }
        let last = self.passes.len() - 1;
        let pass = &mut self.passes[last];
        if request.color.is_some() {
            pass.clear.color = request.color;
        }
        if request.depth.is_some() {
            pass.clear.depth = request.depth;
        }
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.program = Some(program);
        self.bound_textures.clear();
        self.vertex_buffers.clear();
        self.index_buffer = None;
    }

    fn set_uniform(&mut self, program: ProgramHandle, slot: &UniformSlot, value: &UniformValue) {
        let Some(entry) = self.programs.get_mut(&program.0) else {
            return;
        };
        let bytes = value.to_bytes();
        let start = slot.offset as usize;
        let len = bytes.len().min(slot.size as usize);
        if let Some(dst) = entry.uniforms.get_mut(start..start + len) {
            dst.copy_from_slice(&bytes[..len]);
        }
    }

    fn bind_texture(&mut self, binding: u32, texture: TextureHandle) {
        self.bound_textures.insert(binding, texture);
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, layout: &VertexBufferLayout) {
        let slot = slot as usize;
        if self.vertex_buffers.len() <= slot {
            self.vertex_buffers.resize(slot + 1, None);
        }
        self.vertex_buffers[slot] = Some((buffer, layout.clone()));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat) {
        self.index_buffer = Some((buffer, format));
    }

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
        self.graveyard.push(Destroyed::Buffer(buffer.0));
        if !self.in_frame {
            self.collect_garbage();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.graveyard.push(Destroyed::Texture(texture.0));
        if !self.in_frame {
            self.collect_garbage();
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.graveyard.push(Destroyed::Framebuffer(framebuffer.0));
        if !self.in_frame {
            self.collect_garbage();
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if self.program == Some(program) {
            self.program = None;
        }
        self.graveyard.push(Destroyed::Program(program.0));
        if !self.in_frame {
            self.collect_garbage();
        }
    }
}

/// Uniform block size, padded so an empty block still binds
fn uniform_block_size(reflection: &ShaderReflection) -> u32 {
    reflection.uniform_block_size().max(16)
}

/// Clamp to device limits while maintaining aspect ratio
fn clamp_surface_size(device: &wgpu::Device, width: u32, height: u32) -> (u32, u32) {
    let max_size = device.limits().max_texture_dimension_2d;
    if width > max_size || height > max_size {
        let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
        (
            ((width as f32 * scale) as u32).max(1),
            ((height as f32 * scale) as u32).max(1),
        )
    } else {
        (width.max(1), height.max(1))
    }
}

/// Keep a viewport inside its target; wgpu rejects viewports that spill over
fn clamp_viewport(viewport: Viewport, width: u32, height: u32) -> Viewport {
    let x = viewport.x.min(width.saturating_sub(1));
    let y = viewport.y.min(height.saturating_sub(1));
    Viewport {
        x,
        y,
        width: viewport.width.clamp(1, width - x),
        height: viewport.height.clamp(1, height - y),
    }
}

fn write_texture_layer(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    layer: u32,
    data: &[u8],
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
) {
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d {
                x: 0,
                y: 0,
                z: layer,
            },
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * bytes_per_pixel),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::inside(Viewport::new(64, 32), (64, 32), Viewport::new(64, 32))]
    #[case::oversized(Viewport::new(128, 128), (64, 32), Viewport::new(64, 32))]
    #[case::offset(
        Viewport { x: 60, y: 0, width: 10, height: 10 },
        (64, 32),
        Viewport { x: 60, y: 0, width: 4, height: 10 }
    )]
    fn test_viewport_is_clamped_to_target(
        #[case] viewport: Viewport,
        #[case] target: (u32, u32),
        #[case] expected: Viewport,
    ) {
        assert_eq!(clamp_viewport(viewport, target.0, target.1), expected);
    }

    #[test]
    fn test_empty_uniform_block_still_binds() {
        assert_eq!(uniform_block_size(&ShaderReflection::default()), 16);
    }
}
