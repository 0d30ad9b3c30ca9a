//! wgpu-backed render device.
//!
//! Device calls are recorded with the state bound at the time and replayed into
//! a single render pass on [`WgpuDevice::submit`]. Calls that modify or release
//! a resource a recorded draw still references submit the pending work first,
//! so every draw sees the contents it was recorded against.
//!
//! Custom shader stages must match the built-in interface: vertex inputs at
//! locations 0 (position), 1 (BGRA color) and 2 (uv); the viewport uniform at
//! group 0; the texture and sampler at group 1; vertex outputs color at
//! location 0 and uv at location 1.

use super::shader::translate;
use super::{
    region_fits, BufferHandle, BufferUsage, DrawCall, RenderDevice, ScissorRect, ShaderHandle, ShaderSource,
    ShaderStage, TextureFormat, TextureHandle,
};
use crate::error::{RenderError, Result};
use crate::types::{Color, Vertex};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

/// Built-in stages: screen-space positions to clip space, texture modulated by vertex color.
const DEFAULT_SHADER: &str = r#"
struct Viewport {
    size: vec4<f32>,
}

@group(0) @binding(0) var<uniform> viewport: Viewport;
@group(1) @binding(0) var t_texture: texture_2d<f32>;
@group(1) @binding(1) var s_sampler: sampler;

struct VertexInput {
    @location(0) position: vec4<f32>,
    @location(1) color: vec4<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) color: vec4<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let ndc = vec2<f32>(
        in.position.x / viewport.size.x * 2.0 - 1.0,
        1.0 - in.position.y / viewport.size.y * 2.0,
    );
    out.clip_position = vec4<f32>(ndc, in.position.z, 1.0);
    // B, G, R, A in memory
    out.color = in.color.zyxw;
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_texture, s_sampler, in.uv) * in.color;
}
"#;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

type PipelineKey = (Option<u64>, Option<u64>);

struct GpuTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct CompiledShader {
    stage: ShaderStage,
    module: wgpu::ShaderModule,
    entry_point: &'static str,
}

/// Clamped scissor in target pixels.
#[derive(Debug, Clone, Copy)]
struct PixelRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

struct RecordedDraw {
    pipeline: PipelineKey,
    vertices: BufferHandle,
    indices: BufferHandle,
    texture: Option<TextureHandle>,
    scissor: PixelRect,
    call: DrawCall,
}

/// A [`RenderDevice`] drawing into an offscreen RGBA texture with wgpu.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    width: u32,
    height: u32,
    // Render target
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    // Shared binding state
    viewport_bind_group: wgpu::BindGroup,
    texture_bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    default_module: wgpu::ShaderModule,
    white_bind_group: wgpu::BindGroup,
    // Resources by handle id
    next_id: u64,
    textures: HashMap<u64, GpuTexture>,
    buffers: HashMap<u64, GpuBuffer>,
    shaders: HashMap<u64, CompiledShader>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    // Currently bound state
    geometry: Option<(BufferHandle, BufferHandle)>,
    texture: Option<TextureHandle>,
    vertex_stage: Option<ShaderHandle>,
    pixel_stage: Option<ShaderHandle>,
    scissor: PixelRect,
    // Recorded work
    pending: Vec<RecordedDraw>,
    pending_clear: Option<wgpu::Color>,
}

impl WgpuDevice {
    /// Create a headless device with its own adapter, rendering into a
    /// `width` x `height` target.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| {
            warn!("Failed to obtain GPU adapter: {:?}", e);
            RenderError::DeviceUnavailable
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Petal Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| {
            warn!("Failed to create GPU device: {:?}", e);
            RenderError::DeviceUnavailable
        })?;

        Ok(Self::with_device_queue(Arc::new(device), Arc::new(queue), width, height))
    }

    /// Create a device on top of an existing wgpu device and queue.
    pub fn with_device_queue(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, width: u32, height: u32) -> Self {
        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Render Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let viewport_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Viewport Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let viewport = [width as f32, height as f32, 0.0f32, 0.0f32];
        let viewport_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Viewport Uniform Buffer"),
            contents: bytemuck::cast_slice(&viewport),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let viewport_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Viewport Bind Group"),
            layout: &viewport_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: viewport_buffer.as_entire_binding(),
            }],
        });

        let texture_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Batch Pipeline Layout"),
            bind_group_layouts: &[&viewport_bind_group_layout, &texture_bind_group_layout],
            immediate_size: 0,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Batch Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let default_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Batch Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(DEFAULT_SHADER)),
        });

        // Untextured draws sample a single white texel.
        let white = Self::create_gpu_texture(&device, 1, 1);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &white,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255u8; 4],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let white_bind_group = Self::create_texture_bind_group(&device, &texture_bind_group_layout, &sampler, &white);

        info!("Created wgpu render device with {}x{} target", width, height);

        Self {
            device,
            queue,
            width,
            height,
            target,
            target_view,
            viewport_bind_group,
            texture_bind_group_layout,
            pipeline_layout,
            sampler,
            default_module,
            white_bind_group,
            next_id: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            geometry: None,
            texture: None,
            vertex_stage: None,
            pixel_stage: None,
            scissor: PixelRect {
                x: 0,
                y: 0,
                width,
                height,
            },
            pending: Vec::new(),
            pending_clear: None,
        }
    }

    fn create_gpu_texture(device: &wgpu::Device, width: u32, height: u32) -> wgpu::Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Atlas Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn create_texture_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        sampler: &wgpu::Sampler,
        texture: &wgpu::Texture,
    ) -> wgpu::BindGroup {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Texture Bind Group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn references_texture(&self, texture: TextureHandle) -> bool {
        self.pending.iter().any(|d| d.texture == Some(texture))
    }

    fn references_buffer(&self, buffer: BufferHandle) -> bool {
        self.pending.iter().any(|d| d.vertices == buffer || d.indices == buffer)
    }

    fn stage_module(&self, stage: ShaderStage, shader: Option<ShaderHandle>) -> Result<(&wgpu::ShaderModule, &'static str)> {
        match shader {
            None => Ok((
                &self.default_module,
                match stage {
                    ShaderStage::Vertex => "vs_main",
                    ShaderStage::Pixel => "fs_main",
                },
            )),
            Some(handle) => {
                let compiled = self
                    .shaders
                    .get(&handle.0)
                    .ok_or_else(|| RenderError::InvalidShader(format!("unknown shader {:?}", handle)))?;
                if compiled.stage != stage {
                    return Err(RenderError::InvalidShader(format!(
                        "{:?} bound as {:?} stage",
                        compiled.stage, stage
                    )));
                }
                Ok((&compiled.module, compiled.entry_point))
            }
        }
    }

    fn build_pipeline(&self, vertex: Option<ShaderHandle>, pixel: Option<ShaderHandle>) -> Result<wgpu::RenderPipeline> {
        let (vs_module, vs_entry) = self.stage_module(ShaderStage::Vertex, vertex)?;
        let (fs_module, fs_entry) = self.stage_module(ShaderStage::Pixel, pixel)?;

        Ok(self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Batch Pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: vs_module,
                entry_point: Some(vs_entry),
                buffers: &[Vertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: fs_module,
                entry_point: Some(fs_entry),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        }))
    }

    fn ensure_pipeline(&mut self) -> Result<PipelineKey> {
        let key = (self.vertex_stage.map(|s| s.0), self.pixel_stage.map(|s| s.0));
        if !self.pipelines.contains_key(&key) {
            let pipeline = self.build_pipeline(self.vertex_stage, self.pixel_stage)?;
            debug!("Created pipeline for stages {:?}", key);
            self.pipelines.insert(key, pipeline);
        }
        Ok(key)
    }

    /// Clear the target to `color` at the start of the next pass.
    pub fn clear(&mut self, color: Color) -> Result<()> {
        if !self.pending.is_empty() {
            self.submit()?;
        }
        self.pending_clear = Some(wgpu::Color {
            r: color.r as f64 / 255.0,
            g: color.g as f64 / 255.0,
            b: color.b as f64 / 255.0,
            a: color.a as f64 / 255.0,
        });
        Ok(())
    }

    /// Encode every recorded draw into one render pass and submit it.
    pub fn submit(&mut self) -> Result<()> {
        let draws = std::mem::take(&mut self.pending);
        let clear = self.pending_clear.take();
        if draws.is_empty() && clear.is_none() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Batch Encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Batch Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match clear {
                            Some(color) => wgpu::LoadOp::Clear(color),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                ..Default::default()
            });

            render_pass.set_bind_group(0, &self.viewport_bind_group, &[]);

            for draw in &draws {
                let Some(pipeline) = self.pipelines.get(&draw.pipeline) else {
                    warn!("Skipping draw with missing pipeline {:?}", draw.pipeline);
                    continue;
                };
                let (Some(vertices), Some(indices)) =
                    (self.buffers.get(&draw.vertices.0), self.buffers.get(&draw.indices.0))
                else {
                    warn!("Skipping draw with released geometry");
                    continue;
                };
                let bind_group = match draw.texture {
                    Some(texture) => match self.textures.get(&texture.0) {
                        Some(t) => &t.bind_group,
                        None => {
                            warn!("Texture {:?} released before draw, sampling white", texture);
                            &self.white_bind_group
                        }
                    },
                    None => &self.white_bind_group,
                };

                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(1, bind_group, &[]);
                render_pass.set_vertex_buffer(0, vertices.buffer.slice(..));
                render_pass.set_index_buffer(indices.buffer.slice(..), wgpu::IndexFormat::Uint16);
                render_pass.set_scissor_rect(draw.scissor.x, draw.scissor.y, draw.scissor.width, draw.scissor.height);

                let first = draw.call.first_index;
                render_pass.draw_indexed(
                    first..first + draw.call.primitive_count * 3,
                    draw.call.base_vertex as i32,
                    0..1,
                );
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        debug!("[Perf] Submitted {} draws in {:?}", draws.len(), start.elapsed());
        Ok(())
    }

    /// Read the target pixels back to CPU memory as tightly packed RGBA.
    pub fn read_pixels(&mut self) -> Result<Vec<u8>> {
        self.submit()?;

        // Align to 256 bytes for COPY_BYTES_PER_ROW_ALIGNMENT
        let aligned_bytes_per_row = (self.width * 4 + 255) & !255;
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (aligned_bytes_per_row * self.height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        let submission_index = self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                timeout: None,
                submission_index: Some(submission_index),
            })
            .map_err(|_| RenderError::DeviceUnavailable)?;
        rx.recv()
            .map_err(|_| RenderError::DeviceUnavailable)?
            .map_err(|_| RenderError::DeviceUnavailable)?;

        let data = buffer_slice.get_mapped_range();

        // Remove padding from rows
        let row_bytes = (self.width * 4) as usize;
        let mut result = Vec::with_capacity(row_bytes * self.height as usize);
        for y in 0..self.height {
            let start = (y * aligned_bytes_per_row) as usize;
            result.extend_from_slice(&data[start..start + row_bytes]);
        }

        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }

    /// Render target width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texture_view(&self) -> &wgpu::TextureView {
        &self.target_view
    }
}

/// Expands packed `0xARGB` 4-bit texels to 8-bit B, G, R, A bytes.
fn expand_bgra4(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for texel in data.chunks_exact(2) {
        let v = u16::from_le_bytes([texel[0], texel[1]]);
        let channel = |shift: u16| (((v >> shift) & 0xf) as u8) * 17;
        out.extend_from_slice(&[channel(0), channel(4), channel(8), channel(12)]);
    }
    out
}

impl RenderDevice for WgpuDevice {
    fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureHandle> {
        let max = self.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(RenderError::AllocationFailure(format!(
                "texture {}x{} outside 1..={}",
                width, height, max
            )));
        }

        let texture = Self::create_gpu_texture(&self.device, width, height);
        let bind_group =
            Self::create_texture_bind_group(&self.device, &self.texture_bind_group_layout, &self.sampler, &texture);
        let id = self.next_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                bind_group,
                width,
                height,
                format,
            },
        );
        debug!("Created {}x{} {:?} texture #{}", width, height, format, id);
        Ok(TextureHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<()> {
        if self.references_texture(texture) {
            self.submit()?;
        }

        let target = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| RenderError::AllocationFailure(format!("unknown texture {:?}", texture)))?;
        let expected = width as usize * height as usize * target.format.bytes_per_pixel();
        if data.len() != expected {
            return Err(RenderError::DataSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        if !region_fits(x, y, width, height, target.width, target.height) {
            return Err(RenderError::AllocationFailure(format!(
                "region {}x{} at ({}, {}) outside {}x{} texture",
                width, height, x, y, target.width, target.height
            )));
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        let texels: Cow<[u8]> = match target.format {
            TextureFormat::Bgra8 => Cow::Borrowed(data),
            TextureFormat::Bgra4 => Cow::Owned(expand_bgra4(data)),
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            &texels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if self.references_texture(texture) {
            if let Err(e) = self.submit() {
                warn!("Submit before releasing texture failed: {}", e);
            }
        }
        if self.texture == Some(texture) {
            self.texture = None;
        }
        self.textures.remove(&texture.0);
    }

    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> Result<BufferHandle> {
        // write_buffer works in 4-byte units
        let size = size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let usage_flags = match usage {
            BufferUsage::Vertex => wgpu::BufferUsages::VERTEX,
            BufferUsage::Index => wgpu::BufferUsages::INDEX,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match usage {
                BufferUsage::Vertex => "Batch Vertex Buffer",
                BufferUsage::Index => "Batch Index Buffer",
            }),
            size,
            usage: usage_flags | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = self.next_id();
        self.buffers.insert(id, GpuBuffer { buffer, size });
        debug!("Created {:?} buffer #{} ({} bytes)", usage, id, size);
        Ok(BufferHandle(id))
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if self.references_buffer(buffer) {
            if let Err(e) = self.submit() {
                warn!("Submit before releasing buffer failed: {}", e);
            }
        }
        if matches!(self.geometry, Some((v, i)) if v == buffer || i == buffer) {
            self.geometry = None;
        }
        self.buffers.remove(&buffer.0);
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<()> {
        if self.references_buffer(buffer) {
            self.submit()?;
        }

        let target = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| RenderError::AllocationFailure(format!("unknown buffer {:?}", buffer)))?;
        if data.len() as u64 > target.size {
            return Err(RenderError::CapacityExceeded {
                requested: data.len(),
                capacity: target.size as usize,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&target.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize((data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(&target.buffer, 0, &padded);
        }
        Ok(())
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Result<ShaderHandle> {
        let translated = translate(stage, source).map_err(|e| RenderError::InvalidShader(e.to_string()))?;
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Custom Stage"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(translated.wgsl)),
        });
        let id = self.next_id();
        self.shaders.insert(
            id,
            CompiledShader {
                stage,
                module,
                entry_point: translated.entry_point,
            },
        );
        info!("Compiled custom {:?} stage #{}", stage, id);
        Ok(ShaderHandle(id))
    }

    fn bind_geometry(&mut self, vertices: BufferHandle, indices: BufferHandle) -> Result<()> {
        if !self.buffers.contains_key(&vertices.0) || !self.buffers.contains_key(&indices.0) {
            return Err(RenderError::AllocationFailure("binding released geometry".into()));
        }
        self.geometry = Some((vertices, indices));
        Ok(())
    }

    fn set_texture(&mut self, texture: Option<TextureHandle>) -> Result<()> {
        self.texture = texture;
        Ok(())
    }

    fn set_vertex_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()> {
        self.vertex_stage = shader;
        Ok(())
    }

    fn set_pixel_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()> {
        self.pixel_stage = shader;
        Ok(())
    }

    fn set_scissor(&mut self, rect: ScissorRect) -> Result<()> {
        let clamp_x = |v: i32| v.clamp(0, self.width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, self.height as i32) as u32;
        let (left, right) = (clamp_x(rect.left), clamp_x(rect.right));
        let (top, bottom) = (clamp_y(rect.top), clamp_y(rect.bottom));
        self.scissor = PixelRect {
            x: left,
            y: top,
            width: right.saturating_sub(left),
            height: bottom.saturating_sub(top),
        };
        Ok(())
    }

    fn draw_indexed(&mut self, call: DrawCall) -> Result<()> {
        let Some((vertices, indices)) = self.geometry else {
            return Err(RenderError::AllocationFailure("draw without bound geometry".into()));
        };
        if self.scissor.width == 0 || self.scissor.height == 0 {
            debug!("Skipping draw under empty scissor");
            return Ok(());
        }

        let pipeline = self.ensure_pipeline()?;
        self.pending.push(RecordedDraw {
            pipeline,
            vertices,
            indices,
            texture: self.texture,
            scissor: self.scissor,
            call,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_bgra4() {
        // 0xF8C0: a = 15, r = 8, g = 12, b = 0
        let texel = 0xF8C0u16.to_le_bytes();
        assert_eq!(expand_bgra4(&texel), vec![0, 204, 136, 255]);
    }

    #[test]
    fn test_expand_bgra4_transparent() {
        assert_eq!(expand_bgra4(&[0, 0, 0xff, 0x0f]), vec![0, 0, 0, 0, 255, 255, 255, 0]);
    }
}
