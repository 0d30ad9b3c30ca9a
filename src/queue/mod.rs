//! Draw-command queue with look-behind batching.
//!
//! Shapes are appended to host-side vertex and index buffers. A shape merges
//! into the previous command when that command is a triangle batch on the same
//! texture, so consecutive same-texture shapes cost one draw. Nothing is ever
//! reordered; commands replay in submission order on [`CommandQueue::flush`].

mod double_buffered;

pub use double_buffered::DoubleBufferedQueue;

use crate::atlas::{GlyphAtlas, TextureAtlas};
use crate::buffer::GrowableBuffer;
use crate::config::QueueConfig;
use crate::device::{
    BufferHandle, BufferUsage, DeviceContext, DrawCall, Resettable, ScissorRect, ShaderHandle, TextureHandle,
};
use crate::error::{RenderError, Result};
use crate::types::{Color, Point, UvRect, Vertex};
use std::ops::BitOr;
use tracing::{debug, error, info, warn};

/// Largest vertex count one batch may address with `u16` indices.
const MAX_BATCH_VERTICES: u32 = u16::MAX as u32 + 1;

/// Quad corner order: top-left, top-right, bottom-right, bottom-left.
const QUAD_INDICES: [u16; 6] = [0, 1, 3, 3, 2, 1];
const LINE_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 1];
const GLYPH_INDICES: [u16; 6] = [0, 1, 2, 3, 2, 1];
const TRIANGLE_INDICES: [u16; 3] = [0, 1, 2];

/// One replayable unit of device work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCommand {
    /// Indexed triangles sharing one texture. Counts cover every shape merged into it.
    TriBatch {
        texture: Option<TextureHandle>,
        primitives: u32,
        vertices: u32,
        indices: u32,
    },
    PushVertexStage(Option<ShaderHandle>),
    PushPixelStage(Option<ShaderHandle>),
    PushScissor { position: Point, size: Point },
}

/// Text anchoring flags. The default anchors at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextAlign(u8);

impl TextAlign {
    pub const DEFAULT: TextAlign = TextAlign(0);
    pub const LEFT: TextAlign = TextAlign(1 << 0);
    pub const CENTER_X: TextAlign = TextAlign(1 << 1);
    pub const RIGHT: TextAlign = TextAlign(1 << 2);
    pub const TOP: TextAlign = TextAlign(1 << 3);
    pub const CENTER_Y: TextAlign = TextAlign(1 << 4);
    pub const BOTTOM: TextAlign = TextAlign(1 << 5);

    pub fn contains(self, other: TextAlign) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for TextAlign {
    type Output = TextAlign;

    fn bitor(self, rhs: TextAlign) -> TextAlign {
        TextAlign(self.0 | rhs.0)
    }
}

/// Accumulates shapes for one frame and replays them on the device.
pub struct CommandQueue {
    device: DeviceContext,
    vertices: GrowableBuffer<Vertex>,
    indices: GrowableBuffer<u16>,
    commands: Vec<DrawCommand>,
    gpu_vertices: Option<BufferHandle>,
    gpu_indices: Option<BufferHandle>,
    vertex_resize_pending: bool,
    index_resize_pending: bool,
    needs_upload: bool,
}

impl CommandQueue {
    /// Create a queue with room for the given element counts on both sides.
    pub fn new(device: DeviceContext, vertex_capacity: usize, index_capacity: usize) -> Result<Self> {
        let vertices = GrowableBuffer::with_capacity(vertex_capacity);
        let indices = GrowableBuffer::with_capacity(index_capacity);

        let (gpu_vertices, gpu_indices) = {
            let mut dev = device.lock();
            let vb = dev.create_buffer(BufferUsage::Vertex, vertices.byte_capacity())?;
            let ib = match dev.create_buffer(BufferUsage::Index, indices.byte_capacity()) {
                Ok(ib) => ib,
                Err(e) => {
                    dev.release_buffer(vb);
                    return Err(e);
                }
            };
            (vb, ib)
        };

        Ok(Self {
            device,
            vertices,
            indices,
            commands: Vec::with_capacity(256),
            gpu_vertices: Some(gpu_vertices),
            gpu_indices: Some(gpu_indices),
            vertex_resize_pending: false,
            index_resize_pending: false,
            needs_upload: false,
        })
    }

    pub fn from_config(device: DeviceContext, config: &QueueConfig) -> Result<Self> {
        Self::new(device, config.vertex_capacity, config.index_capacity)
    }

    /// Grows host storage for an upcoming shape, flagging device buffers for recreation.
    fn reserve(&mut self, vertices: usize, indices: usize) {
        if self.vertices.ensure_capacity(vertices) {
            self.vertex_resize_pending = true;
        }
        if self.indices.ensure_capacity(indices) {
            self.index_resize_pending = true;
        }
    }

    /// Base vertex for a shape of `vertices` vertices on `texture`.
    ///
    /// `Some(base)` means the shape can join the last batch, with its indices
    /// offset by `base`. `None` means it starts a new batch at offset zero.
    pub fn begin_batch(&self, texture: Option<TextureHandle>, vertices: u32) -> Option<u32> {
        match self.commands.last() {
            Some(DrawCommand::TriBatch {
                texture: last_texture,
                vertices: batched,
                ..
            }) if *last_texture == texture && batched + vertices <= MAX_BATCH_VERTICES => Some(*batched),
            _ => None,
        }
    }

    /// Records the counts of a shape whose geometry was just appended.
    pub fn end_batch(
        &mut self,
        base: Option<u32>,
        vertices: u32,
        indices: u32,
        primitives: u32,
        texture: Option<TextureHandle>,
    ) {
        if vertices == 0 && indices == 0 {
            return;
        }
        self.needs_upload = true;

        if base.is_some() {
            if let Some(DrawCommand::TriBatch {
                vertices: v,
                indices: i,
                primitives: p,
                ..
            }) = self.commands.last_mut()
            {
                *v += vertices;
                *i += indices;
                *p += primitives;
                return;
            }
        }

        self.commands.push(DrawCommand::TriBatch {
            texture,
            primitives,
            vertices,
            indices,
        });
    }

    /// Appends one shape with batch-local indices.
    fn push_shape<const V: usize, const I: usize>(
        &mut self,
        texture: Option<TextureHandle>,
        vertices: [Vertex; V],
        indices: [u16; I],
        primitives: u32,
    ) {
        self.reserve(V, I);
        let base = self.begin_batch(texture, V as u32);
        let offset = base.unwrap_or(0) as u16;
        let indices = indices.map(|i| offset.wrapping_add(i));

        // Capacity was reserved above.
        if let Err(e) = self.vertices.append(&vertices).and_then(|_| self.indices.append(&indices)) {
            error!("Dropping shape: {}", e);
            return;
        }
        self.end_batch(base, V as u32, I as u32, primitives, texture);
    }

    pub fn push_filled_rectangle(&mut self, position: Point, size: Point, color: Color) {
        self.push_gradient_rectangle(position, size, color, color, color, color);
    }

    /// Rectangle with one color per corner: top-left, top-right, bottom-left, bottom-right.
    pub fn push_gradient_rectangle(
        &mut self,
        position: Point,
        size: Point,
        top_left: Color,
        top_right: Color,
        bottom_left: Color,
        bottom_right: Color,
    ) {
        self.push_textured_rectangle(
            position,
            size,
            [top_left, top_right, bottom_left, bottom_right],
            None,
            UvRect::new(0.0, 0.0, 1.0, 1.0),
        );
    }

    /// Rectangle sampling `uv` of `texture`, corners colored as in
    /// [`CommandQueue::push_gradient_rectangle`]. Corners are snapped down to whole pixels.
    pub fn push_textured_rectangle(
        &mut self,
        position: Point,
        size: Point,
        colors: [Color; 4],
        texture: Option<TextureHandle>,
        uv: UvRect,
    ) {
        let [top_left, top_right, bottom_left, bottom_right] = colors;
        let (x0, y0) = (position.x.floor(), position.y.floor());
        let (x1, y1) = ((position.x + size.x).floor(), (position.y + size.y).floor());

        let vertices = [
            Vertex::new(x0, y0, top_left, uv.u0(), uv.v0()),
            Vertex::new(x1, y0, top_right, uv.u1(), uv.v0()),
            Vertex::new(x1, y1, bottom_right, uv.u1(), uv.v1()),
            Vertex::new(x0, y1, bottom_left, uv.u0(), uv.v1()),
        ];
        self.push_shape(texture, vertices, QUAD_INDICES, 2);
    }

    /// Draws the image packed under `key` in `atlas`, tinted by `color`.
    pub fn push_image(&mut self, atlas: &TextureAtlas, key: u32, position: Point, size: Point, color: Color) {
        let uv = atlas.coords(key);
        let Some(texture) = atlas.texture() else {
            warn!("Texture atlas unavailable, skipping image {}", key);
            return;
        };
        if uv.is_empty() {
            warn!("Image {} not in atlas", key);
            return;
        }
        self.push_textured_rectangle(position, size, [color; 4], Some(texture), uv);
    }

    pub fn push_filled_triangle(&mut self, p1: Point, p2: Point, p3: Point, c1: Color, c2: Color, c3: Color) {
        let vertices = [
            Vertex::colored(p1.x.floor(), p1.y.floor(), c1),
            Vertex::colored(p2.x.floor(), p2.y.floor(), c2),
            Vertex::colored(p3.x.floor(), p3.y.floor(), c3),
        ];
        self.push_shape(None, vertices, TRIANGLE_INDICES, 1);
    }

    /// Segment from `p1` to `p2` as a `width`-wide quad.
    pub fn push_line(&mut self, p1: Point, p2: Point, color: Color, width: f32) {
        let delta = p2 - p1;
        let length = (delta.x * delta.x + delta.y * delta.y).sqrt() + f32::EPSILON;
        let scale = width / (2.0 * length);
        let radius = Point::new(-scale * delta.y, scale * delta.x);

        let vertices = [
            Vertex::new(p1.x - radius.x, p1.y - radius.y, color, 0.0, 0.0),
            Vertex::new(p1.x + radius.x, p1.y + radius.y, color, 1.0, 0.0),
            Vertex::new(p2.x - radius.x, p2.y - radius.y, color, 1.0, 1.0),
            Vertex::new(p2.x + radius.x, p2.y + radius.y, color, 0.0, 1.0),
        ];
        self.push_shape(None, vertices, LINE_INDICES, 2);
    }

    /// Rectangle border of `width`-wide lines.
    pub fn push_outlined_rectangle(&mut self, position: Point, size: Point, color: Color, width: f32) {
        let top_left = position;
        let top_right = Point::new(position.x + size.x, position.y);
        let bottom_right = position + size;
        let bottom_left = Point::new(position.x, position.y + size.y);

        self.push_line(top_left, top_right, color, width);
        self.push_line(top_right, bottom_right, color, width);
        self.push_line(bottom_right, bottom_left, color, width);
        self.push_line(bottom_left, top_left, color, width);
    }

    /// Lays out `text` with glyphs from `font`.
    ///
    /// Spaces advance without geometry, other control characters are skipped
    /// and `'\n'` returns to the starting column one line lower.
    pub fn push_text(&mut self, font: &GlyphAtlas, position: Point, text: &str, color: Color, align: TextAlign) {
        let Some(texture) = font.texture() else {
            warn!("Glyph atlas for '{}' unavailable, skipping text", font.spec().family);
            return;
        };

        let chars = text.chars().count();
        self.reserve(chars * 4, chars * 6);

        let mut pen = position;
        if align != TextAlign::DEFAULT {
            let extent = font.text_extent(text);
            if align.contains(TextAlign::CENTER_X) {
                pen.x -= (0.5 * extent.x).floor();
            } else if align.contains(TextAlign::RIGHT) {
                pen.x -= extent.x.floor();
            }
            if align.contains(TextAlign::CENTER_Y) {
                pen.y -= (0.5 * extent.y).floor();
            } else if align.contains(TextAlign::BOTTOM) {
                pen.y -= extent.y.floor();
            }
        }

        let padding = font.padding();
        pen.x -= padding;
        let start_x = pen.x;

        for ch in text.chars() {
            if ch == '\n' {
                pen.x = start_x;
                pen.y += font.line_height();
                continue;
            }
            if ch < ' ' {
                continue;
            }

            let uv = font.coords(ch);
            if uv.is_empty() {
                continue;
            }
            let size = font.quad_size(uv);

            if ch != ' ' {
                let (x0, y0, x1, y1) = (pen.x, pen.y, pen.x + size.x, pen.y + size.y);
                let vertices = [
                    Vertex::new(x0, y1, color, uv.u0(), uv.v1()),
                    Vertex::new(x0, y0, color, uv.u0(), uv.v0()),
                    Vertex::new(x1, y1, color, uv.u1(), uv.v1()),
                    Vertex::new(x1, y0, color, uv.u1(), uv.v0()),
                ];
                self.push_shape(Some(texture), vertices, GLYPH_INDICES, 2);
            }

            pen.x += size.x - 2.0 * padding;
        }
    }

    /// Clips subsequent draws to a rectangle. Always a separate command.
    pub fn push_scissor(&mut self, position: Point, size: Point) {
        self.commands.push(DrawCommand::PushScissor { position, size });
    }

    /// Replaces the vertex stage for subsequent draws; `None` restores the built-in one.
    pub fn push_vertex_stage(&mut self, shader: Option<ShaderHandle>) {
        self.commands.push(DrawCommand::PushVertexStage(shader));
    }

    /// Replaces the pixel stage for subsequent draws; `None` restores the built-in one.
    pub fn push_pixel_stage(&mut self, shader: Option<ShaderHandle>) {
        self.commands.push(DrawCommand::PushPixelStage(shader));
    }

    /// Recreates resized device buffers, then uploads both host buffers.
    pub fn update(&mut self) -> Result<()> {
        let mut device = self.device.lock();

        if self.vertex_resize_pending {
            let old = self.gpu_vertices.take().ok_or(RenderError::DeviceUnavailable)?;
            device.release_buffer(old);
            self.gpu_vertices = Some(device.create_buffer(BufferUsage::Vertex, self.vertices.byte_capacity())?);
            self.vertex_resize_pending = false;
            info!("Recreated vertex buffer for {} vertices", self.vertices.capacity());
        }
        if self.index_resize_pending {
            let old = self.gpu_indices.take().ok_or(RenderError::DeviceUnavailable)?;
            device.release_buffer(old);
            self.gpu_indices = Some(device.create_buffer(BufferUsage::Index, self.indices.byte_capacity())?);
            self.index_resize_pending = false;
            info!("Recreated index buffer for {} indices", self.indices.capacity());
        }

        let vertices = self.gpu_vertices.ok_or(RenderError::DeviceUnavailable)?;
        let indices = self.gpu_indices.ok_or(RenderError::DeviceUnavailable)?;
        device.upload_buffer(vertices, self.vertices.as_bytes())?;
        device.upload_buffer(indices, self.indices.as_bytes())?;
        self.needs_upload = false;
        Ok(())
    }

    /// Replays every command on the device in submission order.
    pub fn flush(&mut self) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        if self.needs_upload || self.vertex_resize_pending || self.index_resize_pending {
            self.update()?;
        }

        let start = std::time::Instant::now();
        let vertices = self.gpu_vertices.ok_or(RenderError::DeviceUnavailable)?;
        let indices = self.gpu_indices.ok_or(RenderError::DeviceUnavailable)?;

        let mut device = self.device.lock();
        device.bind_geometry(vertices, indices)?;

        let (mut vertex_cursor, mut index_cursor) = (0u32, 0u32);
        for command in &self.commands {
            match *command {
                DrawCommand::TriBatch {
                    texture,
                    primitives,
                    vertices,
                    indices,
                } => {
                    device.set_texture(texture)?;
                    device.draw_indexed(DrawCall {
                        base_vertex: vertex_cursor,
                        vertex_count: vertices,
                        first_index: index_cursor,
                        primitive_count: primitives,
                    })?;
                    vertex_cursor += vertices;
                    index_cursor += indices;
                }
                DrawCommand::PushVertexStage(shader) => device.set_vertex_stage(shader)?,
                DrawCommand::PushPixelStage(shader) => device.set_pixel_stage(shader)?,
                DrawCommand::PushScissor { position, size } => {
                    device.set_scissor(ScissorRect::from_points(position, size))?
                }
            }
        }

        debug!(
            "[Perf] Flushed {} commands ({} vertices, {} indices) in {:?}",
            self.commands.len(),
            vertex_cursor,
            index_cursor,
            start.elapsed()
        );
        Ok(())
    }

    /// Drops all geometry and commands, keeping capacity.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.commands.clear();
        self.needs_upload = false;
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn vertices(&self) -> &[Vertex] {
        self.vertices.as_slice()
    }

    pub fn indices(&self) -> &[u16] {
        self.indices.as_slice()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn vertex_capacity(&self) -> usize {
        self.vertices.capacity()
    }

    pub fn index_capacity(&self) -> usize {
        self.indices.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Resettable for CommandQueue {
    fn pre_reset(&mut self) {
        let mut device = self.device.lock();
        if let Some(buffer) = self.gpu_vertices.take() {
            device.release_buffer(buffer);
        }
        if let Some(buffer) = self.gpu_indices.take() {
            device.release_buffer(buffer);
        }
    }

    fn post_reset(&mut self) -> Result<()> {
        let mut device = self.device.lock();
        if self.gpu_vertices.is_none() {
            self.gpu_vertices = Some(device.create_buffer(BufferUsage::Vertex, self.vertices.byte_capacity())?);
        }
        if self.gpu_indices.is_none() {
            self.gpu_indices = Some(device.create_buffer(BufferUsage::Index, self.indices.byte_capacity())?);
        }
        self.vertex_resize_pending = false;
        self.index_resize_pending = false;
        self.needs_upload = true;
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.pre_reset();
    }
}
