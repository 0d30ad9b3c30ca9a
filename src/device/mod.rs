//! Graphics device abstraction.
//!
//! Everything the queue and the atlases need from a GPU goes through the
//! [`RenderDevice`] trait. Components receive the device explicitly through a
//! cloneable [`DeviceContext`]; there is no process-wide device.

mod headless;
mod shader;
mod wgpu_device;

pub use headless::{DeviceOp, HeadlessDevice};
pub use shader::{ShaderSource, ShaderStage};
pub use wgpu_device::WgpuDevice;

use crate::error::Result;
use crate::types::Point;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque texture handle issued by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Opaque geometry buffer handle issued by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Opaque compiled shader stage handle issued by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub(crate) u64);

/// Texel formats the atlases allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8 bits per channel, B, G, R, A in memory order.
    Bgra8,
    /// 4 bits per channel packed into a little-endian `u16` as `0xARGB`.
    Bgra4,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            TextureFormat::Bgra8 => 4,
            TextureFormat::Bgra4 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
}

/// Clip rectangle in target pixels, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn from_points(position: Point, size: Point) -> Self {
        let left = position.x as i32;
        let top = position.y as i32;
        Self {
            left,
            top,
            right: (position.x + size.x) as i32,
            bottom: (position.y + size.y) as i32,
        }
    }
}

/// Whether a `width` x `height` region at (`x`, `y`) lies inside a texture.
pub(crate) fn region_fits(x: u32, y: u32, width: u32, height: u32, texture_width: u32, texture_height: u32) -> bool {
    x.checked_add(width).is_some_and(|right| right <= texture_width)
        && y.checked_add(height).is_some_and(|bottom| bottom <= texture_height)
}

/// One indexed triangle-list draw against the bound geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    /// Added to every index read for this draw.
    pub base_vertex: u32,
    /// Number of vertices the draw touches, starting at `base_vertex`.
    pub vertex_count: u32,
    pub first_index: u32,
    pub primitive_count: u32,
}

/// Operations the batching engine consumes from a GPU.
///
/// Writes to textures are tightly packed rows of `width * bytes_per_pixel`
/// bytes. Buffer uploads always start at offset zero.
pub trait RenderDevice {
    /// Largest width or height a texture may have.
    fn max_texture_dimension(&self) -> u32;

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureHandle>;

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<()>;

    fn release_texture(&mut self, texture: TextureHandle);

    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> Result<BufferHandle>;

    fn release_buffer(&mut self, buffer: BufferHandle);

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<()>;

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Result<ShaderHandle>;

    /// Binds the vertex and `u16` index streams used by subsequent draws.
    fn bind_geometry(&mut self, vertices: BufferHandle, indices: BufferHandle) -> Result<()>;

    fn set_texture(&mut self, texture: Option<TextureHandle>) -> Result<()>;

    /// `None` restores the built-in vertex stage.
    fn set_vertex_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()>;

    /// `None` restores the built-in pixel stage.
    fn set_pixel_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()>;

    fn set_scissor(&mut self, rect: ScissorRect) -> Result<()>;

    fn draw_indexed(&mut self, call: DrawCall) -> Result<()>;
}

/// Shared, injectable reference to the device every component draws through.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<Mutex<dyn RenderDevice + Send>>,
}

impl DeviceContext {
    pub fn new<D: RenderDevice + Send + 'static>(device: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(device)),
        }
    }

    /// Wraps a device the caller keeps its own typed handle to.
    pub fn from_shared<D: RenderDevice + Send + 'static>(device: Arc<Mutex<D>>) -> Self {
        Self { inner: device }
    }

    /// Locks the device. A poisoned lock is recovered; device state is
    /// only ever mutated through complete trait calls.
    pub fn lock(&self) -> MutexGuard<'_, dyn RenderDevice + Send + 'static> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext").finish_non_exhaustive()
    }
}

/// Two-phase device-loss protocol.
///
/// `pre_reset` drops every device resource the component owns; `post_reset`
/// recreates them from host-side state.
pub trait Resettable {
    fn pre_reset(&mut self);

    fn post_reset(&mut self) -> Result<()>;

    fn reset(&mut self, pre_reset: bool) -> Result<()> {
        if pre_reset {
            self.pre_reset();
            Ok(())
        } else {
            self.post_reset()
        }
    }
}
