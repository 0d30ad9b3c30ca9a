//! CPU-side device that keeps resource contents in memory.
//!
//! Every call is appended to an operation log so callers can inspect exactly
//! what a flush issued. The log keeps growing until drained with
//! [`HeadlessDevice::take_ops`]; a device kept alive across many frames
//! should drain it each frame or turn it off with
//! [`HeadlessDevice::set_recording`].

use super::shader::translate;
use super::{
    region_fits, BufferHandle, BufferUsage, DrawCall, RenderDevice, ScissorRect, ShaderHandle, ShaderSource,
    ShaderStage, TextureFormat, TextureHandle,
};
use crate::error::{RenderError, Result};
use std::collections::HashMap;
use tracing::debug;

/// A recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    CreateTexture { texture: TextureHandle, width: u32, height: u32, format: TextureFormat },
    WriteTexture { texture: TextureHandle, x: u32, y: u32, width: u32, height: u32 },
    ReleaseTexture(TextureHandle),
    CreateBuffer { buffer: BufferHandle, usage: BufferUsage, size: u64 },
    ReleaseBuffer(BufferHandle),
    UploadBuffer { buffer: BufferHandle, len: usize },
    CreateShader { shader: ShaderHandle, stage: ShaderStage },
    BindGeometry { vertices: BufferHandle, indices: BufferHandle },
    SetTexture(Option<TextureHandle>),
    SetVertexStage(Option<ShaderHandle>),
    SetPixelStage(Option<ShaderHandle>),
    SetScissor(ScissorRect),
    DrawIndexed(DrawCall),
}

struct HeadlessTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    pixels: Vec<u8>,
}

struct HeadlessBuffer {
    size: u64,
    data: Vec<u8>,
}

/// In-memory [`RenderDevice`].
pub struct HeadlessDevice {
    max_dimension: u32,
    available: bool,
    next_id: u64,
    textures: HashMap<u64, HeadlessTexture>,
    buffers: HashMap<u64, HeadlessBuffer>,
    shaders: HashMap<u64, ShaderStage>,
    recording: bool,
    ops: Vec<DeviceOp>,
}

impl HeadlessDevice {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension,
            available: true,
            next_id: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            shaders: HashMap::new(),
            recording: true,
            ops: Vec::new(),
        }
    }

    /// Marks the device lost (`false`) or restored (`true`).
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Turns the operation log on or off. Recording starts on; resource
    /// contents are kept either way.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    fn record(&mut self, op: DeviceOp) {
        if self.recording {
            self.ops.push(op);
        }
    }

    pub fn ops(&self) -> &[DeviceOp] {
        &self.ops
    }

    /// Returns and clears the operation log.
    pub fn take_ops(&mut self) -> Vec<DeviceOp> {
        std::mem::take(&mut self.ops)
    }

    /// Draw calls in the log, in issue order.
    pub fn draw_calls(&self) -> Vec<DrawCall> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeviceOp::DrawIndexed(call) => Some(*call),
                _ => None,
            })
            .collect()
    }

    pub fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.width, t.height))
    }

    pub fn texture_format(&self, texture: TextureHandle) -> Option<TextureFormat> {
        self.textures.get(&texture.0).map(|t| t.format)
    }

    pub fn texture_pixels(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.pixels.as_slice())
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer.0).map(|b| b.size)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(RenderError::DeviceUnavailable)
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl RenderDevice for HeadlessDevice {
    fn max_texture_dimension(&self) -> u32 {
        self.max_dimension
    }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureHandle> {
        self.check_available()?;
        if width == 0 || height == 0 || width > self.max_dimension || height > self.max_dimension {
            return Err(RenderError::AllocationFailure(format!(
                "texture {}x{} outside 1..={}",
                width, height, self.max_dimension
            )));
        }

        let texture = TextureHandle(self.next_id());
        let len = width as usize * height as usize * format.bytes_per_pixel();
        self.textures.insert(
            texture.0,
            HeadlessTexture {
                width,
                height,
                format,
                pixels: vec![0; len],
            },
        );
        self.record(DeviceOp::CreateTexture {
            texture,
            width,
            height,
            format,
        });
        Ok(texture)
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
        self.check_available()?;
        let target = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| RenderError::AllocationFailure(format!("unknown texture {:?}", texture)))?;

        let bpp = target.format.bytes_per_pixel();
        let row_bytes = width as usize * bpp;
        let expected = row_bytes * height as usize;
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

        let stride = target.width as usize * bpp;
        for (row, src) in data.chunks_exact(row_bytes.max(1)).enumerate().take(height as usize) {
            let start = (y as usize + row) * stride + x as usize * bpp;
            target.pixels[start..start + row_bytes].copy_from_slice(src);
        }

        self.record(DeviceOp::WriteTexture {
            texture,
            x,
            y,
            width,
            height,
        });
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture.0).is_some() {
            self.record(DeviceOp::ReleaseTexture(texture));
        }
    }

    fn create_buffer(&mut self, usage: BufferUsage, size: u64) -> Result<BufferHandle> {
        self.check_available()?;
        let buffer = BufferHandle(self.next_id());
        self.buffers.insert(
            buffer.0,
            HeadlessBuffer {
                size,
                data: Vec::new(),
            },
        );
        self.record(DeviceOp::CreateBuffer { buffer, usage, size });
        Ok(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_some() {
            self.record(DeviceOp::ReleaseBuffer(buffer));
        }
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<()> {
        self.check_available()?;
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| RenderError::AllocationFailure(format!("unknown buffer {:?}", buffer)))?;
        if data.len() as u64 > target.size {
            return Err(RenderError::CapacityExceeded {
                requested: data.len(),
                capacity: target.size as usize,
            });
        }
        target.data = data.to_vec();
        self.record(DeviceOp::UploadBuffer {
            buffer,
            len: data.len(),
        });
        Ok(())
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Result<ShaderHandle> {
        self.check_available()?;
        translate(stage, source).map_err(|e| RenderError::InvalidShader(e.to_string()))?;
        let shader = ShaderHandle(self.next_id());
        self.shaders.insert(shader.0, stage);
        debug!("Headless device compiled {:?} stage {:?}", stage, shader);
        self.record(DeviceOp::CreateShader { shader, stage });
        Ok(shader)
    }

    fn bind_geometry(&mut self, vertices: BufferHandle, indices: BufferHandle) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::BindGeometry { vertices, indices });
        Ok(())
    }

    fn set_texture(&mut self, texture: Option<TextureHandle>) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::SetTexture(texture));
        Ok(())
    }

    fn set_vertex_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::SetVertexStage(shader));
        Ok(())
    }

    fn set_pixel_stage(&mut self, shader: Option<ShaderHandle>) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::SetPixelStage(shader));
        Ok(())
    }

    fn set_scissor(&mut self, rect: ScissorRect) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::SetScissor(rect));
        Ok(())
    }

    fn draw_indexed(&mut self, call: DrawCall) -> Result<()> {
        self.check_available()?;
        self.record(DeviceOp::DrawIndexed(call));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_texture_places_rows() {
        let mut device = HeadlessDevice::new(64);
        let texture = device.create_texture(4, 2, TextureFormat::Bgra4).unwrap();
        device.write_texture(texture, 1, 1, 2, 1, &[1, 2, 3, 4]).unwrap();

        let pixels = device.texture_pixels(texture).unwrap();
        assert_eq!(pixels.len(), 16);
        assert_eq!(&pixels[8..16], &[0, 0, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_write_texture_rejects_wrapping_region() {
        let mut device = HeadlessDevice::new(64);
        let texture = device.create_texture(4, 4, TextureFormat::Bgra8).unwrap();

        let err = device.write_texture(texture, u32::MAX, 0, 1, 1, &[0; 4]).unwrap_err();
        assert!(matches!(err, RenderError::AllocationFailure(_)));
        let err = device.write_texture(texture, 0, u32::MAX, 1, 1, &[0; 4]).unwrap_err();
        assert!(matches!(err, RenderError::AllocationFailure(_)));
        assert!(device.texture_pixels(texture).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disabled_recording_keeps_contents() {
        let mut device = HeadlessDevice::new(64);
        device.set_recording(false);
        let texture = device.create_texture(2, 1, TextureFormat::Bgra8).unwrap();
        device.write_texture(texture, 1, 0, 1, 1, &[9, 8, 7, 6]).unwrap();

        assert!(device.ops().is_empty());
        assert_eq!(device.texture_pixels(texture).unwrap(), &[0, 0, 0, 0, 9, 8, 7, 6]);

        device.set_recording(true);
        device.release_texture(texture);
        assert_eq!(device.take_ops(), vec![DeviceOp::ReleaseTexture(texture)]);
        assert!(device.ops().is_empty());
    }

    #[test]
    fn test_oversized_texture_is_rejected() {
        let mut device = HeadlessDevice::new(64);
        let err = device.create_texture(128, 16, TextureFormat::Bgra8).unwrap_err();
        assert!(matches!(err, RenderError::AllocationFailure(_)));
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_unavailable_device_refuses_calls() {
        let mut device = HeadlessDevice::new(64);
        device.set_available(false);
        assert_eq!(
            device.create_buffer(BufferUsage::Vertex, 16),
            Err(RenderError::DeviceUnavailable)
        );
        device.set_available(true);
        assert!(device.create_buffer(BufferUsage::Vertex, 16).is_ok());
    }

    #[test]
    fn test_invalid_shader_is_rejected() {
        let mut device = HeadlessDevice::new(64);
        let result = device.create_shader(ShaderStage::Pixel, &ShaderSource::Wgsl("fn nope(".into()));
        assert!(matches!(result, Err(RenderError::InvalidShader(_))));
    }
}
