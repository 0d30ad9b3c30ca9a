//! Value types carried through the vertex stream.

use bytemuck::{Pod, Zeroable};
use std::ops::{Add, Sub};

/// A 2D position or size in pre-transformed screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// An 8-bit-per-channel color stored in device-native BGRA order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Color {
    pub b: u8,
    pub g: u8,
    pub r: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { b, g, r, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 255)
    }

    /// Packed `0xAARRGGBB` value, i.e. B, G, R, A in memory order.
    pub const fn packed(self) -> u32 {
        u32::from_le_bytes([self.b, self.g, self.r, self.a])
    }
}

/// Normalized texture rectangle `[u0, v0, u1, v1]`.
///
/// The all-zero rectangle doubles as the "not found" sentinel returned by
/// atlas lookups.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvRect(pub [f32; 4]);

impl UvRect {
    pub const EMPTY: UvRect = UvRect([0.0; 4]);

    pub fn new(u0: f32, v0: f32, u1: f32, v1: f32) -> Self {
        Self([u0, v0, u1, v1])
    }

    /// Builds the rectangle covering a pixel region of a `width` x `height` texture.
    pub fn from_region(x: u32, y: u32, w: u32, h: u32, width: u32, height: u32) -> Self {
        let (tw, th) = (width as f32, height as f32);
        Self([
            x as f32 / tw,
            y as f32 / th,
            (x + w) as f32 / tw,
            (y + h) as f32 / th,
        ])
    }

    pub fn u0(&self) -> f32 {
        self.0[0]
    }

    pub fn v0(&self) -> f32 {
        self.0[1]
    }

    pub fn u1(&self) -> f32 {
        self.0[2]
    }

    pub fn v1(&self) -> f32 {
        self.0[3]
    }

    pub fn width(&self) -> f32 {
        self.0[2] - self.0[0]
    }

    pub fn height(&self) -> f32 {
        self.0[3] - self.0[1]
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }
}

/// Pre-transformed vertex: screen position with reciprocal W, packed color, UV.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub color: u32,
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn new(x: f32, y: f32, color: Color, u: f32, v: f32) -> Self {
        Self {
            position: [x, y, 0.0, 1.0],
            color: color.packed(),
            uv: [u, v],
        }
    }

    /// Untextured vertex; UV is left at the origin.
    pub fn colored(x: f32, y: f32, color: Color) -> Self {
        Self::new(x, y, color, 0.0, 0.0)
    }

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Unorm8x4,
                },
                wgpu::VertexAttribute {
                    offset: (std::mem::size_of::<[f32; 4]>() + std::mem::size_of::<u32>())
                        as wgpu::BufferAddress,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_packs_as_argb() {
        let c = Color::rgba(0x11, 0x22, 0x33, 0x44);
        assert_eq!(c.packed(), 0x4411_2233);
        // memory order is B, G, R, A
        assert_eq!(c.packed().to_le_bytes(), [0x33, 0x22, 0x11, 0x44]);
    }

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 28);
        let layout = Vertex::layout();
        assert_eq!(layout.array_stride, 28);
        assert_eq!(layout.attributes[2].offset, 20);
    }

    #[test]
    fn test_uv_rect_from_region() {
        let uv = UvRect::from_region(64, 0, 64, 32, 128, 128);
        assert_eq!(uv, UvRect::new(0.5, 0.0, 1.0, 0.25));
        assert!(!uv.is_empty());
        assert!(UvRect::EMPTY.is_empty());
    }
}
