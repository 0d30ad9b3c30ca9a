//! Font rasterization interface used to build glyph atlases.
//!
//! The glyph atlas only talks to a [`GlyphRasterizer`]: it enumerates the
//! code points a font advertises, measures glyph cells and draws glyph
//! coverage into an 8-bit bitmap.

mod ab_glyph_rasterizer;
mod font_database;

pub use ab_glyph_rasterizer::AbGlyphRasterizer;
pub use font_database::FontDatabase;

use crate::error::Result;
use serde::Deserialize;

/// A contiguous run of code points a font covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageRange {
    pub first: u32,
    pub count: u32,
}

impl CoverageRange {
    /// Valid characters of the range; surrogates are skipped.
    pub fn chars(&self) -> impl Iterator<Item = char> {
        (self.first..self.first.saturating_add(self.count)).filter_map(char::from_u32)
    }
}

/// Collapses code points into sorted contiguous ranges.
pub fn ranges_from_code_points(mut points: Vec<u32>) -> Vec<CoverageRange> {
    points.sort_unstable();
    points.dedup();

    let mut ranges: Vec<CoverageRange> = Vec::new();
    for point in points {
        match ranges.last_mut() {
            Some(range) if range.first + range.count == point => range.count += 1,
            _ => ranges.push(CoverageRange { first: point, count: 1 }),
        }
    }
    ranges
}

/// Cell extent of a glyph: advance width and line height in whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlyphExtent {
    pub width: u32,
    pub height: u32,
}

/// Antialiasing mode applied when drawing coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Hard edges: coverage is thresholded to on/off.
    NonAntialiased,
    #[default]
    Antialiased,
    /// Antialiased with a gamma lift that keeps thin stems visible.
    Natural,
}

impl Quality {
    /// Maps raw outline coverage in `0.0..=1.0` to an 8-bit value.
    pub fn coverage(&self, raw: f32) -> u8 {
        let raw = raw.clamp(0.0, 1.0);
        match self {
            Quality::NonAntialiased => {
                if raw >= 0.5 {
                    255
                } else {
                    0
                }
            }
            Quality::Antialiased => (raw * 255.0).round() as u8,
            Quality::Natural => (raw.powf(1.0 / 1.43) * 255.0).round() as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct FontStyle {
    pub bold: bool,
    pub italic: bool,
}

impl FontStyle {
    pub const REGULAR: FontStyle = FontStyle { bold: false, italic: false };
    pub const BOLD: FontStyle = FontStyle { bold: true, italic: false };
    pub const ITALIC: FontStyle = FontStyle { bold: false, italic: true };
}

/// Everything needed to (re)build a glyph atlas for one font face.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FontSpec {
    pub family: String,
    /// Requested pixel height.
    pub size: u32,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub style: FontStyle,
}

impl FontSpec {
    pub fn new(family: impl Into<String>, size: u32) -> Self {
        Self {
            family: family.into(),
            size,
            quality: Quality::default(),
            style: FontStyle::default(),
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_style(mut self, style: FontStyle) -> Self {
        self.style = style;
        self
    }
}

/// Single-channel coverage image glyphs are drawn into.
#[derive(Debug, Clone)]
pub struct CoverageBitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl CoverageBitmap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize]
        } else {
            0
        }
    }

    /// Merges coverage at a pixel, keeping the stronger value. Out of range is ignored.
    pub fn put(&mut self, x: i32, y: i32, coverage: u8) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let idx = (y as u32 * self.width + x as u32) as usize;
        self.data[idx] = self.data[idx].max(coverage);
    }

    /// Converts to 4-bit BGRA texels: white with coverage as alpha, fully
    /// transparent where nothing was drawn.
    pub fn to_bgra4(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * 2);
        for &coverage in &self.data {
            let texel: u16 = if coverage > 0 {
                ((coverage as u16 >> 4) << 12) | 0x0fff
            } else {
                0
            };
            out.extend_from_slice(&texel.to_le_bytes());
        }
        out
    }
}

/// Font backend consumed by the glyph atlas.
pub trait GlyphRasterizer {
    /// Code point ranges the font provides glyphs for.
    fn coverage_ranges(&self) -> Result<Vec<CoverageRange>>;

    /// Cell extent of `ch` at `pixel_size`.
    fn measure(&self, pixel_size: f32, ch: char) -> Result<GlyphExtent>;

    /// Draws `ch` at `pixel_size` with the cell's top-left corner at (`x`, `y`).
    fn rasterize(&self, pixel_size: f32, ch: char, target: &mut CoverageBitmap, x: u32, y: u32) -> Result<()>;
}
