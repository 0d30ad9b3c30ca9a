//! [`GlyphRasterizer`] built on ab_glyph outlines.

use super::{ranges_from_code_points, CoverageBitmap, CoverageRange, FontDatabase, FontSpec, GlyphExtent, GlyphRasterizer, Quality};
use crate::error::{RenderError, Result};
use ab_glyph::{point, Font, FontArc, FontVec, PxScale, ScaleFont};
use tracing::debug;

pub struct AbGlyphRasterizer {
    font: FontArc,
    quality: Quality,
}

impl AbGlyphRasterizer {
    /// Parse face `index` of a font file.
    pub fn from_vec(data: Vec<u8>, index: u32, quality: Quality) -> Result<Self> {
        let font = FontVec::try_from_vec_and_index(data, index)
            .map_err(|e| RenderError::RasterizerFailure(format!("invalid font data: {}", e)))?;
        Ok(Self {
            font: FontArc::new(font),
            quality,
        })
    }

    /// Look up the face for `spec` in `db` and load it.
    pub fn from_database(db: &FontDatabase, spec: &FontSpec) -> Result<Self> {
        let (data, index) = db.resolve(spec)?;
        debug!("Loading '{}' face {} ({} bytes)", spec.family, index, data.len());
        Self::from_vec(data.as_ref().clone(), index, spec.quality)
    }

    fn check_size(pixel_size: f32) -> Result<PxScale> {
        if pixel_size.is_finite() && pixel_size > 0.0 {
            Ok(PxScale::from(pixel_size))
        } else {
            Err(RenderError::RasterizerFailure(format!("invalid pixel size {}", pixel_size)))
        }
    }
}

impl GlyphRasterizer for AbGlyphRasterizer {
    fn coverage_ranges(&self) -> Result<Vec<CoverageRange>> {
        let points: Vec<u32> = self
            .font
            .codepoint_ids()
            .filter(|(id, _)| id.0 != 0)
            .map(|(_, ch)| ch as u32)
            .collect();
        if points.is_empty() {
            return Err(RenderError::RasterizerFailure("font maps no code points".into()));
        }
        Ok(ranges_from_code_points(points))
    }

    fn measure(&self, pixel_size: f32, ch: char) -> Result<GlyphExtent> {
        let scaled = self.font.as_scaled(Self::check_size(pixel_size)?);
        let advance = scaled.h_advance(scaled.glyph_id(ch));
        if !advance.is_finite() {
            return Err(RenderError::RasterizerFailure(format!("no advance for {:?}", ch)));
        }
        Ok(GlyphExtent {
            width: advance.max(0.0).ceil() as u32,
            height: (scaled.ascent() - scaled.descent()).ceil() as u32,
        })
    }

    fn rasterize(&self, pixel_size: f32, ch: char, target: &mut CoverageBitmap, x: u32, y: u32) -> Result<()> {
        let scale = Self::check_size(pixel_size)?;
        let scaled = self.font.as_scaled(scale);
        let baseline = point(x as f32, y as f32 + scaled.ascent());
        let glyph = scaled.glyph_id(ch).with_scale_and_position(scale, baseline);

        // Whitespace has no outline.
        if let Some(outlined) = scaled.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            let quality = self.quality;
            outlined.draw(|gx, gy, coverage| {
                target.put(
                    bounds.min.x as i32 + gx as i32,
                    bounds.min.y as i32 + gy as i32,
                    quality.coverage(coverage),
                );
            });
        }
        Ok(())
    }
}
