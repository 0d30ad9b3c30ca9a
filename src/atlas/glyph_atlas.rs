//! Whole-font glyph atlas with iterative size fitting.
//!
//! Every code point the font advertises is rasterized once into a single
//! square texture. The side starts at 128 and doubles until everything fits.
//! If that would exceed the device's texture limit, the side is pinned to the
//! limit and the glyph size shrinks geometrically instead; layout code divides
//! by [`GlyphAtlas::scale`] so text keeps its requested size on screen.

use super::ShelfAllocator;
use crate::device::{DeviceContext, Resettable, TextureFormat, TextureHandle};
use crate::error::{RenderError, Result};
use crate::font::{AbGlyphRasterizer, CoverageBitmap, FontDatabase, FontSpec, GlyphExtent, GlyphRasterizer};
use crate::types::{Point, UvRect};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const INITIAL_SIDE: u32 = 128;
const SHRINK_FACTOR: f32 = 0.9;
/// Below this scale fitting is abandoned.
const MIN_SCALE: f32 = 0.01;
/// Horizontal padding per glyph side, relative to the height of 'x'.
const SPACING_RATIO: f32 = 0.3;
const ROW_GAP: u32 = 1;

/// Where one glyph cell landed during a packing pass.
struct Placement {
    ch: char,
    x: u32,
    y: u32,
    extent: GlyphExtent,
}

struct Packing {
    spacing: u32,
    placements: Vec<Placement>,
    skipped: usize,
}

/// Result of the size-fitting search.
struct Fit {
    side: u32,
    scale: f32,
    packing: Packing,
}

/// Pre-rasterized glyphs for one font face at one size.
pub struct GlyphAtlas {
    device: DeviceContext,
    rasterizer: Box<dyn GlyphRasterizer + Send>,
    spec: FontSpec,
    texture: Option<TextureHandle>,
    glyphs: HashMap<char, UvRect>,
    width: u32,
    height: u32,
    spacing: u32,
    scale: f32,
    line_height: f32,
}

impl GlyphAtlas {
    /// Rasterize the full character set of `rasterizer` for `spec`.
    pub fn create<R>(device: DeviceContext, rasterizer: R, spec: FontSpec) -> Result<Self>
    where
        R: GlyphRasterizer + Send + 'static,
    {
        let mut atlas = Self {
            device,
            rasterizer: Box::new(rasterizer),
            spec,
            texture: None,
            glyphs: HashMap::new(),
            width: 0,
            height: 0,
            spacing: 0,
            scale: 1.0,
            line_height: 0.0,
        };
        atlas.build()?;
        Ok(atlas)
    }

    /// Resolve `spec` against a font database and build the atlas with ab_glyph.
    pub fn create_from_database(device: DeviceContext, fonts: &FontDatabase, spec: FontSpec) -> Result<Self> {
        let rasterizer = AbGlyphRasterizer::from_database(fonts, &spec)?;
        Self::create(device, rasterizer, spec)
    }

    /// Build one atlas per entry of `specs`, in order, stopping at the first failure.
    pub fn create_all<R, F>(device: &DeviceContext, specs: &[FontSpec], mut rasterizer_for: F) -> Result<Vec<Self>>
    where
        R: GlyphRasterizer + Send + 'static,
        F: FnMut(&FontSpec) -> Result<R>,
    {
        specs
            .iter()
            .map(|spec| Self::create(device.clone(), rasterizer_for(spec)?, spec.clone()))
            .collect()
    }

    /// [`GlyphAtlas::create_all`] with ab_glyph faces resolved from `fonts`,
    /// typically for the `fonts` section of a [`crate::Config`].
    pub fn create_all_from_database(
        device: &DeviceContext,
        fonts: &FontDatabase,
        specs: &[FontSpec],
    ) -> Result<Vec<Self>> {
        Self::create_all(device, specs, |spec| AbGlyphRasterizer::from_database(fonts, spec))
    }

    fn build(&mut self) -> Result<()> {
        let start = std::time::Instant::now();
        let chars: Vec<char> = self
            .rasterizer
            .coverage_ranges()
            .map_err(as_rasterizer_failure)?
            .iter()
            .flat_map(|range| range.chars())
            .collect();

        let max_side = self.device.lock().max_texture_dimension();
        let fit = self.fit(&chars, max_side)?;
        let pixel_size = self.spec.size as f32 * fit.scale;
        let spacing = fit.packing.spacing;

        let mut bitmap = CoverageBitmap::new(fit.side, fit.side);
        let mut glyphs = HashMap::with_capacity(fit.packing.placements.len());
        for p in &fit.packing.placements {
            self.rasterizer
                .rasterize(pixel_size, p.ch, &mut bitmap, p.x + spacing, p.y)
                .map_err(as_rasterizer_failure)?;
            let uv = UvRect::from_region(p.x, p.y, p.extent.width + 2 * spacing, p.extent.height, fit.side, fit.side);
            glyphs.insert(p.ch, uv);
        }

        let texels = bitmap.to_bgra4();
        let texture = {
            let mut device = self.device.lock();
            let texture = device.create_texture(fit.side, fit.side, TextureFormat::Bgra4)?;
            if let Err(e) = device.write_texture(texture, 0, 0, fit.side, fit.side, &texels) {
                device.release_texture(texture);
                return Err(e);
            }
            texture
        };

        if fit.packing.skipped > 0 {
            warn!("Skipped {} glyphs of '{}' that failed to measure", fit.packing.skipped, self.spec.family);
        }

        if let Some(old) = self.texture.replace(texture) {
            self.device.lock().release_texture(old);
        }
        self.glyphs = glyphs;
        self.width = fit.side;
        self.height = fit.side;
        self.spacing = spacing;
        self.scale = fit.scale;
        self.line_height = self.reference_line_height();

        info!(
            "Built {}x{} glyph atlas for '{}' {}px: {} glyphs, scale {:.3}, in {:?}",
            fit.side,
            fit.side,
            self.spec.family,
            self.spec.size,
            self.glyphs.len(),
            fit.scale,
            start.elapsed()
        );
        Ok(())
    }

    /// Finds the smallest power-of-two side, or the largest scale at the
    /// device limit, that holds every glyph.
    fn fit(&self, chars: &[char], max_side: u32) -> Result<Fit> {
        let base_size = self.spec.size as f32;

        let mut side = INITIAL_SIDE;
        let mut packing = self.pack(chars, base_size, side)?;
        while packing.is_none() {
            side *= 2;
            if side > max_side {
                break;
            }
            packing = self.pack(chars, base_size, side)?;
        }

        if side <= max_side {
            if let Some(packing) = packing {
                return Ok(Fit { side, scale: 1.0, packing });
            }
        }

        let mut scale = max_side as f32 / side as f32;
        let side = max_side;
        loop {
            if scale < MIN_SCALE {
                return Err(RenderError::AllocationFailure(format!(
                    "glyphs of '{}' do not fit a {}x{} texture",
                    self.spec.family, side, side
                )));
            }
            if let Some(packing) = self.pack(chars, base_size * scale, side)? {
                debug!("Glyph atlas for '{}' shrunk to scale {:.3}", self.spec.family, scale);
                return Ok(Fit { side, scale, packing });
            }
            scale *= SHRINK_FACTOR;
        }
    }

    /// Dry-run shelf walk at `pixel_size`. `None` means the glyphs overflow.
    fn pack(&self, chars: &[char], pixel_size: f32, side: u32) -> Result<Option<Packing>> {
        let reference = self
            .rasterizer
            .measure(pixel_size, 'x')
            .map_err(as_rasterizer_failure)?;
        let spacing = (reference.height as f32 * SPACING_RATIO).ceil() as u32;

        let mut shelf = ShelfAllocator::new(side, side, ROW_GAP);
        let mut placements = Vec::with_capacity(chars.len());
        let mut skipped = 0;

        for &ch in chars {
            let extent = match self.rasterizer.measure(pixel_size, ch) {
                Ok(extent) => extent,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            match shelf.allocate(extent.width + 2 * spacing, extent.height) {
                Some((x, y)) => placements.push(Placement { ch, x, y, extent }),
                None => return Ok(None),
            }
        }

        Ok(Some(Packing {
            spacing,
            placements,
            skipped,
        }))
    }

    fn reference_line_height(&self) -> f32 {
        let uv = [' ', 'A']
            .iter()
            .find_map(|c| self.glyphs.get(c))
            .or_else(|| self.glyphs.values().next())
            .copied()
            .unwrap_or(UvRect::EMPTY);
        uv.height() * self.height as f32 / self.scale
    }

    /// UV rectangle of `ch`, or [`UvRect::EMPTY`] when the font lacks it.
    pub fn coords(&self, ch: char) -> UvRect {
        self.glyphs.get(&ch).copied().unwrap_or(UvRect::EMPTY)
    }

    /// On-screen size of a glyph quad, padding included, at the requested font size.
    pub fn quad_size(&self, uv: UvRect) -> Point {
        Point::new(
            uv.width() * self.width as f32 / self.scale,
            uv.height() * self.height as f32 / self.scale,
        )
    }

    /// Horizontal padding on each side of a glyph quad, in screen pixels.
    pub fn padding(&self) -> f32 {
        self.spacing as f32 / self.scale
    }

    /// Pen advance for `ch` in screen pixels; zero for glyphs the atlas lacks.
    pub fn advance(&self, ch: char) -> f32 {
        match self.glyphs.get(&ch) {
            Some(uv) if !uv.is_empty() => self.quad_size(*uv).x - 2.0 * self.padding(),
            _ => 0.0,
        }
    }

    /// Size of the block `text` occupies when laid out by the queue.
    pub fn text_extent(&self, text: &str) -> Point {
        let mut width: f32 = 0.0;
        let mut row_width: f32 = 0.0;
        let mut height = self.line_height;

        for ch in text.chars() {
            if ch == '\n' {
                row_width = 0.0;
                height += self.line_height;
            } else if ch >= ' ' {
                row_width += self.advance(ch);
                width = width.max(row_width);
            }
        }

        Point::new(width, height)
    }

    pub fn line_height(&self) -> f32 {
        self.line_height
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Inter-glyph padding in atlas pixels.
    pub fn spacing(&self) -> u32 {
        self.spacing
    }

    /// Ratio of rasterized to requested glyph size, `<= 1.0`.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn spec(&self) -> &FontSpec {
        &self.spec
    }

    pub fn glyph_count(&self) -> usize {
        self.glyphs.len()
    }
}

fn as_rasterizer_failure(e: RenderError) -> RenderError {
    match e {
        RenderError::RasterizerFailure(_) => e,
        other => RenderError::RasterizerFailure(other.to_string()),
    }
}

impl Resettable for GlyphAtlas {
    fn pre_reset(&mut self) {
        if let Some(texture) = self.texture.take() {
            self.device.lock().release_texture(texture);
        }
    }

    fn post_reset(&mut self) -> Result<()> {
        if self.texture.is_some() {
            return Ok(());
        }
        self.build()
    }
}

impl Drop for GlyphAtlas {
    fn drop(&mut self) {
        self.pre_reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::font::CoverageRange;
    use std::sync::{Arc, Mutex};

    /// Rasterizer with glyphs half as wide as they are tall.
    pub(crate) struct BoxRasterizer {
        pub ranges: Vec<CoverageRange>,
        /// When set, extents ignore the requested size.
        pub fixed: Option<GlyphExtent>,
        pub unmeasurable: Option<char>,
        pub fail_draw: bool,
    }

    impl BoxRasterizer {
        pub(crate) fn ascii() -> Self {
            Self {
                ranges: vec![CoverageRange { first: 0x20, count: 95 }],
                fixed: None,
                unmeasurable: None,
                fail_draw: false,
            }
        }
    }

    impl GlyphRasterizer for BoxRasterizer {
        fn coverage_ranges(&self) -> Result<Vec<CoverageRange>> {
            if self.ranges.is_empty() {
                return Err(RenderError::RasterizerFailure("no ranges".into()));
            }
            Ok(self.ranges.clone())
        }

        fn measure(&self, pixel_size: f32, ch: char) -> Result<GlyphExtent> {
            if self.unmeasurable == Some(ch) {
                return Err(RenderError::RasterizerFailure(format!("cannot measure {:?}", ch)));
            }
            Ok(self.fixed.unwrap_or(GlyphExtent {
                width: (pixel_size * 0.5).ceil() as u32,
                height: pixel_size.ceil() as u32,
            }))
        }

        fn rasterize(&self, pixel_size: f32, ch: char, target: &mut CoverageBitmap, x: u32, y: u32) -> Result<()> {
            if self.fail_draw {
                return Err(RenderError::RasterizerFailure("draw failed".into()));
            }
            if ch == ' ' {
                return Ok(());
            }
            let extent = self.measure(pixel_size, ch)?;
            for dy in 0..extent.height {
                for dx in 0..extent.width {
                    target.put((x + dx) as i32, (y + dy) as i32, 255);
                }
            }
            Ok(())
        }
    }

    fn headless(max: u32) -> (Arc<Mutex<HeadlessDevice>>, DeviceContext) {
        crate::init_tracing();
        let device = Arc::new(Mutex::new(HeadlessDevice::new(max)));
        let ctx = DeviceContext::from_shared(device.clone());
        (device, ctx)
    }

    #[test]
    fn test_fits_at_full_scale_with_power_of_two_side() {
        let (device, ctx) = headless(4096);
        let atlas = GlyphAtlas::create(ctx, BoxRasterizer::ascii(), FontSpec::new("Box", 16)).unwrap();

        // cells are 8 + 2 * 5 wide and 16 tall: 14 rows at 128 overflow, 7 rows at 256 fit
        assert_eq!(atlas.width(), 256);
        assert_eq!(atlas.height(), 256);
        assert_eq!(atlas.scale(), 1.0);
        assert_eq!(atlas.spacing(), 5);
        assert_eq!(atlas.glyph_count(), 95);

        let texture = atlas.texture().unwrap();
        let device = device.lock().unwrap();
        assert_eq!(device.texture_format(texture), Some(TextureFormat::Bgra4));
        assert_eq!(device.texture_size(texture), Some((256, 256)));
    }

    #[test]
    fn test_shrinks_when_side_exceeds_device_limit() {
        let (_device, ctx) = headless(128);
        let rasterizer = BoxRasterizer {
            ranges: vec![CoverageRange { first: 0x21, count: 68 }],
            ..BoxRasterizer::ascii()
        };
        let atlas = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 32)).unwrap();

        // 256 is past the limit, so fitting starts at 128 / 256. At 16px only 49
        // cells fit, at 14.4px 56, and at 12.96px 72 cells of 15x13 fit.
        assert_eq!(atlas.width(), 128);
        assert_eq!(atlas.scale(), 0.5 * SHRINK_FACTOR * SHRINK_FACTOR);
        assert_eq!(atlas.spacing(), 4);
        assert_eq!(atlas.glyph_count(), 68);

        let a = atlas.coords('A');
        assert_eq!(a.width() * 128.0, 15.0);
        assert_eq!(a.height() * 128.0, 13.0);
        // layout is scaled back to the requested size
        assert!((atlas.line_height() - 13.0 / atlas.scale()).abs() < 1e-3);
    }

    #[test]
    fn test_create_all_builds_each_spec_in_order() {
        let (device, ctx) = headless(4096);
        let specs = [FontSpec::new("Small", 8), FontSpec::new("Large", 16)];
        let atlases = GlyphAtlas::create_all(&ctx, &specs, |_| Ok(BoxRasterizer::ascii())).unwrap();

        assert_eq!(atlases.len(), 2);
        assert_eq!(atlases[0].spec().family, "Small");
        assert_eq!(atlases[1].spec().family, "Large");
        assert_eq!(atlases[1].line_height(), 16.0);
        assert_eq!(device.lock().unwrap().live_textures(), 2);
    }

    #[test]
    fn test_create_all_stops_at_first_failure() {
        let (device, ctx) = headless(4096);
        let specs = [FontSpec::new("Good", 8), FontSpec::new("Broken", 8)];
        let result = GlyphAtlas::create_all(&ctx, &specs, |spec| {
            Ok(BoxRasterizer {
                fail_draw: spec.family == "Broken",
                ..BoxRasterizer::ascii()
            })
        });

        assert!(matches!(result, Err(RenderError::RasterizerFailure(_))));
        // the atlas built before the failure was dropped with the error
        assert_eq!(device.lock().unwrap().live_textures(), 0);
    }

    #[test]
    fn test_create_all_from_empty_database() {
        let (_device, ctx) = headless(4096);
        let fonts = FontDatabase::from_font_data(Vec::new());

        let none = GlyphAtlas::create_all_from_database(&ctx, &fonts, &[]).unwrap();
        assert!(none.is_empty());

        let result = GlyphAtlas::create_all_from_database(&ctx, &fonts, &[FontSpec::new("Verdana", 12)]);
        assert!(matches!(result, Err(RenderError::RasterizerFailure(_))));
    }

    #[test]
    fn test_fitting_gives_up_when_nothing_fits() {
        let (device, ctx) = headless(128);
        let rasterizer = BoxRasterizer {
            fixed: Some(GlyphExtent { width: 500, height: 500 }),
            ..BoxRasterizer::ascii()
        };
        let result = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 16));
        assert!(matches!(result, Err(RenderError::AllocationFailure(_))));
        assert_eq!(device.lock().unwrap().live_textures(), 0);
    }

    #[test]
    fn test_uvs_are_disjoint_cells() {
        let (_device, ctx) = headless(4096);
        let atlas = GlyphAtlas::create(ctx, BoxRasterizer::ascii(), FontSpec::new("Box", 16)).unwrap();

        let uvs: Vec<UvRect> = (0x20u8..0x7f).map(|b| atlas.coords(b as char)).collect();
        for (i, a) in uvs.iter().enumerate() {
            assert!(!a.is_empty());
            assert!(a.0.iter().all(|c| (0.0..=1.0).contains(c)));
            for b in &uvs[i + 1..] {
                let disjoint = a.u1() <= b.u0() || b.u1() <= a.u0() || a.v1() <= b.v0() || b.v1() <= a.v0();
                assert!(disjoint);
            }
        }
        let a = atlas.coords('A');
        assert_eq!(a.width() * 256.0, 18.0);
        assert_eq!(a.height() * 256.0, 16.0);
    }

    #[test]
    fn test_coverage_becomes_white_with_alpha() {
        let (device, ctx) = headless(4096);
        let atlas = GlyphAtlas::create(ctx, BoxRasterizer::ascii(), FontSpec::new("Box", 16)).unwrap();

        let uv = atlas.coords('A');
        let x = (uv.u0() * 256.0) as usize + atlas.spacing() as usize;
        let y = (uv.v0() * 256.0) as usize;
        let device = device.lock().unwrap();
        let pixels = device.texture_pixels(atlas.texture().unwrap()).unwrap();
        let at = |x: usize, y: usize| u16::from_le_bytes([pixels[(y * 256 + x) * 2], pixels[(y * 256 + x) * 2 + 1]]);
        assert_eq!(at(x, y), 0xffff);
        // left padding is untouched
        assert_eq!(at(x - 1, y), 0);
    }

    #[test]
    fn test_unmeasurable_glyph_is_skipped() {
        let (_device, ctx) = headless(4096);
        let rasterizer = BoxRasterizer {
            unmeasurable: Some('q'),
            ..BoxRasterizer::ascii()
        };
        let atlas = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 16)).unwrap();
        assert_eq!(atlas.coords('q'), UvRect::EMPTY);
        assert_eq!(atlas.advance('q'), 0.0);
        assert_eq!(atlas.glyph_count(), 94);
    }

    #[test]
    fn test_reference_glyph_failure_aborts() {
        let (_device, ctx) = headless(4096);
        let rasterizer = BoxRasterizer {
            unmeasurable: Some('x'),
            ..BoxRasterizer::ascii()
        };
        let result = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 16));
        assert!(matches!(result, Err(RenderError::RasterizerFailure(_))));
    }

    #[test]
    fn test_draw_failure_aborts_without_texture() {
        let (device, ctx) = headless(4096);
        let rasterizer = BoxRasterizer {
            fail_draw: true,
            ..BoxRasterizer::ascii()
        };
        let result = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 16));
        assert!(matches!(result, Err(RenderError::RasterizerFailure(_))));
        assert_eq!(device.lock().unwrap().live_textures(), 0);
    }

    #[test]
    fn test_enumeration_failure_aborts() {
        let (_device, ctx) = headless(4096);
        let rasterizer = BoxRasterizer {
            ranges: Vec::new(),
            ..BoxRasterizer::ascii()
        };
        let result = GlyphAtlas::create(ctx, rasterizer, FontSpec::new("Box", 16));
        assert!(matches!(result, Err(RenderError::RasterizerFailure(_))));
    }

    #[test]
    fn test_text_extent() {
        let (_device, ctx) = headless(4096);
        let atlas = GlyphAtlas::create(ctx, BoxRasterizer::ascii(), FontSpec::new("Box", 16)).unwrap();

        assert_eq!(atlas.advance('A'), 8.0);
        assert_eq!(atlas.text_extent("abc"), Point::new(24.0, 16.0));
        assert_eq!(atlas.text_extent("ab\nabcd\n"), Point::new(32.0, 48.0));
        // control characters and unknown glyphs add nothing
        assert_eq!(atlas.text_extent("a\tb\u{263a}"), Point::new(16.0, 16.0));
        assert_eq!(atlas.text_extent(""), Point::new(0.0, 16.0));
    }

    #[test]
    fn test_reset_rebuilds_identical_layout() {
        let (device, ctx) = headless(4096);
        let mut atlas = GlyphAtlas::create(ctx, BoxRasterizer::ascii(), FontSpec::new("Box", 16)).unwrap();
        let before: Vec<UvRect> = (0x20u8..0x7f).map(|b| atlas.coords(b as char)).collect();

        atlas.reset(true).unwrap();
        assert!(atlas.texture().is_none());
        assert_eq!(device.lock().unwrap().live_textures(), 0);

        atlas.reset(false).unwrap();
        let after: Vec<UvRect> = (0x20u8..0x7f).map(|b| atlas.coords(b as char)).collect();
        assert_eq!(before, after);
        assert!(atlas.texture().is_some());
        assert_eq!(device.lock().unwrap().live_textures(), 1);
    }
}
