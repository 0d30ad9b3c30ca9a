//! Rectangle packing into fixed-size textures.
//!
//! Both atlases use the same greedy shelf walk: regions are placed left to
//! right, and a new row starts below the tallest region of the current row
//! once the next region no longer fits horizontally.

mod glyph_atlas;
mod texture_atlas;

pub use glyph_atlas::GlyphAtlas;
pub use texture_atlas::TextureAtlas;

#[cfg(test)]
pub(crate) use glyph_atlas::tests::BoxRasterizer;

/// Row-based shelf allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfAllocator {
    width: u32,
    height: u32,
    /// Empty pixels left between rows.
    row_gap: u32,
    cursor_x: u32,
    cursor_y: u32,
    row_height: u32,
}

impl ShelfAllocator {
    pub fn new(width: u32, height: u32, row_gap: u32) -> Self {
        Self {
            width,
            height,
            row_gap,
            cursor_x: 0,
            cursor_y: 0,
            row_height: 0,
        }
    }

    /// Places a `width` x `height` region, returning its top-left corner.
    ///
    /// On failure the allocator is left exactly as it was.
    pub fn allocate(&mut self, width: u32, height: u32) -> Option<(u32, u32)> {
        if width > self.width {
            return None;
        }

        let (mut x, mut y, mut row_height) = (self.cursor_x, self.cursor_y, self.row_height);

        // Start a new row
        if x + width > self.width {
            y += row_height + self.row_gap;
            x = 0;
            row_height = 0;
        }

        if y + height > self.height {
            return None;
        }

        self.cursor_x = x + width;
        self.cursor_y = y;
        self.row_height = row_height.max(height);
        Some((x, y))
    }

    pub fn reset(&mut self) {
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.row_height = 0;
    }

    pub fn cursor(&self) -> (u32, u32) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn row_height(&self) -> u32 {
        self.row_height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
