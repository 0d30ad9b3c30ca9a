//! General-purpose RGBA image atlas.

use super::ShelfAllocator;
use crate::config::AtlasConfig;
use crate::device::{DeviceContext, Resettable, TextureFormat, TextureHandle};
use crate::error::{RenderError, Result};
use crate::types::UvRect;
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Packs keyed RGBA images into a single fixed-size BGRA texture.
///
/// A host copy of the packed pixels is kept so the texture can be rebuilt
/// after a device reset without repacking.
pub struct TextureAtlas {
    device: DeviceContext,
    texture: Option<TextureHandle>,
    shelf: ShelfAllocator,
    entries: HashMap<u32, UvRect>,
    pixels: Vec<u8>,
}

impl TextureAtlas {
    pub fn new(device: DeviceContext, width: u32, height: u32) -> Result<Self> {
        let texture = device.lock().create_texture(width, height, TextureFormat::Bgra8)?;
        info!("Created {}x{} texture atlas", width, height);
        Ok(Self {
            device,
            texture: Some(texture),
            shelf: ShelfAllocator::new(width, height, 0),
            entries: HashMap::new(),
            pixels: vec![0; width as usize * height as usize * 4],
        })
    }

    pub fn from_config(device: DeviceContext, config: &AtlasConfig) -> Result<Self> {
        Self::new(device, config.width, config.height)
    }

    /// Packs a `width` x `height` RGBA image and records its UV rectangle under `key`.
    ///
    /// Nothing changes when the data size is wrong or the image does not fit.
    /// Re-adding an existing key packs the new image and repoints the key.
    pub fn append(&mut self, key: u32, width: u32, height: u32, rgba: &[u8]) -> Result<UvRect> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(RenderError::DataSizeMismatch {
                expected,
                actual: rgba.len(),
            });
        }
        let texture = self.texture.ok_or(RenderError::DeviceUnavailable)?;

        let mut shelf = self.shelf.clone();
        let (x, y) = shelf
            .allocate(width, height)
            .ok_or(RenderError::AtlasExhausted { width, height })?;

        let bgra = rgba_to_bgra(rgba);
        self.device.lock().write_texture(texture, x, y, width, height, &bgra)?;

        let (atlas_w, atlas_h) = self.shelf.dimensions();
        let stride = atlas_w as usize * 4;
        let row_bytes = width as usize * 4;
        if row_bytes > 0 {
            for (row, src) in bgra.chunks_exact(row_bytes).enumerate() {
                let start = (y as usize + row) * stride + x as usize * 4;
                self.pixels[start..start + row_bytes].copy_from_slice(src);
            }
        }

        self.shelf = shelf;
        let uv = UvRect::from_region(x, y, width, height, atlas_w, atlas_h);
        self.entries.insert(key, uv);
        debug!("Packed {}x{} image {} at ({}, {})", width, height, key, x, y);
        Ok(uv)
    }

    pub fn append_image(&mut self, key: u32, image: &image::RgbaImage) -> Result<UvRect> {
        self.append(key, image.width(), image.height(), image.as_raw())
    }

    /// Decodes an image file and packs it under `key`.
    pub fn append_image_file(&mut self, key: u32, path: impl AsRef<Path>) -> anyhow::Result<UvRect> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("Failed to decode image {}", path.display()))?
            .to_rgba8();
        self.append_image(key, &image)
            .with_context(|| format!("Failed to pack image {}", path.display()))
    }

    /// UV rectangle for `key`, or [`UvRect::EMPTY`] when unknown.
    pub fn coords(&self, key: u32) -> UvRect {
        self.entries.get(&key).copied().unwrap_or(UvRect::EMPTY)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.shelf.dimensions()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Swaps the red and blue channels of tightly packed RGBA pixels.
fn rgba_to_bgra(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len());
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
    out
}

impl Resettable for TextureAtlas {
    fn pre_reset(&mut self) {
        if let Some(texture) = self.texture.take() {
            self.device.lock().release_texture(texture);
        }
    }

    fn post_reset(&mut self) -> Result<()> {
        if self.texture.is_some() {
            return Ok(());
        }
        let (width, height) = self.shelf.dimensions();
        let mut device = self.device.lock();
        let texture = device.create_texture(width, height, TextureFormat::Bgra8)?;
        if let Err(e) = device.write_texture(texture, 0, 0, width, height, &self.pixels) {
            device.release_texture(texture);
            return Err(e);
        }
        drop(device);

        self.texture = Some(texture);
        info!("Restored {}x{} texture atlas with {} entries", width, height, self.entries.len());
        Ok(())
    }
}

impl Drop for TextureAtlas {
    fn drop(&mut self) {
        self.pre_reset();
    }
}
