//! Petal: batched 2D drawing on top of a pluggable render device
//!
//! Shapes, images and text are appended to a [`CommandQueue`], which merges
//! consecutive same-texture draws into single indexed batches and replays them
//! on a [`RenderDevice`] at flush time. Glyphs and images come from
//! pre-packed texture atlases.

pub mod atlas;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod font;
pub mod queue;
pub mod types;

pub use atlas::{GlyphAtlas, TextureAtlas};
pub use config::Config;
pub use device::{DeviceContext, HeadlessDevice, RenderDevice, Resettable, WgpuDevice};
pub use error::{RenderError, Result};
pub use font::{FontDatabase, FontSpec, Quality};
pub use queue::{CommandQueue, DoubleBufferedQueue, DrawCommand, TextAlign};
pub use types::{Color, Point, UvRect, Vertex};

/// Routes `tracing` output through the test harness.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
