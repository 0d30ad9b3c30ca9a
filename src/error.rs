//! Error taxonomy shared by the queue, the atlases and the device layer.

use thiserror::Error;

/// Errors surfaced by fallible rendering operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The device is lost, resetting or otherwise not accepting calls.
    #[error("render device unavailable")]
    DeviceUnavailable,

    /// The device refused to create a texture or buffer.
    #[error("device allocation failed: {0}")]
    AllocationFailure(String),

    /// The font rasterizer could not enumerate, measure or draw glyphs.
    #[error("glyph rasterizer failed: {0}")]
    RasterizerFailure(String),

    /// An atlas has no room left for a region of the given size.
    #[error("atlas exhausted: no room for {width}x{height} region")]
    AtlasExhausted { width: u32, height: u32 },

    /// Pixel data length does not match the declared dimensions.
    #[error("pixel data size mismatch: expected {expected} bytes, got {actual}")]
    DataSizeMismatch { expected: usize, actual: usize },

    /// An append was attempted without reserving capacity first.
    #[error("buffer capacity exceeded: {requested} elements requested, {capacity} available")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The device could not compile or validate a shader stage.
    #[error("invalid shader: {0}")]
    InvalidShader(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;
