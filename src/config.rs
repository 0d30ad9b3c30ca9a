//! YAML configuration for queues, atlases and fonts.

use crate::font::FontSpec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Initial vertex capacity of each queue.
    pub vertex_capacity: usize,
    /// Initial index capacity of each queue.
    pub index_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            vertex_capacity: 32767,
            index_capacity: 65535,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
        }
    }
}

/// Top-level configuration. Every section may be omitted.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub atlas: AtlasConfig,
    /// Fonts to rasterize up front.
    pub fonts: Vec<FontSpec>,
}

impl Config {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse config")?;
        if let Some(font) = config.fonts.iter().find(|f| f.size == 0) {
            anyhow::bail!("Font '{}' has a zero pixel size", font.family);
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_yaml_str(&content).with_context(|| format!("Invalid config file {:?}", path))?;
        info!("Loaded config from {:?} ({} fonts)", path, config.fonts.len());
        Ok(config)
    }
}
