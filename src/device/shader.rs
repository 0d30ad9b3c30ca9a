//! Shader stage sources and their translation to WGSL.

use anyhow::{anyhow, Result};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};

/// Shader source with language specification.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// GLSL source; the entry point is `main`.
    Glsl(String),
    /// WGSL source; the entry point is `vs_main` or `fs_main` depending on stage.
    Wgsl(String),
}

/// Which programmable stage a shader replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    fn naga_stage(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Pixel => naga::ShaderStage::Fragment,
        }
    }
}

/// Validated WGSL plus the entry point to bind.
#[derive(Debug, Clone)]
pub(crate) struct TranslatedShader {
    pub wgsl: String,
    pub entry_point: &'static str,
}

/// Parses and validates `source`, converting GLSL to WGSL.
pub(crate) fn translate(stage: ShaderStage, source: &ShaderSource) -> Result<TranslatedShader> {
    match source {
        ShaderSource::Glsl(glsl) => Ok(TranslatedShader {
            wgsl: glsl_to_wgsl(stage, glsl)?,
            entry_point: "main",
        }),
        ShaderSource::Wgsl(wgsl) => {
            let entry_point = match stage {
                ShaderStage::Vertex => "vs_main",
                ShaderStage::Pixel => "fs_main",
            };
            validate_wgsl(wgsl, stage, entry_point)?;
            Ok(TranslatedShader {
                wgsl: wgsl.clone(),
                entry_point,
            })
        }
    }
}

fn glsl_to_wgsl(stage: ShaderStage, glsl: &str) -> Result<String> {
    let mut frontend = Frontend::default();
    let options = Options::from(stage.naga_stage());
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| anyhow!("GLSL parse error: {:?}", e))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| anyhow!("Shader validation error: {:?}", e))?;
    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| anyhow!("WGSL generation error: {:?}", e))
}

fn validate_wgsl(wgsl: &str, stage: ShaderStage, entry_point: &str) -> Result<()> {
    let module = naga::front::wgsl::parse_str(wgsl).map_err(|e| anyhow!("WGSL parse error: {:?}", e))?;

    let has_entry = module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage.naga_stage());
    if !has_entry {
        return Err(anyhow!("missing {:?} entry point `{}`", stage, entry_point));
    }

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| anyhow!("Shader validation error: {:?}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINTED_PIXEL_STAGE: &str = r#"
@fragment
fn fs_main(@location(0) color: vec4<f32>, @location(1) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(color.rgb * 0.5, color.a);
}
"#;

    #[test]
    fn test_wgsl_pixel_stage_validates() {
        let shader = translate(ShaderStage::Pixel, &ShaderSource::Wgsl(TINTED_PIXEL_STAGE.into())).unwrap();
        assert_eq!(shader.entry_point, "fs_main");
    }

    #[test]
    fn test_wgsl_stage_mismatch_is_rejected() {
        let result = translate(ShaderStage::Vertex, &ShaderSource::Wgsl(TINTED_PIXEL_STAGE.into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_glsl_fragment_translates() {
        let glsl = r#"#version 450
layout(location = 0) in vec4 v_color;
layout(location = 0) out vec4 o_color;
void main() {
    o_color = v_color;
}
"#;
        let shader = translate(ShaderStage::Pixel, &ShaderSource::Glsl(glsl.into())).unwrap();
        assert_eq!(shader.entry_point, "main");
        assert!(shader.wgsl.contains("@fragment"));
    }

    #[test]
    fn test_broken_glsl_reports_error() {
        let result = translate(ShaderStage::Pixel, &ShaderSource::Glsl("void main( {".into()));
        assert!(result.is_err());
    }
}
