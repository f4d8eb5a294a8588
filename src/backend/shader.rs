// Shader blob loading
//
// Shaders are compiled offline (glslc, see build.rs) and consumed here as
// opaque SPIR-V binaries. The only inspection done is a sanity check of the
// container: word-aligned length and the SPIR-V magic number.

use ash::vk;
use std::path::Path;

use super::RenderDevice;
use crate::error::{RenderError, Result, VkResultExt};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Validate a compiled blob and repack it into SPIR-V words.
pub fn parse_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(RenderError::Shader {
            path: path.to_path_buf(),
            reason: format!("blob length {} is not a whole number of words", bytes.len()),
        });
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(RenderError::Shader {
            path: path.to_path_buf(),
            reason: format!("bad SPIR-V magic {:#010x}", words[0]),
        });
    }

    Ok(words)
}

/// Load a compiled shader from disk and create a shader module from it.
pub fn load_shader_module(device: &RenderDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).map_err(|e| RenderError::Shader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let words = parse_spirv(path, &bytes)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
    unsafe { device.device.create_shader_module(&create_info, None) }
        .api("vkCreateShaderModule")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_blob() {
        let bytes = [
            SPIRV_MAGIC.to_le_bytes().as_slice(),
            &[0x00, 0x00, 0x01, 0x00],
        ]
        .concat();
        let words = parse_spirv(Path::new("test.spv"), &bytes).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words.len(), 2);
    }

    #[test]
    fn rejects_misaligned_blob() {
        let err = parse_spirv(Path::new("test.spv"), &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RenderError::Shader { .. }));
    }

    #[test]
    fn rejects_wrong_magic() {
        let err = parse_spirv(Path::new("test.spv"), &[0xff; 8]).unwrap_err();
        assert!(matches!(err, RenderError::Shader { .. }));
    }

    #[test]
    fn rejects_empty_blob() {
        assert!(parse_spirv(Path::new("test.spv"), &[]).is_err());
    }
}
