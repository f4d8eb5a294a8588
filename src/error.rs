// Error taxonomy for the renderer
//
// Policy is fail-fast: every variant here propagates up to main and aborts
// startup or the frame loop. The one locally recovered condition (a material
// referencing an unknown texture) never becomes an error at all; it resolves
// to the fallback texture slot instead.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A raw Vulkan call returned a failure code.
    #[error("{call} failed: {result}")]
    Api {
        call: &'static str,
        result: vk::Result,
    },

    /// No physical device at all, not even a software rasterizer.
    #[error("no Vulkan-capable adapter found")]
    NoAdapter,

    #[error("failed to load the Vulkan library: {0}")]
    Loader(String),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("shader {path:?}: {reason}")]
    Shader { path: PathBuf, reason: String },

    #[error("scene {path:?}: {reason}")]
    SceneLoad { path: PathBuf, reason: String },

    /// A submesh draw range falls outside the global index buffer.
    #[error(
        "submesh {submesh}: index range [{start}, {start}+{count}) exceeds \
         index buffer of {total} indices"
    )]
    SubmeshOutOfBounds {
        submesh: usize,
        start: u32,
        count: u32,
        total: u32,
    },

    /// An index value, after base-vertex adjustment, points past the vertex buffer.
    #[error("submesh {submesh}: resolved index {resolved} exceeds vertex buffer of {total} vertices")]
    IndexOutOfBounds {
        submesh: usize,
        resolved: u64,
        total: u32,
    },

    #[error("refusing to stage an empty byte buffer")]
    EmptyUpload,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// Maps `VkResult`-returning calls into the `Api` variant with the name of
/// the failing call attached.
pub trait VkResultExt<T> {
    fn api(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn api(self, call: &'static str) -> Result<T> {
        self.map_err(|result| RenderError::Api { call, result })
    }
}
