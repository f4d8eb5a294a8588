// Vulkan backend: device ownership, synchronization, resources, pipelines.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{DefaultBuffer, UploadRing};
pub use device::RenderDevice;
pub use pipeline::{PipelineKind, Pipelines};
pub use swapchain::SwapchainTargets;
pub use texture::{SlotMap, Texture2D};
