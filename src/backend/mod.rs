// Backend module - Vulkan plumbing for the triangle
//
// Design: Thin wrapper around ash, one file per Vulkan concern

pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use pipeline::GraphicsPipeline;
pub use swapchain::Swapchain;
pub use sync::{FrameOutcome, FrameScheduler, FrameSync, FrameTarget};
