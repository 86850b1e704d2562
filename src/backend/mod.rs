// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: device and presentation, GPU memory,
// acceleration structures and the ray tracing pipeline.

pub mod acceleration;
pub mod buffer;
pub mod commands;
pub mod deletion_queue;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod sbt;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
