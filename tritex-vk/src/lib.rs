//! Thin RAII wrappers around Vulkan objects, built on [`ash`], plus the
//! single-frame-in-flight draw loop that drives them.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T>
//! ├── Adapter (enumerated, never destroyed)
//! └── Device
//!     ├── GraphicsQueue / PresentQueue / GraphicsPresentQueue / ...
//!     ├── Memory ← Buffer / Image (bind once)
//!     ├── ImageView / Sampler
//!     ├── DescriptorSetLayout → DescriptorPool → DescriptorSet
//!     ├── RenderPass → Framebuffer
//!     ├── PipelineLayout + ShaderModule → GraphicsPipeline
//!     ├── CommandPool → CommandBuffer
//!     └── Fence / Semaphore
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |
//! | `cmd_*` | records into a raw command buffer         |
//!
//! Every Vulkan status failure surfaces as [`error::ApiError`], which
//! names the failing entry point.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod adapter;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod log;
pub mod memory;
pub mod ownership;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use error::{ApiError, VkResultExt};
pub use raw_window_handle::HandleError as RwhHandleError;
