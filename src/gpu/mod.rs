//! Pipeline objects, shader libraries and queue contexts, plus the memory
//! managers they allocate through.

pub mod context;
pub mod error;
pub mod library;
pub mod memory;
pub mod null;
pub mod pipeline;
pub mod queue;
pub mod settings;

#[cfg(feature = "palcore-vulkan")]
pub mod vulkan;

pub use context::Context;
pub use error::*;
pub use library::*;
pub use memory::*;
pub use null::{NullAllocationInfo, NullMemoryManager};
pub use pipeline::*;
pub use queue::*;
pub use settings::*;

#[cfg(feature = "palcore-vulkan")]
pub use vulkan::VulkanMemoryManager;
