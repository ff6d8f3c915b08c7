#[cfg(feature = "palcore-vulkan")]
use ash::vk;

/// Result codes surfaced by pipeline objects, queue contexts and memory managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PalError {
    /// A caller-provided size or count does not match what the object holds.
    #[error("invalid value")]
    InvalidValue,
    /// A required output location was not provided.
    #[error("invalid pointer")]
    InvalidPointer,
    /// The requested data was not retained, or the operation does not apply to this object.
    #[error("requested data or operation is unavailable")]
    Unavailable,
    /// The binary or a library to link against is malformed or incompatible.
    #[error("bad pipeline data: {0}")]
    BadPipelineData(&'static str),
    #[error("out of GPU memory")]
    OutOfGpuMemory,
    #[error("GPU memory could not be mapped")]
    NotMappable,
    #[error("ran out of slots")]
    OutOfSlots,
    /// The handle refers to an object that was already destroyed.
    #[error("handle refers to a destroyed object")]
    StaleHandle,
    /// A previous failure left the object unusable; it must be destroyed.
    #[error("object was left in an indeterminate state by an earlier failure: {0}")]
    Indeterminate(&'static str),
    #[cfg(feature = "palcore-vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

/// Convenient crate-wide result type.
pub type Result<T, E = PalError> = std::result::Result<T, E>;

#[cfg(feature = "palcore-vulkan")]
impl From<vk::Result> for PalError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => PalError::OutOfGpuMemory,
            vk::Result::ERROR_MEMORY_MAP_FAILED => PalError::NotMappable,
            other => PalError::Vulkan(other),
        }
    }
}
