//! GPU error types.

use std::panic::Location;

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A named Vulkan call failed; carries where it was issued from.
    #[error("{call} failed with {result} at {location}")]
    Call {
        call: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    },

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Device lacks hardware ray tracing.
    #[error("Hardware ray tracing unsupported: {0}")]
    RayTracingUnsupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// The underlying Vulkan result, if this error came from the API.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan(result) | Self::Call { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// Whether the device was lost. Nothing can be recovered after this.
    pub fn is_device_lost(&self) -> bool {
        self.vk_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

/// Attach the call name and caller location to a raw Vulkan result.
pub trait VkResultExt<T> {
    /// Convert to [`GpuError::Call`], recording the caller's source location.
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    #[track_caller]
    fn call(self, call: &'static str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|result| GpuError::Call {
            call,
            result,
            location,
        })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_records_location_and_code() {
        let raw: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let line = line!() + 1;
        let err = raw.call("vkCreateBuffer").unwrap_err();
        match &err {
            GpuError::Call {
                call,
                result,
                location,
            } => {
                assert_eq!(*call, "vkCreateBuffer");
                assert_eq!(*result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                assert_eq!(location.line(), line);
                assert!(location.file().ends_with("error.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("vkCreateBuffer"));
        assert!(!err.is_device_lost());
    }

    #[test]
    fn device_lost_detection() {
        assert!(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        let raw: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        assert!(raw.call("vkQueueSubmit").unwrap_err().is_device_lost());
        assert!(!GpuError::NoSuitableDevice.is_device_lost());
    }
}
