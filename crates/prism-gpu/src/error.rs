//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Required instance layers are not supported.
    #[error("Required instance layers are unsupported: {}", .0.join(", "))]
    MissingLayers(Vec<String>),

    /// Required instance or device extensions are not supported.
    #[error("Required extensions are unsupported: {}", .0.join(", "))]
    MissingExtensions(Vec<String>),

    /// The adapter exposes no queue family with graphics support.
    #[error("No graphics-capable queue family found")]
    NoSuitableQueueFamily,

    /// The logical device has not been created yet (or was shut down).
    #[error("Device is not initialized")]
    NotInitialized,

    /// An index-based query or selection was out of range.
    #[error("{what} index {index} is out of range (count {count})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        count: usize,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Resource creation parameters were rejected before reaching the API.
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A synchronization primitive of the wrong kind was passed.
    #[error("Expected a {expected} synchronization primitive")]
    WrongSyncKind { expected: &'static str },

    /// Queue submission failed; the submitted work is lost.
    #[error("Queue submission failed: {0}")]
    Submission(vk::Result),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

impl GpuError {
    /// Shorthand for an out-of-range index error.
    pub fn out_of_range(what: &'static str, index: usize, count: usize) -> Self {
        Self::IndexOutOfRange { what, index, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_extensions_message_names_each_extension() {
        let err = GpuError::MissingExtensions(vec![
            "VK_KHR_surface".to_string(),
            "VK_FAKE_thing".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Required extensions are unsupported: VK_KHR_surface, VK_FAKE_thing"
        );
    }

    #[test]
    fn out_of_range_message() {
        let err = GpuError::out_of_range("adapter", 3, 2);
        assert_eq!(err.to_string(), "adapter index 3 is out of range (count 2)");
    }
}
