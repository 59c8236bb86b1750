//! Render error types.

use prism_gpu::GpuError;
use thiserror::Error;

/// Frame pipeline errors.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device-layer failure.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// The declared reads and writes form a cycle.
    #[error("Pass graph has a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// Two passes write the same resource.
    #[error("Resource '{resource}' is written by both '{first}' and '{second}'")]
    DuplicateWriter {
        resource: &'static str,
        first: String,
        second: String,
    },

    /// No pass records into the destination command buffer.
    #[error("No destination pass declared")]
    MissingDestination,

    /// More than one pass claims the destination command buffer.
    #[error("Multiple destination passes: {}", .0.join(", "))]
    MultipleDestinations(Vec<String>),

    /// Another pass reads what the destination pass writes.
    #[error("Destination pass '{0}' must not have consumers")]
    DestinationHasConsumers(String),

    /// A pass looked up a resource no one has produced.
    #[error("Resource '{0}' is not available")]
    MissingResource(&'static str),

    /// Scene input that cannot be rendered as given.
    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    /// A swapchain image index past the framebuffer arena.
    #[error("Swapchain image index {index} exceeds framebuffer arena size {capacity}")]
    FramebufferIndex { index: usize, capacity: usize },

    /// A pass failed while recording; the frame was abandoned.
    #[error("Pass '{pass}' failed: {source}")]
    PassFailed {
        pass: String,
        #[source]
        source: Box<RenderError>,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_errors_pass_through() {
        let err = RenderError::from(GpuError::NotInitialized);
        assert_eq!(err.to_string(), "Device is not initialized");
    }

    #[test]
    fn pass_failure_names_pass() {
        let err = RenderError::PassFailed {
            pass: "shadows".into(),
            source: Box::new(RenderError::MissingResource("tlas")),
        };
        assert_eq!(
            err.to_string(),
            "Pass 'shadows' failed: Resource 'tlas' is not available"
        );
    }
}
