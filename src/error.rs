// error.rs — Error taxonomy for fitting, masking and execution.
//
// Recoverable conditions (singular fit, correspondence mismatch, accelerator
// failure) are reported here but handled at the component boundary: the
// spline degrades to identity, the frame is skipped, or the compositor falls
// back to the CPU path. Callers see the error value, rendering never panics.

use crate::gpu::device::GpuError;

pub type WarpResult<T> = Result<T, WarpError>;

#[derive(thiserror::Error, Debug)]
pub enum WarpError {
    /// Gauss-Jordan found a column with no nonzero pivot.
    #[error("system matrix of size {size} is singular")]
    SingularSystem { size: usize },

    /// Source/target point sets (or a per-frame update) differ in length.
    #[error("correspondence mismatch: expected {expected} points, got {got}")]
    CorrespondenceMismatch { expected: usize, got: usize },

    /// Fewer control points than the affine block needs.
    #[error("too few control points: got {got}, need at least {min}")]
    TooFewPoints { got: usize, min: usize },

    /// The silhouette produced a bounding box with no pixels.
    #[error("region is empty")]
    EmptyRegion,

    /// The silhouette's bounding box covers more pixels than a mask allows.
    #[error("region of {width}×{height} pixels exceeds the {max}-pixel limit")]
    RegionTooLarge { width: usize, height: usize, max: usize },

    /// A per-frame update was issued on a spline that was never fit.
    #[error("spline has not been fit")]
    NotFitted,

    /// Per-frame input arrived while the previous frame was still in flight.
    #[error("frame dropped: previous frame still in flight")]
    FrameDropped,

    /// The compositor was used after `destroy()`.
    #[error("compositor has been destroyed")]
    Destroyed,

    #[error("accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("accelerator execution failed: {0}")]
    AcceleratorExecution(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WarpError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for conditions callers recover from by degrading
    /// rather than aborting the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            WarpError::Destroyed | WarpError::NotFitted | WarpError::InvalidConfig(_)
        )
    }
}

impl From<GpuError> for WarpError {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::NoSuitableAdapter | GpuError::DeviceRequest(_) => {
                WarpError::AcceleratorUnavailable(e.to_string())
            }
            _ => WarpError::AcceleratorExecution(e.to_string()),
        }
    }
}
