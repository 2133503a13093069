// Pareidolia: real-time face distortion with thin-plate splines
//
// A base spline maps a rest face model onto the observed face, an active
// spline moves that model, and a softened mask over the face blends the
// composed warp into the live frame. The CPU draw is the reference; the
// compute backends (host threads or a wgpu kernel) reproduce it.

pub mod error;
pub mod geometry;
pub mod solver;
pub mod tps;
pub mod image;
pub mod mask;
pub mod config;
pub mod backend;
pub mod compose;
pub mod gpu;

pub use backend::{ComputeBackend, FrameGate, HostBackend, WarpBuffers};
pub use compose::{Silhouette, WarpCompositor};
pub use config::WarpConfig;
pub use error::{WarpError, WarpResult};
pub use geometry::Point2;
pub use image::{Image, Rgba};
pub use mask::{MaskMode, RegionMask};
pub use tps::ThinPlateSpline;
