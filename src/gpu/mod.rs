// gpu/mod.rs — GPU acceleration layer.
//
// A wgpu compute kernel that mirrors the host warp in `backend.rs`. The host
// path stays the reference; the kernel is checked against it per channel on
// smooth content.
//
// Split of work:
//
//   GPU, per frame:   composed-spline evaluation + resample for every region
//                     pixel (the only O(pixels · landmarks) step)
//
//   CPU, per update:  active-spline refit (an (n+3)² solve, tiny)
//
// The boundary is the active coefficient buffer going up and the region
// buffer coming back. Nothing else is transferred after `upload`.

pub mod device;
pub mod warp;
