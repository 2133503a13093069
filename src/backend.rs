// backend.rs — Compute backend contract, shared buffers, host executor.
//
// A backend evaluates the composed warp for every pixel of the face region
// at once. The compositor never talks to a device directly: it assembles a
// `WarpBuffers` snapshot, hands it to whatever `ComputeBackend` it holds and
// reads packed RGBA words back.
//
// BUFFER CONTRACT
// ───────────────
// Slot order is fixed so the WGSL kernel and the host agree:
//
//   binding  contents                              length
//   0        WarpUniforms                          8 words
//   1        mesh points   (base forward control)  m pairs
//   2        image points  (base inverse control)  m pairs
//   3        distort points (active inverse ctrl)  d pairs
//   4        model points  (active rest set)       d pairs
//   5        base coeffs   [invX | invY | fwdX | fwdY], each m+3
//   6        active coeffs [invX | invY], each d+3
//   7        source image, one packed word per pixel
//   8        region words, alpha = blend weight in, resampled colour out
//
// The region buffer is overwritten by every execution, so the mask words
// must be written back into it before the next one (`reset_region`).
//
// Host-side buffers keep f64 precision. The GPU backend narrows to f32 on
// upload; the host backend evaluates the f64 data directly and therefore
// reproduces the CPU draw exactly.
//
// LIFECYCLE
// ─────────
//   construct (init) → upload → { update_active? → reset_region → execute
//   → readback }* → destroy
//
// Construction is the init step: it is where a device is acquired, so it is
// a type-specific constructor rather than a trait method.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, trace};

use crate::config::{BackendPreference, WarpConfig};
use crate::error::{WarpError, WarpResult};
use crate::geometry::Point2;
use crate::gpu::warp::GpuWarpBackend;
use crate::image::{Image, Rgba};
use crate::mask::RegionMask;
use crate::tps::{evaluate_coefficients, ThinPlateSpline, TpsParameters, AFFINE_TERMS};

// ---------------------------------------------------------------------------
// Uniforms
// ---------------------------------------------------------------------------

/// Scalar block shared with the kernel (binding 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct WarpUniforms {
    pub base_num_points: u32,
    pub distort_num_points: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub region_min_x: i32,
    pub region_min_y: i32,
    pub region_width: u32,
    pub region_height: u32,
}

impl WarpUniforms {
    /// Pixels in the region.
    #[inline]
    pub fn region_len(&self) -> usize {
        self.region_width as usize * self.region_height as usize
    }

    /// World coordinate of region pixel `(i, j)`.
    #[inline]
    pub fn region_to_world(&self, i: usize, j: usize) -> Point2 {
        Point2::new(
            (self.region_min_x + i as i32) as f64,
            (self.region_min_y + j as i32) as f64,
        )
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Coefficient vectors inside the base coefficient buffer, in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSlot {
    InverseX = 0,
    InverseY = 1,
    ForwardX = 2,
    ForwardY = 3,
}

/// The per-frame part of the buffers: active inverse control points and
/// coefficients `[invX | invY]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveLeg {
    pub distort_points: Vec<Point2>,
    pub coeffs: Vec<f64>,
}

impl ActiveLeg {
    /// Flatten the inverse direction of `active`.
    pub fn from_spline(active: &ThinPlateSpline) -> Self {
        let (xc, yc, points) = coefficients_or_identity(active.inverse_parameters());
        let mut coeffs = xc;
        coeffs.extend_from_slice(&yc);
        ActiveLeg { distort_points: points, coeffs }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.distort_points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.distort_points.is_empty()
    }
}

/// Everything a backend needs for one warp session.
///
/// Derived data: fully rebuilt from the splines, the mask and the source
/// frame by [`WarpBuffers::assemble`].
#[derive(Debug, Clone, PartialEq)]
pub struct WarpBuffers {
    pub uniforms: WarpUniforms,
    pub mesh_points: Vec<Point2>,
    pub image_points: Vec<Point2>,
    pub model_points: Vec<Point2>,
    pub base_coeffs: Vec<f64>,
    pub active: ActiveLeg,
    pub image: Vec<u32>,
    pub region_words: Vec<u32>,
}

/// Coefficients of one spline direction, or the identity map when the
/// direction is unfit. The identity needs no control points.
fn coefficients_or_identity(params: Option<&TpsParameters>) -> (Vec<f64>, Vec<f64>, Vec<Point2>) {
    match params {
        Some(p) => (p.xc.clone(), p.yc.clone(), p.control_points.clone()),
        None => (vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0], Vec::new()),
    }
}

/// Mask weights as region words: weight in the alpha byte, colour zero.
pub fn region_words(blur: &Image<u8>) -> Vec<u32> {
    let mut out = Vec::with_capacity(blur.width() * blur.height());
    for y in 0..blur.height() {
        out.extend(blur.row(y).iter().map(|&w| Rgba::new(0, 0, 0, w).pack()));
    }
    out
}

impl WarpBuffers {
    /// Flatten the session state into the buffer contract.
    ///
    /// An unfit base direction is written as the identity; both base
    /// directions then share the control-point count of the fitted one
    /// (zero when the base spline is unfit).
    pub fn assemble(
        base: &ThinPlateSpline,
        active: &ThinPlateSpline,
        mask: &RegionMask,
        source: &Image<Rgba>,
    ) -> Self {
        let (inv_x, inv_y, image_points) = coefficients_or_identity(base.inverse_parameters());
        let (fwd_x, fwd_y, mesh_points) = coefficients_or_identity(base.forward_parameters());

        let mut base_coeffs = Vec::with_capacity(4 * inv_x.len());
        base_coeffs.extend_from_slice(&inv_x);
        base_coeffs.extend_from_slice(&inv_y);
        base_coeffs.extend_from_slice(&fwd_x);
        base_coeffs.extend_from_slice(&fwd_y);

        let leg = ActiveLeg::from_spline(active);
        let bbox = mask.bbox();
        let uniforms = WarpUniforms {
            base_num_points: mesh_points.len() as u32,
            distort_num_points: leg.len() as u32,
            image_width: source.width() as u32,
            image_height: source.height() as u32,
            region_min_x: bbox.min_x,
            region_min_y: bbox.min_y,
            region_width: bbox.width() as u32,
            region_height: bbox.height() as u32,
        };

        WarpBuffers {
            uniforms,
            mesh_points,
            image_points,
            model_points: active.source_points().to_vec(),
            base_coeffs,
            active: leg,
            image: source.to_packed(),
            region_words: region_words(mask.blur()),
        }
    }

    /// Length of one base coefficient vector (`m + 3`).
    #[inline]
    fn base_stride(&self) -> usize {
        self.uniforms.base_num_points as usize + AFFINE_TERMS
    }

    /// One coefficient vector of the base buffer.
    pub fn base_slot(&self, slot: BaseSlot) -> &[f64] {
        let n = self.base_stride();
        let start = slot as usize * n;
        &self.base_coeffs[start..start + n]
    }

    /// Check every slot against the counts in the uniforms.
    pub fn validate(&self) -> WarpResult<()> {
        let u = &self.uniforms;
        let m = u.base_num_points as usize;
        let d = u.distort_num_points as usize;
        let layout = |what: &str, expected: usize, got: usize| {
            if expected == got {
                Ok(())
            } else {
                Err(WarpError::AcceleratorExecution(format!(
                    "buffer layout: {what} holds {got} entries, expected {expected}"
                )))
            }
        };
        layout("mesh points", m, self.mesh_points.len())?;
        layout("image points", m, self.image_points.len())?;
        layout("base coefficients", 4 * (m + AFFINE_TERMS), self.base_coeffs.len())?;
        layout("distort points", d, self.active.distort_points.len())?;
        layout("active coefficients", 2 * (d + AFFINE_TERMS), self.active.coeffs.len())?;
        layout(
            "source image",
            u.image_width as usize * u.image_height as usize,
            self.image.len(),
        )?;
        layout("region", u.region_len(), self.region_words.len())?;
        Ok(())
    }

    /// Replace the per-frame leg. The point count must not change: device
    /// buffers are sized once at upload.
    pub fn set_active(&mut self, leg: &ActiveLeg) -> WarpResult<()> {
        if leg.len() != self.active.len() || leg.coeffs.len() != self.active.coeffs.len() {
            return Err(WarpError::CorrespondenceMismatch {
                expected: self.active.len(),
                got: leg.len(),
            });
        }
        self.active.clone_from(leg);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The kernel, on the host
    // -----------------------------------------------------------------------

    #[inline]
    pub fn base_inverse(&self, p: Point2) -> Point2 {
        evaluate_coefficients(
            self.base_slot(BaseSlot::InverseX),
            self.base_slot(BaseSlot::InverseY),
            &self.image_points,
            p,
        )
    }

    #[inline]
    pub fn active_inverse(&self, p: Point2) -> Point2 {
        let n = self.active.len() + AFFINE_TERMS;
        let (xc, yc) = self.active.coeffs.split_at(n);
        evaluate_coefficients(xc, yc, &self.active.distort_points, p)
    }

    #[inline]
    pub fn base_forward(&self, p: Point2) -> Point2 {
        evaluate_coefficients(
            self.base_slot(BaseSlot::ForwardX),
            self.base_slot(BaseSlot::ForwardY),
            &self.mesh_points,
            p,
        )
    }

    /// `baseForward(activeInverse(baseInverse(p)))`.
    #[inline]
    pub fn composed(&self, p: Point2) -> Point2 {
        self.base_forward(self.active_inverse(self.base_inverse(p)))
    }

    /// Run the kernel for region pixel `(i, j)` holding `word`.
    ///
    /// A zero weight leaves the word untouched (it is already transparent
    /// black). Otherwise the pixel is blended towards its warped position,
    /// rounded and sampled; samples outside the source are transparent.
    pub fn shade(&self, i: usize, j: usize, word: u32) -> u32 {
        let weight = Rgba::unpack(word).a;
        if weight == 0 {
            return word;
        }
        let p = self.uniforms.region_to_world(i, j);
        let t = self.composed(p);
        let (w, h) = (self.uniforms.image_width as i64, self.uniforms.image_height as i64);
        match blended_sample(p, t, weight) {
            Some((sx, sy)) if sx >= 0 && sy >= 0 && sx < w && sy < h => {
                self.image[(sy * w + sx) as usize]
            }
            _ => Rgba::TRANSPARENT.pack(),
        }
    }
}

/// Blend `p` towards its warped position `t` by `weight / 255` and round to
/// the nearest pixel (`floor(v + 0.5)`).
///
/// Returns `None` when the blend is not finite, which callers treat like an
/// out-of-bounds sample.
#[inline]
pub fn blended_sample(p: Point2, t: Point2, weight: u8) -> Option<(i64, i64)> {
    let q = p.lerp(&t, weight as f64 / 255.0);
    if !q.x.is_finite() || !q.y.is_finite() {
        return None;
    }
    Some(((q.x + 0.5).floor() as i64, (q.y + 0.5).floor() as i64))
}

// ---------------------------------------------------------------------------
// ComputeBackend
// ---------------------------------------------------------------------------

/// A data-parallel executor for the warp kernel.
///
/// Every method except `destroy` may fail; the compositor answers any
/// failure by drawing the frame on the CPU instead.
pub trait ComputeBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Allocate and fill every buffer, replacing earlier uploads.
    fn upload(&mut self, buffers: &WarpBuffers) -> WarpResult<()>;

    /// Rewrite the active leg in place. Point counts are fixed by `upload`.
    fn update_active(&mut self, leg: &ActiveLeg) -> WarpResult<()>;

    /// Write the mask words back into the region buffer.
    fn reset_region(&mut self, words: &[u32]) -> WarpResult<()>;

    /// Run the kernel over the whole region.
    fn execute(&mut self) -> WarpResult<()>;

    /// Copy the region buffer back, one packed RGBA word per pixel.
    fn readback(&mut self) -> WarpResult<Vec<u32>>;

    /// Release every resource. The backend needs a fresh `upload` to be
    /// used again.
    fn destroy(&mut self);
}

/// Build the backend `config` asks for.
///
/// `Auto` tries the GPU first and settles for the host backend when no
/// device can be initialised; `Gpu` reports that failure instead.
pub fn create_backend(config: &WarpConfig) -> WarpResult<Box<dyn ComputeBackend>> {
    let profile = config.device_profile.into();
    match config.backend {
        BackendPreference::Host => Ok(Box::new(HostBackend::new())),
        BackendPreference::Gpu => Ok(Box::new(GpuWarpBackend::init(profile)?)),
        BackendPreference::Auto => match GpuWarpBackend::init(profile) {
            Ok(gpu) => Ok(Box::new(gpu)),
            Err(e) => {
                info!(error = %e, "no usable GPU, using the host backend");
                Ok(Box::new(HostBackend::new()))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// HostBackend
// ---------------------------------------------------------------------------

/// Executes the kernel on the CPU, one rayon task per region row.
#[derive(Debug, Default)]
pub struct HostBackend {
    buffers: Option<WarpBuffers>,
    region: Vec<u32>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn uploaded(&self) -> WarpResult<&WarpBuffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| WarpError::AcceleratorExecution("host backend used before upload".into()))
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn upload(&mut self, buffers: &WarpBuffers) -> WarpResult<()> {
        buffers.validate()?;
        self.region = buffers.region_words.clone();
        self.buffers = Some(buffers.clone());
        debug!(
            region = buffers.uniforms.region_len(),
            base = buffers.uniforms.base_num_points,
            distort = buffers.uniforms.distort_num_points,
            "host backend uploaded"
        );
        Ok(())
    }

    fn update_active(&mut self, leg: &ActiveLeg) -> WarpResult<()> {
        match self.buffers.as_mut() {
            Some(b) => b.set_active(leg),
            None => Err(WarpError::AcceleratorExecution("host backend used before upload".into())),
        }
    }

    fn reset_region(&mut self, words: &[u32]) -> WarpResult<()> {
        let expected = self.uploaded()?.uniforms.region_len();
        if words.len() != expected {
            return Err(WarpError::CorrespondenceMismatch { expected, got: words.len() });
        }
        self.region.copy_from_slice(words);
        Ok(())
    }

    fn execute(&mut self) -> WarpResult<()> {
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| WarpError::AcceleratorExecution("host backend used before upload".into()))?;
        let width = buffers.uniforms.region_width as usize;
        if width == 0 {
            return Ok(());
        }
        self.region.par_chunks_mut(width).enumerate().for_each(|(j, row)| {
            for (i, word) in row.iter_mut().enumerate() {
                *word = buffers.shade(i, j, *word);
            }
        });
        trace!(pixels = self.region.len(), "host kernel executed");
        Ok(())
    }

    fn readback(&mut self) -> WarpResult<Vec<u32>> {
        self.uploaded()?;
        Ok(self.region.clone())
    }

    fn destroy(&mut self) {
        self.buffers = None;
        self.region = Vec::new();
    }
}

// ---------------------------------------------------------------------------
// FrameGate
// ---------------------------------------------------------------------------

/// Latest-wins admission for accelerated frames.
///
/// At most one frame is in flight. A frame that arrives while another is
/// still executing is dropped, never queued.
#[derive(Debug, Default)]
pub struct FrameGate {
    in_flight: AtomicBool,
    dropped: AtomicU64,
}

/// Holds the gate closed until dropped.
#[derive(Debug)]
pub struct FrameGuard<'a> {
    gate: &'a FrameGate,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a frame, or return `None` if one is already in flight.
    pub fn try_begin(&self) -> Option<FrameGuard<'_>> {
        match self.in_flight.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Some(FrameGuard { gate: self }),
            Err(_) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped = n, "frame dropped, previous frame still in flight");
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Frames rejected by `try_begin` so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::Release);
    }
}
