// compose.rs — Warp compositor: three splines, one displacement field.
//
// A session warps one source frame so that the face in it follows a live
// landmark configuration:
//
//   base      model points  → observed points   (fit once)
//   active    rest landmarks → live landmarks    (refit every frame)
//   nilpotent rest landmarks → rest landmarks    (identity, reset target)
//
// and every pixel p of the face region is resampled from
//
//   T(p) = base.forward(active.inverse(base.inverse(p)))
//
// i.e. pull p back into model space, undo the live distortion there, and
// push the result into the image again. The pixel is blended towards T(p)
// by the region's blur weight and the nearest source pixel is copied.
//
// STATE
// ─────
//   new() ──► BaseFitted ──update/fit_active──► ActiveReady
//                 ▲                                │
//                 └──────────reset_active──────────┘
//   any ──destroy()──► Destroyed   (every later call fails)
//
// A base fit that fails leaves the base leg as the identity; the session is
// still usable and warps with the active leg alone.
//
// BASE-INVERSE GRID
// ─────────────────
// base.inverse(p) never changes within a session, so with
// `precompute_base_inverse` it is evaluated once per region pixel and kept
// in a dense row-major grid indexed `(y - min_y) * width + (x - min_x)`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{
    blended_sample, create_backend, region_words, ActiveLeg, ComputeBackend, FrameGate, WarpBuffers,
};
use crate::config::WarpConfig;
use crate::error::{WarpError, WarpResult};
use crate::geometry::{BoundingBox, Point2};
use crate::image::{Image, Rgba};
use crate::mask::RegionMask;
use crate::tps::ThinPlateSpline;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Face outline used to build the region mask.
#[derive(Debug, Clone, PartialEq)]
pub enum Silhouette {
    /// Already in source-image coordinates.
    Image(Vec<Point2>),
    /// In model coordinates; mapped through the base spline first.
    Model(Vec<Point2>),
}

/// Pair indexed landmarks with the model points of the same index.
///
/// `observed` yields `(landmark index, position)` in the caller's order,
/// which becomes the correspondence order. Indices past the end of `model`
/// are skipped with a warning.
pub fn correspond(
    model: &[Point2],
    observed: impl IntoIterator<Item = (usize, Point2)>,
) -> (Vec<Point2>, Vec<Point2>) {
    let mut src = Vec::new();
    let mut dst = Vec::new();
    for (index, position) in observed {
        match model.get(index) {
            Some(&m) => {
                src.push(m);
                dst.push(position);
            }
            None => warn!(index, model_len = model.len(), "landmark index out of range, skipped"),
        }
    }
    (src, dst)
}

/// Every `stride`-th point, starting with the first.
pub fn subsample(points: &[Point2], stride: usize) -> Vec<Point2> {
    points.iter().step_by(stride.max(1)).copied().collect()
}

// ---------------------------------------------------------------------------
// WarpCompositor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    /// Base spline fitted, active spline at rest (identity).
    BaseFitted,
    /// Active spline moved by at least one update or refit.
    ActiveReady,
    /// Resources released.
    Destroyed,
}

pub struct WarpCompositor {
    config: WarpConfig,
    state: CompositorState,

    base: ThinPlateSpline,
    active: ThinPlateSpline,
    nilpotent: ThinPlateSpline,

    mask: RegionMask,
    mask_words: Vec<u32>,
    base_inverse_grid: Option<Vec<Point2>>,
    source: Image<Rgba>,

    backend: Option<Box<dyn ComputeBackend>>,
    uploaded_leg_len: Option<usize>,
    active_dirty: bool,
    accelerator_failed: bool,
    gate: Arc<FrameGate>,
}

impl WarpCompositor {
    /// Start a session.
    ///
    /// * `model_points` / `observed_points`: base correspondences, index
    ///   for index (see [`correspond`]).
    /// * `distortion_points`: rest landmarks of the active spline, before
    ///   subsampling by `config.active_landmark_stride`.
    /// * `silhouette`: face outline for the region mask.
    /// * `source`: the frame to resample.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(m = model_points.len(), d = distortion_points.len())
    )]
    pub fn new(
        model_points: &[Point2],
        observed_points: &[Point2],
        distortion_points: &[Point2],
        silhouette: Silhouette,
        source: Image<Rgba>,
        config: WarpConfig,
    ) -> WarpResult<Self> {
        config.validate()?;

        let mut base = ThinPlateSpline::new();
        if let Err(e) = base.fit(model_points, observed_points) {
            warn!(error = %e, "base leg is the identity for this session");
        }

        let rest = subsample(distortion_points, config.active_landmark_stride);
        let nilpotent = ThinPlateSpline::identity(&rest).unwrap_or_else(|e| {
            warn!(error = %e, n = rest.len(), "active leg cannot move for this session");
            ThinPlateSpline::new()
        });

        let outline = match silhouette {
            Silhouette::Image(points) => points,
            Silhouette::Model(points) => points.into_iter().map(|p| base.forward(p)).collect(),
        };
        let mask = RegionMask::build(&outline, config.mask_mode, config.blur_passes)?;
        let mask_words = region_words(mask.blur());

        let base_inverse_grid = config
            .precompute_base_inverse
            .then(|| precompute_base_inverse(&base, mask.bbox()));

        info!(
            bbox = %mask.bbox(),
            base_fit = base.is_fit(),
            active_points = rest.len(),
            "warp session ready"
        );

        Ok(WarpCompositor {
            config,
            state: CompositorState::BaseFitted,
            active: nilpotent.clone(),
            nilpotent,
            base,
            mask,
            mask_words,
            base_inverse_grid,
            source,
            backend: None,
            uploaded_leg_len: None,
            active_dirty: false,
            accelerator_failed: false,
            gate: Arc::new(FrameGate::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> CompositorState {
        self.state
    }

    pub fn config(&self) -> &WarpConfig {
        &self.config
    }

    pub fn region(&self) -> &RegionMask {
        &self.mask
    }

    pub fn base(&self) -> &ThinPlateSpline {
        &self.base
    }

    pub fn active(&self) -> &ThinPlateSpline {
        &self.active
    }

    pub fn source(&self) -> &Image<Rgba> {
        &self.source
    }

    /// Rest landmarks driving the active spline, after subsampling.
    pub fn rest_points(&self) -> &[Point2] {
        self.nilpotent.source_points()
    }

    /// Shared handle to the in-flight gate. Landmark producers on other
    /// threads can check it and drop input instead of waiting for a frame.
    pub fn frame_gate(&self) -> Arc<FrameGate> {
        Arc::clone(&self.gate)
    }

    /// Name of the backend currently held, if any.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    fn ensure_alive(&self) -> WarpResult<()> {
        match self.state {
            CompositorState::Destroyed => Err(WarpError::Destroyed),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Transform
    // -----------------------------------------------------------------------

    /// `baseForward(activeInverse(baseInverse(p)))`.
    pub fn composed_transform(&self, p: Point2) -> WarpResult<Point2> {
        self.ensure_alive()?;
        let q = match self.grid_lookup(p) {
            Some(q) => q,
            None => self.base.inverse(p),
        };
        Ok(self.base.forward(self.active.inverse(q)))
    }

    fn grid_lookup(&self, p: Point2) -> Option<Point2> {
        let grid = self.base_inverse_grid.as_ref()?;
        if p.x.fract() != 0.0 || p.y.fract() != 0.0 {
            return None;
        }
        let bbox = self.mask.bbox();
        let (i, j) = bbox.to_region(p.x as i32, p.y as i32)?;
        grid.get(j * bbox.width() + i).copied()
    }

    /// Transform for region pixel `(i, j)` at world position `p`.
    #[inline]
    fn transform_region_pixel(&self, i: usize, j: usize, p: Point2) -> Point2 {
        let q = match &self.base_inverse_grid {
            Some(grid) => grid[j * self.mask.width() + i],
            None => self.base.inverse(p),
        };
        self.base.forward(self.active.inverse(q))
    }

    // -----------------------------------------------------------------------
    // Active spline
    // -----------------------------------------------------------------------

    /// Move the active spline to a new landmark configuration.
    ///
    /// `points` is the full per-frame list; it is subsampled by the
    /// configured stride before the length check. Returns `false` when the
    /// frame should be skipped (length mismatch, singular system, frame in
    /// flight, destroyed session); the previous configuration stays active.
    pub fn update_active_targets(&mut self, points: &[Point2]) -> bool {
        match self.try_update_active_targets(points) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "active update skipped");
                false
            }
        }
    }

    /// [`update_active_targets`](Self::update_active_targets) with the reason
    /// for a skipped frame.
    pub fn try_update_active_targets(&mut self, points: &[Point2]) -> WarpResult<()> {
        self.ensure_alive()?;
        if self.gate.is_busy() {
            return Err(WarpError::FrameDropped);
        }
        let targets = subsample(points, self.config.active_landmark_stride);
        self.active.update_inverse_target_points(&targets)?;
        self.state = CompositorState::ActiveReady;
        self.active_dirty = true;
        Ok(())
    }

    /// Fully refit the active spline from its rest landmarks to `targets`
    /// (subsampled like per-frame updates). Unlike the per-frame path the
    /// inverse is not pinned.
    ///
    /// On failure the active spline returns to rest and the error is
    /// returned.
    pub fn fit_active(&mut self, targets: &[Point2]) -> WarpResult<()> {
        self.ensure_alive()?;
        let targets = subsample(targets, self.config.active_landmark_stride);
        let rest = self.nilpotent.source_points().to_vec();
        self.active_dirty = true;
        match self.active.fit(&rest, &targets) {
            Ok(()) => {
                self.state = CompositorState::ActiveReady;
                Ok(())
            }
            Err(e) => {
                self.active = self.nilpotent.clone();
                self.state = CompositorState::BaseFitted;
                Err(e)
            }
        }
    }

    /// Return the active spline to rest (the identity).
    pub fn reset_active(&mut self) -> WarpResult<()> {
        self.ensure_alive()?;
        self.active = self.nilpotent.clone();
        self.state = CompositorState::BaseFitted;
        self.active_dirty = true;
        Ok(())
    }

    /// Replace the frame being resampled. The region is not rebuilt;
    /// samples that fall outside the new frame are transparent.
    pub fn set_source(&mut self, source: Image<Rgba>) -> WarpResult<()> {
        self.ensure_alive()?;
        self.source = source;
        self.uploaded_leg_len = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CPU draw
    // -----------------------------------------------------------------------

    /// Resample the region on the calling thread at the configured
    /// processing scale.
    pub fn draw(&self) -> WarpResult<Image<Rgba>> {
        self.draw_scaled(self.config.processing_scale)
    }

    /// Resample every `scale`-th region pixel in each axis into a
    /// `floor(w / scale) × floor(h / scale)` frame. Pixels with zero weight
    /// and samples outside the source are transparent.
    pub fn draw_scaled(&self, scale: usize) -> WarpResult<Image<Rgba>> {
        self.ensure_alive()?;
        if scale == 0 {
            return Err(WarpError::invalid_config("processing scale must be at least 1"));
        }
        let bbox = self.mask.bbox();
        let blur = self.mask.blur();
        let (out_w, out_h) = (bbox.width() / scale, bbox.height() / scale);
        let mut out = Image::new(out_w, out_h);

        for oj in 0..out_h {
            let j = oj * scale;
            for oi in 0..out_w {
                let i = oi * scale;
                let weight = blur.get(i, j);
                if weight == 0 {
                    continue;
                }
                let p = bbox.to_world(i, j);
                let t = self.transform_region_pixel(i, j, p);
                let sample = blended_sample(p, t, weight)
                    .and_then(|(sx, sy)| self.source.get_checked(sx, sy));
                if let Some(color) = sample {
                    out.set(oi, oj, color);
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Accelerated draw
    // -----------------------------------------------------------------------

    /// Flatten the session into the backend buffer contract.
    pub fn buffers(&self) -> WarpResult<WarpBuffers> {
        self.ensure_alive()?;
        Ok(WarpBuffers::assemble(&self.base, &self.active, &self.mask, &self.source))
    }

    /// Use `backend` for accelerated draws, replacing (and destroying) the
    /// one held before. Clears an earlier accelerator failure.
    pub fn set_backend(&mut self, backend: Box<dyn ComputeBackend>) {
        self.release_backend();
        self.backend = Some(backend);
        self.accelerator_failed = false;
    }

    fn release_backend(&mut self) {
        if let Some(mut old) = self.backend.take() {
            old.destroy();
        }
        self.uploaded_leg_len = None;
    }

    /// Resample the full-resolution region on the configured backend.
    ///
    /// Any backend failure is logged, the backend is released and the frame
    /// is drawn on the CPU instead; later frames stay on the CPU until
    /// [`set_backend`](Self::set_backend) is called. Fails with
    /// `FrameDropped` if another frame holds the gate.
    pub fn draw_accelerated(&mut self) -> WarpResult<Image<Rgba>> {
        self.ensure_alive()?;
        let gate = Arc::clone(&self.gate);
        let _frame = gate.try_begin().ok_or(WarpError::FrameDropped)?;

        match self.run_backend() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(
                    error = %e,
                    backend = self.backend_name().unwrap_or("none"),
                    "accelerated draw failed, drawing on the CPU"
                );
                self.release_backend();
                self.accelerator_failed = true;
                self.draw_scaled(1)
            }
        }
    }

    fn run_backend(&mut self) -> WarpResult<Image<Rgba>> {
        if self.backend.is_none() {
            if self.accelerator_failed {
                return Err(WarpError::AcceleratorUnavailable(
                    "disabled after an earlier failure".into(),
                ));
            }
            self.backend = Some(create_backend(&self.config)?);
            self.uploaded_leg_len = None;
        }

        let leg = ActiveLeg::from_spline(&self.active);
        let full_upload = self.uploaded_leg_len != Some(leg.len());
        let buffers = if full_upload { Some(self.buffers()?) } else { None };
        let (w, h) = (self.mask.width(), self.mask.height());

        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| WarpError::AcceleratorUnavailable("no backend".into()))?;
        match buffers {
            Some(buffers) => {
                backend.upload(&buffers)?;
                self.uploaded_leg_len = Some(leg.len());
            }
            None if self.active_dirty => backend.update_active(&leg)?,
            None => {}
        }
        self.active_dirty = false;

        backend.reset_region(&self.mask_words)?;
        backend.execute()?;
        let words = backend.readback()?;
        if words.len() != w * h {
            return Err(WarpError::AcceleratorExecution(format!(
                "readback returned {} words for a {w}×{h} region",
                words.len()
            )));
        }
        Ok(Image::from_packed(w, h, &words))
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release the backend and the session's buffers. Every later call
    /// fails with `WarpError::Destroyed`.
    pub fn destroy(&mut self) {
        if self.state == CompositorState::Destroyed {
            return;
        }
        self.release_backend();
        self.base_inverse_grid = None;
        self.mask_words = Vec::new();
        self.source = Image::new(0, 0);
        self.state = CompositorState::Destroyed;
        debug!("warp session destroyed");
    }
}

impl Drop for WarpCompositor {
    fn drop(&mut self) {
        self.release_backend();
    }
}

impl std::fmt::Debug for WarpCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarpCompositor")
            .field("state", &self.state)
            .field("bbox", &self.mask.bbox())
            .field("base_fit", &self.base.is_fit())
            .field("rest_points", &self.nilpotent.source_points().len())
            .field("backend", &self.backend_name())
            .finish()
    }
}

/// `base.inverse` at every pixel of `bbox`, row-major.
fn precompute_base_inverse(base: &ThinPlateSpline, bbox: BoundingBox) -> Vec<Point2> {
    let mut grid = Vec::with_capacity(bbox.width() * bbox.height());
    for j in 0..bbox.height() {
        for i in 0..bbox.width() {
            grid.push(base.inverse(bbox.to_world(i, j)));
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::config::BackendPreference;

    fn p(x: f64, y: f64) -> Point2 {
        Point2::new(x, y)
    }

    fn landmarks() -> Vec<Point2> {
        vec![
            p(20.0, 20.0),
            p(44.0, 18.0),
            p(46.0, 44.0),
            p(22.0, 46.0),
            p(33.0, 30.0),
            p(30.0, 38.0),
        ]
    }

    fn frame() -> Image<Rgba> {
        Image::from_fn(64, 64, |x, y| Rgba::new((x * 4) as u8, (y * 4) as u8, 90, 255))
    }

    fn session(config: WarpConfig) -> WarpCompositor {
        let pts = landmarks();
        WarpCompositor::new(&pts, &pts, &pts, Silhouette::Image(pts.clone()), frame(), config)
            .unwrap()
    }

    #[test]
    fn test_correspond_skips_out_of_range() {
        let model = vec![p(0.0, 0.0), p(1.0, 1.0)];
        let (src, dst) = correspond(&model, vec![(1, p(5.0, 5.0)), (7, p(9.0, 9.0)), (0, p(3.0, 3.0))]);
        assert_eq!(src, vec![p(1.0, 1.0), p(0.0, 0.0)]);
        assert_eq!(dst, vec![p(5.0, 5.0), p(3.0, 3.0)]);
    }

    #[test]
    fn test_subsample_keeps_first() {
        let pts: Vec<Point2> = (0..5).map(|i| p(i as f64, 0.0)).collect();
        assert_eq!(subsample(&pts, 2), vec![p(0.0, 0.0), p(2.0, 0.0), p(4.0, 0.0)]);
        assert_eq!(subsample(&pts, 1).len(), 5);
    }

    #[test]
    fn test_rest_session_is_identity() {
        let c = session(WarpConfig::default());
        assert_eq!(c.state(), CompositorState::BaseFitted);
        let q = c.composed_transform(p(30.0, 30.0)).unwrap();
        assert!(q.distance(&p(30.0, 30.0)) < 1e-6, "{q}");
    }

    #[test]
    fn test_grid_matches_direct_evaluation() {
        let pts = landmarks();
        let observed: Vec<Point2> = pts.iter().map(|q| p(q.x + 1.5, q.y * 1.05)).collect();
        let make = |precompute| {
            WarpCompositor::new(
                &pts,
                &observed,
                &pts,
                Silhouette::Image(observed.clone()),
                frame(),
                WarpConfig::default().with_precompute_base_inverse(precompute),
            )
            .unwrap()
        };
        let (with, without) = (make(true), make(false));
        for probe in [p(30.0, 30.0), p(25.0, 40.0), p(30.5, 31.25)] {
            assert_eq!(
                with.composed_transform(probe).unwrap(),
                without.composed_transform(probe).unwrap()
            );
        }
    }

    #[test]
    fn test_update_length_mismatch_skips_frame() {
        let mut c = session(WarpConfig::default());
        assert!(!c.update_active_targets(&landmarks()[..4]));
        assert_eq!(c.state(), CompositorState::BaseFitted);
        assert!(c.update_active_targets(&landmarks()));
        assert_eq!(c.state(), CompositorState::ActiveReady);
    }

    #[test]
    fn test_update_dropped_while_frame_in_flight() {
        let mut c = session(WarpConfig::default());
        let gate = c.frame_gate();
        let guard = gate.try_begin().unwrap();
        assert!(matches!(
            c.try_update_active_targets(&landmarks()),
            Err(WarpError::FrameDropped)
        ));
        drop(guard);
        assert!(c.update_active_targets(&landmarks()));
    }

    #[test]
    fn test_destroyed_rejects_everything() {
        let mut c = session(WarpConfig::default().with_backend(BackendPreference::Host));
        c.destroy();
        assert_eq!(c.state(), CompositorState::Destroyed);
        assert!(matches!(c.draw(), Err(WarpError::Destroyed)));
        assert!(matches!(c.composed_transform(p(0.0, 0.0)), Err(WarpError::Destroyed)));
        assert!(!c.update_active_targets(&landmarks()));
        assert!(matches!(c.draw_accelerated(), Err(WarpError::Destroyed)));
    }

    #[test]
    fn test_host_backend_matches_cpu_after_update() {
        let mut c = session(WarpConfig::default());
        c.set_backend(Box::new(HostBackend::new()));
        let moved: Vec<Point2> = landmarks().iter().map(|q| p(q.x + 2.0, q.y - 1.0)).collect();
        assert!(c.update_active_targets(&moved));

        let cpu = c.draw().unwrap();
        let host = c.draw_accelerated().unwrap();
        assert_eq!(cpu, host);
        assert_eq!(c.backend_name(), Some("host"));

        // A second update goes through the in-place path.
        let moved: Vec<Point2> = landmarks().iter().map(|q| p(q.x - 1.0, q.y + 2.0)).collect();
        assert!(c.update_active_targets(&moved));
        assert_eq!(c.draw().unwrap(), c.draw_accelerated().unwrap());
    }

    #[test]
    fn test_draw_scaled_dimensions() {
        let c = session(WarpConfig::default());
        let bbox = c.region().bbox();
        let out = c.draw_scaled(2).unwrap();
        assert_eq!((out.width(), out.height()), (bbox.width() / 2, bbox.height() / 2));
        assert!(c.draw_scaled(0).is_err());
    }
}
