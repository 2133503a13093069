// tests/test_compose.rs — Integration tests for the warp compositor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pareidolia::backend::{ActiveLeg, ComputeBackend, HostBackend, WarpBuffers};
use pareidolia::compose::{CompositorState, Silhouette, WarpCompositor};
use pareidolia::config::{BackendPreference, WarpConfig};
use pareidolia::error::{WarpError, WarpResult};
use pareidolia::geometry::Point2;
use pareidolia::image::{Image, Rgba};
use pareidolia::mask::MaskMode;

/// Log output for failing tests: `RUST_LOG=pareidolia=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn p(x: f64, y: f64) -> Point2 {
    Point2::new(x, y)
}

/// Eight landmarks of a small face: brows, eyes, nose, mouth corners, chin.
fn face() -> Vec<Point2> {
    vec![
        p(30.0, 30.0),
        p(70.0, 28.0),
        p(38.0, 42.0),
        p(62.0, 42.0),
        p(50.0, 55.0),
        p(40.0, 68.0),
        p(60.0, 68.0),
        p(50.0, 82.0),
    ]
}

fn outline() -> Vec<Point2> {
    vec![p(25.0, 20.0), p(75.0, 20.0), p(80.0, 60.0), p(50.0, 90.0), p(20.0, 60.0)]
}

fn frame() -> Image<Rgba> {
    Image::from_fn(100, 100, |x, y| Rgba::new((x * 2) as u8, (y * 2) as u8, 60, 255))
}

fn session(config: WarpConfig) -> WarpCompositor {
    init_tracing();
    let pts = face();
    WarpCompositor::new(&pts, &pts, &pts, Silhouette::Image(outline()), frame(), config).unwrap()
}

fn smile() -> Vec<Point2> {
    face()
        .into_iter()
        .enumerate()
        .map(|(i, q)| match i {
            5 => p(q.x - 3.0, q.y - 3.0),
            6 => p(q.x + 3.0, q.y - 3.0),
            _ => q,
        })
        .collect()
}

// ===== Rest and moved sessions =====

#[test]
fn rest_session_reproduces_the_frame() {
    let c = session(WarpConfig::default());
    let out = c.draw().unwrap();
    let bbox = c.region().bbox();
    let src = frame();
    for j in 0..out.height() {
        for i in 0..out.width() {
            if c.region().blur().get(i, j) == 0 {
                assert_eq!(out.get(i, j), Rgba::TRANSPARENT);
                continue;
            }
            let w = bbox.to_world(i, j);
            assert_eq!(out.get(i, j), src.get(w.x as usize, w.y as usize), "pixel ({i}, {j})");
        }
    }
}

#[test]
fn moved_landmarks_change_the_region() {
    let mut c = session(WarpConfig::default());
    let rest = c.draw().unwrap();
    assert!(c.update_active_targets(&smile()));
    let moved = c.draw().unwrap();
    assert_ne!(rest, moved);

    c.reset_active().unwrap();
    assert_eq!(c.state(), CompositorState::BaseFitted);
    assert_eq!(c.draw().unwrap(), rest);
}

#[test]
fn base_translation_is_followed() {
    let model = face();
    let observed: Vec<Point2> = model.iter().map(|q| p(q.x + 6.0, q.y + 4.0)).collect();
    let c = WarpCompositor::new(
        &model,
        &observed,
        &model,
        Silhouette::Model(outline()),
        frame(),
        WarpConfig::default(),
    )
    .unwrap();

    // Silhouette was carried into image space by the base spline.
    let bbox = c.region().bbox();
    assert!((25..=26).contains(&bbox.min_x), "{bbox}");
    assert!((23..=24).contains(&bbox.min_y), "{bbox}");
    assert!(c.region().contains(&p(56.0, 84.0)));
    assert!(!c.region().contains(&p(25.0, 21.0)));

    // At rest the composed map is the identity in image space.
    let q = c.composed_transform(p(55.0, 60.0)).unwrap();
    assert!(q.distance(&p(55.0, 60.0)) < 1e-6, "{q}");
}

#[test]
fn failed_base_fit_falls_back_to_identity() {
    let model = vec![p(0.0, 0.0), p(1.0, 1.0)];
    let c = WarpCompositor::new(
        &model,
        &model,
        &face(),
        Silhouette::Image(outline()),
        frame(),
        WarpConfig::default(),
    )
    .unwrap();
    assert!(!c.base().is_fit());
    let q = c.composed_transform(p(50.0, 50.0)).unwrap();
    assert!(q.distance(&p(50.0, 50.0)) < 1e-6);
}

#[test]
fn stride_subsamples_the_active_leg() {
    let mut c = session(WarpConfig::camera());
    assert_eq!(c.rest_points().len(), 4);
    // The full per-frame list is subsampled before the length check.
    assert!(c.update_active_targets(&smile()));
    assert!(!c.update_active_targets(&smile()[..4]));
}

#[test]
fn fit_active_moves_and_recovers() {
    let mut c = session(WarpConfig::default());
    c.fit_active(&smile()).unwrap();
    assert_eq!(c.state(), CompositorState::ActiveReady);
    let corner = c.active().forward(face()[5]);
    assert!(corner.distance(&smile()[5]) < 1e-6);

    // All targets on one spot: the inverse direction cannot be solved.
    let collapsed = vec![p(0.0, 0.0); face().len()];
    let err = c.fit_active(&collapsed).unwrap_err();
    assert!(matches!(err, WarpError::SingularSystem { .. }), "{err}");
    assert_eq!(c.state(), CompositorState::BaseFitted);
    assert!(c.active().is_fit(), "active leg is back at rest");

    let err = c.fit_active(&smile()[..3]).unwrap_err();
    assert!(matches!(err, WarpError::CorrespondenceMismatch { .. }));
}

#[test]
fn polygon_mask_session() {
    let c = session(WarpConfig::default().with_mask_mode(MaskMode::Polygon).with_blur_passes(4));
    assert_eq!(c.region().mode(), MaskMode::Polygon);
    assert!(c.draw().is_ok());
}

// ===== Accelerated path =====

/// Host backend that counts how the compositor drives it.
#[derive(Default)]
struct Counting {
    inner: HostBackend,
    uploads: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
}

impl ComputeBackend for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }
    fn upload(&mut self, buffers: &WarpBuffers) -> WarpResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(buffers)
    }
    fn update_active(&mut self, leg: &ActiveLeg) -> WarpResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_active(leg)
    }
    fn reset_region(&mut self, words: &[u32]) -> WarpResult<()> {
        self.inner.reset_region(words)
    }
    fn execute(&mut self) -> WarpResult<()> {
        self.inner.execute()
    }
    fn readback(&mut self) -> WarpResult<Vec<u32>> {
        self.inner.readback()
    }
    fn destroy(&mut self) {
        self.inner.destroy()
    }
}

/// Backend whose device is lost on first use.
struct Broken {
    calls: Arc<AtomicUsize>,
}

impl ComputeBackend for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }
    fn upload(&mut self, _: &WarpBuffers) -> WarpResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WarpError::AcceleratorExecution("device lost".into()))
    }
    fn update_active(&mut self, _: &ActiveLeg) -> WarpResult<()> {
        unreachable!("never uploaded")
    }
    fn reset_region(&mut self, _: &[u32]) -> WarpResult<()> {
        unreachable!("never uploaded")
    }
    fn execute(&mut self) -> WarpResult<()> {
        unreachable!("never uploaded")
    }
    fn readback(&mut self) -> WarpResult<Vec<u32>> {
        unreachable!("never uploaded")
    }
    fn destroy(&mut self) {}
}

#[test]
fn buffers_upload_once_and_update_in_place() {
    let mut c = session(WarpConfig::default());
    let backend = Counting::default();
    let (uploads, updates) = (Arc::clone(&backend.uploads), Arc::clone(&backend.updates));
    c.set_backend(Box::new(backend));

    c.draw_accelerated().unwrap();
    assert_eq!((uploads.load(Ordering::SeqCst), updates.load(Ordering::SeqCst)), (1, 0));

    // Nothing changed: no transfer besides the region reset.
    c.draw_accelerated().unwrap();
    assert_eq!((uploads.load(Ordering::SeqCst), updates.load(Ordering::SeqCst)), (1, 0));

    assert!(c.update_active_targets(&smile()));
    assert_eq!(c.draw_accelerated().unwrap(), c.draw().unwrap());
    assert_eq!((uploads.load(Ordering::SeqCst), updates.load(Ordering::SeqCst)), (1, 1));

    // A new source frame needs a fresh upload.
    c.set_source(frame()).unwrap();
    c.draw_accelerated().unwrap();
    assert_eq!(uploads.load(Ordering::SeqCst), 2);
}

#[test]
fn failing_backend_falls_back_to_cpu() {
    let mut c = session(WarpConfig::default());
    assert!(c.update_active_targets(&smile()));
    let calls = Arc::new(AtomicUsize::new(0));
    c.set_backend(Box::new(Broken { calls: Arc::clone(&calls) }));

    let expected = c.draw_scaled(1).unwrap();
    assert_eq!(c.draw_accelerated().unwrap(), expected);
    assert_eq!(c.backend_name(), None);

    // Later frames stay on the CPU without retrying the accelerator.
    assert_eq!(c.draw_accelerated().unwrap(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A new backend re-enables acceleration.
    c.set_backend(Box::new(HostBackend::new()));
    assert_eq!(c.draw_accelerated().unwrap(), expected);
    assert_eq!(c.backend_name(), Some("host"));
}

#[test]
fn host_preference_creates_host_backend() {
    let mut c = session(WarpConfig::default().with_backend(BackendPreference::Host));
    assert_eq!(c.backend_name(), None);
    let out = c.draw_accelerated().unwrap();
    assert_eq!(c.backend_name(), Some("host"));
    assert_eq!(out, c.draw().unwrap());
}

#[test]
fn draw_accelerated_is_dropped_while_gate_is_held() {
    let mut c = session(WarpConfig::default().with_backend(BackendPreference::Host));
    let gate = c.frame_gate();
    {
        let _held = gate.try_begin().unwrap();
        assert!(matches!(c.draw_accelerated(), Err(WarpError::FrameDropped)));
    }
    assert!(c.draw_accelerated().is_ok());
    assert_eq!(gate.dropped_frames(), 1);
}

#[test]
fn destroy_is_idempotent() {
    let mut c = session(WarpConfig::default().with_backend(BackendPreference::Host));
    c.draw_accelerated().unwrap();
    c.destroy();
    c.destroy();
    assert_eq!(c.state(), CompositorState::Destroyed);
    assert!(matches!(c.buffers(), Err(WarpError::Destroyed)));
    assert!(matches!(c.set_source(frame()), Err(WarpError::Destroyed)));
    assert!(matches!(c.reset_active(), Err(WarpError::Destroyed)));
}
