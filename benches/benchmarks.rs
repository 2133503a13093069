// benches/benchmarks.rs -- Per-stage warp benchmarks on the CPU.
//
//   cargo bench
//
// A synthetic 68-landmark face in a 640×480 frame: jaw ring, inner ring
// and a few centre points, roughly what a landmark detector reports.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use pareidolia::backend::{ComputeBackend, HostBackend};
use pareidolia::compose::{Silhouette, WarpCompositor};
use pareidolia::config::WarpConfig;
use pareidolia::geometry::Point2;
use pareidolia::image::{Image, Rgba};
use pareidolia::mask::{MaskMode, RegionMask};
use pareidolia::tps::ThinPlateSpline;

// ============================================================
// Helpers
// ============================================================

fn make_face(cx: f64, cy: f64, scale: f64) -> Vec<Point2> {
    let mut pts = Vec::with_capacity(68);
    for k in 0..40 {
        let a = k as f64 / 40.0 * std::f64::consts::TAU;
        pts.push(Point2::new(cx + 110.0 * scale * a.cos(), cy + 140.0 * scale * a.sin()));
    }
    for k in 0..24 {
        let a = (k as f64 + 0.5) / 24.0 * std::f64::consts::TAU;
        pts.push(Point2::new(cx + 55.0 * scale * a.cos(), cy + 70.0 * scale * a.sin()));
    }
    for (dx, dy) in [(-12.0, -8.0), (13.0, -6.0), (-4.0, 15.0), (6.0, 9.0)] {
        pts.push(Point2::new(cx + dx * scale, cy + dy * scale));
    }
    pts
}

fn jaw(face: &[Point2]) -> Vec<Point2> {
    face[..40].to_vec()
}

fn make_frame(w: usize, h: usize) -> Image<Rgba> {
    Image::from_fn(w, h, |x, y| {
        let check = (((x / 16) + (y / 16)) % 2) as u8;
        Rgba::new((x * 255 / w) as u8, (y * 255 / h) as u8, 80 + check * 100, 255)
    })
}

/// Landmarks for frame `t` of a slow wobble.
fn wobble(face: &[Point2], t: usize) -> Vec<Point2> {
    let phase = t as f64 * 0.3;
    face.iter()
        .enumerate()
        .map(|(i, p)| {
            let s = (phase + i as f64 * 0.7).sin();
            Point2::new(p.x + 3.0 * s, p.y + 2.0 * (phase - i as f64 * 0.4).cos())
        })
        .collect()
}

fn make_session(config: WarpConfig) -> WarpCompositor {
    let model = make_face(320.0, 240.0, 1.0);
    let observed = make_face(318.0, 244.0, 1.05);
    WarpCompositor::new(
        &model,
        &observed,
        &model,
        Silhouette::Model(jaw(&model)),
        make_frame(640, 480),
        config,
    )
    .expect("synthetic session")
}

// ============================================================
// Spline fitting
// ============================================================

fn bench_tps(c: &mut Criterion) {
    let model = make_face(320.0, 240.0, 1.0);
    let observed = make_face(318.0, 244.0, 1.05);

    let mut group = c.benchmark_group("tps");

    group.bench_function("fit_68", |b| {
        b.iter(|| ThinPlateSpline::fitted(&model, &observed).unwrap())
    });

    let mut tps = ThinPlateSpline::fitted(&model, &model).unwrap();
    let targets = wobble(&model, 3);
    group.bench_function("update_target_points_68", |b| {
        b.iter(|| {
            tps.update_target_points(&targets).unwrap();
        })
    });
    group.bench_function("update_inverse_target_points_68", |b| {
        b.iter(|| {
            tps.update_inverse_target_points(&targets).unwrap();
        })
    });

    group.finish();
}

// ============================================================
// Region mask
// ============================================================

fn bench_mask(c: &mut Criterion) {
    let outline = jaw(&make_face(320.0, 240.0, 1.0));

    let mut group = c.benchmark_group("mask");
    for mode in [MaskMode::ConvexHull, MaskMode::Polygon] {
        group.bench_with_input(BenchmarkId::new("build_20_passes", format!("{mode:?}")), &mode, |b, &m| {
            b.iter(|| RegionMask::build(&outline, m, 20).unwrap())
        });
    }
    group.finish();
}

// ============================================================
// Draw
// ============================================================

fn bench_draw(c: &mut Criterion) {
    let mut group = c.benchmark_group("draw");
    group.sample_size(20);

    for scale in [1usize, 2, 4] {
        let mut session = make_session(WarpConfig::default());
        session.update_active_targets(&wobble(&make_face(320.0, 240.0, 1.0), 1));
        group.bench_with_input(BenchmarkId::new("cpu", scale), &scale, |b, &s| {
            b.iter(|| session.draw_scaled(s).unwrap())
        });
    }

    let mut session = make_session(WarpConfig::default().with_precompute_base_inverse(false));
    session.update_active_targets(&wobble(&make_face(320.0, 240.0, 1.0), 1));
    group.bench_function("cpu_no_grid", |b| b.iter(|| session.draw_scaled(1).unwrap()));

    // Host backend, execute only: upload happens once outside the loop.
    let session = make_session(WarpConfig::default());
    let buffers = session.buffers().unwrap();
    let mut host = HostBackend::new();
    host.upload(&buffers).unwrap();
    group.bench_function("host_execute", |b| {
        b.iter(|| {
            host.reset_region(&buffers.region_words).unwrap();
            host.execute().unwrap();
        })
    });

    group.finish();
}

// ============================================================
// Per-frame loop: update + draw
// ============================================================

fn bench_frame_loop(c: &mut Criterion) {
    let model = make_face(320.0, 240.0, 1.0);
    let frames: Vec<Vec<Point2>> = (0..16).map(|t| wobble(&model, t)).collect();

    let mut group = c.benchmark_group("frame_loop");
    group.sample_size(20);

    let mut session = make_session(WarpConfig::default());
    session.set_backend(Box::new(HostBackend::new()));
    let mut t = 0usize;
    group.bench_function("update_and_draw_host", |b| {
        b.iter(|| {
            session.update_active_targets(&frames[t % frames.len()]);
            t += 1;
            session.draw_accelerated().unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_tps, bench_mask, bench_draw, bench_frame_loop);
criterion_main!(benches);
