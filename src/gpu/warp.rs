// gpu/warp.rs — GPU execution of the composed warp kernel.
//
// `GpuWarpBackend` owns a `GpuDevice`, the compiled `warp.wgsl` pipeline and,
// once `upload` has run, one set of session buffers laid out as described in
// `backend.rs`. Per frame only three things move over the bus:
//
//   host → device   distort points + active coefficients (on update)
//   host → device   mask words into the region buffer     (every frame)
//   device → host   region buffer                         (every frame)
//
// Everything else (source image, base leg, uniforms) is written once.
//
// PRECISION
// ─────────
// WGSL has no f64, so points and coefficients are narrowed to f32 on upload.
// Positions are within a few hundred pixels and the warp is smooth, so the
// narrowing shifts a rounded sample by at most one pixel in rare cases; the
// output stays within a couple of levels of the f64 host path on smooth
// content.
//
// READBACK
// ────────
// `readback` copies the region into a MAP_READ staging buffer, maps it and
// blocks on `device.poll(Maintain::Wait)` until the map callback fires, the
// same way every other transfer in the device layer completes.

use wgpu::util::DeviceExt;

use tracing::{debug, trace};

use crate::backend::{ActiveLeg, ComputeBackend, WarpBuffers, WarpUniforms};
use crate::error::{WarpError, WarpResult};
use crate::geometry::Point2;
use crate::gpu::device::{DeviceProfile, GpuDevice, GpuError};

/// Smallest storage allocation; an empty point list still needs a binding.
const MIN_STORAGE_BYTES: u64 = 16;

// ---------------------------------------------------------------------------
// Host → device conversions
// ---------------------------------------------------------------------------

/// Interleave points as `[x0, y0, x1, y1, …]` in f32.
pub(crate) fn flatten_points(points: &[Point2]) -> Vec<f32> {
    points.iter().flat_map(|p| [p.x as f32, p.y as f32]).collect()
}

pub(crate) fn narrow(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}

/// Bytes for a storage buffer holding `contents`, padded up to the minimum
/// binding size.
fn padded_bytes(contents: &[u8]) -> Vec<u8> {
    let mut bytes = contents.to_vec();
    if (bytes.len() as u64) < MIN_STORAGE_BYTES {
        bytes.resize(MIN_STORAGE_BYTES as usize, 0);
    }
    bytes
}

// ---------------------------------------------------------------------------
// Session buffers
// ---------------------------------------------------------------------------

struct GpuSession {
    uniforms: WarpUniforms,
    distort_buf: wgpu::Buffer,
    active_coeffs_buf: wgpu::Buffer,
    region_buf: wgpu::Buffer,
    readback_buf: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    /// Uniforms, base leg and source image. Only the bind group reads them.
    _fixed: Vec<wgpu::Buffer>,
    distort_len: usize,
    coeffs_len: usize,
}

impl GpuSession {
    fn region_bytes(&self) -> u64 {
        (self.uniforms.region_len() * std::mem::size_of::<u32>()) as u64
    }
}

// ---------------------------------------------------------------------------
// GpuWarpBackend
// ---------------------------------------------------------------------------

/// Runs `warp.wgsl` over the face region.
///
/// Create with [`GpuWarpBackend::init`] (acquires a device) or
/// [`GpuWarpBackend::with_device`].
pub struct GpuWarpBackend {
    gpu: GpuDevice,
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    session: Option<GpuSession>,
}

impl GpuWarpBackend {
    /// Acquire a device for `profile` and build the pipeline.
    pub fn init(profile: DeviceProfile) -> WarpResult<Self> {
        let gpu = GpuDevice::new_with_profile(profile)?;
        Ok(Self::with_device(gpu)?)
    }

    /// Build the pipeline on an existing device.
    pub fn with_device(gpu: GpuDevice) -> Result<Self, GpuError> {
        let (pipeline, bgl) = gpu.validated("warp pipeline", || build_pipeline(&gpu))?;
        debug!(device = %gpu, "warp pipeline ready");
        Ok(GpuWarpBackend { gpu, pipeline, bgl, session: None })
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    fn session(&self) -> WarpResult<&GpuSession> {
        self.session
            .as_ref()
            .ok_or_else(|| WarpError::AcceleratorExecution("GPU backend used before upload".into()))
    }

    fn check_binding_size(&self, label: &'static str, size: u64) -> Result<(), GpuError> {
        let max = self.gpu.device.limits().max_storage_buffer_binding_size as u64;
        if size > max {
            return Err(GpuError::BufferTooLarge { label, size, max });
        }
        Ok(())
    }

    fn create_session(&self, buffers: &WarpBuffers) -> GpuSession {
        let device = &self.gpu.device;
        let storage = |label: &str, contents: &[u8], extra: wgpu::BufferUsages| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: &padded_bytes(contents),
                usage: wgpu::BufferUsages::STORAGE | extra,
            })
        };

        let uniform_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("warp uniforms"),
            contents: bytemuck::bytes_of(&buffers.uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let none = wgpu::BufferUsages::empty();
        let dst = wgpu::BufferUsages::COPY_DST;

        let mesh_buf = storage(
            "warp mesh points",
            bytemuck::cast_slice(&flatten_points(&buffers.mesh_points)),
            none,
        );
        let image_pts_buf = storage(
            "warp image points",
            bytemuck::cast_slice(&flatten_points(&buffers.image_points)),
            none,
        );
        let distort_buf = storage(
            "warp distort points",
            bytemuck::cast_slice(&flatten_points(&buffers.active.distort_points)),
            dst,
        );
        let model_buf = storage(
            "warp model points",
            bytemuck::cast_slice(&flatten_points(&buffers.model_points)),
            none,
        );
        let base_coeffs_buf = storage(
            "warp base coeffs",
            bytemuck::cast_slice(&narrow(&buffers.base_coeffs)),
            none,
        );
        let active_coeffs_buf = storage(
            "warp active coeffs",
            bytemuck::cast_slice(&narrow(&buffers.active.coeffs)),
            dst,
        );
        let image_buf = storage("warp source image", bytemuck::cast_slice(&buffers.image), none);
        let region_buf = storage(
            "warp region",
            bytemuck::cast_slice(&buffers.region_words),
            dst | wgpu::BufferUsages::COPY_SRC,
        );

        let region_bytes = (buffers.region_words.len() * std::mem::size_of::<u32>()) as u64;
        let readback_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("warp readback"),
            size: region_bytes.max(MIN_STORAGE_BYTES),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("warp BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: uniform_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: mesh_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: image_pts_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: distort_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: model_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: base_coeffs_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: active_coeffs_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: image_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 8, resource: region_buf.as_entire_binding() },
            ],
        });

        GpuSession {
            uniforms: buffers.uniforms,
            distort_buf,
            active_coeffs_buf,
            region_buf,
            readback_buf,
            bind_group,
            _fixed: vec![uniform_buf, mesh_buf, image_pts_buf, model_buf, base_coeffs_buf, image_buf],
            distort_len: buffers.active.len(),
            coeffs_len: buffers.active.coeffs.len(),
        }
    }
}

impl ComputeBackend for GpuWarpBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn upload(&mut self, buffers: &WarpBuffers) -> WarpResult<()> {
        buffers.validate()?;
        self.check_binding_size("source image", (buffers.image.len() * 4) as u64)?;
        self.check_binding_size("region", (buffers.region_words.len() * 4) as u64)?;

        self.session = None;
        let session = self.gpu.validated("upload", || self.create_session(buffers))?;
        debug!(
            region = session.uniforms.region_len(),
            base = session.uniforms.base_num_points,
            distort = session.uniforms.distort_num_points,
            "GPU buffers uploaded"
        );
        self.session = Some(session);
        Ok(())
    }

    fn update_active(&mut self, leg: &ActiveLeg) -> WarpResult<()> {
        let s = self.session()?;
        if leg.len() != s.distort_len || leg.coeffs.len() != s.coeffs_len {
            return Err(WarpError::CorrespondenceMismatch { expected: s.distort_len, got: leg.len() });
        }
        let queue = &self.gpu.queue;
        self.gpu.validated("active update", || {
            queue.write_buffer(
                &s.distort_buf,
                0,
                bytemuck::cast_slice(&flatten_points(&leg.distort_points)),
            );
            queue.write_buffer(&s.active_coeffs_buf, 0, bytemuck::cast_slice(&narrow(&leg.coeffs)));
        })?;
        Ok(())
    }

    fn reset_region(&mut self, words: &[u32]) -> WarpResult<()> {
        let s = self.session()?;
        let expected = s.uniforms.region_len();
        if words.len() != expected {
            return Err(WarpError::CorrespondenceMismatch { expected, got: words.len() });
        }
        self.gpu.queue.write_buffer(&s.region_buf, 0, bytemuck::cast_slice(words));
        Ok(())
    }

    fn execute(&mut self) -> WarpResult<()> {
        let s = self.session()?;
        let (wg_x, wg_y) = self.gpu.dispatch_size(s.uniforms.region_width, s.uniforms.region_height);
        self.gpu.validated("dispatch", || {
            let mut encoder = self.gpu.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("warp dispatch") },
            );
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("warp_region"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &s.bind_group, &[]);
                pass.dispatch_workgroups(wg_x, wg_y, 1);
            }
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
        })?;
        trace!(wg_x, wg_y, "warp dispatched");
        Ok(())
    }

    fn readback(&mut self) -> WarpResult<Vec<u32>> {
        let s = self.session()?;
        let bytes = s.region_bytes();
        let mut encoder = self.gpu.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("warp readback") },
        );
        encoder.copy_buffer_to_buffer(&s.region_buf, 0, &s.readback_buf, 0, bytes);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        self.gpu.map_read(&s.readback_buf)?;
        let words = {
            let mapped = s.readback_buf.slice(..).get_mapped_range();
            let all: &[u32] = bytemuck::cast_slice(&mapped);
            all[..s.uniforms.region_len()].to_vec()
        };
        s.readback_buf.unmap();
        Ok(words)
    }

    fn destroy(&mut self) {
        if let Some(s) = self.session.take() {
            s.region_buf.destroy();
            s.readback_buf.destroy();
            debug!("GPU session released");
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn build_pipeline(gpu: &GpuDevice) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let shader_src = gpu.workgroup_size.specialise(include_str!("../shaders/warp.wgsl"));
    let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("warp.wgsl"),
        source: wgpu::ShaderSource::Wgsl(shader_src.into()),
    });

    let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("warp BGL"),
        entries: &[
            // 0 — uniforms
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            // 1 — mesh points (base forward control)
            storage_entry(1, true),
            // 2 — image points (base inverse control)
            storage_entry(2, true),
            // 3 — distort points (active inverse control)
            storage_entry(3, true),
            // 4 — model points
            storage_entry(4, true),
            // 5 — base coefficients
            storage_entry(5, true),
            // 6 — active coefficients
            storage_entry(6, true),
            // 7 — packed source image
            storage_entry(7, true),
            // 8 — region words (read_write)
            storage_entry(8, false),
        ],
    });

    let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("warp pipeline layout"),
        bind_group_layouts: &[&bgl],
        push_constant_ranges: &[],
    });

    let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("warp_region"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: "warp_region",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    (pipeline, bgl)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
