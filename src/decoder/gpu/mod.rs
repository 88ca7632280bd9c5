//! wgpu compute backends for the depth pipeline.
//!
//! Both backends run the same two kernels per frame; they differ in where
//! stage 1 gets its trigonometry from and where stage 2 writes. Kernels are
//! compiled from WGSL sources prefixed with the [`DepthParameters`] as
//! constants.

mod buffer;
mod texture;

pub use buffer::DepthWgpu;
pub use texture::DepthWgpuTexture;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

use crate::capture::frame::{DEPTH_FRAME_SIZE, DEPTH_HEIGHT, DEPTH_PIXELS, DEPTH_SUBFRAME_SIZE, DEPTH_WIDTH};
use crate::decoder::depth::{ROW_WORDS, WORK_STRIDE};
use crate::decoder::tables::SATURATED;
use crate::decoder::{
    CalibrationTables, DepthCameraParams, DepthParameters, P0Tables, DEPTH_PLANE_BYTES,
};
use crate::{Error, Result};

const COMMON_WGSL: &str = include_str!("shaders/depth_common.wgsl");
const STAGE1_WGSL: &str = include_str!("shaders/stage1.wgsl");
const STAGE1_TRIG_WGSL: &str = include_str!("shaders/stage1_trig.wgsl");
const STAGE1_P0_WGSL: &str = include_str!("shaders/stage1_p0.wgsl");
const STAGE2_WGSL: &str = include_str!("shaders/stage2.wgsl");
const STAGE2_BUFFER_WGSL: &str = include_str!("shaders/stage2_buffer.wgsl");
const STAGE2_TEXTURE_WGSL: &str = include_str!("shaders/stage2_texture.wgsl");

const WORKGROUP_SIZE: u32 = 256;

/// Where stage 1 reads its per-pixel trigonometry from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trig {
    /// The precomputed six-entry tables.
    Table,
    /// The raw phase offset angles; cos/sin run in the kernel.
    Angles,
}

/// Where stage 2 writes depth and infrared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Output {
    Buffer,
    Texture,
}

/// WGSL constant block carrying the frame geometry and `params`.
pub(crate) fn prelude(params: &DepthParameters) -> String {
    let ints = [
        ("WIDTH", DEPTH_WIDTH),
        ("HEIGHT", DEPTH_HEIGHT),
        ("PIXELS", DEPTH_PIXELS),
        ("SUBFRAME_WORDS", DEPTH_SUBFRAME_SIZE / 2),
        ("ROW_WORDS", ROW_WORDS),
    ];
    let [f0, f1, f2] = params.ab_multiplier_per_frq;
    let [p0, p1, p2] = params.phase_in_rad;
    let floats = [
        ("AB_MULTIPLIER", params.ab_multiplier),
        ("AB_MULTIPLIER_PER_FRQ0", f0),
        ("AB_MULTIPLIER_PER_FRQ1", f1),
        ("AB_MULTIPLIER_PER_FRQ2", f2),
        ("AB_OUTPUT_MULTIPLIER", params.ab_output_multiplier),
        ("PHASE_IN_RAD0", p0),
        ("PHASE_IN_RAD1", p1),
        ("PHASE_IN_RAD2", p2),
        ("PHASE_OFFSET", params.phase_offset),
        ("UNAMBIGIOUS_DIST", params.unambigious_dist),
        ("INDIVIDUAL_AB_THRESHOLD", params.individual_ab_threshold),
        ("AB_THRESHOLD", params.ab_threshold),
        ("AB_CONFIDENCE_SLOPE", params.ab_confidence_slope),
        ("AB_CONFIDENCE_OFFSET", params.ab_confidence_offset),
        ("MIN_DEALIAS_CONFIDENCE", params.min_dealias_confidence),
        ("MAX_DEALIAS_CONFIDENCE", params.max_dealias_confidence),
    ];

    let mut src: String = ints
        .iter()
        .map(|(name, v)| format!("const {name}: u32 = {v}u;\n"))
        .collect();
    src.push_str(&format!("const SATURATED: i32 = {SATURATED};\n"));
    src.extend(
        floats
            .iter()
            .map(|(name, v)| format!("const {name}: f32 = {v:?};\n")),
    );
    src
}

pub(crate) fn stage1_source(params: &DepthParameters, trig: Trig) -> String {
    let variant = match trig {
        Trig::Table => STAGE1_TRIG_WGSL,
        Trig::Angles => STAGE1_P0_WGSL,
    };
    format!("{}\n{COMMON_WGSL}\n{STAGE1_WGSL}\n{variant}", prelude(params))
}

pub(crate) fn stage2_source(params: &DepthParameters, output: Output) -> String {
    let variant = match output {
        Output::Buffer => STAGE2_BUFFER_WGSL,
        Output::Texture => STAGE2_TEXTURE_WGSL,
    };
    format!("{}\n{COMMON_WGSL}\n{STAGE2_WGSL}\n{variant}", prelude(params))
}

/// Device and queue owned by one backend.
pub(crate) struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: String,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    pub fn new(backend: &'static str) -> Result<Self> {
        pollster::block_on(Self::request(backend))
    }

    async fn request(backend: &'static str) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::unavailable(backend, "no suitable GPU adapter"))?;

        let info = adapter.get_info();
        debug!(adapter = %info.name, backend = ?info.backend, "GPU adapter selected");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(backend),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| Error::unavailable(backend, format!("device request failed: {e}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            warn!(?reason, "GPU device lost: {message}");
            flag.store(true, Ordering::Release);
        });

        Ok(Self {
            device,
            queue,
            adapter: info.name,
            lost,
        })
    }

    /// Block until `maintain` is satisfied, then report a lost device.
    fn poll(&self, maintain: wgpu::Maintain) -> Result<()> {
        self.device.poll(maintain);
        if self.lost.load(Ordering::Acquire) {
            return Err(Error::Gpu("device lost".into()));
        }
        Ok(())
    }
}

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

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: String,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });
    (pipeline, layout)
}

struct DepthKernels {
    stage1: wgpu::ComputePipeline,
    stage1_layout: wgpu::BindGroupLayout,
    stage2: wgpu::ComputePipeline,
    stage2_layout: wgpu::BindGroupLayout,
}

impl DepthKernels {
    fn new(device: &wgpu::Device, params: &DepthParameters, trig: Trig, output: Output) -> Self {
        let (stage1, stage1_layout) = compute_pipeline(
            device,
            "k4w2 depth stage1",
            stage1_source(params, trig),
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
            ],
        );

        let mut entries = vec![
            storage_entry(0, true),
            storage_entry(1, true),
            storage_entry(2, true),
        ];
        match output {
            Output::Buffer => entries.push(storage_entry(3, false)),
            Output::Texture => entries.extend([texture_entry(3), texture_entry(4)]),
        }
        let (stage2, stage2_layout) =
            compute_pipeline(device, "k4w2 depth stage2", stage2_source(params, output), &entries);

        Self {
            stage1,
            stage1_layout,
            stage2,
            stage2_layout,
        }
    }
}

/// Calibration tables resident on the device.
struct GpuTables {
    lut: wgpu::Buffer,
    x: wgpu::Buffer,
    z: wgpu::Buffer,
    /// Trig table or p0 angles, three frequency blocks back to back.
    phase: wgpu::Buffer,
}

pub(crate) fn buffer_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn init_buffer(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage: wgpu::BufferUsages::STORAGE,
    })
}

impl GpuTables {
    fn new(device: &wgpu::Device, tables: &CalibrationTables, trig: Trig) -> Self {
        let lut: Vec<i32> = tables.lut.iter().map(|&v| i32::from(v)).collect();
        let phase = match trig {
            Trig::Table => tables.trig.concat(),
            Trig::Angles => tables.p0.concat(),
        };
        Self {
            lut: init_buffer(device, "k4w2 lut", bytemuck::cast_slice(&lut)),
            x: init_buffer(device, "k4w2 x table", bytemuck::cast_slice(&tables.xz.x)),
            z: init_buffer(device, "k4w2 z table", bytemuck::cast_slice(&tables.xz.z)),
            phase: init_buffer(device, "k4w2 phase table", bytemuck::cast_slice(&phase)),
        }
    }
}

/// Buffers every slot needs regardless of the output kind.
pub(crate) struct SlotBuffers {
    packet: wgpu::Buffer,
    work: wgpu::Buffer,
    /// Both output planes, mapped by `fetch`.
    staging: wgpu::Buffer,
}

impl SlotBuffers {
    fn new(device: &wgpu::Device) -> Self {
        let buffer = |label, size: usize, usage| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage,
                mapped_at_creation: false,
            })
        };
        Self {
            packet: buffer(
                "k4w2 packet",
                DEPTH_FRAME_SIZE,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            ),
            work: buffer(
                "k4w2 work",
                DEPTH_PIXELS * WORK_STRIDE * 4,
                wgpu::BufferUsages::STORAGE,
            ),
            staging: buffer(
                "k4w2 staging",
                DEPTH_PLANE_BYTES * 2,
                wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            ),
        }
    }
}

/// Device state plus kernels shared by the two backends.
pub(crate) struct DepthEngine {
    ctx: GpuContext,
    kernels: DepthKernels,
    params: DepthParameters,
    trig: Trig,
    tables: Option<GpuTables>,
}

impl DepthEngine {
    fn new(backend: &'static str, trig: Trig, output: Output) -> Result<Self> {
        let ctx = GpuContext::new(backend)?;
        let params = DepthParameters::default();

        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let kernels = DepthKernels::new(&ctx.device, &params, trig, output);
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(Error::unavailable(backend, format!("kernel build failed: {e}")));
        }
        info!(adapter = %ctx.adapter, backend, "depth kernels ready");

        Ok(Self {
            ctx,
            kernels,
            params,
            trig,
            tables: None,
        })
    }

    fn device(&self) -> &wgpu::Device {
        &self.ctx.device
    }

    fn set_params(&mut self, depth: &DepthCameraParams, p0: &P0Tables) {
        let tables = CalibrationTables::new(depth, p0, &self.params);
        self.tables = Some(GpuTables::new(&self.ctx.device, &tables, self.trig));
    }

    /// Upload `src` and record both stages. Stage 2 outputs are bound from
    /// binding 3 on.
    fn encode(
        &self,
        slot: &SlotBuffers,
        src: &[u8],
        outputs: &[wgpu::BindGroupEntry<'_>],
    ) -> Result<wgpu::CommandEncoder> {
        if src.len() != DEPTH_FRAME_SIZE {
            return Err(Error::InvalidLength {
                expected: DEPTH_FRAME_SIZE,
                actual: src.len(),
            });
        }
        let tables = self
            .tables
            .as_ref()
            .ok_or_else(|| Error::Calibration("depth tables not set".into()))?;
        let device = &self.ctx.device;

        self.ctx.queue.write_buffer(&slot.packet, 0, src);

        let stage1 = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("k4w2 depth stage1"),
            layout: &self.kernels.stage1_layout,
            entries: &[
                buffer_entry(0, &slot.packet),
                buffer_entry(1, &tables.lut),
                buffer_entry(2, &tables.phase),
                buffer_entry(3, &tables.z),
                buffer_entry(4, &slot.work),
            ],
        });

        let mut stage2_entries = vec![
            buffer_entry(0, &slot.work),
            buffer_entry(1, &tables.x),
            buffer_entry(2, &tables.z),
        ];
        stage2_entries.extend_from_slice(outputs);
        let stage2 = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("k4w2 depth stage2"),
            layout: &self.kernels.stage2_layout,
            entries: &stage2_entries,
        });

        let groups = (DEPTH_PIXELS as u32).div_ceil(WORKGROUP_SIZE);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("k4w2 depth"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("k4w2 depth"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.kernels.stage1);
            pass.set_bind_group(0, &stage1, &[]);
            pass.dispatch_workgroups(groups, 1, 1);

            pass.set_pipeline(&self.kernels.stage2);
            pass.set_bind_group(0, &stage2, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        Ok(encoder)
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) -> wgpu::SubmissionIndex {
        self.ctx.queue.submit(std::iter::once(encoder.finish()))
    }

    fn wait(&self, token: wgpu::SubmissionIndex) -> Result<()> {
        self.ctx.poll(wgpu::Maintain::WaitForSubmissionIndex(token))
    }

    /// Wait for `token`, then copy the first `dst.len()` staged bytes out.
    fn read_back(
        &self,
        slot: &SlotBuffers,
        token: wgpu::SubmissionIndex,
        dst: &mut [u8],
    ) -> Result<()> {
        let slice = slot.staging.slice(..dst.len() as u64);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait(token)?;

        pollster::block_on(receiver)
            .map_err(|_| Error::Gpu("staging map was cancelled".into()))?
            .map_err(|e| Error::Gpu(format!("failed to map staging buffer: {e:?}")))?;
        {
            let data = slice.get_mapped_range();
            dst.copy_from_slice(&data);
        }
        slot.staging.unmap();
        Ok(())
    }

    /// Finish outstanding work before the device goes away.
    fn drain(&self, pending: usize) -> Result<()> {
        if pending > 0 {
            debug!(pending, "waiting for unfetched slots");
        }
        self.ctx.poll(wgpu::Maintain::Wait)
    }
}
