//! Depth decoding on the CPU, rows split across scoped threads.
//!
//! `request` runs stage 1 into the slot's work area; `fetch` runs stage 2
//! straight into the output planes.

use tracing::{debug, instrument};

use crate::capture::frame::{DEPTH_FRAME_SIZE, DEPTH_HEIGHT, DEPTH_PIXELS, DEPTH_WIDTH};
use crate::decoder::depth::{
    decode_measurement, process_measurement_triple, process_pixel_stage2, WORK_STRIDE,
};
use crate::decoder::slot::SlotPool;
use crate::decoder::{
    output_planes, CalibrationTables, ColorCameraParams, DecodeBackend, DecoderFlags,
    DepthCameraParams, DepthParameters, P0Tables,
};
use crate::{Error, Result};

pub const NAME: &str = "depth cpu";

struct CpuSlot {
    work: Vec<f32>,
    out: Vec<f32>,
}

pub struct DepthCpu {
    params: DepthParameters,
    tables: Option<CalibrationTables>,
    threads: usize,
    slots: SlotPool<CpuSlot>,
}

impl DepthCpu {
    pub const NAME: &'static str = NAME;

    pub fn open(flags: DecoderFlags, num_slots: usize, threads: usize) -> Result<Self> {
        if !flags.is_depth() {
            return Err(Error::unavailable(NAME, "not a depth request"));
        }
        debug!(num_slots, threads, "allocating depth work areas");
        Ok(Self {
            params: DepthParameters::default(),
            tables: None,
            threads: threads.max(1),
            slots: SlotPool::new(num_slots, |_| CpuSlot {
                work: vec![0.0; DEPTH_PIXELS * WORK_STRIDE],
                out: vec![0.0; DEPTH_PIXELS * 2],
            }),
        })
    }

    /// Rows per thread, rounded up.
    fn rows_per_chunk(&self) -> usize {
        DEPTH_HEIGHT.div_ceil(self.threads)
    }
}

fn stage1_rows(
    params: &DepthParameters,
    tables: &CalibrationTables,
    src: &[u8],
    first_row: usize,
    work: &mut [f32],
) {
    for (n, p) in work.chunks_exact_mut(WORK_STRIDE).enumerate() {
        let x = n % DEPTH_WIDTH;
        let y = first_row + n / DEPTH_WIDTH;
        let i = y * DEPTH_WIDTH + x;
        let z = tables.xz.z[i];
        for k in 0..3 {
            let m = [0, 1, 2].map(|j| decode_measurement(src, &tables.lut, k * 3 + j, x, y));
            let out = process_measurement_triple(
                &tables.trig[k][i * 6..i * 6 + 6],
                params.ab_multiplier_per_frq[k],
                params.ab_multiplier,
                z,
                m,
            );
            p[k * 3..k * 3 + 3].copy_from_slice(&out);
        }
    }
}

/// Output rows are flipped: output row `r` holds sensor row `423 - r`.
fn stage2_rows(
    params: &DepthParameters,
    tables: &CalibrationTables,
    work: &[f32],
    first_row: usize,
    depth: &mut [f32],
    ir: &mut [f32],
) {
    for (n, (d, a)) in depth.iter_mut().zip(ir.iter_mut()).enumerate() {
        let x = n % DEPTH_WIDTH;
        let y = DEPTH_HEIGHT - 1 - (first_row + n / DEPTH_WIDTH);
        let i = y * DEPTH_WIDTH + x;
        let (dv, av) = process_pixel_stage2(
            params,
            tables.xz.x[i],
            tables.xz.z[i],
            &work[i * WORK_STRIDE..(i + 1) * WORK_STRIDE],
        );
        *d = dv;
        *a = av;
    }
}

impl DecodeBackend for DepthCpu {
    fn name(&self) -> &'static str {
        NAME
    }

    fn set_params(
        &mut self,
        _color: &ColorCameraParams,
        depth: &DepthCameraParams,
        p0: &P0Tables,
    ) -> Result<()> {
        let tables = CalibrationTables::new(depth, p0, &self.params);
        if tables.xz.divergent > 0 {
            debug!(divergent = tables.xz.divergent, "undistortion did not settle everywhere");
        }
        self.tables = Some(tables);
        Ok(())
    }

    #[instrument(skip(self, src), fields(len = src.len()))]
    fn request(&mut self, slot: usize, src: &[u8]) -> Result<()> {
        if src.len() != DEPTH_FRAME_SIZE {
            return Err(Error::InvalidLength {
                expected: DEPTH_FRAME_SIZE,
                actual: src.len(),
            });
        }
        let rows = self.rows_per_chunk();
        let Self {
            params,
            tables,
            threads,
            slots,
        } = self;
        let params: &DepthParameters = params;
        let tables = tables
            .as_ref()
            .ok_or_else(|| Error::Calibration("depth tables not set".into()))?;
        let work = &mut slots.get_mut(slot)?.work;

        if *threads == 1 {
            stage1_rows(params, tables, src, 0, work);
        } else {
            crossbeam::thread::scope(|s| {
                for (chunk, part) in work.chunks_mut(rows * DEPTH_WIDTH * WORK_STRIDE).enumerate() {
                    s.spawn(move |_| stage1_rows(params, tables, src, chunk * rows, part));
                }
            })
            .map_err(|_| Error::ThreadPanicked)?;
        }

        slots.submit(slot, ())?;
        Ok(())
    }

    #[instrument(skip(self, dst), fields(len = dst.len()))]
    fn fetch(&mut self, slot: usize, dst: &mut [u8]) -> Result<()> {
        let planes = output_planes(dst.len())?;
        let rows = self.rows_per_chunk();
        let Self {
            params,
            tables,
            threads,
            slots,
        } = self;
        let params: &DepthParameters = params;
        let tables = tables
            .as_ref()
            .ok_or_else(|| Error::Calibration("depth tables not set".into()))?;
        let ((), state) = slots.complete(slot)?;
        let work = &state.work;
        let (depth, ir) = state.out.split_at_mut(DEPTH_PIXELS);

        if *threads == 1 {
            stage2_rows(params, tables, work, 0, depth, ir);
        } else {
            let chunk_len = rows * DEPTH_WIDTH;
            crossbeam::thread::scope(|s| {
                for (chunk, (d, a)) in depth
                    .chunks_mut(chunk_len)
                    .zip(ir.chunks_mut(chunk_len))
                    .enumerate()
                {
                    s.spawn(move |_| stage2_rows(params, tables, work, chunk * rows, d, a));
                }
            })
            .map_err(|_| Error::ThreadPanicked)?;
        }

        dst.copy_from_slice(bytemuck::cast_slice(&state.out[..planes * DEPTH_PIXELS]));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let dropped = self.slots.drain_pending();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "closing with unfetched slots");
        }
        Ok(())
    }
}
