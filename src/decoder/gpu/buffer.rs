//! Depth decoding into a storage buffer, read back through a staging copy.

use tracing::instrument;

use super::{buffer_entry, DepthEngine, Output, SlotBuffers, Trig};
use crate::decoder::slot::SlotPool;
use crate::decoder::{
    output_planes, ColorCameraParams, DecodeBackend, DecoderFlags,
    DepthCameraParams, P0Tables, DEPTH_PLANE_BYTES,
};
use crate::{Error, Result};

struct BufferSlot {
    buffers: SlotBuffers,
    planes: wgpu::Buffer,
}

pub struct DepthWgpu {
    engine: DepthEngine,
    slots: SlotPool<BufferSlot, wgpu::SubmissionIndex>,
}

impl DepthWgpu {
    pub const NAME: &'static str = "depth wgpu";

    pub fn open(flags: DecoderFlags, num_slots: usize) -> Result<Self> {
        if !flags.is_depth() {
            return Err(Error::unavailable(Self::NAME, "not a depth request"));
        }
        if flags.contains(DecoderFlags::DISABLE_GPU) {
            return Err(Error::unavailable(Self::NAME, "GPU decoding disabled"));
        }
        if flags.contains(DecoderFlags::ENABLE_TEXTURE_SHARING) {
            return Err(Error::unavailable(Self::NAME, "texture output requested"));
        }

        let engine = DepthEngine::new(Self::NAME, Trig::Table, Output::Buffer)?;
        let slots = SlotPool::new(num_slots, |_| {
            let device = engine.device();
            BufferSlot {
                buffers: SlotBuffers::new(device),
                planes: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("k4w2 depth planes"),
                    size: (DEPTH_PLANE_BYTES * 2) as u64,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                }),
            }
        });
        Ok(Self { engine, slots })
    }
}

impl DecodeBackend for DepthWgpu {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn set_params(
        &mut self,
        _color: &ColorCameraParams,
        depth: &DepthCameraParams,
        p0: &P0Tables,
    ) -> Result<()> {
        self.engine.set_params(depth, p0);
        Ok(())
    }

    #[instrument(skip(self, src), fields(len = src.len()))]
    fn request(&mut self, slot: usize, src: &[u8]) -> Result<()> {
        let state = self.slots.get(slot)?;
        let mut encoder = self.engine.encode(
            &state.buffers,
            src,
            &[buffer_entry(3, &state.planes)],
        )?;
        encoder.copy_buffer_to_buffer(
            &state.planes,
            0,
            &state.buffers.staging,
            0,
            (DEPTH_PLANE_BYTES * 2) as u64,
        );
        let token = self.engine.submit(encoder);
        self.slots.submit(slot, token)?;
        Ok(())
    }

    fn wait(&mut self, slot: usize) -> Result<()> {
        let token = self
            .slots
            .pending(slot)?
            .cloned()
            .ok_or(Error::NotRequested(slot))?;
        self.engine.wait(token)
    }

    #[instrument(skip(self, dst), fields(len = dst.len()))]
    fn fetch(&mut self, slot: usize, dst: &mut [u8]) -> Result<()> {
        output_planes(dst.len())?;
        let (token, state) = self.slots.complete(slot)?;
        self.engine.read_back(&state.buffers, token, dst)
    }

    fn close(&mut self) -> Result<()> {
        let pending = self.slots.drain_pending();
        self.engine.drain(pending.len())
    }
}
