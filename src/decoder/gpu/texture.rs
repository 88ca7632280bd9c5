//! Depth decoding into `R32Float` textures that stay on the device.
//!
//! The textures can be bound by a renderer sharing the device; `fetch`
//! still copies them out so the backend behaves like every other one.

use tracing::{debug, instrument};

use super::{DepthEngine, Output, SlotBuffers, Trig};
use crate::capture::frame::{DEPTH_HEIGHT, DEPTH_WIDTH};
use crate::decoder::slot::SlotPool;
use crate::decoder::{
    output_planes, ColorCameraParams, DecodeBackend, DecoderFlags,
    DepthCameraParams, P0Tables, Plane, DEPTH_PLANE_BYTES,
};
use crate::{Error, Result};

const ROW_BYTES: u32 = DEPTH_WIDTH as u32 * 4;

struct TextureSlot {
    buffers: SlotBuffers,
    depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
    ir: wgpu::Texture,
    ir_view: wgpu::TextureView,
}

fn plane_texture(device: &wgpu::Device, label: &str) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: DEPTH_WIDTH as u32,
            height: DEPTH_HEIGHT as u32,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R32Float,
        usage: wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

impl TextureSlot {
    fn new(device: &wgpu::Device) -> Self {
        let depth = plane_texture(device, "k4w2 depth texture");
        let ir = plane_texture(device, "k4w2 ir texture");
        Self {
            buffers: SlotBuffers::new(device),
            depth_view: depth.create_view(&Default::default()),
            depth,
            ir_view: ir.create_view(&Default::default()),
            ir,
        }
    }

    fn copy_out(&self, encoder: &mut wgpu::CommandEncoder) {
        for (texture, offset) in [(&self.depth, 0), (&self.ir, DEPTH_PLANE_BYTES as u64)] {
            encoder.copy_texture_to_buffer(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyBuffer {
                    buffer: &self.buffers.staging,
                    layout: wgpu::ImageDataLayout {
                        offset,
                        bytes_per_row: Some(ROW_BYTES),
                        rows_per_image: Some(DEPTH_HEIGHT as u32),
                    },
                },
                texture.size(),
            );
        }
    }
}

pub struct DepthWgpuTexture {
    engine: DepthEngine,
    slots: SlotPool<TextureSlot, wgpu::SubmissionIndex>,
}

impl DepthWgpuTexture {
    pub const NAME: &'static str = "depth wgpu texture";

    pub fn open(flags: DecoderFlags, num_slots: usize) -> Result<Self> {
        if !flags.is_depth() {
            return Err(Error::unavailable(Self::NAME, "not a depth request"));
        }
        if !flags.contains(DecoderFlags::ENABLE_TEXTURE_SHARING) {
            return Err(Error::unavailable(Self::NAME, "texture sharing not requested"));
        }
        if flags.contains(DecoderFlags::DISABLE_GPU)
            || flags.contains(DecoderFlags::DISABLE_GPU_TEXTURE)
        {
            return Err(Error::unavailable(Self::NAME, "GPU decoding disabled"));
        }

        let engine = DepthEngine::new(Self::NAME, Trig::Angles, Output::Texture)?;
        debug!(num_slots, "allocating depth textures");
        let slots = SlotPool::new(num_slots, |_| TextureSlot::new(engine.device()));
        Ok(Self { engine, slots })
    }
}

impl DecodeBackend for DepthWgpuTexture {
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
            &[
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&state.depth_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(&state.ir_view),
                },
            ],
        )?;
        state.copy_out(&mut encoder);
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

    fn gpu_texture(&self, slot: usize, plane: Plane) -> Option<&wgpu::Texture> {
        let state = self.slots.get(slot).ok()?;
        Some(match plane {
            Plane::Depth => &state.depth,
            Plane::Ir => &state.ir,
        })
    }
}
