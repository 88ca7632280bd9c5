//! Decoder backends behind one request/fetch contract.
//!
//! A [`DecoderRegistry`] probes its backends in registration order and hands
//! out the first one that accepts the requested [`DecoderFlags`], wrapped in a
//! [`Decoder`] handle. Every backend owns `num_slots` independent working
//! sets so a frame can be requested into one slot while another is fetched.

pub mod color_cpu;
pub mod depth;
pub mod depth_cpu;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod params;
pub mod registry;
pub mod slot;
pub mod tables;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, warn};

use crate::capture::frame::DEPTH_PIXELS;
use crate::{Error, Result};

pub use params::{CameraParams, ColorCameraParams, DepthCameraParams, DepthParameters, P0Tables};
pub use registry::{BackendFactory, DecoderRegistry};
pub use slot::SlotPool;
pub use tables::CalibrationTables;

/// Bytes of one 512x424 f32 output plane.
pub const DEPTH_PLANE_BYTES: usize = DEPTH_PIXELS * std::mem::size_of::<f32>();

/// Decoder kind plus capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DecoderFlags(u32);

impl DecoderFlags {
    pub const COLOR: Self = Self(0);
    pub const DEPTH: Self = Self(1);
    pub const TYPE_MASK: Self = Self(0x0f);
    /// Skip every GPU backend.
    pub const DISABLE_GPU: Self = Self(1 << 5);
    /// Skip the texture-output GPU backend.
    pub const DISABLE_GPU_TEXTURE: Self = Self(1 << 6);
    /// Ask for results as GPU textures, see [`Decoder::gpu_texture`].
    pub const ENABLE_TEXTURE_SHARING: Self = Self(1 << 7);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The type field, `COLOR` or `DEPTH`.
    pub const fn kind(self) -> Self {
        Self(self.0 & Self::TYPE_MASK.0)
    }

    pub const fn is_color(self) -> bool {
        self.kind().0 == Self::COLOR.0
    }

    pub const fn is_depth(self) -> bool {
        self.kind().0 == Self::DEPTH.0
    }

    /// True when every bit of `other` is set. Meaningful for the capability
    /// bits only, since `COLOR` has none.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DecoderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DecoderFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DecoderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_depth() { "depth" } else { "color" };
        write!(f, "{kind}")?;
        for (flag, name) in [
            (Self::DISABLE_GPU, "no-gpu"),
            (Self::DISABLE_GPU_TEXTURE, "no-gpu-texture"),
            (Self::ENABLE_TEXTURE_SHARING, "texture-sharing"),
        ] {
            if self.contains(flag) {
                write!(f, "|{name}")?;
            }
        }
        Ok(())
    }
}

/// Channel order of decoded color images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    Rgb,
    #[default]
    Bgr,
}

/// Output planes of a depth decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Depth,
    Ir,
}

/// One decoded depth frame: millimetres and infrared intensity, both
/// 512x424 with row 0 at the top of the image.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    pub depth: Vec<f32>,
    pub ir: Vec<f32>,
}

/// Operations a decoder backend provides. The optional ones default to
/// [`Error::NotSupported`].
pub trait DecodeBackend: Send {
    fn name(&self) -> &'static str;

    /// Derive the backend's tables from the device calibration blobs.
    fn set_params(
        &mut self,
        _color: &ColorCameraParams,
        _depth: &DepthCameraParams,
        _p0: &P0Tables,
    ) -> Result<()> {
        Err(Error::NotSupported(self.name()))
    }

    /// Stage `src` for decoding into `slot`.
    fn request(&mut self, slot: usize, src: &[u8]) -> Result<()>;

    /// Block until the work requested into `slot` is done, keeping the result.
    fn wait(&mut self, _slot: usize) -> Result<()> {
        Err(Error::NotSupported(self.name()))
    }

    /// Copy the result of `slot` into `dst`, blocking if needed. Consumes
    /// the request.
    fn fetch(&mut self, slot: usize, dst: &mut [u8]) -> Result<()>;

    /// Release resources after every pending slot finished.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Output texture of `slot`, for backends that render into textures.
    #[cfg(feature = "gpu")]
    fn gpu_texture(&self, _slot: usize, _plane: Plane) -> Option<&wgpu::Texture> {
        None
    }

    fn colorspace(&self) -> Result<ColorSpace> {
        Err(Error::NotSupported(self.name()))
    }

    fn set_colorspace(&mut self, _colorspace: ColorSpace) -> Result<()> {
        Err(Error::NotSupported(self.name()))
    }
}

/// Split a depth `fetch` destination into its plane count.
pub(crate) fn output_planes(dst_len: usize) -> Result<usize> {
    match dst_len {
        n if n == DEPTH_PLANE_BYTES => Ok(1),
        n if n == DEPTH_PLANE_BYTES * 2 => Ok(2),
        n => Err(Error::InvalidLength {
            expected: DEPTH_PLANE_BYTES * 2,
            actual: n,
        }),
    }
}

/// An opened backend. Closed exactly once, by [`Decoder::close`] or on drop.
pub struct Decoder {
    backend: Box<dyn DecodeBackend>,
    flags: DecoderFlags,
    num_slots: usize,
    closed: bool,
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("backend", &self.backend.name())
            .field("flags", &self.flags)
            .field("num_slots", &self.num_slots)
            .finish()
    }
}

impl Decoder {
    pub(crate) fn new(backend: Box<dyn DecodeBackend>, flags: DecoderFlags, num_slots: usize) -> Self {
        Self {
            backend,
            flags,
            num_slots,
            closed: false,
        }
    }

    /// Registered name of the selected backend.
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn flags(&self) -> DecoderFlags {
        self.flags
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.num_slots {
            return Err(Error::InvalidSlot {
                slot,
                count: self.num_slots,
            });
        }
        Ok(())
    }

    pub fn set_params(
        &mut self,
        color: &ColorCameraParams,
        depth: &DepthCameraParams,
        p0: &P0Tables,
    ) -> Result<()> {
        self.backend.set_params(color, depth, p0)
    }

    pub fn request(&mut self, slot: usize, src: &[u8]) -> Result<()> {
        self.check_slot(slot)?;
        let start = Instant::now();
        self.backend.request(slot, src)?;
        if self.flags.is_depth() {
            histogram!("k4w2_depth_request_us", "backend" => self.backend.name())
                .record(start.elapsed().as_micros() as f64);
        }
        Ok(())
    }

    pub fn wait(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.backend.wait(slot)
    }

    pub fn fetch(&mut self, slot: usize, dst: &mut [u8]) -> Result<()> {
        self.check_slot(slot)?;
        let start = Instant::now();
        self.backend.fetch(slot, dst)?;
        if self.flags.is_depth() {
            histogram!("k4w2_depth_fetch_us", "backend" => self.backend.name())
                .record(start.elapsed().as_micros() as f64);
        }
        Ok(())
    }

    /// [`Decoder::fetch`] both planes of a depth decoder into owned images.
    pub fn fetch_depth(&mut self, slot: usize) -> Result<DepthImage> {
        let mut planes = vec![0f32; DEPTH_PIXELS * 2];
        self.fetch(slot, bytemuck::cast_slice_mut(&mut planes))?;
        let ir = planes.split_off(DEPTH_PIXELS);
        Ok(DepthImage { depth: planes, ir })
    }

    #[cfg(feature = "gpu")]
    pub fn gpu_texture(&self, slot: usize, plane: Plane) -> Option<&wgpu::Texture> {
        self.check_slot(slot).ok()?;
        self.backend.gpu_texture(slot, plane)
    }

    pub fn colorspace(&self) -> Result<ColorSpace> {
        self.backend.colorspace()
    }

    pub fn set_colorspace(&mut self, colorspace: ColorSpace) -> Result<()> {
        self.backend.set_colorspace(colorspace)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        debug!(backend = self.backend.name(), "closing decoder");
        self.backend.close()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.backend.close() {
            warn!(backend = self.backend.name(), "decoder close failed: {e}");
        }
    }
}
