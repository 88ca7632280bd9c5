//! JPEG color frames decoded with zune-jpeg.

use tracing::{instrument, trace};
use zune_jpeg::JpegDecoder;

use crate::capture::frame::ColorFrame;
use crate::decoder::slot::SlotPool;
use crate::decoder::{ColorSpace, DecodeBackend, DecoderFlags};
use crate::{Error, Result};

pub const NAME: &str = "color cpu";

#[derive(Debug, Default)]
struct Decoded {
    pixels: Vec<u8>,
    width: usize,
    height: usize,
}

pub struct ColorCpu {
    colorspace: ColorSpace,
    slots: SlotPool<Decoded>,
}

impl ColorCpu {
    pub const NAME: &'static str = NAME;

    pub fn open(flags: DecoderFlags, num_slots: usize) -> Result<Self> {
        if !flags.is_color() {
            return Err(Error::unavailable(NAME, "not a color request"));
        }
        Ok(Self {
            colorspace: ColorSpace::default(),
            slots: SlotPool::new(num_slots, |_| Decoded::default()),
        })
    }

    /// Width and height of the image last decoded into `slot`.
    pub fn dimensions(&self, slot: usize) -> Result<(usize, usize)> {
        let decoded = self.slots.get(slot)?;
        Ok((decoded.width, decoded.height))
    }
}

/// JPEG payload of a committed color frame. Anything without the frame
/// header is taken to be a bare JPEG stream.
fn payload(src: &[u8]) -> &[u8] {
    match ColorFrame::parse(src) {
        Some(frame) if frame.header.is_valid() => frame.jpeg,
        _ => src,
    }
}

impl DecodeBackend for ColorCpu {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, src), fields(len = src.len()))]
    fn request(&mut self, slot: usize, src: &[u8]) -> Result<()> {
        let mut decoder = JpegDecoder::new(payload(src));
        let mut pixels = decoder.decode().map_err(|e| Error::Jpeg(format!("{e:?}")))?;
        let (width, height) = decoder
            .dimensions()
            .ok_or_else(|| Error::Jpeg("missing frame dimensions".into()))?;
        if pixels.len() != width * height * 3 {
            return Err(Error::Jpeg(format!(
                "expected 3 channels, got {} bytes for {width}x{height}",
                pixels.len()
            )));
        }
        if self.colorspace == ColorSpace::Bgr {
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        trace!(width, height, "decoded color frame");

        *self.slots.get_mut(slot)? = Decoded {
            pixels,
            width,
            height,
        };
        self.slots.submit(slot, ())?;
        Ok(())
    }

    fn fetch(&mut self, slot: usize, dst: &mut [u8]) -> Result<()> {
        let ((), decoded) = self.slots.complete(slot)?;
        let len = decoded.pixels.len();
        if dst.len() < len {
            return Err(Error::InvalidLength {
                expected: len,
                actual: dst.len(),
            });
        }
        dst[..len].copy_from_slice(&decoded.pixels);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.slots.drain_pending();
        Ok(())
    }

    fn colorspace(&self) -> Result<ColorSpace> {
        Ok(self.colorspace)
    }

    /// Applies to requests made afterwards.
    fn set_colorspace(&mut self, colorspace: ColorSpace) -> Result<()> {
        self.colorspace = colorspace;
        Ok(())
    }
}
