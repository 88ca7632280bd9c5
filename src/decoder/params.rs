//! Device calibration blobs and the fixed depth pipeline parameters.
//!
//! Blobs are little-endian and packed, exactly as the device returns them.
//! A [`CameraParams`] set can be cached in a directory so later runs can
//! decode without asking the device again.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::capture::frame::DEPTH_PIXELS;
use crate::{Error, Result};

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(what: &str, bytes: &'a [u8], need: usize) -> Result<Self> {
        if bytes.len() < need {
            return Err(Error::Calibration(format!(
                "{what}: got {} bytes, need {need}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, offset: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn f32s<const N: usize>(&mut self) -> [f32; N] {
        std::array::from_fn(|_| self.f32())
    }
}

/// Intrinsics of the IR camera.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthCameraParams {
    pub fx: f32,
    pub fy: f32,
    pub unknown0: f32,
    pub cx: f32,
    pub cy: f32,
    pub k1: f32,
    pub k2: f32,
    pub p1: f32,
    pub p2: f32,
    pub k3: f32,
    pub unknown1: [f32; 13],
}

impl DepthCameraParams {
    pub const SIZE: usize = 23 * 4;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new("depth camera parameters", bytes, Self::SIZE)?;
        Ok(Self {
            fx: r.f32(),
            fy: r.f32(),
            unknown0: r.f32(),
            cx: r.f32(),
            cy: r.f32(),
            k1: r.f32(),
            k2: r.f32(),
            p1: r.f32(),
            p2: r.f32(),
            k3: r.f32(),
            unknown1: r.f32s(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.fx,
            self.fy,
            self.unknown0,
            self.cx,
            self.cy,
            self.k1,
            self.k2,
            self.p1,
            self.p2,
            self.k3,
        ]
        .iter()
        .chain(self.unknown1.iter())
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }
}

/// Intrinsics of the color camera plus the depth-to-color mapping
/// polynomial (`x3y0 x0y3 x2y1 x1y2 x2y0 x0y2 x1y1 x1y0 x0y1 x0y0`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorCameraParams {
    pub table_id: u8,
    pub f: f32,
    pub cx: f32,
    pub cy: f32,
    pub shift_d: f32,
    pub shift_m: f32,
    pub mx: [f32; 10],
    pub my: [f32; 10],
}

impl ColorCameraParams {
    pub const SIZE: usize = 1 + 5 * 4 + 20 * 4;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new("color camera parameters", bytes, Self::SIZE)?;
        Ok(Self {
            table_id: r.u8(),
            f: r.f32(),
            cx: r.f32(),
            cy: r.f32(),
            shift_d: r.f32(),
            shift_m: r.f32(),
            mx: r.f32s(),
            my: r.f32s(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.table_id];
        for v in [self.f, self.cx, self.cy, self.shift_d, self.shift_m]
            .iter()
            .chain(&self.mx)
            .chain(&self.my)
        {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Per-pixel phase offsets of the three modulation frequencies, in sensor
/// row order as delivered (row 0 is the bottom of the image).
#[derive(Debug, Clone, PartialEq)]
pub struct P0Tables {
    pub header: [u32; 8],
    pub tables: [Vec<u16>; 3],
}

impl P0Tables {
    /// Header, then each plane preceded by a spacer word, then a trailing one.
    pub const SIZE: usize = 8 * 4 + 3 * (2 + DEPTH_PIXELS * 2) + 2;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new("p0 tables", bytes, Self::SIZE)?;
        let header = std::array::from_fn(|_| r.u32());
        let tables = std::array::from_fn(|_| {
            r.u16();
            (0..DEPTH_PIXELS).map(|_| r.u16()).collect()
        });
        Ok(Self { header, tables })
    }

    pub fn from_planes(tables: [Vec<u16>; 3]) -> Result<Self> {
        if let Some(bad) = tables.iter().find(|t| t.len() != DEPTH_PIXELS) {
            return Err(Error::Calibration(format!(
                "p0 table has {} entries, need {DEPTH_PIXELS}",
                bad.len()
            )));
        }
        Ok(Self {
            header: [0; 8],
            tables,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        for word in self.header {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for table in &self.tables {
            out.extend_from_slice(&[0, 0]);
            for v in table {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.extend_from_slice(&[0, 0]);
        out
    }
}

/// Everything the decoders need from the device, in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParams {
    pub color: ColorCameraParams,
    pub depth: DepthCameraParams,
    pub p0: P0Tables,
}

impl CameraParams {
    pub const COLOR_FILE: &'static str = "color.bin";
    pub const DEPTH_FILE: &'static str = "depth.bin";
    pub const P0_FILE: &'static str = "p0table.bin";

    /// Write the three blobs into `dir`, creating it and its parents.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(Self::COLOR_FILE), self.color.to_bytes())?;
        fs::write(dir.join(Self::DEPTH_FILE), self.depth.to_bytes())?;
        fs::write(dir.join(Self::P0_FILE), self.p0.to_bytes())?;
        debug!(dir = %dir.display(), "saved camera parameters");
        Ok(())
    }

    /// Read a set written by [`CameraParams::save`].
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let params = Self {
            color: ColorCameraParams::from_bytes(&fs::read(dir.join(Self::COLOR_FILE))?)?,
            depth: DepthCameraParams::from_bytes(&fs::read(dir.join(Self::DEPTH_FILE))?)?,
            p0: P0Tables::from_bytes(&fs::read(dir.join(Self::P0_FILE))?)?,
        };
        debug!(dir = %dir.display(), "loaded camera parameters");
        Ok(params)
    }
}

/// Constants of the two-stage depth computation shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthParameters {
    pub ab_multiplier: f32,
    pub ab_multiplier_per_frq: [f32; 3],
    pub ab_output_multiplier: f32,
    pub phase_in_rad: [f32; 3],
    pub phase_offset: f32,
    pub unambigious_dist: f32,
    pub individual_ab_threshold: f32,
    pub ab_threshold: f32,
    pub ab_confidence_slope: f32,
    pub ab_confidence_offset: f32,
    pub min_dealias_confidence: f32,
    pub max_dealias_confidence: f32,
}

impl Default for DepthParameters {
    fn default() -> Self {
        Self {
            ab_multiplier: 0.666_666_7,
            ab_multiplier_per_frq: [1.322_581, 1.0, 1.612_903],
            ab_output_multiplier: 16.0,
            phase_in_rad: [0.0, 2.094_395, 4.188_79],
            phase_offset: 0.0,
            unambigious_dist: 2083.333,
            individual_ab_threshold: 3.0,
            ab_threshold: 10.0,
            ab_confidence_slope: -0.533_057_8,
            ab_confidence_offset: 0.769_489_4,
            min_dealias_confidence: 0.349_065_9,
            max_dealias_confidence: 0.610_865_3,
        }
    }
}
