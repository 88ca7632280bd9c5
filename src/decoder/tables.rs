//! Per-pixel constant tables derived once from calibration data.

use std::f64::consts::PI;

use tracing::debug;

use crate::capture::frame::{DEPTH_HEIGHT, DEPTH_PIXELS, DEPTH_WIDTH};
use crate::decoder::params::{DepthCameraParams, DepthParameters, P0Tables};

pub const LUT_SIZE: usize = 2048;
/// Raw code the sensor reports for a saturated sample.
pub const SATURATED: i16 = 32767;

/// Expansion of the 11-bit raw samples to signed 16-bit values.
pub fn lut11to16() -> [i16; LUT_SIZE] {
    let mut lut = [0i16; LUT_SIZE];
    let mut y: i16 = 0;
    for x in 0..1024usize {
        let inc = 1i16 << (x / 128 - usize::from(x >= 128));
        lut[x] = y;
        lut[1024 + x] = -y;
        y += inc;
    }
    lut[1024] = SATURATED;
    lut
}

/// Phase offset of `table` at sensor pixel (`x`, `y`), in radians.
/// The device stores the tables upside down. Computed in f64, stored as f32.
pub fn p0_angle(table: &[u16], x: usize, y: usize) -> f32 {
    (-0.000_031 * PI * f64::from(table[(DEPTH_HEIGHT - 1 - y) * DEPTH_WIDTH + x])) as f32
}

/// [`p0_angle`] of every pixel, in sensor row order.
pub fn p0_angles(table: &[u16]) -> Vec<f32> {
    (0..DEPTH_PIXELS)
        .map(|i| p0_angle(table, i % DEPTH_WIDTH, i / DEPTH_WIDTH))
        .collect()
}

/// Six floats per pixel: `cos(p0 + phase_k)` for k = 0..3 followed by
/// `sin(-(p0 + phase_k))`. The sums are f32; cos and sin run in f64.
pub fn trig_table(angles: &[f32], params: &DepthParameters) -> Vec<f32> {
    let mut out = Vec::with_capacity(angles.len() * 6);
    for &p0 in angles {
        let tmp = params.phase_in_rad.map(|phase| f64::from(p0 + phase));
        out.extend(tmp.map(|t| t.cos() as f32));
        out.extend(tmp.map(|t| (-t).sin() as f32));
    }
    out
}

fn distort(p: &DepthCameraParams, x: f64, y: f64) -> (f64, f64) {
    let (k1, k2, k3) = (f64::from(p.k1), f64::from(p.k2), f64::from(p.k3));
    let (p1, p2) = (f64::from(p.p1), f64::from(p.p2));
    let x2 = x * x;
    let y2 = y * y;
    let r2 = x2 + y2;
    let xy = x * y;
    let kr = ((k3 * r2 + k2) * r2 + k1) * r2 + 1.0;
    (
        x * kr + p2 * (r2 + 2.0 * x2) + 2.0 * p1 * xy,
        y * kr + p1 * (r2 + 2.0 * y2) + 2.0 * p2 * xy,
    )
}

/// Invert [`distort`] with Newton's method. The flag is false when the
/// iteration did not settle.
fn undistort(p: &DepthCameraParams, xd: f64, yd: f64) -> (f64, f64, bool) {
    const MAX_ITERATIONS: usize = 100;
    let eps = f64::EPSILON * 16.0;
    let (k1, k2, k3) = (f64::from(p.k1), f64::from(p.k2), f64::from(p.k3));
    let (p1, p2) = (f64::from(p.p1), f64::from(p.p2));

    let (mut x, mut y) = (xd, yd);
    let (mut last_x, mut last_y) = (x, y);
    for _ in 0..MAX_ITERATIONS {
        let x2 = x * x;
        let y2 = y * y;
        let x2y2 = x2 + y2;
        let x2y22 = x2y2 * x2y2;
        let x2y23 = x2y2 * x2y22;

        // Jacobian of distort(); symmetric off the diagonal.
        let ja = k3 * x2y23
            + (k2 + 6.0 * k3 * x2) * x2y22
            + (k1 + 4.0 * k2 * x2) * x2y2
            + 2.0 * k1 * x2
            + 6.0 * p2 * x
            + 2.0 * p1 * y
            + 1.0;
        let jb = 6.0 * k3 * x * y * x2y22
            + 4.0 * k2 * x * y * x2y2
            + 2.0 * k1 * x * y
            + 2.0 * p1 * x
            + 2.0 * p2 * y;
        let jd = k3 * x2y23
            + (k2 + 6.0 * k3 * y2) * x2y22
            + (k1 + 4.0 * k2 * y2) * x2y2
            + 2.0 * k1 * y2
            + 2.0 * p2 * x
            + 6.0 * p1 * y
            + 1.0;

        let det = 1.0 / (ja * jd - jb * jb);
        let (a, b, d) = (jd * det, -jb * det, ja * det);

        let (f, g) = distort(p, x, y);
        let (f, g) = (f - xd, g - yd);
        x -= a * f + b * g;
        y -= b * f + d * g;

        if (x - last_x).abs() <= eps && (y - last_y).abs() <= eps {
            return (x, y, true);
        }
        last_x = x;
        last_y = y;
    }
    (x, y, false)
}

/// Geometric tables: `x` scales the range correction, `z` maps phase to
/// distance along the optical axis. Both in sensor orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct XzTables {
    pub x: Vec<f32>,
    pub z: Vec<f32>,
    /// Pixels whose undistortion did not converge.
    pub divergent: usize,
}

impl XzTables {
    pub fn new(p: &DepthCameraParams) -> Self {
        const SCALING_FACTOR: f64 = 8192.0;
        const UNAMBIGIOUS_DIST: f64 = 6250.0 / 3.0;

        let mut x = Vec::with_capacity(DEPTH_PIXELS);
        let mut z = Vec::with_capacity(DEPTH_PIXELS);
        let mut divergent = 0;
        for i in 0..DEPTH_PIXELS {
            let xi = (i % DEPTH_WIDTH) as f64;
            let yi = (i / DEPTH_WIDTH) as f64;
            let xd = (xi + 0.5 - f64::from(p.cx)) / f64::from(p.fx);
            let yd = (yi + 0.5 - f64::from(p.cy)) / f64::from(p.fy);
            let (xu, yu, converged) = undistort(p, xd, yd);
            if !converged {
                divergent += 1;
            }
            x.push((SCALING_FACTOR * xu) as f32);
            z.push((UNAMBIGIOUS_DIST / (xu * xu + yu * yu + 1.0).sqrt()) as f32);
        }
        if divergent > 0 {
            debug!("{divergent} pixels in x/z table have incorrect undistortion");
        }
        Self { x, z, divergent }
    }
}

/// Everything a depth backend needs besides the raw frame.
#[derive(Debug, Clone)]
pub struct CalibrationTables {
    pub lut: [i16; LUT_SIZE],
    pub xz: XzTables,
    /// Phase offset angles per frequency.
    pub p0: [Vec<f32>; 3],
    pub trig: [Vec<f32>; 3],
}

impl CalibrationTables {
    pub fn new(depth: &DepthCameraParams, p0: &P0Tables, params: &DepthParameters) -> Self {
        let angles: [Vec<f32>; 3] = std::array::from_fn(|k| p0_angles(&p0.tables[k]));
        Self {
            lut: lut11to16(),
            xz: XzTables::new(depth),
            trig: std::array::from_fn(|k| trig_table(&angles[k], params)),
            p0: angles,
        }
    }
}
