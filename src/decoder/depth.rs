//! Per-pixel depth math shared by the CPU backend and mirrored by the WGSL
//! kernels.
//!
//! Stage 1 turns the nine raw samples of a pixel into one (a, b, amplitude)
//! triple per modulation frequency. Stage 2 unwraps the three phases into a
//! single distance and derives the infrared intensity.

use std::f32::consts::PI;

use crate::capture::frame::{DEPTH_HEIGHT, DEPTH_SUBFRAME_SIZE, DEPTH_WIDTH};
use crate::decoder::params::DepthParameters;
use crate::decoder::tables::{LUT_SIZE, SATURATED};

/// u16 words per packed sensor row.
pub const ROW_WORDS: usize = 352;
/// Floats kept per pixel between the stages: three (a, b, n) triples.
pub const WORK_STRIDE: usize = 9;

fn word(frame: &[u8], index: usize) -> u16 {
    let i = index * 2;
    u16::from_le_bytes([frame[i], frame[i + 1]])
}

/// Raw sample of subframe `sub` at sensor pixel (`x`, `y`), through the LUT.
pub fn decode_measurement(frame: &[u8], lut: &[i16; LUT_SIZE], sub: usize, x: usize, y: usize) -> i32 {
    // Rows come interleaved from the centre outwards.
    let row = if y < DEPTH_HEIGHT / 2 { y + DEPTH_HEIGHT / 2 } else { DEPTH_HEIGHT - 1 - y };
    // Outermost columns carry no data.
    if x < 1 || x > DEPTH_WIDTH - 2 {
        return i32::from(lut[0]);
    }
    let base = (DEPTH_SUBFRAME_SIZE * sub) / 2 + ROW_WORDS * row;

    let r1z = (((x & 3) << 7) + (x >> 2)) * 11;
    let offset = r1z >> 4;
    let shift = r1z & 15;
    if offset > ROW_WORDS {
        return i32::from(lut[0]);
    }

    let i1 = u32::from(word(frame, base + offset)) >> shift;
    let i2 = u32::from(word(frame, base + offset + 1)) << (16 - shift);
    i32::from(lut[((i1 | i2) & 2047) as usize])
}

/// Combine the three samples of one frequency with its trig entries.
pub fn process_measurement_triple(
    trig: &[f32],
    per_frq: f32,
    ab_multiplier: f32,
    z: f32,
    m: [i32; 3],
) -> [f32; 3] {
    let mf = m.map(|v| v as f32);
    let a = (trig[0] * mf[0] + trig[1] * mf[1] + trig[2] * mf[2]) * per_frq;
    let b = (trig[3] * mf[0] + trig[4] * mf[1] + trig[5] * mf[2]) * per_frq;
    let n = (a * a + b * b).sqrt() * ab_multiplier;

    if !(z > 0.0) {
        return [0.0; 3];
    }
    if m.contains(&i32::from(SATURATED)) {
        return [0.0, 0.0, 65535.0];
    }
    [a, b, n]
}

/// Phase in [0, 2pi) and amplitude of an (a, b) pair; the third value passes through.
pub fn transform_measurements(m: [f32; 3], ab_multiplier: f32) -> [f32; 3] {
    let mut phase = m[1].atan2(m[0]);
    if phase < 0.0 {
        phase += 2.0 * PI;
    }
    if phase.is_nan() {
        phase = 0.0;
    }
    let amplitude = (m[0] * m[0] + m[1] * m[1]).sqrt() * ab_multiplier;
    [phase, amplitude, m[2]]
}

/// Unwrap the three phases; zero when the signal is too weak or the
/// candidates disagree beyond the confidence bound.
fn unwrap_phase(p: &DepthParameters, m0: [f32; 3], m1: [f32; 3], m2: [f32; 3]) -> f32 {
    let ir_min = m0[1].min(m1[1]).min(m2[1]);
    let ir_max = m0[1].max(m1[1]).max(m2[1]);
    let ir_sum = m0[1] + m1[1] + m2[1];
    if ir_min < p.individual_ab_threshold || ir_sum < p.ab_threshold {
        return 0.0;
    }

    let t0 = m0[0] / (2.0 * PI) * 3.0;
    let t1 = m1[0] / (2.0 * PI) * 15.0;
    let t2 = m2[0] / (2.0 * PI) * 2.0;

    let t5 = ((t1 - t0) * 0.333_333 + 0.5).floor() * 3.0 + t0;
    let mut t3 = -t2 + t5;
    let t4 = t3 * 2.0;

    let c1 = t4 >= -t4;
    let f1 = if c1 { 2.0 } else { -2.0 };
    let f2 = if c1 { 0.5 } else { -0.5 };
    t3 *= f2;
    t3 = (t3 - t3.floor()) * f1;

    let c2 = 0.5 < t3.abs() && t3.abs() < 1.5;
    let mut t6 = if c2 { t5 + 15.0 } else { t5 };
    let mut t7 = if c2 { t1 + 15.0 } else { t1 };
    let mut t8 = (((-t2 + t6) * 0.5 + 0.5).floor() * 2.0 + t2) * 0.5;

    t6 *= 0.333_333;
    t7 *= 0.066_667;

    let t9 = t8 + t6 + t7;
    let mut t10 = t9 * 0.333_333;

    t6 *= 2.0 * PI;
    t7 *= 2.0 * PI;
    t8 *= 2.0 * PI;

    let t8_new = t7 * 0.826_977 - t8 * 0.110_264;
    let t6_new = t8 * 0.551_318 - t6 * 0.826_977;
    let t7_new = t6 * 0.110_264 - t7 * 0.551_318;
    let norm = t8_new * t8_new + t6_new * t6_new + t7_new * t7_new;

    if t9 < 0.0 {
        t10 = 0.0;
    }

    let mut ir_x = if p.ab_confidence_slope > 0.0 { ir_min } else { ir_max };
    ir_x = ((ir_x.ln() * p.ab_confidence_slope * 0.301_030 + p.ab_confidence_offset)
        * 3.321_928)
        .exp();
    ir_x = ir_x.clamp(p.min_dealias_confidence, p.max_dealias_confidence);
    ir_x *= ir_x;

    if ir_x >= norm {
        t10
    } else {
        0.0
    }
}

/// Depth and infrared value of one pixel from its stage 1 triples.
pub fn process_pixel_stage2(
    p: &DepthParameters,
    x_table: f32,
    z_table: f32,
    work: &[f32],
) -> (f32, f32) {
    let triple = |k: usize| [work[k * 3], work[k * 3 + 1], work[k * 3 + 2]];
    let m0 = transform_measurements(triple(0), p.ab_multiplier);
    let m1 = transform_measurements(triple(1), p.ab_multiplier);
    let m2 = transform_measurements(triple(2), p.ab_multiplier);

    let mut phase = unwrap_phase(p, m0, m1, m2);
    if phase > 0.0 {
        phase += p.phase_offset;
    }

    let depth_linear = z_table * phase;
    let max_depth = phase * p.unambigious_dist * 2.0;
    let depth = if depth_linear > 0.0 && max_depth > 0.0 {
        let correction = (x_table * 90.0) / (max_depth * max_depth * 8192.0);
        let fit = depth_linear / (-depth_linear * correction + 1.0);
        fit.max(0.0)
    } else {
        depth_linear
    };

    let ir = ((m0[2] + m1[2] + m2[2]) * 0.333_333_3 * p.ab_output_multiplier).min(65535.0);
    (depth, ir)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::frame::DEPTH_FRAME_SIZE;
    use crate::decoder::tables::lut11to16;

    /// Pack an 11-bit code at sensor (x, y) of subframe `sub`.
    pub(crate) fn put_sample(frame: &mut [u8], sub: usize, x: usize, y: usize, code: u16) {
        let row = if y < 212 { y + 212 } else { 423 - y };
        let base = (DEPTH_SUBFRAME_SIZE * sub) / 2 + ROW_WORDS * row;
        let r1z = (((x & 3) << 7) + (x >> 2)) * 11;
        let (offset, shift) = (r1z >> 4, r1z & 15);
        let value = u32::from(code & 2047) << shift;
        for (k, part) in [value & 0xffff, value >> 16].into_iter().enumerate() {
            let at = (base + offset + k) * 2;
            let old = u16::from_le_bytes([frame[at], frame[at + 1]]);
            let mask = if k == 0 { (2047u32 << shift) & 0xffff } else { (2047u32 << shift) >> 16 };
            let new = (u32::from(old) & !mask & 0xffff) | part;
            frame[at..at + 2].copy_from_slice(&(new as u16).to_le_bytes());
        }
    }

    #[test]
    fn decode_reads_back_packed_codes() {
        let lut = lut11to16();
        let mut frame = vec![0u8; DEPTH_FRAME_SIZE];
        let cases = [(1, 1, 0, 5u16), (2, 7, 100, 1500), (3, 510, 423, 1024), (8, 255, 211, 77)];
        for &(sub, x, y, code) in &cases {
            put_sample(&mut frame, sub, x, y, code);
        }
        for &(sub, x, y, code) in &cases {
            assert_eq!(
                decode_measurement(&frame, &lut, sub, x, y),
                i32::from(lut[code as usize]),
                "sub {sub} at ({x}, {y})"
            );
        }
        // Neighbouring samples stay untouched.
        assert_eq!(decode_measurement(&frame, &lut, 2, 8, 100), 0);
    }

    #[test]
    fn border_columns_are_empty() {
        let lut = lut11to16();
        let frame = vec![0xffu8; DEPTH_FRAME_SIZE];
        assert_eq!(decode_measurement(&frame, &lut, 0, 0, 10), 0);
        assert_eq!(decode_measurement(&frame, &lut, 0, 511, 10), 0);
        assert_ne!(decode_measurement(&frame, &lut, 0, 1, 10), 0);
    }

    #[test]
    fn saturation_and_invalid_geometry() {
        let trig = [1.0, 0.5, -0.5, 0.0, 0.8, -0.8];
        assert_eq!(
            process_measurement_triple(&trig, 1.0, 0.6666667, 100.0, [10, 32767, 3]),
            [0.0, 0.0, 65535.0]
        );
        assert_eq!(
            process_measurement_triple(&trig, 1.0, 0.6666667, 0.0, [10, 32767, 3]),
            [0.0; 3]
        );
        assert_eq!(
            process_measurement_triple(&trig, 1.0, 0.6666667, -5.0, [10, 20, 30]),
            [0.0; 3]
        );

        let [a, b, n] = process_measurement_triple(&trig, 2.0, 0.5, 1.0, [10, 20, 30]);
        assert_eq!(a, (10.0 + 10.0 - 15.0) * 2.0);
        assert_eq!(b, (16.0 - 24.0) * 2.0);
        assert!((n - (a * a + b * b).sqrt() * 0.5).abs() < 1e-4);
    }

    #[test]
    fn transform_wraps_phase() {
        let [phase, amp, n] = transform_measurements([0.0, -1.0, 7.0], 1.0);
        assert!((phase - 1.5 * PI).abs() < 1e-5);
        assert_eq!(amp, 1.0);
        assert_eq!(n, 7.0);

        let [phase, _, _] = transform_measurements([f32::NAN, 1.0, 0.0], 1.0);
        assert_eq!(phase, 0.0);
    }

    #[test]
    fn weak_signal_gives_zero_depth() {
        let p = DepthParameters::default();
        let work = [1.0, 0.0, 5.0, 1.0, 0.0, 5.0, 1.0, 0.0, 5.0];
        let (depth, ir) = process_pixel_stage2(&p, 0.0, 2000.0, &work);
        assert_eq!(depth, 0.0);
        assert!((ir - 5.0 * 16.0).abs() < 1e-3);
    }

    #[test]
    fn saturated_ir_is_clamped() {
        let p = DepthParameters::default();
        let work = [0.0, 0.0, 65535.0, 0.0, 0.0, 65535.0, 0.0, 0.0, 65535.0];
        let (depth, ir) = process_pixel_stage2(&p, 0.0, 2000.0, &work);
        assert_eq!(depth, 0.0);
        assert_eq!(ir, 65535.0);
    }

    /// Triples whose phases agree on a single distance unwrap to it.
    #[test]
    fn consistent_phases_unwrap() {
        let p = DepthParameters::default();
        // Distance in units where the frequencies wrap every 3, 15 and 2.
        let u = 6.3f32;
        let turns = [u / 3.0, u / 15.0, u / 2.0];
        let mut work = [0.0f32; 9];
        for (k, t) in turns.iter().enumerate() {
            let phase = t.fract() * 2.0 * PI;
            let amp = 1000.0;
            work[k * 3] = phase.cos() * amp;
            work[k * 3 + 1] = phase.sin() * amp;
            work[k * 3 + 2] = amp;
        }
        let z = 1000.0;
        let (depth, _) = process_pixel_stage2(&p, 0.0, z, &work);
        // Mean of the unwrapped cycle counts: (u/3 + u/15 + u/2) / 3.
        assert!((depth - z * 0.3 * u).abs() < 1.0, "depth {depth}");
    }
}
