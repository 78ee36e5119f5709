use ndarray::{Array2, s};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::grid::{self, ANGLE_SAMPLES, GridContext, NUM_ANGLE_BINS, NUM_RANGE_BINS};
use super::{InterpolationData, RadarError};

/// Size of the azimuth heatmap TLV payload in bytes
pub const HEATMAP_LENGTH: usize = 8192;
pub const VIRTUAL_ANTENNAS: usize = 8;
/// Interpolated strengths below this are not trusted
pub const STRENGTH_FLOOR: f64 = 1500.;

/// Turns the azimuth heatmap of one packet into strengths on the Cartesian
/// query grid.
///
/// Each worker owns one, it keeps the FFT plan and scratch space. The grid
/// geometry is shared by all of them and built on first use.
pub struct AzimuthHeatmapProcessor {
    fft: Arc<dyn Fft<f64>>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl AzimuthHeatmapProcessor {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(NUM_ANGLE_BINS);
        let scratch = vec![Complex::new(0., 0.); fft.get_inplace_scratch_len()];

        AzimuthHeatmapProcessor {
            fft,
            buffer: vec![Complex::new(0., 0.); NUM_ANGLE_BINS * NUM_RANGE_BINS],
            scratch,
        }
    }

    pub fn process(&mut self, payload: &[u8]) -> Result<Vec<InterpolationData>, RadarError> {
        let power = self.power_map(payload)?;
        Ok(self.interpolate(&power))
    }

    /// Magnitude per (range bin, angle sample), 256 x 63, zero angle at column 31
    pub fn power_map(&mut self, payload: &[u8]) -> Result<Array2<f64>, RadarError> {
        let antennas = decode(payload)?;

        // One 64 point transform per range bin, zero padded beyond the 8 antennas
        self.buffer.fill(Complex::new(0., 0.));
        for ((antenna, range), value) in antennas.indexed_iter() {
            self.buffer[range * NUM_ANGLE_BINS + antenna] = *value;
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let spectrum = Array2::from_shape_fn((NUM_ANGLE_BINS, NUM_RANGE_BINS), |(k, range)| {
            self.buffer[range * NUM_ANGLE_BINS + k].norm()
        });
        let spectrum = fft_shift(&spectrum).reversed_axes();

        Ok(spectrum.slice(s![.., 1..]).to_owned())
    }

    pub fn interpolate(&self, power: &Array2<f64>) -> Vec<InterpolationData> {
        let grid = grid::shared();
        let strengths = vertex_strengths(power);
        let vertices = grid.vertices();

        grid.query()
            .points()
            .enumerate()
            .map(|(k, p)| {
                let strength = match grid.containing_triangle(k) {
                    Some([a, b, c]) => {
                        let corner = |v: usize| [vertices[v].x, vertices[v].y, strengths[v]];
                        let t = plane_at(corner(a), corner(b), corner(c), p.x, p.y);
                        if t.is_finite() && t >= STRENGTH_FLOOR {
                            t
                        } else {
                            f64::NAN
                        }
                    }
                    None => f64::NAN,
                };
                InterpolationData::new(p.x, p.y, strength)
            })
            .collect()
    }
}

impl Default for AzimuthHeatmapProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// The 8 x 256 antenna by range matrix held in a heatmap payload. Samples are
/// little endian i16 pairs with the imaginary part first.
pub fn decode(payload: &[u8]) -> Result<Array2<Complex<f64>>, RadarError> {
    if payload.len() < HEATMAP_LENGTH {
        return Err(RadarError::Truncated {
            what: "azimuth heatmap",
            needed: HEATMAP_LENGTH,
            available: payload.len(),
        });
    }

    let mut matrix = Array2::zeros((VIRTUAL_ANTENNAS, NUM_RANGE_BINS));
    for (p, pair) in payload[..HEATMAP_LENGTH].chunks_exact(4).enumerate() {
        let im = i16::from_le_bytes([pair[0], pair[1]]);
        let re = i16::from_le_bytes([pair[2], pair[3]]);
        matrix[[p % VIRTUAL_ANTENNAS, p / VIRTUAL_ANTENNAS]] = Complex::new(re as f64, im as f64);
    }
    Ok(matrix)
}

/// Swaps the two halves of the rows so that row 0 of the input lands in the middle
pub fn fft_shift(a: &Array2<f64>) -> Array2<f64> {
    let rows = a.nrows();
    Array2::from_shape_fn(a.dim(), |(r, c)| a[[(r + rows / 2) % rows, c]])
}

// All range 0 samples share the origin vertex, it gets their mean.
fn vertex_strengths(power: &Array2<f64>) -> Vec<f64> {
    let mut strengths = vec![0.; 1 + ANGLE_SAMPLES * (NUM_RANGE_BINS - 1)];
    strengths[0] = power.row(0).mean().unwrap_or(0.);
    for ((range, angle), value) in power.indexed_iter() {
        if range > 0 {
            strengths[GridContext::vertex_index(range, angle)] = *value;
        }
    }
    strengths
}

// Height at (x, y) of the plane through three (x, y, strength) points
fn plane_at(p1: [f64; 3], p2: [f64; 3], p3: [f64; 3], x: f64, y: f64) -> f64 {
    let u = [p2[0] - p1[0], p2[1] - p1[1], p2[2] - p1[2]];
    let v = [p3[0] - p1[0], p3[1] - p1[1], p3[2] - p1[2]];
    let n = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    let n = [n[0] / len, n[1] / len, n[2] / len];
    let d = -(n[0] * p1[0] + n[1] * p1[1] + n[2] * p1[2]);

    -(n[0] * x + n[1] * y + d) / n[2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::testdata;

    #[test]
    fn decode_layout() {
        let mut samples = vec![0i16; HEATMAP_LENGTH / 2];
        // pair 9 is antenna 1 of range bin 1
        samples[18] = -3;
        samples[19] = 1234;
        let mut payload = testdata::heatmap_bytes(&samples);
        // 0xffff is -1
        payload[4 * 2047 + 2] = 0xff;
        payload[4 * 2047 + 3] = 0xff;

        let m = decode(&payload).unwrap();
        assert_eq!(m.dim(), (8, 256));
        assert_eq!(m[[1, 1]], Complex::new(1234., -3.));
        assert_eq!(m[[7, 255]], Complex::new(-1., 0.));
        assert_eq!(m[[0, 0]], Complex::new(0., 0.));
    }

    #[test]
    fn short_payload() {
        assert!(matches!(
            decode(&[0; 100]),
            Err(RadarError::Truncated { needed: HEATMAP_LENGTH, available: 100, .. })
        ));
    }

    #[test]
    fn in_phase_antennas_peak_at_zero_angle() {
        let payload = testdata::heatmap_bytes(&testdata::broadside_target(10, 5..=5));
        let mut processor = AzimuthHeatmapProcessor::new();
        let power = processor.power_map(&payload).unwrap();

        assert_eq!(power.dim(), (NUM_RANGE_BINS, ANGLE_SAMPLES));
        assert!((power[[5, 31]] - 80.).abs() < 1e-9);
        for angle in 0..ANGLE_SAMPLES {
            assert!(power[[5, angle]] <= power[[5, 31]] + 1e-9);
            assert_eq!(power[[4, angle]], 0.);
            assert_eq!(power[[6, angle]], 0.);
        }
        // Eight equal samples cancel out at every eighth bin
        assert!(power[[5, 39]].abs() < 1e-9);
        assert!(power[[5, 23]].abs() < 1e-9);
    }

    #[test]
    fn single_antenna_is_flat_over_angle() {
        let mut samples = vec![0i16; HEATMAP_LENGTH / 2];
        let pair = 3 * VIRTUAL_ANTENNAS;
        samples[2 * pair] = 7;
        let mut processor = AzimuthHeatmapProcessor::new();
        let power = processor.power_map(&testdata::heatmap_bytes(&samples)).unwrap();

        for angle in 0..ANGLE_SAMPLES {
            assert!((power[[3, angle]] - 7.).abs() < 1e-9);
        }
    }

    #[test]
    fn shift_centers_first_row() {
        let a = Array2::from_shape_fn((6, 2), |(r, c)| (r * 10 + c) as f64);
        let shifted = fft_shift(&a);
        assert_eq!(shifted[[3, 0]], 0.);
        assert_eq!(shifted[[3, 1]], 1.);
        assert_eq!(shifted[[0, 0]], 30.);
        assert_eq!(shifted[[5, 1]], 21.);
    }

    #[test]
    fn zero_heatmap_is_all_nan() {
        let mut processor = AzimuthHeatmapProcessor::new();
        let points = processor
            .process(&testdata::heatmap_bytes(&vec![0; HEATMAP_LENGTH / 2]))
            .unwrap();
        assert_eq!(points.len(), grid::GRID_POINTS);
        assert!(points.iter().all(|p| p.strength.is_nan()));
    }

    #[test]
    fn strength_floor() {
        let grid = grid::shared();
        let processor = AzimuthHeatmapProcessor::new();

        let strong = processor.interpolate(&Array2::from_elem((NUM_RANGE_BINS, ANGLE_SAMPLES), 2000.));
        let mut finite = 0;
        for (k, p) in strong.iter().enumerate() {
            assert_eq!((p.x, p.y), (grid.query().point(k).x, grid.query().point(k).y));
            if grid.containing_triangle(k).is_some() {
                assert!((p.strength - 2000.).abs() < 1e-6);
                finite += 1;
            } else {
                assert!(p.strength.is_nan());
            }
        }
        assert!(finite > 10_000);

        let weak = processor.interpolate(&Array2::from_elem((NUM_RANGE_BINS, ANGLE_SAMPLES), 1000.));
        assert!(weak.iter().all(|p| p.strength.is_nan()));
    }

    #[test]
    fn linear_field_is_reproduced() {
        let grid = grid::shared();
        let field = |x: f64, y: f64| 2000. + 100. * x + 50. * y;
        let power = Array2::from_shape_fn((NUM_RANGE_BINS, ANGLE_SAMPLES), |(range, angle)| {
            let p = grid.vertex_position(range, angle);
            field(p.x, p.y)
        });

        let processor = AzimuthHeatmapProcessor::new();
        for (k, p) in processor.interpolate(&power).iter().enumerate() {
            if grid.containing_triangle(k).is_some() {
                assert!((p.strength - field(p.x, p.y)).abs() < 1e-6, "{:?}", p);
            }
        }
    }
}
