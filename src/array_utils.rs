// Array utilities for row-major 2-D images and detector rows

/// coordinates of the center of pixel (row, col) in an n x n image with unit pixels centered on the
/// origin. x grows with the column, y grows upward.
#[inline(always)]
pub fn pixel_center(row: usize, col: usize, n: usize) -> [f32; 2] {
    let c = 0.5 * (n as f32 - 1.);
    [col as f32 - c, c - row as f32]
}

/// splits a fractional detector coordinate into the lower bin and the weight of the upper bin.
/// Returns None if neither neighbouring bin lies on the detector.
#[inline(always)]
pub fn detector_bin(t: f32, n_det: usize) -> Option<(isize, f32)> {
    let t0 = t.floor();
    if t0 < -1. || t0 >= n_det as f32 {
        return None;
    }
    Some((t0 as isize, t - t0))
}

/// euclidean norm of a buffer, accumulated in f64
pub fn norm(x: &[f32]) -> f32 {
    x.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt() as f32
}
