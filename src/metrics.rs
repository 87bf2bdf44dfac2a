// Image quality measures comparing a reconstruction against its ground truth

use crate::dataset::check_shape;
use crate::error::{RecoError, Result};
use cfl::ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// side length of the uniform SSIM window
const SSIM_WIN: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Measure {
    Psnr,
    Ssim,
}

impl Measure {
    pub fn name(&self) -> &'static str {
        match self {
            Measure::Psnr => "psnr",
            Measure::Ssim => "ssim",
        }
    }

    /// evaluates the measure. Both measures take their data range from the ground truth
    /// (max - min). Higher is better for both.
    pub fn apply(&self, reconstruction: &Array2<f32>, ground_truth: &Array2<f32>) -> Result<f64> {
        check_shape(ground_truth.dim().into(), reconstruction.dim().into())?;
        let data_range = data_range(ground_truth);
        match self {
            Measure::Psnr => Ok(psnr(reconstruction, ground_truth, data_range)),
            Measure::Ssim => ssim(reconstruction, ground_truth, data_range),
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Measure {
    type Err = RecoError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "psnr" => Ok(Measure::Psnr),
            "ssim" => Ok(Measure::Ssim),
            _ => Err(RecoError::UnknownMeasure(s.to_string())),
        }
    }
}

fn data_range(x: &Array2<f32>) -> f64 {
    let (lo, hi) = x.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    (hi - lo) as f64
}

/// peak signal-to-noise ratio in dB. Identical images give infinity.
pub fn psnr(reconstruction: &Array2<f32>, ground_truth: &Array2<f32>, data_range: f64) -> f64 {
    let n = ground_truth.len() as f64;
    let mse = reconstruction.iter().zip(ground_truth.iter())
        .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
        .sum::<f64>() / n;
    if mse == 0. {
        return f64::INFINITY;
    }
    20. * data_range.log10() - 10. * mse.log10()
}

/// mean structural similarity over all fully covered 7 x 7 windows, using sample covariances
pub fn ssim(x: &Array2<f32>, y: &Array2<f32>, data_range: f64) -> Result<f64> {
    let (m, n) = x.dim();
    if m < SSIM_WIN || n < SSIM_WIN {
        return Err(RecoError::Measure {
            measure: "ssim",
            msg: format!("image of shape {:?} is smaller than the {w} x {w} window", [m, n], w = SSIM_WIN),
        });
    }

    let np = (SSIM_WIN * SSIM_WIN) as f64;
    let cov_norm = np / (np - 1.);
    let c1 = (SSIM_K1 * data_range).powi(2);
    let c2 = (SSIM_K2 * data_range).powi(2);

    let mut total = 0.;
    let mut count = 0usize;
    for i in 0..=(m - SSIM_WIN) {
        for j in 0..=(n - SSIM_WIN) {
            let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0., 0., 0., 0., 0.);
            for di in 0..SSIM_WIN {
                for dj in 0..SSIM_WIN {
                    let a = x[[i + di, j + dj]] as f64;
                    let b = y[[i + di, j + dj]] as f64;
                    sx += a;
                    sy += b;
                    sxx += a * a;
                    syy += b * b;
                    sxy += a * b;
                }
            }
            let (ux, uy) = (sx / np, sy / np);
            let vx = cov_norm * (sxx / np - ux * ux);
            let vy = cov_norm * (syy / np - uy * uy);
            let vxy = cov_norm * (sxy / np - ux * uy);
            let num = (2. * ux * uy + c1) * (2. * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }
    Ok(total / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(m: usize, n: usize) -> Array2<f32> {
        Array2::from_shape_fn((m, n), |(i, j)| ((i * 7 + j * 3) % 11) as f32 / 10.)
    }

    #[test]
    fn psnr_of_identical_images_is_infinite() {
        let x = ramp(8, 8);
        assert_eq!(Measure::Psnr.apply(&x, &x).unwrap(), f64::INFINITY);
    }

    #[test]
    fn psnr_of_constant_offset() {
        let gt = ramp(10, 10);
        let reco = gt.mapv(|v| v + 0.1);
        // data range 1, mse 0.01 -> 20 dB
        let p = Measure::Psnr.apply(&reco, &gt).unwrap();
        assert!((p - 20.).abs() < 1e-4, "{p}");
    }

    #[test]
    fn ssim_of_identical_images_is_one() {
        let x = ramp(12, 9);
        let s = Measure::Ssim.apply(&x, &x).unwrap();
        assert!((s - 1.).abs() < 1e-9, "{s}");
    }

    #[test]
    fn ssim_drops_for_noisy_images() {
        let gt = ramp(16, 16);
        let noisy = Array2::from_shape_fn((16, 16), |(i, j)| gt[[i, j]] + if (i + j) % 2 == 0 { 0.3 } else { -0.3 });
        let s = Measure::Ssim.apply(&noisy, &gt).unwrap();
        assert!(s < 0.9 && s > -1., "{s}");
    }

    #[test]
    fn ssim_needs_full_window() {
        let x = ramp(6, 20);
        assert!(matches!(Measure::Ssim.apply(&x, &x), Err(RecoError::Measure { measure: "ssim", .. })));
    }

    #[test]
    fn mismatched_shapes_fail() {
        assert!(Measure::Psnr.apply(&ramp(8, 8), &ramp(8, 9)).is_err());
    }

    #[test]
    fn measure_names_parse() {
        assert_eq!("PSNR".parse::<Measure>().unwrap(), Measure::Psnr);
        assert_eq!("ssim".parse::<Measure>().unwrap(), Measure::Ssim);
        let e = "mse".parse::<Measure>().unwrap_err();
        assert!(matches!(&e, RecoError::UnknownMeasure(name) if name == "mse"));
        assert_eq!(e.to_string(), "unknown measure 'mse'");
    }
}
