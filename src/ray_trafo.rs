// 2-D parallel beam ray transform
// the forward operator maps an n x n image to a sinogram of shape [n_angles, n_detectors]. It is
// pixel driven with linear interpolation onto the detector, and the adjoint applies exactly the
// transposed weights so that <Ax, y> = <x, A*y> holds to rounding error.

use crate::array_utils::{detector_bin, norm, pixel_center};
use crate::dataset::check_shape;
use crate::error::{RecoError, Result};
use cfl::ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fs;
use std::path::Path;

/// acquisition geometry stored next to a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub image_size: usize,
    pub n_angles: usize,
    pub n_detectors: usize,
    #[serde(default = "default_spacing")]
    pub detector_spacing: f32,
}

fn default_spacing() -> f32 {
    1.
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            image_size: 64,
            n_angles: 60,
            n_detectors: 91,
            detector_spacing: 1.,
        }
    }
}

impl Geometry {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let g: Geometry = toml::from_str(&s)?;
        g.validate()?;
        Ok(g)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        fs::write(path, s)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.n_angles == 0 || self.n_detectors == 0 {
            return Err(RecoError::InvalidGeometry(format!("all sizes must be non-zero: {:?}", self)));
        }
        if !(self.detector_spacing > 0.) {
            return Err(RecoError::InvalidGeometry(format!("detector spacing must be positive, got {}", self.detector_spacing)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RayTransform {
    geometry: Geometry,
    cos_sin: Vec<(f32, f32)>,
}

impl RayTransform {
    pub fn new(geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let cos_sin = (0..geometry.n_angles).map(|k| {
            let theta = PI * k as f32 / geometry.n_angles as f32;
            (theta.cos(), theta.sin())
        }).collect();
        Ok(Self { geometry, cos_sin })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// shape of the image space
    pub fn domain_shape(&self) -> [usize; 2] {
        [self.geometry.image_size, self.geometry.image_size]
    }

    /// shape of the sinogram space
    pub fn range_shape(&self) -> [usize; 2] {
        [self.geometry.n_angles, self.geometry.n_detectors]
    }

    /// fractional detector coordinate of a pixel center for angle k
    #[inline]
    fn detector_coord(&self, k: usize, row: usize, col: usize) -> f32 {
        let [x, y] = pixel_center(row, col, self.geometry.image_size);
        let (c, s) = self.cos_sin[k];
        (x * c + y * s) / self.geometry.detector_spacing + 0.5 * (self.geometry.n_detectors as f32 - 1.)
    }

    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        check_shape(self.domain_shape(), x.dim().into())?;
        let n_det = self.geometry.n_detectors;
        let mut sino = vec![0f32; self.geometry.n_angles * n_det];
        sino.par_chunks_exact_mut(n_det).enumerate().for_each(|(k, row)| {
            x.indexed_iter().for_each(|((i, j), &v)| {
                if v == 0. {
                    return;
                }
                if let Some((t0, w)) = detector_bin(self.detector_coord(k, i, j), n_det) {
                    if t0 >= 0 {
                        row[t0 as usize] += (1. - w) * v;
                    }
                    if ((t0 + 1) as usize) < n_det {
                        row[(t0 + 1) as usize] += w * v;
                    }
                }
            });
        });
        Array2::from_shape_vec(self.range_shape(), sino).map_err(|e| RecoError::InvalidGeometry(e.to_string()))
    }

    pub fn adjoint(&self, y: &Array2<f32>) -> Result<Array2<f32>> {
        check_shape(self.range_shape(), y.dim().into())?;
        let n = self.geometry.image_size;
        let n_det = self.geometry.n_detectors;
        let mut img = vec![0f32; n * n];
        img.par_iter_mut().enumerate().for_each(|(idx, px)| {
            let (i, j) = (idx / n, idx % n);
            *px = (0..self.geometry.n_angles).map(|k| {
                match detector_bin(self.detector_coord(k, i, j), n_det) {
                    Some((t0, w)) => {
                        let lo = if t0 >= 0 { (1. - w) * y[[k, t0 as usize]] } else { 0. };
                        let hi = if ((t0 + 1) as usize) < n_det { w * y[[k, (t0 + 1) as usize]] } else { 0. };
                        lo + hi
                    }
                    None => 0.,
                }
            }).sum();
        });
        Array2::from_shape_vec(self.domain_shape(), img).map_err(|e| RecoError::InvalidGeometry(e.to_string()))
    }

    /// estimates the operator norm ||A|| with a few power iterations on A*A
    pub fn op_norm(&self, n_iter: usize) -> Result<f32> {
        let mut v = Array2::from_elem(self.domain_shape(), 1. / self.geometry.image_size as f32);
        let mut estimate = 0.;
        for _ in 0..n_iter.max(1) {
            let w = self.adjoint(&self.forward(&v)?)?;
            let w_norm = norm(w.as_slice().unwrap_or(&[]));
            if w_norm == 0. {
                return Ok(0.);
            }
            estimate = w_norm.sqrt();
            v = w / w_norm;
        }
        Ok(estimate)
    }
}
