use crate::dataset::{check_shape, DataPairs, Dataset, Part, Sample};
use crate::error::{RecoError, Result};
use crate::ray_trafo::{Geometry, RayTransform};
use cfl::ndarray::{Array2, Ix2, ShapeBuilder};
use cfl::num_complex::Complex32;
use log::info;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const GEOMETRY_FILE: &str = "geometry.toml";

/// file stem of the observation of sample `index`
fn observation_name(index: usize) -> String {
    format!("observation_{:05}", index)
}

/// file stem of the ground truth of sample `index`
fn ground_truth_name(index: usize) -> String {
    format!("ground_truth_{:05}", index)
}

/// A dataset stored as cfl files.
///
/// Layout under the root directory:
/// ```text
/// geometry.toml
/// train/observation_00000.{cfl,hdr}
/// train/ground_truth_00000.{cfl,hdr}
/// validation/...
/// test/...
/// ```
/// Samples of a part are numbered contiguously from zero. Missing part directories are empty parts.
pub struct CflDataset {
    root: PathBuf,
    ray_trafo: RayTransform,
    lens: HashMap<Part, usize>,
}

impl CflDataset {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let geometry = Geometry::from_file(root.join(GEOMETRY_FILE))?;
        let ray_trafo = RayTransform::new(geometry)?;

        let mut lens = HashMap::new();
        for part in Part::ALL {
            let dir = root.join(part.as_str());
            let n_obs = count_files(&dir, "observation_*.cfl")?;
            let n_gt = count_files(&dir, "ground_truth_*.cfl")?;
            if n_obs != n_gt {
                return Err(RecoError::Cfl {
                    path: dir,
                    msg: format!("found {} observations but {} ground truths", n_obs, n_gt),
                });
            }
            lens.insert(part, n_obs);
        }
        info!("opened dataset at {} (train: {}, validation: {}, test: {})",
            root.display(), lens[&Part::Train], lens[&Part::Validation], lens[&Part::Test]);

        Ok(Self { root, ray_trafo, lens })
    }

    /// creates an empty dataset directory with the given geometry
    pub fn create(root: impl AsRef<Path>, geometry: &Geometry) -> Result<()> {
        let root = root.as_ref();
        geometry.validate()?;
        fs::create_dir_all(root)?;
        geometry.to_file(root.join(GEOMETRY_FILE))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ray_trafo(&self) -> &RayTransform {
        &self.ray_trafo
    }
}

fn count_files(dir: &Path, pattern: &str) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let p = glob::glob(&dir.join(pattern).display().to_string())?;
    Ok(p.filter_map(|entry| entry.ok()).count())
}

/// reads a real-valued 2-D array from a cfl file (imaginary parts are dropped)
pub fn read_cfl_2d(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let x = cfl::to_array(path, true).map_err(|e| RecoError::Cfl { path: path.to_path_buf(), msg: format!("{:?}", e) })?;
    let x = x.into_dimensionality::<Ix2>().map_err(|e| RecoError::Cfl { path: path.to_path_buf(), msg: e.to_string() })?;
    Ok(x.mapv(|c| c.re))
}

/// writes a real-valued 2-D array to a cfl file in column-major order
pub fn write_cfl_2d(path: impl AsRef<Path>, x: &Array2<f32>) -> Result<()> {
    let path = path.as_ref();
    let c = Array2::from_shape_fn(x.dim().f(), |(i, j)| Complex32::new(x[[i, j]], 0.));
    cfl::from_array(path, &c.into_dyn()).map_err(|e| RecoError::Cfl { path: path.to_path_buf(), msg: format!("{:?}", e) })?;
    Ok(())
}

/// writes sample `index` of `part` into a dataset directory
pub fn write_sample(root: impl AsRef<Path>, part: Part, index: usize, sample: &Sample) -> Result<()> {
    let dir = root.as_ref().join(part.as_str());
    fs::create_dir_all(&dir)?;
    write_cfl_2d(dir.join(observation_name(index)), &sample.observation)?;
    write_cfl_2d(dir.join(ground_truth_name(index)), &sample.ground_truth)
}

impl Dataset for CflDataset {
    fn get_len(&self, part: Part) -> usize {
        self.lens.get(&part).copied().unwrap_or(0)
    }

    fn get_sample(&self, index: usize, part: Part) -> Result<Sample> {
        let len = self.get_len(part);
        if index >= len {
            return Err(RecoError::IndexOutOfRange { index, part, len });
        }
        let dir = self.root.join(part.as_str());
        let observation = read_cfl_2d(dir.join(observation_name(index)))?;
        let ground_truth = read_cfl_2d(dir.join(ground_truth_name(index)))?;
        check_shape(self.observation_shape(), observation.dim().into())?;
        check_shape(self.image_shape(), ground_truth.dim().into())?;
        Ok(Sample { observation, ground_truth })
    }

    fn observation_shape(&self) -> [usize; 2] {
        self.ray_trafo.range_shape()
    }

    fn image_shape(&self) -> [usize; 2] {
        self.ray_trafo.domain_shape()
    }

    fn name(&self) -> &str {
        "cfl"
    }

    /// reads the samples in parallel
    fn get_data_pairs(&self, part: Part, n: Option<usize>) -> Result<DataPairs> {
        let len = self.get_len(part);
        let n = n.map_or(len, |n| n.min(len));
        let samples = (0..n).into_par_iter()
            .map(|i| self.get_sample(i, part))
            .collect::<Result<Vec<_>>>()?;
        let mut pairs = DataPairs::default();
        samples.into_iter().for_each(|s| pairs.push(s));
        Ok(pairs)
    }
}
