// Dataset abstraction shared by file-backed data, sub-sampled views and the task table

use crate::error::{RecoError, Result};
use cfl::ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// named split of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    Train,
    Validation,
    Test,
}

impl Part {
    pub const ALL: [Part; 3] = [Part::Train, Part::Validation, Part::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Part::Train => "train",
            Part::Validation => "validation",
            Part::Test => "test",
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Part {
    type Err = RecoError;
    fn from_str(s: &str) -> Result<Self> {
        Part::ALL.into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| RecoError::UnknownPart(s.to_string()))
    }
}

/// an (observation, ground truth) pair. The observation is a sinogram of shape
/// [n_angles, n_detectors], the ground truth an image of shape [n, n].
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub observation: Array2<f32>,
    pub ground_truth: Array2<f32>,
}

/// observations and ground truths collected from a dataset part, aligned by index
#[derive(Debug, Clone, Default)]
pub struct DataPairs {
    pub observations: Vec<Array2<f32>>,
    pub ground_truths: Vec<Array2<f32>>,
}

impl DataPairs {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn push(&mut self, sample: Sample) {
        self.observations.push(sample.observation);
        self.ground_truths.push(sample.ground_truth);
    }

    pub fn iter(&self) -> impl Iterator<Item=(&Array2<f32>, &Array2<f32>)> {
        self.observations.iter().zip(self.ground_truths.iter())
    }
}

/// an indexed collection of samples per part. Implementations must be `Send + Sync` so samples
/// can be drawn from several threads at once.
pub trait Dataset: Send + Sync {
    /// number of samples in `part`
    fn get_len(&self, part: Part) -> usize;

    /// retrieve the sample at `index` of `part`. Indices at or beyond `get_len(part)` fail with
    /// [RecoError::IndexOutOfRange]
    fn get_sample(&self, index: usize, part: Part) -> Result<Sample>;

    /// shape of a single observation
    fn observation_shape(&self) -> [usize; 2];

    /// shape of a single reconstructed image
    fn image_shape(&self) -> [usize; 2];

    fn name(&self) -> &str {
        "dataset"
    }

    /// collects the first `n` samples of a part (all of them if `n` is None or exceeds the part)
    fn get_data_pairs(&self, part: Part, n: Option<usize>) -> Result<DataPairs> {
        let len = self.get_len(part);
        let n = n.map_or(len, |n| n.min(len));
        let mut pairs = DataPairs::default();
        for i in 0..n {
            pairs.push(self.get_sample(i, part)?);
        }
        Ok(pairs)
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    fn get_len(&self, part: Part) -> usize {
        (**self).get_len(part)
    }

    fn get_sample(&self, index: usize, part: Part) -> Result<Sample> {
        (**self).get_sample(index, part)
    }

    fn observation_shape(&self) -> [usize; 2] {
        (**self).observation_shape()
    }

    fn image_shape(&self) -> [usize; 2] {
        (**self).image_shape()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_data_pairs(&self, part: Part, n: Option<usize>) -> Result<DataPairs> {
        (**self).get_data_pairs(part, n)
    }
}

/// in-memory dataset, mostly useful for synthetic data and tests
#[derive(Debug, Clone)]
pub struct VecDataset {
    parts: HashMap<Part, Vec<Sample>>,
    observation_shape: [usize; 2],
    image_shape: [usize; 2],
}

impl VecDataset {
    pub fn new(observation_shape: [usize; 2], image_shape: [usize; 2]) -> Self {
        Self {
            parts: HashMap::new(),
            observation_shape,
            image_shape,
        }
    }

    /// sets the samples of a part. All samples must match the dataset shapes.
    pub fn with_part(mut self, part: Part, samples: Vec<Sample>) -> Result<Self> {
        for s in &samples {
            check_shape(self.observation_shape, s.observation.dim().into())?;
            check_shape(self.image_shape, s.ground_truth.dim().into())?;
        }
        self.parts.insert(part, samples);
        Ok(self)
    }
}

impl Dataset for VecDataset {
    fn get_len(&self, part: Part) -> usize {
        self.parts.get(&part).map_or(0, |s| s.len())
    }

    fn get_sample(&self, index: usize, part: Part) -> Result<Sample> {
        self.parts.get(&part)
            .and_then(|s| s.get(index))
            .cloned()
            .ok_or(RecoError::IndexOutOfRange { index, part, len: self.get_len(part) })
    }

    fn observation_shape(&self) -> [usize; 2] {
        self.observation_shape
    }

    fn image_shape(&self) -> [usize; 2] {
        self.image_shape
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

pub(crate) fn check_shape(expected: [usize; 2], found: [usize; 2]) -> Result<()> {
    if expected != found {
        return Err(RecoError::ShapeMismatch { expected, found });
    }
    Ok(())
}
