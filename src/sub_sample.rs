use crate::dataset::{Dataset, Part, Sample};
use crate::error::{RecoError, Result};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

/// A fixed-size, randomly shuffled view onto a prefix of each part of a source dataset.
///
/// Every part of the view holds `max(1, floor(size_part * source_len))` samples. Logical index `i`
/// is mapped through a permutation of `0..view_len` that is drawn once at construction time from a
/// generator owned by the view, so two views built with the same seed and fraction over sources of
/// equal part lengths hand out samples in the same order.
pub struct RandomSampleDataset<D: Dataset> {
    dataset: D,
    size_part: f64,
    seed: u64,
    idx: HashMap<Part, Vec<usize>>,
}

impl<D: Dataset> RandomSampleDataset<D> {
    pub fn new(dataset: D, size_part: f64, seed: u64) -> Result<Self> {
        if !(size_part > 0. && size_part <= 1.) {
            return Err(RecoError::InvalidFraction(size_part));
        }

        // each part draws from its own generator split off a seeded root, so a permutation does
        // not depend on the lengths of the other parts
        let mut root = StdRng::seed_from_u64(seed);
        let idx = Part::ALL.into_iter().map(|part| {
            let mut rng = StdRng::from_rng(&mut root);
            let len = view_len(size_part, dataset.get_len(part));
            let mut perm = (0..len).collect::<Vec<usize>>();
            perm.shuffle(&mut rng);
            debug!("sub-sampled '{}' part: {} of {} samples", part, len, dataset.get_len(part));
            (part, perm)
        }).collect();

        Ok(Self {
            dataset,
            size_part,
            seed,
            idx,
        })
    }

    /// the source index order of a part
    pub fn permutation(&self, part: Part) -> &[usize] {
        self.idx.get(&part).map(|p| p.as_slice()).unwrap_or(&[])
    }

    pub fn size_part(&self) -> f64 {
        self.size_part
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn inner(&self) -> &D {
        &self.dataset
    }
}

/// length of a sub-sampled part, never less than one sample
pub fn view_len(size_part: f64, source_len: usize) -> usize {
    ((size_part * source_len as f64).floor() as usize).max(1)
}

impl<D: Dataset> Dataset for RandomSampleDataset<D> {
    fn get_len(&self, part: Part) -> usize {
        self.permutation(part).len()
    }

    fn get_sample(&self, index: usize, part: Part) -> Result<Sample> {
        let perm = self.permutation(part);
        match perm.get(index) {
            Some(&source_index) => self.dataset.get_sample(source_index, part),
            None => Err(RecoError::IndexOutOfRange { index, part, len: perm.len() }),
        }
    }

    fn observation_shape(&self) -> [usize; 2] {
        self.dataset.observation_shape()
    }

    fn image_shape(&self) -> [usize; 2] {
        self.dataset.image_shape()
    }

    fn name(&self) -> &str {
        self.dataset.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::tagged_dataset;

    #[test]
    fn view_length_is_floored_fraction() {
        for source_len in [0usize, 1, 3, 9, 10, 11, 99, 100, 1000, 35820] {
            for fraction in [0.01, 0.1, 0.25, 0.5, 0.999, 1.0] {
                let expected = ((fraction * source_len as f64).floor() as usize).max(1);
                assert_eq!(view_len(fraction, source_len), expected);
            }
        }
        assert_eq!(view_len(0.1, 100), 10);
        assert_eq!(view_len(1.0, 7), 7);
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        for f in [0., -0.5, 1.5, f64::NAN] {
            let r = RandomSampleDataset::new(tagged_dataset(10, 10, 10), f, 0);
            assert!(matches!(r, Err(RecoError::InvalidFraction(_))));
        }
    }

    #[test]
    fn same_seed_same_permutation() {
        let a = RandomSampleDataset::new(tagged_dataset(100, 50, 20), 0.5, 7).unwrap();
        let b = RandomSampleDataset::new(tagged_dataset(100, 50, 20), 0.5, 7).unwrap();
        for part in Part::ALL {
            assert_eq!(a.permutation(part), b.permutation(part));
        }
        let c = RandomSampleDataset::new(tagged_dataset(100, 50, 20), 0.5, 8).unwrap();
        assert_ne!(a.permutation(Part::Train), c.permutation(Part::Train));
    }

    #[test]
    fn permutation_is_bijection_onto_prefix() {
        let ds = RandomSampleDataset::new(tagged_dataset(100, 40, 0), 0.1, 0).unwrap();
        let mut train = ds.permutation(Part::Train).to_vec();
        assert_eq!(train.len(), 10);
        train.sort();
        assert_eq!(train, (0..10).collect::<Vec<_>>());
        assert_eq!(ds.get_len(Part::Validation), 4);
    }

    #[test]
    fn part_permutation_ignores_other_part_lengths() {
        let a = RandomSampleDataset::new(tagged_dataset(100, 10, 10), 0.5, 3).unwrap();
        let b = RandomSampleDataset::new(tagged_dataset(100, 80, 30), 0.5, 3).unwrap();
        assert_eq!(a.permutation(Part::Train), b.permutation(Part::Train));
    }

    #[test]
    fn retrieval_delegates_through_permutation() {
        let ds = RandomSampleDataset::new(tagged_dataset(100, 20, 5), 0.1, 0).unwrap();
        assert_eq!(ds.get_len(Part::Train), 10);
        for i in 0..ds.get_len(Part::Train) {
            let s = ds.get_sample(i, Part::Train).unwrap();
            // the tagged dataset stores the source index in the observation
            assert_eq!(s.observation[[0, 0]] as usize, ds.permutation(Part::Train)[i]);
            assert_eq!(s.ground_truth[[0, 0]], Part::Train as usize as f32);
        }
        let e = ds.get_sample(10, Part::Train).unwrap_err();
        assert!(matches!(e, RecoError::IndexOutOfRange { index: 10, part: Part::Train, len: 10 }));
    }

    #[test]
    fn tiny_part_keeps_one_sample() {
        let ds = RandomSampleDataset::new(tagged_dataset(3, 3, 3), 0.1, 0).unwrap();
        assert_eq!(ds.get_len(Part::Train), 1);
        let s = ds.get_sample(0, Part::Train).unwrap();
        assert_eq!(s.observation[[0, 0]], 0.);
        assert!(matches!(ds.get_sample(1, Part::Train), Err(RecoError::IndexOutOfRange { index: 1, .. })));
    }

    #[test]
    fn shapes_are_forwarded() {
        let ds = RandomSampleDataset::new(tagged_dataset(4, 4, 4), 1.0, 1).unwrap();
        assert_eq!(ds.observation_shape(), [1, 2]);
        assert_eq!(ds.image_shape(), [2, 2]);
        assert_eq!(ds.inner().get_len(Part::Train), 4);
    }
}
