use crate::dataset::check_shape;
use crate::error::{RecoError, Result};
use crate::reconstructor::Reconstructor;
use cfl::ndarray::Array2;
use rayon::prelude::*;

/// Averages the reconstructions of several independently trained reconstructors.
///
/// Members run in parallel and the average is formed only after every member has returned. A failing
/// member fails the whole reconstruction.
pub struct EnsembleReconstructor {
    reconstructors: Vec<Box<dyn Reconstructor>>,
}

impl EnsembleReconstructor {
    pub fn new(reconstructors: Vec<Box<dyn Reconstructor>>) -> Result<Self> {
        if reconstructors.is_empty() {
            return Err(RecoError::EmptyEnsemble);
        }
        Ok(Self { reconstructors })
    }

    pub fn len(&self) -> usize {
        self.reconstructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconstructors.is_empty()
    }
}

impl Reconstructor for EnsembleReconstructor {
    fn reconstruct(&self, observation: &Array2<f32>) -> Result<Array2<f32>> {
        let reconstructions = self.reconstructors.par_iter()
            .map(|r| r.reconstruct(observation))
            .collect::<Result<Vec<_>>>()?;

        let n = reconstructions.len();
        let mut iter = reconstructions.into_iter();
        let mut sum = iter.next().ok_or(RecoError::EmptyEnsemble)?;
        let shape: [usize; 2] = sum.dim().into();
        for r in iter {
            check_shape(shape, r.dim().into())?;
            sum += &r;
        }
        sum /= n as f32;
        Ok(sum)
    }

    fn name(&self) -> &str {
        "ensemble"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// returns a constant image scaled by the observation's first entry
    struct Constant(f32, [usize; 2]);

    impl Reconstructor for Constant {
        fn reconstruct(&self, observation: &Array2<f32>) -> Result<Array2<f32>> {
            let [m, n] = self.1;
            Ok(Array2::from_elem((m, n), self.0 * observation[[0, 0]]))
        }
    }

    struct Failing(Arc<AtomicUsize>);

    impl Reconstructor for Failing {
        fn reconstruct(&self, _: &Array2<f32>) -> Result<Array2<f32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RecoError::CheckpointNotFound("missing".into()))
        }
    }

    fn obs() -> Array2<f32> {
        Array2::from_elem((2, 3), 2.)
    }

    #[test]
    fn empty_ensemble_is_rejected() {
        assert!(matches!(EnsembleReconstructor::new(vec![]), Err(RecoError::EmptyEnsemble)));
    }

    #[test]
    fn mean_of_members() {
        let members: Vec<Box<dyn Reconstructor>> = vec![
            Box::new(Constant(1., [4, 4])),
            Box::new(Constant(2., [4, 4])),
            Box::new(Constant(6., [4, 4])),
        ];
        let ensemble = EnsembleReconstructor::new(members).unwrap();
        let x = ensemble.reconstruct(&obs()).unwrap();
        assert_eq!(x.dim(), (4, 4));
        // (2 + 4 + 12) / 3
        x.iter().for_each(|&v| assert!((v - 6.).abs() < 1e-6));
    }

    #[test]
    fn mean_of_varying_images() {
        struct Ramp(f32);
        impl Reconstructor for Ramp {
            fn reconstruct(&self, _: &Array2<f32>) -> Result<Array2<f32>> {
                Ok(Array2::from_shape_fn((3, 5), |(i, j)| self.0 * (i * 5 + j) as f32))
            }
        }
        let ensemble = EnsembleReconstructor::new(vec![Box::new(Ramp(0.5)), Box::new(Ramp(1.5))]).unwrap();
        let x = ensemble.reconstruct(&obs()).unwrap();
        x.indexed_iter().for_each(|((i, j), &v)| {
            assert!((v - (i * 5 + j) as f32).abs() < 1e-5);
        });
    }

    #[test]
    fn single_member_is_identity() {
        struct Odd;
        impl Reconstructor for Odd {
            fn reconstruct(&self, _: &Array2<f32>) -> Result<Array2<f32>> {
                Ok(Array2::from_shape_fn((3, 3), |(i, j)| 0.1 + 1. / (1. + i as f32 + 7. * j as f32)))
            }
        }
        let ensemble = EnsembleReconstructor::new(vec![Box::new(Odd)]).unwrap();
        assert_eq!(ensemble.reconstruct(&obs()).unwrap(), Odd.reconstruct(&obs()).unwrap());
    }

    #[test]
    fn member_failure_fails_ensemble() {
        let calls = Arc::new(AtomicUsize::new(0));
        let members: Vec<Box<dyn Reconstructor>> = vec![
            Box::new(Constant(1., [2, 2])),
            Box::new(Failing(calls.clone())),
            Box::new(Constant(3., [2, 2])),
        ];
        let ensemble = EnsembleReconstructor::new(members).unwrap();
        let r = ensemble.reconstruct(&obs());
        assert!(matches!(r, Err(RecoError::CheckpointNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn differing_member_shapes_fail() {
        let members: Vec<Box<dyn Reconstructor>> = vec![
            Box::new(Constant(1., [2, 2])),
            Box::new(Constant(1., [3, 2])),
        ];
        let ensemble = EnsembleReconstructor::new(members).unwrap();
        assert!(matches!(ensemble.reconstruct(&obs()), Err(RecoError::ShapeMismatch { .. })));
    }
}
