pub mod array_utils;
pub mod data_import;
pub mod dataset;
pub mod ensemble;
pub mod error;
pub mod metrics;
pub mod primal_dual;
pub mod ray_trafo;
pub mod reconstructor;
pub mod sub_sample;
pub mod task_table;

use crate::primal_dual::LearnedPdReconstructor;
use crate::ray_trafo::RayTransform;
use crate::reconstructor::LearnedReconstructor;
use std::path::Path;

pub use crate::error::{RecoError, Result};

/// fraction of the train and validation parts used when training
pub const TRAIN_SIZE_PART: f64 = 0.1;
/// number of leading test samples scored by the evaluation
pub const N_TEST_SAMPLES: usize = 100;
/// worker hint passed to the reconstructor for training
pub const NUM_WORKERS: usize = 8;

/// builds a learned primal-dual reconstructor with hyper parameters from `hyper_params` and, if
/// given, learned parameters from `checkpoint`
pub fn load_learned_pd(ray_trafo: &RayTransform, hyper_params: &Path, checkpoint: Option<&Path>, num_workers: usize) -> Result<LearnedPdReconstructor> {
    let mut reconstructor = LearnedPdReconstructor::new(ray_trafo.clone(), num_workers)?;
    reconstructor.load_hyper_params(hyper_params)?;
    if let Some(checkpoint) = checkpoint {
        reconstructor.load_learned_params(checkpoint)?;
    }
    Ok(reconstructor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primal_dual::LpdHyperParams;
    use crate::ray_trafo::Geometry;
    use crate::reconstructor::{checkpoint_name, hyper_params_path, learned_params_path};
    use std::fs;

    #[test]
    fn loads_hyper_params_and_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = RayTransform::new(Geometry { image_size: 8, n_angles: 4, n_detectors: 12, detector_spacing: 1. }).unwrap();
        let hp = hyper_params_path(dir.path(), "params");
        fs::write(&hp, toml::to_string(&LpdHyperParams { n_iter: 3, ..LpdHyperParams::default() }).unwrap()).unwrap();

        let trained = load_learned_pd(&a, &hp, None, 1).unwrap();
        let ckpt = learned_params_path(dir.path(), &checkpoint_name(0));
        trained.save_learned_params(&ckpt).unwrap();

        let r = load_learned_pd(&a, &hp, Some(&ckpt), 1).unwrap();
        assert_eq!(r.learned_params(), trained.learned_params());

        let missing = learned_params_path(dir.path(), &checkpoint_name(1));
        assert!(matches!(load_learned_pd(&a, &hp, Some(&missing), 1), Err(RecoError::CheckpointNotFound(_))));
    }
}
