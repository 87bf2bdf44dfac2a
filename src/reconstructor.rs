use crate::dataset::Dataset;
use crate::error::Result;
use cfl::ndarray::Array2;
use std::path::{Path, PathBuf};

/// maps an observation (sinogram) to a reconstructed image
pub trait Reconstructor: Send + Sync {
    fn reconstruct(&self, observation: &Array2<f32>) -> Result<Array2<f32>>;

    fn name(&self) -> &str {
        "reconstructor"
    }
}

impl<R: Reconstructor + ?Sized> Reconstructor for Box<R> {
    fn reconstruct(&self, observation: &Array2<f32>) -> Result<Array2<f32>> {
        (**self).reconstruct(observation)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// a reconstructor with hyper parameters and learned parameters that can be trained on a dataset
pub trait LearnedReconstructor: Reconstructor {
    /// loads a named hyper parameter file (toml)
    fn load_hyper_params(&mut self, path: &Path) -> Result<()>;

    /// overrides hyper parameters with the entries of `choice`. Missing entries keep their
    /// current value.
    fn apply_hyper_params(&mut self, choice: &toml::Table) -> Result<()>;

    /// the current hyper parameters as a table
    fn hyper_params_table(&self) -> Result<toml::Table>;

    /// loads a named set of learned parameters
    fn load_learned_params(&mut self, path: &Path) -> Result<()>;

    fn save_learned_params(&self, path: &Path) -> Result<()>;

    /// fits the learned parameters on the train part, validating on the validation part
    fn train(&mut self, dataset: &dyn Dataset) -> Result<()>;
}

/// checkpoint name of the i-th independently trained model
pub fn checkpoint_name(index: u64) -> String {
    format!("best-model-{}", index)
}

/// resolves a checkpoint name to its learned parameter file
pub fn learned_params_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.json", name))
}

/// resolves a hyper parameter name to its file
pub fn hyper_params_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.toml", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_naming() {
        assert_eq!(checkpoint_name(0), "best-model-0");
        assert_eq!(checkpoint_name(9), "best-model-9");
        assert_eq!(learned_params_path("ckpt", "best-model-3"), Path::new("ckpt/best-model-3.json"));
        assert_eq!(hyper_params_path(".", "params"), Path::new("./params.toml"));
    }
}
