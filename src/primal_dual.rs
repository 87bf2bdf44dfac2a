// Learned primal-dual reconstruction
// an unrolled primal-dual scheme for 1/2 ||Ax - y||^2 with an optional non-negativity constraint.
// Each of the n_iter unrolled iterations has its own dual step (sigma) and primal step (tau), and
// these step sizes are the learned parameters:
//      h <- (h + sigma_k (A x_bar - y)) / (1 + sigma_k)
//      x' <- P(x - tau_k A* h),  x_bar <- 2 x' - x
// Training minimizes the mean squared error to the ground truth over mini-batches of the train part
// by central finite differences on the log step sizes.

use crate::dataset::{check_shape, Dataset, Part};
use crate::error::{RecoError, Result};
use crate::metrics::Measure;
use crate::ray_trafo::RayTransform;
use crate::reconstructor::{LearnedReconstructor, Reconstructor};
use cfl::ndarray::{Array2, Zip};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LpdHyperParams {
    /// number of unrolled primal-dual iterations
    pub n_iter: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// finite difference step in log step-size space
    pub fd_step: f32,
    /// initial step sizes are init_step_scale / ||A||
    pub init_step_scale: f32,
    /// power iterations used to estimate ||A||
    pub norm_iter: usize,
    /// upper bound on validation samples scored after each epoch
    pub max_validation_samples: usize,
    pub nonneg: bool,
    /// seed of the mini-batch order
    pub seed: u64,
}

impl Default for LpdHyperParams {
    fn default() -> Self {
        Self {
            n_iter: 10,
            epochs: 20,
            batch_size: 8,
            learning_rate: 0.05,
            fd_step: 1e-3,
            init_step_scale: 0.9,
            norm_iter: 20,
            max_validation_samples: 100,
            nonneg: true,
            seed: 0,
        }
    }
}

impl LpdHyperParams {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(RecoError::InvalidHyperParams(msg.to_string()));
        if self.n_iter == 0 {
            return bad("n_iter must be at least 1");
        }
        if self.batch_size == 0 {
            return bad("batch_size must be at least 1");
        }
        if !(self.learning_rate > 0.) || !(self.fd_step > 0.) || !(self.init_step_scale > 0.) {
            return bad("learning_rate, fd_step and init_step_scale must be positive");
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RecoError::HyperParamsNotFound(path.to_path_buf()));
        }
        let s = fs::read_to_string(path)?;
        let hp: LpdHyperParams = toml::from_str(&s)?;
        hp.validate()?;
        Ok(hp)
    }
}

/// per-iteration step sizes of the unrolled scheme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedParams {
    pub sigma: Vec<f32>,
    pub tau: Vec<f32>,
}

impl LearnedParams {
    fn constant(n_iter: usize, step: f32) -> Self {
        Self {
            sigma: vec![step; n_iter],
            tau: vec![step; n_iter],
        }
    }

    fn n_iter(&self) -> usize {
        self.sigma.len()
    }

    fn to_log(&self) -> Vec<f32> {
        self.sigma.iter().chain(&self.tau).map(|s| s.ln()).collect()
    }

    fn from_log(theta: &[f32]) -> Self {
        let n = theta.len() / 2;
        Self {
            sigma: theta[..n].iter().map(|t| t.exp()).collect(),
            tau: theta[n..].iter().map(|t| t.exp()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EpochRecord {
    epoch: usize,
    train_loss: f64,
    validation_psnr: f64,
    seconds: f32,
}

pub struct LearnedPdReconstructor {
    ray_trafo: RayTransform,
    op_norm: f32,
    num_workers: usize,
    hyper_params: LpdHyperParams,
    params: LearnedParams,
    /// where the best parameters seen during training are written
    pub save_best_learned_params_path: Option<PathBuf>,
    /// directory receiving the json-lines training log
    pub log_dir: Option<PathBuf>,
}

impl LearnedPdReconstructor {
    /// `num_workers` sizes the thread pool used during training (0 selects rayon's default)
    pub fn new(ray_trafo: RayTransform, num_workers: usize) -> Result<Self> {
        let hyper_params = LpdHyperParams::default();
        let op_norm = ray_trafo.op_norm(hyper_params.norm_iter)?;
        if !(op_norm > 0.) {
            return Err(RecoError::InvalidGeometry("ray transform has zero norm".to_string()));
        }
        let params = LearnedParams::constant(hyper_params.n_iter, hyper_params.init_step_scale / op_norm);
        Ok(Self {
            ray_trafo,
            op_norm,
            num_workers,
            hyper_params,
            params,
            save_best_learned_params_path: None,
            log_dir: None,
        })
    }

    pub fn hyper_params(&self) -> &LpdHyperParams {
        &self.hyper_params
    }

    pub fn learned_params(&self) -> &LearnedParams {
        &self.params
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn set_hyper_params(&mut self, hyper_params: LpdHyperParams) -> Result<()> {
        hyper_params.validate()?;
        if hyper_params.n_iter != self.params.n_iter() || hyper_params.init_step_scale != self.hyper_params.init_step_scale {
            self.params = LearnedParams::constant(hyper_params.n_iter, hyper_params.init_step_scale / self.op_norm);
        }
        self.hyper_params = hyper_params;
        Ok(())
    }

    fn reconstruct_with(&self, params: &LearnedParams, y: &Array2<f32>) -> Result<Array2<f32>> {
        check_shape(self.ray_trafo.range_shape(), y.dim().into())?;
        let nonneg = self.hyper_params.nonneg;
        let mut x = Array2::<f32>::zeros(self.ray_trafo.domain_shape());
        let mut x_bar = x.clone();
        let mut h = Array2::<f32>::zeros(self.ray_trafo.range_shape());
        for (&sigma, &tau) in params.sigma.iter().zip(&params.tau) {
            let ax = self.ray_trafo.forward(&x_bar)?;
            Zip::from(&mut h).and(&ax).and(y).for_each(|h, &ax, &y| {
                *h = (*h + sigma * (ax - y)) / (1. + sigma);
            });
            let ath = self.ray_trafo.adjoint(&h)?;
            Zip::from(&mut x).and(&mut x_bar).and(&ath).for_each(|x, x_bar, &g| {
                let v = *x - tau * g;
                let v = if nonneg { v.max(0.) } else { v };
                *x_bar = 2. * v - *x;
                *x = v;
            });
        }
        Ok(x)
    }

    /// mean squared error of the reconstructions of a batch
    fn batch_loss(&self, params: &LearnedParams, batch: &[(Array2<f32>, Array2<f32>)]) -> Result<f64> {
        let losses = batch.par_iter().map(|(y, gt)| {
            let x = self.reconstruct_with(params, y)?;
            let se = x.iter().zip(gt.iter()).map(|(&a, &b)| (a as f64 - b as f64).powi(2)).sum::<f64>();
            Ok(se / gt.len() as f64)
        }).collect::<Result<Vec<f64>>>()?;
        Ok(losses.iter().sum::<f64>() / losses.len() as f64)
    }

    /// one normalized gradient step on the log step sizes, returns the loss before the step
    fn train_step(&mut self, batch: &[(Array2<f32>, Array2<f32>)]) -> Result<f64> {
        let theta = self.params.to_log();
        let eps = self.hyper_params.fd_step;
        let loss = self.batch_loss(&self.params, batch)?;

        let mut grad = vec![0f32; theta.len()];
        for (p, g) in grad.iter_mut().enumerate() {
            let mut plus = theta.clone();
            plus[p] += eps;
            let mut minus = theta.clone();
            minus[p] -= eps;
            let lp = self.batch_loss(&LearnedParams::from_log(&plus), batch)?;
            let lm = self.batch_loss(&LearnedParams::from_log(&minus), batch)?;
            *g = ((lp - lm) / (2. * eps as f64)) as f32;
        }

        let g_norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
        if g_norm > 0. && g_norm.is_finite() {
            let lr = self.hyper_params.learning_rate;
            let theta = theta.iter().zip(&grad).map(|(t, g)| t - lr * g / g_norm).collect::<Vec<_>>();
            self.params = LearnedParams::from_log(&theta);
        } else if !g_norm.is_finite() {
            warn!("non-finite gradient, skipping step");
        }
        Ok(loss)
    }

    fn validation_psnr(&self, dataset: &dyn Dataset) -> Result<f64> {
        let n = dataset.get_len(Part::Validation).min(self.hyper_params.max_validation_samples);
        if n == 0 {
            return Err(RecoError::EmptyDataset(Part::Validation));
        }
        let scores = (0..n).into_par_iter().map(|i| {
            let s = dataset.get_sample(i, Part::Validation)?;
            let x = self.reconstruct(&s.observation)?;
            Measure::Psnr.apply(&x, &s.ground_truth)
        }).collect::<Result<Vec<f64>>>()?;
        Ok(scores.iter().sum::<f64>() / n as f64)
    }

    fn log_epoch(&self, record: &EpochRecord) -> Result<()> {
        if let Some(dir) = &self.log_dir {
            fs::create_dir_all(dir)?;
            let mut f = OpenOptions::new().create(true).append(true).open(dir.join("training_log.jsonl"))?;
            writeln!(f, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }

    fn fit(&mut self, dataset: &dyn Dataset) -> Result<()> {
        let n_train = dataset.get_len(Part::Train);
        if n_train == 0 {
            return Err(RecoError::EmptyDataset(Part::Train));
        }
        check_shape(self.ray_trafo.range_shape(), dataset.observation_shape())?;
        check_shape(self.ray_trafo.domain_shape(), dataset.image_shape())?;

        let mut rng = StdRng::seed_from_u64(self.hyper_params.seed);
        let mut order = (0..n_train).collect::<Vec<usize>>();
        let mut best = (self.validation_psnr(dataset)?, self.params.clone());
        info!("validation psnr before training: {:.03} dB", best.0);

        info!("training for {} epochs on {} samples ...", self.hyper_params.epochs, n_train);
        for epoch in 0..self.hyper_params.epochs {
            let now = Instant::now();
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.;
            let n_batches = order.len().div_ceil(self.hyper_params.batch_size);
            for (batch_id, idx) in order.chunks(self.hyper_params.batch_size).enumerate() {
                let batch = idx.iter().map(|&i| {
                    dataset.get_sample(i, Part::Train).map(|s| (s.observation, s.ground_truth))
                }).collect::<Result<Vec<_>>>()?;
                let loss = self.train_step(&batch)?;
                debug!("epoch {} batch {} of {}: loss {:.3e}", epoch + 1, batch_id + 1, n_batches, loss);
                epoch_loss += loss / n_batches as f64;
            }

            let validation_psnr = self.validation_psnr(dataset)?;
            let record = EpochRecord {
                epoch: epoch + 1,
                train_loss: epoch_loss,
                validation_psnr,
                seconds: now.elapsed().as_secs_f32(),
            };
            info!("epoch {} of {}: loss {:.3e}, validation psnr {:.03} dB ({:.01} s)",
                record.epoch, self.hyper_params.epochs, record.train_loss, record.validation_psnr, record.seconds);
            self.log_epoch(&record)?;

            if validation_psnr > best.0 {
                best = (validation_psnr, self.params.clone());
                if let Some(path) = &self.save_best_learned_params_path {
                    self.save_learned_params(path)?;
                    info!("saved best parameters to {}", path.display());
                }
            }
        }

        // keep the parameters that scored best on the validation part
        self.params = best.1;
        if let Some(path) = &self.save_best_learned_params_path {
            self.save_learned_params(path)?;
        }
        Ok(())
    }
}

impl Reconstructor for LearnedPdReconstructor {
    fn reconstruct(&self, observation: &Array2<f32>) -> Result<Array2<f32>> {
        self.reconstruct_with(&self.params, observation)
    }

    fn name(&self) -> &str {
        "learned_pd"
    }
}

impl LearnedReconstructor for LearnedPdReconstructor {
    fn load_hyper_params(&mut self, path: &Path) -> Result<()> {
        let hp = LpdHyperParams::from_file(path)?;
        self.set_hyper_params(hp)
    }

    fn apply_hyper_params(&mut self, choice: &toml::Table) -> Result<()> {
        let mut table = self.hyper_params_table()?;
        table.extend(choice.iter().map(|(k, v)| (k.clone(), v.clone())));
        let hp: LpdHyperParams = toml::Value::Table(table).try_into()?;
        self.set_hyper_params(hp)
    }

    fn hyper_params_table(&self) -> Result<toml::Table> {
        match toml::Value::try_from(&self.hyper_params)? {
            toml::Value::Table(t) => Ok(t),
            other => Err(RecoError::InvalidHyperParams(format!("expected a table, got {}", other))),
        }
    }

    fn load_learned_params(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(RecoError::CheckpointNotFound(path.to_path_buf()));
        }
        let params: LearnedParams = serde_json::from_str(&fs::read_to_string(path)?)?;
        if params.sigma.len() != params.tau.len() || params.n_iter() != self.hyper_params.n_iter {
            return Err(RecoError::InvalidHyperParams(format!(
                "{} holds {} dual and {} primal steps, hyper parameters expect {}",
                path.display(), params.sigma.len(), params.tau.len(), self.hyper_params.n_iter)));
        }
        self.params = params;
        Ok(())
    }

    fn save_learned_params(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&self.params)?)?;
        Ok(())
    }

    fn train(&mut self, dataset: &dyn Dataset) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(self.num_workers).build()?;
        pool.install(|| self.fit(dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Sample, VecDataset};
    use crate::ray_trafo::Geometry;

    fn trafo() -> RayTransform {
        RayTransform::new(Geometry { image_size: 8, n_angles: 8, n_detectors: 12, detector_spacing: 1. }).unwrap()
    }

    fn phantom(k: usize) -> Array2<f32> {
        Array2::from_shape_fn((8, 8), |(i, j)| {
            let (di, dj) = (i as f32 - 3.5, j as f32 - 3.5 + (k % 3) as f32 - 1.);
            if di * di + dj * dj < 6. { 1. } else { 0. }
        })
    }

    fn dataset(a: &RayTransform, n: usize) -> VecDataset {
        let samples = (0..n).map(|k| {
            let gt = phantom(k);
            Sample { observation: a.forward(&gt).unwrap(), ground_truth: gt }
        }).collect::<Vec<_>>();
        VecDataset::new(a.range_shape(), a.domain_shape())
            .with_part(Part::Train, samples.clone()).unwrap()
            .with_part(Part::Validation, samples).unwrap()
    }

    fn quick(n_iter: usize, epochs: usize) -> LpdHyperParams {
        LpdHyperParams { n_iter, epochs, batch_size: 2, learning_rate: 0.2, ..LpdHyperParams::default() }
    }

    #[test]
    fn reconstruction_approaches_ground_truth() {
        let a = trafo();
        let mut r = LearnedPdReconstructor::new(a.clone(), 1).unwrap();
        r.set_hyper_params(LpdHyperParams { n_iter: 60, ..LpdHyperParams::default() }).unwrap();
        let gt = phantom(1);
        let x = r.reconstruct(&a.forward(&gt).unwrap()).unwrap();
        let err0 = gt.iter().map(|v| v * v).sum::<f32>();
        let err = (&x - &gt).iter().map(|v| v * v).sum::<f32>();
        assert!(err < 0.5 * err0, "{err} vs {err0}");
        assert!(x.iter().all(|&v| v >= 0.));
    }

    #[test]
    fn wrong_observation_shape_fails() {
        let r = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        assert!(matches!(r.reconstruct(&Array2::zeros((3, 3))), Err(RecoError::ShapeMismatch { .. })));
    }

    #[test]
    fn training_does_not_worsen_validation_psnr() {
        let a = trafo();
        let ds = dataset(&a, 4);
        let mut r = LearnedPdReconstructor::new(a, 2).unwrap();
        r.set_hyper_params(quick(3, 3)).unwrap();
        let before = r.validation_psnr(&ds).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        r.save_best_learned_params_path = Some(dir.path().join("best-model-0.json"));
        r.log_dir = Some(dir.path().join("logs"));
        r.train(&ds).unwrap();
        let after = r.validation_psnr(&ds).unwrap();
        assert!(after >= before - 1e-6, "{after} < {before}");
        assert!(dir.path().join("best-model-0.json").exists());
        let log = fs::read_to_string(dir.path().join("logs/training_log.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[test]
    fn training_needs_train_samples() {
        let a = trafo();
        let ds = VecDataset::new(a.range_shape(), a.domain_shape());
        let mut r = LearnedPdReconstructor::new(a, 1).unwrap();
        assert!(matches!(r.train(&ds), Err(RecoError::EmptyDataset(Part::Train))));
    }

    #[test]
    fn learned_params_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ckpt/best-model-1.json");
        let mut r = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        r.params.sigma[0] = 0.123;
        r.save_learned_params(&path).unwrap();
        let mut s = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        s.load_learned_params(&path).unwrap();
        assert_eq!(s.learned_params(), r.learned_params());
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut r = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        let e = r.load_learned_params(&dir.path().join("best-model-9.json")).unwrap_err();
        assert!(matches!(e, RecoError::CheckpointNotFound(_)));
        let e = r.load_hyper_params(&dir.path().join("params.toml")).unwrap_err();
        assert!(matches!(e, RecoError::HyperParamsNotFound(_)));
    }

    #[test]
    fn checkpoint_iteration_count_must_match() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("short.json");
        let mut r = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        r.set_hyper_params(quick(2, 1)).unwrap();
        r.save_learned_params(&path).unwrap();
        let mut s = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        assert!(matches!(s.load_learned_params(&path), Err(RecoError::InvalidHyperParams(_))));
    }

    #[test]
    fn hyper_params_load_and_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(&path, "n_iter = 4\nepochs = 2\n").unwrap();
        let mut r = LearnedPdReconstructor::new(trafo(), 1).unwrap();
        r.load_hyper_params(&path).unwrap();
        assert_eq!(r.hyper_params().n_iter, 4);
        assert_eq!(r.hyper_params().batch_size, LpdHyperParams::default().batch_size);
        assert_eq!(r.learned_params().sigma.len(), 4);

        let mut choice = toml::Table::new();
        choice.insert("batch_size".to_string(), toml::Value::Integer(3));
        r.apply_hyper_params(&choice).unwrap();
        assert_eq!(r.hyper_params().batch_size, 3);
        assert_eq!(r.hyper_params().n_iter, 4);

        choice.insert("n_iter".to_string(), toml::Value::Integer(0));
        assert!(r.apply_hyper_params(&choice).is_err());
    }
}
