use crate::dataset::Part;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoError {
    #[error("index {index} out of range for dataset part '{part}' (len: {len})")]
    IndexOutOfRange { index: usize, part: Part, len: usize },
    #[error("no learned parameters found at {}", .0.display())]
    CheckpointNotFound(PathBuf),
    #[error("no hyper parameters found at {}", .0.display())]
    HyperParamsNotFound(PathBuf),
    #[error("an ensemble needs at least one reconstructor")]
    EmptyEnsemble,
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: [usize; 2], found: [usize; 2] },
    #[error("size fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("unknown dataset part '{0}'")]
    UnknownPart(String),
    #[error("dataset part '{0}' has no samples")]
    EmptyDataset(Part),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("unknown measure '{0}'")]
    UnknownMeasure(String),
    #[error("cannot evaluate {measure}: {msg}")]
    Measure { measure: &'static str, msg: String },
    #[error("invalid hyper parameters: {0}")]
    InvalidHyperParams(String),
    #[error("cfl error for {}: {msg}", .path.display())]
    Cfl { path: PathBuf, msg: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Glob(#[from] glob::PatternError),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, RecoError>;
