use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid encoding size {size} for {model} model")]
    InvalidEncodingSize { model: &'static str, size: usize },

    #[error("unknown feature \"{name}\" for {model} model")]
    UnknownFeature { model: &'static str, name: String },

    #[error("unknown model type: {0}")]
    UnknownModel(String),

    #[error("{what} mismatch: expected {expected}, found {found}")]
    DimensionMismatch { what: &'static str, expected: usize, found: usize },

    #[error("cannot compare models of different kinds ({0} and {1})")]
    ModelMismatch(&'static str, &'static str),

    #[error("invalid gradients: {0}")]
    InvalidGradients(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("singular system: {0}")]
    SingularSystem(&'static str),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse parameter file: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to write parameter file: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
