// Diffusion MRI signal models: parametric encodings, forward synthesis, per-voxel fitting and
// signal conditioning over volumes

pub mod error;
pub mod gradients;
pub mod linalg;
pub mod logging;
pub mod sphere;
pub mod volume;
pub mod volume_function;

pub mod models;
pub mod conditioning;
pub mod config;
pub mod fitting;

pub use config::Params;
pub use error::{ModelError, Result};
pub use gradients::Gradients;
pub use models::{Model, ModelFeature, ModelType, SignalModel, SynthParams};
pub use volume::{Mask, Volume};
pub use volume_function::{VectFunction, VolumeFunction};
