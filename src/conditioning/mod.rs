// Cleaning and resampling of raw diffusion-weighted signals before model fitting

pub mod drift;
pub mod features;
pub mod gp;
pub mod normalize;
pub mod outlier;
pub mod spherical;

pub use drift::{correct_drift, DriftCorrection, DriftMethod, DriftParams};
pub use features::{DwiFeature, DwiFeatureFunction};
pub use gp::{GaussianProcess, GpKernel, ResampleGp, ResampleGpParams};
pub use normalize::{normalize, Normalize, NormalizeParams};
pub use outlier::{OutlierGp, OutlierParams};
pub use spherical::{SphericalFilter, SphericalParams, SphericalResample};
