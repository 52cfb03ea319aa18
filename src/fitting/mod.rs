// Log-linear least squares fitting of the tensor, kurtosis and exponential decay models

use crate::error::{ModelError, Result};
use crate::linalg::least_squares;
use crate::models::utils::CostType;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub mod exp_decay;
pub mod kurtosis;
pub mod tensor;

pub use exp_decay::ExpDecayFit;
pub use kurtosis::{KurtosisFit, KurtosisFreeWaterFit};
pub use tensor::TensorFit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// refit with weights from the first prediction
    pub weighted: bool,
    /// normalize by the mean baseline instead of fitting it
    pub baseline: bool,
    /// lower bound on fitted eigenvalues
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clamp: Option<f64>,
    /// grid sizes of the successive free-water searches
    pub free_water_schedule: String,
    /// how far around the best fraction each refinement searches, in grid steps
    pub free_water_scale: f64,
    pub free_water_cost: CostType,
    /// free-water fraction above which the tissue tensor is shrunk toward isotropy
    pub free_water_prior: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            weighted: false,
            baseline: false,
            clamp: None,
            free_water_schedule: "10,10,10".to_string(),
            free_water_scale: 1.0,
            free_water_cost: CostType::Se,
            free_water_prior: 0.5,
        }
    }
}

/// parse a comma separated list of grid sizes, each with at least two points
pub fn parse_schedule(text: &str) -> Result<Vec<usize>> {
    let schedule = text
        .split(',')
        .map(|t| {
            t.trim()
                .parse::<usize>()
                .map_err(|e| ModelError::InvalidParameter(format!("invalid schedule entry \"{t}\": {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if schedule.is_empty() || schedule.iter().any(|&n| n < 2) {
        return Err(ModelError::InvalidParameter(format!("every schedule level needs two or more samples: {text}")));
    }
    Ok(schedule)
}

/// log of a signal value, with non-positive values contributing zero
pub(crate) fn log_signal(s: f64) -> f64 {
    if s > 0.0 {
        s.ln()
    } else {
        0.0
    }
}

/// refit A x = y with each row weighted by the signal predicted by a first solution
pub(crate) fn weighted_refit(design: &DMatrix<f64>, rhs: &DVector<f64>, first: &DVector<f64>) -> Result<DVector<f64>> {
    let weights = (design * first).map(f64::exp);
    let mut wa = design.clone();
    for (mut row, w) in wa.row_iter_mut().zip(weights.iter()) {
        row *= *w;
    }
    let wy = rhs.component_mul(&weights);
    least_squares(&wa, &wy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parsing() {
        assert_eq!(parse_schedule("10,10,10").unwrap(), vec![10, 10, 10]);
        assert_eq!(parse_schedule(" 5, 3").unwrap(), vec![5, 3]);
        assert!(parse_schedule("10,1").is_err());
        assert!(parse_schedule("ten").is_err());
    }

    #[test]
    fn log_signal_skips_non_positive() {
        assert_eq!(log_signal(0.0), 0.0);
        assert_eq!(log_signal(-2.0), 0.0);
        assert_eq!(log_signal(1.0), 0.0);
        assert!((log_signal(std::f64::consts::E) - 1.0).abs() < 1e-15);
    }
}
