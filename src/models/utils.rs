//! Goodness-of-fit costs and noise statistics shared by the fitters and conditioning modules

use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// mean of a Rician variable relative to its underlying Gaussian sigma
pub const RICIAN_MEAN: f64 = 0.797_884_560_802_865_4;
/// sqrt(2 / (4 - pi)), relating baseline spread to the Rician sigma
pub const RICIAN_STD: f64 = 1.526_399_745_532_848_2;
/// the smallest noise level relative to the baseline mean
pub const MIN_SNR: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostType {
    Se,
    Mse,
    Rmse,
    Nrmse,
    Chisq,
    Rll,
    Mad,
    Nmad,
}

impl FromStr for CostType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "se" => Ok(CostType::Se),
            "mse" => Ok(CostType::Mse),
            "rmse" => Ok(CostType::Rmse),
            "nrmse" => Ok(CostType::Nrmse),
            "chisq" => Ok(CostType::Chisq),
            "rll" => Ok(CostType::Rll),
            "mad" => Ok(CostType::Mad),
            "nmad" => Ok(CostType::Nmad),
            _ => Err(ModelError::InvalidParameter(format!("unknown cost: {s}"))),
        }
    }
}

impl fmt::Display for CostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CostType::Se => "se",
            CostType::Mse => "mse",
            CostType::Rmse => "rmse",
            CostType::Nrmse => "nrmse",
            CostType::Chisq => "chisq",
            CostType::Rll => "rll",
            CostType::Mad => "mad",
            CostType::Nmad => "nmad",
        };
        f.write_str(name)
    }
}

/// summary statistics of a set of values, with the population deviation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl Stats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            median: median(values),
        }
    }
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn baseline_stats(gradients: &Gradients, signal: &[f64]) -> Stats {
    Stats::from_values(&gradients.zeros(signal))
}

pub fn estimate_sigma_gaussian(gradients: &Gradients, signal: &[f64]) -> f64 {
    baseline_stats(gradients, signal).std
}

pub fn estimate_sigma_rician(gradients: &Gradients, signal: &[f64]) -> f64 {
    let stats = baseline_stats(gradients, signal);
    let sigma = if stats.std < MIN_SNR * stats.mean { MIN_SNR } else { stats.std };
    RICIAN_STD * sigma
}

fn residuals<'a>(meas: &'a [f64], pred: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
    assert_eq!(meas.len(), pred.len(), "measurement and prediction sizes differ");
    meas.iter().zip(pred).map(|(m, p)| m - p)
}

pub fn se(meas: &[f64], pred: &[f64]) -> f64 {
    residuals(meas, pred).map(|d| d * d).sum()
}

pub fn mse(meas: &[f64], pred: &[f64]) -> f64 {
    se(meas, pred) / meas.len() as f64
}

/// the residual norm divided by the number of measurements
pub fn rmse(meas: &[f64], pred: &[f64]) -> f64 {
    se(meas, pred).sqrt() / meas.len() as f64
}

pub fn nrmse(gradients: &Gradients, meas: &[f64], pred: &[f64]) -> f64 {
    let baseline = baseline_stats(gradients, meas).mean;
    let baseline = if baseline.abs() < DELTA { 1.0 } else { baseline };
    rmse(meas, pred) / baseline
}

/// median absolute deviation of the residuals
pub fn mad(meas: &[f64], pred: &[f64]) -> f64 {
    median(&residuals(meas, pred).map(f64::abs).collect::<Vec<_>>())
}

pub fn nmad(gradients: &Gradients, meas: &[f64], pred: &[f64]) -> f64 {
    let baseline = baseline_stats(gradients, meas).median;
    let baseline = if baseline.abs() < DELTA { 1.0 } else { baseline };
    mad(meas, pred) / baseline
}

pub fn chisq(meas: &[f64], pred: &[f64], sigma: f64) -> f64 {
    se(meas, pred) / (sigma * sigma)
}

/// chi-square with the prediction offset by the Rician noise floor
pub fn rchisq(meas: &[f64], pred: &[f64], sigma: f64) -> f64 {
    let s2 = sigma * sigma;
    meas.iter().zip(pred).map(|(m, p)| (m - (p * p + s2).sqrt()).powi(2)).sum::<f64>() / s2
}

/// negative Rician log likelihood under the Gaussian approximation of the noise floor
pub fn rll(meas: &[f64], pred: &[f64], sigma: f64) -> f64 {
    let s2 = sigma * sigma;
    let n = meas.len() as f64;
    let sum: f64 = meas.iter().zip(pred).map(|(m, p)| (m - (p * p + s2).sqrt()).powi(2)).sum();
    sum / (2.0 * s2) - n * (sigma * (2.0 * PI).sqrt()).ln()
}

pub fn cost(kind: CostType, gradients: &Gradients, meas: &[f64], pred: &[f64]) -> f64 {
    match kind {
        CostType::Se => se(meas, pred),
        CostType::Mse => mse(meas, pred),
        CostType::Rmse => rmse(meas, pred),
        CostType::Nrmse => nrmse(gradients, meas, pred),
        CostType::Chisq => chisq(meas, pred, estimate_sigma_gaussian(gradients, meas)),
        CostType::Rll => rll(meas, pred, estimate_sigma_rician(gradients, meas)),
        CostType::Mad => mad(meas, pred),
        CostType::Nmad => nmad(gradients, meas, pred),
    }
}

/// signal to noise ratio in decibels
pub fn snr_db(s0: f64, sigma: f64) -> Result<f64> {
    if !(s0 > 0.0 && sigma > 0.0) {
        return Err(ModelError::InvalidParameter(format!("snr needs positive signal and noise ({s0}, {sigma})")));
    }
    Ok(20.0 * (s0 / sigma).log10())
}

/// noise deviation giving the requested signal to noise ratio in decibels
pub fn std_for_snr(s0: f64, snr_db: f64) -> Result<f64> {
    if !(s0 > 0.0) {
        return Err(ModelError::InvalidParameter(format!("snr needs a positive signal ({s0})")));
    }
    Ok(s0 / (snr_db * 10.0f64.ln() / 20.0).exp())
}
