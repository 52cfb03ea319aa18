use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use crate::models::utils::Stats;
use crate::volume_function::VectFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// per-voxel summaries of a diffusion-weighted signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DwiFeature {
    Attenuation,
    AnisoCoeffVar,
    AnisoStd,
    AnisoMu,
    SphericalMean,
    SphericalMeanNorm,
    SphericalMeanADC,
    SphericalStd,
    NoiseStd,
    NoiseCoeffVar,
}

impl DwiFeature {
    pub const ALL: [DwiFeature; 10] = [
        DwiFeature::Attenuation,
        DwiFeature::AnisoCoeffVar,
        DwiFeature::AnisoStd,
        DwiFeature::AnisoMu,
        DwiFeature::SphericalMean,
        DwiFeature::SphericalMeanNorm,
        DwiFeature::SphericalMeanADC,
        DwiFeature::SphericalStd,
        DwiFeature::NoiseStd,
        DwiFeature::NoiseCoeffVar,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DwiFeature::Attenuation => "attenuation",
            DwiFeature::AnisoCoeffVar => "aniso_coeff_var",
            DwiFeature::AnisoStd => "aniso_std",
            DwiFeature::AnisoMu => "aniso_mu",
            DwiFeature::SphericalMean => "spherical_mean",
            DwiFeature::SphericalMeanNorm => "spherical_mean_norm",
            DwiFeature::SphericalMeanADC => "spherical_mean_adc",
            DwiFeature::SphericalStd => "spherical_std",
            DwiFeature::NoiseStd => "noise_std",
            DwiFeature::NoiseCoeffVar => "noise_coeff_var",
        }
    }
}

impl FromStr for DwiFeature {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.to_lowercase().replace('-', "_");
        DwiFeature::ALL
            .iter()
            .find(|f| f.name() == key || f.name().replace('_', "") == key)
            .copied()
            .ok_or_else(|| ModelError::UnknownFeature { model: "dwi", name: s.to_string() })
    }
}

impl fmt::Display for DwiFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn valid_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn sub(signal: &[f64], which: &[usize]) -> Stats {
    Stats::from_values(&which.iter().map(|&i| signal[i]).collect::<Vec<_>>())
}

/// computes one [DwiFeature] from each voxel's signal
#[derive(Debug, Clone)]
pub struct DwiFeatureFunction {
    feature: DwiFeature,
    gradients: Gradients,
    /// measurement indices of the diffusion-weighted shells
    shells: Vec<Vec<usize>>,
    /// measurement indices of every shell, the baseline shell first
    bshells: Vec<Vec<usize>>,
}

impl DwiFeatureFunction {
    pub fn new(feature: DwiFeature, gradients: &Gradients) -> Result<Self> {
        let shells: Vec<Vec<usize>> = gradients.shells(false).into_iter().map(|s| gradients.shell_idx(s)).collect();
        let bshells: Vec<Vec<usize>> = gradients.shells(true).into_iter().map(|s| gradients.shell_idx(s)).collect();
        if bshells.is_empty() || (feature == DwiFeature::SphericalMeanNorm && bshells.len() < 2) {
            return Err(ModelError::InvalidGradients(format!("too few shells for feature {feature}")));
        }
        Ok(Self { feature, gradients: gradients.clone(), shells, bshells })
    }

    /// mean over the diffusion-weighted shells of a per-shell statistic
    fn shell_average(&self, signal: &[f64], stat: impl Fn(&Stats) -> f64) -> f64 {
        if self.shells.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.shells.iter().map(|s| stat(&sub(signal, s))).sum();
        sum / self.shells.len() as f64
    }
}

impl VectFunction for DwiFeatureFunction {
    fn dim_in(&self) -> usize {
        self.gradients.size()
    }

    fn dim_out(&self) -> usize {
        match self.feature {
            DwiFeature::Attenuation => self.gradients.size(),
            DwiFeature::SphericalMean | DwiFeature::SphericalStd => self.bshells.len(),
            DwiFeature::SphericalMeanNorm => self.bshells.len() - 1,
            DwiFeature::SphericalMeanADC => self.shells.len(),
            _ => 1,
        }
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let g = &self.gradients;
        match self.feature {
            DwiFeature::Attenuation => {
                let base = g.zero(input);
                for (o, &x) in output.iter_mut().zip(input) {
                    *o = if base.abs() < DELTA { 0.0 } else { x / base };
                }
            }
            DwiFeature::AnisoCoeffVar => {
                let adc = g.adc(input);
                output[0] = self.shell_average(&adc, |s| valid_or_zero(s.std / s.mean));
            }
            DwiFeature::AnisoStd => {
                let adc = g.adc(input);
                output[0] = self.shell_average(&adc, |s| s.std);
            }
            DwiFeature::AnisoMu => {
                let norm = g.norm(input);
                output[0] = self.shell_average(&norm, |s| s.std);
            }
            DwiFeature::SphericalMean => {
                for (o, shell) in output.iter_mut().zip(&self.bshells) {
                    *o = valid_or_zero(sub(input, shell).mean);
                }
            }
            DwiFeature::SphericalMeanNorm => {
                let base = sub(input, &self.bshells[0]).mean;
                for (o, shell) in output.iter_mut().zip(&self.bshells[1..]) {
                    *o = if base.abs() < DELTA { 0.0 } else { valid_or_zero(sub(input, shell).mean / base) };
                }
            }
            DwiFeature::SphericalMeanADC => {
                let adc = g.adc(input);
                for (o, shell) in output.iter_mut().zip(&self.shells) {
                    *o = valid_or_zero(sub(&adc, shell).mean);
                }
            }
            DwiFeature::SphericalStd => {
                for (o, shell) in output.iter_mut().zip(&self.bshells) {
                    *o = valid_or_zero(sub(input, shell).std);
                }
            }
            DwiFeature::NoiseStd => {
                output[0] = Stats::from_values(&g.zeros(input)).std;
            }
            DwiFeature::NoiseCoeffVar => {
                let stats = Stats::from_values(&g.zeros(input));
                output[0] = stats.std / (stats.mean + DELTA);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_shells() -> Gradients {
        Gradients::new(
            vec![
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            vec![0.0, 0.0, 1000.0, 1000.0, 2000.0, 2000.0],
        )
        .unwrap()
    }

    fn eval(feature: DwiFeature, input: &[f64]) -> Vec<f64> {
        DwiFeatureFunction::new(feature, &two_shells()).unwrap().eval(input)
    }

    #[test]
    fn spherical_means() {
        let input = [90.0, 110.0, 60.0, 40.0, 30.0, 10.0];
        assert_eq!(eval(DwiFeature::SphericalMean, &input), vec![100.0, 50.0, 20.0]);
        let norm = eval(DwiFeature::SphericalMeanNorm, &input);
        assert_abs_diff_eq!(norm[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(norm[1], 0.2, epsilon = 1e-12);
        assert_eq!(eval(DwiFeature::SphericalStd, &input), vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn isotropic_signal_has_no_anisotropy() {
        let e1 = (-1.0f64).exp();
        let e2 = (-2.0f64).exp();
        let input = [1.0, 1.0, e1, e1, e2, e2];
        assert_abs_diff_eq!(eval(DwiFeature::AnisoStd, &input)[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eval(DwiFeature::AnisoCoeffVar, &input)[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eval(DwiFeature::AnisoMu, &input)[0], 0.0, epsilon = 1e-12);
        let adc = eval(DwiFeature::SphericalMeanADC, &input);
        assert_eq!(adc.len(), 2);
        assert_abs_diff_eq!(adc[0], 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(adc[1], 1e-3, epsilon = 1e-12);
    }

    #[test]
    fn noise_and_attenuation() {
        let input = [90.0, 110.0, 50.0, 50.0, 20.0, 20.0];
        assert_eq!(eval(DwiFeature::NoiseStd, &input), vec![10.0]);
        assert_abs_diff_eq!(eval(DwiFeature::NoiseCoeffVar, &input)[0], 0.1, epsilon = 1e-8);
        let att = eval(DwiFeature::Attenuation, &input);
        assert_abs_diff_eq!(att[2], 0.5, epsilon = 1e-12);
        assert_eq!(eval(DwiFeature::Attenuation, &[0.0; 6]), vec![0.0; 6]);
    }

    #[test]
    fn feature_names_parse() {
        for f in DwiFeature::ALL {
            assert_eq!(f.name().parse::<DwiFeature>().unwrap(), f);
        }
        assert_eq!("SphericalMeanADC".parse::<DwiFeature>().unwrap(), DwiFeature::SphericalMeanADC);
        assert!("nonsense".parse::<DwiFeature>().is_err());
    }
}
