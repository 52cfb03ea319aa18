// Resampling of diffusion-weighted signals onto a new set of directions
//
// every filter is a (destination x source) weight matrix built once from the two direction
// sets. Baseline destinations average the baseline sources

use crate::error::{ModelError, Result};
use crate::gradients::{dot, norm, normalize_or_zero, Gradients, DELTA};
use crate::linalg::inverse;
use crate::sphere::triangulate;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SphericalFilter {
    /// barycentric weights on a triangulation of the source directions
    Linear,
    /// normalized kernel weights on the squared direction cosine
    Local,
    /// regularized radial basis interpolation
    Global,
}

impl FromStr for SphericalFilter {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(SphericalFilter::Linear),
            "local" => Ok(SphericalFilter::Local),
            "global" => Ok(SphericalFilter::Global),
            _ => Err(ModelError::InvalidParameter(format!("unknown spherical filter: {s}"))),
        }
    }
}

impl fmt::Display for SphericalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SphericalFilter::Linear => "linear",
            SphericalFilter::Local => "local",
            SphericalFilter::Global => "global",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphericalParams {
    pub filter: SphericalFilter,
    /// kernel concentration of the spline filters
    pub kappa: f64,
    /// regularization of the global filter
    pub lambda: f64,
    /// signal similarity scale of the adaptive mode
    pub sigma: f64,
    /// reweight the filter per voxel by the similarity of the measured values
    pub adaptive: bool,
}

impl Default for SphericalParams {
    fn default() -> Self {
        Self { filter: SphericalFilter::Linear, kappa: 5.0, lambda: 0.1, sigma: 20.0, adaptive: false }
    }
}

fn zero_source(source: &Gradients) -> Vec<bool> {
    (0..source.size()).map(|i| source.bval(i).abs() < DELTA || norm(&source.bvec(i)) < DELTA).collect()
}

fn zero_dest(dest: &[[f64; 3]]) -> Vec<bool> {
    dest.iter().map(|d| norm(d) < DELTA).collect()
}

fn normalize_rows(weights: &mut DMatrix<f64>, what: &str) -> Result<()> {
    for mut row in weights.row_iter_mut() {
        let sum = row.sum();
        if sum.abs() < DELTA || !sum.is_finite() {
            return Err(ModelError::InvalidParameter(format!("invalid {what} filter weights")));
        }
        row /= sum;
    }
    Ok(())
}

/// barycentric interpolation on the antipodally symmetric triangulation of the source
pub fn linear_filter(source: &Gradients, dest: &[[f64; 3]]) -> Result<DMatrix<f64>> {
    let nsource = source.size();
    let zsource = zero_source(source);
    let zdest = zero_dest(dest);

    let dirs: Vec<[f64; 3]> =
        (0..nsource).map(|i| if zsource[i] { [0.0; 3] } else { source.bvec(i) }).collect();
    let mesh = triangulate(&dirs)?;

    let mut weights = DMatrix::zeros(dest.len(), nsource);
    for (i, d) in dest.iter().enumerate() {
        if zdest[i] {
            for j in (0..nsource).filter(|&j| zsource[j]) {
                weights[(i, j)] = 1.0;
            }
            continue;
        }

        let bary = mesh
            .closest_face(&normalize_or_zero(d))
            .ok_or_else(|| ModelError::InvalidParameter("source directions have no triangulation".to_string()))?;
        let face = mesh.faces[bary.face];
        for (v, w) in face.iter().zip(bary.weights) {
            weights[(i, v % nsource)] += w;
        }
    }

    normalize_rows(&mut weights, "linear")?;
    Ok(weights)
}

/// kernel weights exp(kappa cos^2) between each destination and every source direction
pub fn local_filter(source: &Gradients, dest: &[[f64; 3]], kappa: f64) -> Result<DMatrix<f64>> {
    if kappa <= 0.0 {
        return Err(ModelError::InvalidParameter(format!("kappa must be positive ({kappa})")));
    }
    let zsource = zero_source(source);
    let zdest = zero_dest(dest);

    let mut weights = DMatrix::from_fn(dest.len(), source.size(), |i, j| match (zdest[i], zsource[j]) {
        (true, true) => 1.0,
        (false, false) => {
            let c = dot(&normalize_or_zero(&dest[i]), &source.bvec(j));
            (kappa * c * c).exp()
        }
        _ => 0.0,
    });

    if weights.iter().any(|w| !w.is_finite()) {
        return Err(ModelError::InvalidParameter(format!("kappa is too large ({kappa})")));
    }
    normalize_rows(&mut weights, "local")?;
    Ok(weights)
}

/// radial basis interpolation with centres at the destination directions and basis
/// exp(-kappa cos^2), fit to the source by ridge regression
pub fn global_filter(source: &Gradients, dest: &[[f64; 3]], kappa: f64, lambda: f64) -> Result<DMatrix<f64>> {
    if kappa <= 0.0 {
        return Err(ModelError::InvalidParameter(format!("kappa must be positive ({kappa})")));
    }
    let zsource = zero_source(source);
    let zdest = zero_dest(dest);
    let dsource: Vec<usize> = (0..source.size()).filter(|&i| !zsource[i]).collect();
    let ddest: Vec<usize> = (0..dest.len()).filter(|&i| !zdest[i]).collect();
    let nzsource = source.size() - dsource.len();

    let dirs: Vec<[f64; 3]> = dest.iter().map(normalize_or_zero).collect();
    let basis = |a: &[f64; 3], b: &[f64; 3]| {
        let c = dot(a, b);
        (-kappa * c * c).exp()
    };

    let b = DMatrix::from_fn(dsource.len(), ddest.len(), |i, j| basis(&source.bvec(dsource[i]), &dirs[ddest[j]]));
    let a = DMatrix::from_fn(ddest.len(), ddest.len(), |i, j| basis(&dirs[ddest[i]], &dirs[ddest[j]]));
    let bt = b.transpose();
    let n = ddest.len();
    let reg = &bt * &b + DMatrix::<f64>::identity(n, n) * lambda;
    let dfilter = a * inverse(&reg)? * bt;

    let mut weights = DMatrix::zeros(dest.len(), source.size());
    for i in (0..dest.len()).filter(|&i| zdest[i]) {
        for j in (0..source.size()).filter(|&j| zsource[j]) {
            weights[(i, j)] = 1.0 / nzsource as f64;
        }
    }
    for (i, &di) in ddest.iter().enumerate() {
        for (j, &sj) in dsource.iter().enumerate() {
            weights[(di, sj)] = dfilter[(i, j)];
        }
    }
    Ok(weights)
}

pub fn build_filter(source: &Gradients, dest: &[[f64; 3]], params: &SphericalParams) -> Result<DMatrix<f64>> {
    info!("building {} spherical filter for {} directions", params.filter, dest.len());
    match params.filter {
        SphericalFilter::Linear => linear_filter(source, dest),
        SphericalFilter::Local => local_filter(source, dest, params.kappa),
        SphericalFilter::Global => global_filter(source, dest, params.kappa, params.lambda),
    }
}

/// applies a precomputed filter to each voxel, optionally reweighted by the similarity of the
/// measured values
#[derive(Debug, Clone)]
pub struct SphericalResample {
    filter: DMatrix<f64>,
    adaptive: bool,
    sigma: f64,
}

impl SphericalResample {
    pub fn new(source: &Gradients, dest: &[[f64; 3]], params: &SphericalParams) -> Result<Self> {
        let filter = build_filter(source, dest, params)?;
        Ok(Self { filter, adaptive: params.adaptive, sigma: params.sigma })
    }

    pub fn filter(&self) -> &DMatrix<f64> {
        &self.filter
    }
}

impl VectFunction for SphericalResample {
    fn dim_in(&self) -> usize {
        self.filter.ncols()
    }

    fn dim_out(&self) -> usize {
        self.filter.nrows()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let signal = DVector::from_column_slice(input);
        let out = if self.adaptive {
            let s2 = self.sigma * self.sigma;
            let n = input.len();
            let kernel = DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    0.0
                } else {
                    let d = input[i] - input[j];
                    (-d * d / s2).exp()
                }
            });
            let mut afilter = &self.filter * kernel;
            for mut row in afilter.row_iter_mut() {
                let sum = row.sum();
                if sum.abs() > f64::MIN_POSITIVE {
                    row /= sum;
                }
            }
            afilter * signal
        } else {
            &self.filter * signal
        };
        output.copy_from_slice(out.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn octahedron() -> Gradients {
        Gradients::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]],
            vec![0.0, 1000.0, 1000.0, 1000.0, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn linear_filter_hits_source_directions() {
        let g = octahedron();
        let dest = [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]];
        let f = linear_filter(&g, &dest).unwrap();
        assert_abs_diff_eq!(f[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(f[(0, 4)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(f[(1, 2)], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(f[(2, 3)], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn linear_filter_interpolates_between() {
        let g = octahedron();
        let s = 1.0 / 3.0f64.sqrt();
        let f = linear_filter(&g, &[[s, s, s]]).unwrap();
        for j in 1..4 {
            assert_abs_diff_eq!(f[(0, j)], 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn local_filter_rows_sum_to_one() {
        let g = octahedron();
        let dest = [[1.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let f = local_filter(&g, &dest, 5.0).unwrap();
        for i in 0..f.nrows() {
            assert_abs_diff_eq!(f.row(i).sum(), 1.0, epsilon = 1e-12);
        }
        // symmetric about the destination
        assert_abs_diff_eq!(f[(0, 1)], f[(0, 2)], epsilon = 1e-12);
        assert!(f[(0, 1)] > f[(0, 3)]);
        assert!(local_filter(&g, &dest, 1e4).is_err());
        assert!(local_filter(&g, &dest, 0.0).is_err());
    }

    #[test]
    fn global_filter_fills_baselines() {
        let g = octahedron();
        let dest = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let f = global_filter(&g, &dest, 1.0, 0.1).unwrap();
        assert_eq!(f.shape(), (4, 5));
        assert_abs_diff_eq!(f[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(f[(0, 4)], 0.5, epsilon = 1e-12);
        assert_eq!(f[(1, 0)], 0.0);
        assert!(global_filter(&g, &dest, -1.0, 0.1).is_err());
    }

    #[test]
    fn adaptive_resampling_of_constant_signal() {
        let g = octahedron();
        let dest = [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let params = SphericalParams { adaptive: true, ..SphericalParams::default() };
        let mut f = SphericalResample::new(&g, &dest, &params).unwrap();
        let out = f.eval(&[2.0, 2.0, 2.0, 2.0, 2.0]);
        assert_abs_diff_eq!(out[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out[1], 2.0, epsilon = 1e-9);
    }
}
