use crate::error::{ModelError, Result};
use crate::gradients::{dot, Gradients, DELTA};
use crate::models::utils::baseline_stats;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// a measurement location: the gradient direction and its b-value
pub type GpPoint = [f64; 4];

pub fn gp_point(gradients: &Gradients, idx: usize) -> GpPoint {
    let v = gradients.bvec(idx);
    [v[0], v[1], v[2], gradients.bval(idx)]
}

/// product of an angular kernel between antipodally symmetric directions and a kernel on
/// log b-values. A zero length scale disables the corresponding factor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpKernel {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for GpKernel {
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0 }
    }
}

impl GpKernel {
    pub fn eval(&self, a: &GpPoint, b: &GpPoint) -> f64 {
        let cos = dot(&[a[0], a[1], a[2]], &[b[0], b[1], b[2]]).abs().clamp(0.0, 1.0);
        let dvec = cos.acos();
        let dval = ((a[3] + DELTA).ln() - (b[3] + DELTA).ln()).abs();

        let cvec = if self.alpha.abs() < DELTA { 1.0 } else { (-dvec / self.alpha).exp() };
        let cval = if self.beta.abs() < DELTA { 1.0 } else { (-dval / self.beta).exp() };
        let k = cvec * cval;
        debug_assert!(!k.is_nan(), "invalid kernel value");
        k
    }
}

/// Gaussian process regression with a fixed kernel and noise level
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: GpKernel,
    points: Vec<GpPoint>,
    weights: DVector<f64>,
}

impl GaussianProcess {
    /// solves (K + lambda I) w = y for the prediction weights
    pub fn fit(kernel: GpKernel, points: Vec<GpPoint>, values: &[f64], lambda: f64) -> Result<Self> {
        if points.len() != values.len() {
            return Err(ModelError::DimensionMismatch { what: "gp sample count", expected: points.len(), found: values.len() });
        }
        let n = points.len();
        let gram = DMatrix::from_fn(n, n, |i, j| kernel.eval(&points[i], &points[j]) + if i == j { lambda } else { 0.0 });
        let y = DVector::from_column_slice(values);

        let weights = match gram.clone().cholesky() {
            Some(chol) => chol.solve(&y),
            None => gram.lu().solve(&y).ok_or(ModelError::SingularSystem("gaussian process"))?,
        };
        Ok(Self { kernel, points, weights })
    }

    pub fn predict(&self, x: &GpPoint) -> f64 {
        self.points.iter().zip(self.weights.iter()).map(|(p, w)| self.kernel.eval(p, x) * w).sum()
    }
}

/// fit a process to the baseline-normalized diffusion-weighted values of a signal
pub(crate) fn fit_signal(
    kernel: GpKernel,
    gradients: &Gradients,
    which: &[usize],
    signal: &[f64],
    baseline: f64,
    lambda: f64,
) -> Result<GaussianProcess> {
    let points = which.iter().map(|&i| gp_point(gradients, i)).collect();
    let values: Vec<f64> = which
        .iter()
        .map(|&i| if baseline.abs() < DELTA { 0.0 } else { signal[i] / baseline })
        .collect();
    GaussianProcess::fit(kernel, points, &values, lambda)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleGpParams {
    pub lambda: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for ResampleGpParams {
    fn default() -> Self {
        Self { lambda: 0.1, alpha: 1.0, beta: 1.0 }
    }
}

impl ResampleGpParams {
    pub fn kernel(&self) -> GpKernel {
        GpKernel { alpha: self.alpha, beta: self.beta }
    }
}

/// predicts the signal of a reference scheme from a measured one. Reference baselines receive
/// the measured baseline mean
#[derive(Debug, Clone)]
pub struct ResampleGp {
    gradients: Gradients,
    reference: Gradients,
    params: ResampleGpParams,
}

impl ResampleGp {
    pub fn new(gradients: &Gradients, reference: &Gradients, params: &ResampleGpParams) -> Self {
        Self { gradients: gradients.clone(), reference: reference.clone(), params: params.clone() }
    }
}

impl VectFunction for ResampleGp {
    fn dim_in(&self) -> usize {
        self.gradients.size()
    }

    fn dim_out(&self) -> usize {
        self.reference.size()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let baseline = baseline_stats(&self.gradients, input).mean;
        for &idx in self.reference.baseline_idx() {
            output[idx] = baseline;
        }

        let gp = fit_signal(self.params.kernel(), &self.gradients, self.gradients.dvec_idx(), input, baseline, self.params.lambda);
        match gp {
            Ok(gp) => {
                for &idx in self.reference.dvec_idx() {
                    output[idx] = baseline * gp.predict(&gp_point(&self.reference, idx));
                }
            }
            Err(e) => {
                debug!("gaussian process fit failed: {e}");
                for &idx in self.reference.dvec_idx() {
                    output[idx] = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn shell(n: usize, b: f64) -> Gradients {
        let mut bvecs = vec![[0.0, 0.0, 0.0]];
        let mut bvals = vec![0.0];
        let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
        for i in 0..n {
            let z = 1.0 - (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let t = golden * i as f64;
            bvecs.push([r * t.cos(), r * t.sin(), z]);
            bvals.push(b);
        }
        Gradients::new(bvecs, bvals).unwrap()
    }

    #[test]
    fn kernel_is_antipodal() {
        let k = GpKernel::default();
        let a = [0.0, 0.0, 1.0, 1000.0];
        let b = [0.0, 0.0, -1.0, 1000.0];
        assert_abs_diff_eq!(k.eval(&a, &a), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k.eval(&a, &b), 1.0, epsilon = 1e-12);
        let c = [1.0, 0.0, 0.0, 1000.0];
        assert_abs_diff_eq!(k.eval(&a, &c), (-std::f64::consts::FRAC_PI_2).exp(), epsilon = 1e-12);
        let off = GpKernel { alpha: 0.0, beta: 0.0 };
        assert_eq!(off.eval(&a, &[1.0, 0.0, 0.0, 2000.0]), 1.0);
    }

    #[test]
    fn interpolates_with_small_noise() {
        let k = GpKernel::default();
        let points = vec![[1.0, 0.0, 0.0, 1000.0], [0.0, 1.0, 0.0, 1000.0], [0.0, 0.0, 1.0, 1000.0]];
        let values = [0.2, 0.5, 0.8];
        let gp = GaussianProcess::fit(k, points.clone(), &values, 1e-9).unwrap();
        for (p, v) in points.iter().zip(values) {
            assert_abs_diff_eq!(gp.predict(p), v, epsilon = 1e-6);
        }
        assert!(GaussianProcess::fit(k, points, &[1.0], 0.1).is_err());
    }

    #[test]
    fn resampling_keeps_constant_signal() {
        let g = shell(60, 1000.0);
        let r = shell(12, 1000.0);
        let mut input = vec![0.5; g.size()];
        input[0] = 1.0;
        let params = ResampleGpParams { lambda: 1e-6, ..ResampleGpParams::default() };
        let out = ResampleGp::new(&g, &r, &params).eval(&input);
        assert_eq!(out.len(), r.size());
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-12);
        for v in &out[1..] {
            assert_abs_diff_eq!(*v, 0.5, epsilon = 0.1);
        }
    }
}
