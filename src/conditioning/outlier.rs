use crate::conditioning::gp::{fit_signal, gp_point, GpKernel};
use crate::gradients::{Gradients, DELTA};
use crate::models::utils::baseline_stats;
use crate::volume_function::VectFunction;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierParams {
    /// relative prediction error above which a measurement is an outlier
    pub outlier: f64,
    /// fraction of all measurements that must be inliers for replacement to happen
    pub include: f64,
    pub lambda_detect: f64,
    pub lambda_predict: f64,
    /// replace every diffusion-weighted value instead of only the outliers
    pub resample: bool,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self { outlier: 0.35, include: 0.75, lambda_detect: 1.0, lambda_predict: 1.0, resample: false, alpha: 1.0, beta: 1.0 }
    }
}

impl OutlierParams {
    pub fn kernel(&self) -> GpKernel {
        GpKernel { alpha: self.alpha, beta: self.beta }
    }
}

/// two-pass outlier replacement: a smooth process over every diffusion-weighted measurement
/// flags values it predicts poorly, and a second process fit to the inliers alone predicts
/// replacements. Baselines are replaced by their mean
#[derive(Debug, Clone)]
pub struct OutlierGp {
    gradients: Gradients,
    params: OutlierParams,
    inliers: Vec<bool>,
}

impl OutlierGp {
    pub fn new(gradients: &Gradients, params: &OutlierParams) -> Self {
        Self { gradients: gradients.clone(), params: params.clone(), inliers: vec![false; gradients.num_dvecs()] }
    }

    /// flags the diffusion-weighted measurements that agree with the smooth fit, returning the
    /// number of inliers
    fn detect(&mut self, input: &[f64], baseline: f64) -> usize {
        let which = self.gradients.dvec_idx();
        let gp = match fit_signal(self.params.kernel(), &self.gradients, which, input, baseline, self.params.lambda_detect) {
            Ok(gp) => gp,
            Err(e) => {
                debug!("outlier detection fit failed: {e}");
                self.inliers.fill(false);
                return 0;
            }
        };

        for (flag, &idx) in self.inliers.iter_mut().zip(which) {
            let value = if baseline.abs() < DELTA { 0.0 } else { input[idx] / baseline };
            let pred = gp.predict(&gp_point(&self.gradients, idx));
            let change = if value.abs() < DELTA { 1.0 } else { (pred - value).abs() / value };
            *flag = change < self.params.outlier;
        }
        self.inliers.iter().filter(|&&f| f).count()
    }
}

impl VectFunction for OutlierGp {
    fn dim_in(&self) -> usize {
        self.gradients.size()
    }

    fn dim_out(&self) -> usize {
        self.gradients.size()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let baseline = baseline_stats(&self.gradients, input).mean;
        for &idx in self.gradients.baseline_idx() {
            output[idx] = baseline;
        }

        let which = self.gradients.dvec_idx().to_vec();
        let num_inliers = self.detect(input, baseline);
        let passthrough = |output: &mut [f64]| which.iter().for_each(|&idx| output[idx] = input[idx]);

        if num_inliers as f64 <= self.params.include * self.gradients.size() as f64 {
            passthrough(output);
            return;
        }

        let inlier_idx: Vec<usize> = which.iter().zip(&self.inliers).filter(|(_, &f)| f).map(|(&i, _)| i).collect();
        let gp = match fit_signal(self.params.kernel(), &self.gradients, &inlier_idx, input, baseline, self.params.lambda_predict) {
            Ok(gp) => gp,
            Err(e) => {
                debug!("outlier prediction fit failed: {e}");
                passthrough(output);
                return;
            }
        };

        for (&idx, &inlier) in which.iter().zip(&self.inliers) {
            output[idx] = if inlier && !self.params.resample {
                input[idx]
            } else {
                baseline * gp.predict(&gp_point(&self.gradients, idx))
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn scheme(n: usize) -> Gradients {
        let mut bvecs = vec![[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let mut bvals = vec![0.0, 0.0];
        let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
        for i in 0..n {
            let z = 1.0 - (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let t = golden * i as f64;
            bvecs.push([r * t.cos(), r * t.sin(), z]);
            bvals.push(1000.0);
        }
        Gradients::new(bvecs, bvals).unwrap()
    }

    #[test]
    fn replaces_a_spike() {
        let g = scheme(40);
        let mut input = vec![0.4; g.size()];
        input[0] = 1.1;
        input[1] = 0.9;
        input[10] = 2.0;
        let params = OutlierParams { lambda_predict: 0.01, ..OutlierParams::default() };
        let out = OutlierGp::new(&g, &params).eval(&input);
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 1.0, epsilon = 1e-12);
        assert!((out[10] - 0.4).abs() < 0.2, "spike replaced by {}", out[10]);
        // inliers pass through untouched
        assert_eq!(out[5], 0.4);
    }

    #[test]
    fn resample_predicts_every_measurement() {
        let g = scheme(40);
        let mut input = vec![0.4; g.size()];
        input[0] = 1.1;
        input[1] = 0.9;
        input[10] = 2.0;
        let keep = OutlierParams { lambda_predict: 0.01, ..OutlierParams::default() };
        let resample = OutlierParams { resample: true, ..keep.clone() };
        let kept = OutlierGp::new(&g, &keep).eval(&input);
        let out = OutlierGp::new(&g, &resample).eval(&input);

        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 1.0, epsilon = 1e-12);
        // the outlier gets the same prediction either way
        assert_eq!(out[10], kept[10]);
        for i in 2..g.size() {
            assert!((out[i] - 0.4).abs() < 0.2, "measurement {i} predicted as {}", out[i]);
        }
        assert!((2..g.size()).filter(|&i| i != 10).any(|i| out[i] != input[i]));
    }

    #[test]
    fn too_few_inliers_passes_through() {
        let g = scheme(10);
        let input: Vec<f64> = (0..g.size()).map(|i| if i < 2 { 1.0 } else { 0.05 + 0.3 * (i % 3) as f64 }).collect();
        let params = OutlierParams { include: 0.99, ..OutlierParams::default() };
        let out = OutlierGp::new(&g, &params).eval(&input);
        for i in 2..g.size() {
            assert_eq!(out[i], input[i]);
        }
    }
}
