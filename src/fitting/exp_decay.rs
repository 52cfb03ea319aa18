use crate::error::{ModelError, Result};
use crate::linalg::least_squares;
use crate::models::exp_decay::ExpDecay;
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// log-linear fit of alpha * exp(-beta * x) over fixed sample positions. Non-positive samples
/// are left out of the fit
#[derive(Debug, Clone)]
pub struct ExpDecayFit {
    varying: Vec<f64>,
    weighted: bool,
    min_alpha: f64,
    min_beta: f64,
}

impl ExpDecayFit {
    pub fn new(varying: &[f64], weighted: bool) -> Result<Self> {
        if varying.len() < 2 {
            return Err(ModelError::InvalidParameter("exponential decay fitting needs two or more samples".to_string()));
        }
        Ok(Self { varying: varying.to_vec(), weighted, min_alpha: 0.0, min_beta: 0.0 })
    }

    /// evenly spaced sample positions, e.g. echo times
    pub fn linspace(start: f64, step: f64, num: usize, weighted: bool) -> Result<Self> {
        let varying: Vec<f64> = (0..num).map(|i| start + step * i as f64).collect();
        Self::new(&varying, weighted)
    }

    pub fn with_mins(mut self, min_alpha: f64, min_beta: f64) -> Self {
        self.min_alpha = min_alpha;
        self.min_beta = min_beta;
        self
    }

    fn solve(&self, signal: &[f64], weights: Option<&[f64]>) -> Result<DVector<f64>> {
        let n = self.varying.len();
        let mut a = DMatrix::zeros(n, 2);
        let mut y = DVector::zeros(n);
        for (i, (&x, &s)) in self.varying.iter().zip(signal).enumerate() {
            if s <= 0.0 {
                continue;
            }
            let w = weights.map_or(1.0, |w| w[i]);
            a[(i, 0)] = w;
            a[(i, 1)] = -w * x;
            y[i] = w * s.ln();
        }
        least_squares(&a, &y)
    }

    pub fn fit(&self, signal: &[f64]) -> ExpDecay {
        let mut x = match self.solve(signal, None) {
            Ok(x) => x,
            Err(e) => {
                debug!("exponential decay fit failed: {e}");
                return ExpDecay::new(self.min_alpha, self.min_beta);
            }
        };

        if self.weighted {
            let weights: Vec<f64> = self.varying.iter().map(|v| (x[0] - x[1] * v).exp()).collect();
            match self.solve(signal, Some(&weights)) {
                Ok(refit) => x = refit,
                Err(e) => debug!("weighted exponential decay refit failed: {e}"),
            }
        }

        ExpDecay::new(x[0].exp().max(self.min_alpha), x[1].max(self.min_beta))
    }
}

impl VectFunction for ExpDecayFit {
    fn dim_in(&self) -> usize {
        self.varying.len()
    }

    fn dim_out(&self) -> usize {
        2
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.fit(input).encode_into(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exp_decay::ExpDecaySynth;
    use approx::assert_abs_diff_eq;

    #[test]
    fn recovers_decay() {
        let x = [10.0, 20.0, 30.0, 40.0, 50.0];
        let signal = ExpDecaySynth::new(&x).eval(&[500.0, 0.02]);
        for weighted in [false, true] {
            let fit = ExpDecayFit::new(&x, weighted).unwrap().fit(&signal);
            assert_abs_diff_eq!(fit.alpha, 500.0, epsilon = 1e-8);
            assert_abs_diff_eq!(fit.beta, 0.02, epsilon = 1e-12);
        }
    }

    #[test]
    fn skips_non_positive_samples() {
        let mut fitter = ExpDecayFit::linspace(1.0, 1.0, 4, false).unwrap();
        let out = fitter.eval(&[(-0.5f64).exp() * 2.0, 0.0, (-1.5f64).exp() * 2.0, -1.0]);
        assert_abs_diff_eq!(out[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn rising_signal_is_bounded() {
        let fit = ExpDecayFit::new(&[0.0, 1.0], false).unwrap().with_mins(0.0, 0.0).fit(&[1.0, 2.0]);
        assert_eq!(fit.beta, 0.0);
        assert!(ExpDecayFit::new(&[1.0], false).is_err());
    }
}
