use crate::error::{ModelError, Result};
use crate::fitting::{log_signal, weighted_refit, FitParams};
use crate::gradients::{Gradients, DELTA};
use crate::linalg::{pseudo_inverse, symmetric3};
use crate::models::tensor::{design_row, Tensor, DT_DIM};
use crate::models::utils::baseline_stats;
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// below this the fitted -ln(S0) is not trusted and the largest measurement is used instead
const MIN_NEG_LOG_S0: f64 = -23.0;

/// log-linear least squares tensor fit. In baseline mode the signal is normalized by the mean
/// baseline and six coefficients are fit; otherwise a seventh column recovers -ln(S0)
#[derive(Debug, Clone)]
pub struct TensorFit {
    gradients: Gradients,
    design: DMatrix<f64>,
    pinv: DMatrix<f64>,
    rhs: DVector<f64>,
    baseline: bool,
    weighted: bool,
    clamp: Option<f64>,
}

/// writes the design matrix rows, one per measurement, with columns for the six unique tensor
/// entries (xx xy yy xz yz zz) and optionally a constant column for the log baseline
fn build_design_matrix(gradients: &Gradients, with_baseline: bool) -> DMatrix<f64> {
    let cols = if with_baseline { 7 } else { 6 };
    let mut a = DMatrix::zeros(gradients.size(), cols);
    for (i, (g, &b)) in gradients.bvecs().iter().zip(gradients.bvals()).enumerate() {
        for (j, v) in design_row(b, g).into_iter().enumerate() {
            a[(i, j)] = v;
        }
        if with_baseline {
            a[(i, 6)] = -1.0;
        }
    }
    a
}

impl TensorFit {
    pub fn new(gradients: &Gradients, params: &FitParams) -> Result<Self> {
        let design = build_design_matrix(gradients, !params.baseline);
        if gradients.num_dvecs() < 6 {
            return Err(ModelError::InvalidGradients(format!(
                "tensor fitting needs six or more diffusion-weighted measurements, found {}",
                gradients.num_dvecs()
            )));
        }
        if !params.baseline && gradients.size() < 7 {
            return Err(ModelError::InvalidGradients("tensor fitting with a baseline needs seven or more measurements".to_string()));
        }
        let pinv = pseudo_inverse(&design)?;
        Ok(Self {
            gradients: gradients.clone(),
            rhs: DVector::zeros(gradients.size()),
            design,
            pinv,
            baseline: params.baseline,
            weighted: params.weighted,
            clamp: params.clamp,
        })
    }

    pub fn fit(&mut self, signal: &[f64]) -> Tensor {
        let s0 = baseline_stats(&self.gradients, signal).mean;
        let scale = if self.baseline { 1.0 / s0.max(DELTA) } else { 1.0 };
        self.rhs.iter_mut().zip(signal).for_each(|(r, &s)| *r = log_signal(s * scale));

        let mut x = &self.pinv * &self.rhs;
        if self.weighted {
            match weighted_refit(&self.design, &self.rhs, &x) {
                Ok(refit) => x = refit,
                Err(e) => debug!("weighted tensor refit failed: {e}"),
            }
        }

        let s0 = if self.baseline {
            s0
        } else if x[6] > MIN_NEG_LOG_S0 {
            (-x[6]).exp()
        } else {
            signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        };

        // coefficients arrive as xx xy yy xz yz zz
        let matrix = symmetric3(x[0], x[1], x[3], x[2], x[4], x[5]);
        let mut tensor = Tensor::new(s0, &matrix, 0.0);
        if let Some(min) = self.clamp {
            tensor.clamp(min);
        }
        tensor
    }
}

impl VectFunction for TensorFit {
    fn dim_in(&self) -> usize {
        self.gradients.size()
    }

    fn dim_out(&self) -> usize {
        DT_DIM
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.fit(input).encode_into(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tensor::TensorSynth;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix3, Rotation3, Vector3};

    fn six_directions() -> Gradients {
        Gradients::new(
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 1.0, 0.0],
                [1.0, 0.0, 1.0],
                [0.0, 1.0, 1.0],
            ],
            vec![0.0, 1000.0, 1000.0, 1000.0, 1000.0, 1000.0, 1000.0],
        )
        .unwrap()
    }

    fn rotated_tensor() -> Tensor {
        let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.4) * Rotation3::from_axis_angle(&Vector3::x_axis(), 0.3);
        let diag = Matrix3::from_diagonal(&Vector3::new(1.7e-3, 0.4e-3, 0.3e-3));
        let m = rot.matrix() * diag * rot.matrix().transpose();
        Tensor::new(250.0, &m, 0.0)
    }

    #[test]
    fn isotropic_scenario() {
        let g = six_directions();
        let model = Tensor::diagonal(1.0, [1e-3; 3]);
        let signal = TensorSynth::new(&g).eval(&model.encode());
        for s in &signal[1..] {
            assert_abs_diff_eq!(*s, (-1.0f64).exp(), epsilon = 1e-12);
        }
        let fit = TensorFit::new(&g, &FitParams::default()).unwrap().fit(&signal);
        assert_abs_diff_eq!(fit.s0, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.md(), 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.fa(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn recovers_anisotropic_tensor() {
        let g = six_directions();
        let truth = rotated_tensor();
        let signal = TensorSynth::new(&g).eval(&truth.encode());
        for params in [
            FitParams::default(),
            FitParams { baseline: true, ..FitParams::default() },
            FitParams { weighted: true, ..FitParams::default() },
        ] {
            let mut fitter = TensorFit::new(&g, &params).unwrap();
            let out = fitter.eval(&signal);
            let fit = Tensor::decode(&out).unwrap();
            assert_abs_diff_eq!(fit.s0, 250.0, epsilon = 1e-6);
            assert_abs_diff_eq!(fit.md(), truth.md(), epsilon = 1e-10);
            assert_abs_diff_eq!(fit.fa(), truth.fa(), epsilon = 1e-6);
            assert!(fit.distance(&truth) < 1e-9);
        }
    }

    #[test]
    fn clamps_eigenvalues() {
        let g = six_directions();
        let truth = Tensor::diagonal(1.0, [1.5e-3, 1e-4, 1e-4]);
        let signal = TensorSynth::new(&g).eval(&truth.encode());
        let params = FitParams { clamp: Some(2e-4), ..FitParams::default() };
        let fit = TensorFit::new(&g, &params).unwrap().fit(&signal);
        assert_abs_diff_eq!(fit.vals[0], 1.5e-3, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.vals[2], 2e-4, epsilon = 1e-12);
    }

    #[test]
    fn too_few_directions() {
        let g = Gradients::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]], vec![0.0, 1000.0]).unwrap();
        assert!(TensorFit::new(&g, &FitParams::default()).is_err());
    }
}
