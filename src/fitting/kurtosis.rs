use crate::error::{ModelError, Result};
use crate::fitting::{log_signal, parse_schedule, weighted_refit, FitParams};
use crate::gradients::{Gradients, DELTA};
use crate::linalg::pseudo_inverse;
use crate::models::kurtosis::{design_row, normalize_kurtosis, Kurtosis, KurtosisDirections, KurtosisSynth, DK_DIM, KURTOSIS_DIM};
use crate::models::tensor::{Tensor, FREE_DIFF};
use crate::models::utils::{baseline_stats, cost, CostType};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use tracing::debug;

/// log-linear least squares kurtosis fit on baseline-normalized data
#[derive(Debug, Clone)]
pub struct KurtosisFit {
    gradients: Gradients,
    design: DMatrix<f64>,
    pinv: DMatrix<f64>,
    rhs: DVector<f64>,
    weighted: bool,
    dirs: Arc<KurtosisDirections>,
}

impl KurtosisFit {
    pub fn new(gradients: &Gradients, params: &FitParams) -> Result<Self> {
        Self::with_directions(gradients, params, Arc::new(KurtosisDirections::default()))
    }

    /// share one direction set between the fitters of every worker
    pub fn with_directions(gradients: &Gradients, params: &FitParams, dirs: Arc<KurtosisDirections>) -> Result<Self> {
        if gradients.num_dvecs() < DK_DIM || gradients.shells(false).len() < 2 {
            return Err(ModelError::InvalidGradients(format!(
                "kurtosis fitting needs two or more shells with {DK_DIM} or more measurements"
            )));
        }
        let mut design = DMatrix::zeros(gradients.size(), DK_DIM);
        for (i, (g, &b)) in gradients.bvecs().iter().zip(gradients.bvals()).enumerate() {
            for (j, v) in design_row(b, g).into_iter().enumerate() {
                design[(i, j)] = v;
            }
        }
        let pinv = pseudo_inverse(&design)?;
        Ok(Self { gradients: gradients.clone(), rhs: DVector::zeros(gradients.size()), design, pinv, weighted: params.weighted, dirs })
    }

    pub fn fit(&mut self, signal: &[f64]) -> Kurtosis {
        let s0 = baseline_stats(&self.gradients, signal).mean;
        let scale = 1.0 / s0.max(DELTA);
        self.rhs.iter_mut().zip(signal).for_each(|(r, &s)| *r = log_signal(s * scale));

        let mut x = &self.pinv * &self.rhs;
        if self.weighted {
            match weighted_refit(&self.design, &self.rhs, &x) {
                Ok(refit) => x = refit,
                Err(e) => debug!("weighted kurtosis refit failed: {e}"),
            }
        }

        let mut dt = [0.0; DK_DIM];
        dt.iter_mut().zip(x.iter()).for_each(|(d, v)| *d = *v);
        normalize_kurtosis(&mut dt);

        let mut model = Kurtosis::new(s0, dt);
        model.update_features(&self.dirs);
        model
    }
}

impl VectFunction for KurtosisFit {
    fn dim_in(&self) -> usize {
        self.gradients.size()
    }

    fn dim_out(&self) -> usize {
        KURTOSIS_DIM
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.fit(input).encode_into(output);
    }
}

/// two-compartment kurtosis fit: a coarse-to-fine search over the free-water fraction, fitting
/// the tissue compartment of the water-corrected signal at each candidate
#[derive(Debug, Clone)]
pub struct KurtosisFreeWaterFit {
    fitter: KurtosisFit,
    synth: KurtosisSynth,
    schedule: Vec<usize>,
    scale: f64,
    cost: CostType,
    prior: f64,
    expiso: Vec<f64>,
    corrected: Vec<f64>,
}

impl KurtosisFreeWaterFit {
    pub fn new(gradients: &Gradients, params: &FitParams) -> Result<Self> {
        Self::with_directions(gradients, params, Arc::new(KurtosisDirections::default()))
    }

    pub fn with_directions(gradients: &Gradients, params: &FitParams, dirs: Arc<KurtosisDirections>) -> Result<Self> {
        if !(0.0..1.0).contains(&params.free_water_prior) {
            return Err(ModelError::InvalidParameter(format!("free water prior must be in [0, 1): {}", params.free_water_prior)));
        }
        Ok(Self {
            fitter: KurtosisFit::with_directions(gradients, params, dirs)?,
            synth: KurtosisSynth::new(gradients),
            schedule: parse_schedule(&params.free_water_schedule)?,
            scale: params.free_water_scale,
            cost: params.free_water_cost,
            prior: params.free_water_prior,
            expiso: gradients.bvals().iter().map(|b| (-b * FREE_DIFF).exp()).collect(),
            corrected: vec![0.0; gradients.size()],
        })
    }

    pub fn fit(&mut self, signal: &[f64]) -> Kurtosis {
        let s0 = baseline_stats(&self.fitter.gradients, signal).mean;

        let mut low = 0.0;
        let mut high = 1.0;
        let mut best: Option<(f64, Kurtosis)> = None;

        for &num in &self.schedule {
            for i in 0..num {
                let frac = low + (high - low) * i as f64 / (num - 1) as f64;
                let invfrac = 1.0 - frac;
                if invfrac < DELTA {
                    continue;
                }

                for ((c, &s), iso) in self.corrected.iter_mut().zip(signal).zip(&self.expiso) {
                    *c = (s - s0 * frac * iso) / invfrac;
                }
                let mut model = self.fitter.fit(&self.corrected);
                model.fw = frac;

                let pred = self.synth.eval(&model.encode());
                let c = cost(self.cost, &self.fitter.gradients, signal, &pred);
                if best.as_ref().map_or(true, |(bc, _)| c < *bc) {
                    best = Some((c, model));
                }
            }

            let Some((_, model)) = &best else { break };
            let delta = self.scale / (num - 1) as f64 * (high - low);
            let f = model.fw;
            low = (f - delta).max(low).clamp(0.0, 1.0);
            high = (f + delta).min(high).clamp(0.0, 1.0);
        }

        let Some((_, mut model)) = best else {
            return Kurtosis::new(s0, [0.0; DK_DIM]);
        };
        self.shrink(&mut model);
        model
    }

    /// shrink the tissue tensor toward its isotropic part as the free-water fraction passes the
    /// prior, reaching full isotropy at a fraction of one
    fn shrink(&self, model: &mut Kurtosis) {
        if model.fw <= self.prior {
            return;
        }
        let lin = (model.fw - self.prior) / (1.0 - self.prior);
        let mix = lin * lin;
        let mut tensor = Tensor::new(model.b0, &model.tensor_d(), model.fw);
        let mean = tensor.vals.iter().sum::<f64>() / 3.0;
        tensor.vals.iter_mut().for_each(|v| *v = (1.0 - mix) * *v + mix * mean);
        model.set_tensor_d(&tensor.matrix());
        model.update_features(&self.fitter.dirs);
    }
}

impl VectFunction for KurtosisFreeWaterFit {
    fn dim_in(&self) -> usize {
        self.fitter.gradients.size()
    }

    fn dim_out(&self) -> usize {
        KURTOSIS_DIM
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.fit(input).encode_into(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_shells(n: usize) -> Gradients {
        shells(&[1000.0, 2000.0], n)
    }

    fn shells(bs: &[f64], n: usize) -> Gradients {
        let mut bvecs = vec![[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let mut bvals = vec![0.0, 0.0];
        let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
        for &b in bs {
            for i in 0..n {
                let z = 1.0 - (i as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).sqrt();
                let t = golden * i as f64 + b / 1000.0;
                bvecs.push([r * t.cos(), r * t.sin(), z]);
                bvals.push(b);
            }
        }
        Gradients::new(bvecs, bvals).unwrap()
    }

    /// isotropic diffusion of 1e-3 with an isotropic kurtosis tensor of kurtosis 0.9
    fn isotropic_model() -> Kurtosis {
        let mut dt = [0.0; DK_DIM];
        dt[0] = 1e-3;
        dt[3] = 1e-3;
        dt[5] = 1e-3;
        dt[6] = 0.9;
        dt[9] = 0.3;
        dt[11] = 0.3;
        dt[16] = 0.9;
        dt[18] = 0.3;
        dt[20] = 0.9;
        Kurtosis::new(100.0, dt)
    }

    #[test]
    fn recovers_isotropic_kurtosis() {
        let g = two_shells(30);
        let truth = isotropic_model();
        let signal = KurtosisSynth::new(&g).eval(&truth.encode());
        let fit = KurtosisFit::new(&g, &FitParams::default()).unwrap().fit(&signal);
        assert_abs_diff_eq!(fit.b0, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.md, 1e-3, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.fa, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.mk, 0.9, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.rk, 0.9, epsilon = 1e-4);
    }

    #[test]
    fn needs_two_shells() {
        let g = Gradients::with_bval(vec![[1.0, 0.0, 0.0]; 30], 1000.0).unwrap();
        assert!(KurtosisFit::new(&g, &FitParams::default()).is_err());
    }

    #[test]
    fn free_water_search_finds_fraction() {
        // a third shell makes the water fraction separable from the kurtosis term
        let g = shells(&[1000.0, 2000.0, 3000.0], 30);
        let mut truth = isotropic_model();
        truth.fw = 0.3;
        let signal = KurtosisSynth::new(&g).eval(&truth.encode());
        let params = FitParams { free_water_schedule: "11,11,11".to_string(), ..FitParams::default() };
        let fit = KurtosisFreeWaterFit::new(&g, &params).unwrap().fit(&signal);
        assert_abs_diff_eq!(fit.fw, 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.md, 1e-3, epsilon = 1e-8);
    }

    #[test]
    fn prior_shrinks_toward_isotropy() {
        let g = two_shells(30);
        let params = FitParams::default();
        let fitter = KurtosisFreeWaterFit::new(&g, &params).unwrap();
        let mut dt = [0.0; DK_DIM];
        dt[0] = 2e-3;
        dt[3] = 0.5e-3;
        dt[5] = 0.5e-3;
        let mut model = Kurtosis::new(1.0, dt);
        model.fw = 1.0;
        fitter.shrink(&mut model);
        let d = model.tensor_d();
        assert_abs_diff_eq!(d[(0, 0)], 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(d[(1, 1)], 1e-3, epsilon = 1e-12);

        let mut model = Kurtosis::new(1.0, dt);
        model.fw = 0.4;
        fitter.shrink(&mut model);
        assert_eq!(model.tensor_d()[(0, 0)], 2e-3);
    }
}
