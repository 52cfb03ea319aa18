// Signal drift correction
//
// scanner drift shows up as a slow change of intensity with acquisition order, so every
// strategy fits a low-order polynomial in the measurement index and divides it out

use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use crate::linalg::{least_squares, poly};
use crate::models::utils::Stats;
use crate::volume::{Mask, Volume};
use crate::volume_function::{ClosureFunction, VectFunction, VolumeFunction};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// drift strategies, declared in the order they are applied when chained
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftMethod {
    /// one correction curve from the population baselines, applied to every voxel
    Global,
    /// a per-voxel fit to the voxel's own baselines
    Local,
    /// a per-voxel fit to the diffusion-weighted measurements
    Iso,
    /// per-voxel baseline and diffusion-weighted fits blended by intensity
    Blend,
}

impl FromStr for DriftMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "global" => Ok(DriftMethod::Global),
            "local" => Ok(DriftMethod::Local),
            "iso" => Ok(DriftMethod::Iso),
            "blend" => Ok(DriftMethod::Blend),
            _ => Err(ModelError::InvalidParameter(format!("unknown drift method: {s}"))),
        }
    }
}

impl fmt::Display for DriftMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriftMethod::Global => "global",
            DriftMethod::Local => "local",
            DriftMethod::Iso => "iso",
            DriftMethod::Blend => "blend",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftParams {
    /// strategies to apply. They always run as global, local, iso then blend, each on the
    /// output of the previous one
    pub methods: Vec<DriftMethod>,
    /// polynomial order of the drift model
    pub order: usize,
}

impl Default for DriftParams {
    fn default() -> Self {
        Self { methods: vec![DriftMethod::Global], order: 2 }
    }
}

impl DriftParams {
    /// the enabled strategies in application order, without repeats
    pub fn chain(&self) -> Vec<DriftMethod> {
        let mut methods = self.methods.clone();
        methods.sort();
        methods.dedup();
        methods
    }
}

/// a polynomial in the measurement index, fit to a subset of measurements
#[derive(Debug, Clone)]
struct IndexPoly {
    which: Vec<usize>,
    design: DMatrix<f64>,
    order: usize,
}

impl IndexPoly {
    fn new(which: &[usize], order: usize) -> Self {
        let design = DMatrix::from_fn(which.len(), order + 1, |i, j| poly(which[i] as f64, order)[j]);
        Self { which: which.to_vec(), design, order }
    }

    fn fit(&self, values: &[f64]) -> Result<DVector<f64>> {
        let rhs = DVector::from_iterator(self.which.len(), self.which.iter().map(|&i| values[i]));
        least_squares(&self.design, &rhs)
    }

    fn fit_samples(&self, samples: &[f64]) -> Result<DVector<f64>> {
        let rhs = DVector::from_column_slice(samples);
        least_squares(&self.design, &rhs)
    }

    fn eval(&self, coeffs: &DVector<f64>, idx: usize) -> f64 {
        poly(idx as f64, self.order).iter().zip(coeffs.iter()).map(|(p, c)| p * c).sum()
    }

    fn mean(&self, values: &[f64]) -> f64 {
        if self.which.is_empty() {
            return 0.0;
        }
        self.which.iter().map(|&i| values[i]).sum::<f64>() / self.which.len() as f64
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den.abs() < DELTA {
        0.0
    } else {
        num / den
    }
}

/// per-voxel drift correction for the local, iso and blend strategies
#[derive(Debug, Clone)]
pub struct DriftCorrection {
    method: DriftMethod,
    size: usize,
    baselines: IndexPoly,
    dvecs: IndexPoly,
}

impl DriftCorrection {
    pub fn new(gradients: &Gradients, method: DriftMethod, order: usize) -> Result<Self> {
        if method == DriftMethod::Global {
            return Err(ModelError::InvalidParameter("global drift is not a per-voxel correction".to_string()));
        }
        let need_baselines = matches!(method, DriftMethod::Local | DriftMethod::Blend);
        let need_dvecs = matches!(method, DriftMethod::Iso | DriftMethod::Blend);
        if need_baselines && gradients.num_baselines() <= order {
            return Err(ModelError::InvalidParameter(format!(
                "{method} drift of order {order} needs more than {} baselines",
                gradients.num_baselines()
            )));
        }
        if need_dvecs && gradients.num_dvecs() <= order {
            return Err(ModelError::InvalidParameter(format!(
                "{method} drift of order {order} needs more diffusion-weighted measurements"
            )));
        }

        Ok(Self {
            method,
            size: gradients.size(),
            baselines: IndexPoly::new(gradients.baseline_idx(), order),
            dvecs: IndexPoly::new(gradients.dvec_idx(), order),
        })
    }

    /// rescale each measurement so the fitted trend becomes flat at the subset mean. A vanishing
    /// trend zeroes the measurement
    fn correct(model: &IndexPoly, input: &[f64], output: &mut [f64]) -> Result<()> {
        let coeffs = model.fit(input)?;
        let mean = model.mean(input);
        for (i, (o, &x)) in output.iter_mut().zip(input).enumerate() {
            let pred = model.eval(&coeffs, i);
            *o = ratio(mean * x, pred);
        }
        Ok(())
    }

    fn blend(&self, input: &[f64], output: &mut [f64]) -> Result<()> {
        let bcoeffs = self.baselines.fit(input)?;
        let dcoeffs = self.dvecs.fit(input)?;
        let bmean = self.baselines.mean(input);
        let dmean = self.dvecs.mean(input);

        for (i, (o, &x)) in output.iter_mut().zip(input).enumerate() {
            let bpred = self.baselines.eval(&bcoeffs, i);
            let dpred = self.dvecs.eval(&dcoeffs, i);
            let bcorr = ratio(bmean * x, bpred);
            let dcorr = ratio(dmean * x, dpred);
            let w = ((x - dmean + DELTA) / (bmean - dmean + DELTA)).clamp(0.0, 1.0);
            *o = w * bcorr + (1.0 - w) * dcorr;
        }
        Ok(())
    }
}

impl VectFunction for DriftCorrection {
    fn dim_in(&self) -> usize {
        self.size
    }

    fn dim_out(&self) -> usize {
        self.size
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let result = match self.method {
            DriftMethod::Local => Self::correct(&self.baselines, input, output),
            DriftMethod::Iso => Self::correct(&self.dvecs, input, output),
            DriftMethod::Blend => self.blend(input, output),
            DriftMethod::Global => {
                output.copy_from_slice(input);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("drift fit failed: {e}");
            output.copy_from_slice(input);
        }
    }
}

/// the per-measurement scale factors of the global strategy. The curve is fit to the mean of
/// each baseline over the voxels whose baseline mean is strictly within two standard deviations
/// of the volume mean, and the scales restore the mean over all masked voxels
pub fn global_scales(vol: &Volume, mask: Option<&Mask>, gradients: &Gradients, order: usize) -> Result<Vec<f64>> {
    if vol.channels() != gradients.size() {
        return Err(ModelError::DimensionMismatch { what: "channel count", expected: gradients.size(), found: vol.channels() });
    }
    vol.check_mask(mask)?;
    if gradients.num_baselines() < 2 {
        return Err(ModelError::InvalidParameter("global drift correction needs more than one baseline".to_string()));
    }

    let baselines = gradients.baseline_idx();
    let voxels: Vec<usize> = (0..vol.size()).filter(|&i| vol.valid(i, mask)).collect();
    let voxel_mean = |idx: usize| baselines.iter().map(|&b| vol.value(idx, b)).sum::<f64>() / baselines.len() as f64;

    let means: Vec<f64> = voxels.iter().map(|&i| voxel_mean(i)).collect();
    let stats = Stats::from_values(&means);
    let typical: Vec<usize> = voxels
        .iter()
        .zip(&means)
        .filter(|(_, &m)| (m - stats.mean).abs() < 2.0 * stats.std)
        .map(|(&i, _)| i)
        .collect();
    if typical.is_empty() {
        return Err(ModelError::InvalidParameter("no voxels available for global drift estimation".to_string()));
    }
    info!("estimating drift from {} of {} voxels", typical.len(), voxels.len());

    let samples: Vec<f64> = baselines
        .iter()
        .map(|&b| typical.iter().map(|&i| vol.value(i, b)).sum::<f64>() / typical.len() as f64)
        .collect();
    let model = IndexPoly::new(baselines, order);
    let coeffs = model.fit_samples(&samples)?;
    info!("drift model coefficients: {:?}", coeffs.as_slice());

    let scales: Vec<f64> = (0..gradients.size()).map(|i| ratio(stats.mean, model.eval(&coeffs, i))).collect();
    for (i, s) in scales.iter().enumerate() {
        info!("... scale {i}: {s:.6}");
    }
    Ok(scales)
}

fn apply_method(
    vol: &Volume,
    mask: Option<&Mask>,
    gradients: &Gradients,
    method: DriftMethod,
    order: usize,
    threads: usize,
) -> Result<Volume> {
    info!("correcting {method} drift of order {order}");
    match method {
        DriftMethod::Global => {
            let scales = global_scales(vol, mask, gradients, order)?;
            let size = scales.len();
            let scales = &scales;
            let factory = move || {
                ClosureFunction::new(size, size, move |input: &[f64], output: &mut [f64]| {
                    output.iter_mut().zip(input).zip(scales).for_each(|((o, x), s)| *o = x * s);
                })
            };
            VolumeFunction::new(factory, vol).with_mask(mask).with_threads(threads).run()
        }
        _ => {
            let correction = DriftCorrection::new(gradients, method, order)?;
            VolumeFunction::new(|| correction.clone(), vol).with_mask(mask).with_threads(threads).run()
        }
    }
}

/// correct drift over a volume, chaining the enabled strategies
pub fn correct_drift(
    vol: &Volume,
    mask: Option<&Mask>,
    gradients: &Gradients,
    params: &DriftParams,
    threads: usize,
) -> Result<Volume> {
    let chain = params.chain();
    if chain.is_empty() {
        info!("no drift correction enabled");
        return Ok(vol.clone());
    }
    let mut out = apply_method(vol, mask, gradients, chain[0], params.order, threads)?;
    for &method in &chain[1..] {
        out = apply_method(&out, mask, gradients, method, params.order, threads)?;
    }
    Ok(out)
}
