use crate::error::{ModelError, Result};
use crate::gradients::{cross, dot, normalize_or_zero, Gradients, DELTA};
use crate::linalg::perp;
use crate::models::SignalModel;
use crate::sphere::Mesh;
use crate::volume_function::VectFunction;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

pub const NODDI_BASE: usize = 0;
pub const NODDI_FICVF: usize = 1;
pub const NODDI_FISO: usize = 2;
pub const NODDI_KAPPA: usize = 3;
pub const NODDI_DIR: usize = 4;
pub const NODDI_IRFRAC: usize = 7;
pub const NODDI_DIM: usize = 8;

const TORT_STEPS: usize = 100;
const TORT_SAMPLES: usize = 1000;

/// diffusivities of the tissue compartments and the integration mesh detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoddiParams {
    pub parallel: f64,
    pub isotropic: f64,
    pub subdiv: usize,
}

impl Default for NoddiParams {
    fn default() -> Self {
        Self::in_vivo()
    }
}

impl NoddiParams {
    pub fn in_vivo() -> Self {
        Self { parallel: 1.7e-3, isotropic: 3.0e-3, subdiv: 2 }
    }

    pub fn ex_vivo() -> Self {
        Self { parallel: 0.6e-3, isotropic: 1.0e-3, subdiv: 2 }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.parallel > 0.0 && self.isotropic > 0.0) {
            return Err(ModelError::InvalidParameter(format!(
                "noddi diffusivities must be positive (parallel {}, isotropic {})",
                self.parallel, self.isotropic
            )));
        }
        if self.subdiv > 5 {
            return Err(ModelError::InvalidParameter(format!("noddi mesh subdivision {} is too fine", self.subdiv)));
        }
        Ok(())
    }
}

feature_enum!(NoddiFeature, "noddi", {
    Baseline => "baseline",
    Ficvf => "ficvf",
    Fecvf => "fecvf",
    Fiso => "fiso",
    Odi => "odi",
    Dir => "dir",
    Kappa => "kappa",
    Tort => "tort",
    Ead => "ead",
    Erd => "erd",
    Irfrac => "irfrac",
    DirX => "fibredirs_xvec",
    DirY => "fibredirs_yvec",
    DirZ => "fibredirs_zvec",
});

/// orientation dispersion index of a Watson concentration
pub fn kappa_to_odi(kappa: f64) -> f64 {
    2.0 / PI * 1.0f64.atan2(kappa.abs())
}

/// Watson concentration of an orientation dispersion index, with zero dispersion mapping to
/// the largest finite value
pub fn odi_to_kappa(odi: f64) -> f64 {
    if odi == 0.0 {
        return f64::MAX;
    }
    let kappa = 1.0 / (PI * odi.abs() / 2.0).tan();
    if kappa.is_finite() {
        kappa
    } else {
        f64::MAX
    }
}

/// the mean squared cosine between the Watson axis and a sampled direction, integrated with
/// the trapezoid rule over the cosine
pub fn kappa_to_tortuosity(kappa: f64) -> f64 {
    let d = 1.0 / (2.0 * TORT_STEPS as f64);
    // the exponent is shifted by its maximum so large concentrations do not overflow
    let shift = kappa.max(0.0);
    let mut num = 0.0;
    let mut denom = 0.0;
    for i in 0..=TORT_STEPS {
        let factor = if i == 0 || i == TORT_STEPS { d } else { 2.0 * d };
        let u = i as f64 / TORT_STEPS as f64;
        let u2 = u * u;
        let e = (kappa * u2 - shift).exp();
        num += u2 * factor * e;
        denom += factor * e;
    }

    let tort = num / denom;
    if denom.abs() < f64::MIN_POSITIVE || tort.is_nan() {
        1.0
    } else {
        tort
    }
}

/// the Watson scatter matrix of a concentration and axis. With `log` the eigenvalues are
/// replaced by their logarithm
pub fn kappa_to_scatter(kappa: f64, dir: &[f64; 3], log: bool) -> Matrix3<f64> {
    let l1 = kappa_to_tortuosity(kappa);
    let l2 = (1.0 - l1) / 2.0;
    let (l1, l2) = if log { ((l1 + DELTA).ln(), (l2 + DELTA).ln()) } else { (l1, l2) };

    let v1 = normalize_or_zero(dir);
    let v2 = perp(&v1);
    let v3 = cross(&v1, &v2);
    let outer = |v: &[f64; 3]| {
        let v = Vector3::from(*v);
        v * v.transpose()
    };
    outer(&v1) * l1 + outer(&v2) * l2 + outer(&v3) * l2
}

/// tortuosity sampled on a regular dispersion grid, linearly interpolated between samples
#[derive(Debug, Clone)]
pub struct TortuosityTable {
    samples: Vec<f64>,
}

impl Default for TortuosityTable {
    fn default() -> Self {
        Self::new(TORT_SAMPLES)
    }
}

impl TortuosityTable {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let samples = (0..size)
            .map(|i| kappa_to_tortuosity(odi_to_kappa(i as f64 / (size - 1) as f64)))
            .collect();
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn odi_to_tortuosity(&self, odi: f64) -> f64 {
        let last = self.samples.len() - 1;
        let fidx = odi.clamp(0.0, 1.0) * last as f64;
        let low = (fidx.floor() as usize).min(last - 1);
        let frac = fidx - low as f64;
        self.samples[low] * (1.0 - frac) + self.samples[low + 1] * frac
    }

    pub fn kappa_to_tortuosity(&self, kappa: f64) -> f64 {
        self.odi_to_tortuosity(kappa_to_odi(kappa))
    }
}

/// neurite orientation dispersion and density: an intra-cellular Watson-dispersed stick
/// compartment, a tortuous extra-cellular compartment, free water and a non-decaying dot
#[derive(Debug, Clone, PartialEq)]
pub struct Noddi {
    pub base: f64,
    pub ficvf: f64,
    pub fiso: f64,
    pub kappa: f64,
    pub dir: [f64; 3],
    pub irfrac: f64,
    /// parallel diffusivity for the extra-cellular features, not part of the encoding
    pub parallel: f64,
}

impl Default for Noddi {
    fn default() -> Self {
        Self {
            base: 0.0,
            ficvf: 0.0,
            fiso: 1.0,
            kappa: 1.0,
            dir: [1.0, 0.0, 0.0],
            irfrac: 0.0,
            parallel: NoddiParams::default().parallel,
        }
    }
}

impl Noddi {
    pub fn with_params(mut self, params: &NoddiParams) -> Self {
        self.parallel = params.parallel;
        self
    }

    pub fn baseline(&self) -> f64 {
        self.base
    }

    pub fn fecvf(&self) -> f64 {
        1.0 - self.ficvf
    }

    pub fn odi(&self) -> f64 {
        kappa_to_odi(self.kappa)
    }

    pub fn set_odi(&mut self, odi: f64) {
        self.kappa = odi_to_kappa(odi);
    }

    pub fn tortuosity(&self) -> f64 {
        kappa_to_tortuosity(self.kappa)
    }

    /// extra-cellular axial diffusivity
    pub fn ead(&self) -> f64 {
        self.parallel * (1.0 - self.ficvf * (1.0 - self.tortuosity()))
    }

    /// extra-cellular radial diffusivity
    pub fn erd(&self) -> f64 {
        self.parallel * (1.0 - self.ficvf * (1.0 + self.tortuosity()) / 2.0)
    }

    pub fn scatter(&self, log: bool) -> Matrix3<f64> {
        let kappa = if self.kappa.is_infinite() { f64::MAX } else { self.kappa };
        kappa_to_scatter(kappa, &self.dir, log)
    }
}

impl SignalModel for Noddi {
    const NAME: &'static str = "noddi";
    type Feature = NoddiFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        if encoding.len() != NODDI_DIM {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() });
        }
        let dir = [encoding[NODDI_DIR], encoding[NODDI_DIR + 1], encoding[NODDI_DIR + 2]];
        Ok(Self {
            base: encoding[NODDI_BASE],
            ficvf: encoding[NODDI_FICVF],
            fiso: encoding[NODDI_FISO],
            kappa: encoding[NODDI_KAPPA],
            dir: normalize_or_zero(&dir),
            irfrac: encoding[NODDI_IRFRAC],
            ..Self::default()
        })
    }

    fn encoding_size(&self) -> usize {
        NODDI_DIM
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[NODDI_BASE] = self.base;
        encoding[NODDI_FICVF] = self.ficvf;
        encoding[NODDI_FISO] = self.fiso;
        encoding[NODDI_KAPPA] = self.kappa;
        encoding[NODDI_DIR..NODDI_DIR + 3].copy_from_slice(&self.dir);
        encoding[NODDI_IRFRAC] = self.irfrac;
    }

    fn features(&self) -> Vec<NoddiFeature> {
        NoddiFeature::ALL.to_vec()
    }

    fn feature(&self, feature: NoddiFeature) -> Vec<f64> {
        match feature {
            NoddiFeature::Baseline => vec![self.base],
            NoddiFeature::Ficvf => vec![self.ficvf],
            NoddiFeature::Fecvf => vec![self.fecvf()],
            NoddiFeature::Fiso => vec![self.fiso],
            NoddiFeature::Odi => vec![self.odi()],
            NoddiFeature::Dir => self.dir.to_vec(),
            NoddiFeature::Kappa => vec![self.kappa],
            NoddiFeature::Tort => vec![self.tortuosity()],
            NoddiFeature::Ead => vec![self.ead()],
            NoddiFeature::Erd => vec![self.erd()],
            NoddiFeature::Irfrac => vec![self.irfrac],
            NoddiFeature::DirX => vec![self.dir[0]],
            NoddiFeature::DirY => vec![self.dir[1]],
            NoddiFeature::DirZ => vec![self.dir[2]],
        }
    }

    /// volume fraction differences combined with the difference of the scatter matrices
    fn distance(&self, other: &Self) -> f64 {
        let dfiso = self.fiso - other.fiso;
        let dficvf = self.ficvf - other.ficvf;
        let dscatter = (self.scatter(false) - other.scatter(false)).norm_squared();
        (dfiso * dfiso + dficvf * dficvf + dscatter).sqrt()
    }
}

/// forward model integrating the dispersed stick response over a sphere mesh. The per-gradient
/// stick responses and the mesh areas are computed once and shared by every evaluation
#[derive(Debug, Clone)]
pub struct NoddiSynth {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    samples: Vec<[f64; 3]>,
    areas: Vec<f64>,
    // stick response of each gradient (rows) to each mesh direction (columns)
    basis: Vec<f64>,
    params: NoddiParams,
    table: Arc<TortuosityTable>,
    prob: Vec<f64>,
}

impl NoddiSynth {
    pub fn new(gradients: &Gradients, params: &NoddiParams) -> Result<Self> {
        Self::with_table(gradients, params, Arc::new(TortuosityTable::default()))
    }

    pub fn with_table(gradients: &Gradients, params: &NoddiParams, table: Arc<TortuosityTable>) -> Result<Self> {
        params.validate()?;
        let mesh = Mesh::icosphere(params.subdiv + 1);
        let areas = mesh.vertex_areas();
        let samples: Vec<[f64; 3]> = mesh.vertices.iter().map(normalize_or_zero).collect();

        let mut basis = Vec::with_capacity(gradients.size() * samples.len());
        for (q, &b) in gradients.bvecs().iter().zip(gradients.bvals()) {
            for n in &samples {
                let qn = dot(q, n);
                basis.push((-b * params.parallel * qn * qn).exp());
            }
        }

        let prob = vec![0.0; samples.len()];
        Ok(Self {
            bvals: gradients.bvals().to_vec(),
            bvecs: gradients.bvecs().to_vec(),
            samples,
            areas,
            basis,
            params: params.clone(),
            table,
            prob,
        })
    }

    /// area-weighted Watson density over the mesh, normalized to unit sum
    fn update_prob(&mut self, kappa: f64, dir: &[f64; 3]) {
        let kappa = if kappa.is_infinite() { f64::MAX } else { kappa };
        let shift = self
            .samples
            .iter()
            .map(|n| kappa * dot(dir, n).powi(2))
            .fold(f64::NEG_INFINITY, f64::max);

        let mut sum = 0.0;
        for ((p, n), area) in self.prob.iter_mut().zip(&self.samples).zip(&self.areas) {
            *p = area * (kappa * dot(dir, n).powi(2) - shift).exp();
            sum += *p;
        }
        if sum > 0.0 {
            self.prob.iter_mut().for_each(|p| *p /= sum);
        }
    }
}

impl VectFunction for NoddiSynth {
    fn dim_in(&self) -> usize {
        NODDI_DIM
    }

    fn dim_out(&self) -> usize {
        self.bvals.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let base = input[NODDI_BASE];
        if base.abs() < DELTA {
            output.fill(0.0);
            return;
        }

        let ficvf = input[NODDI_FICVF];
        let fiso = input[NODDI_FISO];
        let kappa = input[NODDI_KAPPA];
        let irfrac = input[NODDI_IRFRAC];
        let dir = normalize_or_zero(&[input[NODDI_DIR], input[NODDI_DIR + 1], input[NODDI_DIR + 2]]);

        let fic = (1.0 - fiso) * ficvf;
        let fec = (1.0 - fiso) * (1.0 - ficvf);

        let tort = self.table.kappa_to_tortuosity(kappa);
        let ead = self.params.parallel * (1.0 - ficvf * (1.0 - tort));
        let erd = self.params.parallel * (1.0 - ficvf * (1.0 + tort) / 2.0);
        let mu = Vector3::from(dir);
        let eicten = mu * mu.transpose() * (ead - erd) + Matrix3::identity() * erd;

        self.update_prob(kappa, &dir);
        let nsamp = self.samples.len();

        for (i, out) in output.iter_mut().enumerate() {
            let b = self.bvals[i];
            let q = Vector3::from(self.bvecs[i]);

            let row = &self.basis[i * nsamp..(i + 1) * nsamp];
            let aic = row.iter().zip(&self.prob).map(|(r, p)| r * p).sum::<f64>();
            let aic = if aic.is_nan() { 0.0 } else { aic };
            let aec = (-b * q.dot(&(eicten * q))).exp();
            let aiso = (-b * self.params.isotropic).exp();

            *out = base * (aic * fic + aec * fec + aiso * fiso + irfrac);
        }
    }
}
