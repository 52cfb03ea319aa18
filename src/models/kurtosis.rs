use crate::error::{ModelError, Result};
use crate::gradients::{dot, Gradients};
use crate::linalg::{orthonormal_frame, symmetric3};
use crate::models::tensor::{Tensor, FREE_DIFF};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::Matrix3;
use std::f64::consts::PI;

// how parameters are stored as vectors. The tensor coefficients start at offset one, after the
// baseline, and the cached features follow them
pub const DK_GXX: usize = 0;
pub const DK_GXY: usize = 1;
pub const DK_GXZ: usize = 2;
pub const DK_GYY: usize = 3;
pub const DK_GYZ: usize = 4;
pub const DK_GZZ: usize = 5;
pub const DK_GXXXX: usize = 6;
pub const DK_DIM: usize = 21;

const DK_B0: usize = 0;
const DK_FA: usize = 22;
const DK_MD: usize = 23;
const DK_AD: usize = 24;
const DK_RD: usize = 25;
const DK_FE: usize = 26;
const DK_MK: usize = 27;
const DK_AK: usize = 28;
const DK_RK: usize = 29;
const DK_AWF: usize = 30;
const DK_EAS: usize = 31;
const DK_IAS: usize = 32;
const DK_FW: usize = 33;
pub const KURTOSIS_DIM: usize = DK_DIM + 13;

/// directions sampled around the principal axis for the radial kurtosis
const RADIAL_SAMPLES: usize = 10;

const LOW_IDX: [[usize; 2]; 6] = [[0, 0], [0, 1], [0, 2], [1, 1], [1, 2], [2, 2]];
const LOW_CNT: [f64; 6] = [1.0, 2.0, 2.0, 1.0, 2.0, 1.0];

const HIGH_IDX: [[usize; 4]; 15] = [
    [0, 0, 0, 0],
    [0, 0, 0, 1],
    [0, 0, 0, 2],
    [0, 0, 1, 1],
    [0, 0, 1, 2],
    [0, 0, 2, 2],
    [0, 1, 1, 1],
    [0, 1, 1, 2],
    [0, 1, 2, 2],
    [0, 2, 2, 2],
    [1, 1, 1, 1],
    [1, 1, 1, 2],
    [1, 1, 2, 2],
    [1, 2, 2, 2],
    [2, 2, 2, 2],
];
const HIGH_CNT: [f64; 15] = [1.0, 4.0, 4.0, 6.0, 12.0, 6.0, 4.0, 12.0, 12.0, 4.0, 1.0, 4.0, 6.0, 4.0, 1.0];

/// one hemisphere of a near-uniform 256 direction set. The other half is the antipodes
const HEMI_DIRS: [[f64; 3]; 128] = [
    [0.0, 0.0, 1.0000],
    [0.5924, 0.0, 0.8056],
    [-0.7191, -0.1575, -0.6768],
    [-0.9151, -0.3479, 0.2040],
    [0.5535, 0.2437, 0.7964],
    [-0.0844, 0.9609, -0.2636],
    [0.9512, -0.3015, 0.0651],
    [-0.4225, 0.8984, 0.1202],
    [0.5916, -0.6396, 0.4909],
    [0.3172, 0.8818, -0.3489],
    [-0.1988, -0.6687, 0.7164],
    [-0.2735, 0.3047, -0.9123],
    [0.9714, -0.1171, 0.2066],
    [-0.5215, -0.4013, 0.7530],
    [-0.3978, -0.9131, -0.0897],
    [0.2680, 0.8196, 0.5063],
    [-0.6824, -0.6532, -0.3281],
    [0.4748, -0.7261, -0.4973],
    [0.4504, -0.4036, 0.7964],
    [-0.5551, -0.8034, -0.2153],
    [0.0455, -0.2169, 0.9751],
    [0.0483, 0.5845, 0.8099],
    [-0.1909, -0.1544, -0.9694],
    [0.8383, 0.5084, 0.1969],
    [-0.2464, 0.1148, 0.9623],
    [-0.7458, 0.6318, 0.2114],
    [-0.0080, -0.9831, -0.1828],
    [-0.2630, 0.5386, -0.8005],
    [-0.0507, 0.6425, -0.7646],
    [0.4476, -0.8877, 0.1081],
    [-0.5627, 0.7710, 0.2982],
    [-0.3790, 0.7774, -0.5020],
    [-0.6217, 0.4586, -0.6350],
    [-0.1506, 0.8688, -0.4718],
    [-0.4579, 0.2131, 0.8631],
    [-0.8349, -0.2124, 0.5077],
    [0.7682, -0.1732, -0.6163],
    [0.0997, -0.7168, -0.6901],
    [0.0386, -0.2146, -0.9759],
    [0.9312, 0.1655, -0.3249],
    [0.9151, 0.3053, 0.2634],
    [0.8081, 0.5289, -0.2593],
    [-0.3632, -0.9225, 0.1305],
    [0.2709, -0.3327, -0.9033],
    [-0.1942, -0.9790, -0.0623],
    [0.6302, -0.7641, 0.1377],
    [-0.6948, -0.3137, 0.6471],
    [-0.6596, -0.6452, 0.3854],
    [-0.9454, 0.2713, 0.1805],
    [-0.2586, -0.7957, 0.5477],
    [-0.3576, 0.6511, 0.6695],
    [-0.8490, -0.5275, 0.0328],
    [0.3830, 0.2499, -0.8893],
    [0.8804, -0.2392, -0.4095],
    [0.4321, -0.4475, -0.7829],
    [-0.5821, -0.1656, 0.7961],
    [0.3963, 0.6637, 0.6344],
    [-0.7222, -0.6855, -0.0929],
    [0.2130, -0.9650, -0.1527],
    [0.4737, 0.7367, -0.4825],
    [-0.9956, 0.0891, 0.0278],
    [-0.5178, 0.7899, -0.3287],
    [-0.8906, 0.1431, -0.4317],
    [0.2431, -0.9670, 0.0764],
    [-0.6812, -0.3807, -0.6254],
    [-0.1091, -0.5141, 0.8507],
    [-0.2206, 0.7274, -0.6498],
    [0.8359, 0.2674, 0.4794],
    [0.9873, 0.1103, 0.1147],
    [0.7471, 0.0659, -0.6615],
    [0.6119, -0.2508, 0.7502],
    [-0.6191, 0.0776, 0.7815],
    [0.7663, -0.4739, 0.4339],
    [-0.5699, 0.5369, 0.6220],
    [0.0232, -0.9989, 0.0401],
    [0.0671, -0.4207, -0.9047],
    [-0.2145, 0.5538, 0.8045],
    [0.8554, -0.4894, 0.1698],
    [-0.7912, -0.4194, 0.4450],
    [-0.2341, 0.0754, -0.9693],
    [-0.7725, 0.6346, -0.0216],
    [0.0228, 0.7946, -0.6067],
    [0.7461, -0.3966, -0.5348],
    [-0.4045, -0.0837, -0.9107],
    [-0.4364, 0.6084, -0.6629],
    [0.6177, -0.3175, -0.7195],
    [-0.4301, -0.0198, 0.9026],
    [-0.1489, -0.9706, 0.1892],
    [0.0879, 0.9070, -0.4117],
    [-0.7764, -0.4707, -0.4190],
    [0.9850, 0.1352, -0.1073],
    [-0.1581, -0.3154, 0.9357],
    [0.8938, -0.3246, 0.3096],
    [0.8358, -0.4464, -0.3197],
    [0.4943, 0.4679, 0.7327],
    [-0.3095, 0.9015, -0.3024],
    [-0.3363, -0.8942, -0.2956],
    [-0.1271, -0.9274, -0.3519],
    [0.3523, -0.8717, -0.3407],
    [0.7188, -0.6321, 0.2895],
    [-0.7447, 0.0924, -0.6610],
    [0.1622, 0.7186, 0.6762],
    [-0.9406, -0.0829, -0.3293],
    [-0.1229, 0.9204, 0.3712],
    [-0.8802, 0.4668, 0.0856],
    [-0.2062, -0.1035, 0.9730],
    [-0.4861, -0.7586, -0.4338],
    [-0.6138, 0.7851, 0.0827],
    [0.8476, 0.0504, 0.5282],
    [0.3236, 0.4698, -0.8213],
    [-0.7053, -0.6935, 0.1473],
    [0.1511, 0.3778, 0.9135],
    [0.6011, 0.5847, 0.5448],
    [0.3610, 0.3183, 0.8766],
    [0.9432, 0.3304, 0.0341],
    [0.2423, -0.8079, -0.5372],
    [0.4431, -0.1578, 0.8825],
    [0.6204, 0.5320, -0.5763],
    [-0.2806, -0.5376, -0.7952],
    [-0.5279, -0.8071, 0.2646],
    [-0.4214, -0.6159, 0.6656],
    [0.6759, -0.5995, -0.4288],
    [0.5670, 0.8232, -0.0295],
    [-0.0874, 0.4284, -0.8994],
    [0.8780, -0.0192, -0.4782],
    [0.0166, 0.8421, 0.5391],
    [-0.7741, 0.2931, -0.5610],
    [0.9636, -0.0579, -0.2611],
];

feature_enum!(
    /// kurtosis features. Everything but the tensor coefficients and baseline is cached in the
    /// encoding and refreshed by [Kurtosis::update_features]
    KurtosisFeature, "kurtosis", {
        Dt => "DT",
        B0 => "B0",
        Fw => "FW",
        Fa => "FA",
        Md => "MD",
        Rd => "RD",
        Ad => "AD",
        Fe => "FE",
        Mk => "MK",
        Rk => "RK",
        Ak => "AK",
        Awf => "AWF",
        Eas => "EAS",
        Ias => "IAS",
    }
);

/// the second-order products of a direction, weighted by their multiplicity in a symmetric tensor
pub fn low_order_row(dir: &[f64; 3]) -> [f64; 6] {
    let mut out = [0.0; 6];
    for (o, ([i, j], c)) in out.iter_mut().zip(LOW_IDX.iter().zip(LOW_CNT)) {
        *o = dir[*i] * dir[*j] * c;
    }
    out
}

/// the fourth-order products of a direction, weighted by their multiplicity in a symmetric tensor
pub fn high_order_row(dir: &[f64; 3]) -> [f64; 15] {
    let mut out = [0.0; 15];
    for (o, ([i, j, k, l], c)) in out.iter_mut().zip(HIGH_IDX.iter().zip(HIGH_CNT)) {
        *o = dir[*i] * dir[*j] * dir[*k] * dir[*l] * c;
    }
    out
}

/// one row of the log-linear kurtosis system: -b D(g) + b^2 / 6 W(g)
pub fn design_row(b: f64, g: &[f64; 3]) -> [f64; DK_DIM] {
    let mut out = [0.0; DK_DIM];
    let low = low_order_row(g);
    let high = high_order_row(g);
    for (o, l) in out[..DK_GXXXX].iter_mut().zip(low) {
        *o = -b * l;
    }
    for (o, h) in out[DK_GXXXX..].iter_mut().zip(high) {
        *o = b * b / 6.0 * h;
    }
    out
}

fn mean_diffusivity(dt: &[f64]) -> f64 {
    (dt[DK_GXX] + dt[DK_GYY] + dt[DK_GZZ]) / 3.0
}

/// converts raw least squares coefficients to kurtosis coefficients by dividing the fourth-order
/// part by the squared mean diffusivity. A degenerate diffusivity zeroes the fourth-order part
pub fn normalize_kurtosis(coeffs: &mut [f64]) {
    let md = mean_diffusivity(coeffs);
    let scale = 1.0 / (md * md);
    let scale = if md.abs() < f64::EPSILON || !scale.is_finite() { 0.0 } else { scale };
    coeffs[DK_GXXXX..DK_DIM].iter_mut().for_each(|c| *c *= scale);
}

/// the fixed direction set used to average directional kurtosis, with its projections
#[derive(Debug, Clone)]
pub struct KurtosisDirections {
    dirs: Vec<[f64; 3]>,
    low: Vec<[f64; 6]>,
    high: Vec<[f64; 15]>,
}

impl Default for KurtosisDirections {
    fn default() -> Self {
        let dirs = HEMI_DIRS
            .iter()
            .copied()
            .chain(HEMI_DIRS.iter().map(|d| [-d[0], -d[1], -d[2]]))
            .collect();
        Self::from_dirs(dirs)
    }
}

impl KurtosisDirections {
    pub fn from_dirs(dirs: Vec<[f64; 3]>) -> Self {
        let low = dirs.iter().map(low_order_row).collect();
        let high = dirs.iter().map(high_order_row).collect();
        Self { dirs, low, high }
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn dirs(&self) -> &[[f64; 3]] {
        &self.dirs
    }
}

/// a diffusion kurtosis model: baseline, diffusion and kurtosis tensor coefficients, cached
/// scalar features and a free-water fraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Kurtosis {
    pub b0: f64,
    pub dt: [f64; DK_DIM],
    pub fa: f64,
    pub md: f64,
    pub ad: f64,
    pub rd: f64,
    pub fe: f64,
    pub mk: f64,
    pub ak: f64,
    pub rk: f64,
    pub awf: f64,
    pub eas: f64,
    pub ias: f64,
    pub fw: f64,
}

impl Kurtosis {
    pub fn new(b0: f64, dt: [f64; DK_DIM]) -> Self {
        Self { b0, dt, ..Default::default() }
    }

    pub fn baseline(&self) -> f64 {
        self.b0
    }

    pub fn tensor_d(&self) -> Matrix3<f64> {
        let dt = &self.dt;
        symmetric3(dt[DK_GXX], dt[DK_GXY], dt[DK_GXZ], dt[DK_GYY], dt[DK_GYZ], dt[DK_GZZ])
    }

    pub fn set_tensor_d(&mut self, d: &Matrix3<f64>) {
        self.dt[DK_GXX] = d[(0, 0)];
        self.dt[DK_GXY] = d[(0, 1)];
        self.dt[DK_GXZ] = d[(0, 2)];
        self.dt[DK_GYY] = d[(1, 1)];
        self.dt[DK_GYZ] = d[(1, 2)];
        self.dt[DK_GZZ] = d[(2, 2)];
    }

    /// the diffusion part as a standalone tensor
    pub fn tensor(&self) -> Tensor {
        Tensor::new(self.b0, &self.tensor_d(), self.fw)
    }

    /// an element of the fully symmetric kurtosis tensor
    pub fn tensor_w(&self, a: usize, b: usize, c: usize, d: usize) -> f64 {
        let mut key = [a, b, c, d];
        key.sort_unstable();
        let pos = HIGH_IDX.iter().position(|k| *k == key).unwrap_or(0);
        self.dt[DK_GXXXX + pos]
    }

    pub fn adc(&self, dir: &[f64; 3]) -> f64 {
        dot_rows(&low_order_row(dir), &self.dt[..DK_GXXXX])
    }

    /// apparent kurtosis coefficient along a unit direction
    pub fn akc(&self, dir: &[f64; 3]) -> f64 {
        akc_from_rows(&self.dt, &low_order_row(dir), &high_order_row(dir))
    }

    /// mean apparent kurtosis over a direction set
    pub fn mean_akc(&self, dirs: &KurtosisDirections) -> f64 {
        if dirs.is_empty() {
            return 0.0;
        }
        let sum = dirs.low.iter().zip(&dirs.high).map(|(l, h)| akc_from_rows(&self.dt, l, h)).sum::<f64>();
        sum / dirs.len() as f64
    }

    /// mean apparent kurtosis perpendicular to the principal diffusion direction
    pub fn radial_akc(&self, principal: &[f64; 3]) -> f64 {
        let [_, e2, e3] = orthonormal_frame(principal);
        let dt = 2.0 * PI / RADIAL_SAMPLES as f64;
        let sum = (0..RADIAL_SAMPLES)
            .map(|i| {
                let (s, c) = (i as f64 * dt).sin_cos();
                let dir = [c * e2[0] + s * e3[0], c * e2[1] + s * e3[1], c * e2[2] + s * e3[2]];
                self.akc(&dir)
            })
            .sum::<f64>();
        sum / RADIAL_SAMPLES as f64
    }

    /// recompute the cached scalar features. The axial kurtosis and the white matter tract
    /// integrity fields are carried through unchanged
    pub fn update_features(&mut self, dirs: &KurtosisDirections) {
        let tensor = Tensor::new(self.b0, &self.tensor_d(), 0.0);
        self.fa = tensor.fa();
        self.md = tensor.md();
        self.rd = tensor.rd();
        self.ad = tensor.ad();
        self.fe = (1.0 - self.adc(&tensor.vecs[0]) / FREE_DIFF).clamp(0.0, 1.0);
        self.mk = self.mean_akc(dirs);
        self.rk = self.radial_akc(&tensor.vecs[0]);
    }
}

fn dot_rows(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn akc_from_rows(dt: &[f64; DK_DIM], low: &[f64; 6], high: &[f64; 15]) -> f64 {
    let md = mean_diffusivity(dt);
    let adc = dot_rows(low, &dt[..DK_GXXXX]);
    let w = dot_rows(high, &dt[DK_GXXXX..]);
    if adc.abs() < f64::EPSILON {
        return 0.0;
    }
    w * md * md / (adc * adc)
}

/// Carlson's symmetric elliptic integral of the first kind,
/// R_F(x, y, z) = 1/2 int_0^inf [(t + x)(t + y)(t + z)]^(-1/2) dt, by the duplication theorem.
/// Arguments must be non-negative with at most one zero. This is the building block of the
/// analytic axial and radial kurtosis, which are not computed here
pub fn carlson_rf(x: f64, y: f64, z: f64) -> f64 {
    const ERRTOL: f64 = 1e-12;
    let a0 = (x + y + z) / 3.0;
    let q = (3.0 * ERRTOL).powf(-1.0 / 6.0) * (a0 - x).abs().max((a0 - y).abs()).max((a0 - z).abs());

    let (mut xn, mut yn, mut zn, mut an) = (x, y, z, a0);
    let mut pow4 = 1.0;
    while pow4 * q > an.abs() {
        let (sx, sy, sz) = (xn.sqrt(), yn.sqrt(), zn.sqrt());
        let lambda = sx * (sy + sz) + sy * sz;
        xn = (xn + lambda) * 0.25;
        yn = (yn + lambda) * 0.25;
        zn = (zn + lambda) * 0.25;
        an = (an + lambda) * 0.25;
        pow4 *= 0.25;
    }

    let bx = (a0 - x) * pow4 / an;
    let by = (a0 - y) * pow4 / an;
    let bz = -bx - by;
    let e2 = bx * by - bz * bz;
    let e3 = bx * by * bz;
    (1.0 - e2 / 10.0 + e3 / 14.0 + e2 * e2 / 24.0 - 3.0 * e2 * e3 / 44.0) / an.sqrt()
}

impl SignalModel for Kurtosis {
    const NAME: &'static str = "kurtosis";
    type Feature = KurtosisFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        if encoding.len() != KURTOSIS_DIM {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() });
        }
        let mut dt = [0.0; DK_DIM];
        dt.copy_from_slice(&encoding[1..=DK_DIM]);
        Ok(Self {
            b0: encoding[DK_B0],
            dt,
            fa: encoding[DK_FA],
            md: encoding[DK_MD],
            ad: encoding[DK_AD],
            rd: encoding[DK_RD],
            fe: encoding[DK_FE],
            mk: encoding[DK_MK],
            ak: encoding[DK_AK],
            rk: encoding[DK_RK],
            awf: encoding[DK_AWF],
            eas: encoding[DK_EAS],
            ias: encoding[DK_IAS],
            fw: encoding[DK_FW],
        })
    }

    fn encoding_size(&self) -> usize {
        KURTOSIS_DIM
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[DK_B0] = self.b0;
        encoding[1..=DK_DIM].copy_from_slice(&self.dt);
        encoding[DK_FA] = self.fa;
        encoding[DK_MD] = self.md;
        encoding[DK_AD] = self.ad;
        encoding[DK_RD] = self.rd;
        encoding[DK_FE] = self.fe;
        encoding[DK_MK] = self.mk;
        encoding[DK_AK] = self.ak;
        encoding[DK_RK] = self.rk;
        encoding[DK_AWF] = self.awf;
        encoding[DK_EAS] = self.eas;
        encoding[DK_IAS] = self.ias;
        encoding[DK_FW] = self.fw;
    }

    fn features(&self) -> Vec<KurtosisFeature> {
        KurtosisFeature::ALL.to_vec()
    }

    fn feature(&self, feature: KurtosisFeature) -> Vec<f64> {
        let v = match feature {
            KurtosisFeature::Dt => return self.dt.to_vec(),
            KurtosisFeature::B0 => self.b0,
            KurtosisFeature::Fw => self.fw,
            KurtosisFeature::Fa => self.fa,
            KurtosisFeature::Md => self.md,
            KurtosisFeature::Rd => self.rd,
            KurtosisFeature::Ad => self.ad,
            KurtosisFeature::Fe => self.fe,
            KurtosisFeature::Mk => self.mk,
            KurtosisFeature::Rk => self.rk,
            KurtosisFeature::Ak => self.ak,
            KurtosisFeature::Awf => self.awf,
            KurtosisFeature::Eas => self.eas,
            KurtosisFeature::Ias => self.ias,
        };
        vec![v]
    }

    /// euclidean distance between the tensor coefficients
    fn distance(&self, other: &Self) -> f64 {
        self.dt.iter().zip(&other.dt).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt()
    }
}

/// forward model: b0 * ((1 - fw) * exp(A dt) + fw * exp(-b FREE_DIFF)), with the fourth-order
/// coefficients scaled back by the squared mean diffusivity
#[derive(Debug, Clone)]
pub struct KurtosisSynth {
    rows: Vec<[f64; DK_DIM]>,
    expiso: Vec<f64>,
    dtadj: [f64; DK_DIM],
}

impl KurtosisSynth {
    pub fn new(gradients: &Gradients) -> Self {
        let rows = gradients.bvecs().iter().zip(gradients.bvals()).map(|(g, &b)| design_row(b, g)).collect();
        let expiso = gradients.bvals().iter().map(|b| (-b * FREE_DIFF).exp()).collect();
        Self { rows, expiso, dtadj: [0.0; DK_DIM] }
    }
}

impl VectFunction for KurtosisSynth {
    fn dim_in(&self) -> usize {
        KURTOSIS_DIM
    }

    fn dim_out(&self) -> usize {
        self.rows.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let b0 = input[DK_B0];
        let frac = input[DK_FW];
        self.dtadj.copy_from_slice(&input[1..=DK_DIM]);
        let md = mean_diffusivity(&self.dtadj);
        self.dtadj[DK_GXXXX..].iter_mut().for_each(|c| *c *= md * md);

        for ((out, row), iso) in output.iter_mut().zip(&self.rows).zip(&self.expiso) {
            let tissue = dot_rows(row, &self.dtadj).exp();
            *out = b0 * ((1.0 - frac) * tissue + frac * iso);
        }
    }
}

/// cosine of the angle between the principal directions of the diffusion parts
pub fn principal_alignment(a: &Kurtosis, b: &Kurtosis) -> f64 {
    dot(&a.tensor().vecs[0], &b.tensor().vecs[0]).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn isotropic(md: f64, w: f64) -> Kurtosis {
        let mut dt = [0.0; DK_DIM];
        dt[DK_GXX] = md;
        dt[DK_GYY] = md;
        dt[DK_GZZ] = md;
        // an isotropic fourth-order tensor: W_iiii = w, W_iijj = w / 3
        dt[DK_GXXXX] = w;
        dt[DK_GXXXX + 10] = w;
        dt[DK_GXXXX + 14] = w;
        dt[DK_GXXXX + 3] = w / 3.0;
        dt[DK_GXXXX + 5] = w / 3.0;
        dt[DK_GXXXX + 12] = w / 3.0;
        Kurtosis::new(1.0, dt)
    }

    #[test]
    fn isotropic_kurtosis_is_uniform() {
        let model = isotropic(1e-3, 0.9);
        for dir in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.6, 0.8, 0.0]] {
            assert_abs_diff_eq!(model.adc(&dir), 1e-3, epsilon = 1e-15);
            assert_abs_diff_eq!(model.akc(&dir), 0.9, epsilon = 1e-9);
        }
        let mut m = model.clone();
        m.update_features(&KurtosisDirections::default());
        assert_abs_diff_eq!(m.mk, 0.9, epsilon = 1e-3);
        assert_abs_diff_eq!(m.rk, 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(m.md, 1e-3, epsilon = 1e-15);
        assert_abs_diff_eq!(m.fa, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn synth_without_kurtosis_matches_tensor() {
        let g = Gradients::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]], vec![0.0, 1000.0, 2000.0]).unwrap();
        let model = isotropic(1e-3, 0.0);
        let out = KurtosisSynth::new(&g).eval(&model.encode());
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], (-1.0f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(out[2], (-2.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn synth_adds_kurtosis_term() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0]], vec![1000.0]).unwrap();
        let model = isotropic(1e-3, 0.6);
        let out = KurtosisSynth::new(&g).eval(&model.encode());
        // ln S = -b D + b^2 D^2 K / 6
        assert_abs_diff_eq!(out[0], (-1.0f64 + 0.1).exp(), epsilon = 1e-12);
    }

    #[test]
    fn synth_uses_free_water_field() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0]], vec![1000.0]).unwrap();
        let mut model = isotropic(1e-3, 0.0);
        model.fw = 1.0;
        let out = KurtosisSynth::new(&g).eval(&model.encode());
        assert_abs_diff_eq!(out[0], (-3.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn normalization_guards_degenerate_diffusivity() {
        let mut coeffs = [1.0; DK_DIM];
        coeffs[DK_GXX] = 0.0;
        coeffs[DK_GYY] = 0.0;
        coeffs[DK_GZZ] = 0.0;
        normalize_kurtosis(&mut coeffs);
        assert!(coeffs[DK_GXXXX..].iter().all(|&c| c == 0.0));

        let mut coeffs = [0.0; DK_DIM];
        coeffs[DK_GXX] = 2.0;
        coeffs[DK_GYY] = 2.0;
        coeffs[DK_GZZ] = 2.0;
        coeffs[DK_GXXXX] = 8.0;
        normalize_kurtosis(&mut coeffs);
        assert_eq!(coeffs[DK_GXXXX], 2.0);
    }

    #[test]
    fn symmetric_lookup() {
        let model = isotropic(1e-3, 0.9);
        assert_eq!(model.tensor_w(0, 0, 1, 1), model.tensor_w(1, 0, 1, 0));
        assert_abs_diff_eq!(model.tensor_w(2, 1, 2, 1), 0.3, epsilon = 1e-15);
    }

    #[test]
    fn direction_set_is_antipodal() {
        let dirs = KurtosisDirections::default();
        assert_eq!(dirs.len(), 256);
        for i in 0..128 {
            let (a, b) = (dirs.dirs()[i], dirs.dirs()[i + 128]);
            assert_eq!(a, [-b[0], -b[1], -b[2]]);
        }
    }

    #[test]
    fn carlson_reference_values() {
        assert_abs_diff_eq!(carlson_rf(1.0, 2.0, 0.0), 1.311_028_777_146_06, epsilon = 1e-9);
        assert_abs_diff_eq!(carlson_rf(2.0, 3.0, 4.0), 0.584_082_841_677_15, epsilon = 1e-9);
        assert_abs_diff_eq!(carlson_rf(1.0, 1.0, 1.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn round_trip_and_distance() {
        let mut model = isotropic(1e-3, 0.9);
        model.mk = 0.5;
        model.fw = 0.1;
        let again = Kurtosis::decode(&model.encode()).unwrap();
        assert_eq!(again, model);
        assert_eq!(model.distance(&again), 0.0);
        assert!(Kurtosis::decode(&[0.0; 22]).is_err());
        assert_abs_diff_eq!(principal_alignment(&model, &again), 1.0, epsilon = 1e-9);
    }
}
