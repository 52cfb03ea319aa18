use crate::error::{ModelError, Result};
use crate::gradients::{dot, Gradients, DELTA};
use crate::linalg::{eig_sym3, from_eigen, symmetric3, Eigen3};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::{Matrix3, Vector3};

/// diffusivity of free water at body temperature
pub const FREE_DIFF: f64 = 3.0e-3;

// how parameters are stored as vectors
pub const DT_S0: usize = 0;
pub const DT_XX: usize = 1;
pub const DT_XY: usize = 2;
pub const DT_YY: usize = 3;
pub const DT_XZ: usize = 4;
pub const DT_YZ: usize = 5;
pub const DT_ZZ: usize = 6;
pub const DT_FW: usize = 7;
pub const DT_DIM: usize = 8;

feature_enum!(
    /// derived quantities of a diffusion tensor
    TensorFeature, "tensor", {
        S0 => "S0",
        Fa => "FA",
        Md => "MD",
        Rd => "RD",
        Ad => "AD",
        Cp => "CP",
        Cl => "CL",
        Cs => "CS",
        Pd => "PD",
        Fw => "FW",
        Rgb => "RGB",
    }
);

/// a single diffusion tensor with baseline signal and free-water fraction, stored by its
/// eigenvalues (descending) and eigenvectors
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub s0: f64,
    pub vals: [f64; 3],
    pub vecs: [[f64; 3]; 3],
    pub fw: f64,
}

impl Default for Tensor {
    fn default() -> Self {
        Self { s0: 0.0, vals: [0.0; 3], vecs: [[0.0; 3]; 3], fw: 0.0 }
    }
}

impl Tensor {
    pub fn new(s0: f64, matrix: &Matrix3<f64>, fw: f64) -> Self {
        let mut t = Self { s0, fw, ..Default::default() };
        t.set_matrix(matrix);
        t
    }

    /// a tensor with the given eigenvalues aligned to the coordinate axes
    pub fn diagonal(s0: f64, vals: [f64; 3]) -> Self {
        Self::new(s0, &Matrix3::from_diagonal(&Vector3::new(vals[0], vals[1], vals[2])), 0.0)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        from_eigen(&self.vals, &self.vecs)
    }

    pub fn set_matrix(&mut self, matrix: &Matrix3<f64>) {
        let Eigen3 { values, vectors } = eig_sym3(matrix);
        self.vals = values;
        self.vecs = vectors;
    }

    pub fn baseline(&self) -> f64 {
        self.s0
    }

    /// raise every eigenvalue to at least `min`
    pub fn clamp(&mut self, min: f64) -> &mut Self {
        self.vals.iter_mut().for_each(|v| *v = v.max(min));
        self
    }

    pub fn scale(&mut self, factor: f64) -> &mut Self {
        self.vals.iter_mut().for_each(|v| *v *= factor);
        self
    }

    /// make the eigenvector frame right-handed
    pub fn orient(&mut self) {
        let [a, b, c] = self.vecs;
        let rot = Matrix3::new(a[0], a[1], a[2], b[0], b[1], b[2], c[0], c[1], c[2]);
        if rot.determinant() < 0.0 {
            self.vecs[2] = [-c[0], -c[1], -c[2]];
        }
    }

    /// the matrix logarithm, with non-positive eigenvalues mapped to the smallest positive double
    pub fn log(&self) -> Tensor {
        let mut out = self.clone();
        out.vals.iter_mut().for_each(|v| *v = if *v <= 0.0 { f64::MIN_POSITIVE } else { v.ln() });
        out
    }

    pub fn fa(&self) -> f64 {
        fa(self.vals[0], self.vals[1], self.vals[2])
    }

    pub fn md(&self) -> f64 {
        self.vals.iter().sum::<f64>() / 3.0
    }

    pub fn rd(&self) -> f64 {
        (self.vals[1] + self.vals[2]) / 2.0
    }

    pub fn ad(&self) -> f64 {
        self.vals[0]
    }

    /// orientation distribution sampled at unit directions. `alpha` sharpens the profile
    pub fn odf(&self, alpha: f64, samples: &[[f64; 3]]) -> Vec<f64> {
        let Some(inv) = self.matrix().try_inverse() else {
            return vec![0.0; samples.len()];
        };
        let u = inv * self.md();
        samples
            .iter()
            .map(|s| {
                let n = Vector3::new(s[0], s[1], s[2]);
                let nun = n.dot(&(u * n));
                let odf = if nun.abs() < DELTA { 0.0 } else { 1.0 / nun };
                if (alpha - 1.0).abs() < DELTA { odf } else { odf.powf(0.5 * (alpha + 1.0)) }
            })
            .collect()
    }

    /// root mean squared error between a signal and this tensor's prediction
    pub fn rmse(&self, signal: &[f64], gradients: &Gradients) -> f64 {
        let pred = TensorSynth::new(gradients).eval(&self.encode());
        let mse = pred.iter().zip(signal).map(|(p, s)| (p - s).powi(2)).sum::<f64>() / gradients.size() as f64;
        mse.sqrt()
    }
}

pub fn fa(v1: f64, v2: f64, v3: f64) -> f64 {
    let md = (v1 + v2 + v3) / 3.0;
    let num = (v1 - md).powi(2) + (v2 - md).powi(2) + (v3 - md).powi(2);
    let den = v1 * v1 + v2 * v2 + v3 * v3;
    if den == 0.0 { 0.0 } else { (1.5 * num / den).sqrt() }
}

/// westin shape measures (linear, planar, spherical)
fn westin(vals: &[f64; 3]) -> [f64; 3] {
    let den = vals.iter().sum::<f64>();
    if den.abs() < DELTA {
        return [0.0; 3];
    }
    let [v1, v2, v3] = *vals;
    [2.0 * (v1 - v2) / den, 2.0 * (v2 - v3) / den, 3.0 * v3 / den]
}

/// coefficients mapping the six unique tensor entries (in encoding order xx, xy, yy, xz, yz, zz)
/// to the log attenuation of one measurement
pub fn design_row(b: f64, g: &[f64; 3]) -> [f64; 6] {
    let [gx, gy, gz] = *g;
    [
        -b * gx * gx,
        -2.0 * b * gx * gy,
        -b * gy * gy,
        -2.0 * b * gx * gz,
        -2.0 * b * gy * gz,
        -b * gz * gz,
    ]
}

impl SignalModel for Tensor {
    const NAME: &'static str = "tensor";
    type Feature = TensorFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        if encoding.len() != DT_DIM {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() });
        }
        let matrix = symmetric3(
            encoding[DT_XX],
            encoding[DT_XY],
            encoding[DT_XZ],
            encoding[DT_YY],
            encoding[DT_YZ],
            encoding[DT_ZZ],
        );
        Ok(Tensor::new(encoding[DT_S0], &matrix, encoding[DT_FW]))
    }

    fn encoding_size(&self) -> usize {
        DT_DIM
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        let m = self.matrix();
        encoding[DT_S0] = self.s0;
        encoding[DT_XX] = m[(0, 0)];
        encoding[DT_XY] = m[(0, 1)];
        encoding[DT_YY] = m[(1, 1)];
        encoding[DT_XZ] = m[(0, 2)];
        encoding[DT_YZ] = m[(1, 2)];
        encoding[DT_ZZ] = m[(2, 2)];
        encoding[DT_FW] = self.fw;
    }

    fn features(&self) -> Vec<TensorFeature> {
        TensorFeature::ALL.to_vec()
    }

    fn feature(&self, feature: TensorFeature) -> Vec<f64> {
        match feature {
            TensorFeature::S0 => vec![self.s0],
            TensorFeature::Fa => vec![self.fa()],
            TensorFeature::Md => vec![self.md()],
            TensorFeature::Rd => vec![self.rd()],
            TensorFeature::Ad => vec![self.ad()],
            TensorFeature::Cl => vec![westin(&self.vals)[0]],
            TensorFeature::Cp => vec![westin(&self.vals)[1]],
            TensorFeature::Cs => vec![westin(&self.vals)[2]],
            TensorFeature::Pd => self.vecs[0].to_vec(),
            TensorFeature::Fw => vec![self.fw],
            TensorFeature::Rgb => {
                let fa = self.fa();
                self.vecs[0].iter().map(|v| v.abs() * fa).collect()
            }
        }
    }

    /// frobenius norm of the tensor difference
    fn distance(&self, other: &Self) -> f64 {
        (self.matrix() - other.matrix()).norm()
    }
}

/// forward model of a tensor encoding: s0 * (fw * exp(-b * FREE_DIFF) + (1 - fw) * exp(-b g^T D g))
#[derive(Debug, Clone)]
pub struct TensorSynth {
    bvals: Vec<f64>,
    rows: Vec<[f64; 6]>,
}

impl TensorSynth {
    pub fn new(gradients: &Gradients) -> Self {
        let rows = gradients.bvecs().iter().zip(gradients.bvals()).map(|(g, &b)| design_row(b, g)).collect();
        Self { bvals: gradients.bvals().to_vec(), rows }
    }
}

impl VectFunction for TensorSynth {
    fn dim_in(&self) -> usize {
        DT_DIM
    }

    fn dim_out(&self) -> usize {
        self.rows.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let s0 = input[DT_S0];
        let frac = input[DT_FW];
        let coeffs = [input[DT_XX], input[DT_XY], input[DT_YY], input[DT_XZ], input[DT_YZ], input[DT_ZZ]];
        for ((out, row), &b) in output.iter_mut().zip(&self.rows).zip(&self.bvals) {
            let expten = row.iter().zip(&coeffs).map(|(r, c)| r * c).sum::<f64>().exp();
            let expiso = (-b * FREE_DIFF).exp();
            *out = s0 * (frac * expiso + (1.0 - frac) * expten);
        }
    }
}

/// angle in degrees between the principal directions of two tensors, ignoring sign
pub fn principal_angle(a: &Tensor, b: &Tensor) -> f64 {
    dot(&a.vecs[0], &b.vecs[0]).abs().min(1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn six_dirs() -> Gradients {
        let s = 1.0 / 2f64.sqrt();
        let bvecs = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [s, s, 0.0],
            [s, 0.0, s],
            [0.0, s, s],
        ];
        let mut bvals = vec![1000.0; 7];
        bvals[0] = 0.0;
        Gradients::new(bvecs, bvals).unwrap()
    }

    #[test]
    fn isotropic_signal_is_uniform() {
        let g = six_dirs();
        let t = Tensor::diagonal(1.0, [1e-3, 1e-3, 1e-3]);
        let signal = TensorSynth::new(&g).eval(&t.encode());
        assert_abs_diff_eq!(signal[0], 1.0, epsilon = 1e-12);
        for s in &signal[1..] {
            assert_abs_diff_eq!(*s, (-1.0f64).exp(), epsilon = 1e-12);
        }
    }

    #[test]
    fn synth_scales_with_baseline() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0]], vec![1000.0]).unwrap();
        let t = Tensor::diagonal(1000.0, [1e-3, 1e-3, 1e-3]);
        let signal = TensorSynth::new(&g).eval(&t.encode());
        assert_abs_diff_eq!(signal[0], 1000.0 * (-1.0f64).exp(), epsilon = 1e-9);
    }

    #[test]
    fn free_water_mixes_compartments() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0]], vec![1000.0]).unwrap();
        let mut t = Tensor::diagonal(1.0, [1e-3, 1e-3, 1e-3]);
        t.fw = 0.5;
        let signal = TensorSynth::new(&g).eval(&t.encode());
        let expected = 0.5 * (-3.0f64).exp() + 0.5 * (-1.0f64).exp();
        assert_abs_diff_eq!(signal[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn equal_eigenvalues_have_zero_fa() {
        let t = Tensor::diagonal(1.0, [1e-3, 1e-3, 1e-3]);
        assert_eq!(t.fa(), 0.0);
        assert_eq!(fa(0.0, 0.0, 0.0), 0.0);
        assert_abs_diff_eq!(fa(1.0, 0.0, 0.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn features_of_prolate_tensor() {
        let t = Tensor::diagonal(2.0, [3e-3, 1e-3, 1e-3]);
        assert_abs_diff_eq!(t.feature(TensorFeature::Ad)[0], 3e-3, epsilon = 1e-15);
        assert_abs_diff_eq!(t.feature(TensorFeature::Rd)[0], 1e-3, epsilon = 1e-15);
        assert_abs_diff_eq!(t.feature(TensorFeature::Md)[0], 5e-3 / 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(t.feature(TensorFeature::Cl)[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(t.feature(TensorFeature::Cp)[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.feature(TensorFeature::Pd)[0].abs(), 1.0, epsilon = 1e-12);
        assert_eq!(t.feature(TensorFeature::Rgb).len(), 3);
        assert_eq!(t.feature(TensorFeature::S0), vec![2.0]);
    }

    #[test]
    fn encoding_round_trip() {
        let enc = vec![1.5, 2e-3, 1e-4, 1e-3, -2e-4, 3e-5, 7e-4, 0.2];
        let t = Tensor::decode(&enc).unwrap();
        let out = t.encode();
        for (a, b) in enc.iter().zip(&out) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-15);
        }
        assert!(Tensor::decode(&enc[..7]).is_err());
    }

    #[test]
    fn distance_is_a_metric() {
        let a = Tensor::diagonal(1.0, [3e-3, 1e-3, 1e-3]);
        let b = Tensor::diagonal(1.0, [1e-3, 1e-3, 1e-3]);
        assert_eq!(a.distance(&a), 0.0);
        assert_abs_diff_eq!(a.distance(&b), b.distance(&a), epsilon = 1e-18);
        assert_abs_diff_eq!(a.distance(&b), 2e-3, epsilon = 1e-12);
    }

    #[test]
    fn clamp_and_orient() {
        let mut t = Tensor::diagonal(1.0, [1e-3, -1e-4, -2e-4]);
        t.clamp(0.0);
        assert_eq!(t.vals[1], 0.0);
        assert_eq!(t.vals[2], 0.0);
        t.vecs[2] = [-t.vecs[2][0], -t.vecs[2][1], -t.vecs[2][2]];
        t.orient();
        let [a, b, c] = t.vecs;
        let det = Matrix3::new(a[0], a[1], a[2], b[0], b[1], b[2], c[0], c[1], c[2]).determinant();
        assert!(det > 0.0);
    }

    #[test]
    fn odf_peaks_along_principal_direction() {
        let t = Tensor::diagonal(1.0, [3e-3, 1e-3, 1e-3]);
        let odf = t.odf(1.0, &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert!(odf[0] > odf[1]);
    }

    #[test]
    fn rmse_of_exact_prediction_is_zero() {
        let g = six_dirs();
        let t = Tensor::diagonal(100.0, [2e-3, 1e-3, 5e-4]);
        let signal = TensorSynth::new(&g).eval(&t.encode());
        assert_abs_diff_eq!(t.rmse(&signal, &g), 0.0, epsilon = 1e-9);
    }
}
