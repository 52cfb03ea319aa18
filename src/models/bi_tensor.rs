use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use crate::linalg::{eig_sym3, symmetric3, Eigen3};
use crate::models::tensor::{design_row, Tensor, TensorFeature};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use nalgebra::Matrix3;

pub const BDT_S0: usize = 0;
pub const BDT_DOT: usize = 1;
pub const BDT_FRAC: usize = 2;
pub const BDT_TXX: usize = 3;
pub const BDT_TXY: usize = 4;
pub const BDT_TYY: usize = 5;
pub const BDT_TXZ: usize = 6;
pub const BDT_TYZ: usize = 7;
pub const BDT_TZZ: usize = 8;
pub const BDT_FXX: usize = 9;
pub const BDT_FXY: usize = 10;
pub const BDT_FYY: usize = 11;
pub const BDT_FXZ: usize = 12;
pub const BDT_FYZ: usize = 13;
pub const BDT_FZZ: usize = 14;
pub const BDT_DIM: usize = 15;

feature_enum!(BiTensorFeature, "bitensor", {
    S0 => "S0",
    Dot => "dot",
    Frac => "frac",
    TissueFa => "tFA",
    TissueMd => "tMD",
    TissueRd => "tRD",
    TissueAd => "tAD",
    TissueCp => "tCP",
    TissueCl => "tCL",
    TissueCs => "tCS",
    TissuePd => "tPD",
    FluidFa => "fFA",
    FluidMd => "fMD",
    FluidRd => "fRD",
    FluidAd => "fAD",
    FluidCp => "fCP",
    FluidCl => "fCL",
    FluidCs => "fCS",
    FluidPd => "fPD",
});

/// a tissue tensor and a fluid tensor sharing one baseline, plus a non-decaying "dot"
/// compartment
#[derive(Debug, Clone, PartialEq)]
pub struct BiTensor {
    pub s0: f64,
    pub dot: f64,
    pub frac: f64,
    pub tissue: Eigen3,
    pub fluid: Eigen3,
}

impl Default for BiTensor {
    fn default() -> Self {
        let zero = Eigen3 { values: [0.0; 3], vectors: [[0.0; 3]; 3] };
        Self { s0: 0.0, dot: 0.0, frac: 0.0, tissue: zero, fluid: zero }
    }
}

impl BiTensor {
    pub fn new(s0: f64, frac: f64, tissue: &Matrix3<f64>, fluid: &Matrix3<f64>) -> Self {
        Self { s0, dot: 0.0, frac, tissue: eig_sym3(tissue), fluid: eig_sym3(fluid) }
    }

    pub fn baseline(&self) -> f64 {
        self.s0
    }

    pub fn tissue_matrix(&self) -> Matrix3<f64> {
        self.tissue.matrix()
    }

    pub fn fluid_matrix(&self) -> Matrix3<f64> {
        self.fluid.matrix()
    }

    pub fn set_tissue_matrix(&mut self, tissue: &Matrix3<f64>) {
        self.tissue = eig_sym3(tissue);
    }

    pub fn set_fluid_matrix(&mut self, fluid: &Matrix3<f64>) {
        self.fluid = eig_sym3(fluid);
    }

    /// the tissue compartment as a standalone tensor
    pub fn tissue_tensor(&self) -> Tensor {
        Tensor { s0: self.s0, vals: self.tissue.values, vecs: self.tissue.vectors, fw: 0.0 }
    }

    /// the fluid compartment as a standalone tensor
    pub fn fluid_tensor(&self) -> Tensor {
        Tensor { s0: self.s0, vals: self.fluid.values, vecs: self.fluid.vectors, fw: 0.0 }
    }
}

fn read_matrix(encoding: &[f64], xx: usize) -> Matrix3<f64> {
    // entries are stored xx, xy, yy, xz, yz, zz from the given offset
    symmetric3(encoding[xx], encoding[xx + 1], encoding[xx + 3], encoding[xx + 2], encoding[xx + 4], encoding[xx + 5])
}

fn write_matrix(m: &Matrix3<f64>, encoding: &mut [f64], xx: usize) {
    encoding[xx] = m[(0, 0)];
    encoding[xx + 1] = m[(0, 1)];
    encoding[xx + 2] = m[(1, 1)];
    encoding[xx + 3] = m[(0, 2)];
    encoding[xx + 4] = m[(1, 2)];
    encoding[xx + 5] = m[(2, 2)];
}

impl SignalModel for BiTensor {
    const NAME: &'static str = "bitensor";
    type Feature = BiTensorFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        if encoding.len() != BDT_DIM {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() });
        }
        let mut out = BiTensor::new(
            encoding[BDT_S0],
            encoding[BDT_FRAC],
            &read_matrix(encoding, BDT_TXX),
            &read_matrix(encoding, BDT_FXX),
        );
        out.dot = encoding[BDT_DOT];
        Ok(out)
    }

    fn encoding_size(&self) -> usize {
        BDT_DIM
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[BDT_S0] = self.s0;
        encoding[BDT_DOT] = self.dot;
        encoding[BDT_FRAC] = self.frac;
        write_matrix(&self.tissue_matrix(), encoding, BDT_TXX);
        write_matrix(&self.fluid_matrix(), encoding, BDT_FXX);
    }

    fn features(&self) -> Vec<BiTensorFeature> {
        BiTensorFeature::ALL.to_vec()
    }

    fn feature(&self, feature: BiTensorFeature) -> Vec<f64> {
        use BiTensorFeature::*;
        let (tensor, which) = match feature {
            S0 => return vec![self.s0],
            Dot => return vec![self.dot],
            Frac => return vec![self.frac],
            TissueFa => (self.tissue_tensor(), TensorFeature::Fa),
            TissueMd => (self.tissue_tensor(), TensorFeature::Md),
            TissueRd => (self.tissue_tensor(), TensorFeature::Rd),
            TissueAd => (self.tissue_tensor(), TensorFeature::Ad),
            TissueCp => (self.tissue_tensor(), TensorFeature::Cp),
            TissueCl => (self.tissue_tensor(), TensorFeature::Cl),
            TissueCs => (self.tissue_tensor(), TensorFeature::Cs),
            TissuePd => (self.tissue_tensor(), TensorFeature::Pd),
            FluidFa => (self.fluid_tensor(), TensorFeature::Fa),
            FluidMd => (self.fluid_tensor(), TensorFeature::Md),
            FluidRd => (self.fluid_tensor(), TensorFeature::Rd),
            FluidAd => (self.fluid_tensor(), TensorFeature::Ad),
            FluidCp => (self.fluid_tensor(), TensorFeature::Cp),
            FluidCl => (self.fluid_tensor(), TensorFeature::Cl),
            FluidCs => (self.fluid_tensor(), TensorFeature::Cs),
            FluidPd => (self.fluid_tensor(), TensorFeature::Pd),
        };
        tensor.feature(which)
    }

    /// fraction-weighted tensor differences plus the log ratio of the fluid fractions
    fn distance(&self, other: &Self) -> f64 {
        let tc = (self.tissue_matrix() - other.tissue_matrix()).norm();
        let wc = (self.fluid_matrix() - other.fluid_matrix()).norm();
        let fc = ((self.frac + DELTA) / (other.frac + DELTA)).ln().abs();
        let left = tc * (1.0 - self.frac) + self.frac * wc;
        let right = tc * (1.0 - other.frac) + other.frac * wc;
        fc + left + right
    }
}

/// s0 * ((1 - frac - dot) * exp(-b g^T T g) + frac * exp(-b g^T F g) + dot)
#[derive(Debug, Clone)]
pub struct BiTensorSynth {
    rows: Vec<[f64; 6]>,
}

impl BiTensorSynth {
    pub fn new(gradients: &Gradients) -> Self {
        let rows = gradients.bvecs().iter().zip(gradients.bvals()).map(|(g, &b)| design_row(b, g)).collect();
        Self { rows }
    }
}

impl VectFunction for BiTensorSynth {
    fn dim_in(&self) -> usize {
        BDT_DIM
    }

    fn dim_out(&self) -> usize {
        self.rows.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let s0 = input[BDT_S0];
        let dot = input[BDT_DOT];
        let frac = input[BDT_FRAC];
        let tissue = &input[BDT_TXX..BDT_TXX + 6];
        let fluid = &input[BDT_FXX..BDT_FXX + 6];
        for (out, row) in output.iter_mut().zip(&self.rows) {
            let tsig = row.iter().zip(tissue).map(|(r, c)| r * c).sum::<f64>().exp();
            let fsig = row.iter().zip(fluid).map(|(r, c)| r * c).sum::<f64>().exp();
            *out = s0 * ((1.0 - frac - dot) * tsig + frac * fsig + dot);
        }
    }
}
