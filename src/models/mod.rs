// Parametric diffusion signal models
//
// every model has a numeric encoding, derived features and a distance, and all but the generic
// vector model have a forward model that predicts the signal of a gradient scheme

use crate::error::{ModelError, Result};
use crate::gradients::Gradients;
use crate::volume_function::VectFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// declares a closed feature tag with string names for the command line and file boundary
macro_rules! feature_enum {
    ($(#[$meta:meta])* $name:ident, $model:expr, { $($variant:ident => $key:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $key),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::ModelError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($key => Ok($name::$variant),)+
                    _ => Err($crate::error::ModelError::UnknownFeature { model: $model, name: s.to_string() }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

pub mod bi_exp_decay;
pub mod bi_tensor;
pub mod exp_decay;
pub mod fibers;
pub mod kurtosis;
pub mod mcsmt;
pub mod noddi;
pub mod spharm;
pub mod tensor;
pub mod utils;
pub mod vect;

pub use bi_exp_decay::BiExpDecay;
pub use bi_tensor::BiTensor;
pub use exp_decay::ExpDecay;
pub use fibers::Fibers;
pub use kurtosis::Kurtosis;
pub use mcsmt::Mcsmt;
pub use noddi::Noddi;
pub use spharm::Spharm;
pub use tensor::Tensor;
pub use vect::VectModel;

/// capabilities shared by every model kind
pub trait SignalModel: Sized + Clone + fmt::Debug {
    const NAME: &'static str;
    type Feature: Copy + fmt::Display + FromStr<Err = ModelError>;

    /// build a model from its encoding, sanitizing where the model requires it
    fn decode(encoding: &[f64]) -> Result<Self>;

    fn encoding_size(&self) -> usize;

    fn encode_into(&self, encoding: &mut [f64]);

    fn encode(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.encoding_size()];
        self.encode_into(&mut out);
        out
    }

    fn features(&self) -> Vec<Self::Feature>;

    fn feature(&self, feature: Self::Feature) -> Vec<f64>;

    fn feature_by_name(&self, name: &str) -> Result<Vec<f64>> {
        Ok(self.feature(name.parse()?))
    }

    fn distance(&self, other: &Self) -> f64;
}

/// parameters of the forward models that are not part of any encoding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthParams {
    pub fibers: fibers::FibersParams,
    pub noddi: noddi::NoddiParams,
}

/// the model kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    ExpDecay,
    BiExpDecay,
    Tensor,
    BiTensor,
    Kurtosis,
    Fibers,
    Noddi,
    Mcsmt,
    Spharm,
    Vect,
}

impl ModelType {
    pub const ALL: [ModelType; 10] = [
        ModelType::ExpDecay,
        ModelType::BiExpDecay,
        ModelType::Tensor,
        ModelType::BiTensor,
        ModelType::Kurtosis,
        ModelType::Fibers,
        ModelType::Noddi,
        ModelType::Mcsmt,
        ModelType::Spharm,
        ModelType::Vect,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelType::ExpDecay => ExpDecay::NAME,
            ModelType::BiExpDecay => BiExpDecay::NAME,
            ModelType::Tensor => Tensor::NAME,
            ModelType::BiTensor => BiTensor::NAME,
            ModelType::Kurtosis => Kurtosis::NAME,
            ModelType::Fibers => Fibers::NAME,
            ModelType::Noddi => Noddi::NAME,
            ModelType::Mcsmt => Mcsmt::NAME,
            ModelType::Spharm => Spharm::NAME,
            ModelType::Vect => VectModel::NAME,
        }
    }

    pub fn decode(&self, encoding: &[f64]) -> Result<Model> {
        Ok(match self {
            ModelType::ExpDecay => Model::ExpDecay(ExpDecay::decode(encoding)?),
            ModelType::BiExpDecay => Model::BiExpDecay(BiExpDecay::decode(encoding)?),
            ModelType::Tensor => Model::Tensor(Tensor::decode(encoding)?),
            ModelType::BiTensor => Model::BiTensor(BiTensor::decode(encoding)?),
            ModelType::Kurtosis => Model::Kurtosis(Kurtosis::decode(encoding)?),
            ModelType::Fibers => Model::Fibers(Fibers::decode(encoding)?),
            ModelType::Noddi => Model::Noddi(Noddi::decode(encoding)?),
            ModelType::Mcsmt => Model::Mcsmt(Mcsmt::decode(encoding)?),
            ModelType::Spharm => Model::Spharm(Spharm::decode(encoding)?),
            ModelType::Vect => Model::Vect(VectModel::decode(encoding)?),
        })
    }
}

impl FromStr for ModelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "expdecay" | "exp" => Ok(ModelType::ExpDecay),
            "biexpdecay" | "biexp" => Ok(ModelType::BiExpDecay),
            "tensor" | "dti" => Ok(ModelType::Tensor),
            "bitensor" | "bti" => Ok(ModelType::BiTensor),
            "kurtosis" | "dki" => Ok(ModelType::Kurtosis),
            "fibers" | "fibres" | "xfib" => Ok(ModelType::Fibers),
            "noddi" => Ok(ModelType::Noddi),
            "mcsmt" => Ok(ModelType::Mcsmt),
            "spharm" | "sh" => Ok(ModelType::Spharm),
            "vect" => Ok(ModelType::Vect),
            _ => Err(ModelError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// the closed family of models
#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    ExpDecay(ExpDecay),
    BiExpDecay(BiExpDecay),
    Tensor(Tensor),
    BiTensor(BiTensor),
    Kurtosis(Kurtosis),
    Fibers(Fibers),
    Noddi(Noddi),
    Mcsmt(Mcsmt),
    Spharm(Spharm),
    Vect(VectModel),
}

macro_rules! dispatch {
    ($value:expr, $m:ident => $body:expr) => {
        match $value {
            Model::ExpDecay($m) => $body,
            Model::BiExpDecay($m) => $body,
            Model::Tensor($m) => $body,
            Model::BiTensor($m) => $body,
            Model::Kurtosis($m) => $body,
            Model::Fibers($m) => $body,
            Model::Noddi($m) => $body,
            Model::Mcsmt($m) => $body,
            Model::Spharm($m) => $body,
            Model::Vect($m) => $body,
        }
    };
}

impl Model {
    pub fn kind(&self) -> ModelType {
        match self {
            Model::ExpDecay(_) => ModelType::ExpDecay,
            Model::BiExpDecay(_) => ModelType::BiExpDecay,
            Model::Tensor(_) => ModelType::Tensor,
            Model::BiTensor(_) => ModelType::BiTensor,
            Model::Kurtosis(_) => ModelType::Kurtosis,
            Model::Fibers(_) => ModelType::Fibers,
            Model::Noddi(_) => ModelType::Noddi,
            Model::Mcsmt(_) => ModelType::Mcsmt,
            Model::Spharm(_) => ModelType::Spharm,
            Model::Vect(_) => ModelType::Vect,
        }
    }

    pub fn encoding_size(&self) -> usize {
        dispatch!(self, m => m.encoding_size())
    }

    pub fn encode(&self) -> Vec<f64> {
        dispatch!(self, m => m.encode())
    }

    pub fn feature_names(&self) -> Vec<String> {
        dispatch!(self, m => m.features().iter().map(|f| f.to_string()).collect())
    }

    pub fn feature(&self, name: &str) -> Result<Vec<f64>> {
        dispatch!(self, m => m.feature_by_name(name))
    }

    /// distance between two models of the same kind
    pub fn distance(&self, other: &Model) -> Result<f64> {
        match (self, other) {
            (Model::ExpDecay(a), Model::ExpDecay(b)) => Ok(a.distance(b)),
            (Model::BiExpDecay(a), Model::BiExpDecay(b)) => Ok(a.distance(b)),
            (Model::Tensor(a), Model::Tensor(b)) => Ok(a.distance(b)),
            (Model::BiTensor(a), Model::BiTensor(b)) => Ok(a.distance(b)),
            (Model::Kurtosis(a), Model::Kurtosis(b)) => Ok(a.distance(b)),
            (Model::Fibers(a), Model::Fibers(b)) => Ok(a.distance(b)),
            (Model::Noddi(a), Model::Noddi(b)) => Ok(a.distance(b)),
            (Model::Mcsmt(a), Model::Mcsmt(b)) => Ok(a.distance(b)),
            (Model::Spharm(a), Model::Spharm(b)) => Ok(a.distance(b)),
            (Model::Vect(a), Model::Vect(b)) => Ok(a.distance(b)),
            (a, b) => Err(ModelError::ModelMismatch(a.kind().name(), b.kind().name())),
        }
    }

    /// the forward model for models shaped like this one. The function maps encodings of the
    /// same size to the predicted signal of every gradient
    pub fn synth(&self, gradients: &Gradients, params: &SynthParams) -> Result<Box<dyn VectFunction + Send>> {
        Ok(match self {
            Model::ExpDecay(_) => Box::new(exp_decay::ExpDecaySynth::new(gradients.bvals())),
            Model::BiExpDecay(_) => Box::new(bi_exp_decay::BiExpDecaySynth::new(gradients.bvals())),
            Model::Tensor(_) => Box::new(tensor::TensorSynth::new(gradients)),
            Model::BiTensor(_) => Box::new(bi_tensor::BiTensorSynth::new(gradients)),
            Model::Kurtosis(_) => Box::new(kurtosis::KurtosisSynth::new(gradients)),
            Model::Fibers(f) => Box::new(fibers::FibersSynth::new(f.size(), gradients, &params.fibers)),
            Model::Noddi(_) => Box::new(noddi::NoddiSynth::new(gradients, &params.noddi)?),
            Model::Mcsmt(_) => Box::new(mcsmt::McsmtSynth::new(gradients)),
            Model::Spharm(s) => Box::new(spharm::SpharmSynth::new(s.order(), gradients)?),
            Model::Vect(_) => {
                return Err(ModelError::InvalidParameter("the generic vector model has no forward model".to_string()))
            }
        })
    }
}

/// extracts one named feature from encoded models, e.g. to map a volume of fitted tensors to FA
#[derive(Debug, Clone)]
pub struct ModelFeature {
    kind: ModelType,
    name: String,
    dim_in: usize,
    dim_out: usize,
}

impl ModelFeature {
    pub fn new(kind: ModelType, encoding_size: usize, name: &str) -> Result<Self> {
        let dim_out = kind.decode(&vec![0.0; encoding_size])?.feature(name)?.len();
        Ok(Self { kind, name: name.to_string(), dim_in: encoding_size, dim_out })
    }
}

impl VectFunction for ModelFeature {
    fn dim_in(&self) -> usize {
        self.dim_in
    }

    fn dim_out(&self) -> usize {
        self.dim_out
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        match self.kind.decode(input).and_then(|m| m.feature(&self.name)) {
            Ok(values) => output.iter_mut().zip(values).for_each(|(o, v)| *o = v),
            Err(_) => output.fill(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kurtosis::KURTOSIS_DIM;
    use approx::assert_abs_diff_eq;

    #[test]
    fn model_names_parse() {
        for kind in ModelType::ALL {
            assert_eq!(kind.name().parse::<ModelType>().unwrap(), kind);
        }
        assert_eq!("DTI".parse::<ModelType>().unwrap(), ModelType::Tensor);
        assert!(matches!("nope".parse::<ModelType>(), Err(ModelError::UnknownModel(_))));
    }

    #[test]
    fn unknown_feature_fails() {
        let model = ModelType::Tensor.decode(&[1.0, 1e-3, 0.0, 1e-3, 0.0, 0.0, 1e-3, 0.0]).unwrap();
        assert_eq!(model.feature("FA").unwrap(), vec![0.0]);
        assert!(matches!(model.feature("bogus"), Err(ModelError::UnknownFeature { .. })));
    }

    #[test]
    fn feature_function_extracts_values() {
        let mut function = ModelFeature::new(ModelType::Tensor, 8, "MD").unwrap();
        assert_eq!(function.dim_out(), 1);
        let out = function.eval(&[1.0, 2e-3, 0.0, 2e-3, 0.0, 0.0, 2e-3, 0.0]);
        assert!((out[0] - 2e-3).abs() < 1e-15);
        assert!(ModelFeature::new(ModelType::Tensor, 8, "bogus").is_err());
        assert!(ModelFeature::new(ModelType::Tensor, 5, "MD").is_err());
    }

    #[test]
    fn distance_requires_same_kind() {
        let a = ModelType::ExpDecay.decode(&[1.0, 2.0]).unwrap();
        let b = ModelType::Vect.decode(&[1.0, 2.0]).unwrap();
        assert!(matches!(a.distance(&b), Err(ModelError::ModelMismatch(..))));
        assert_eq!(a.distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn wrong_encoding_size_fails() {
        assert!(matches!(
            ModelType::Tensor.decode(&[0.0; 5]),
            Err(ModelError::InvalidEncodingSize { model: "tensor", size: 5 })
        ));
        assert!(ModelType::Fibers.decode(&[0.0; 9]).is_err());
    }

    #[test]
    fn canonical_encodings_round_trip() {
        let kurtosis: Vec<f64> = (0..KURTOSIS_DIM).map(|i| 1.0 + 0.01 * i as f64).collect();
        let cases: Vec<(ModelType, Vec<f64>)> = vec![
            (ModelType::ExpDecay, vec![1.0, 1e-3]),
            (ModelType::BiExpDecay, vec![1.0, 0.3, 1e-3, 3e-3]),
            (ModelType::Tensor, vec![1.0, 1.7e-3, 0.0, 0.4e-3, 0.0, 0.0, 0.2e-3, 0.1]),
            (
                ModelType::BiTensor,
                vec![1.0, 0.05, 0.6, 1.7e-3, 0.0, 0.4e-3, 0.0, 0.0, 0.2e-3, 3e-3, 0.0, 3e-3, 0.0, 0.0, 3e-3],
            ),
            (ModelType::Kurtosis, kurtosis),
            (ModelType::Fibers, vec![1.0, 1e-3, 0.6, 0.1, 1.0, 1.0, 0.0, 0.0, 0.3, 0.2, 2.0, 0.0, 0.0, 1.0]),
            (ModelType::Noddi, vec![1.0, 0.5, 0.1, 2.0, 0.0, 0.6, 0.8, 0.2]),
            (ModelType::Mcsmt, vec![1.0, 0.6, 1.7e-3, 0.05]),
            (ModelType::Spharm, vec![1.0, 0.1, -0.2, 0.3, 0.05, -0.05]),
            (ModelType::Vect, vec![1.0, 2.0, 3.0]),
        ];
        assert_eq!(cases.len(), ModelType::ALL.len());
        for (kind, encoding) in cases {
            let model = kind.decode(&encoding).unwrap();
            assert_eq!(model.kind(), kind);
            let back = model.encode();
            assert_eq!(back.len(), encoding.len(), "{kind}");
            for (a, b) in back.iter().zip(&encoding) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn every_model_lists_resolvable_features() {
        let models = vec![
            ModelType::ExpDecay.decode(&[1.0, 1e-3]).unwrap(),
            ModelType::Tensor.decode(&[1.0, 1e-3, 0.0, 1e-3, 0.0, 0.0, 1e-3, 0.0]).unwrap(),
            Model::Fibers(Fibers::new(2)),
            Model::Noddi(Noddi::default()),
            Model::Vect(VectModel::new(vec![1.0, 2.0, 3.0])),
        ];
        for model in models {
            for name in model.feature_names() {
                assert!(model.feature(&name).is_ok(), "{} feature {}", model.kind(), name);
            }
        }
    }

    #[test]
    fn synth_matches_gradient_count() {
        let g = Gradients::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![0.0, 1000.0, 1000.0]).unwrap();
        let params = SynthParams::default();
        let model = Model::Fibers(Fibers::new(1));
        let mut synth = model.synth(&g, &params).unwrap();
        assert_eq!(synth.dim_in(), model.encoding_size());
        assert_eq!(synth.dim_out(), 3);
        assert!(Model::Vect(VectModel::new(vec![1.0])).synth(&g, &params).is_err());
    }
}
