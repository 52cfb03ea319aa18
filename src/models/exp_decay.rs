use crate::error::{ModelError, Result};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;

feature_enum!(ExpDecayFeature, "expdecay", {
    Alpha => "alpha",
    Beta => "beta",
});

/// y = alpha * exp(-beta * x)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpDecay {
    pub alpha: f64,
    pub beta: f64,
}

impl ExpDecay {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    pub fn baseline(&self) -> f64 {
        self.alpha
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.alpha * (-self.beta * x).exp()
    }
}

impl SignalModel for ExpDecay {
    const NAME: &'static str = "expdecay";
    type Feature = ExpDecayFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        match encoding {
            [alpha, beta] => Ok(Self::new(*alpha, *beta)),
            _ => Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() }),
        }
    }

    fn encoding_size(&self) -> usize {
        2
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[0] = self.alpha;
        encoding[1] = self.beta;
    }

    fn features(&self) -> Vec<ExpDecayFeature> {
        ExpDecayFeature::ALL.to_vec()
    }

    fn feature(&self, feature: ExpDecayFeature) -> Vec<f64> {
        match feature {
            ExpDecayFeature::Alpha => vec![self.alpha],
            ExpDecayFeature::Beta => vec![self.beta],
        }
    }

    fn distance(&self, other: &Self) -> f64 {
        ((self.alpha - other.alpha).powi(2) + (self.beta - other.beta).powi(2)).sqrt()
    }
}

/// evaluates the decay at fixed sample positions
#[derive(Debug, Clone)]
pub struct ExpDecaySynth {
    varying: Vec<f64>,
}

impl ExpDecaySynth {
    pub fn new(varying: &[f64]) -> Self {
        Self { varying: varying.to_vec() }
    }
}

impl VectFunction for ExpDecaySynth {
    fn dim_in(&self) -> usize {
        2
    }

    fn dim_out(&self) -> usize {
        self.varying.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let model = ExpDecay::new(input[0], input[1]);
        output.iter_mut().zip(&self.varying).for_each(|(o, &x)| *o = model.eval(x));
    }
}
