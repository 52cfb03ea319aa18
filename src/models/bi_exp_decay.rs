use crate::error::{ModelError, Result};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;

feature_enum!(BiExpDecayFeature, "biexpdecay", {
    Alpha => "alpha",
    Frac => "frac",
    Beta => "beta",
    Gamma => "gamma",
    Gfrac => "gfrac",
    Bfrac => "bfrac",
});

/// y = alpha * (frac * exp(-beta * x) + (1 - frac) * exp(-gamma * x)) with beta < gamma
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiExpDecay {
    pub alpha: f64,
    pub frac: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl BiExpDecay {
    pub fn new(alpha: f64, frac: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, frac, beta, gamma }
    }

    pub fn baseline(&self) -> f64 {
        self.alpha
    }

    pub fn eval(&self, x: f64) -> f64 {
        let c1 = self.frac * (-self.beta * x).exp();
        let c2 = (1.0 - self.frac) * (-self.gamma * x).exp();
        self.alpha * (c1 + c2)
    }
}

impl SignalModel for BiExpDecay {
    const NAME: &'static str = "biexpdecay";
    type Feature = BiExpDecayFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        match encoding {
            [alpha, frac, beta, gamma] => Ok(Self::new(*alpha, *frac, *beta, *gamma)),
            _ => Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() }),
        }
    }

    fn encoding_size(&self) -> usize {
        4
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[0] = self.alpha;
        encoding[1] = self.frac;
        encoding[2] = self.beta;
        encoding[3] = self.gamma;
    }

    fn features(&self) -> Vec<BiExpDecayFeature> {
        BiExpDecayFeature::ALL.to_vec()
    }

    fn feature(&self, feature: BiExpDecayFeature) -> Vec<f64> {
        let v = match feature {
            BiExpDecayFeature::Alpha => self.alpha,
            BiExpDecayFeature::Frac | BiExpDecayFeature::Bfrac => self.frac,
            BiExpDecayFeature::Beta => self.beta,
            BiExpDecayFeature::Gamma => self.gamma,
            BiExpDecayFeature::Gfrac => 1.0 - self.frac,
        };
        vec![v]
    }

    fn distance(&self, other: &Self) -> f64 {
        let d = [self.alpha - other.alpha, self.frac - other.frac, self.beta - other.beta, self.gamma - other.gamma];
        d.iter().map(|x| x * x).sum::<f64>().sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct BiExpDecaySynth {
    varying: Vec<f64>,
}

impl BiExpDecaySynth {
    pub fn new(varying: &[f64]) -> Self {
        Self { varying: varying.to_vec() }
    }
}

impl VectFunction for BiExpDecaySynth {
    fn dim_in(&self) -> usize {
        4
    }

    fn dim_out(&self) -> usize {
        self.varying.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let model = BiExpDecay::new(input[0], input[1], input[2], input[3]);
        output.iter_mut().zip(&self.varying).for_each(|(o, &x)| *o = model.eval(x));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reduces_to_single_decay() {
        let mut synth = BiExpDecaySynth::new(&[0.0, 2.0]);
        let out = synth.eval(&[5.0, 1.0, 0.5, 10.0]);
        assert_abs_diff_eq!(out[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 5.0 * (-1.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn fractions_are_complementary() {
        let m = BiExpDecay::new(1.0, 0.3, 1.0, 2.0);
        assert_eq!(m.feature(BiExpDecayFeature::Bfrac), vec![0.3]);
        assert_abs_diff_eq!(m.feature(BiExpDecayFeature::Gfrac)[0], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = BiExpDecay::new(1.0, 0.3, 1.0, 2.0);
        let b = BiExpDecay::new(2.0, 0.5, 1.5, 2.5);
        assert_eq!(a.distance(&a), 0.0);
        assert_abs_diff_eq!(a.distance(&b), b.distance(&a), epsilon = 1e-15);
    }
}
