use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use statrs::function::erf::erf;
use std::f64::consts::PI;

feature_enum!(McsmtFeature, "mcsmt", {
    Base => "base",
    Frac => "frac",
    Diff => "diff",
    Dot => "dot",
});

/// sqrt(pi) erf(x) / (2 x), the spherical mean of a stick response. Non-finite values,
/// including the 0/0 at x = 0, contribute nothing
fn erf_ratio(x: f64) -> f64 {
    let out = PI.sqrt() * erf(x) / (2.0 * x);
    if out.is_finite() {
        out
    } else {
        0.0
    }
}

/// multi-compartment spherical mean: an intra-neurite stick and an extra-neurite zeppelin
/// with tortuous radial diffusivity, plus a non-decaying dot compartment
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mcsmt {
    pub base: f64,
    pub frac: f64,
    pub diff: f64,
    pub dot: f64,
}

impl Mcsmt {
    pub fn new(base: f64, frac: f64, diff: f64, dot: f64) -> Self {
        Self { base, frac, diff, dot }
    }

    pub fn baseline(&self) -> f64 {
        self.base
    }

    /// intra-neurite spherical mean at one b-value, without the volume fraction
    fn stick(&self, b: f64) -> f64 {
        erf_ratio((b * self.diff).sqrt())
    }

    /// extra-neurite spherical mean at one b-value, without the volume fraction
    fn zeppelin(&self, b: f64) -> f64 {
        let dext = (1.0 - self.frac) * self.diff;
        (-b * dext).exp() * erf_ratio((b * (self.diff - dext)).sqrt())
    }

    /// spherical mean signal of a shell
    pub fn eval(&self, b: f64) -> f64 {
        if self.base.abs() < DELTA {
            return self.base;
        }
        let intra = self.frac * self.stick(b);
        let extra = (1.0 - self.frac) * self.zeppelin(b);
        self.base * (self.dot + (1.0 - self.dot) * (intra + extra))
    }

    /// the intra-neurite part of the spherical mean
    pub fn eval_intrinsic(&self, b: f64) -> f64 {
        if self.base.abs() < DELTA {
            return self.base;
        }
        self.base * self.frac * self.stick(b)
    }

    /// the extra-neurite part of the spherical mean, zero for baselines
    pub fn eval_extrinsic(&self, b: f64) -> f64 {
        if self.base.abs() < DELTA || b.abs() < DELTA {
            return 0.0;
        }
        self.base * (1.0 - self.frac) * self.zeppelin(b)
    }

    pub fn synth_shells(&self, shells: &[f64]) -> Vec<f64> {
        shells.iter().map(|&b| self.eval(b)).collect()
    }
}

impl SignalModel for Mcsmt {
    const NAME: &'static str = "mcsmt";
    type Feature = McsmtFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        match encoding {
            [base, frac, diff, dot] => Ok(Self::new(*base, *frac, *diff, *dot)),
            _ => Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: encoding.len() }),
        }
    }

    fn encoding_size(&self) -> usize {
        4
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[0] = self.base;
        encoding[1] = self.frac;
        encoding[2] = self.diff;
        encoding[3] = self.dot;
    }

    fn features(&self) -> Vec<McsmtFeature> {
        McsmtFeature::ALL.to_vec()
    }

    fn feature(&self, feature: McsmtFeature) -> Vec<f64> {
        let v = match feature {
            McsmtFeature::Base => self.base,
            McsmtFeature::Frac => self.frac,
            McsmtFeature::Diff => self.diff,
            McsmtFeature::Dot => self.dot,
        };
        vec![v]
    }

    fn distance(&self, other: &Self) -> f64 {
        let dfrac = self.frac - other.frac;
        let ddiff = self.diff - other.diff;
        (dfrac * dfrac + ddiff * ddiff).sqrt()
    }
}

/// spherical mean signal predicted at the b-value of every measurement
#[derive(Debug, Clone)]
pub struct McsmtSynth {
    bvals: Vec<f64>,
}

impl McsmtSynth {
    pub fn new(gradients: &Gradients) -> Self {
        Self::from_shells(gradients.bvals())
    }

    pub fn from_shells(bvals: &[f64]) -> Self {
        Self { bvals: bvals.to_vec() }
    }
}

impl VectFunction for McsmtSynth {
    fn dim_in(&self) -> usize {
        4
    }

    fn dim_out(&self) -> usize {
        self.bvals.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        let model = Mcsmt::new(input[0], input[1], input[2], input[3]);
        output.iter_mut().zip(&self.bvals).for_each(|(o, &b)| *o = model.eval(b));
    }
}
