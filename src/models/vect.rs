use crate::error::{ModelError, Result};
use crate::models::SignalModel;

feature_enum!(VectFeature, "vect", {
    Size => "size",
    Sum => "sum",
    Min => "min",
    Max => "max",
    Mean => "mean",
});

/// an arbitrary vector of values treated as a model
#[derive(Debug, Clone, PartialEq)]
pub struct VectModel {
    values: Vec<f64>,
}

impl VectModel {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

impl SignalModel for VectModel {
    const NAME: &'static str = "vect";
    type Feature = VectFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        if encoding.is_empty() {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size: 0 });
        }
        Ok(Self::new(encoding.to_vec()))
    }

    fn encoding_size(&self) -> usize {
        self.values.len()
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding.copy_from_slice(&self.values);
    }

    fn features(&self) -> Vec<VectFeature> {
        VectFeature::ALL.to_vec()
    }

    fn feature(&self, feature: VectFeature) -> Vec<f64> {
        let v = &self.values;
        let out = match feature {
            VectFeature::Size => v.len() as f64,
            VectFeature::Sum => v.iter().sum(),
            VectFeature::Min => v.iter().cloned().fold(f64::INFINITY, f64::min),
            VectFeature::Max => v.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            VectFeature::Mean => v.iter().sum::<f64>() / v.len().max(1) as f64,
        };
        vec![out]
    }

    /// euclidean distance, treating missing trailing entries as zero
    fn distance(&self, other: &Self) -> f64 {
        let n = self.values.len().max(other.values.len());
        (0..n)
            .map(|i| {
                let a = self.values.get(i).copied().unwrap_or(0.0);
                let b = other.values.get(i).copied().unwrap_or(0.0);
                (a - b).powi(2)
            })
            .sum::<f64>()
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_features() {
        let v = VectModel::new(vec![1.0, -2.0, 4.0]);
        assert_eq!(v.feature(VectFeature::Size), vec![3.0]);
        assert_eq!(v.feature(VectFeature::Sum), vec![3.0]);
        assert_eq!(v.feature(VectFeature::Min), vec![-2.0]);
        assert_eq!(v.feature(VectFeature::Max), vec![4.0]);
        assert_eq!(v.feature(VectFeature::Mean), vec![1.0]);
    }

    #[test]
    fn euclidean_distance() {
        let a = VectModel::new(vec![0.0, 3.0]);
        let b = VectModel::new(vec![4.0, 0.0]);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(a.encode(), vec![0.0, 3.0]);
    }
}
