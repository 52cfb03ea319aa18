use crate::error::{ModelError, Result};
use crate::gradients::{Gradients, DELTA};
use crate::models::utils::Stats;
use crate::volume::{Mask, Volume};
use crate::volume_function::{VectFunction, VolumeFunction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeParams {
    /// divide by the group baseline instead of rescaling to the total baseline
    pub unit: bool,
    /// rescale so the masked baseline mean of the volume becomes this value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    /// a group label per measurement. Each measurement is normalized by the baselines of its
    /// own group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouping: Option<Vec<i64>>,
}

/// parse a comma separated list of group labels
pub fn parse_grouping(text: &str) -> Result<Vec<i64>> {
    text.split(',')
        .map(|t| {
            t.trim()
                .parse::<i64>()
                .map_err(|e| ModelError::InvalidParameter(format!("invalid group label \"{t}\": {e}")))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Normalize {
    baselines: Vec<usize>,
    groups: Vec<i64>,
    unit: bool,
    /// target and detected volume baseline means
    rescale: Option<(f64, f64)>,
    sums: HashMap<i64, (f64, usize)>,
}

impl Normalize {
    pub fn new(gradients: &Gradients, params: &NormalizeParams, detected_mean: Option<f64>) -> Result<Self> {
        let groups = params.grouping.clone().unwrap_or_else(|| vec![1; gradients.size()]);
        if groups.len() != gradients.size() {
            return Err(ModelError::DimensionMismatch { what: "grouping length", expected: gradients.size(), found: groups.len() });
        }
        for g in &groups {
            if !gradients.baseline_idx().iter().any(|&b| groups[b] == *g) {
                return Err(ModelError::InvalidParameter(format!("no baseline found for group {g}")));
            }
        }

        let rescale = match (params.mean, detected_mean) {
            (Some(target), Some(detected)) => Some((target, detected)),
            (Some(_), None) => {
                return Err(ModelError::InvalidParameter("rescaling needs the volume baseline mean".to_string()))
            }
            _ => None,
        };

        Ok(Self { baselines: gradients.baseline_idx().to_vec(), groups, unit: params.unit, rescale, sums: HashMap::new() })
    }
}

impl VectFunction for Normalize {
    fn dim_in(&self) -> usize {
        self.groups.len()
    }

    fn dim_out(&self) -> usize {
        self.groups.len()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.sums.clear();
        let mut total = 0.0;
        for &idx in &self.baselines {
            let entry = self.sums.entry(self.groups[idx]).or_insert((0.0, 0));
            entry.0 += input[idx];
            entry.1 += 1;
            total += input[idx];
        }
        let total = total / self.baselines.len() as f64;

        for (i, (o, &value)) in output.iter_mut().zip(input).enumerate() {
            let (sum, count) = self.sums[&self.groups[i]];
            let base = sum / count as f64;
            let base = if base.abs() < DELTA { 1.0 } else { base };

            let mut norm = if self.unit { value / base } else { total * value / base };
            if let Some((target, detected)) = self.rescale {
                norm = target * norm / detected;
            }
            *o = norm;
        }
    }
}

/// the mean baseline value over the masked voxels of a volume
pub fn volume_baseline_mean(vol: &Volume, mask: Option<&Mask>, gradients: &Gradients) -> Result<f64> {
    vol.check_mask(mask)?;
    let values: Vec<f64> = (0..vol.size())
        .filter(|&i| vol.valid(i, mask))
        .flat_map(|i| gradients.baseline_idx().iter().map(move |&b| vol.value(i, b)))
        .collect();
    let stats = Stats::from_values(&values);
    info!("detected mean baseline: {}", stats.mean);
    Ok(stats.mean)
}

pub fn normalize(
    vol: &Volume,
    mask: Option<&Mask>,
    gradients: &Gradients,
    params: &NormalizeParams,
    threads: usize,
) -> Result<Volume> {
    let detected = match params.mean {
        Some(_) => Some(volume_baseline_mean(vol, mask, gradients)?),
        None => None,
    };
    let function = Normalize::new(gradients, params, detected)?;
    VolumeFunction::new(|| function.clone(), vol).with_mask(mask).with_threads(threads).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn scheme() -> Gradients {
        Gradients::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![0.0, 1000.0, 0.0, 1000.0],
        )
        .unwrap()
    }

    #[test]
    fn unit_normalization() {
        let g = scheme();
        let params = NormalizeParams { unit: true, ..NormalizeParams::default() };
        let out = Normalize::new(&g, &params, None).unwrap().eval(&[90.0, 50.0, 110.0, 25.0]);
        assert_eq!(out, vec![0.9, 0.5, 1.1, 0.25]);
    }

    #[test]
    fn grouped_normalization() {
        let g = scheme();
        let params = NormalizeParams { grouping: Some(vec![1, 1, 2, 2]), ..NormalizeParams::default() };
        let out = Normalize::new(&g, &params, None).unwrap().eval(&[80.0, 40.0, 120.0, 60.0]);
        // each group is brought to the total baseline mean of 100
        assert_abs_diff_eq!(out[0], 100.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[2], 100.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[3], 50.0, epsilon = 1e-12);
    }

    #[test]
    fn group_without_baseline_fails() {
        let g = scheme();
        let params = NormalizeParams { grouping: Some(vec![1, 2, 1, 1]), ..NormalizeParams::default() };
        assert!(Normalize::new(&g, &params, None).is_err());
        assert_eq!(parse_grouping("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_grouping("1,x").is_err());
    }

    #[test]
    fn rescales_to_target_mean() {
        let g = scheme();
        let vol = Volume::from_vec([2, 1, 1], 4, vec![100.0, 50.0, 100.0, 50.0, 300.0, 150.0, 300.0, 150.0]).unwrap();
        let params = NormalizeParams { mean: Some(1000.0), ..NormalizeParams::default() };
        let out = normalize(&vol, None, &g, &params, 1).unwrap();
        assert_abs_diff_eq!(out.value(0, 0), 500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out.value(1, 1), 750.0, epsilon = 1e-9);
    }
}
