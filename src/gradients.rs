use crate::error::{ModelError, Result};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

/// values with a magnitude below this are treated as zero
pub const DELTA: f64 = 1e-6;

/// a diffusion gradient scheme: one (b-value, b-vector) pair per measurement. Non-zero b-vectors
/// are stored at unit length and every entry is classified once as either a baseline or a
/// diffusion-weighted measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GradientTable", into = "GradientTable")]
pub struct Gradients {
    bvecs: Vec<[f64; 3]>,
    bvals: Vec<f64>,
    baselines: Vec<usize>,
    dvecs: Vec<usize>,
}

/// raw interchange form of a gradient scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientTable {
    pub bvecs: Vec<[f64; 3]>,
    pub bvals: Vec<f64>,
}

impl TryFrom<GradientTable> for Gradients {
    type Error = ModelError;
    fn try_from(table: GradientTable) -> Result<Self> {
        Gradients::new(table.bvecs, table.bvals)
    }
}

impl From<Gradients> for GradientTable {
    fn from(g: Gradients) -> Self {
        GradientTable { bvecs: g.bvecs, bvals: g.bvals }
    }
}

impl Gradients {
    pub fn new(bvecs: Vec<[f64; 3]>, bvals: Vec<f64>) -> Result<Self> {
        if bvecs.is_empty() {
            return Err(ModelError::InvalidGradients("empty gradient table".to_string()));
        }
        if bvecs.len() != bvals.len() {
            return Err(ModelError::DimensionMismatch {
                what: "b-value count",
                expected: bvecs.len(),
                found: bvals.len(),
            });
        }

        let bvecs = bvecs.into_iter().map(|v| normalize_or_zero(&v)).collect::<Vec<_>>();

        // scanners sometimes report a small non-zero baseline b-value, so anything below one
        // percent of the largest b-value counts as a baseline
        let max_bval = bvals.iter().cloned().fold(0.0, f64::max);
        let thresh = 0.01 * max_bval;

        let mut baselines = vec![];
        let mut dvecs = vec![];
        for (i, (v, &b)) in bvecs.iter().zip(&bvals).enumerate() {
            if b.abs() < DELTA || norm(v) < DELTA || b < thresh {
                baselines.push(i);
            } else {
                dvecs.push(i);
            }
        }

        Ok(Self { bvecs, bvals, baselines, dvecs })
    }

    /// a scheme with the same b-value for every direction
    pub fn with_bval(bvecs: Vec<[f64; 3]>, bval: f64) -> Result<Self> {
        let bvals = vec![bval; bvecs.len()];
        Self::new(bvecs, bvals)
    }

    /// load a scheme from FSL-style bvecs and bvals text files
    pub fn read(bvecs_file: impl AsRef<Path>, bvals_file: impl AsRef<Path>) -> Result<Self> {
        let bvals = read_bvals(bvals_file)?;
        let bvecs = read_bvecs(bvecs_file, Some(bvals.len()))?;
        info!("using b-values with length {}", bvals.len());
        info!("found {} b-vectors", bvecs.len());
        Self::new(bvecs, bvals)
    }

    pub fn size(&self) -> usize {
        self.bvals.len()
    }

    pub fn bval(&self, idx: usize) -> f64 {
        self.bvals[idx]
    }

    pub fn bvec(&self, idx: usize) -> [f64; 3] {
        self.bvecs[idx]
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn baseline_idx(&self) -> &[usize] {
        &self.baselines
    }

    pub fn dvec_idx(&self) -> &[usize] {
        &self.dvecs
    }

    pub fn is_baseline(&self, idx: usize) -> bool {
        self.baselines.binary_search(&idx).is_ok()
    }

    pub fn num_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn num_dvecs(&self) -> usize {
        self.dvecs.len()
    }

    /// b-vectors of the diffusion-weighted measurements
    pub fn dvecs(&self) -> Vec<[f64; 3]> {
        self.dvecs.iter().map(|&i| self.bvecs[i]).collect()
    }

    /// unique rounded b-values in ascending order
    pub fn shells(&self, include_baseline: bool) -> Vec<i64> {
        let mut shells = vec![];
        for &b in &self.bvals {
            let shell = b.round() as i64;
            if !include_baseline && shell == 0 {
                continue;
            }
            if !shells.contains(&shell) {
                shells.push(shell);
            }
        }
        shells.sort();
        shells
    }

    /// indices of measurements whose rounded b-value equals the shell
    pub fn shell_idx(&self, shell: i64) -> Vec<usize> {
        self.bvals.iter().enumerate().filter(|(_, &b)| b.round() as i64 == shell).map(|(i, _)| i).collect()
    }

    pub fn multishell(&self) -> bool {
        self.shells(false).len() > 1
    }

    /// the baseline entries of a signal
    pub fn zeros(&self, signal: &[f64]) -> Vec<f64> {
        self.baselines.iter().map(|&i| signal[i]).collect()
    }

    /// mean of the baseline entries of a signal
    pub fn zero(&self, signal: &[f64]) -> f64 {
        let zeros = self.zeros(signal);
        if zeros.is_empty() {
            return 0.0;
        }
        zeros.iter().sum::<f64>() / zeros.len() as f64
    }

    /// signal attenuation relative to the mean baseline
    pub fn norm(&self, signal: &[f64]) -> Vec<f64> {
        let base = self.zero(signal);
        signal.iter().map(|&s| if base.abs() < DELTA { 0.0 } else { s / base }).collect()
    }

    /// diffusion-weighted entries only, relative to the mean baseline
    pub fn dnorm(&self, signal: &[f64]) -> Vec<f64> {
        let base = self.zero(signal);
        let scale = if base.abs() < DELTA { 0.0 } else { 1.0 / base };
        self.dvecs.iter().map(|&i| scale * signal[i]).collect()
    }

    /// apparent diffusion coefficient per measurement. Baselines and non-positive attenuations
    /// give zero
    pub fn adc(&self, signal: &[f64]) -> Vec<f64> {
        self.norm(signal)
            .iter()
            .zip(&self.bvals)
            .map(|(&a, &b)| if a > 0.0 && b > DELTA { -a.ln() / b } else { 0.0 })
            .collect()
    }

    /// a new scheme made of the given measurements
    pub fn subset(&self, which: &[usize]) -> Result<Self> {
        let bvecs = which.iter().map(|&i| self.bvecs[i]).collect();
        let bvals = which.iter().map(|&i| self.bvals[i]).collect();
        Self::new(bvecs, bvals)
    }

    /// flip one b-vector component (0, 1 or 2)
    pub fn flip(&self, axis: usize) -> Result<Self> {
        if axis > 2 {
            return Err(ModelError::InvalidParameter(format!("flip axis must be 0, 1 or 2, found {axis}")));
        }
        let mut out = self.clone();
        out.bvecs.iter_mut().for_each(|v| v[axis] = -v[axis]);
        Ok(out)
    }

    /// apply a linear transform to every b-vector. Directions are renormalized afterwards
    pub fn transform(&self, matrix: &Matrix3<f64>) -> Result<Self> {
        let bvecs = self
            .bvecs
            .iter()
            .map(|v| {
                let r = matrix * nalgebra::Vector3::new(v[0], v[1], v[2]);
                [r[0], r[1], r[2]]
            })
            .collect();
        Self::new(bvecs, self.bvals.clone())
    }
}

pub fn norm(v: &[f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn normalize_or_zero(v: &[f64; 3]) -> [f64; 3] {
    let n = norm(v);
    if n < DELTA {
        [0.0, 0.0, 0.0]
    } else {
        [v[0] / n, v[1] / n, v[2] / n]
    }
}

fn read_values(txt_file: impl AsRef<Path>) -> Result<(Vec<f64>, usize)> {
    let mut s = String::new();
    let mut f = File::open(txt_file)?;
    f.read_to_string(&mut s)?;
    let rows = s.lines().filter(|l| !l.trim().is_empty()).count();
    let values = s
        .split_ascii_whitespace()
        .map(|v| v.parse::<f64>().map_err(|_| ModelError::InvalidGradients(format!("failed to parse value: {v}"))))
        .collect::<Result<Vec<f64>>>()?;
    Ok((values, rows))
}

/// read b-values from a text file with whitespace delimiter (one row or one column)
pub fn read_bvals(txt_file: impl AsRef<Path>) -> Result<Vec<f64>> {
    let (values, _) = read_values(txt_file)?;
    if values.is_empty() {
        return Err(ModelError::InvalidGradients("no b-values found".to_string()));
    }
    Ok(values)
}

/// read b-vectors from a text file with whitespace delimiter. Both the 3 x n (FSL) and the n x 3
/// layouts are accepted. When `expected` is given the vector count must match it
pub fn read_bvecs(txt_file: impl AsRef<Path>, expected: Option<usize>) -> Result<Vec<[f64; 3]>> {
    let (values, rows) = read_values(txt_file)?;
    if values.len() % 3 != 0 {
        return Err(ModelError::InvalidGradients(format!(
            "invalid number of values: {}, expected a multiple of 3",
            values.len()
        )));
    }
    let n = values.len() / 3;
    // three lines is read as 3 x n, which also settles the 3 x 3 case
    let one_per_line = rows == n && rows != 3;
    let bvecs = if one_per_line {
        values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect::<Vec<_>>()
    } else {
        (0..n).map(|i| [values[i], values[n + i], values[2 * n + i]]).collect::<Vec<_>>()
    };
    if let Some(e) = expected {
        if e != bvecs.len() {
            return Err(ModelError::DimensionMismatch { what: "b-vector count", expected: e, found: bvecs.len() });
        }
    }
    Ok(bvecs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn six_dirs() -> Gradients {
        let bvecs = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 0.0],
            [1.0, 0.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        let bvals = vec![0.0, 1000.0, 1000.0, 1000.0, 1000.0, 2000.0, 2000.0];
        Gradients::new(bvecs, bvals).unwrap()
    }

    #[test]
    fn classifies_baselines() {
        let g = six_dirs();
        assert_eq!(g.baseline_idx(), &[0]);
        assert_eq!(g.dvec_idx(), &[1, 2, 3, 4, 5, 6]);
        assert!(g.is_baseline(0));
        assert!(!g.is_baseline(3));
    }

    #[test]
    fn small_bvalue_is_baseline() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![5.0, 1000.0]).unwrap();
        assert_eq!(g.baseline_idx(), &[0]);
    }

    #[test]
    fn normalizes_vectors_except_zero() {
        let g = six_dirs();
        assert_eq!(g.bvec(0), [0.0, 0.0, 0.0]);
        assert_abs_diff_eq!(norm(&g.bvec(4)), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn shells_are_sorted_and_unique() {
        let g = six_dirs();
        assert_eq!(g.shells(false), vec![1000, 2000]);
        assert_eq!(g.shells(true), vec![0, 1000, 2000]);
        assert_eq!(g.shell_idx(2000), vec![5, 6]);
        assert!(g.multishell());
    }

    #[test]
    fn signal_helpers() {
        let g = six_dirs();
        let signal = [100.0, 50.0, 50.0, 50.0, 50.0, 25.0, 25.0];
        assert_abs_diff_eq!(g.zero(&signal), 100.0);
        assert_abs_diff_eq!(g.norm(&signal)[1], 0.5);
        assert_eq!(g.dnorm(&signal).len(), 6);
        assert_abs_diff_eq!(g.adc(&signal)[1], -(0.5f64).ln() / 1000.0, epsilon = 1e-12);
        assert_eq!(g.adc(&signal)[0], 0.0);
    }

    #[test]
    fn flip_negates_one_axis() {
        let g = six_dirs();
        let flipped = g.flip(1).unwrap();
        assert_eq!(flipped.bvec(2), [0.0, -1.0, 0.0]);
        assert_eq!(flipped.bvec(3), [0.0, 0.0, 1.0]);
        assert_eq!(flipped.bvec(0), [0.0, 0.0, 0.0]);
        assert_eq!(flipped.bvals(), g.bvals());
        assert!(matches!(g.flip(3), Err(ModelError::InvalidParameter(_))));
    }

    #[test]
    fn mismatched_lengths_fail() {
        assert!(Gradients::new(vec![[1.0, 0.0, 0.0]], vec![0.0, 1.0]).is_err());
        assert!(Gradients::new(vec![], vec![]).is_err());
    }

    #[test]
    fn reads_fsl_layout() {
        let dir = std::env::temp_dir().join("dwi_models_gradients_test");
        std::fs::create_dir_all(&dir).unwrap();
        let bvecs = dir.join("bvecs");
        let bvals = dir.join("bvals");
        std::fs::write(&bvecs, "0 1 0 0\n0 0 1 0\n0 0 0 1\n").unwrap();
        std::fs::write(&bvals, "0 1000 1000 1000\n").unwrap();
        let g = Gradients::read(&bvecs, &bvals).unwrap();
        assert_eq!(g.size(), 4);
        assert_eq!(g.bvec(2), [0.0, 1.0, 0.0]);
        assert_eq!(g.num_baselines(), 1);
    }

    #[test]
    fn reads_row_layout() {
        let dir = std::env::temp_dir().join("dwi_models_gradients_rows_test");
        std::fs::create_dir_all(&dir).unwrap();
        let bvecs = dir.join("bvecs");
        std::fs::write(&bvecs, "0 0 0\n1 0 0\n0 1 0\n0 0 1\n").unwrap();
        let v = read_bvecs(&bvecs, Some(4)).unwrap();
        assert_eq!(v[1], [1.0, 0.0, 0.0]);
        assert_eq!(v[3], [0.0, 0.0, 1.0]);
    }
}
