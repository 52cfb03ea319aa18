use crate::error::{ModelError, Result};
use crate::gradients::{dot, normalize_or_zero, Gradients, DELTA};
use crate::models::SignalModel;
use crate::volume_function::VectFunction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// angular error charged to a compartment that has no partner
const NO_MATCH_ANGLE: f64 = 45.0;

/// forward model options for ball-and-stick mixtures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FibersParams {
    /// transverse diffusivity of the sticks, relative to the axial diffusivity. Zero disables it
    pub dperp: f64,
    /// scale the isotropic diffusivity by the isotropic fraction
    pub tort: bool,
}

/// features of a fiber mixture. Per-compartment features carry a zero-based index and are named
/// with a one-based suffix, e.g. `frac1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FibersFeature {
    Base,
    Diff,
    Frac,
    Fiso,
    Line(usize),
    Rgb(usize),
    FracOf(usize),
    Stat(usize),
    Label(usize),
    Icvf(usize),
}

impl FromStr for FibersFeature {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || ModelError::UnknownFeature { model: Fibers::NAME, name: s.to_string() };
        match s {
            "base" => return Ok(FibersFeature::Base),
            "diff" => return Ok(FibersFeature::Diff),
            "frac" => return Ok(FibersFeature::Frac),
            "fiso" => return Ok(FibersFeature::Fiso),
            _ => {}
        }
        let split = s.find(|c: char| c.is_ascii_digit()).ok_or_else(unknown)?;
        let (prefix, num) = s.split_at(split);
        let idx = num.parse::<usize>().ok().filter(|&n| n > 0).ok_or_else(unknown)? - 1;
        match prefix {
            "line" => Ok(FibersFeature::Line(idx)),
            "rgb" => Ok(FibersFeature::Rgb(idx)),
            "frac" => Ok(FibersFeature::FracOf(idx)),
            "stat" => Ok(FibersFeature::Stat(idx)),
            "label" => Ok(FibersFeature::Label(idx)),
            "icvf" => Ok(FibersFeature::Icvf(idx)),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for FibersFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FibersFeature::Base => write!(f, "base"),
            FibersFeature::Diff => write!(f, "diff"),
            FibersFeature::Frac => write!(f, "frac"),
            FibersFeature::Fiso => write!(f, "fiso"),
            FibersFeature::Line(i) => write!(f, "line{}", i + 1),
            FibersFeature::Rgb(i) => write!(f, "rgb{}", i + 1),
            FibersFeature::FracOf(i) => write!(f, "frac{}", i + 1),
            FibersFeature::Stat(i) => write!(f, "stat{}", i + 1),
            FibersFeature::Label(i) => write!(f, "label{}", i + 1),
            FibersFeature::Icvf(i) => write!(f, "icvf{}", i + 1),
        }
    }
}

impl FibersFeature {
    fn index(&self) -> Option<usize> {
        match self {
            FibersFeature::Line(i)
            | FibersFeature::Rgb(i)
            | FibersFeature::FracOf(i)
            | FibersFeature::Stat(i)
            | FibersFeature::Label(i)
            | FibersFeature::Icvf(i) => Some(*i),
            _ => None,
        }
    }
}

/// a ball-and-stick mixture: a baseline, a shared diffusivity and any number of stick
/// compartments, each with a volume fraction, a unit direction, a statistic and a label. The
/// isotropic fraction is whatever the sticks leave over
#[derive(Debug, Clone, PartialEq)]
pub struct Fibers {
    pub base: f64,
    pub diff: f64,
    lines: Vec<[f64; 3]>,
    fracs: Vec<f64>,
    stats: Vec<f64>,
    labels: Vec<i64>,
}

impl Fibers {
    pub fn new(n: usize) -> Self {
        Self {
            base: 0.0,
            diff: 0.0,
            lines: vec![[1.0, 0.0, 0.0]; n],
            fracs: vec![0.0; n],
            stats: vec![0.0; n],
            labels: vec![0; n],
        }
    }

    /// whether an encoding of this length describes a mixture
    pub fn valid(size: usize) -> bool {
        size >= 2 && (size - 2) % 6 == 0
    }

    /// the number of compartments stored in an encoding of this length
    pub fn count_for_size(size: usize) -> Result<usize> {
        if !Self::valid(size) {
            return Err(ModelError::InvalidEncodingSize { model: Self::NAME, size });
        }
        Ok((size - 2) / 6)
    }

    pub fn size_for_count(comps: usize) -> usize {
        2 + 6 * comps
    }

    /// the number of compartments
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    pub fn baseline(&self) -> f64 {
        self.base
    }

    pub fn line(&self, idx: usize) -> [f64; 3] {
        self.lines[idx]
    }

    pub fn lines(&self) -> &[[f64; 3]] {
        &self.lines
    }

    pub fn frac(&self, idx: usize) -> f64 {
        self.fracs[idx]
    }

    pub fn fracs(&self) -> &[f64] {
        &self.fracs
    }

    pub fn stat(&self, idx: usize) -> f64 {
        self.stats[idx]
    }

    pub fn label(&self, idx: usize) -> i64 {
        self.labels[idx]
    }

    pub fn set_line(&mut self, idx: usize, line: [f64; 3]) {
        self.lines[idx] = line;
    }

    /// non-finite fractions are stored as zero
    pub fn set_frac(&mut self, idx: usize, frac: f64) {
        self.fracs[idx] = if frac.is_finite() { frac } else { 0.0 };
    }

    /// non-finite statistics are stored as zero
    pub fn set_stat(&mut self, idx: usize, stat: f64) {
        self.stats[idx] = if stat.is_finite() { stat } else { 0.0 };
    }

    pub fn set_label(&mut self, idx: usize, label: i64) {
        self.labels[idx] = label;
    }

    pub fn frac_sum(&self) -> f64 {
        self.fracs.iter().sum()
    }

    pub fn frac_max(&self) -> f64 {
        self.fracs.iter().cloned().fold(0.0, f64::max)
    }

    pub fn frac_iso(&self) -> f64 {
        1.0 - self.frac_sum()
    }

    pub fn set_frac_sum(&mut self, fsum: f64) {
        let current = self.frac_sum();
        self.scale(fsum / current);
    }

    pub fn scale(&mut self, factor: f64) {
        for i in 0..self.size() {
            self.set_frac(i, self.fracs[i] * factor);
        }
    }

    pub fn shift(&mut self, offset: f64) {
        for i in 0..self.size() {
            self.set_frac(i, self.fracs[i] + offset);
        }
    }

    /// zero every fraction except one
    pub fn select(&mut self, idx: usize) {
        for i in 0..self.size() {
            if i != idx {
                self.set_frac(i, 0.0);
            }
        }
    }

    /// compartment indices ordered by descending fraction
    fn order(&self) -> Vec<usize> {
        let mut idx = (0..self.size()).collect::<Vec<_>>();
        idx.sort_by(|&a, &b| self.fracs[b].total_cmp(&self.fracs[a]));
        idx
    }

    fn take(&self, order: &[usize], n: usize) -> Fibers {
        let mut out = Fibers::new(n);
        out.base = self.base;
        out.diff = self.diff;
        for (i, &src) in order.iter().take(n).enumerate() {
            out.lines[i] = self.lines[src];
            out.fracs[i] = self.fracs[src];
            out.stats[i] = self.stats[src];
            out.labels[i] = self.labels[src];
        }
        out
    }

    /// a copy with n compartments: the largest ones first, padded with empty compartments
    pub fn convert(&self, n: usize) -> Fibers {
        let mut out = self.take(&self.order(), n);
        for i in self.size()..n {
            out.lines[i] = [0.0; 3];
        }
        out
    }

    /// a copy with compartments ordered by descending fraction
    pub fn sort(&self) -> Fibers {
        self.take(&self.order(), self.size())
    }

    /// the compartments with a fraction above `min`, largest first
    pub fn crop(&self, min: f64) -> Fibers {
        let num = self.count(min);
        self.take(&self.order(), num)
    }

    /// the number of compartments with a fraction above `thresh`
    pub fn count(&self, thresh: f64) -> usize {
        self.fracs.iter().filter(|&&f| f > thresh).count()
    }

    /// a copy with the compartments above `thresh` packed to the front and the rest emptied
    pub fn thresh(&self, thresh: f64) -> Fibers {
        let kept = (0..self.size()).filter(|&i| self.fracs[i] > thresh).collect::<Vec<_>>();
        let mut out = Fibers::new(self.size());
        out.base = self.base;
        out.diff = self.diff;
        for (dst, &src) in kept.iter().enumerate() {
            out.lines[dst] = self.lines[src];
            out.fracs[dst] = self.fracs[src];
        }
        out
    }

    /// prune compartments with a non-zero fraction below `min` and hand their mass back to the
    /// survivors multiplicatively, so the total stick fraction is unchanged. Returns the number
    /// of pruned compartments
    pub fn thresh_soft(&mut self, min: f64) -> usize {
        if self.size() == 0 {
            return 0;
        }

        let fsum = self.frac_sum();
        let mut frem = 0.0;
        let mut count = 0;

        // smallest first
        let mut order = self.order();
        order.reverse();
        for j in order {
            let frac = self.fracs[j];
            if frac < min && frac.abs() > DELTA {
                frem += frac;
                self.set_frac(j, 0.0);
                count += 1;
            }
        }

        let rescale = if (fsum - frem).abs() < DELTA { 0.0 } else { fsum / (fsum - frem) };
        for i in 0..self.size() {
            self.set_frac(i, self.fracs[i] * rescale);
        }
        count
    }

    /// fraction-weighted squared sine of the angle to the nearest compartment of the other model
    pub fn dist2(&self, other: &Fibers) -> f64 {
        let mut out = 0.0;
        for (aline, &afrac) in self.lines.iter().zip(&self.fracs) {
            if afrac.abs() < DELTA {
                continue;
            }
            let nearest = other
                .lines
                .iter()
                .map(|bline| {
                    let d = dot(aline, bline);
                    1.0 - d * d
                })
                .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))));
            out += afrac * nearest.unwrap_or(0.0);
        }
        out
    }

    /// the assignment of this model's compartments to the other's (with fraction at least
    /// `thresh`) minimizing the summed line angle. The search is exhaustive over subsets and
    /// permutations, so it is only practical for a handful of compartments
    pub fn matching(&self, other: &Fibers, thresh: f64) -> HashMap<usize, usize> {
        let left_idx = (0..self.size()).collect::<Vec<_>>();
        let right_idx = (0..other.size()).filter(|&i| other.fracs[i] >= thresh).collect::<Vec<_>>();
        let size = left_idx.len().min(right_idx.len());

        let costs = self
            .lines
            .iter()
            .map(|a| other.lines.iter().map(|b| angle_line_deg(a, b)).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let orders = permutations(&right_idx);
        let mut min_dist = f64::MAX;
        let mut best: Vec<(usize, usize)> = vec![];
        for left in subsets(&left_idx, size) {
            for right in &orders {
                let dist = (0..size).map(|k| costs[left[k]][right[k]]).sum::<f64>();
                if dist < min_dist {
                    min_dist = dist;
                    best = (0..size).map(|k| (left[k], right[k])).collect();
                }
            }
        }
        best.into_iter().collect()
    }

    /// how many more compartments above `thresh` this model has than the other
    pub fn error_missing(&self, other: &Fibers, thresh: f64) -> f64 {
        self.count(thresh).saturating_sub(other.count(thresh)) as f64
    }

    /// how many more compartments above `thresh` the other model has than this one
    pub fn error_extra(&self, other: &Fibers, thresh: f64) -> f64 {
        other.count(thresh).saturating_sub(self.count(thresh)) as f64
    }

    pub fn error_frac_iso(&self, other: &Fibers) -> f64 {
        (self.frac_iso() - other.frac_iso()).abs()
    }

    /// per-compartment errors of the matched pairs. Unmatched compartments are charged `miss`
    fn matched_errors<F: Fn(usize, usize) -> f64>(&self, other: &Fibers, thresh: f64, err: F, miss: impl Fn(usize) -> f64) -> Vec<f64> {
        let matching = self.matching(other, thresh);
        (0..self.size())
            .filter(|&i| self.fracs[i] > thresh)
            .map(|i| match matching.get(&i) {
                Some(&j) => err(i, j),
                None => miss(i),
            })
            .collect()
    }

    pub fn error_frac_total(&self, other: &Fibers, thresh: f64) -> f64 {
        self.matched_errors(other, thresh, |i, j| (self.fracs[i] - other.fracs[j]).abs(), |i| self.fracs[i])
            .iter()
            .sum()
    }

    pub fn error_frac_haus(&self, other: &Fibers, thresh: f64) -> f64 {
        self.matched_errors(other, thresh, |i, j| (self.fracs[i] - other.fracs[j]).abs(), |i| self.fracs[i])
            .iter()
            .cloned()
            .fold(0.0, f64::max)
    }

    pub fn error_line_total(&self, other: &Fibers, thresh: f64) -> f64 {
        self.matched_errors(other, thresh, |i, j| angle_line_deg(&self.lines[i], &other.lines[j]), |_| NO_MATCH_ANGLE)
            .iter()
            .sum()
    }

    pub fn error_line_haus(&self, other: &Fibers, thresh: f64) -> f64 {
        self.matched_errors(other, thresh, |i, j| angle_line_deg(&self.lines[i], &other.lines[j]), |_| NO_MATCH_ANGLE)
            .iter()
            .cloned()
            .fold(0.0, f64::max)
    }

    /// predicted signal for every gradient
    pub fn synth(&self, gradients: &Gradients, params: &FibersParams) -> Vec<f64> {
        let mut out = vec![0.0; gradients.size()];
        synth_into(self.base, self.diff, &self.fracs, &self.lines, gradients, params, &mut out);
        out
    }

    /// root mean squared error between a signal and this model's prediction
    pub fn rmse(&self, signal: &[f64], gradients: &Gradients) -> f64 {
        let pred = self.synth(gradients, &FibersParams::default());
        let mse = pred.iter().zip(signal).map(|(p, s)| (p - s).powi(2)).sum::<f64>() / gradients.size() as f64;
        mse.sqrt()
    }
}

fn synth_into(
    base: f64,
    diff: f64,
    fracs: &[f64],
    lines: &[[f64; 3]],
    gradients: &Gradients,
    params: &FibersParams,
    out: &mut [f64],
) {
    let f0 = 1.0 - fracs.iter().sum::<f64>();
    let dext = if params.tort { f0 * diff } else { diff };
    for (i, o) in out.iter_mut().enumerate() {
        let b = gradients.bval(i);
        let g = gradients.bvec(i);
        let mut v = base * f0 * (-b * dext).exp();
        for (line, &frac) in lines.iter().zip(fracs) {
            let d = dot(line, &g);
            let d2 = d * d;
            let mut decay = (-b * diff * d2).exp();
            if params.dperp > 0.0 {
                decay *= (-b * 2.0 * params.dperp * diff * (1.0 - d2)).exp();
            }
            v += base * frac * decay;
        }
        *o = v;
    }
}

/// the angle in degrees between two undirected lines
pub fn angle_line_deg(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    dot(&normalize_or_zero(a), &normalize_or_zero(b)).abs().min(1.0).acos().to_degrees()
}

/// every ordering of the items
fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.is_empty() {
        return vec![vec![]];
    }
    let mut out = vec![];
    for (i, &first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

/// every subset of k items, in their original order
fn subsets(items: &[usize], k: usize) -> Vec<Vec<usize>> {
    if k == 0 {
        return vec![vec![]];
    }
    if items.len() < k {
        return vec![];
    }
    let mut out = vec![];
    for mut tail in subsets(&items[1..], k - 1) {
        tail.insert(0, items[0]);
        out.push(tail);
    }
    out.extend(subsets(&items[1..], k));
    out
}

impl SignalModel for Fibers {
    const NAME: &'static str = "fibers";
    type Feature = FibersFeature;

    /// negative fractions are clamped to zero and lines normalized. The fractions are not
    /// renormalized when they sum past one
    fn decode(encoding: &[f64]) -> Result<Self> {
        let n = Self::count_for_size(encoding.len())?;
        let mut out = Fibers::new(n);
        out.base = encoding[0];
        out.diff = encoding[1];
        for i in 0..n {
            let idx = 2 + 6 * i;
            out.fracs[i] = encoding[idx].max(0.0);
            out.stats[i] = encoding[idx + 1];
            out.labels[i] = encoding[idx + 2].round() as i64;
            out.lines[i] = normalize_or_zero(&[encoding[idx + 3], encoding[idx + 4], encoding[idx + 5]]);
        }
        Ok(out)
    }

    fn encoding_size(&self) -> usize {
        Self::size_for_count(self.size())
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding[0] = self.base;
        encoding[1] = self.diff;
        for i in 0..self.size() {
            let idx = 2 + 6 * i;
            encoding[idx] = self.fracs[i];
            encoding[idx + 1] = self.stats[i];
            encoding[idx + 2] = self.labels[i] as f64;
            encoding[idx + 3..idx + 6].copy_from_slice(&self.lines[i]);
        }
    }

    fn features(&self) -> Vec<FibersFeature> {
        let mut out = vec![FibersFeature::Base, FibersFeature::Diff, FibersFeature::Frac];
        for i in 0..self.size() {
            out.push(FibersFeature::Line(i));
            out.push(FibersFeature::Rgb(i));
            out.push(FibersFeature::FracOf(i));
            out.push(FibersFeature::Stat(i));
            out.push(FibersFeature::Label(i));
            out.push(FibersFeature::Icvf(i));
        }
        out.push(FibersFeature::Fiso);
        out
    }

    fn feature(&self, feature: FibersFeature) -> Vec<f64> {
        match feature {
            FibersFeature::Base => vec![self.base],
            FibersFeature::Diff => vec![self.diff],
            FibersFeature::Frac => vec![self.frac_sum()],
            FibersFeature::Fiso => vec![self.frac_iso()],
            FibersFeature::Line(i) => self.lines[i].to_vec(),
            FibersFeature::Rgb(i) => self.lines[i].iter().map(|v| v.abs() * self.fracs[i]).collect(),
            FibersFeature::FracOf(i) => vec![self.fracs[i]],
            FibersFeature::Stat(i) => vec![self.stats[i]],
            FibersFeature::Label(i) => vec![self.labels[i] as f64],
            FibersFeature::Icvf(i) => vec![(1.0 - self.frac_iso()) * self.fracs[i]],
        }
    }

    fn feature_by_name(&self, name: &str) -> Result<Vec<f64>> {
        let feature = name.parse::<FibersFeature>()?;
        match feature.index() {
            Some(i) if i >= self.size() => Err(ModelError::UnknownFeature { model: Self::NAME, name: name.to_string() }),
            _ => Ok(self.feature(feature)),
        }
    }

    /// fraction-weighted angular distance to the nearest compartments of the other model
    fn distance(&self, other: &Self) -> f64 {
        self.dist2(other).sqrt()
    }
}

/// forward model of mixtures with a fixed number of compartments
#[derive(Debug, Clone)]
pub struct FibersSynth {
    comps: usize,
    gradients: Gradients,
    params: FibersParams,
    fracs: Vec<f64>,
    lines: Vec<[f64; 3]>,
}

impl FibersSynth {
    pub fn new(comps: usize, gradients: &Gradients, params: &FibersParams) -> Self {
        Self {
            comps,
            gradients: gradients.clone(),
            params: *params,
            fracs: vec![0.0; comps],
            lines: vec![[0.0; 3]; comps],
        }
    }
}

impl VectFunction for FibersSynth {
    fn dim_in(&self) -> usize {
        Fibers::size_for_count(self.comps)
    }

    fn dim_out(&self) -> usize {
        self.gradients.size()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        for i in 0..self.comps {
            let idx = 2 + 6 * i;
            self.fracs[i] = input[idx].max(0.0);
            self.lines[i] = normalize_or_zero(&[input[idx + 3], input[idx + 4], input[idx + 5]]);
        }
        synth_into(input[0], input[1], &self.fracs, &self.lines, &self.gradients, &self.params, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sticks(fracs: &[f64], lines: &[[f64; 3]]) -> Fibers {
        let mut out = Fibers::new(fracs.len());
        out.base = 1.0;
        out.diff = 1e-3;
        for (i, (&f, l)) in fracs.iter().zip(lines).enumerate() {
            out.set_frac(i, f);
            out.set_line(i, normalize_or_zero(l));
        }
        out
    }

    #[test]
    fn single_stick_signal() {
        let g = Gradients::new(vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![1000.0, 1000.0]).unwrap();
        let mut model = sticks(&[1.0], &[[1.0, 0.0, 0.0]]);
        model.base = 1000.0;
        let out = model.synth(&g, &FibersParams::default());
        assert_abs_diff_eq!(out[0], 1000.0 * (-1.0f64).exp(), epsilon = 1e-9);
        assert_abs_diff_eq!(out[1], 1000.0, epsilon = 1e-9);

        let via_function = FibersSynth::new(1, &g, &FibersParams::default()).eval(&model.encode());
        assert_eq!(via_function, out);
    }

    #[test]
    fn decode_sanitizes() {
        let enc = vec![1.0, 1e-3, -0.5, 2.0, 3.0, 0.0, 0.0, 2.0];
        let model = Fibers::decode(&enc).unwrap();
        assert_eq!(model.frac(0), 0.0);
        assert_eq!(model.label(0), 3);
        assert_eq!(model.line(0), [0.0, 0.0, 1.0]);
        assert!(Fibers::decode(&[0.0; 7]).is_err());
        assert_eq!(Fibers::count_for_size(14).unwrap(), 2);
    }

    #[test]
    fn canonical_round_trip() {
        let mut model = sticks(&[0.6, 0.3], &[[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        model.set_stat(1, 2.5);
        model.set_label(0, 4);
        let enc = model.encode();
        assert_eq!(Fibers::decode(&enc).unwrap().encode(), enc);
    }

    #[test]
    fn soft_threshold_conserves_mass() {
        let mut model = sticks(&[0.5, 0.04, 0.2, 0.03], &[[1.0, 0.0, 0.0]; 4]);
        let before = model.frac_sum();
        let removed = 0.04 + 0.03;
        let pruned = model.thresh_soft(0.05);
        assert_eq!(pruned, 2);
        assert_eq!(model.frac(1), 0.0);
        assert_eq!(model.frac(3), 0.0);
        assert_abs_diff_eq!(model.frac_sum(), before, epsilon = 1e-12);
        assert_abs_diff_eq!(model.frac(0), 0.5 * before / (before - removed), epsilon = 1e-12);
    }

    #[test]
    fn soft_threshold_of_everything_empties() {
        let mut model = sticks(&[0.01, 0.02], &[[1.0, 0.0, 0.0]; 2]);
        assert_eq!(model.thresh_soft(0.05), 2);
        assert_eq!(model.frac_sum(), 0.0);
    }

    #[test]
    fn crop_keeps_largest_first() {
        let model = sticks(&[0.1, 0.5, 0.02], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let cropped = model.crop(0.05);
        assert_eq!(cropped.size(), 2);
        assert_eq!(cropped.frac(0), 0.5);
        assert_eq!(cropped.line(0), [0.0, 1.0, 0.0]);
        assert_eq!(cropped.frac(1), 0.1);

        let sorted = model.sort();
        assert_eq!(sorted.fracs(), &[0.5, 0.1, 0.02]);
        let converted = model.convert(4);
        assert_eq!(converted.size(), 4);
        assert_eq!(converted.frac(3), 0.0);
    }

    #[test]
    fn matching_pairs_nearest_lines() {
        let left = sticks(&[0.5, 0.3], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let right = sticks(&[0.4, 0.4], &[[0.0, 1.0, 0.1], [1.0, 0.1, 0.0]]);
        let m = left.matching(&right, 0.05);
        assert_eq!(m.get(&0), Some(&1));
        assert_eq!(m.get(&1), Some(&0));
        assert!(left.error_line_haus(&right, 0.05) < 10.0);
        assert_abs_diff_eq!(left.error_frac_total(&right, 0.05), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(left.error_frac_haus(&right, 0.05), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn matching_picks_the_best_subset() {
        let left = sticks(&[0.4, 0.3, 0.2], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let right = sticks(&[0.4, 0.4, 0.01], &[[0.0, 0.1, 1.0], [1.0, 0.0, 0.1], [0.0, 1.0, 0.0]]);
        let m = left.matching(&right, 0.05);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(&0), Some(&1));
        assert_eq!(m.get(&2), Some(&0));
        assert_eq!(m.get(&1), None);
    }

    #[test]
    fn unmatched_compartments_are_charged() {
        let left = sticks(&[0.5, 0.3], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let right = sticks(&[0.5], &[[1.0, 0.0, 0.0]]);
        assert_eq!(left.error_missing(&right, 0.05), 1.0);
        assert_eq!(left.error_extra(&right, 0.05), 0.0);
        assert_abs_diff_eq!(left.error_line_total(&right, 0.05), NO_MATCH_ANGLE, epsilon = 1e-9);
        assert_abs_diff_eq!(left.error_frac_total(&right, 0.05), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(left.error_frac_iso(&right), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn feature_names() {
        let model = sticks(&[0.6, 0.3], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(model.feature_by_name("frac2").unwrap(), vec![0.3]);
        assert_abs_diff_eq!(model.feature_by_name("fiso").unwrap()[0], 0.1, epsilon = 1e-12);
        assert_eq!(model.feature_by_name("line1").unwrap(), vec![1.0, 0.0, 0.0]);
        assert!(model.feature_by_name("frac3").is_err());
        assert!(model.feature_by_name("frac0").is_err());
        assert!(model.feature_by_name("width1").is_err());
        assert_eq!(FibersFeature::Stat(1).to_string(), "stat2");
    }

    #[test]
    fn distance_to_self_is_zero() {
        let model = sticks(&[0.6, 0.3], &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_abs_diff_eq!(model.distance(&model), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn combinatorics() {
        assert_eq!(permutations(&[1, 2, 3]).len(), 6);
        assert_eq!(subsets(&[0, 1, 2, 3], 2).len(), 6);
        assert_eq!(subsets(&[0, 1], 0), vec![Vec::<usize>::new()]);
    }
}
