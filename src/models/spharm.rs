use crate::error::{ModelError, Result};
use crate::gradients::{normalize_or_zero, Gradients};
use crate::models::SignalModel;
use crate::sphere::Mesh;
use crate::volume_function::VectFunction;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::f64::consts::PI;
use tracing::info;

pub const ORDERS: [usize; 8] = [2, 4, 6, 8, 10, 12, 14, 16];
pub const DETAIL_MAX: usize = 4;
pub const DETAIL_DEFAULT: usize = 2;

// coefficient counts of the even orders 0, 2, ..., 16
const SIZES: [usize; 9] = [1, 6, 15, 28, 45, 66, 91, 120, 153];

feature_enum!(SpharmFeature, "spharm", {
    Size => "size",
    Sum => "sum",
    Min => "min",
    Max => "max",
    Mean => "mean",
});

pub fn order_for_size(size: usize) -> Result<usize> {
    SIZES
        .iter()
        .position(|&s| s == size)
        .map(|i| 2 * i)
        .ok_or(ModelError::InvalidEncodingSize { model: Spharm::NAME, size })
}

pub fn size_for_order(order: usize) -> Result<usize> {
    if order % 2 == 1 || order / 2 >= SIZES.len() {
        return Err(ModelError::InvalidParameter(format!("unsupported spherical harmonic order: {order}")));
    }
    Ok(SIZES[order / 2])
}

/// the smallest supported order at least as large as the given one
pub fn nearest_order(order: usize) -> usize {
    ORDERS.iter().copied().find(|&n| order <= n).unwrap_or(16)
}

/// (degree, order) pairs in coefficient order
pub fn indices(order: usize) -> Vec<(i64, usize)> {
    (0..=order / 2)
        .flat_map(|i| {
            let n = 2 * i;
            (-(n as i64)..=n as i64).map(move |m| (m, n))
        })
        .collect()
}

/// associated Legendre polynomial P_l^m(x) by upward recurrence in l
fn plgndr(l: usize, m: usize, x: f64) -> f64 {
    let mut pmm = 1.0;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).sqrt();
        let mut fact = 1.0;
        for _ in 1..=m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }
    if l == m {
        return pmm;
    }

    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }

    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        pll = (x * (2 * ll - 1) as f64 * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// real symmetric spherical harmonic basis of a direction. Coefficients of each even order l
/// run over m = -l..l with sine terms for negative m and cosine terms for positive m
pub fn bvect(order: usize, dir: &[f64; 3]) -> Vec<f64> {
    let dir = normalize_or_zero(dir);
    let phi = dir[1].atan2(dir[0]);
    let z = dir[2].clamp(-1.0, 1.0);

    let mut out = Vec::with_capacity((order / 2 + 1) * (order + 1));
    for l in (0..=order).step_by(2) {
        // normalization sqrt((2l + 1) / (4 pi) * (l - m)! / (l + m)!) built by running products
        let base = (2 * l + 1) as f64 / (4.0 * PI);
        let mut ratio = 1.0;
        let mut scalars = Vec::with_capacity(l + 1);
        for m in 0..=l {
            if m > 0 {
                ratio /= ((l + m) * (l - m + 1)) as f64;
            }
            let scale = if m == 0 { 1.0 } else { 2.0f64.sqrt() };
            scalars.push((base * ratio).sqrt() * scale);
        }

        let plm: Vec<f64> = (0..=l).map(|m| plgndr(l, m, z)).collect();
        for m in (1..=l).rev() {
            out.push(scalars[m] * plm[m] * (m as f64 * phi).sin());
        }
        out.push(scalars[0] * plm[0]);
        for m in 1..=l {
            out.push(scalars[m] * plm[m] * (m as f64 * phi).cos());
        }
    }
    out
}

/// basis matrix with one row per direction
pub fn bmatrix(order: usize, dirs: &[[f64; 3]]) -> Result<DMatrix<f64>> {
    let size = size_for_order(order)?;
    let mut out = DMatrix::zeros(dirs.len(), size);
    for (i, dir) in dirs.iter().enumerate() {
        for (j, v) in bvect(order, dir).into_iter().enumerate() {
            out[(i, j)] = v;
        }
    }
    Ok(out)
}

/// a spherical harmonic expansion of an antipodally symmetric spherical function
#[derive(Debug, Clone, PartialEq)]
pub struct Spharm {
    coeffs: Vec<f64>,
}

impl Spharm {
    pub fn new(order: usize) -> Result<Self> {
        Ok(Self { coeffs: vec![0.0; size_for_order(order)?] })
    }

    pub fn from_coeffs(coeffs: Vec<f64>) -> Result<Self> {
        order_for_size(coeffs.len())?;
        Ok(Self { coeffs })
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn order(&self) -> usize {
        // sizes are validated on construction
        order_for_size(self.coeffs.len()).unwrap_or(0)
    }

    /// the lowest order coefficient
    pub fn baseline(&self) -> f64 {
        self.coeffs[0]
    }

    pub fn sample(&self, dir: &[f64; 3]) -> f64 {
        bvect(self.order(), dir).iter().zip(&self.coeffs).map(|(b, c)| b * c).sum()
    }

    /// the function evaluated at the vertices of a cached mesh
    pub fn amplitudes(&self, cache: &SpharmCache, detail: usize) -> Result<Vec<f64>> {
        let matrix = cache.matrix(detail, self.order())?;
        Ok((matrix * DVector::from_column_slice(&self.coeffs)).as_slice().to_vec())
    }
}

impl SignalModel for Spharm {
    const NAME: &'static str = "spharm";
    type Feature = SpharmFeature;

    fn decode(encoding: &[f64]) -> Result<Self> {
        Self::from_coeffs(encoding.to_vec())
    }

    fn encoding_size(&self) -> usize {
        self.coeffs.len()
    }

    fn encode_into(&self, encoding: &mut [f64]) {
        encoding.copy_from_slice(&self.coeffs);
    }

    fn features(&self) -> Vec<SpharmFeature> {
        SpharmFeature::ALL.to_vec()
    }

    fn feature(&self, feature: SpharmFeature) -> Vec<f64> {
        let c = &self.coeffs;
        let out = match feature {
            SpharmFeature::Size => c.len() as f64,
            SpharmFeature::Sum => c.iter().sum(),
            SpharmFeature::Min => c.iter().cloned().fold(f64::INFINITY, f64::min),
            SpharmFeature::Max => c.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            SpharmFeature::Mean => c.iter().sum::<f64>() / c.len() as f64,
        };
        vec![out]
    }

    fn distance(&self, other: &Self) -> f64 {
        let n = self.coeffs.len().max(other.coeffs.len());
        (0..n)
            .map(|i| {
                let a = self.coeffs.get(i).copied().unwrap_or(0.0);
                let b = other.coeffs.get(i).copied().unwrap_or(0.0);
                (a - b).powi(2)
            })
            .sum::<f64>()
            .sqrt()
    }
}

/// sphere meshes of increasing detail with the basis matrices of their vertices, built once
/// and shared read-only
#[derive(Debug, Clone)]
pub struct SpharmCache {
    meshes: Vec<Mesh>,
    matrices: HashMap<(usize, usize), DMatrix<f64>>,
}

impl SpharmCache {
    /// build meshes for every detail level and basis matrices for the given orders
    pub fn new(orders: &[usize]) -> Result<Self> {
        info!("started making spharm cache");
        let mut meshes = Vec::with_capacity(DETAIL_MAX);
        let mut matrices = HashMap::new();
        for detail in 1..=DETAIL_MAX {
            let mesh = Mesh::icosphere(detail);
            for &order in orders {
                matrices.insert((detail, order), bmatrix(order, &mesh.vertices)?);
            }
            meshes.push(mesh);
        }
        info!("finished making spharm cache");
        Ok(Self { meshes, matrices })
    }

    pub fn mesh(&self, detail: usize) -> Result<&Mesh> {
        if detail == 0 || detail > self.meshes.len() {
            return Err(ModelError::InvalidParameter(format!("invalid spharm detail: {detail}")));
        }
        Ok(&self.meshes[detail - 1])
    }

    pub fn matrix(&self, detail: usize, order: usize) -> Result<&DMatrix<f64>> {
        self.matrices
            .get(&(detail, order))
            .ok_or_else(|| ModelError::InvalidParameter(format!("no spharm basis for detail {detail} and order {order}")))
    }
}

/// samples the expansion along every gradient direction
#[derive(Debug, Clone)]
pub struct SpharmSynth {
    basis: DMatrix<f64>,
}

impl SpharmSynth {
    pub fn new(order: usize, gradients: &Gradients) -> Result<Self> {
        Ok(Self { basis: bmatrix(order, gradients.bvecs())? })
    }
}

impl VectFunction for SpharmSynth {
    fn dim_in(&self) -> usize {
        self.basis.ncols()
    }

    fn dim_out(&self) -> usize {
        self.basis.nrows()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        for (i, out) in output.iter_mut().enumerate() {
            *out = self.basis.row(i).iter().zip(input).map(|(b, c)| b * c).sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sizes_follow_orders() {
        for (i, &size) in SIZES.iter().enumerate() {
            assert_eq!(order_for_size(size).unwrap(), 2 * i);
            assert_eq!(size_for_order(2 * i).unwrap(), size);
            assert_eq!(bvect(2 * i, &[0.3, -0.2, 0.9]).len(), size);
            assert_eq!(indices(2 * i).len(), size);
        }
        assert!(order_for_size(7).is_err());
        assert_eq!(Spharm::new(8).unwrap().encoding_size(), 45);
        assert!(size_for_order(3).is_err());
        assert_eq!(nearest_order(5), 6);
        assert_eq!(nearest_order(40), 16);
    }

    #[test]
    fn legendre_low_orders() {
        let x = 0.4;
        assert_abs_diff_eq!(plgndr(2, 0, x), 0.5 * (3.0 * x * x - 1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(plgndr(2, 1, x), -3.0 * x * (1.0 - x * x).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(plgndr(2, 2, x), 3.0 * (1.0 - x * x), epsilon = 1e-12);
    }

    #[test]
    fn constant_term_is_isotropic() {
        let y00 = 1.0 / (4.0 * PI).sqrt();
        let mut coeffs = vec![0.0; 15];
        coeffs[0] = 2.0 / y00;
        let model = Spharm::decode(&coeffs).unwrap();
        for dir in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.4, 0.5]] {
            assert_abs_diff_eq!(model.sample(&dir), 2.0, epsilon = 1e-12);
        }
        assert_eq!(model.baseline(), coeffs[0]);
        assert_eq!(model.order(), 4);
    }

    #[test]
    fn basis_is_antipodally_symmetric() {
        let d = [0.2, -0.5, 0.7];
        let a = bvect(6, &d);
        let b = bvect(6, &[-d[0], -d[1], -d[2]]);
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn synth_matches_sample() {
        let g = Gradients::new(vec![[0.0, 0.0, 1.0], [0.6, 0.8, 0.0]], vec![1000.0, 1000.0]).unwrap();
        let coeffs: Vec<f64> = (0..6).map(|i| 0.1 * i as f64 + 0.5).collect();
        let model = Spharm::from_coeffs(coeffs).unwrap();
        let out = SpharmSynth::new(model.order(), &g).unwrap().eval(&model.encode());
        assert_abs_diff_eq!(out[0], model.sample(&[0.0, 0.0, 1.0]), epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], model.sample(&[0.6, 0.8, 0.0]), epsilon = 1e-12);
    }

    #[test]
    fn synth_rejects_unsupported_orders() {
        let g = Gradients::new(vec![[0.0, 0.0, 1.0], [0.6, 0.8, 0.0]], vec![1000.0, 1000.0]).unwrap();
        assert!(matches!(SpharmSynth::new(18, &g), Err(ModelError::InvalidParameter(_))));
        assert!(matches!(SpharmSynth::new(3, &g), Err(ModelError::InvalidParameter(_))));
        let synth = SpharmSynth::new(16, &g).unwrap();
        assert_eq!(synth.dim_in(), size_for_order(16).unwrap());
        assert_eq!(synth.dim_out(), 2);
    }

    #[test]
    fn cache_serves_amplitudes() {
        let cache = SpharmCache::new(&[2]).unwrap();
        let model = Spharm::from_coeffs(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let amps = model.amplitudes(&cache, DETAIL_DEFAULT).unwrap();
        assert_eq!(amps.len(), cache.mesh(DETAIL_DEFAULT).unwrap().vertices.len());
        assert!(amps.iter().all(|&a| (a - amps[0]).abs() < 1e-12));
        assert!(cache.matrix(1, 4).is_err());
        assert!(cache.mesh(0).is_err());
    }
}
