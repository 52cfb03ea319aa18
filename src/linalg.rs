// Small dense linear algebra used by the models and conditioning modules

use crate::error::{ModelError, Result};
use crate::gradients::{cross, normalize_or_zero};
use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use tracing::warn;

const EIG_EPS: f64 = 1e-14;
const EIG_MAX_ITER: usize = 1000;
const FALLBACK_SEED: u64 = 0x5eed;

/// eigenvalues (descending) and the matching unit eigenvectors of a symmetric 3 x 3 matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eigen3 {
    pub values: [f64; 3],
    pub vectors: [[f64; 3]; 3],
}

impl Eigen3 {
    /// rebuild the matrix sum_i value_i * vec_i * vec_i^T
    pub fn matrix(&self) -> Matrix3<f64> {
        from_eigen(&self.values, &self.vectors)
    }

    /// the frame used when a decomposition cannot be computed: zero eigenvalues with an arbitrary
    /// (but reproducible) orthonormal basis
    pub fn fallback() -> Self {
        let mut rng = StdRng::seed_from_u64(FALLBACK_SEED);
        let e1 = random_unit(&mut rng);
        let e2 = perp(&e1);
        let e3 = cross(&e1, &e2);
        Self { values: [0.0; 3], vectors: [e1, e2, e3] }
    }
}

pub fn from_eigen(values: &[f64; 3], vectors: &[[f64; 3]; 3]) -> Matrix3<f64> {
    let mut m = Matrix3::zeros();
    for (val, vec) in values.iter().zip(vectors) {
        let v = Vector3::new(vec[0], vec[1], vec[2]);
        m += *val * v * v.transpose();
    }
    m
}

/// decomposes a symmetric matrix, returning None when the input is not finite or the iteration
/// does not converge
pub fn try_eig_sym3(matrix: &Matrix3<f64>) -> Option<Eigen3> {
    if matrix.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let eig = SymmetricEigen::try_new(*matrix, EIG_EPS, EIG_MAX_ITER)?;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let mut values = [0.0; 3];
    let mut vectors = [[0.0; 3]; 3];
    for (dst, &src) in order.iter().enumerate() {
        values[dst] = eig.eigenvalues[src];
        let col = eig.eigenvectors.column(src);
        vectors[dst] = normalize_or_zero(&[col[0], col[1], col[2]]);
    }
    Some(Eigen3 { values, vectors })
}

/// decomposes a symmetric matrix, substituting [Eigen3::fallback] on failure
pub fn eig_sym3(matrix: &Matrix3<f64>) -> Eigen3 {
    try_eig_sym3(matrix).unwrap_or_else(|| {
        warn!("eigendecomposition failed, using an arbitrary frame with zero eigenvalues");
        Eigen3::fallback()
    })
}

/// a unit vector perpendicular to the input
pub fn perp(v: &[f64; 3]) -> [f64; 3] {
    let e1 = normalize_or_zero(v);
    // find an arbitrary vector not parallel to e1
    let temp = if e1[0].abs() > 0.9 { [0.0, 1.0, 0.0] } else { [1.0, 0.0, 0.0] };
    normalize_or_zero(&cross(&e1, &temp))
}

/// right-handed orthonormal frame with the principal direction first
pub fn orthonormal_frame(principal_dir: &[f64; 3]) -> [[f64; 3]; 3] {
    let e1 = normalize_or_zero(principal_dir);
    let e2 = perp(&e1);
    let e3 = cross(&e1, &e2);
    [e1, e2, e3]
}

/// sample the unit sphere with 2 random variables u1 and u2 assumed to be uniformly
/// distributed on the interval [0,1)
pub fn sample_unit_sphere(u1: f64, u2: f64) -> [f64; 3] {
    let theta = 2.0 * PI * u1;
    let phi = (2.0 * u2 - 1.0).acos();
    [phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos()]
}

pub fn random_unit(rng: &mut impl Rng) -> [f64; 3] {
    sample_unit_sphere(rng.random::<f64>(), rng.random::<f64>())
}

pub fn symmetric3(xx: f64, xy: f64, xz: f64, yy: f64, yz: f64, zz: f64) -> Matrix3<f64> {
    Matrix3::new(xx, xy, xz, xy, yy, yz, xz, yz, zz)
}

/// minimum-norm least squares solution of A x = b
pub fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    a.clone()
        .svd(true, true)
        .solve(b, 1e-12)
        .map_err(|_| ModelError::SingularSystem("least squares"))
}

/// Moore-Penrose pseudo-inverse
pub fn pseudo_inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    a.clone().pseudo_inverse(1e-12).map_err(|_| ModelError::SingularSystem("pseudo-inverse"))
}

pub fn inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    a.clone().try_inverse().ok_or(ModelError::SingularSystem("matrix inverse"))
}

/// solves the square system A x = b by LU decomposition
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    a.clone().lu().solve(b).ok_or(ModelError::SingularSystem("linear solve"))
}

/// solves the ridge-regularized normal equations (A^T A + lambda I) x = A^T b
pub fn solve_regularized(a: &DMatrix<f64>, b: &DVector<f64>, lambda: f64) -> Result<DVector<f64>> {
    let n = a.ncols();
    let ata = a.transpose() * a + DMatrix::<f64>::identity(n, n) * lambda;
    let atb = a.transpose() * b;
    solve(&ata, &atb)
}

/// polynomial basis [1, x, x^2, ..., x^order]
pub fn poly(x: f64, order: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(order + 1);
    let mut v = 1.0;
    for _ in 0..=order {
        out.push(v);
        v *= x;
    }
    out
}
