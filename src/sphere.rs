//! Triangle meshes on the unit sphere: icosphere tessellation for numerical integration and
//! convex-hull triangulation of gradient directions for barycentric interpolation

use crate::error::{ModelError, Result};
use crate::gradients::{cross, dot, norm, normalize_or_zero, DELTA};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

/// barycentric coordinates of a point with respect to a face
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bary {
    pub face: usize,
    pub weights: [f64; 3],
    pub dist: f64,
}

impl Mesh {
    /// create a tessellated icosphere mesh (subdivisions = 4 gives 2562 vertices)
    pub fn icosphere(subdivisions: usize) -> Self {
        let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;

        let mut vertices: Vec<[f64; 3]> = vec![
            [-1.0, phi, 0.0], [1.0, phi, 0.0], [-1.0, -phi, 0.0], [1.0, -phi, 0.0],
            [0.0, -1.0, phi], [0.0, 1.0, phi], [0.0, -1.0, -phi], [0.0, 1.0, -phi],
            [phi, 0.0, -1.0], [phi, 0.0, 1.0], [-phi, 0.0, -1.0], [-phi, 0.0, 1.0],
        ];
        vertices.iter_mut().for_each(|v| *v = normalize_or_zero(v));

        let mut faces: Vec<[usize; 3]> = vec![
            [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
            [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
            [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
            [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
        ];

        for _ in 0..subdivisions {
            let (v, f) = subdivide(&vertices, &faces);
            vertices = v;
            faces = f;
        }

        Self { vertices, faces }
    }

    /// the area of the spherical neighborhood of each vertex. Each face is split into three
    /// kites around its corners through the edge midpoints and the centroid (all projected to
    /// the sphere) and each kite is credited to its corner
    pub fn vertex_areas(&self) -> Vec<f64> {
        let mut areas = vec![0.0; self.vertices.len()];
        let mid = |a: &[f64; 3], b: &[f64; 3]| normalize_or_zero(&[a[0] + b[0], a[1] + b[1], a[2] + b[2]]);
        for &[a, b, c] in &self.faces {
            let va = self.vertices[a];
            let vb = self.vertices[b];
            let vc = self.vertices[c];
            let vab = mid(&va, &vb);
            let vac = mid(&va, &vc);
            let vbc = mid(&vb, &vc);
            let vabc = normalize_or_zero(&[va[0] + vb[0] + vc[0], va[1] + vb[1] + vc[1], va[2] + vb[2] + vc[2]]);
            areas[a] += triangle_area(&va, &vab, &vabc) + triangle_area(&va, &vac, &vabc);
            areas[b] += triangle_area(&vb, &vab, &vabc) + triangle_area(&vb, &vbc, &vabc);
            areas[c] += triangle_area(&vc, &vac, &vabc) + triangle_area(&vc, &vbc, &vabc);
        }
        areas
    }

    /// the face closest to a point, along with the barycentric weights of the closest point on
    /// that face
    pub fn closest_face(&self, p: &[f64; 3]) -> Option<Bary> {
        let mut best: Option<Bary> = None;
        for (i, &[a, b, c]) in self.faces.iter().enumerate() {
            let w = closest_on_triangle(p, &self.vertices[a], &self.vertices[b], &self.vertices[c]);
            let q = combine(&w, &self.vertices[a], &self.vertices[b], &self.vertices[c]);
            let dist = norm(&sub(&q, p));
            if best.map_or(true, |bary| dist < bary.dist) {
                best = Some(Bary { face: i, weights: w, dist });
            }
        }
        best
    }
}

/// triangulate a set of directions on the sphere. Each direction enters the mesh twice, once
/// as itself (vertex i) and once as its antipode (vertex n + i), so vertex indices map back to
/// the input with `index % n`. Zero vectors are skipped
pub fn triangulate(dirs: &[[f64; 3]]) -> Result<Mesh> {
    let n = dirs.len();
    let mut vertices = vec![[0.0; 3]; 2 * n];
    let mut valid = vec![];
    for (i, d) in dirs.iter().enumerate() {
        if norm(d) < DELTA {
            continue;
        }
        let u = normalize_or_zero(d);
        vertices[i] = u;
        vertices[n + i] = [-u[0], -u[1], -u[2]];
        valid.push(i);
        valid.push(n + i);
    }
    let faces = hull(&vertices, &valid)?;
    Ok(Mesh { vertices, faces })
}

/// incremental convex hull of the selected points, with faces wound counter-clockwise when
/// seen from outside
pub fn hull(points: &[[f64; 3]], which: &[usize]) -> Result<Vec<[usize; 3]>> {
    let degenerate = || ModelError::InvalidParameter("cannot triangulate a degenerate point set".to_string());
    if which.len() < 4 {
        return Err(degenerate());
    }

    // initial tetrahedron from extreme points
    let p0 = which[0];
    let p1 = *which
        .iter()
        .max_by(|&&a, &&b| dist2(&points[a], &points[p0]).total_cmp(&dist2(&points[b], &points[p0])))
        .ok_or_else(degenerate)?;
    let axis = sub(&points[p1], &points[p0]);
    let p2 = *which
        .iter()
        .max_by(|&&a, &&b| {
            let da = norm(&cross(&axis, &sub(&points[a], &points[p0])));
            let db = norm(&cross(&axis, &sub(&points[b], &points[p0])));
            da.total_cmp(&db)
        })
        .ok_or_else(degenerate)?;
    let normal = cross(&axis, &sub(&points[p2], &points[p0]));
    let p3 = *which
        .iter()
        .max_by(|&&a, &&b| {
            let da = dot(&normal, &sub(&points[a], &points[p0])).abs();
            let db = dot(&normal, &sub(&points[b], &points[p0])).abs();
            da.total_cmp(&db)
        })
        .ok_or_else(degenerate)?;
    if dot(&normal, &sub(&points[p3], &points[p0])).abs() < 1e-12 {
        return Err(degenerate());
    }

    let centroid = scale(&add(&add(&points[p0], &points[p1]), &add(&points[p2], &points[p3])), 0.25);
    let mut faces: Vec<[usize; 3]> = vec![];
    for f in [[p0, p1, p2], [p0, p1, p3], [p0, p2, p3], [p1, p2, p3]] {
        faces.push(orient_outward(points, f, &centroid));
    }

    let seeds = [p0, p1, p2, p3];
    for &p in which.iter().filter(|p| !seeds.contains(p)) {
        let visible = faces
            .iter()
            .map(|f| {
                let n = face_normal(points, f);
                dot(&n, &sub(&points[p], &points[f[0]])) > 1e-12 * norm(&n).max(1e-300)
            })
            .collect::<Vec<bool>>();
        if !visible.iter().any(|&v| v) {
            continue;
        }

        let mut visible_edges = HashSet::new();
        for (f, _) in faces.iter().zip(&visible).filter(|(_, &v)| v) {
            for k in 0..3 {
                visible_edges.insert((f[k], f[(k + 1) % 3]));
            }
        }

        let mut next = Vec::with_capacity(faces.len() + 2);
        let mut horizon = vec![];
        for (f, &v) in faces.iter().zip(&visible) {
            if !v {
                next.push(*f);
                continue;
            }
            for k in 0..3 {
                let (a, b) = (f[k], f[(k + 1) % 3]);
                if !visible_edges.contains(&(b, a)) {
                    horizon.push((a, b));
                }
            }
        }
        for (a, b) in horizon {
            next.push([a, b, p]);
        }
        faces = next;
    }

    Ok(faces)
}

fn orient_outward(points: &[[f64; 3]], f: [usize; 3], inside: &[f64; 3]) -> [usize; 3] {
    let n = face_normal(points, &f);
    if dot(&n, &sub(&points[f[0]], inside)) < 0.0 {
        [f[0], f[2], f[1]]
    } else {
        f
    }
}

fn face_normal(points: &[[f64; 3]], f: &[usize; 3]) -> [f64; 3] {
    let a = points[f[0]];
    cross(&sub(&points[f[1]], &a), &sub(&points[f[2]], &a))
}

pub fn triangle_area(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> f64 {
    0.5 * norm(&cross(&sub(b, a), &sub(c, a)))
}

/// barycentric weights of the point on triangle abc closest to p
pub fn closest_on_triangle(p: &[f64; 3], a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> [f64; 3] {
    let ab = sub(b, a);
    let ac = sub(c, a);
    let ap = sub(p, a);
    let d1 = dot(&ab, &ap);
    let d2 = dot(&ac, &ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return [1.0, 0.0, 0.0];
    }

    let bp = sub(p, b);
    let d3 = dot(&ab, &bp);
    let d4 = dot(&ac, &bp);
    if d3 >= 0.0 && d4 <= d3 {
        return [0.0, 1.0, 0.0];
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return [1.0 - v, v, 0.0];
    }

    let cp = sub(p, c);
    let d5 = dot(&ab, &cp);
    let d6 = dot(&ac, &cp);
    if d6 >= 0.0 && d5 <= d6 {
        return [0.0, 0.0, 1.0];
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return [1.0 - w, 0.0, w];
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return [0.0, 1.0 - w, w];
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    [1.0 - v - w, v, w]
}

fn combine(w: &[f64; 3], a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> [f64; 3] {
    [
        w[0] * a[0] + w[1] * b[0] + w[2] * c[0],
        w[0] * a[1] + w[1] * b[1] + w[2] * c[1],
        w[0] * a[2] + w[1] * b[2] + w[2] * c[2],
    ]
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: &[f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dist2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let d = sub(a, b);
    dot(&d, &d)
}

/// split each triangle into 4 triangles through its edge midpoints
fn subdivide(vertices: &[[f64; 3]], faces: &[[usize; 3]]) -> (Vec<[f64; 3]>, Vec<[usize; 3]>) {
    let mut new_vertices: Vec<[f64; 3]> = vertices.to_vec();
    let mut edge_midpoints: HashMap<(usize, usize), usize> = HashMap::new();
    let mut new_faces: Vec<[usize; 3]> = Vec::with_capacity(faces.len() * 4);

    let mut midpoint = |i1: usize, i2: usize, verts: &mut Vec<[f64; 3]>| -> usize {
        let key = if i1 < i2 { (i1, i2) } else { (i2, i1) };
        if let Some(&idx) = edge_midpoints.get(&key) {
            return idx;
        }
        let mid = normalize_or_zero(&add(&verts[i1], &verts[i2]));
        let idx = verts.len();
        verts.push(mid);
        edge_midpoints.insert(key, idx);
        idx
    };

    for &[v0, v1, v2] in faces {
        let m01 = midpoint(v0, v1, &mut new_vertices);
        let m12 = midpoint(v1, v2, &mut new_vertices);
        let m20 = midpoint(v2, v0, &mut new_vertices);

        new_faces.push([v0, m01, m20]);
        new_faces.push([v1, m12, m01]);
        new_faces.push([v2, m20, m12]);
        new_faces.push([m01, m12, m20]);
    }

    (new_vertices, new_faces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn icosphere_counts() {
        let m0 = Mesh::icosphere(0);
        assert_eq!(m0.vertices.len(), 12);
        assert_eq!(m0.faces.len(), 20);
        let m2 = Mesh::icosphere(2);
        assert_eq!(m2.vertices.len(), 162);
        assert_eq!(m2.faces.len(), 320);
        for v in m2.vertices {
            assert_abs_diff_eq!(norm(&v), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn vertex_areas_cover_the_sphere() {
        let mesh = Mesh::icosphere(3);
        let total = mesh.vertex_areas().iter().sum::<f64>();
        // flat triangles slightly underestimate the sphere area
        assert!((total - 4.0 * PI).abs() / (4.0 * PI) < 0.01, "total area {total}");
    }

    #[test]
    fn hull_of_octahedron() {
        let dirs = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mesh = triangulate(&dirs).unwrap();
        assert_eq!(mesh.faces.len(), 8);
        for f in &mesh.faces {
            let n = face_normal(&mesh.vertices, f);
            let c = combine(&[1.0 / 3.0; 3], &mesh.vertices[f[0]], &mesh.vertices[f[1]], &mesh.vertices[f[2]]);
            assert!(dot(&n, &c) > 0.0, "faces must point outward");
        }
    }

    #[test]
    fn hull_of_icosphere_vertices() {
        let sphere = Mesh::icosphere(1);
        let which = (0..sphere.vertices.len()).collect::<Vec<_>>();
        let faces = hull(&sphere.vertices, &which).unwrap();
        // euler: F = 2V - 4 for a triangulated sphere
        assert_eq!(faces.len(), 2 * sphere.vertices.len() - 4);
    }

    #[test]
    fn barycentric_weights_at_vertex_and_center() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        let c = [0.0, 0.0, 1.0];
        let w = closest_on_triangle(&a, &a, &b, &c);
        assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-12);
        let center = normalize_or_zero(&[1.0, 1.0, 1.0]);
        let w = closest_on_triangle(&center, &a, &b, &c);
        for k in 0..3 {
            assert_abs_diff_eq!(w[k], 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn closest_face_contains_direction() {
        let dirs = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mesh = triangulate(&dirs).unwrap();
        let p = normalize_or_zero(&[1.0, 1.0, 1.0]);
        let bary = mesh.closest_face(&p).unwrap();
        let mut idx = mesh.faces[bary.face].iter().map(|v| v % 3).collect::<Vec<_>>();
        idx.sort();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_abs_diff_eq!(bary.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
}
