//! Weighted as-rigid-as-possible surface fitting.
//!
//! Given target points `y_i` with normals `n_i` and confidences `γ_i`, find
//! vertex positions `V` minimizing
//!
//! ```text
//! E(V, R) = 1/σ_E² Σ_ij w_ij ‖(v_i - v_j) - R_i (v0_i - v0_j)‖²
//!         + Σ_i γ_i (n_iᵀ (v_i - y_i))²
//! ```
//!
//! where `w_ij` are cotangent weights of the rest mesh `V0`. The data term is
//! point-to-plane, so each vertex only has to reach the plane through `y_i`
//! orthogonal to `n_i`.
//!
//! Minimization alternates two exact steps:
//!
//! 1. **Global**: with rotations fixed, `V` solves the sparse SPD system
//!    `A x = 2/σ_E² c + d` with `A = 2/σ_E² (-L ⊗ I₃) + blockdiag(γ_i n_i n_iᵀ)`,
//!    by Jacobi-preconditioned conjugate gradients warm-started at the
//!    current positions.
//! 2. **Local**: with `V` fixed, each `R_i` is the closest rotation to the
//!    weighted edge covariance `S_i = Σ_j w_ij ê_ij e_ijᵀ`, from its SVD.
//!
//! The configuration with the lowest rigidity energy is kept. Iteration stops
//! once the energy has failed to improve more than `patience` times in a row,
//! or after `max_iterations` rounds.

use nalgebra::{DVector, Matrix3, Point3, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;

use crate::error::{QctError, QctResult};
use crate::tracing_ext::log_arap_iteration;
use crate::types::Mesh;

/// Parameters of the ARAP solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArapParams {
    /// Rigidity scale σ_E. Smaller values make the surface stiffer.
    pub rigidity_sigma: f64,
    /// Non-improving rounds tolerated before stopping.
    pub patience: usize,
    /// Hard cap on local/global rounds.
    pub max_iterations: usize,
    /// Relative residual at which CG stops.
    pub cg_tolerance: f64,
    /// CG iteration cap; 0 means three times the number of unknowns.
    pub cg_max_iterations: usize,
}

impl Default for ArapParams {
    fn default() -> Self {
        Self {
            rigidity_sigma: 1.0,
            patience: 5,
            max_iterations: 100,
            cg_tolerance: 1e-10,
            cg_max_iterations: 0,
        }
    }
}

impl ArapParams {
    /// Parameters with a given rigidity scale.
    pub fn with_rigidity_sigma(rigidity_sigma: f64) -> Self {
        Self {
            rigidity_sigma,
            ..Default::default()
        }
    }
}

/// Result of one ARAP fit.
#[derive(Debug, Clone)]
pub struct ArapFit {
    /// Best vertex positions found.
    pub positions: Vec<Point3<f64>>,
    /// Rigidity energy of `positions`.
    pub energy: f64,
    /// Local/global rounds performed.
    pub iterations: usize,
    /// CG iterations summed over all rounds.
    pub cg_iterations: usize,
}

/// Cotangent Laplacian of a triangle mesh.
///
/// Off-diagonal entries are `½(cot α_ij + cot β_ij)` for the angles opposite
/// edge `ij`; each diagonal entry is the negated sum of its row, so rows sum
/// to zero.
pub fn cotangent_laplacian(
    positions: &[Point3<f64>],
    faces: &[[u32; 3]],
) -> QctResult<CsrMatrix<f64>> {
    let n = positions.len();
    let mut coo = CooMatrix::new(n, n);

    for face in faces {
        for &idx in face {
            if idx as usize >= n {
                return Err(QctError::triangle_out_of_range(idx as usize, n));
            }
        }
        for corner in 0..3 {
            let c = face[corner] as usize;
            let a = face[(corner + 1) % 3] as usize;
            let b = face[(corner + 2) % 3] as usize;
            let w = 0.5 * cotangent(&positions[c], &positions[a], &positions[b]);
            coo.push(a, b, w);
            coo.push(b, a, w);
            coo.push(a, a, -w);
            coo.push(b, b, -w);
        }
    }

    Ok(CsrMatrix::from(&coo))
}

/// Cotangent of the angle at `apex` in triangle `(apex, a, b)`.
fn cotangent(apex: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>) -> f64 {
    let u = a - apex;
    let v = b - apex;
    let cross = u.cross(&v).norm();
    if cross < 1e-12 {
        return 0.0;
    }
    u.dot(&v) / cross
}

/// Outcome of a conjugate gradient solve.
#[derive(Debug, Clone)]
pub struct CgOutcome {
    pub solution: DVector<f64>,
    pub iterations: usize,
    /// Final residual norm relative to the right-hand side.
    pub relative_residual: f64,
}

/// Sparse matrix-vector product, rows in parallel.
fn spmv(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let values: Vec<f64> = (0..a.nrows())
        .into_par_iter()
        .map(|i| {
            let row = a.row(i);
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(|(&j, &v)| v * x[j])
                .sum()
        })
        .collect();
    DVector::from_vec(values)
}

/// Jacobi-preconditioned conjugate gradients for a symmetric positive
/// (semi-)definite system, starting from `guess`.
pub fn conjugate_gradient(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    guess: DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> CgOutcome {
    let n = b.len();
    let mut diagonal = vec![1.0; n];
    for (i, row) in a.row_iter().enumerate() {
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            if i == j && v.is_finite() && v > 0.0 {
                diagonal[i] = v;
            }
        }
    }
    let inv_diag = DVector::from_iterator(n, diagonal.iter().map(|d| 1.0 / d));

    let b_norm = b.norm();
    let threshold = if b_norm > 0.0 { tolerance * b_norm } else { tolerance };
    let relative = |r: f64| if b_norm > 0.0 { r / b_norm } else { r };

    let mut x = guess;
    let mut r = b - spmv(a, &x);
    let mut residual = r.norm();
    if residual <= threshold {
        return CgOutcome {
            solution: x,
            iterations: 0,
            relative_residual: relative(residual),
        };
    }

    let mut z = r.component_mul(&inv_diag);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut iterations = 0;

    while iterations < max_iterations {
        let ap = spmv(a, &p);
        let pap = p.dot(&ap);
        if pap <= 0.0 || !pap.is_finite() {
            break;
        }
        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);
        iterations += 1;

        residual = r.norm();
        if residual <= threshold {
            break;
        }

        z = r.component_mul(&inv_diag);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p = &z + beta * &p;
    }

    CgOutcome {
        solution: x,
        iterations,
        relative_residual: relative(residual),
    }
}

/// Rotation `V Uᵀ` for a covariance `S = U Σ Vᵀ` accumulated as
/// `Σ rest · deformedᵀ`, corrected to be proper.
fn closest_rotation(s: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = s.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let v = v_t.transpose();
    let r = v * u.transpose();
    if r.determinant() >= 0.0 {
        return r;
    }
    // flip the axis of the smallest singular value
    let weakest = svd.singular_values.imin();
    let mut u = u;
    for i in 0..3 {
        u[(i, weakest)] = -u[(i, weakest)];
    }
    v * u.transpose()
}

fn flatten(positions: &[Point3<f64>]) -> DVector<f64> {
    DVector::from_iterator(
        positions.len() * 3,
        positions.iter().flat_map(|p| [p.x, p.y, p.z]),
    )
}

fn unflatten(x: &DVector<f64>) -> Vec<Point3<f64>> {
    x.as_slice()
        .chunks_exact(3)
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect()
}

/// Weighted ARAP solver bound to one rest mesh.
#[derive(Debug, Clone)]
pub struct WeightedArapSolver {
    rest: Vec<Point3<f64>>,
    laplacian: CsrMatrix<f64>,
    params: ArapParams,
}

impl WeightedArapSolver {
    /// Build a solver using `mesh` as the rest shape.
    pub fn new(mesh: &Mesh, params: ArapParams) -> QctResult<Self> {
        Self::from_parts(mesh.positions(), &mesh.faces, params)
    }

    /// Build a solver from rest positions and faces.
    pub fn from_parts(
        rest: Vec<Point3<f64>>,
        faces: &[[u32; 3]],
        params: ArapParams,
    ) -> QctResult<Self> {
        if !(params.rigidity_sigma.is_finite() && params.rigidity_sigma > 0.0) {
            return Err(QctError::invalid_input(format!(
                "rigidity sigma must be positive, got {}",
                params.rigidity_sigma
            )));
        }
        let laplacian = cotangent_laplacian(&rest, faces)?;
        Ok(Self {
            rest,
            laplacian,
            params,
        })
    }

    /// Cotangent Laplacian of the rest mesh.
    pub fn laplacian(&self) -> &CsrMatrix<f64> {
        &self.laplacian
    }

    /// Rest vertex positions.
    pub fn rest_positions(&self) -> &[Point3<f64>] {
        &self.rest
    }

    /// Solver parameters.
    pub fn params(&self) -> &ArapParams {
        &self.params
    }

    fn vertex_count(&self) -> usize {
        self.rest.len()
    }

    /// Off-diagonal neighbours of vertex `i` with their weights.
    fn neighbours(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (offsets, cols, values) = self.laplacian.csr_data();
        let row = offsets[i]..offsets[i + 1];
        cols[row.clone()]
            .iter()
            .copied()
            .zip(values[row].iter().copied())
            .filter(move |&(j, _)| j != i)
    }

    /// Rigidity energy of `positions` under per-vertex `rotations`.
    pub fn rigidity_energy(&self, positions: &[Point3<f64>], rotations: &[Matrix3<f64>]) -> f64 {
        (0..self.vertex_count())
            .into_par_iter()
            .map(|i| {
                self.neighbours(i)
                    .map(|(j, w)| {
                        let deformed = positions[i] - positions[j];
                        let rest = self.rest[i] - self.rest[j];
                        w * (deformed - rotations[i] * rest).norm_squared()
                    })
                    .sum::<f64>()
            })
            .sum()
    }

    /// Best per-vertex rotations for the given positions.
    pub fn optimal_rotations(&self, positions: &[Point3<f64>]) -> Vec<Matrix3<f64>> {
        (0..self.vertex_count())
            .into_par_iter()
            .map(|i| {
                let mut s = Matrix3::zeros();
                for (j, w) in self.neighbours(i) {
                    let rest = self.rest[i] - self.rest[j];
                    let deformed = positions[i] - positions[j];
                    s += w * rest * deformed.transpose();
                }
                closest_rotation(&s)
            })
            .collect()
    }

    /// Rotation term `c_i = Σ_j w_ij (R_i + R_j)/2 (v0_i - v0_j)`.
    fn rotation_term(&self, rotations: &[Matrix3<f64>]) -> DVector<f64> {
        let blocks: Vec<Vector3<f64>> = (0..self.vertex_count())
            .into_par_iter()
            .map(|i| {
                self.neighbours(i)
                    .map(|(j, w)| {
                        w * 0.5 * (rotations[i] + rotations[j]) * (self.rest[i] - self.rest[j])
                    })
                    .sum()
            })
            .collect();
        DVector::from_iterator(
            blocks.len() * 3,
            blocks.iter().flat_map(|b| [b.x, b.y, b.z]),
        )
    }

    /// System matrix `2/σ_E² (-L ⊗ I₃) + blockdiag(γ_i n_i n_iᵀ)`.
    fn system_matrix(&self, normals: &[Vector3<f64>], weights: &[f64]) -> CsrMatrix<f64> {
        let n = self.vertex_count();
        let k = 2.0 / (self.params.rigidity_sigma * self.params.rigidity_sigma);
        let mut coo = CooMatrix::new(3 * n, 3 * n);

        for (i, row) in self.laplacian.row_iter().enumerate() {
            for (&j, &l) in row.col_indices().iter().zip(row.values()) {
                for d in 0..3 {
                    coo.push(3 * i + d, 3 * j + d, -k * l);
                }
            }
        }
        for (i, (normal, &gamma)) in normals.iter().zip(weights).enumerate() {
            if gamma == 0.0 {
                continue;
            }
            let block = gamma * normal * normal.transpose();
            for r in 0..3 {
                for c in 0..3 {
                    coo.push(3 * i + r, 3 * i + c, block[(r, c)]);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    /// Data vector `d_i = γ_i n_i n_iᵀ y_i`.
    fn data_term(targets: &[Point3<f64>], normals: &[Vector3<f64>], weights: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            targets.len() * 3,
            targets
                .iter()
                .zip(normals)
                .zip(weights)
                .flat_map(|((y, n), &gamma)| {
                    let d = gamma * n * n.dot(&y.coords);
                    [d.x, d.y, d.z]
                }),
        )
    }

    /// Deform the rest mesh towards point-to-plane targets.
    ///
    /// Every call starts from the rest positions with identity rotations.
    pub fn fit(
        &self,
        targets: &[Point3<f64>],
        normals: &[Vector3<f64>],
        weights: &[f64],
    ) -> QctResult<ArapFit> {
        let n = self.vertex_count();
        QctError::check_len("targets", n, targets.len())?;
        QctError::check_len("normals", n, normals.len())?;
        QctError::check_len("weights", n, weights.len())?;
        if let Some(i) = weights.iter().position(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(QctError::invalid_input(format!(
                "weight of vertex {} must be finite and non-negative, got {}",
                i, weights[i]
            )));
        }

        let k = 2.0 / (self.params.rigidity_sigma * self.params.rigidity_sigma);
        let a = self.system_matrix(normals, weights);
        let d = Self::data_term(targets, normals, weights);
        let cg_cap = match self.params.cg_max_iterations {
            0 => 9 * n.max(1),
            cap => cap,
        };

        let mut positions = self.rest.clone();
        let mut rotations = vec![Matrix3::identity(); n];
        let mut best_positions = positions.clone();
        let mut best_energy = f64::INFINITY;
        let mut non_improving = 0;
        let mut iterations = 0;
        let mut cg_iterations = 0;

        while iterations < self.params.max_iterations {
            let rhs = k * self.rotation_term(&rotations) + &d;
            let outcome =
                conjugate_gradient(&a, &rhs, flatten(&positions), self.params.cg_tolerance, cg_cap);
            if outcome.solution.iter().any(|x| !x.is_finite()) {
                return Err(QctError::solver_failed(format!(
                    "conjugate gradients diverged in round {}",
                    iterations + 1
                )));
            }
            cg_iterations += outcome.iterations;
            positions = unflatten(&outcome.solution);
            rotations = self.optimal_rotations(&positions);

            let energy = self.rigidity_energy(&positions, &rotations);
            iterations += 1;
            log_arap_iteration(iterations, energy, outcome.iterations, non_improving);

            if energy < best_energy {
                best_energy = energy;
                best_positions.clone_from(&positions);
                non_improving = 0;
            } else {
                non_improving += 1;
                if non_improving > self.params.patience {
                    break;
                }
            }
        }

        Ok(ArapFit {
            positions: best_positions,
            energy: best_energy,
            iterations,
            cg_iterations,
        })
    }
}
