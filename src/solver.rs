//! Newton-CG update of one factor matrix of one block.
//!
//! A `FieldSolve` fixes everything a single field solve reads: the sparse
//! field being solved, the opposite projection `q1`, the edge residuals and
//! the squared-loss terms coming from unobserved pairs. It never mutates
//! anything; the caller applies the step it returns.

use rayon::prelude::*;

use crate::block_helpers::{row, row_mut};
use crate::consts;
use crate::feature_store::FieldMatrix;
use crate::field_pairs::{BlockKind, Side};
use crate::interactions::InteractionIndex;
use crate::linalg;
use crate::loss::{EdgeLoss, Strategy};
use crate::multithread_helpers::sum_over_rows;

/// Contribution of all (observed or not) user-item pairs under the squared loss
pub enum DenseTerm {
    Absent,
    /// Per-row gradient scalar and the curvature every row receives
    Side { grad: Vec<f64>, curvature: f64 },
    /// Per-row gradient vectors (`rows x k`) and the `k x k` curvature shared by all rows
    Cross { grad: Vec<f64>, gram: Vec<f64> },
}

pub struct FieldSolve<'a> {
    pub strategy: Strategy,
    pub side: Side,
    pub k: usize,
    pub field: &'a FieldMatrix,
    pub q1: &'a [f64],
    pub index: &'a InteractionIndex,
    pub edge_loss: EdgeLoss,
    pub dense: DenseTerm,
    // regularization weight of every factor row
    reg: Vec<f64>,
    coef: Vec<f64>,
    curv: Vec<f64>,
}

impl<'a> FieldSolve<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: Strategy,
        side: Side,
        k: usize,
        field: &'a FieldMatrix,
        reg: Vec<f64>,
        q1: &'a [f64],
        index: &'a InteractionIndex,
        edge_loss: EdgeLoss,
        dense: DenseTerm,
    ) -> FieldSolve<'a> {
        let residual = index.residual();
        let (coef, curv): (Vec<f64>, Vec<f64>) = (0..index.nnz())
            .into_par_iter()
            .map(|e| {
                let y = index.label(e);
                (edge_loss.gradient_coef(residual[e], y), edge_loss.curvature(residual[e], y))
            })
            .unzip();
        FieldSolve {
            strategy,
            side,
            k,
            field,
            q1,
            index,
            edge_loss,
            dense,
            reg,
            coef,
            curv,
        }
    }

    fn is_self_side(&self) -> bool {
        self.strategy.block_kind() == BlockKind::SelfSide
    }

    fn rows(&self) -> usize {
        self.index.adjacency(self.side).rows()
    }

    fn add_regularization(&self, v: &[f64], out: &mut [f64]) {
        let k = self.k;
        for (x, o) in out.iter_mut().enumerate() {
            *o += self.reg[x / k] * v[x];
        }
    }

    // out[idx] += scale * val * dir, for every entry of row i
    #[inline(always)]
    fn scatter(&self, i: usize, dir: &[f64], scale: f64, out: &mut [f64]) {
        for entry in self.field.row(i) {
            let dst = row_mut(out, entry.idx, self.k);
            let c = scale * entry.val;
            for (d, s) in dst.iter_mut().zip(dir.iter()) {
                *d += c * s;
            }
        }
    }

    pub fn gradient(&self, w1: &[f64]) -> Vec<f64> {
        let k = self.k;
        let adj = self.index.adjacency(self.side);
        let mut g = if self.is_self_side() {
            sum_over_rows(self.rows(), w1.len(), |i, acc| {
                if self.field.row(i).is_empty() {
                    return;
                }
                let mut z = match &self.dense {
                    DenseTerm::Side { grad, .. } => grad[i],
                    _ => 0.0,
                };
                for &e in adj.edges(i) {
                    z += self.coef[e];
                }
                if z != 0.0 {
                    self.scatter(i, row(self.q1, i, k), z, acc);
                }
            })
        } else {
            sum_over_rows(self.rows(), w1.len(), |i, acc| {
                if self.field.row(i).is_empty() {
                    return;
                }
                let mut pk = match &self.dense {
                    DenseTerm::Cross { grad, .. } => row(grad, i, k).to_vec(),
                    _ => vec![0.0; k],
                };
                for (&j, &e) in adj.partners(i).iter().zip(adj.edges(i).iter()) {
                    let c = self.coef[e];
                    for (p, q) in pk.iter_mut().zip(row(self.q1, j, k).iter()) {
                        *p += c * q;
                    }
                }
                self.scatter(i, &pk, 1.0, acc);
            })
        };
        self.add_regularization(w1, &mut g);
        g
    }

    /// Product of the block Hessian (loss curvature plus regularization) with `v`
    pub fn hessian_vector(&self, v: &[f64]) -> Vec<f64> {
        let k = self.k;
        let adj = self.index.adjacency(self.side);
        let self_side = self.is_self_side();
        let mut hv = sum_over_rows(self.rows(), v.len(), |i, acc| {
            let entries = self.field.row(i);
            if entries.is_empty() {
                return;
            }
            let mut phi = vec![0.0; k];
            for entry in entries {
                for (p, s) in phi.iter_mut().zip(row(v, entry.idx, k).iter()) {
                    *p += entry.val * s;
                }
            }
            if self_side {
                let mut d = match &self.dense {
                    DenseTerm::Side { curvature, .. } => *curvature,
                    _ => 0.0,
                };
                for &e in adj.edges(i) {
                    d += self.curv[e];
                }
                let qi = row(self.q1, i, k);
                let z = d * linalg::inner(&phi, qi);
                if z != 0.0 {
                    self.scatter(i, qi, z, acc);
                }
            } else {
                let mut out = vec![0.0; k];
                for (&j, &e) in adj.partners(i).iter().zip(adj.edges(i).iter()) {
                    let qj = row(self.q1, j, k);
                    let z = self.curv[e] * linalg::inner(&phi, qj);
                    for (o, q) in out.iter_mut().zip(qj.iter()) {
                        *o += z * q;
                    }
                }
                if let DenseTerm::Cross { gram, .. } = &self.dense {
                    for (d, o) in out.iter_mut().enumerate() {
                        *o += linalg::inner(row(gram, d, k), &phi);
                    }
                }
                self.scatter(i, &out, 1.0, acc);
            }
        });
        self.add_regularization(v, &mut hv);
        hv
    }

    /// Approximately solves `H s = -g`. Returns the step and the number of CG iterations.
    pub fn cg(&self, g: &[f64]) -> (Vec<f64>, usize) {
        let eps = self.strategy.cg_eps();
        let mut s = vec![0.0; g.len()];
        let mut r: Vec<f64> = g.iter().map(|x| -x).collect();
        let mut v = r.clone();
        let g2 = linalg::dot(g, g);
        let mut r2 = g2;
        let mut iterations = 0;
        while r2 > eps * eps * g2 && iterations < consts::CG_MAX_ITER {
            iterations += 1;
            let hv = self.hessian_vector(&v);
            let vhv = linalg::dot(&v, &hv);
            if !(vhv > consts::CG_MIN_CURVATURE) {
                log::warn!("CG stopped at iteration {}: curvature {} along search direction", iterations, vhv);
                break;
            }
            let alpha = r2 / vhv;
            linalg::axpy(alpha, &v, &mut s);
            linalg::axpy(-alpha, &hv, &mut r);
            let r2_new = linalg::dot(&r, &r);
            let beta = r2_new / r2;
            r2 = r2_new;
            linalg::scal(beta, &mut v);
            linalg::axpy(1.0, &r, &mut v);
        }
        (s, iterations)
    }

    /// Change of every edge's prediction caused by a unit step whose row projection is `xs`
    pub fn edge_deltas(&self, xs: &[f64]) -> Vec<f64> {
        let k = self.k;
        let self_side = self.is_self_side();
        (0..self.index.nnz())
            .into_par_iter()
            .map(|e| {
                let me = self.index.endpoint(e, self.side);
                let partner = if self_side {
                    me
                } else {
                    self.index.endpoint(e, self.side.opposite())
                };
                linalg::inner(row(xs, me, k), row(self.q1, partner, k))
            })
            .collect()
    }

    /// Change of every row's side bias caused by a unit step; self-side blocks only
    pub fn row_deltas(&self, xs: &[f64]) -> Vec<f64> {
        let k = self.k;
        (0..self.rows())
            .into_par_iter()
            .map(|i| linalg::inner(row(xs, i, k), row(self.q1, i, k)))
            .collect()
    }

    /// Backtracking search on the exact edge loss. Returns the accepted step
    /// size, or 0 if no tried step decreases the objective enough.
    pub fn line_search(&self, g: &[f64], s: &[f64], w1: &[f64], deltas: &[f64]) -> f64 {
        let k = self.k;
        let gs = linalg::dot(g, s);
        let mut ws = 0.0;
        let mut ss = 0.0;
        for x in 0..s.len() {
            let reg = self.reg[x / k];
            ws += reg * w1[x] * s[x];
            ss += reg * s[x] * s[x];
        }
        let residual = self.index.residual();
        let edge_loss = self.edge_loss;
        let mut theta = 1.0;
        for _ in 0..consts::LINE_SEARCH_MAX_STEPS {
            let data: f64 = (0..self.index.nnz())
                .into_par_iter()
                .map(|e| {
                    let y = self.index.label(e);
                    let prediction = residual[e] + edge_loss.offset(y);
                    edge_loss.edge_loss(prediction + theta * deltas[e], y) - edge_loss.edge_loss(prediction, y)
                })
                .sum();
            let df = data + theta * ws + 0.5 * theta * theta * ss;
            if df <= theta * consts::LINE_SEARCH_MU * gs {
                return theta;
            }
            theta *= consts::LINE_SEARCH_BETA;
        }
        log::warn!("Line search found no sufficient decrease, skipping the step");
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::utx_new;
    use crate::feature_store::{FeatureStore, Node};
    use crate::model_instance::Loss;

    fn n(fid: usize, idx: usize, val: f64) -> Node {
        Node { fid, idx, val }
    }

    fn norm(x: &[f64]) -> f64 {
        linalg::dot(x, x).sqrt()
    }

    // 3 users over one field with 2 columns, 2 items, k = 2
    fn small_setup() -> (FeatureStore, InteractionIndex, Vec<f64>) {
        let users = FeatureStore::new(
            &[vec![n(0, 0, 1.0)], vec![n(0, 1, 2.0)], vec![n(0, 0, 0.5), n(0, 1, 1.0)]],
            1,
            None,
        )
        .unwrap();
        let mut index = InteractionIndex::new(
            &[vec![(0, 1.0)], vec![(1, 1.0)], vec![(0, -1.0), (1, 1.0)]],
            2,
        );
        index.set_residual(|e, _, _| 0.1 * e as f64 - 0.15);
        let q1 = vec![0.3, -0.2, 0.1, 0.4];
        (users, index, q1)
    }

    // Explicit (D k) x (D k) Hessian of the cross block over users
    fn dense_cross_hessian(
        users: &FeatureStore,
        index: &InteractionIndex,
        q1: &[f64],
        curv: &[f64],
        gram: &[f64],
        reg: &[f64],
        k: usize,
    ) -> Vec<Vec<f64>> {
        let dk = users.dim(0) * k;
        let mut h = vec![vec![0.0; dk]; dk];
        let adj = index.adjacency(Side::User);
        for i in 0..users.m {
            let mut m_i = vec![vec![0.0; k]; k];
            for (&j, &e) in adj.partners(i).iter().zip(adj.edges(i).iter()) {
                for c in 0..k {
                    for d in 0..k {
                        m_i[c][d] += curv[e] * q1[j * k + c] * q1[j * k + d];
                    }
                }
            }
            for c in 0..k {
                for d in 0..k {
                    m_i[c][d] += gram[c * k + d];
                }
            }
            for ea in users.field(0).row(i) {
                for eb in users.field(0).row(i) {
                    for c in 0..k {
                        for d in 0..k {
                            h[ea.idx * k + c][eb.idx * k + d] += ea.val * eb.val * m_i[c][d];
                        }
                    }
                }
            }
        }
        for x in 0..dk {
            h[x][x] += reg[x / k];
        }
        h
    }

    #[test]
    fn test_cg_solves_cross_newton_system() {
        let (users, index, q1) = small_setup();
        let k = 2;
        let omega = 0.3;
        let mut gram = vec![0.0; k * k];
        linalg::gram(&q1, &q1, &mut gram, 2, k);
        linalg::scal(omega, &mut gram);
        let reg = vec![0.01, 0.02];
        let solve = FieldSolve::new(
            Strategy::SquaredCross,
            Side::User,
            k,
            users.field(0),
            reg.clone(),
            &q1,
            &index,
            EdgeLoss::new(Loss::Squared, omega, -1.0),
            DenseTerm::Cross {
                grad: vec![0.05, -0.1, 0.2, 0.0, -0.3, 0.1],
                gram: gram.clone(),
            },
        );
        let w1 = vec![0.5, -0.25, 0.125, 1.0];
        let g = solve.gradient(&w1);
        let (s, iterations) = solve.cg(&g);
        assert!(iterations >= 1 && iterations <= consts::CG_MAX_ITER);

        let curv = vec![1.0 - omega; index.nnz()];
        let h = dense_cross_hessian(&users, &index, &q1, &curv, &gram, &reg, k);
        let mut hs_g = g.clone();
        for x in 0..g.len() {
            hs_g[x] += linalg::inner(&h[x], &s);
        }
        assert!(norm(&hs_g) <= 1.01 * consts::CG_EPS_TIGHT * norm(&g));

        // Implicit product agrees with the explicit matrix
        let v = vec![1.0, -2.0, 0.5, 0.25];
        let hv = solve.hessian_vector(&v);
        for x in 0..v.len() {
            assert!((hv[x] - linalg::inner(&h[x], &v)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cg_solves_side_newton_system() {
        let (users, index, _) = small_setup();
        let k = 2;
        // self-side partner projection is indexed by the user row itself
        let q1 = vec![0.3, -0.2, 0.1, 0.4, -0.5, 0.2];
        let reg = vec![0.01, 0.01];
        let edge_loss = EdgeLoss::new(Loss::Logistic, 0.0, 0.0);
        let solve = FieldSolve::new(
            Strategy::LogisticSide,
            Side::User,
            k,
            users.field(0),
            reg.clone(),
            &q1,
            &index,
            edge_loss,
            DenseTerm::Absent,
        );
        let w1 = vec![0.1, 0.2, -0.3, 0.4];
        let g = solve.gradient(&w1);
        let (s, _) = solve.cg(&g);

        // H = sum_i d_i (x_i q_i)(x_i q_i)^T + reg
        let dk = 4;
        let mut h = vec![vec![0.0; dk]; dk];
        let adj = index.adjacency(Side::User);
        for i in 0..3 {
            let d: f64 = adj
                .edges(i)
                .iter()
                .map(|&e| edge_loss.curvature(index.residual()[e], index.label(e)))
                .sum();
            let mut u = vec![0.0; dk];
            for entry in users.field(0).row(i) {
                for c in 0..k {
                    u[entry.idx * k + c] += entry.val * q1[i * k + c];
                }
            }
            for x in 0..dk {
                for y in 0..dk {
                    h[x][y] += d * u[x] * u[y];
                }
            }
        }
        for x in 0..dk {
            h[x][x] += reg[x / k];
        }
        let mut hs_g = g.clone();
        for x in 0..dk {
            hs_g[x] += linalg::inner(&h[x], &s);
        }
        assert!(norm(&hs_g) <= 1.01 * consts::CG_EPS_TIGHT * norm(&g));
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (users, index, q1) = small_setup();
        let k = 2;
        let edge_loss = EdgeLoss::new(Loss::Logistic, 0.0, 0.0);
        let reg = vec![0.05, 0.02];
        let solve = FieldSolve::new(
            Strategy::LogisticCross,
            Side::User,
            k,
            users.field(0),
            reg.clone(),
            &q1,
            &index,
            edge_loss,
            DenseTerm::Absent,
        );
        let w1 = vec![0.2, -0.1, 0.3, 0.05];
        // objective of W1 + t around w1, with edge predictions shifted by X t . q1
        let objective = |w: &[f64]| {
            let shift: Vec<f64> = w.iter().zip(w1.iter()).map(|(a, b)| a - b).collect();
            let xs = utx_new(users.field(0), users.m, &shift, k);
            let deltas = solve.edge_deltas(&xs);
            let mut f = 0.0;
            for e in 0..index.nnz() {
                f += edge_loss.edge_loss(index.residual()[e] + deltas[e], index.label(e));
            }
            for x in 0..w.len() {
                f += 0.5 * reg[x / k] * w[x] * w[x];
            }
            f
        };
        let g = solve.gradient(&w1);
        let h = 1e-6;
        for x in 0..w1.len() {
            let mut plus = w1.clone();
            plus[x] += h;
            let mut minus = w1.clone();
            minus[x] -= h;
            let fd = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert!((fd - g[x]).abs() < 1e-7, "coordinate {}: {} vs {}", x, fd, g[x]);
        }
    }

    // Two one-hot users against a single item with q = [1, 0]; one positive and one negative edge
    fn armijo_setup(confidence: f64) -> (FeatureStore, InteractionIndex, Vec<f64>) {
        let users = FeatureStore::new(&[vec![n(0, 0, 1.0)], vec![n(0, 1, 1.0)]], 1, None).unwrap();
        let mut index = InteractionIndex::new(&[vec![(0, 1.0)], vec![(0, -1.0)]], 1);
        let labels = [1.0, -1.0];
        index.set_residual(|e, _, _| confidence * labels[e]);
        (users, index, vec![1.0, 0.0])
    }

    fn armijo_holds(solve: &FieldSolve, g: &[f64], s: &[f64], w1: &[f64], deltas: &[f64], theta: f64) -> bool {
        let mut df = 0.0;
        for e in 0..solve.index.nnz() {
            let y = solve.index.label(e);
            let res = solve.index.residual()[e];
            df += solve.edge_loss.edge_loss(res + theta * deltas[e], y) - solve.edge_loss.edge_loss(res, y);
        }
        for x in 0..s.len() {
            let reg = solve.reg[x / solve.k];
            df += 0.5 * reg * ((w1[x] + theta * s[x]).powi(2) - w1[x].powi(2));
        }
        df <= theta * consts::LINE_SEARCH_MU * linalg::dot(g, s)
    }

    #[test]
    fn test_line_search_accepts_full_newton_step() {
        let (users, index, q1) = armijo_setup(4.0);
        let solve = FieldSolve::new(
            Strategy::LogisticCross,
            Side::User,
            2,
            users.field(0),
            vec![1e-8; 2],
            &q1,
            &index,
            EdgeLoss::new(Loss::Logistic, 0.0, 0.0),
            DenseTerm::Absent,
        );
        let w1 = vec![0.0; 4];
        let g = solve.gradient(&w1);
        let (s, _) = solve.cg(&g);
        let xs = utx_new(users.field(0), users.m, &s, 2);
        let deltas = solve.edge_deltas(&xs);
        let theta = solve.line_search(&g, &s, &w1, &deltas);
        assert_eq!(theta, 1.0);
        assert!(armijo_holds(&solve, &g, &s, &w1, &deltas, theta));
    }

    #[test]
    fn test_line_search_backtracks_overshooting_step() {
        // Predictions on the wrong side: the Newton step overshoots by far
        let (users, index, q1) = armijo_setup(-4.0);
        let solve = FieldSolve::new(
            Strategy::LogisticCross,
            Side::User,
            2,
            users.field(0),
            vec![1e-8; 2],
            &q1,
            &index,
            EdgeLoss::new(Loss::Logistic, 0.0, 0.0),
            DenseTerm::Absent,
        );
        let w1 = vec![0.0; 4];
        let g = solve.gradient(&w1);
        let (s, _) = solve.cg(&g);
        let xs = utx_new(users.field(0), users.m, &s, 2);
        let deltas = solve.edge_deltas(&xs);
        let theta = solve.line_search(&g, &s, &w1, &deltas);
        assert!(theta > 0.0 && theta < 1.0);
        assert!(armijo_holds(&solve, &g, &s, &w1, &deltas, theta));
        assert!(!armijo_holds(&solve, &g, &s, &w1, &deltas, 1.0));
    }

    #[test]
    fn test_cg_stops_on_zero_curvature() {
        let users = FeatureStore::new(&[vec![n(0, 0, 1.0)], vec![n(0, 1, 1.0)]], 1, None).unwrap();
        let index = InteractionIndex::new(&[vec![], vec![]], 1);
        let q1 = vec![1.0, 0.0];
        let solve = FieldSolve::new(
            Strategy::SquaredCross,
            Side::User,
            2,
            users.field(0),
            vec![0.0; 2],
            &q1,
            &index,
            EdgeLoss::new(Loss::Squared, 0.0, 0.0),
            DenseTerm::Absent,
        );
        let (s, iterations) = solve.cg(&[1.0, 0.0, -1.0, 0.0]);
        assert_eq!(iterations, 1);
        assert!(s.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_side_deltas_use_own_row() {
        let (users, index, _) = small_setup();
        let q1 = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let solve = FieldSolve::new(
            Strategy::SquaredSide,
            Side::User,
            2,
            users.field(0),
            vec![0.0; 2],
            &q1,
            &index,
            EdgeLoss::new(Loss::Squared, 0.0, 0.0),
            DenseTerm::Absent,
        );
        let xs = vec![2.0, 3.0, 5.0, 7.0, 1.0, -1.0];
        assert_eq!(solve.row_deltas(&xs), vec![2.0, 7.0, 0.0]);
        // edges 2 and 3 both belong to user 2
        assert_eq!(solve.edge_deltas(&xs), vec![2.0, 7.0, 0.0, 0.0]);
    }
}
