use std::error::Error;
use std::time::Instant;

use rand::Rng;
use rayon::prelude::*;

use crate::block_helpers::row;
use crate::blocks::{utx, utx_new, Block, BlockStore};
use crate::evaluator::{Evaluator, Metrics};
use crate::feature_store::{FeatureStore, Features};
use crate::field_pairs::{BlockKind, Side};
use crate::interactions::InteractionIndex;
use crate::linalg;
use crate::loss::{EdgeLoss, Strategy};
use crate::model_instance::{Loss, ModelInstance};
use crate::persistence::ModelHeader;
use crate::solver::{DenseTerm, FieldSolve};

/// Which factor matrix of a block is being solved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Factor {
    W,
    H,
}

pub struct Problem {
    pub mi: ModelInstance,
    pub features: Features,
    pub index: InteractionIndex,
    pub blocks: BlockStore,
    evaluator: Option<Evaluator>,
    edge_loss: EdgeLoss,
}

impl Problem {
    /// Allocates and projects every block, computes the side aggregates and
    /// fills the edge residuals from a full forward pass.
    pub fn init<R: Rng>(
        mi: &ModelInstance,
        user: FeatureStore,
        item: FeatureStore,
        index: InteractionIndex,
        evaluator: Option<Evaluator>,
        rng: &mut R,
    ) -> Result<Problem, Box<dyn Error>> {
        mi.validate()?;
        if user.nr_fields() == 0 || item.nr_fields() == 0 {
            return Err(format!(
                "Both sides need at least one field, got {} user and {} item fields",
                user.nr_fields(),
                item.nr_fields()
            ))?;
        }
        if index.m != user.m || index.n != item.m {
            return Err(format!(
                "Interactions cover {} x {} rows, features cover {} x {}",
                index.m, index.n, user.m, item.m
            ))?;
        }
        let features = Features::new(user, item);
        let mut blocks = BlockStore::new(&features, mi.k, mi.loss, rng);
        if mi.self_side {
            blocks.add_side(&features);
        }
        log::info!(
            "Problem: {} user rows in {} fields, {} item rows in {} fields, {} edges, {} blocks, k = {}",
            features.rows(Side::User),
            features.space.fu,
            features.rows(Side::Item),
            features.space.fv,
            index.nnz(),
            blocks.blocks.len(),
            mi.k
        );
        let mut problem = Problem {
            mi: mi.clone(),
            features,
            index,
            blocks,
            evaluator,
            edge_loss: EdgeLoss::new(mi.loss, mi.omega, mi.r),
        };
        problem.init_y_tilde();
        Ok(problem)
    }

    /// Sets every edge residual to `a[i] + b[j] + cross(i, j) - offset`
    pub fn init_y_tilde(&mut self) {
        let k = self.mi.k;
        let space = &self.features.space;
        let cross: Vec<&Block> = self
            .blocks
            .blocks
            .iter()
            .filter(|block| space.block_kind(block.f1, block.f2) == BlockKind::Cross)
            .collect();
        let a = &self.blocks.a;
        let b = &self.blocks.b;
        let offsets: Vec<f64> = (0..self.index.nnz())
            .map(|e| self.edge_loss.offset(self.index.label(e)))
            .collect();
        self.index.set_residual(|e, i, j| {
            let mut y = a[i] + b[j];
            for block in cross.iter() {
                y += linalg::inner(row(&block.p, i, k), row(&block.q, j, k));
            }
            y - offsets[e]
        });
    }

    /// Regularization weight of every row of field `f`'s factor matrices
    fn reg_weights(&self, f: usize) -> Vec<f64> {
        let lambda = self.mi.lambda;
        if self.mi.freq {
            self.features.freq(f).iter().map(|&c| lambda * c as f64).collect()
        } else {
            vec![lambda; self.features.dim(f)]
        }
    }

    fn dense_term(&self, strategy: Strategy, side: Side, q1: &[f64]) -> DenseTerm {
        let k = self.mi.k;
        let omega = self.mi.omega;
        let r = self.mi.r;
        let a1 = self.blocks.side_bias(side);
        let b1 = self.blocks.side_bias(side.opposite());
        match strategy {
            Strategy::LogisticSide | Strategy::LogisticCross => DenseTerm::Absent,
            Strategy::SquaredSide => {
                let n1 = b1.len() as f64;
                let b_sum: f64 = b1.iter().sum();
                let grad = a1
                    .iter()
                    .zip(self.blocks.side_cache(side).iter())
                    .map(|(a, sa)| omega * (n1 * (a - r) + b_sum + sa))
                    .collect();
                DenseTerm::Side {
                    grad,
                    curvature: omega * n1,
                }
            }
            Strategy::SquaredCross => {
                let space = &self.features.space;
                let m1 = a1.len();
                let n1 = b1.len();
                // T = sum over cross blocks of P (Q^T Q1), oriented to `side`
                let mut grad = vec![0.0; m1 * k];
                let mut contraction = vec![0.0; k * k];
                for block in self.blocks.blocks.iter() {
                    if space.block_kind(block.f1, block.f2) != BlockKind::Cross {
                        continue;
                    }
                    linalg::gram(block.projection(space, side.opposite()), q1, &mut contraction, n1, k);
                    linalg::matmul(block.projection(space, side), &contraction, &mut grad, m1, k, k, 1.0);
                }
                let mut q_sum = vec![0.0; k];
                linalg::gemv_t(q1, &vec![1.0; n1], &mut q_sum, n1, k, 0.0);
                let mut q_bias = vec![0.0; k];
                linalg::gemv_t(q1, b1, &mut q_bias, n1, k, 0.0);
                for (i, gi) in grad.chunks_mut(k).enumerate() {
                    let shift = a1[i] - r;
                    for d in 0..k {
                        gi[d] = omega * (gi[d] + shift * q_sum[d] + q_bias[d]);
                    }
                }
                let mut gram = vec![0.0; k * k];
                linalg::gram(q1, q1, &mut gram, n1, k);
                linalg::scal(omega, &mut gram);
                DenseTerm::Cross { grad, gram }
            }
        }
    }

    /// Everything needed to solve `factor` of the block at `slot`, plus the current factor matrix
    fn field_solve(&self, slot: usize, factor: Factor) -> (FieldSolve<'_>, &[f64]) {
        let space = &self.features.space;
        let block = &self.blocks.blocks[slot];
        let (f, w1, q1): (usize, &[f64], &[f64]) = match factor {
            Factor::W => (block.f1, &block.w[..], &block.q[..]),
            Factor::H => (block.f2, &block.h[..], &block.p[..]),
        };
        let side = space.side(f);
        let strategy = Strategy::new(self.mi.loss, space.block_kind(block.f1, block.f2));
        let solve = FieldSolve::new(
            strategy,
            side,
            self.mi.k,
            self.features.field(f),
            self.reg_weights(f),
            q1,
            &self.index,
            self.edge_loss,
            self.dense_term(strategy, side, q1),
        );
        (solve, w1)
    }

    /// One Newton step on one factor matrix, keeping projections, side
    /// biases and edge residuals in sync with the new parameters.
    pub fn solve_field(&mut self, slot: usize, factor: Factor) {
        let k = self.mi.k;
        let (f1, f2) = self.features.space.pair(slot);
        let f = match factor {
            Factor::W => f1,
            Factor::H => f2,
        };
        let side = self.features.space.side(f);

        let (s, theta, edge_deltas, row_deltas) = {
            let (solve, w1) = self.field_solve(slot, factor);
            let g = solve.gradient(w1);
            let (s, iterations) = solve.cg(&g);
            let xs = utx_new(self.features.field(f), self.features.rows(side), &s, k);
            let edge_deltas = solve.edge_deltas(&xs);
            let theta = if solve.strategy.uses_line_search() {
                solve.line_search(&g, &s, w1, &edge_deltas)
            } else {
                1.0
            };
            let row_deltas = match solve.strategy.block_kind() {
                BlockKind::SelfSide => Some(solve.row_deltas(&xs)),
                BlockKind::Cross => None,
            };
            log::debug!(
                "Block ({}, {}) {:?}: {:?}, {} CG iterations, step {}",
                f1, f2, factor, solve.strategy, iterations, theta
            );
            (s, theta, edge_deltas, row_deltas)
        };
        if theta == 0.0 {
            return;
        }

        let block = &mut self.blocks.blocks[slot];
        let (w1, p1) = match factor {
            Factor::W => (&mut block.w, &mut block.p),
            Factor::H => (&mut block.h, &mut block.q),
        };
        linalg::axpy(theta, &s, w1);
        utx(self.features.field(f), w1, p1, k);
        self.index.add_to_residual(|e, _, _| theta * edge_deltas[e]);
        if let Some(row_deltas) = row_deltas {
            let bias = self.blocks.side_bias_mut(side);
            for (b, d) in bias.iter_mut().zip(row_deltas.iter()) {
                *b += theta * d;
            }
        }
    }

    /// Solves `W` holding `Q` fixed, then `H` holding `P` fixed
    pub fn solve_block(&mut self, f1: usize, f2: usize) {
        let slot = self.features.space.slot(f1, f2);
        self.solve_field(slot, Factor::W);
        self.solve_field(slot, Factor::H);
    }

    /// Self-side blocks of users, then of items, then cross blocks, then the cached aggregates
    pub fn one_epoch(&mut self) {
        let space = &self.features.space;
        let mut order = Vec::with_capacity(space.nr_blocks());
        if self.mi.self_side {
            order.extend(space.self_pairs(Side::User));
            order.extend(space.self_pairs(Side::Item));
        }
        order.extend(space.cross_pairs());
        for (f1, f2) in order {
            self.solve_block(f1, f2);
        }
        self.blocks.cache_sasb(&self.features);
    }

    /// Runs all configured epochs, validating after epoch 1 and then every
    /// `eval_every` epochs when a validation set is present. Returns the
    /// validation results.
    pub fn solve(&mut self) -> Vec<(u32, Metrics)> {
        let mut reports = Vec::new();
        for epoch in 1..=self.mi.nr_pass {
            let now = Instant::now();
            self.one_epoch();
            log::info!("Epoch {} finished in {:.2?}", epoch, now.elapsed());
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("Epoch {} objective {:.6}", epoch, self.func());
            }
            if (epoch - 1) % self.mi.eval_every != 0 {
                continue;
            }
            if let Some(evaluator) = &self.evaluator {
                match evaluator.evaluate(&self.features, &self.blocks, self.mi.self_side) {
                    Some(metrics) => {
                        log::info!("Epoch {} validation: {}", epoch, metrics);
                        reports.push((epoch, metrics));
                    }
                    None => log::warn!("Epoch {}: no validation row has a positive edge, skipping", epoch),
                }
            }
        }
        reports
    }

    /// Prediction for user row `i` and item row `j`, recomputed from the block projections
    pub fn predict(&self, i: usize, j: usize) -> f64 {
        let k = self.mi.k;
        let space = &self.features.space;
        let mut y = 0.0;
        for block in self.blocks.blocks.iter() {
            match (space.side(block.f1), space.side(block.f2)) {
                (Side::User, Side::Item) => y += linalg::inner(row(&block.p, i, k), row(&block.q, j, k)),
                (Side::User, Side::User) if self.mi.self_side => {
                    y += linalg::inner(row(&block.p, i, k), row(&block.q, i, k))
                }
                (Side::Item, Side::Item) if self.mi.self_side => {
                    y += linalg::inner(row(&block.p, j, k), row(&block.q, j, k))
                }
                _ => {}
            }
        }
        y
    }

    fn regularization(&self) -> f64 {
        let k = self.mi.k;
        let space = &self.features.space;
        let mut total = 0.0;
        for block in self.blocks.blocks.iter() {
            if !self.mi.self_side && space.block_kind(block.f1, block.f2) == BlockKind::SelfSide {
                continue;
            }
            for (f, m) in [(block.f1, &block.w), (block.f2, &block.h)].iter() {
                let reg = self.reg_weights(*f);
                for (x, r) in reg.iter().enumerate() {
                    let v = row(m, x, k);
                    total += r * linalg::inner(v, v);
                }
            }
        }
        total
    }

    /// Full objective, recomputed over every user-item pair. Diagnostic only.
    pub fn func(&self) -> f64 {
        let m = self.features.rows(Side::User);
        let n = self.features.rows(Side::Item);
        let edge_loss = self.edge_loss;
        let observed: f64 = (0..self.index.nnz())
            .into_par_iter()
            .map(|e| {
                let (i, j) = self.index.endpoints(e);
                edge_loss.edge_loss(self.predict(i, j), self.index.label(e))
            })
            .sum();
        let reg = 0.5 * self.regularization();
        match self.mi.loss {
            Loss::Squared => {
                let r = self.mi.r;
                let all_pairs: f64 = (0..m)
                    .into_par_iter()
                    .map(|i| (0..n).map(|j| (r - self.predict(i, j)).powi(2)).sum::<f64>())
                    .sum();
                0.5 * self.mi.omega * all_pairs + observed + reg
            }
            Loss::Logistic => observed + reg,
        }
    }

    pub fn header(&self) -> ModelHeader {
        ModelHeader {
            f: self.features.space.nr_fields(),
            fu: self.features.space.fu,
            fv: self.features.space.fv,
            k: self.mi.k,
            dims: self.features.dims(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::Node;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn n(fid: usize, idx: usize, val: f64) -> Node {
        Node { fid, idx, val }
    }

    // 5 users over 2 fields, 4 items over 2 fields, positive and negative edges
    fn toy_problem(loss: Loss, self_side: bool, freq: bool, seed: u64) -> Problem {
        let user = FeatureStore::new(
            &[
                vec![n(0, 0, 1.0), n(1, 0, 0.5)],
                vec![n(0, 1, 1.0), n(1, 2, 1.0)],
                vec![n(0, 2, 1.0), n(1, 0, 1.0), n(1, 1, 0.5)],
                vec![n(0, 0, 0.5)],
                vec![n(1, 1, 1.0)],
            ],
            2,
            None,
        )
        .unwrap();
        let item = FeatureStore::new(
            &[
                vec![n(0, 0, 1.0), n(1, 1, 1.0)],
                vec![n(0, 1, 1.0)],
                vec![n(0, 2, 1.0), n(1, 0, 2.0)],
                vec![n(1, 1, 0.5)],
            ],
            2,
            None,
        )
        .unwrap();
        let index = InteractionIndex::new(
            &[
                vec![(0, 1.0), (2, -1.0)],
                vec![(1, 1.0)],
                vec![(2, 1.0), (3, 1.0), (0, -1.0)],
                vec![(3, -1.0)],
                vec![(1, 1.0), (9, 1.0)],
            ],
            4,
        );
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.loss = loss;
        mi.k = 3;
        mi.lambda = 0.05;
        mi.omega = 0.2;
        mi.r = -0.5;
        mi.self_side = self_side;
        mi.freq = freq;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Problem::init(&mi, user, item, index, None, &mut rng).unwrap()
    }

    fn assert_residuals_consistent(problem: &Problem) {
        for e in 0..problem.index.nnz() {
            let (i, j) = problem.index.endpoints(e);
            let expected = problem.predict(i, j) - problem.edge_loss.offset(problem.index.label(e));
            let got = problem.index.residual()[e];
            assert!(
                (got - expected).abs() <= 1e-9 * expected.abs().max(1.0),
                "edge {}: {} vs {}",
                e,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_residual_tracks_parameters() {
        for &loss in [Loss::Squared, Loss::Logistic].iter() {
            for &self_side in [true, false].iter() {
                let mut problem = toy_problem(loss, self_side, false, 11);
                assert_residuals_consistent(&problem);
                for _ in 0..3 {
                    problem.one_epoch();
                    assert_residuals_consistent(&problem);
                }
            }
        }
    }

    #[test]
    fn test_side_bias_tracks_parameters() {
        let mut problem = toy_problem(Loss::Squared, true, true, 5);
        problem.one_epoch();
        problem.one_epoch();
        let a = problem.blocks.a.clone();
        let b = problem.blocks.b.clone();
        problem.blocks.calc_side(&problem.features);
        for (x, y) in a.iter().zip(problem.blocks.a.iter()).chain(b.iter().zip(problem.blocks.b.iter())) {
            assert!((x - y).abs() < 1e-10);
        }
    }

    #[test]
    fn test_squared_objective_is_monotone() {
        for &freq in [false, true].iter() {
            let mut problem = toy_problem(Loss::Squared, true, freq, 3);
            let mut previous = problem.func();
            for _ in 0..5 {
                problem.one_epoch();
                let current = problem.func();
                assert!(current <= previous + 1e-12 * previous.abs(), "{} after {}", current, previous);
                previous = current;
            }
        }
    }

    #[test]
    fn test_logistic_objective_decreases() {
        let mut problem = toy_problem(Loss::Logistic, true, false, 8);
        let start = problem.func();
        let mut previous = start;
        for _ in 0..4 {
            problem.one_epoch();
            let current = problem.func();
            assert!(current <= previous + 1e-12 * previous.abs());
            previous = current;
        }
        assert!(previous < start);
    }

    #[test]
    fn test_gradients_match_objective() {
        let h = 1e-5;
        for &loss in [Loss::Squared, Loss::Logistic].iter() {
            let mut problem = toy_problem(loss, true, true, 21);
            problem.one_epoch();
            for slot in 0..problem.blocks.blocks.len() {
                for &factor in [Factor::W, Factor::H].iter() {
                    let g = {
                        let (solve, w1) = problem.field_solve(slot, factor);
                        solve.gradient(w1)
                    };
                    let f = match factor {
                        Factor::W => problem.blocks.blocks[slot].f1,
                        Factor::H => problem.blocks.blocks[slot].f2,
                    };
                    for x in 0..g.len() {
                        let mut values = [0.0; 2];
                        for (v, step) in values.iter_mut().zip([h, -h].iter()) {
                            let k = problem.mi.k;
                            let field = problem.features.field(f);
                            let block = &mut problem.blocks.blocks[slot];
                            let (w, p) = match factor {
                                Factor::W => (&mut block.w, &mut block.p),
                                Factor::H => (&mut block.h, &mut block.q),
                            };
                            w[x] += step;
                            utx(field, w, p, k);
                            *v = problem.func();
                            let block = &mut problem.blocks.blocks[slot];
                            let (w, p) = match factor {
                                Factor::W => (&mut block.w, &mut block.p),
                                Factor::H => (&mut block.h, &mut block.q),
                            };
                            w[x] -= step;
                            utx(field, w, p, k);
                        }
                        let fd = (values[0] - values[1]) / (2.0 * h);
                        assert!(
                            (fd - g[x]).abs() <= 1e-6 * g[x].abs().max(1.0),
                            "{:?} slot {} {:?} coordinate {}: {} vs {}",
                            loss,
                            slot,
                            factor,
                            x,
                            fd,
                            g[x]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_without_self_side_biases_stay_zero() {
        let mut problem = toy_problem(Loss::Squared, false, false, 2);
        let untouched = problem.blocks.block(&problem.features, 0, 1).w.clone();
        problem.one_epoch();
        assert!(problem.blocks.a.iter().chain(problem.blocks.b.iter()).all(|&x| x == 0.0));
        assert_eq!(problem.blocks.block(&problem.features, 0, 1).w, untouched);
    }

    #[test]
    fn test_header() {
        let problem = toy_problem(Loss::Squared, true, false, 0);
        let header = problem.header();
        assert_eq!((header.f, header.fu, header.fv, header.k), (4, 2, 2, 3));
        assert_eq!(header.dims, vec![3, 3, 3, 2]);
        assert_eq!(problem.blocks().len(), 10);
    }

    #[test]
    fn test_init_rejects_mismatched_index() {
        let user = FeatureStore::new(&[vec![n(0, 0, 1.0)]], 1, None).unwrap();
        let item = FeatureStore::new(&[vec![n(0, 0, 1.0)]], 1, None).unwrap();
        let index = InteractionIndex::new(&[vec![], vec![]], 1);
        let mi = ModelInstance::new_empty().unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        assert!(Problem::init(&mi, user, item, index, None, &mut rng).is_err());
    }

    #[test]
    fn test_validation_schedule() {
        let rows = [vec![n(0, 0, 1.0)], vec![n(0, 1, 1.0)]];
        let user = FeatureStore::new(&rows, 1, None).unwrap();
        let item = FeatureStore::new(&rows, 1, None).unwrap();
        let labels = [vec![(0, 1.0)], vec![(1, 1.0)]];
        let index = InteractionIndex::new(&labels, 2);
        let valid_users = FeatureStore::new(&rows, 1, Some(user.dims())).unwrap();
        let evaluator = Evaluator::new(valid_users, InteractionIndex::new(&labels, 2), index.column_popularity(), vec![1]);
        let mut mi = ModelInstance::new_empty().unwrap();
        mi.k = 2;
        mi.nr_pass = 11;
        mi.eval_every = 5;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut problem = Problem::init(&mi, user, item, index, Some(evaluator), &mut rng).unwrap();
        let epochs: Vec<u32> = problem.solve().iter().map(|(epoch, _)| *epoch).collect();
        assert_eq!(epochs, vec![1, 6, 11]);
    }
}
