use std::fmt;

use rayon::prelude::*;

use crate::block_helpers::row;
use crate::blocks::{utx_new, BlockStore};
use crate::consts;
use crate::feature_store::{FeatureStore, Features};
use crate::field_pairs::{BlockKind, Side};
use crate::interactions::InteractionIndex;
use crate::linalg;

/// Held-out user rows scored against trained factors
pub struct Evaluator {
    users: FeatureStore,
    index: InteractionIndex,
    popularity: Vec<f64>,
    top_k: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct Metrics {
    pub rows: usize,
    pub rmse: f64,
    pub top_k: Vec<usize>,
    pub precision: Vec<f64>,
    pub ndcg: Vec<f64>,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rows {} rmse {:.5}", self.rows, self.rmse)?;
        for (k, p) in self.top_k.iter().zip(self.precision.iter()) {
            write!(f, " p@{} {:.5}", k, p)?;
        }
        for (k, n) in self.top_k.iter().zip(self.ndcg.iter()) {
            write!(f, " ndcg@{} {:.5}", k, n)?;
        }
        Ok(())
    }
}

/// Validation projections rebuilt from the current factors
pub struct Projections<'a> {
    k: usize,
    // (user-side projection of validation rows, trained item projection) per cross block
    cross: Vec<(Vec<f64>, &'a [f64])>,
    item_bias: &'a [f64],
    user_bias: Vec<f64>,
}

// Per-worker running sums
struct Tally {
    rows: usize,
    squared_error: f64,
    positives: usize,
    precision: Vec<f64>,
    ndcg: Vec<f64>,
}

impl Tally {
    fn new(cutoffs: usize) -> Tally {
        Tally {
            rows: 0,
            squared_error: 0.0,
            positives: 0,
            precision: vec![0.0; cutoffs],
            ndcg: vec![0.0; cutoffs],
        }
    }

    fn merge(mut self, other: Tally) -> Tally {
        self.rows += other.rows;
        self.squared_error += other.squared_error;
        self.positives += other.positives;
        for (a, b) in self.precision.iter_mut().zip(other.precision.iter()) {
            *a += b;
        }
        for (a, b) in self.ndcg.iter_mut().zip(other.ndcg.iter()) {
            *a += b;
        }
        self
    }
}

fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}

/// Precision and nDCG of `scores` against `positives` (sorted) at every cutoff.
/// Extraction is destructive: picked columns are overwritten with a sentinel.
pub fn rank_metrics(scores: &mut [f64], positives: &[usize], top_k: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let max_k = top_k.iter().copied().max().unwrap_or(0).min(scores.len());
    let mut hits_at = Vec::with_capacity(max_k + 1);
    let mut dcg_at = Vec::with_capacity(max_k + 1);
    hits_at.push(0usize);
    dcg_at.push(0.0);
    for rank in 0..max_k {
        let mut best = 0;
        for j in 1..scores.len() {
            if scores[j] > scores[best] {
                best = j;
            }
        }
        scores[best] = consts::VISITED_SCORE;
        let hit = positives.binary_search(&best).is_ok();
        hits_at.push(hits_at[rank] + hit as usize);
        dcg_at.push(dcg_at[rank] + if hit { discount(rank) } else { 0.0 });
    }

    let mut precision = Vec::with_capacity(top_k.len());
    let mut ndcg = Vec::with_capacity(top_k.len());
    for &k in top_k {
        let reached = k.min(max_k);
        precision.push(hits_at[reached] as f64 / k as f64);
        let ideal: f64 = (0..k.min(positives.len())).map(discount).sum();
        ndcg.push(if ideal > 0.0 { dcg_at[reached] / ideal } else { 0.0 });
    }
    (precision, ndcg)
}

impl Evaluator {
    /// `users` must be built with the training cardinalities so that no
    /// feature points past a trained factor row. `popularity` is the share of
    /// training positives per item.
    pub fn new(users: FeatureStore, index: InteractionIndex, popularity: Vec<f64>, top_k: Vec<usize>) -> Evaluator {
        Evaluator {
            users,
            index,
            popularity,
            top_k,
        }
    }

    pub fn project<'a>(&self, features: &Features, blocks: &'a BlockStore, self_side: bool) -> Projections<'a> {
        let k = blocks.k;
        let space = &features.space;
        let m = self.users.m;
        let mut cross = Vec::new();
        let mut user_bias = vec![0.0; m];
        for block in blocks.blocks.iter() {
            match space.block_kind(block.f1, block.f2) {
                BlockKind::Cross => {
                    let p = utx_new(self.users.field(block.f1), m, &block.w, k);
                    cross.push((p, &block.q[..]));
                }
                BlockKind::SelfSide if self_side && space.side(block.f1) == Side::User => {
                    let p = utx_new(self.users.field(block.f1), m, &block.w, k);
                    let q = utx_new(self.users.field(block.f2), m, &block.h, k);
                    for (i, a) in user_bias.iter_mut().enumerate() {
                        *a += linalg::inner(row(&p, i, k), row(&q, i, k));
                    }
                }
                _ => {}
            }
        }
        Projections {
            k,
            cross,
            item_bias: &blocks.b,
            user_bias,
        }
    }

    /// Item part of the model prediction for validation row `i`, `b[j] + cross(i, j)`
    pub fn predictions(&self, projections: &Projections, i: usize) -> Vec<f64> {
        let k = projections.k;
        let n = projections.item_bias.len();
        let mut z = projections.item_bias.to_vec();
        for (p, q) in projections.cross.iter() {
            linalg::gemv(q, row(p, i, k), &mut z, n, k, 1.0);
        }
        z
    }

    /// Ranking scores of validation row `i` over all items. Rows without any
    /// feature fall back to item popularity.
    pub fn scores(&self, projections: &Projections, i: usize) -> Vec<f64> {
        if self.users.row_is_empty(i) {
            return self.popularity.clone();
        }
        self.predictions(projections, i)
    }

    /// None when no validation row has a positive edge
    pub fn evaluate(&self, features: &Features, blocks: &BlockStore, self_side: bool) -> Option<Metrics> {
        let projections = self.project(features, blocks, self_side);
        let cutoffs = self.top_k.len();
        let tally = (0..self.users.m)
            .into_par_iter()
            .fold(
                || Tally::new(cutoffs),
                |mut tally, i| {
                    let mut positives: Vec<usize> = self.index.positives(i).collect();
                    if positives.is_empty() {
                        return tally;
                    }
                    positives.sort_unstable();
                    positives.dedup();
                    let predictions = self.predictions(&projections, i);
                    let at = projections.user_bias[i];
                    for &j in positives.iter() {
                        tally.squared_error += (1.0 - (at + predictions[j])).powi(2);
                    }
                    tally.positives += positives.len();
                    let mut scores = if self.users.row_is_empty(i) {
                        self.popularity.clone()
                    } else {
                        predictions
                    };
                    let (precision, ndcg) = rank_metrics(&mut scores, &positives, &self.top_k);
                    for (a, b) in tally.precision.iter_mut().zip(precision.iter()) {
                        *a += b;
                    }
                    for (a, b) in tally.ndcg.iter_mut().zip(ndcg.iter()) {
                        *a += b;
                    }
                    tally.rows += 1;
                    tally
                },
            )
            .reduce(|| Tally::new(cutoffs), Tally::merge);

        if tally.rows == 0 {
            return None;
        }
        let rows = tally.rows as f64;
        Some(Metrics {
            rows: tally.rows,
            rmse: (tally.squared_error / tally.positives as f64).sqrt(),
            top_k: self.top_k.clone(),
            precision: tally.precision.iter().map(|x| x / rows).collect(),
            ndcg: tally.ndcg.iter().map(|x| x / rows).collect(),
        })
    }
}
