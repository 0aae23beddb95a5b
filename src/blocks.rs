use rand::Rng;
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;

use crate::block_helpers::row;
use crate::consts;
use crate::feature_store::{FieldMatrix, Features};
use crate::field_pairs::{BlockKind, FieldSpace, Side};
use crate::linalg;
use crate::model_instance::Loss;

/// Row projection of a sparse field through a factor matrix: for every row
/// of `c`, `c[i] = sum over entries (idx, val) of field row i of val * a[idx]`.
/// Rows are written independently, so the result does not depend on scheduling.
pub fn utx(field: &FieldMatrix, a: &[f64], c: &mut [f64], k: usize) {
    if k == 0 {
        return;
    }
    c.par_chunks_mut(k).enumerate().for_each(|(i, ci)| {
        ci.iter_mut().for_each(|x| *x = 0.0);
        for entry in field.row(i) {
            let src = row(a, entry.idx, k);
            for (x, s) in ci.iter_mut().zip(src.iter()) {
                *x += entry.val * s;
            }
        }
    });
}

pub fn utx_new(field: &FieldMatrix, rows: usize, a: &[f64], k: usize) -> Vec<f64> {
    let mut c = vec![0.0; rows * k];
    utx(field, a, &mut c, k);
    c
}

/// Factors of one unordered field pair `(f1, f2)`, `f1 <= f2`.
/// `p` and `q` are derived from `w` and `h` and are recomputed after every change.
#[derive(Clone, Debug)]
pub struct Block {
    pub f1: usize,
    pub f2: usize,
    pub w: Vec<f64>,
    pub h: Vec<f64>,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
}

impl Block {
    /// Projection held by the rows of `side`. Self-side blocks answer with `p`.
    pub fn projection(&self, space: &FieldSpace, side: Side) -> &[f64] {
        if space.side(self.f1) == side {
            &self.p
        } else {
            &self.q
        }
    }
}

pub struct BlockStore {
    pub k: usize,
    pub blocks: Vec<Block>,
    // Per-row sums over self-side blocks of p[i] . q[i]
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    // Per-row sums over cross blocks of p[i] . (Q^T 1), and symmetrically for items
    pub sa: Vec<f64>,
    pub sb: Vec<f64>,
}

impl BlockStore {
    /// Allocates every block in slot order and computes its projections.
    /// `a` and `b` start at zero; see `add_side`.
    pub fn new<R: Rng>(features: &Features, k: usize, loss: Loss, rng: &mut R) -> BlockStore {
        let space = &features.space;
        let blocks = (0..space.nr_blocks())
            .map(|slot| {
                let (f1, f2) = space.pair(slot);
                BlockStore::init_pair(features, f1, f2, k, loss, rng)
            })
            .collect();
        let m = features.rows(Side::User);
        let n = features.rows(Side::Item);
        let mut store = BlockStore {
            k,
            blocks,
            a: vec![0.0; m],
            b: vec![0.0; n],
            sa: vec![0.0; m],
            sb: vec![0.0; n],
        };
        store.cache_sasb(features);
        store
    }

    pub fn init_pair<R: Rng>(features: &Features, f1: usize, f2: usize, k: usize, loss: Loss, rng: &mut R) -> Block {
        let c = consts::INIT_SCALE / (k as f64).sqrt();
        let low = match loss {
            Loss::Squared => 0.0,
            Loss::Logistic => -c,
        };
        let between = Uniform::new_inclusive(low, c);
        let w: Vec<f64> = (0..features.dim(f1) * k).map(|_| between.sample(rng)).collect();
        let h: Vec<f64> = (0..features.dim(f2) * k).map(|_| between.sample(rng)).collect();
        let space = &features.space;
        let p = utx_new(features.field(f1), features.rows(space.side(f1)), &w, k);
        let q = utx_new(features.field(f2), features.rows(space.side(f2)), &h, k);
        Block { f1, f2, w, h, p, q }
    }

    pub fn block(&self, features: &Features, f1: usize, f2: usize) -> &Block {
        &self.blocks[features.space.slot(f1, f2)]
    }

    /// The bias vector of `side`
    pub fn side_bias(&self, side: Side) -> &[f64] {
        match side {
            Side::User => &self.a,
            Side::Item => &self.b,
        }
    }

    pub fn side_bias_mut(&mut self, side: Side) -> &mut Vec<f64> {
        match side {
            Side::User => &mut self.a,
            Side::Item => &mut self.b,
        }
    }

    pub fn side_cache(&self, side: Side) -> &[f64] {
        match side {
            Side::User => &self.sa,
            Side::Item => &self.sb,
        }
    }

    /// Adds the per-row inner products of every self-side block to `a` and `b`
    pub fn add_side(&mut self, features: &Features) {
        let space = &features.space;
        for block in self.blocks.iter() {
            if space.block_kind(block.f1, block.f2) != BlockKind::SelfSide {
                continue;
            }
            let k = self.k;
            let target = match space.side(block.f1) {
                Side::User => &mut self.a,
                Side::Item => &mut self.b,
            };
            target.par_iter_mut().enumerate().for_each(|(i, t)| {
                *t += linalg::inner(row(&block.p, i, k), row(&block.q, i, k));
            });
        }
    }

    /// Recomputes `a` and `b` from scratch
    pub fn calc_side(&mut self, features: &Features) {
        self.a.iter_mut().for_each(|x| *x = 0.0);
        self.b.iter_mut().for_each(|x| *x = 0.0);
        self.add_side(features);
    }

    /// Recomputes `sa += P (Q^T 1)` and `sb += Q (P^T 1)` over cross blocks
    pub fn cache_sasb(&mut self, features: &Features) {
        let k = self.k;
        let m = self.a.len();
        let n = self.b.len();
        let ones_m = vec![1.0; m];
        let ones_n = vec![1.0; n];
        let mut sums = vec![0.0; k];
        self.sa.iter_mut().for_each(|x| *x = 0.0);
        self.sb.iter_mut().for_each(|x| *x = 0.0);
        for block in self.blocks.iter() {
            if features.space.block_kind(block.f1, block.f2) != BlockKind::Cross {
                continue;
            }
            linalg::gemv_t(&block.q, &ones_n, &mut sums, n, k, 0.0);
            linalg::gemv(&block.p, &sums, &mut self.sa, m, k, 1.0);
            linalg::gemv_t(&block.p, &ones_m, &mut sums, m, k, 0.0);
            linalg::gemv(&block.q, &sums, &mut self.sb, n, k, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_epsilon;
    use crate::feature_store::{FeatureStore, Node};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn n(fid: usize, idx: usize, val: f64) -> Node {
        Node { fid, idx, val }
    }

    fn sample_features() -> Features {
        let user = FeatureStore::new(
            &[
                vec![n(0, 0, 1.0), n(1, 1, 0.5)],
                vec![n(0, 1, 2.0)],
                vec![n(1, 0, 1.0), n(0, 1, -1.0)],
            ],
            2,
            None,
        )
        .unwrap();
        let item = FeatureStore::new(&[vec![n(0, 0, 1.0)], vec![n(0, 1, 1.0), n(0, 2, 3.0)]], 1, None).unwrap();
        Features::new(user, item)
    }

    #[test]
    fn test_utx() {
        let features = sample_features();
        // field 0 of users, D = 2, k = 2
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let c = utx_new(features.field(0), 3, &a, 2);
        assert_eq!(c, vec![1.0, 2.0, 6.0, 8.0, -3.0, -4.0]);
    }

    #[test]
    fn test_utx_is_repeatable() {
        let features = sample_features();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let store = BlockStore::new(&features, 3, Loss::Logistic, &mut rng);
        for block in store.blocks.iter() {
            let side = features.space.side(block.f1);
            let first = utx_new(features.field(block.f1), features.rows(side), &block.w, 3);
            let second = utx_new(features.field(block.f1), features.rows(side), &block.w, 3);
            assert_eq!(first, block.p);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_init_ranges() {
        let features = sample_features();
        let c = consts::INIT_SCALE / 2.0;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let store = BlockStore::new(&features, 4, Loss::Squared, &mut rng);
        assert_eq!(store.blocks.len(), 6);
        for block in store.blocks.iter() {
            assert_eq!(block.w.len(), features.dim(block.f1) * 4);
            assert_eq!(block.h.len(), features.dim(block.f2) * 4);
            assert!(block.w.iter().chain(block.h.iter()).all(|&x| x >= 0.0 && x <= c));
        }
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let store = BlockStore::new(&features, 4, Loss::Logistic, &mut rng);
        assert!(store.blocks.iter().flat_map(|b| b.w.iter()).any(|&x| x < 0.0));
    }

    #[test]
    fn test_side_and_cached_aggregates() {
        let features = sample_features();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let k = 2;
        let mut store = BlockStore::new(&features, k, Loss::Logistic, &mut rng);
        store.calc_side(&features);
        let space = &features.space;

        for i in 0..3 {
            let mut a = 0.0;
            let mut sa = 0.0;
            for block in store.blocks.iter() {
                match (space.side(block.f1), space.side(block.f2)) {
                    (Side::User, Side::User) => a += linalg::inner(row(&block.p, i, k), row(&block.q, i, k)),
                    (Side::User, Side::Item) => {
                        for j in 0..2 {
                            sa += linalg::inner(row(&block.p, i, k), row(&block.q, j, k));
                        }
                    }
                    _ => {}
                }
            }
            assert_epsilon!(store.a[i], a);
            assert_epsilon!(store.sa[i], sa);
        }
        let item_block = store.block(&features, 2, 2);
        for j in 0..2 {
            assert_epsilon!(store.b[j], linalg::inner(row(&item_block.p, j, k), row(&item_block.q, j, k)));
        }
        let total_sb: f64 = store.sb.iter().sum();
        let total_sa: f64 = store.sa.iter().sum();
        assert_epsilon!(total_sa, total_sb);
    }
}
