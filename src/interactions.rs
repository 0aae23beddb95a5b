use rayon::prelude::*;

use crate::field_pairs::Side;

/// Compressed adjacency of one side: for each row, its partners on the
/// opposite side and the ids of the connecting edges.
#[derive(Clone, Debug)]
pub struct Adjacency {
    ptr: Vec<usize>,
    partner: Vec<usize>,
    edge: Vec<usize>,
}

impl Adjacency {
    pub fn rows(&self) -> usize {
        self.ptr.len() - 1
    }

    #[inline(always)]
    pub fn partners(&self, i: usize) -> &[usize] {
        &self.partner[self.ptr[i]..self.ptr[i + 1]]
    }

    #[inline(always)]
    pub fn edges(&self, i: usize) -> &[usize] {
        &self.edge[self.ptr[i]..self.ptr[i + 1]]
    }

    #[inline(always)]
    pub fn degree(&self, i: usize) -> usize {
        self.ptr[i + 1] - self.ptr[i]
    }
}

/// Observed user-item edges, row-major and column-major, with one residual
/// cell per edge shared by both views.
///
/// Structure is fixed after construction; only residuals change.
#[derive(Clone, Debug)]
pub struct InteractionIndex {
    pub m: usize,
    pub n: usize,
    by_row: Adjacency,
    by_col: Adjacency,
    labels: Vec<f64>,
    endpoints: Vec<(usize, usize)>,
    residual: Vec<f64>,
}

impl InteractionIndex {
    /// `rows[i]` lists `(j, label)` for user row `i`; label > 0 is a positive edge.
    /// Edges with `j >= n` are dropped.
    pub fn new(rows: &[Vec<(usize, f64)>], n: usize) -> InteractionIndex {
        let m = rows.len();
        let mut row_ptr = Vec::with_capacity(m + 1);
        let mut row_partner = Vec::new();
        let mut labels = Vec::new();
        let mut endpoints = Vec::new();
        let mut dropped = 0;
        row_ptr.push(0);
        for (i, row) in rows.iter().enumerate() {
            for &(j, label) in row {
                if j >= n {
                    dropped += 1;
                    continue;
                }
                row_partner.push(j);
                labels.push(if label > 0.0 { 1.0 } else { -1.0 });
                endpoints.push((i, j));
            }
            row_ptr.push(row_partner.len());
        }
        if dropped > 0 {
            log::debug!("Dropped {} edges pointing beyond {} columns", dropped, n);
        }
        let nnz = row_partner.len();

        // Transpose: order by column, then by originating row
        let mut perm: Vec<usize> = (0..nnz).collect();
        perm.sort_by(|&a, &b| (endpoints[a].1, endpoints[a].0).cmp(&(endpoints[b].1, endpoints[b].0)));
        let mut col_ptr = vec![0usize; n + 1];
        for &(_, j) in endpoints.iter() {
            col_ptr[j + 1] += 1;
        }
        for j in 0..n {
            col_ptr[j + 1] += col_ptr[j];
        }
        let col_partner: Vec<usize> = perm.iter().map(|&e| endpoints[e].0).collect();

        InteractionIndex {
            m,
            n,
            by_row: Adjacency {
                ptr: row_ptr,
                partner: row_partner,
                edge: (0..nnz).collect(),
            },
            by_col: Adjacency {
                ptr: col_ptr,
                partner: col_partner,
                edge: perm,
            },
            labels,
            endpoints,
            residual: vec![0.0; nnz],
        }
    }

    pub fn nnz(&self) -> usize {
        self.labels.len()
    }

    /// Adjacency keyed by rows of `side`
    pub fn adjacency(&self, side: Side) -> &Adjacency {
        match side {
            Side::User => &self.by_row,
            Side::Item => &self.by_col,
        }
    }

    #[inline(always)]
    pub fn label(&self, e: usize) -> f64 {
        self.labels[e]
    }

    /// `(user row, item row)` of edge `e`
    #[inline(always)]
    pub fn endpoints(&self, e: usize) -> (usize, usize) {
        self.endpoints[e]
    }

    #[inline(always)]
    pub fn endpoint(&self, e: usize, side: Side) -> usize {
        match side {
            Side::User => self.endpoints[e].0,
            Side::Item => self.endpoints[e].1,
        }
    }

    pub fn residual(&self) -> &[f64] {
        &self.residual
    }

    /// Overwrites every residual with `value(e, i, j)`
    pub fn set_residual<F>(&mut self, value: F)
    where
        F: Fn(usize, usize, usize) -> f64 + Sync,
    {
        let endpoints = &self.endpoints;
        self.residual.par_iter_mut().enumerate().for_each(|(e, r)| {
            let (i, j) = endpoints[e];
            *r = value(e, i, j);
        });
    }

    /// Adds `delta(e, i, j)` to every residual
    pub fn add_to_residual<F>(&mut self, delta: F)
    where
        F: Fn(usize, usize, usize) -> f64 + Sync,
    {
        let endpoints = &self.endpoints;
        self.residual.par_iter_mut().enumerate().for_each(|(e, r)| {
            let (i, j) = endpoints[e];
            *r += delta(e, i, j);
        });
    }

    /// Item rows of the positive edges of user row `i`
    pub fn positives(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.by_row
            .partners(i)
            .iter()
            .zip(self.by_row.edges(i).iter())
            .filter(move |&(_, &e)| self.labels[e] > 0.0)
            .map(|(&j, _)| j)
    }

    pub fn nr_positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y > 0.0).count()
    }

    /// Share of positive edges received by every item row
    pub fn column_popularity(&self) -> Vec<f64> {
        let mut popular = vec![0.0; self.n];
        for (e, &(_, j)) in self.endpoints.iter().enumerate() {
            if self.labels[e] > 0.0 {
                popular[j] += 1.0;
            }
        }
        let total = self.nr_positives();
        if total > 0 {
            for p in popular.iter_mut() {
                *p /= total as f64;
            }
        }
        popular
    }
}
