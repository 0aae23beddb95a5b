use std::error::Error;

use crate::field_pairs::{FieldSpace, Side};

/// One nonzero feature of a row, as read from input
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Node {
    pub fid: usize,
    pub idx: usize,
    pub val: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Entry {
    pub idx: usize,
    pub val: f64,
}

/// Entries of a single field, compressed by row
#[derive(Clone, Debug, Default)]
pub struct FieldMatrix {
    row_ptr: Vec<usize>,
    entries: Vec<Entry>,
}

impl FieldMatrix {
    #[inline(always)]
    pub fn row(&self, i: usize) -> &[Entry] {
        &self.entries[self.row_ptr[i]..self.row_ptr[i + 1]]
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }
}

/// Sparse features of one row-group (users or items), split per field.
/// Read-only once built.
#[derive(Clone, Debug)]
pub struct FeatureStore {
    pub m: usize,
    fields: Vec<FieldMatrix>,
    dims: Vec<usize>,
    freq: Vec<Vec<u64>>,
    row_nnz: Vec<usize>,
}

impl FeatureStore {
    /// Builds per-field row structures for `rows`.
    ///
    /// With `dims == None` the cardinality of every field is one past the
    /// largest index seen. With `dims` given (scoring rows against already
    /// trained factors), entries at or beyond the field's cardinality are
    /// dropped and cardinalities are taken as given.
    pub fn new(rows: &[Vec<Node>], nr_fields: usize, dims: Option<&[usize]>) -> Result<FeatureStore, Box<dyn Error>> {
        if let Some(d) = dims {
            if d.len() != nr_fields {
                return Err(format!("Expected {} field cardinalities, got {}", nr_fields, d.len()))?;
            }
        }
        let m = rows.len();
        let mut field_nnz = vec![vec![0usize; m]; nr_fields];
        let mut field_dims = match dims {
            Some(d) => d.to_vec(),
            None => vec![0; nr_fields],
        };
        let keep = |node: &Node| match dims {
            Some(d) => node.idx < d[node.fid],
            None => true,
        };

        for (i, row) in rows.iter().enumerate() {
            for node in row {
                if node.fid >= nr_fields {
                    return Err(format!("Row {} references field {}, but only {} fields are declared", i, node.fid, nr_fields))?;
                }
                if !keep(node) {
                    continue;
                }
                field_nnz[node.fid][i] += 1;
                if dims.is_none() && node.idx + 1 > field_dims[node.fid] {
                    field_dims[node.fid] = node.idx + 1;
                }
            }
        }

        let mut fields: Vec<FieldMatrix> = Vec::with_capacity(nr_fields);
        for nnz in field_nnz.iter() {
            let mut row_ptr = Vec::with_capacity(m + 1);
            row_ptr.push(0);
            let mut start = 0;
            for n in nnz {
                start += n;
                row_ptr.push(start);
            }
            fields.push(FieldMatrix {
                row_ptr,
                entries: Vec::with_capacity(start),
            });
        }

        let mut freq: Vec<Vec<u64>> = field_dims.iter().map(|&d| vec![0; d]).collect();
        let mut row_nnz = vec![0usize; m];
        for (i, row) in rows.iter().enumerate() {
            for node in row.iter().filter(|node| keep(*node)) {
                fields[node.fid].entries.push(Entry {
                    idx: node.idx,
                    val: node.val,
                });
                freq[node.fid][node.idx] += 1;
                row_nnz[i] += 1;
            }
        }

        Ok(FeatureStore {
            m,
            fields,
            dims: field_dims,
            freq,
            row_nnz,
        })
    }

    pub fn nr_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, fi: usize) -> &FieldMatrix {
        &self.fields[fi]
    }

    pub fn dim(&self, fi: usize) -> usize {
        self.dims[fi]
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn freq(&self, fi: usize) -> &[u64] {
        &self.freq[fi]
    }

    /// True if the row kept no feature in any field
    pub fn row_is_empty(&self, i: usize) -> bool {
        self.row_nnz[i] == 0
    }

    pub fn nnz(&self) -> usize {
        self.fields.iter().map(|f| f.nnz()).sum()
    }
}

/// Training features of both sides, addressed by global field id
#[derive(Clone, Debug)]
pub struct Features {
    pub space: FieldSpace,
    user: FeatureStore,
    item: FeatureStore,
}

impl Features {
    pub fn new(user: FeatureStore, item: FeatureStore) -> Features {
        Features {
            space: FieldSpace::new(user.nr_fields(), item.nr_fields()),
            user,
            item,
        }
    }

    pub fn store(&self, side: Side) -> &FeatureStore {
        match side {
            Side::User => &self.user,
            Side::Item => &self.item,
        }
    }

    pub fn rows(&self, side: Side) -> usize {
        self.store(side).m
    }

    #[inline(always)]
    pub fn field(&self, f: usize) -> &FieldMatrix {
        self.store(self.space.side(f)).field(self.space.local(f))
    }

    pub fn dim(&self, f: usize) -> usize {
        self.store(self.space.side(f)).dim(self.space.local(f))
    }

    pub fn freq(&self, f: usize) -> &[u64] {
        self.store(self.space.side(f)).freq(self.space.local(f))
    }

    /// Cardinalities of all fields in global order
    pub fn dims(&self) -> Vec<usize> {
        (0..self.space.nr_fields()).map(|f| self.dim(f)).collect()
    }
}
