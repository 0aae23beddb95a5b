/// Which row-group an entity belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    User,
    Item,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::User => Side::Item,
            Side::Item => Side::User,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    SelfSide,
    Cross,
}

/// Global field numbering: user fields are `[0, fu)`, item fields `[fu, fu + fv)`.
/// Unordered pairs `(f1 <= f2)` are laid out in a triangular array, row by row.
#[derive(Clone, Debug)]
pub struct FieldSpace {
    pub fu: usize,
    pub fv: usize,
    slots: Vec<usize>,
    pairs: Vec<(usize, usize)>,
}

impl FieldSpace {
    pub fn new(fu: usize, fv: usize) -> FieldSpace {
        let f = fu + fv;
        let mut slots = vec![usize::MAX; f * f];
        let mut pairs = Vec::with_capacity(f * (f + 1) / 2);
        for f1 in 0..f {
            for f2 in f1..f {
                slots[f1 * f + f2] = pairs.len();
                slots[f2 * f + f1] = pairs.len();
                pairs.push((f1, f2));
            }
        }
        FieldSpace { fu, fv, slots, pairs }
    }

    pub fn nr_fields(&self) -> usize {
        self.fu + self.fv
    }

    pub fn nr_blocks(&self) -> usize {
        self.pairs.len()
    }

    /// Slot of the unordered pair, symmetric in its arguments
    #[inline(always)]
    pub fn slot(&self, f1: usize, f2: usize) -> usize {
        self.slots[f1 * self.nr_fields() + f2]
    }

    /// `(f1, f2)` with `f1 <= f2` stored at `slot`
    pub fn pair(&self, slot: usize) -> (usize, usize) {
        self.pairs[slot]
    }

    pub fn side(&self, f: usize) -> Side {
        if f < self.fu {
            Side::User
        } else {
            Side::Item
        }
    }

    /// Field index within its own side
    pub fn local(&self, f: usize) -> usize {
        if f < self.fu {
            f
        } else {
            f - self.fu
        }
    }

    pub fn block_kind(&self, f1: usize, f2: usize) -> BlockKind {
        if self.side(f1) == self.side(f2) {
            BlockKind::SelfSide
        } else {
            BlockKind::Cross
        }
    }

    /// Self-side pairs of one side in increasing `(f1, f2)` order
    pub fn self_pairs(&self, side: Side) -> Vec<(usize, usize)> {
        let range = match side {
            Side::User => 0..self.fu,
            Side::Item => self.fu..self.nr_fields(),
        };
        let mut out = Vec::new();
        for f1 in range.clone() {
            for f2 in f1..range.end {
                out.push((f1, f2));
            }
        }
        out
    }

    /// User field x item field pairs in increasing `(f1, f2)` order
    pub fn cross_pairs(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.fu * self.fv);
        for f1 in 0..self.fu {
            for f2 in self.fu..self.nr_fields() {
                out.push((f1, f2));
            }
        }
        out
    }
}
