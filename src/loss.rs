use crate::consts;
use crate::field_pairs::BlockKind;
use crate::model_instance::Loss;

#[inline(always)]
pub fn sigmoid(t: f64) -> f64 {
    if t >= 0.0 {
        1.0 / (1.0 + (-t).exp())
    } else {
        let e = t.exp();
        e / (1.0 + e)
    }
}

/// log(1 + exp(-t)) without overflow
#[inline(always)]
pub fn log1p_exp_neg(t: f64) -> f64 {
    if t >= 0.0 {
        (-t).exp().ln_1p()
    } else {
        -t + t.exp().ln_1p()
    }
}

/// How a field solve treats its block: which loss, and whether the two
/// fields live on the same side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    SquaredSide,
    SquaredCross,
    LogisticSide,
    LogisticCross,
}

impl Strategy {
    pub fn new(loss: Loss, kind: BlockKind) -> Strategy {
        match (loss, kind) {
            (Loss::Squared, BlockKind::SelfSide) => Strategy::SquaredSide,
            (Loss::Squared, BlockKind::Cross) => Strategy::SquaredCross,
            (Loss::Logistic, BlockKind::SelfSide) => Strategy::LogisticSide,
            (Loss::Logistic, BlockKind::Cross) => Strategy::LogisticCross,
        }
    }

    pub fn loss(self) -> Loss {
        match self {
            Strategy::SquaredSide | Strategy::SquaredCross => Loss::Squared,
            Strategy::LogisticSide | Strategy::LogisticCross => Loss::Logistic,
        }
    }

    pub fn block_kind(self) -> BlockKind {
        match self {
            Strategy::SquaredSide | Strategy::LogisticSide => BlockKind::SelfSide,
            Strategy::SquaredCross | Strategy::LogisticCross => BlockKind::Cross,
        }
    }

    pub fn cg_eps(self) -> f64 {
        match self {
            Strategy::LogisticCross => consts::CG_EPS_LOOSE,
            _ => consts::CG_EPS_TIGHT,
        }
    }

    // Squared loss is quadratic in one factor matrix, so the Newton step is exact
    pub fn uses_line_search(self) -> bool {
        self.loss() == Loss::Logistic
    }
}

/// Per-edge loss terms. Residuals hold `prediction - offset(label)`.
#[derive(Clone, Copy, Debug)]
pub struct EdgeLoss {
    pub loss: Loss,
    pub omega: f64,
    pub r: f64,
}

impl EdgeLoss {
    pub fn new(loss: Loss, omega: f64, r: f64) -> EdgeLoss {
        EdgeLoss { loss, omega, r }
    }

    /// Regression target of an observed edge with label `y`
    #[inline(always)]
    pub fn target(&self, y: f64) -> f64 {
        if y > 0.0 {
            1.0
        } else {
            self.r
        }
    }

    #[inline(always)]
    pub fn offset(&self, y: f64) -> f64 {
        match self.loss {
            Loss::Squared => self.target(y),
            Loss::Logistic => 0.0,
        }
    }

    /// First derivative of the observed-edge term with respect to the prediction
    #[inline(always)]
    pub fn gradient_coef(&self, residual: f64, y: f64) -> f64 {
        match self.loss {
            Loss::Squared => (1.0 - self.omega) * residual - self.omega * (self.target(y) - self.r),
            Loss::Logistic => (sigmoid(y * residual) - 1.0) * y,
        }
    }

    #[inline(always)]
    pub fn curvature(&self, residual: f64, y: f64) -> f64 {
        match self.loss {
            Loss::Squared => 1.0 - self.omega,
            Loss::Logistic => {
                let p = sigmoid(y * residual);
                p * (1.0 - p)
            }
        }
    }

    /// Observed-edge loss at `prediction`. For squared loss the unobserved-pair
    /// weight `omega` already counted for this pair is taken back out.
    pub fn edge_loss(&self, prediction: f64, y: f64) -> f64 {
        match self.loss {
            Loss::Squared => {
                let t = self.target(y);
                0.5 * ((t - prediction).powi(2) - self.omega * (self.r - prediction).powi(2))
            }
            Loss::Logistic => log1p_exp_neg(y * prediction),
        }
    }
}
