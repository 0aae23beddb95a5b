// Hard cap on conjugate gradient iterations per block solve
pub const CG_MAX_ITER: usize = 20;
// Relative residual tolerance for self-side blocks and for cross blocks under squared loss
pub const CG_EPS_TIGHT: f64 = 1e-4;
// Cross blocks under logistic loss have an expensive Hessian, stop CG earlier
pub const CG_EPS_LOOSE: f64 = 9e-2;
// Curvature at or below this is treated as zero and ends CG
pub const CG_MIN_CURVATURE: f64 = 1e-300;

pub const LINE_SEARCH_BETA: f64 = 0.1;
pub const LINE_SEARCH_MU: f64 = 0.5;
pub const LINE_SEARCH_MAX_STEPS: usize = 20;

// Initial factor entries are drawn from [-c, c] (or [0, c]) where c = INIT_SCALE / sqrt(k)
pub const INIT_SCALE: f64 = 0.1;

// Score written over an already extracted column during top-k extraction
pub const VISITED_SCORE: f64 = f64::MIN;

pub const DEFAULT_TOP_K: [usize; 5] = [5, 10, 20, 40, 80];
