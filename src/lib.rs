extern crate blas;
extern crate intel_mkl_src;

pub mod block_helpers;
pub mod blocks;
pub mod cmdline;
pub mod consts;
pub mod evaluator;
pub mod feature_store;
pub mod field_pairs;
pub mod interactions;
pub mod linalg;
pub mod logging_layer;
pub mod loss;
pub mod model_instance;
pub mod multithread_helpers;
pub mod parser;
pub mod persistence;
pub mod problem;
pub mod solver;
pub mod trainer;
