use std::error::Error;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

// Training runs inside this pool; every parallel loop in the crate picks it up through `install`
pub fn build_thread_pool(nr_threads: usize) -> Result<ThreadPool, Box<dyn Error>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(nr_threads)
        .thread_name(|i| format!("fwffm-worker-{}", i))
        .build()?;
    log::info!("Worker pool with {} threads", pool.current_num_threads());
    Ok(pool)
}

/// Runs `contribute(row, acc)` for every row in `0..rows`, each worker adding into
/// its own zeroed `len`-long buffer. Buffers are summed once all rows are done.
pub fn sum_over_rows<F>(rows: usize, len: usize, contribute: F) -> Vec<f64>
where
    F: Fn(usize, &mut [f64]) + Sync + Send,
{
    (0..rows)
        .into_par_iter()
        .fold(
            || vec![0.0; len],
            |mut acc, i| {
                contribute(i, &mut acc);
                acc
            },
        )
        .reduce(
            || vec![0.0; len],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        )
}
